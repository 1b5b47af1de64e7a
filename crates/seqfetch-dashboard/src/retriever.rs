use crate::dashboard::Dashboard;
use crate::error::DashboardResult;
use crate::forecast::{Forecast, ReplyEvent, ReplyKind, RetrieverId, Serial};
use crate::reply::ReplyUpdater;

/// A running unit of work that produces replies for some serial numbers of
/// a packet from one backend or strategy.
///
/// `run` may block on I/O. It reports through the [`ReplySink`] it is
/// given; returning `Err` records the message against every serial number
/// the retriever still forecast something for and asks its factory for a
/// replacement.
pub trait Retriever<R>: Send {
    /// Whether this retriever could plausibly answer `serial`. Called once
    /// at registration.
    fn covers(&self, serial: Serial) -> bool {
        let _ = serial;
        true
    }

    fn run(&mut self, sink: &ReplySink<'_, R>) -> Result<(), String>;
}

/// Creates retrievers, first for a packet and then as replacements for
/// failed instances.
pub trait RetrieverFactory<R>: Send + Sync {
    fn name(&self) -> &str;

    /// Create an instance for the serial numbers that are still open.
    /// `attempt` counts from 1. `None` means the factory has nothing to
    /// offer.
    ///
    /// Called with the dashboard's bookkeeping locked; must not call back
    /// into the dashboard.
    fn create(&self, serials: &[Serial], attempt: u32) -> Option<Box<dyn Retriever<R>>>;
}

/// A retriever's handle on the dashboard, stamped with its id.
pub struct ReplySink<'a, R> {
    dashboard: &'a Dashboard<R>,
    retriever: RetrieverId,
}

impl<'a, R: Send + Sync + 'static> ReplySink<'a, R> {
    pub fn new(dashboard: &'a Dashboard<R>, retriever: RetrieverId) -> Self {
        Self {
            dashboard,
            retriever,
        }
    }

    pub fn id(&self) -> RetrieverId {
        self.retriever
    }

    /// Hand over a reply. Returns `false` if it was ignored.
    pub fn reply(&self, updater: ReplyUpdater<R>) -> DashboardResult<bool> {
        self.dashboard.accept_reply_updater(self.retriever, updater)
    }

    /// Narrow the forecast for `serial` to `forecast`.
    pub fn forecast(&self, serial: Serial, forecast: Forecast) -> DashboardResult<()> {
        self.dashboard
            .accept_status_forecast(ReplyEvent::new(self.retriever, serial, forecast))
    }

    /// Drop `bits` from the forecast for `serial`.
    pub fn withdraw(&self, serial: Serial, bits: Forecast) -> DashboardResult<()> {
        self.dashboard
            .withdraw_forecast(self.retriever, serial, bits)
    }

    pub fn is_still_needed(&self, serial: Serial) -> bool {
        self.dashboard.is_still_needed(self.retriever, serial)
    }

    pub fn is_still_plausible(&self, serial: Serial, kind: ReplyKind) -> bool {
        self.dashboard
            .is_still_plausible(self.retriever, serial, kind)
    }

    /// Serial numbers this retriever may still contribute to.
    pub fn needed_serials(&self) -> Vec<Serial> {
        self.dashboard.needed_by(self.retriever)
    }
}
