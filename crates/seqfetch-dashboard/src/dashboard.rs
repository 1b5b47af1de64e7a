use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::{
    Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DashboardConfig;
use crate::error::{DashboardError, DashboardResult};
use crate::forecast::{
    FactoryId, Forecast, MajorEvents, ReplyEvent, ReplyKind, RetrieverId, Serial, TimeoutKind,
};
use crate::reply::{Reply, ReplyUpdater};
use crate::retriever::{Retriever, RetrieverFactory};

/// Delivery state of one serial number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// A baseline or error is still undecided, or a supplementary reply is
    /// still possible.
    Incomplete,
    /// Complete, but a lower serial number is not yet queued.
    Queueable,
    /// Ready for [`Dashboard::get_available_replies`].
    Queued,
    /// Handed to the caller. Terminal.
    Sent,
}

/// Whether a factory can still supply retrievers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactoryProgress {
    Unready,
    Ready,
    Exhausted,
}

/// Public view of a factory record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FactoryStatus {
    pub progress: FactoryProgress,
    pub tries_available: u32,
    pub tries_used: u32,
    pub first_retriever: Option<RetrieverId>,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

struct RequestRecord<R> {
    state: RequestState,
    /// Union of every retriever's forecast for this serial number.
    combined: Forecast,
    main: Option<ReplyUpdater<R>>,
    supplementary: Vec<ReplyUpdater<R>>,
    synonym_seen: bool,
    /// Retriever failures recorded against this serial number.
    errors: Vec<String>,
    synthesized: bool,
    retrievers_seen: u32,
}

impl<R> RequestRecord<R> {
    fn new() -> Self {
        Self {
            state: RequestState::Incomplete,
            combined: Forecast::NONE,
            main: None,
            supplementary: Vec::new(),
            synonym_seen: false,
            errors: Vec::new(),
            synthesized: false,
            retrievers_seen: 0,
        }
    }

    fn main_rank(&self) -> Option<u8> {
        self.main.as_ref().and_then(|m| m.kind.main_rank())
    }

    /// Attach a reply. A main reply only displaces one of lower rank.
    fn accept(&mut self, updater: ReplyUpdater<R>) -> bool {
        let Some(rank) = updater.kind.main_rank() else {
            self.synonym_seen |= updater.kind == ReplyKind::SynonymUpdate;
            self.supplementary.push(updater);
            return true;
        };
        if self.main_rank().is_some_and(|current| current >= rank) {
            return false;
        }
        if let Some(old) = &self.main {
            debug!(serial = updater.serial, old = ?old.kind, new = ?updater.kind, "main reply replaced");
        }
        self.main = Some(updater);
        true
    }

    fn synthesize(&mut self, serial: Serial, reason: &str) {
        let message = if self.errors.is_empty() {
            reason.to_string()
        } else {
            self.errors.join("; ")
        };
        self.main = Some(ReplyUpdater::error(serial, message));
        self.synthesized = true;
    }
}

struct RetrieverRecord<R> {
    /// Present until the retriever is started or retired.
    retriever: Option<Mutex<Box<dyn Retriever<R>>>>,
    forecasts: BTreeMap<Serial, Forecast>,
    factory: Option<FactoryId>,
    done: bool,
    cancelled: bool,
}

impl<R> RetrieverRecord<R> {
    fn is_live(&self) -> bool {
        !self.done && !self.cancelled
    }

    fn forecast(&self, serial: Serial) -> Forecast {
        self.forecasts.get(&serial).copied().unwrap_or_default()
    }

    fn set_forecast(&mut self, serial: Serial, forecast: Forecast) {
        if forecast.is_empty() {
            self.forecasts.remove(&serial);
        } else {
            self.forecasts.insert(serial, forecast);
        }
    }
}

struct FactoryRecord<R> {
    factory: Arc<dyn RetrieverFactory<R>>,
    progress: FactoryProgress,
    tries_available: u32,
    tries_used: u32,
    first_retriever: Option<RetrieverId>,
}

struct State<R> {
    requests: BTreeMap<Serial, RequestRecord<R>>,
    retrievers: BTreeMap<RetrieverId, RetrieverRecord<R>>,
    factories: Vec<FactoryRecord<R>>,
    ready: VecDeque<RetrieverId>,
    next_retriever: u32,
}

impl<R> State<R> {
    fn open_serials(&self) -> Vec<Serial> {
        self.requests
            .iter()
            .filter(|(_, r)| r.state == RequestState::Incomplete)
            .map(|(&s, _)| s)
            .collect()
    }

    fn combined(&self, serial: Serial) -> Forecast {
        self.retrievers
            .values()
            .fold(Forecast::NONE, |acc, r| acc | r.forecast(serial))
    }

    fn register(&mut self, retriever: Box<dyn Retriever<R>>, factory: Option<FactoryId>) -> RetrieverId {
        let id = RetrieverId(self.next_retriever);
        self.next_retriever += 1;

        let mut forecasts = BTreeMap::new();
        for (&serial, request) in self.requests.iter_mut() {
            if request.state == RequestState::Incomplete && retriever.covers(serial) {
                forecasts.insert(serial, Forecast::ALL);
                request.retrievers_seen += 1;
                request.combined = Forecast::ALL;
            }
        }
        debug!(%id, serials = forecasts.len(), "retriever registered");
        self.retrievers.insert(
            id,
            RetrieverRecord {
                retriever: Some(Mutex::new(retriever)),
                forecasts,
                factory,
                done: false,
                cancelled: false,
            },
        );
        self.ready.push_back(id);
        id
    }

    /// Drop a retriever's handle and forecasts; returns the serial numbers
    /// it still forecast something for.
    fn retire(&mut self, id: RetrieverId) -> Vec<Serial> {
        self.ready.retain(|r| *r != id);
        match self.retrievers.get_mut(&id) {
            Some(record) => {
                record.retriever = None;
                mem::take(&mut record.forecasts).into_keys().collect()
            }
            None => Vec::new(),
        }
    }

    fn next_from_factory(&mut self, factory: FactoryId) -> Option<RetrieverId> {
        let serials = self.open_serials();
        let record = self.factories.get_mut(factory.0 as usize)?;
        if record.progress == FactoryProgress::Exhausted {
            return None;
        }
        if record.tries_used >= record.tries_available || serials.is_empty() {
            record.progress = FactoryProgress::Exhausted;
            info!(%factory, tries = record.tries_used, "factory exhausted");
            return None;
        }
        record.tries_used += 1;
        let attempt = record.tries_used;
        let maker = Arc::clone(&record.factory);

        let created = maker.create(&serials, attempt);
        let id = created.map(|retriever| self.register(retriever, Some(factory)));
        if let Some(record) = self.factories.get_mut(factory.0 as usize) {
            match id {
                Some(id) => {
                    record.progress = FactoryProgress::Ready;
                    record.first_retriever.get_or_insert(id);
                }
                None => {
                    record.progress = FactoryProgress::Exhausted;
                    info!(%factory, attempt, "factory declined to create a retriever");
                }
            }
        }
        id
    }

    /// Recompute the combined forecast of `serial` and decide whether it
    /// is complete.
    ///
    /// A request becomes queueable when no supplementary or synonym reply
    /// is possible any more and one of these holds: a strong baseline arrived; a weak
    /// baseline arrived and no strong one is possible; an error arrived and
    /// no baseline is possible. When nothing at all is possible any more
    /// an error reply is synthesized.
    fn refresh(&mut self, serial: Serial) {
        let combined = self.combined(serial);
        let Some(request) = self.requests.get_mut(&serial) else {
            return;
        };
        request.combined = combined;
        if request.state != RequestState::Incomplete
            || combined.intersects(Forecast::SUPPLEMENTARY | Forecast::SYNONYM_UPDATE)
        {
            return;
        }

        let settled = match request.main.as_ref().map(|m| m.kind) {
            Some(ReplyKind::StrongBaseline) => true,
            Some(ReplyKind::WeakBaseline) => !combined.contains(Forecast::STRONG_BASELINE),
            Some(_) => !combined.intersects(Forecast::BASELINE),
            None => {
                let possible = combined.intersects(Forecast::BASELINE | Forecast::ERROR);
                if request.retrievers_seen > 0 && !possible {
                    request.synthesize(serial, "no retriever produced a reply");
                    debug!(serial, "error reply synthesized");
                    true
                } else {
                    false
                }
            }
        };
        if settled {
            request.state = RequestState::Queueable;
            debug!(serial, "request complete");
        }
    }

    fn refresh_each(&mut self, serials: impl IntoIterator<Item = Serial>) {
        for serial in serials {
            self.refresh(serial);
        }
    }

    /// Queue complete requests in ascending order, stopping at the first
    /// incomplete one.
    fn advance_queue(&mut self) -> usize {
        let mut queued = 0;
        for (&serial, request) in self.requests.iter_mut() {
            match request.state {
                RequestState::Queued | RequestState::Sent => {}
                RequestState::Queueable => {
                    request.state = RequestState::Queued;
                    queued += 1;
                    debug!(serial, "reply queued");
                }
                RequestState::Incomplete => break,
            }
        }
        queued
    }

    /// Settle every open request: keep what arrived, synthesize errors
    /// where no baseline did, and clear every outstanding forecast for them.
    fn expire(&mut self, reason: &str) -> usize {
        let open = self.open_serials();
        for record in self.retrievers.values_mut() {
            record.forecasts.retain(|serial, _| !open.contains(serial));
        }
        let mut synthesized = 0;
        for serial in open {
            if let Some(request) = self.requests.get_mut(&serial) {
                if request.main.is_none() {
                    request.synthesize(serial, reason);
                    synthesized += 1;
                }
                request.combined = Forecast::NONE;
                request.state = RequestState::Queueable;
            }
        }
        self.advance_queue();
        synthesized
    }

    fn events(&self) -> MajorEvents {
        let mut events = MajorEvents::NONE;
        if !self.ready.is_empty() {
            events |= MajorEvents::RETRIEVER_READY;
        }
        let queued = self
            .requests
            .values()
            .any(|r| r.state == RequestState::Queued);
        if queued {
            events |= MajorEvents::REPLY_AVAILABLE;
        }
        let all_sent = self
            .requests
            .values()
            .all(|r| r.state == RequestState::Sent);
        let live = self.retrievers.values().any(RetrieverRecord::is_live);
        if all_sent || (!live && !queued) {
            events |= MajorEvents::NO_MORE_REPLIES;
        }
        events
    }
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

/// Coordinates several retrievers working on the same packet of requests.
///
/// Each retriever announces, per serial number, the reply classes it might
/// still produce (its [`Forecast`]). Replies and forecast updates are
/// merged into one record per serial number, and complete records are
/// released to the caller strictly in ascending serial-number order.
///
/// All bookkeeping sits behind one reader/writer lock: inspections take it
/// shared, every mutation takes it exclusively. Waiters are woken through a
/// separate condition variable after each mutation.
pub struct Dashboard<R> {
    config: DashboardConfig,
    state: RwLock<State<R>>,
    generation: Mutex<u64>,
    changed: Condvar,
}

impl<R: Send + Sync + 'static> Dashboard<R> {
    /// Create a dashboard for a packet of serial numbers.
    pub fn new(serials: impl IntoIterator<Item = Serial>, config: DashboardConfig) -> Self {
        let requests: BTreeMap<Serial, RequestRecord<R>> = serials
            .into_iter()
            .map(|s| (s, RequestRecord::new()))
            .collect();
        debug!(requests = requests.len(), "dashboard created");
        Self {
            config,
            state: RwLock::new(State {
                requests,
                retrievers: BTreeMap::new(),
                factories: Vec::new(),
                ready: VecDeque::new(),
                next_retriever: 0,
            }),
            generation: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, State<R>> {
        self.state.read().expect("dashboard lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<R>> {
        self.state.write().expect("dashboard lock poisoned")
    }

    fn notify(&self) {
        *self.generation.lock().expect("dashboard event lock poisoned") += 1;
        self.changed.notify_all();
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Add a factory with the configured retry budget and ask it for its
    /// first retriever.
    pub fn add_factory(&self, factory: Arc<dyn RetrieverFactory<R>>) -> FactoryId {
        self.add_factory_with_tries(factory, self.config.default_tries)
    }

    pub fn add_factory_with_tries(
        &self,
        factory: Arc<dyn RetrieverFactory<R>>,
        tries: u32,
    ) -> FactoryId {
        let mut state = self.write();
        let id = FactoryId(state.factories.len() as u32);
        info!(%id, factory = factory.name(), tries, "factory added");
        state.factories.push(FactoryRecord {
            factory,
            progress: FactoryProgress::Unready,
            tries_available: tries.max(1),
            tries_used: 0,
            first_retriever: None,
        });
        state.next_from_factory(id);
        drop(state);
        self.notify();
        id
    }

    /// Register a retriever that has no factory. It starts with an
    /// "anything is possible" forecast for every open serial number it
    /// covers.
    pub fn register_retriever(&self, retriever: Box<dyn Retriever<R>>) -> RetrieverId {
        let id = self.write().register(retriever, None);
        self.notify();
        id
    }

    /// Hand out every registered retriever that has not been started yet.
    pub fn take_ready_retrievers(&self) -> Vec<(RetrieverId, Box<dyn Retriever<R>>)> {
        let mut guard = self.write();
        let state = &mut *guard;
        let mut ready = Vec::new();
        while let Some(id) = state.ready.pop_front() {
            let Some(record) = state.retrievers.get_mut(&id) else {
                continue;
            };
            if !record.is_live() {
                continue;
            }
            if let Some(slot) = record.retriever.take() {
                ready.push((id, slot.into_inner().unwrap_or_else(PoisonError::into_inner)));
            }
        }
        ready
    }

    // -----------------------------------------------------------------------
    // Replies and forecasts
    // -----------------------------------------------------------------------

    /// Attach a reply from `retriever`.
    ///
    /// The forecast bits the reply's class resolves are cleared for this
    /// retriever and serial number whether or not the reply is used.
    /// Returns `false` if the reply was ignored: the retriever is done or
    /// cancelled, it had already resolved that class, the request is no
    /// longer open, or a main reply of equal or higher rank is present.
    pub fn accept_reply_updater(
        &self,
        retriever: RetrieverId,
        mut updater: ReplyUpdater<R>,
    ) -> DashboardResult<bool> {
        let serial = updater.serial;
        let mut guard = self.write();
        let state = &mut *guard;
        let request = state
            .requests
            .get_mut(&serial)
            .ok_or(DashboardError::UnknownSerial(serial))?;
        let record = state
            .retrievers
            .get_mut(&retriever)
            .ok_or(DashboardError::UnknownRetriever(retriever))?;
        if !record.is_live() {
            debug!(%retriever, serial, "reply from retired retriever ignored");
            return Ok(false);
        }
        // A reply must be of a kind the retriever still forecasts; accepting
        // it settles every class that kind resolves.
        let forecast = record.forecast(serial);
        if !forecast.intersects(updater.kind.bit()) {
            debug!(%retriever, serial, kind = ?updater.kind, "reply kind not forecast");
            return Ok(false);
        }
        record.set_forecast(serial, forecast.difference(updater.kind.resolves()));

        updater.retriever = Some(retriever);
        let accepted = request.state == RequestState::Incomplete && request.accept(updater);
        state.refresh(serial);
        state.advance_queue();
        drop(guard);
        self.notify();
        Ok(accepted)
    }

    fn narrow(
        &self,
        retriever: RetrieverId,
        serial: Serial,
        requested: impl FnOnce(Forecast) -> Forecast,
    ) -> DashboardResult<(Forecast, Forecast)> {
        let mut guard = self.write();
        let state = &mut *guard;
        if !state.requests.contains_key(&serial) {
            return Err(DashboardError::UnknownSerial(serial));
        }
        let record = state
            .retrievers
            .get_mut(&retriever)
            .ok_or(DashboardError::UnknownRetriever(retriever))?;
        let current = record.forecast(serial);
        let requested = requested(current);
        if !record.is_live() {
            return Ok((current, current));
        }
        record.set_forecast(serial, current & requested);
        state.refresh(serial);
        state.advance_queue();
        drop(guard);
        self.notify();
        Ok((current, requested))
    }

    /// Replace a retriever's forecast for one serial number.
    ///
    /// The new forecast must be a subset of the current one. A widening
    /// request is rejected with [`DashboardError::ForecastWidened`]; the
    /// stored forecast is still narrowed to the intersection of the two.
    pub fn accept_status_forecast(&self, event: ReplyEvent) -> DashboardResult<()> {
        let (current, requested) = self.narrow(event.retriever, event.serial, |_| event.forecast)?;
        if !current.contains(requested) {
            warn!(
                retriever = %event.retriever,
                serial = event.serial,
                %current,
                %requested,
                "retriever tried to widen its forecast"
            );
            return Err(DashboardError::ForecastWidened {
                retriever: event.retriever,
                serial: event.serial,
                current,
                requested,
            });
        }
        Ok(())
    }

    /// Remove `bits` from a retriever's forecast for one serial number.
    pub fn withdraw_forecast(
        &self,
        retriever: RetrieverId,
        serial: Serial,
        bits: Forecast,
    ) -> DashboardResult<()> {
        self.narrow(retriever, serial, |current| current.difference(bits))
            .map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Retriever lifecycle
    // -----------------------------------------------------------------------

    /// The retriever finished. Whatever it still forecast is withdrawn.
    pub fn mark_retriever_done(&self, retriever: RetrieverId) -> DashboardResult<()> {
        let mut state = self.write();
        let record = state
            .retrievers
            .get_mut(&retriever)
            .ok_or(DashboardError::UnknownRetriever(retriever))?;
        record.done = true;
        let serials = state.retire(retriever);
        debug!(%retriever, withdrawn = serials.len(), "retriever done");
        state.refresh_each(serials);
        state.advance_queue();
        drop(state);
        self.notify();
        Ok(())
    }

    /// Stop considering a retriever and never replace it. A run already in
    /// progress may finish; its replies are ignored.
    pub fn cancel_retries(&self, retriever: RetrieverId) -> DashboardResult<()> {
        let mut state = self.write();
        let record = state
            .retrievers
            .get_mut(&retriever)
            .ok_or(DashboardError::UnknownRetriever(retriever))?;
        record.cancelled = true;
        if let Some(factory) = record.factory {
            if let Some(f) = state.factories.get_mut(factory.0 as usize) {
                f.progress = FactoryProgress::Exhausted;
            }
        }
        let serials = state.retire(retriever);
        info!(%retriever, "retriever cancelled");
        state.refresh_each(serials);
        state.advance_queue();
        drop(state);
        self.notify();
        Ok(())
    }

    /// Record a failure of `retriever` against every open serial number it
    /// still forecast something for. The messages end up in the error
    /// reply synthesized for a request that never gets a baseline.
    pub fn record_retriever_error(
        &self,
        retriever: RetrieverId,
        message: &str,
    ) -> DashboardResult<()> {
        let mut guard = self.write();
        let state = &mut *guard;
        let record = state
            .retrievers
            .get(&retriever)
            .ok_or(DashboardError::UnknownRetriever(retriever))?;
        for serial in record.forecasts.keys() {
            if let Some(request) = state.requests.get_mut(serial) {
                if request.state == RequestState::Incomplete {
                    request.errors.push(format!("{retriever}: {message}"));
                }
            }
        }
        Ok(())
    }

    /// Retire `retriever` and ask its factory for a replacement.
    ///
    /// Both happen under one lock, so the requests it covered never look
    /// abandoned in between. Returns `None`, and marks the factory
    /// exhausted, when the retry budget is spent or the factory declines.
    pub fn get_replacement(&self, retriever: RetrieverId) -> DashboardResult<Option<RetrieverId>> {
        let mut state = self.write();
        let record = state
            .retrievers
            .get_mut(&retriever)
            .ok_or(DashboardError::UnknownRetriever(retriever))?;
        if !record.is_live() {
            return Ok(None);
        }
        record.done = true;
        let factory = record.factory;

        let replacement = factory.and_then(|f| state.next_from_factory(f));
        let serials = state.retire(retriever);
        state.refresh_each(serials);
        state.advance_queue();
        drop(state);
        self.notify();

        match replacement {
            Some(new) => info!(old = %retriever, %new, "replacement retriever registered"),
            None => debug!(%retriever, "no replacement available"),
        }
        Ok(replacement)
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Re-evaluate every open request and queue what is complete. Returns
    /// the number of requests newly queued.
    pub fn update_forecast_summary(&self) -> usize {
        let mut state = self.write();
        let open = state.open_serials();
        state.refresh_each(open);
        let queued = state.advance_queue();
        drop(state);
        if queued > 0 {
            self.notify();
        }
        queued
    }

    /// Take every queued reply, in ascending serial-number order, and mark
    /// it sent.
    pub fn get_available_replies(&self) -> Vec<Reply<R>> {
        let mut state = self.write();
        let mut replies = Vec::new();
        for (&serial, request) in state.requests.iter_mut() {
            if request.state != RequestState::Queued {
                continue;
            }
            request.state = RequestState::Sent;
            let main = request
                .main
                .take()
                .unwrap_or_else(|| ReplyUpdater::error(serial, "no reply"));
            replies.push(Reply {
                serial,
                main,
                supplementary: mem::take(&mut request.supplementary),
                synonym_seen: request.synonym_seen,
                synthesized: request.synthesized,
            });
        }
        drop(state);
        if !replies.is_empty() {
            debug!(count = replies.len(), "replies delivered");
            self.notify();
        }
        replies
    }

    /// Block until something the caller should act on happens, or until
    /// `timeout` passes.
    ///
    /// A [`TimeoutKind::Hard`] timeout settles every open request before
    /// returning, so the result then also reports the replies it released.
    pub fn wait_for_major_event(&self, timeout: Duration, kind: TimeoutKind) -> MajorEvents {
        let deadline = Instant::now() + timeout;
        let mut generation = self
            .generation
            .lock()
            .expect("dashboard event lock poisoned");
        loop {
            let events = self.read().events();
            if !events.is_empty() {
                return events;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            generation = self
                .changed
                .wait_timeout(generation, deadline - now)
                .expect("dashboard event lock poisoned")
                .0;
        }
        drop(generation);

        match kind {
            TimeoutKind::Soft => debug!(?timeout, "soft timeout"),
            TimeoutKind::Hard => {
                self.expire();
            }
        }
        MajorEvents::TIMEOUT | self.read().events()
    }

    /// Apply a hard timeout now. Returns how many error replies were
    /// synthesized.
    pub fn expire(&self) -> usize {
        let synthesized = self.write().expire("hard timeout");
        info!(synthesized, "open requests settled by hard timeout");
        self.notify();
        synthesized
    }

    /// Settle open requests once no retriever is left to serve them.
    pub(crate) fn abandon_open(&self) -> usize {
        let synthesized = self.write().expire("no retriever covers this request");
        if synthesized > 0 {
            info!(synthesized, "requests left without a retriever");
        }
        self.notify();
        synthesized
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Whether `retriever` can still contribute anything to `serial`.
    pub fn is_still_needed(&self, retriever: RetrieverId, serial: Serial) -> bool {
        let state = self.read();
        let open = state
            .requests
            .get(&serial)
            .is_some_and(|r| r.state == RequestState::Incomplete);
        open && state
            .retrievers
            .get(&retriever)
            .is_some_and(|r| r.is_live() && !r.forecast(serial).is_empty())
    }

    /// Whether a reply of `kind` from `retriever` would still be used.
    pub fn is_still_plausible(&self, retriever: RetrieverId, serial: Serial, kind: ReplyKind) -> bool {
        let state = self.read();
        let Some(request) = state.requests.get(&serial) else {
            return false;
        };
        let Some(record) = state.retrievers.get(&retriever) else {
            return false;
        };
        let outranked = match (kind.main_rank(), request.main_rank()) {
            (Some(rank), Some(current)) => current >= rank,
            _ => false,
        };
        request.state == RequestState::Incomplete
            && record.is_live()
            && record.forecast(serial).intersects(kind.bit())
            && !outranked
    }

    /// Open serial numbers `retriever` still forecasts something for.
    pub fn needed_by(&self, retriever: RetrieverId) -> Vec<Serial> {
        let state = self.read();
        let Some(record) = state.retrievers.get(&retriever).filter(|r| r.is_live()) else {
            return Vec::new();
        };
        record
            .forecasts
            .keys()
            .copied()
            .filter(|s| {
                state
                    .requests
                    .get(s)
                    .is_some_and(|r| r.state == RequestState::Incomplete)
            })
            .collect()
    }

    /// A retriever's current forecast for `serial`; `None` for an unknown
    /// retriever.
    pub fn forecast(&self, retriever: RetrieverId, serial: Serial) -> Option<Forecast> {
        self.read()
            .retrievers
            .get(&retriever)
            .map(|r| r.forecast(serial))
    }

    /// Union of all retrievers' forecasts for `serial`.
    pub fn combined_forecast(&self, serial: Serial) -> Option<Forecast> {
        self.read().requests.get(&serial).map(|r| r.combined)
    }

    pub fn request_state(&self, serial: Serial) -> Option<RequestState> {
        self.read().requests.get(&serial).map(|r| r.state)
    }

    pub fn factory_status(&self, factory: FactoryId) -> Option<FactoryStatus> {
        self.read()
            .factories
            .get(factory.0 as usize)
            .map(|f| FactoryStatus {
                progress: f.progress,
                tries_available: f.tries_available,
                tries_used: f.tries_used,
                first_retriever: f.first_retriever,
            })
    }

    /// Retrievers that are neither done nor cancelled.
    pub fn live_retrievers(&self) -> Vec<RetrieverId> {
        self.read()
            .retrievers
            .iter()
            .filter(|(_, r)| r.is_live())
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn all_sent(&self) -> bool {
        self.read()
            .requests
            .values()
            .all(|r| r.state == RequestState::Sent)
    }
}

impl<R> fmt::Debug for Dashboard<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().expect("dashboard lock poisoned");
        f.debug_struct("Dashboard")
            .field("requests", &state.requests.len())
            .field("retrievers", &state.retrievers.len())
            .field("factories", &state.factories.len())
            .finish_non_exhaustive()
    }
}
