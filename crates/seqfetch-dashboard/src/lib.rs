//! Reply dashboard for seqfetch.
//!
//! A packet of requests, each identified by a serial number, is handed to
//! several retrievers at once: one per backend, or one per strategy. The
//! [`Dashboard`] merges what they report into one record per serial number
//! and releases complete records in ascending serial-number order.
//!
//! # Design Rules
//!
//! 1. Forecasts only shrink. A widening update is rejected and clamped.
//! 2. A strong baseline beats a weak one, and either beats an error.
//! 3. A reply is released only after every lower serial number was released.
//! 4. A hard timeout settles every open request; a soft one only logs.
//! 5. A failed retriever is replaced by its factory until the retry budget
//!    runs out; then its failures become the request's error reply.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use seqfetch_dashboard::{Dashboard, DashboardConfig, ReplySink, ReplyUpdater, Retriever};
//!
//! struct Echo;
//!
//! impl Retriever<String> for Echo {
//!     fn run(&mut self, sink: &ReplySink<'_, String>) -> Result<(), String> {
//!         for serial in sink.needed_serials() {
//!             sink.reply(ReplyUpdater::strong(serial, format!("answer {serial}")))
//!                 .map_err(|e| e.to_string())?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let dash = Arc::new(Dashboard::new([1, 2, 3], DashboardConfig::default()));
//! dash.register_retriever(Box::new(Echo));
//! let replies = dash.collect();
//! assert_eq!(replies.iter().map(|r| r.serial).collect::<Vec<_>>(), vec![1, 2, 3]);
//! ```

pub mod config;
pub mod dashboard;
pub mod driver;
pub mod error;
pub mod forecast;
pub mod reply;
pub mod retriever;

// Re-exports for convenience.
pub use config::DashboardConfig;
pub use dashboard::{Dashboard, FactoryProgress, FactoryStatus, RequestState};
pub use error::{DashboardError, DashboardResult};
pub use forecast::{
    FactoryId, Forecast, MajorEvents, ReplyEvent, ReplyKind, RetrieverId, Serial, TimeoutKind,
};
pub use reply::{Reply, ReplyBody, ReplyUpdater};
pub use retriever::{ReplySink, Retriever, RetrieverFactory};
