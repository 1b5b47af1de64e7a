//! Thread-per-retriever driver for a [`Dashboard`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::dashboard::Dashboard;
use crate::forecast::{MajorEvents, RetrieverId, TimeoutKind};
use crate::reply::Reply;
use crate::retriever::{ReplySink, Retriever};

impl<R: Send + Sync + 'static> Dashboard<R> {
    /// Start every ready retriever on its own thread.
    pub fn spawn_ready(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (id, retriever) in self.take_ready_retrievers() {
            let dashboard = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("seqfetch-{id}"))
                .spawn(move || run_retriever(&dashboard, id, retriever));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(retriever = %id, error = %e, "could not start retriever thread");
                    fail(self, id, &e.to_string());
                }
            }
        }
        handles
    }

    /// Drive the packet to completion and return every reply in
    /// serial-number order.
    ///
    /// Waits up to the soft timeout, logs it, then waits up to the hard
    /// timeout. On a hard timeout open requests are settled, remaining
    /// retrievers are cancelled and their threads are left to finish on
    /// their own.
    pub fn collect(self: &Arc<Self>) -> Vec<Reply<R>> {
        let started = Instant::now();
        let soft = self.config().soft_timeout();
        let hard = self.config().hard_timeout();
        let mut workers = Vec::new();
        let mut replies = Vec::new();
        let mut soft_passed = false;

        loop {
            let elapsed = started.elapsed();
            let (wait, kind) = if !soft_passed && elapsed < soft {
                (soft - elapsed, TimeoutKind::Soft)
            } else {
                (hard.saturating_sub(elapsed), TimeoutKind::Hard)
            };
            let events = self.wait_for_major_event(wait, kind);

            if events.contains(MajorEvents::RETRIEVER_READY) {
                workers.extend(self.spawn_ready());
            }
            if events.contains(MajorEvents::REPLY_AVAILABLE) {
                replies.extend(self.get_available_replies());
            }
            if events.contains(MajorEvents::TIMEOUT) {
                match kind {
                    TimeoutKind::Soft => {
                        soft_passed = true;
                        info!(elapsed = ?started.elapsed(), "soft timeout, still waiting");
                        continue;
                    }
                    TimeoutKind::Hard => {
                        for id in self.live_retrievers() {
                            if let Err(e) = self.cancel_retries(id) {
                                debug!(retriever = %id, error = %e, "cancel failed");
                            }
                        }
                        replies.extend(self.get_available_replies());
                        warn!(
                            elapsed = ?started.elapsed(),
                            abandoned = workers.len(),
                            "hard timeout"
                        );
                        return replies;
                    }
                }
            }
            if events.contains(MajorEvents::NO_MORE_REPLIES) {
                self.abandon_open();
                replies.extend(self.get_available_replies());
                break;
            }
        }

        for worker in workers {
            if worker.join().is_err() {
                warn!("retriever thread panicked outside its run");
            }
        }
        debug!(replies = replies.len(), elapsed = ?started.elapsed(), "packet complete");
        replies
    }
}

fn run_retriever<R: Send + Sync + 'static>(
    dashboard: &Dashboard<R>,
    id: RetrieverId,
    mut retriever: Box<dyn Retriever<R>>,
) {
    let sink = ReplySink::new(dashboard, id);
    debug!(retriever = %id, "retriever started");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| retriever.run(&sink)))
        .unwrap_or_else(|_| Err("retriever panicked".to_string()));

    match outcome {
        Ok(()) => {
            if let Err(e) = dashboard.mark_retriever_done(id) {
                warn!(retriever = %id, error = %e, "could not mark retriever done");
            }
        }
        Err(message) => {
            warn!(retriever = %id, error = %message, "retriever failed");
            fail(dashboard, id, &message);
        }
    }
}

fn fail<R: Send + Sync + 'static>(dashboard: &Dashboard<R>, id: RetrieverId, message: &str) {
    let replaced = dashboard
        .record_retriever_error(id, message)
        .and_then(|()| dashboard.get_replacement(id));
    match replaced {
        Ok(Some(new)) => debug!(old = %id, %new, "retriever replaced"),
        Ok(None) => {}
        Err(e) => warn!(retriever = %id, error = %e, "could not replace retriever"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DashboardConfig;
    use crate::forecast::{Forecast, ReplyKind, Serial};
    use crate::reply::ReplyUpdater;
    use crate::retriever::RetrieverFactory;
    use std::time::Duration;

    fn config(soft_ms: u64, hard_ms: u64) -> DashboardConfig {
        DashboardConfig {
            soft_timeout_ms: soft_ms,
            hard_timeout_ms: hard_ms,
            default_tries: 2,
        }
    }

    /// Replies to its serial numbers in the given order, pausing before each.
    struct Scripted {
        order: Vec<Serial>,
        pause: Duration,
    }

    impl Retriever<String> for Scripted {
        fn run(&mut self, sink: &ReplySink<'_, String>) -> Result<(), String> {
            for &serial in &self.order {
                thread::sleep(self.pause);
                sink.reply(ReplyUpdater::strong(serial, format!("seq-{serial}")))
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        }
    }

    struct Failing;

    impl Retriever<String> for Failing {
        fn run(&mut self, _sink: &ReplySink<'_, String>) -> Result<(), String> {
            Err("connection refused".into())
        }
    }

    struct Panicking;

    impl Retriever<String> for Panicking {
        fn run(&mut self, _sink: &ReplySink<'_, String>) -> Result<(), String> {
            panic!("decoder bug");
        }
    }

    /// Answers whatever is still open, with a weak baseline.
    struct Sweeper;

    impl Retriever<String> for Sweeper {
        fn run(&mut self, sink: &ReplySink<'_, String>) -> Result<(), String> {
            for serial in sink.needed_serials() {
                if sink.is_still_plausible(serial, ReplyKind::WeakBaseline) {
                    sink.reply(ReplyUpdater::weak(serial, format!("retry-{serial}")))
                        .map_err(|e| e.to_string())?;
                }
                sink.withdraw(serial, Forecast::ALL)
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        }
    }

    /// First instance fails, later ones sweep.
    struct FlakyFactory;

    impl RetrieverFactory<String> for FlakyFactory {
        fn name(&self) -> &str {
            "flaky"
        }

        fn create(&self, _serials: &[Serial], attempt: u32) -> Option<Box<dyn Retriever<String>>> {
            if attempt == 1 {
                Some(Box::new(Failing))
            } else {
                Some(Box::new(Sweeper))
            }
        }
    }

    fn serials(replies: &[Reply<String>]) -> Vec<Serial> {
        replies.iter().map(|r| r.serial).collect()
    }

    #[test]
    fn out_of_order_replies_are_delivered_in_order() {
        let dash = Arc::new(Dashboard::new([1, 2, 3, 4], config(2_000, 10_000)));
        dash.register_retriever(Box::new(Scripted {
            order: vec![4, 2],
            pause: Duration::from_millis(5),
        }));
        dash.register_retriever(Box::new(Scripted {
            order: vec![3, 1],
            pause: Duration::from_millis(7),
        }));

        let replies = dash.collect();
        assert_eq!(serials(&replies), vec![1, 2, 3, 4]);
        assert!(replies.iter().all(|r| !r.synthesized));
        assert_eq!(replies[2].main.payload().map(String::as_str), Some("seq-3"));
        assert!(dash.all_sent());
    }

    #[test]
    fn failed_retriever_is_replaced() {
        let dash = Arc::new(Dashboard::new([10, 11], config(2_000, 10_000)));
        let factory = dash.add_factory(Arc::new(FlakyFactory));

        let replies = dash.collect();
        assert_eq!(serials(&replies), vec![10, 11]);
        assert!(replies.iter().all(|r| r.main.kind == ReplyKind::WeakBaseline));
        assert_eq!(replies[0].main.retriever, Some(RetrieverId(1)));
        assert_eq!(dash.factory_status(factory).unwrap().tries_used, 2);
    }

    #[test]
    fn panic_becomes_error_reply() {
        let dash = Arc::new(Dashboard::new([1], config(2_000, 10_000)));
        dash.register_retriever(Box::new(Panicking));

        let replies = dash.collect();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].synthesized);
        assert_eq!(
            replies[0].main.error_message(),
            Some("retriever-0: retriever panicked")
        );
    }

    #[test]
    fn hard_timeout_returns_partial_packet() {
        let dash = Arc::new(Dashboard::new([1, 2], config(20, 100)));
        dash.register_retriever(Box::new(Scripted {
            order: vec![1, 2],
            pause: Duration::from_millis(60),
        }));
        dash.register_retriever(Box::new(Scripted {
            order: vec![2],
            pause: Duration::from_millis(2_000),
        }));

        let started = Instant::now();
        let replies = dash.collect();
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(serials(&replies), vec![1, 2]);
        assert!(!replies[0].synthesized);
        assert!(replies[1].synthesized);
        assert!(replies[1].is_error());
        assert!(dash.live_retrievers().is_empty());
    }

    #[test]
    fn packet_without_retrievers_settles_immediately() {
        let dash = Arc::new(Dashboard::<String>::new([1, 2], config(2_000, 10_000)));
        let replies = dash.collect();
        assert_eq!(serials(&replies), vec![1, 2]);
        assert!(replies.iter().all(|r| r.synthesized && r.is_error()));
    }
}
