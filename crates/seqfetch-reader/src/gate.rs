use std::fmt;
use std::sync::{Condvar, Mutex};

/// Limits how many calls may be inside one reader at a time.
///
/// Built from [`Reader::concurrency_hint`](crate::Reader::concurrency_hint):
/// `0` admits everyone, `N` admits at most `N` callers and parks the rest
/// until a slot frees up.
pub struct ConcurrencyGate {
    limit: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    /// `0` when unlimited.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Callers currently inside the gate.
    pub fn in_use(&self) -> usize {
        *self.in_use.lock().expect("reader gate poisoned")
    }

    /// Block until a slot is free and take it. The slot is released when
    /// the returned permit is dropped.
    pub fn enter(&self) -> GatePermit<'_> {
        if self.limit == 0 {
            return GatePermit { gate: None };
        }
        let in_use = self.in_use.lock().expect("reader gate poisoned");
        let mut in_use = self
            .freed
            .wait_while(in_use, |n| *n >= self.limit)
            .expect("reader gate poisoned");
        *in_use += 1;
        GatePermit { gate: Some(self) }
    }
}

impl fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("limit", &self.limit)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A slot held in a [`ConcurrencyGate`].
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct GatePermit<'a> {
    gate: Option<&'a ConcurrencyGate>,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.gate {
            *gate.in_use.lock().expect("reader gate poisoned") -= 1;
            gate.freed.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn peak_with(limit: usize, callers: usize) -> usize {
        let gate = Arc::new(ConcurrencyGate::new(limit));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _permit = gate.enter();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(gate.in_use(), 0);
        peak.load(Ordering::SeqCst)
    }

    #[test]
    fn single_slot_serializes() {
        assert_eq!(peak_with(1, 4), 1);
    }

    #[test]
    fn counting_gate_caps_callers() {
        assert!(peak_with(2, 6) <= 2);
    }

    #[test]
    fn unlimited_gate_holds_no_count() {
        let gate = ConcurrencyGate::new(0);
        let a = gate.enter();
        let b = gate.enter();
        assert_eq!(gate.in_use(), 0);
        drop((a, b));
        assert_eq!(gate.limit(), 0);
    }
}
