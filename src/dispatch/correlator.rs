use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

enum SlotState {
    Pending,
    Fulfilled(Value),
}

struct Slot {
    state: Mutex<SlotState>,
    delivered: Condvar,
}

#[derive(Debug, PartialEq)]
pub enum AwaitOutcome {
    Fulfilled(Value),
    TimedOut,
}

/// Pairs each in-flight request with the reply produced by a worker. A slot
/// is created before the job is enqueued, fulfilled at most once, and always
/// removed when the waiter returns. A fulfill that arrives after the waiter
/// gave up finds no slot and reports `false`.
#[derive(Default)]
pub struct ResponseCorrelator {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` when a slot for this id is already pending.
    pub fn create_slot(&self, request_id: &str) -> bool {
        let mut slots = self.slots.lock().expect("correlator slots lock poisoned");
        if slots.contains_key(request_id) {
            return false;
        }

        slots.insert(
            request_id.to_owned(),
            Arc::new(Slot {
                state: Mutex::new(SlotState::Pending),
                delivered: Condvar::new(),
            }),
        );
        true
    }

    /// Blocks until the slot is fulfilled or the timeout elapses, then
    /// removes the slot either way.
    pub fn await_result(&self, request_id: &str, timeout: Duration) -> AwaitOutcome {
        let slot = {
            let slots = self.slots.lock().expect("correlator slots lock poisoned");
            match slots.get(request_id) {
                Some(slot) => Arc::clone(slot),
                None => return AwaitOutcome::TimedOut,
            }
        };

        let outcome = self.wait_on_slot(&slot, timeout);

        self.slots
            .lock()
            .expect("correlator slots lock poisoned")
            .remove(request_id);

        outcome
    }

    fn wait_on_slot(&self, slot: &Slot, timeout: Duration) -> AwaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = slot.state.lock().expect("correlator slot lock poisoned");

        loop {
            if let SlotState::Fulfilled(result) = &*state {
                return AwaitOutcome::Fulfilled(result.clone());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return AwaitOutcome::TimedOut;
            }

            let (guard, _) = slot
                .delivered
                .wait_timeout(state, remaining)
                .expect("correlator slot lock poisoned");
            state = guard;
        }
    }

    /// Delivers a result to the waiter. `false` when the slot is gone
    /// (waiter timed out) or already holds a result.
    pub fn fulfill(&self, request_id: &str, result: Value) -> bool {
        let slot = {
            let slots = self.slots.lock().expect("correlator slots lock poisoned");
            match slots.get(request_id) {
                Some(slot) => Arc::clone(slot),
                None => return false,
            }
        };

        let mut state = slot.state.lock().expect("correlator slot lock poisoned");
        if matches!(*state, SlotState::Fulfilled(_)) {
            return false;
        }

        *state = SlotState::Fulfilled(result);
        slot.delivered.notify_all();
        true
    }

    /// Count of in-flight requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.slots
            .lock()
            .expect("correlator slots lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::{AwaitOutcome, ResponseCorrelator};

    #[test]
    fn fulfilled_result_reaches_the_waiter() {
        let correlator = Arc::new(ResponseCorrelator::new());
        assert!(correlator.create_slot("r-1"));

        let fulfiller = Arc::clone(&correlator);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            fulfiller.fulfill("r-1", json!({"translated_text": "こんにちは"}))
        });

        let outcome = correlator.await_result("r-1", Duration::from_secs(2));
        assert_eq!(
            outcome,
            AwaitOutcome::Fulfilled(json!({"translated_text": "こんにちは"}))
        );
        assert!(worker.join().expect("worker thread should not panic"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn await_times_out_near_the_configured_boundary() {
        let correlator = ResponseCorrelator::new();
        assert!(correlator.create_slot("r-slow"));

        let started = Instant::now();
        let outcome = correlator.await_result("r-slow", Duration::from_millis(10));
        let elapsed = started.elapsed();

        assert_eq!(outcome, AwaitOutcome::TimedOut);
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(500));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn late_fulfill_after_timeout_is_a_silent_no_op() {
        let correlator = ResponseCorrelator::new();
        assert!(correlator.create_slot("r-late"));

        let outcome = correlator.await_result("r-late", Duration::from_millis(10));
        assert_eq!(outcome, AwaitOutcome::TimedOut);

        let delivered = correlator.fulfill("r-late", json!({"translated_text": "too late"}));
        assert!(!delivered);
    }

    #[test]
    fn second_fulfill_for_one_slot_is_rejected() {
        let correlator = ResponseCorrelator::new();
        assert!(correlator.create_slot("r-2"));

        assert!(correlator.fulfill("r-2", json!({"n": 1})));
        assert!(!correlator.fulfill("r-2", json!({"n": 2})));

        let outcome = correlator.await_result("r-2", Duration::from_millis(100));
        assert_eq!(outcome, AwaitOutcome::Fulfilled(json!({"n": 1})));
    }

    #[test]
    fn duplicate_pending_slot_is_rejected() {
        let correlator = ResponseCorrelator::new();
        assert!(correlator.create_slot("r-dup"));
        assert!(!correlator.create_slot("r-dup"));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[test]
    fn fulfill_without_slot_reports_false() {
        let correlator = ResponseCorrelator::new();
        assert!(!correlator.fulfill("r-unknown", json!({})));
    }

    #[test]
    fn pending_count_tracks_in_flight_requests() {
        let correlator = ResponseCorrelator::new();
        assert!(correlator.create_slot("r-a"));
        assert!(correlator.create_slot("r-b"));
        assert_eq!(correlator.pending_count(), 2);

        assert!(correlator.fulfill("r-a", json!({})));
        let _ = correlator.await_result("r-a", Duration::from_millis(100));
        assert_eq!(correlator.pending_count(), 1);
    }
}
