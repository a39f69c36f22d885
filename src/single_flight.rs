// Per-key call coalescing: while one caller runs the expensive fetch for a key,
// concurrent callers for that key wait for and share its result.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

enum Slot<T> {
    Pending,
    Done(T),
    /// The leader unwound before producing a value.
    Abandoned,
}

struct Call<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Arc<Call<T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        SingleFlight {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

/// Publishes `Abandoned` if the leader's closure panics.
struct LeaderGuard<'a, T> {
    flight: &'a SingleFlight<T>,
    key: &'a str,
    call: Arc<Call<T>>,
    finished: bool,
}

impl<T> LeaderGuard<'_, T> {
    fn publish(&mut self, slot: Slot<T>) {
        *self.call.slot.lock().unwrap_or_else(PoisonError::into_inner) = slot;
        self.call.ready.notify_all();
        self.flight
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
        self.finished = true;
    }
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.publish(Slot::Abandoned);
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fetch` unless a call for `key` is already in flight, in which case the
    /// in-flight result is returned instead.
    pub fn run<F>(&self, key: &str, fetch: F) -> T
    where
        F: FnOnce() -> T,
    {
        let (call, leader) = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            match calls.get(key) {
                Some(call) => (Arc::clone(call), false),
                None => {
                    let call = Arc::new(Call {
                        slot: Mutex::new(Slot::Pending),
                        ready: Condvar::new(),
                    });
                    calls.insert(key.to_string(), Arc::clone(&call));
                    (call, true)
                }
            }
        };

        if leader {
            let mut guard = LeaderGuard {
                flight: self,
                key,
                call,
                finished: false,
            };
            let value = fetch();
            guard.publish(Slot::Done(value.clone()));
            return value;
        }

        let mut slot = call.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Slot::Done(value) = &*slot {
                return value.clone();
            }
            if matches!(*slot, Slot::Abandoned) {
                break;
            }
            slot = call.ready.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
        drop(slot);
        fetch()
    }
}
