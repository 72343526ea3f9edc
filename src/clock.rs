// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Logical (Lamport) clocks. The engine keeps three independent instances:
//! one for member intents, one for user events, and one for queries.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic logical clock, atomically incremented and witnessed.
#[derive(Debug, Default)]
pub struct LamportClock(AtomicU64);

/// Alias used throughout the intent/event/query layers for clock readings.
pub type LTime = u64;

impl LamportClock {
    /// A fresh clock starting at zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Starts the clock at a recovered value, e.g. from a snapshot replay.
    pub fn starting_at(value: LTime) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Current value. Does not advance the clock.
    pub fn time(&self) -> LTime {
        self.0.load(Ordering::Acquire)
    }

    /// Atomically increments the clock and returns the new value.
    pub fn increment(&self) -> LTime {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Advances the clock so that it is strictly greater than `t`, unless it
    /// already is. Used whenever an incoming intent/event/query is observed.
    pub fn witness(&self, t: LTime) {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            let candidate = current.max(t.wrapping_add(1));
            if candidate <= current {
                return;
            }
            match self.0.compare_exchange_weak(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_is_monotonic() {
        let clock = LamportClock::new();
        assert_eq!(clock.increment(), 1);
        assert_eq!(clock.increment(), 2);
        assert_eq!(clock.time(), 2);
    }

    #[test]
    fn witness_only_advances() {
        let clock = LamportClock::new();
        clock.witness(5);
        assert_eq!(clock.time(), 6);
        clock.witness(3);
        assert_eq!(clock.time(), 6, "witnessing a smaller time must not move the clock back");
        clock.witness(10);
        assert_eq!(clock.time(), 11);
    }

    #[test]
    fn starting_at_seeds_the_clock() {
        let clock = LamportClock::starting_at(41);
        assert_eq!(clock.increment(), 42);
    }
}
