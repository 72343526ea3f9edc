// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-node suspicion timers with confirmation-driven acceleration.
//!
//! `min` and `max` bound the timer; each confirmation from a distinct peer
//! shrinks the remaining time geometrically towards `min`, following the
//! Lifeguard extension to SWIM.

use std::collections::HashSet;
use std::time::Duration;

/// Computes `(min, max)` suspicion bounds for a cluster of size `n`.
pub fn bounds(n: usize, suspicion_mult: u32, suspicion_max_mult: u32, probe_interval: Duration) -> (Duration, Duration) {
    let log_n = (n.max(1) as f64).log10();
    let min = probe_interval.mul_f64(f64::from(suspicion_mult) * log_n.max(0.0));
    // A cluster of size 1 has log10(1) == 0; never let the timer collapse to zero.
    let min = min.max(probe_interval);
    let max = min.mul_f64(f64::from(suspicion_max_mult));
    (min, max)
}

/// A running suspicion timer for one peer.
#[derive(Debug)]
pub struct SuspicionTimer {
    min: Duration,
    max: Duration,
    /// Expected number of independent confirmations before the timer could
    /// reach `min`; used to scale each confirmation's effect.
    expected_confirmations: u32,
    confirmations_from: HashSet<String>,
}

impl SuspicionTimer {
    pub fn new(min: Duration, max: Duration, expected_confirmations: u32) -> Self {
        Self {
            min,
            max,
            expected_confirmations: expected_confirmations.max(1),
            confirmations_from: HashSet::new(),
        }
    }

    /// Registers a confirmation from `peer`. Confirmations from a peer that
    /// already confirmed are ignored. Returns the remaining duration to wait
    /// from now, computed fresh each call (the caller re-arms its timer to
    /// this value).
    pub fn confirm(&mut self, peer: &str) -> Duration {
        if !self.confirmations_from.contains(peer) {
            self.confirmations_from.insert(peer.to_string());
        }

        let k = self.confirmations_from.len() as f64;
        let n = f64::from(self.expected_confirmations);
        // Geometric interpolation between max and min as confirmations accrue,
        // per the Lifeguard paper's suspicion acceleration formula.
        let frac = (k.min(n) / n).min(1.0);
        let span = self.max.as_secs_f64() - self.min.as_secs_f64();
        let remaining = self.max.as_secs_f64() - frac * span;
        Duration::from_secs_f64(remaining.max(self.min.as_secs_f64()))
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_scale_with_cluster_size() {
        let (min1, max1) = bounds(1, 4, 6, Duration::from_secs(1));
        let (min100, max100) = bounds(100, 4, 6, Duration::from_secs(1));
        assert!(min100 > min1);
        assert!(max100 > max1);
        assert_eq!(max1.as_secs_f64() / min1.as_secs_f64(), 6.0);
    }

    #[test]
    fn confirmations_never_go_below_min() {
        let mut timer = SuspicionTimer::new(Duration::from_secs(1), Duration::from_secs(6), 3);
        let first = timer.confirm("a");
        let second = timer.confirm("b");
        let third = timer.confirm("c");
        assert!(first > second);
        assert!(second > third);
        assert!(third >= Duration::from_secs(1));
        // A repeat confirmation from an already-seen peer changes nothing.
        let repeat = timer.confirm("c");
        assert_eq!(repeat, third);
    }
}
