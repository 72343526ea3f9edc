// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Lifeguard awareness: an integer health score in `[0, MaxAwarenessMult]`
//! that scales probe/gossip intervals. Incremented on missed acks,
//! decremented on clean probes, so a locally overloaded or lossy node backs
//! off its own gossip cadence instead of generating false suspicions.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

pub struct Awareness {
    score: AtomicI32,
    max: i32,
}

impl Awareness {
    pub fn new(max_awareness_mult: i32) -> Self {
        Self {
            score: AtomicI32::new(0),
            max: max_awareness_mult.max(0),
        }
    }

    /// A missed direct/indirect ack: health worsens.
    pub fn on_miss(&self) {
        self.bump(1);
    }

    /// A clean probe round-trip: health improves.
    pub fn on_success(&self) {
        self.bump(-1);
    }

    fn bump(&self, delta: i32) {
        let mut current = self.score.load(Ordering::Relaxed);
        loop {
            let next = (current + delta).clamp(0, self.max);
            match self
                .score
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn score(&self) -> i32 {
        self.score.load(Ordering::Relaxed)
    }

    /// Scales `base` by `(score + 1)`, so unhealthy nodes probe and gossip
    /// less frequently, easing load on a node that is already struggling.
    pub fn scale(&self, base: Duration) -> Duration {
        base.mul_f64(f64::from(self.score() + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_clamped() {
        let a = Awareness::new(3);
        for _ in 0..10 {
            a.on_miss();
        }
        assert_eq!(a.score(), 3);
        for _ in 0..10 {
            a.on_success();
        }
        assert_eq!(a.score(), 0);
    }

    #[test]
    fn scale_multiplies_interval() {
        let a = Awareness::new(5);
        assert_eq!(a.scale(Duration::from_secs(1)), Duration::from_secs(1));
        a.on_miss();
        a.on_miss();
        assert_eq!(a.scale(Duration::from_secs(1)), Duration::from_secs(3));
    }
}
