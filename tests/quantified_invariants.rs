// Property-based tests for the quantified invariants of §8: LTime
// monotonicity, the resurrection ban, the coalesce law, and the broadcast
// transmit bound. Each property is checked against arbitrary sequences of
// inputs rather than a handful of hand-picked examples.

use proptest::prelude::*;
use serf_core::broadcast::{retransmit_limit, BroadcastQueues, Class};
use serf_core::event::EventBuffer;
use serf_core::member::{MemberInfo, Node, Outcome, Status};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

fn local_member() -> MemberInfo {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7946));
    MemberInfo::new(Node::new("a", addr))
}

proptest! {
    /// For any sequence of join/leave intents applied to a member, the final
    /// `status_ltime` equals the maximum Lamport time ever presented to it,
    /// regardless of ordering or rejection (§8 "LTime monotonicity per member").
    #[test]
    fn ltime_monotonic_regardless_of_order(times in prop::collection::vec(0u64..1000, 1..40)) {
        let mut member = local_member();
        let mut max_seen = 0u64;
        for (i, &t) in times.iter().enumerate() {
            if i % 2 == 0 {
                member.join_intent(t);
            } else {
                member.leave_intent(t);
            }
            max_seen = max_seen.max(t);
        }
        prop_assert_eq!(member.status_ltime, max_seen);
    }

    /// A member in `Left` or `Failed` never transitions back to `Alive` via
    /// any sequence of join intents, however many or however large their
    /// Lamport times (§8 "Resurrection ban").
    #[test]
    fn resurrection_via_intent_is_always_blocked(
        start_failed in any::<bool>(),
        times in prop::collection::vec(1u64..10_000, 1..40),
    ) {
        let mut member = local_member();
        member.status = if start_failed { Status::Failed } else { Status::Left };
        member.status_ltime = 0;

        for &t in &times {
            let outcome = member.join_intent(t);
            prop_assert!(matches!(outcome, Outcome::LTimeUpdated | Outcome::Rejected));
            prop_assert!(matches!(member.status, Status::Failed | Status::Left));
        }

        // Only the authoritative path can bring it back.
        prop_assert_eq!(member.on_memberlist_join(), Outcome::StateChanged);
        prop_assert_eq!(member.status, Status::Alive);
    }

    /// Two coalesced user events sharing a slot and name dispatch exactly
    /// once, carrying the latest payload (§8 "Coalesce law").
    #[test]
    fn coalesce_law_holds(
        ltime in 0u64..64,
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..8), 2..6),
    ) {
        let mut buf = EventBuffer::new(8);
        let mut dispatched = 0;
        for payload in &payloads {
            if buf.record("deploy", payload, ltime, true) {
                dispatched += 1;
            }
        }
        prop_assert_eq!(dispatched, 1, "coalesced events with the same name/slot must dispatch exactly once");
    }

    /// A broadcast drawn repeatedly from the queue is never handed out more
    /// than `retransmit_mult * ceil(log10(n+1))` times (§8 "Broadcast bound").
    #[test]
    fn broadcast_never_exceeds_its_retransmit_budget(
        retransmit_mult in 1u32..6,
        cluster_size in 1usize..200,
        draws in 1usize..400,
    ) {
        let limit = retransmit_limit(retransmit_mult, cluster_size);
        let mut queues = BroadcastQueues::new(limit);
        queues.queue(Class::Memberlist, "node-x", vec![1, 2, 3], None);

        let mut total_draws = 0u32;
        for _ in 0..draws {
            let drawn = queues.drain_for_compound(0, 1400, 1);
            if drawn.is_empty() {
                break;
            }
            total_draws += drawn.len() as u32;
        }
        prop_assert!(total_draws <= limit, "drew {} times, limit was {}", total_draws, limit);
    }
}

#[test]
fn exact_repeat_event_dispatches_at_most_once() {
    let mut buf = EventBuffer::new(8);
    let mut dispatched = 0;
    for _ in 0..10 {
        if buf.record("deploy", b"v1", 7, false) {
            dispatched += 1;
        }
    }
    assert_eq!(dispatched, 1);
}
