//! Congestion gate applied before every send.

use crate::protocol::{DeliveryClass, MessageKind};

/// Default outbound buffer threshold (64 KiB).
pub const DEFAULT_BACKPRESSURE_THRESHOLD: usize = 64 * 1024;

/// Decision for one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Hand the frame to the channel.
    Send,
    /// Discard; a newer message of the same kind will replace it.
    Drop,
}

/// Drops best-effort traffic while the channel's buffer is above a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressurePolicy {
    threshold: usize,
}

impl BackpressurePolicy {
    /// Policy with the given threshold in bytes.
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Threshold in bytes.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Decide whether a message of `kind` may be sent with `buffered` bytes queued.
    pub fn admit(&self, kind: MessageKind, buffered: usize) -> Admission {
        match kind.delivery() {
            DeliveryClass::BestEffort if buffered > self.threshold => Admission::Drop,
            DeliveryClass::BestEffort | DeliveryClass::Critical | DeliveryClass::Heartbeat => {
                Admission::Send
            }
        }
    }
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BACKPRESSURE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn congested_trials_drop_only_best_effort() {
        let policy = BackpressurePolicy::default();
        let mut rng = StdRng::seed_from_u64(0xBAC0);
        let mut dropped = std::collections::HashMap::new();

        for _ in 0..1000 {
            let buffered = rng.gen_range(DEFAULT_BACKPRESSURE_THRESHOLD + 1..=8 * DEFAULT_BACKPRESSURE_THRESHOLD);
            for kind in [
                MessageKind::Snapshot,
                MessageKind::Keys,
                MessageKind::Ready,
                MessageKind::FullSync,
                MessageKind::Briefing,
            ] {
                if policy.admit(kind, buffered) == Admission::Drop {
                    *dropped.entry(kind).or_insert(0u32) += 1;
                }
            }
        }

        assert_eq!(dropped.get(&MessageKind::Snapshot), Some(&1000));
        assert_eq!(dropped.get(&MessageKind::Keys), Some(&1000));
        assert_eq!(dropped.get(&MessageKind::Ready), None);
        assert_eq!(dropped.get(&MessageKind::FullSync), None);
        assert_eq!(dropped.get(&MessageKind::Briefing), None);
    }

    #[test]
    fn threshold_is_exclusive() {
        let policy = BackpressurePolicy::new(100);
        assert_eq!(policy.admit(MessageKind::Snapshot, 100), Admission::Send);
        assert_eq!(policy.admit(MessageKind::Snapshot, 101), Admission::Drop);
        assert_eq!(policy.admit(MessageKind::Ping, 10_000), Admission::Send);
    }
}
