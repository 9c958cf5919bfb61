//! Inbound envelope filtering.
//!
//! The relay delivers at-least-once and in no particular order. Before an
//! envelope is decrypted it must pass three checks:
//!
//! - not sent by this device (echoes of our own sends come back)
//! - newer than the connection floor and within the reorder window of the
//!   newest envelope accepted so far
//! - id not already processed
//!
//! Ids are only marked processed after successful decryption, so a forged
//! copy cannot shadow the genuine envelope with the same id.
//!
//! # Thread Safety
//!
//! Not thread-safe. The coordinator keeps it behind its state lock.

use std::collections::{HashSet, VecDeque};

use sww_common::{DeviceId, EncryptedEnvelope};

/// Outcome of [`InboundFilter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Our own send echoed back.
    Echo,
    Duplicate,
    /// Older than the floor or outside the reorder window.
    TooOld,
}

/// Watermark plus bounded id set.
#[derive(Debug, Clone)]
pub struct InboundFilter {
    local_device: DeviceId,
    /// Envelopes at or before this timestamp predate the connection.
    floor_ms: u64,
    /// Newest accepted timestamp.
    highest_ms: u64,
    window_ms: u64,
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl InboundFilter {
    pub fn new(local_device: DeviceId, floor_ms: u64, window_ms: u64, capacity: usize) -> Self {
        Self {
            local_device,
            floor_ms,
            highest_ms: floor_ms,
            window_ms,
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Lowest timestamp still accepted.
    pub fn watermark(&self) -> u64 {
        self.floor_ms.max(self.highest_ms.saturating_sub(self.window_ms))
    }

    /// Check an envelope without updating state.
    pub fn check(&self, envelope: &EncryptedEnvelope) -> Verdict {
        if envelope.sender_id == self.local_device.as_str() {
            return Verdict::Echo;
        }
        if self.seen.contains(&envelope.id) {
            return Verdict::Duplicate;
        }
        if envelope.timestamp <= self.watermark() {
            return Verdict::TooOld;
        }
        Verdict::Accept
    }

    /// Record a successfully decrypted envelope.
    pub fn mark_processed(&mut self, envelope: &EncryptedEnvelope) {
        if !self.seen.insert(envelope.id.clone()) {
            return;
        }
        self.order.push_back(envelope.id.clone());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.highest_ms = self.highest_ms.max(envelope.timestamp);
    }

    pub fn highest(&self) -> u64 {
        self.highest_ms
    }

    pub fn processed_count(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sww_common::PayloadKind;

    fn device(byte: char) -> DeviceId {
        DeviceId::parse(&byte.to_string().repeat(16)).unwrap()
    }

    fn env(id: &str, sender: &DeviceId, ts: u64) -> EncryptedEnvelope {
        EncryptedEnvelope {
            id: id.into(),
            sender_id: sender.to_string(),
            ciphertext: String::new(),
            nonce: String::new(),
            timestamp: ts,
            kind: PayloadKind::Signal,
            metadata: None,
        }
    }

    fn filter() -> InboundFilter {
        InboundFilter::new(device('a'), 1_000, 500, 4)
    }

    #[test]
    fn test_own_sends_are_echoes() {
        let f = filter();
        assert_eq!(f.check(&env("x", &device('a'), 2_000)), Verdict::Echo);
        assert_eq!(f.check(&env("x", &device('b'), 2_000)), Verdict::Accept);
    }

    #[test]
    fn test_duplicates_rejected_after_processing() {
        let mut f = filter();
        let e = env("x", &device('b'), 2_000);

        assert_eq!(f.check(&e), Verdict::Accept);
        f.mark_processed(&e);
        assert_eq!(f.check(&e), Verdict::Duplicate);
    }

    #[test]
    fn test_unprocessed_ids_are_not_remembered() {
        let f = filter();
        let e = env("x", &device('b'), 2_000);
        assert_eq!(f.check(&e), Verdict::Accept);
        assert_eq!(f.check(&e), Verdict::Accept);
    }

    #[test]
    fn test_floor_and_reorder_window() {
        let mut f = filter();
        let peer = device('b');

        assert_eq!(f.check(&env("pre", &peer, 1_000)), Verdict::TooOld);

        f.mark_processed(&env("n", &peer, 3_000));
        assert_eq!(f.watermark(), 2_500);

        // Late but inside the window.
        assert_eq!(f.check(&env("late", &peer, 2_600)), Verdict::Accept);
        // Outside the window.
        assert_eq!(f.check(&env("stale", &peer, 2_400)), Verdict::TooOld);

        // Processing an older envelope never moves the watermark back.
        f.mark_processed(&env("late", &peer, 2_600));
        assert_eq!(f.highest(), 3_000);
    }

    #[test]
    fn test_id_set_is_bounded() {
        let mut f = filter();
        let peer = device('b');
        for i in 0..10u64 {
            f.mark_processed(&env(&format!("id{i}"), &peer, 2_000 + i));
        }
        assert_eq!(f.processed_count(), 4);
    }
}
