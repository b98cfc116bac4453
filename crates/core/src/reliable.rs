//! Stop-and-wait reliable messaging layered over the unreliable transport
//! (§4.4). At most one reliable message is ever in flight per direction;
//! the next is held until the peer's ack is observed.

use std::time::{Duration, Instant};

/// How long to wait for an ack before resending the in-flight message (§6.2).
pub const RESEND_INTERVAL: Duration = Duration::from_millis(200);

struct Pending {
    sequence: u16,
    payload: Vec<u8>,
    last_sent: Option<Instant>,
}

/// One direction's worth of stop-and-wait state. A full reliable
/// connection uses one `ReliableChannel` per direction.
#[derive(Default)]
pub struct ReliableChannel {
    next_send_seq: u16,
    pending: Option<Pending>,
    last_received_seq: Option<u16>,
}

impl ReliableChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a message is awaiting ack; the caller must not queue
    /// another until this clears.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Queues `payload` for send. Returns `false` (and does nothing) if a
    /// message is already in flight.
    pub fn queue(&mut self, payload: Vec<u8>) -> bool {
        if self.pending.is_some() {
            return false;
        }
        let sequence = self.next_send_seq;
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        self.pending = Some(Pending {
            sequence,
            payload,
            last_sent: None,
        });
        true
    }

    /// Returns `(sequence, payload)` to send now if a message is pending
    /// and either unsent or due for resend, else `None`.
    pub fn poll_send(&mut self, now: Instant) -> Option<(u16, &[u8])> {
        let pending = self.pending.as_mut()?;
        let due = match pending.last_sent {
            None => true,
            Some(last) => now.duration_since(last) >= RESEND_INTERVAL,
        };
        if !due {
            return None;
        }
        if pending.last_sent.is_some() {
            log::warn!("retransmitting reliable message seq {}", pending.sequence);
        }
        pending.last_sent = Some(now);
        Some((pending.sequence, pending.payload.as_slice()))
    }

    /// Clears the in-flight message once the peer acks its sequence.
    pub fn on_ack(&mut self, acked_seq: u16) {
        if self.pending.as_ref().is_some_and(|p| p.sequence == acked_seq) {
            self.pending = None;
        }
    }

    /// Folds an inbound reliable message. Returns `true` exactly once per
    /// distinct sequence: a wrap-aware comparison against the last accepted
    /// sequence (§4.4), not plain inequality, so an old reordered duplicate
    /// is discarded rather than redelivered. The caller should ack
    /// `sequence` regardless.
    pub fn on_receive(&mut self, sequence: u16) -> bool {
        let baseline = self
            .last_received_seq
            .unwrap_or(sequence.wrapping_sub(1));
        if !crate::protocol::sequence_more_recent(sequence, baseline) {
            return false;
        }
        self.last_received_seq = Some(sequence);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_blocks_until_acked() {
        let mut channel = ReliableChannel::new();
        assert!(channel.queue(vec![1, 2, 3]));
        assert!(!channel.queue(vec![4, 5, 6]));
        channel.on_ack(0);
        assert!(channel.queue(vec![4, 5, 6]));
    }

    #[test]
    fn resends_after_interval() {
        let mut channel = ReliableChannel::new();
        channel.queue(vec![9]);
        let t0 = Instant::now();
        let (seq, payload) = channel.poll_send(t0).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(payload, &[9]);

        assert!(channel.poll_send(t0).is_none());
        let (seq2, _) = channel
            .poll_send(t0 + RESEND_INTERVAL)
            .expect("should resend once due");
        assert_eq!(seq2, 0);
    }

    #[test]
    fn receive_dedups_by_sequence() {
        let mut channel = ReliableChannel::new();
        assert!(channel.on_receive(5));
        assert!(!channel.on_receive(5));
        assert!(channel.on_receive(6));
    }

    #[test]
    fn receive_rejects_old_reordered_duplicate() {
        let mut channel = ReliableChannel::new();
        assert!(channel.on_receive(10));
        assert!(channel.on_receive(11));
        // a stale retransmit of an earlier sequence arrives after a newer
        // one was already accepted
        assert!(!channel.on_receive(9));
        assert!(!channel.on_receive(10));
        assert!(channel.on_receive(12));
    }

    #[test]
    fn receive_accepts_wraparound_sequence() {
        let mut channel = ReliableChannel::new();
        assert!(channel.on_receive(u16::MAX));
        assert!(channel.on_receive(0));
        assert!(!channel.on_receive(u16::MAX));
    }
}
