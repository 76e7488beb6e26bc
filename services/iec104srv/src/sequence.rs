//! Send/receive sequence numbers, the k/w windows and the t1/t2/t3 timers
//!
//! The tracker is plain state owned by one connection task. It never does
//! I/O; the connection asks it what to stamp on outgoing frames and feeds it
//! every received N(S)/N(R). Timers are deadlines checked from the
//! connection's periodic tick and raced against every outgoing write.

use std::time::Duration;

use tokio::time::Instant;

use crate::codec::SEQ_MODULUS;
use crate::config::ApciParameters;
use crate::error::{IecError, IecResult, TimeoutKind};

/// `(a + n) mod 32768`
pub fn seq_add(a: u16, n: u16) -> u16 {
    ((u32::from(a) + u32::from(n)) % u32::from(SEQ_MODULUS)) as u16
}

/// Steps from `from` forward to `to` in the 15 bit space
pub fn seq_distance(from: u16, to: u16) -> u16 {
    ((u32::from(to) + u32::from(SEQ_MODULUS) - u32::from(from)) % u32::from(SEQ_MODULUS)) as u16
}

/// What the periodic tick asks the connection to send
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimerActions {
    /// t2 expired: acknowledge received I-frames with an S-frame
    pub send_ack: bool,
    /// t3 expired: check the peer with TESTFR ACT
    pub send_test_frame: bool,
}

#[derive(Debug)]
pub struct SequenceTracker {
    k: u16,
    w: u16,
    t1: Duration,
    t2: Duration,
    t3: Duration,
    /// V(S)
    send_seq: u16,
    /// V(R)
    recv_seq: u16,
    /// Oldest N(S) not yet acknowledged by the peer
    acked_seq: u16,
    /// Received I-frames we have not acknowledged yet
    unconfirmed_received: u16,
    t1_deadline: Option<Instant>,
    t2_deadline: Option<Instant>,
    t3_deadline: Instant,
    test_deadline: Option<Instant>,
}

impl SequenceTracker {
    pub fn new(params: &ApciParameters, now: Instant) -> Self {
        Self {
            k: params.k,
            w: params.w,
            t1: params.t1(),
            t2: params.t2(),
            t3: params.t3(),
            send_seq: 0,
            recv_seq: 0,
            acked_seq: 0,
            unconfirmed_received: 0,
            t1_deadline: None,
            t2_deadline: None,
            t3_deadline: now + params.t3(),
            test_deadline: None,
        }
    }

    pub fn send_seq(&self) -> u16 {
        self.send_seq
    }

    pub fn recv_seq(&self) -> u16 {
        self.recv_seq
    }

    /// Sent I-frames awaiting acknowledgment
    pub fn unacknowledged(&self) -> u16 {
        seq_distance(self.acked_seq, self.send_seq)
    }

    pub fn unconfirmed_received(&self) -> u16 {
        self.unconfirmed_received
    }

    /// Another I-frame fits in the k window
    pub fn can_send(&self) -> bool {
        self.unacknowledged() < self.k
    }

    /// Stamp an outgoing I-frame, returning `(N(S), N(R))`
    ///
    /// The frame's N(R) acknowledges everything received so far.
    pub fn next_send(&mut self, now: Instant) -> IecResult<(u16, u16)> {
        if !self.can_send() {
            return Err(IecError::ProtocolError(format!(
                "send window full ({} unacknowledged)",
                self.k
            )));
        }
        let stamped = (self.send_seq, self.recv_seq);
        self.send_seq = seq_add(self.send_seq, 1);
        if self.t1_deadline.is_none() {
            self.t1_deadline = Some(now + self.t1);
        }
        self.ack_sent();
        Ok(stamped)
    }

    /// An I-frame arrived with N(S) = `send_seq`
    ///
    /// Returns `true` once w frames are waiting for our acknowledgment.
    pub fn on_i_frame(&mut self, send_seq: u16, now: Instant) -> IecResult<bool> {
        if send_seq != self.recv_seq {
            return Err(IecError::SequenceMismatch {
                expected: self.recv_seq,
                received: send_seq,
            });
        }
        self.recv_seq = seq_add(self.recv_seq, 1);
        self.unconfirmed_received = self.unconfirmed_received.saturating_add(1);
        if self.t2_deadline.is_none() {
            self.t2_deadline = Some(now + self.t2);
        }
        Ok(self.unconfirmed_received >= self.w)
    }

    /// The peer acknowledged everything below `recv_seq`
    pub fn on_ack(&mut self, recv_seq: u16, now: Instant) -> IecResult<()> {
        let outstanding = self.unacknowledged();
        let acked = seq_distance(self.acked_seq, recv_seq);
        if acked > outstanding {
            return Err(IecError::InvalidAcknowledgment {
                received: recv_seq,
                acked: self.acked_seq,
                sent: self.send_seq,
            });
        }
        if acked == 0 {
            return Ok(());
        }

        self.acked_seq = recv_seq;
        self.t1_deadline = if self.unacknowledged() == 0 {
            None
        } else {
            Some(now + self.t1)
        };
        Ok(())
    }

    /// An S-frame (or an I-frame carrying V(R)) went out
    pub fn ack_sent(&mut self) {
        self.unconfirmed_received = 0;
        self.t2_deadline = None;
    }

    /// Any frame arrived from the peer
    pub fn on_activity(&mut self, now: Instant) {
        self.t3_deadline = now + self.t3;
    }

    pub fn test_frame_sent(&mut self, now: Instant) {
        self.test_deadline = Some(now + self.t1);
    }

    pub fn test_frame_confirmed(&mut self) {
        self.test_deadline = None;
    }

    pub fn test_frame_outstanding(&self) -> bool {
        self.test_deadline.is_some()
    }

    /// Evaluate all deadlines; errors are fatal for the connection
    pub fn poll_timers(&mut self, now: Instant) -> IecResult<TimerActions> {
        if self.t1_deadline.is_some_and(|deadline| now >= deadline) {
            return Err(IecError::TimeoutError(TimeoutKind::Acknowledge));
        }
        if self.test_deadline.is_some_and(|deadline| now >= deadline) {
            return Err(IecError::TimeoutError(TimeoutKind::TestFrame));
        }

        let mut actions = TimerActions::default();
        if self.t2_deadline.is_some_and(|deadline| now >= deadline) {
            actions.send_ack = true;
        }
        if self.test_deadline.is_none() && now >= self.t3_deadline {
            actions.send_test_frame = true;
            self.t3_deadline = now + self.t3;
        }
        Ok(actions)
    }

    /// Latest instant by which an outgoing write must complete
    ///
    /// The earliest armed t1 or TESTFR deadline wins. With nothing
    /// outstanding the write itself gets t1.
    pub fn write_deadline(&self, now: Instant) -> (Instant, TimeoutKind) {
        match (self.t1_deadline, self.test_deadline) {
            (Some(ack), Some(test)) if test < ack => (test, TimeoutKind::TestFrame),
            (Some(ack), _) => (ack, TimeoutKind::Acknowledge),
            (None, Some(test)) => (test, TimeoutKind::TestFrame),
            (None, None) => (now + self.t1, TimeoutKind::Acknowledge),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn params() -> ApciParameters {
        ApciParameters {
            k: 3,
            w: 2,
            t0_ms: 1_000,
            t1_ms: 15_000,
            t2_ms: 10_000,
            t3_ms: 20_000,
        }
    }

    #[test]
    fn test_seq_helpers_wrap() {
        assert_eq!(seq_add(32767, 1), 0);
        assert_eq!(seq_add(32760, 10), 2);
        assert_eq!(seq_distance(32766, 1), 3);
        assert_eq!(seq_distance(5, 5), 0);
    }

    #[test]
    fn test_send_numbers_are_consecutive_and_window_bounded() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);

        let mut previous = None;
        for _ in 0..3 {
            let (ns, _) = tracker.next_send(now).unwrap();
            if let Some(prev) = previous {
                assert_eq!(ns, seq_add(prev, 1));
            }
            previous = Some(ns);
            assert!(tracker.unacknowledged() <= 3);
        }
        assert!(!tracker.can_send());
        assert!(tracker.next_send(now).is_err());

        tracker.on_ack(2, now).unwrap();
        assert_eq!(tracker.unacknowledged(), 1);
        assert!(tracker.can_send());
    }

    #[test]
    fn test_send_sequence_wraps() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        tracker.send_seq = 32767;
        tracker.acked_seq = 32767;

        assert_eq!(tracker.next_send(now).unwrap().0, 32767);
        assert_eq!(tracker.next_send(now).unwrap().0, 0);
        assert_eq!(tracker.unacknowledged(), 2);
        tracker.on_ack(1, now).unwrap();
        assert_eq!(tracker.unacknowledged(), 0);
    }

    #[test]
    fn test_receive_sequence_mismatch() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        assert!(!tracker.on_i_frame(0, now).unwrap());
        let err = tracker.on_i_frame(2, now).unwrap_err();
        assert!(matches!(
            err,
            IecError::SequenceMismatch {
                expected: 1,
                received: 2
            }
        ));
    }

    #[test]
    fn test_w_threshold_requests_ack() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        assert!(!tracker.on_i_frame(0, now).unwrap());
        assert!(tracker.on_i_frame(1, now).unwrap());
        tracker.ack_sent();
        assert_eq!(tracker.unconfirmed_received(), 0);
        assert!(!tracker.on_i_frame(2, now).unwrap());
    }

    #[test]
    fn test_outgoing_i_frame_carries_ack() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        tracker.on_i_frame(0, now).unwrap();
        let (_, nr) = tracker.next_send(now).unwrap();
        assert_eq!(nr, 1);
        assert_eq!(tracker.unconfirmed_received(), 0);
        // t2 no longer pending
        let later = now + Duration::from_secs(11);
        tracker.on_ack(1, later).unwrap();
        assert!(!tracker.poll_timers(later).unwrap().send_ack);
    }

    #[test]
    fn test_invalid_ack_outside_window() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        tracker.next_send(now).unwrap();
        tracker.next_send(now).unwrap();

        assert!(tracker.on_ack(3, now).is_err());
        assert!(tracker.on_ack(32767, now).is_err());
        // duplicate of the current state is fine
        tracker.on_ack(0, now).unwrap();
        tracker.on_ack(2, now).unwrap();
        tracker.on_ack(2, now).unwrap();
    }

    #[test]
    fn test_t1_expiry_is_fatal() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        tracker.next_send(now).unwrap();

        assert_eq!(
            tracker.poll_timers(now + Duration::from_secs(14)).unwrap(),
            TimerActions::default()
        );
        let err = tracker
            .poll_timers(now + Duration::from_secs(15))
            .unwrap_err();
        assert!(matches!(err, IecError::TimeoutError(TimeoutKind::Acknowledge)));
    }

    #[test]
    fn test_partial_ack_restarts_t1() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        tracker.next_send(now).unwrap();
        tracker.next_send(now).unwrap();

        let ten = now + Duration::from_secs(10);
        tracker.on_ack(1, ten).unwrap();
        // would have expired at 15s without the restart
        tracker.on_activity(now + Duration::from_secs(20));
        assert!(tracker.poll_timers(now + Duration::from_secs(20)).is_ok());
        assert!(tracker.poll_timers(now + Duration::from_secs(25)).is_err());

        let mut tracker = SequenceTracker::new(&params(), now);
        tracker.next_send(now).unwrap();
        tracker.on_ack(1, ten).unwrap();
        tracker.on_activity(now + Duration::from_secs(60));
        assert!(tracker.poll_timers(now + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_t2_requests_ack() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        tracker.on_i_frame(0, now).unwrap();
        assert!(!tracker.poll_timers(now + Duration::from_secs(9)).unwrap().send_ack);
        assert!(tracker.poll_timers(now + Duration::from_secs(10)).unwrap().send_ack);
    }

    #[test]
    fn test_t3_idle_then_missing_test_confirmation() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);

        let idle = now + Duration::from_secs(20);
        let actions = tracker.poll_timers(idle).unwrap();
        assert!(actions.send_test_frame);
        tracker.test_frame_sent(idle);

        // no second TESTFR while one is outstanding
        assert!(!tracker
            .poll_timers(idle + Duration::from_secs(1))
            .unwrap()
            .send_test_frame);

        let err = tracker
            .poll_timers(idle + Duration::from_secs(15))
            .unwrap_err();
        assert!(matches!(err, IecError::TimeoutError(TimeoutKind::TestFrame)));
    }

    #[test]
    fn test_activity_postpones_t3_and_confirmation_clears() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        tracker.on_activity(now + Duration::from_secs(15));
        assert!(!tracker
            .poll_timers(now + Duration::from_secs(20))
            .unwrap()
            .send_test_frame);

        let idle = now + Duration::from_secs(35);
        assert!(tracker.poll_timers(idle).unwrap().send_test_frame);
        tracker.test_frame_sent(idle);
        tracker.test_frame_confirmed();
        assert!(!tracker.test_frame_outstanding());
        assert!(tracker.poll_timers(idle + Duration::from_secs(16)).is_ok());
    }

    #[test]
    fn test_write_deadline_follows_earliest_timer() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(&params(), now);
        assert_eq!(
            tracker.write_deadline(now),
            (now + Duration::from_secs(15), TimeoutKind::Acknowledge)
        );

        let stamped = now + Duration::from_secs(2);
        tracker.next_send(stamped).unwrap();
        let later = now + Duration::from_secs(5);
        assert_eq!(
            tracker.write_deadline(later),
            (stamped + Duration::from_secs(15), TimeoutKind::Acknowledge)
        );

        // TESTFR sent earlier than the I-frame times out first
        let mut tracker = SequenceTracker::new(&params(), now);
        tracker.test_frame_sent(now);
        tracker.next_send(stamped).unwrap();
        assert_eq!(
            tracker.write_deadline(later),
            (now + Duration::from_secs(15), TimeoutKind::TestFrame)
        );
    }
}
