//! Windowed delivery: send windows, acknowledgement tracking and poll pacing
//!
//! DNS only lets the server speak when asked, so both directions use the same
//! shape: the sender keeps at most `window` fragments unacknowledged, the
//! receiver reports the highest contiguous sequence it holds, and anything
//! unacknowledged past its retransmit deadline goes out again before new data.

use crate::fragment::{fragment_packet, Fragment};
use crate::TunnelError;
use log::{debug, warn};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Lower bound on the retransmit timeout
pub const MIN_RTO: Duration = Duration::from_millis(100);

/// Upper bound on the retransmit timeout
pub const MAX_RTO: Duration = Duration::from_secs(10);

/// Out-of-order sequences a receiver keeps ahead of its cumulative ack
pub const MAX_OUT_OF_ORDER: u16 = 256;

/// `a` precedes `b` in wrapping sequence space
pub fn seq_lt(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// `a` precedes or equals `b` in wrapping sequence space
pub fn seq_le(a: u16, b: u16) -> bool {
    a == b || seq_lt(a, b)
}

/// RTT estimator (RFC 6298 EWMA)
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    initial: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            initial: initial_rto.clamp(MIN_RTO, MAX_RTO),
        }
    }

    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                // RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|, SRTT = 7/8 SRTT + 1/8 R
                self.rttvar = self.rttvar * 3 / 4 + delta / 4;
                self.srtt = Some(srtt * 7 / 8 + rtt / 8);
            }
        }
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Current retransmit timeout
    pub fn rto(&self) -> Duration {
        match self.srtt {
            Some(srtt) => (srtt + self.rttvar * 4).clamp(MIN_RTO, MAX_RTO),
            None => self.initial,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    fragment: Fragment,
    sent_at: Instant,
    deadline: Instant,
    retries: u32,
}

/// Sender side of one direction
#[derive(Debug)]
pub struct SendWindow {
    pending: VecDeque<Fragment>,
    in_flight: VecDeque<InFlight>,
    window: usize,
    max_queued: usize,
    next_seq: u16,
    next_packet: u16,
    rtt: RttEstimator,
}

impl SendWindow {
    pub fn new(window: usize, max_queued: usize, initial_rto: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            window: window.max(1),
            max_queued,
            next_seq: 0,
            next_packet: 0,
            rtt: RttEstimator::new(initial_rto),
        }
    }

    /// Fragment `packet` at `capacity` bytes per fragment and queue it.
    ///
    /// Returns `Ok(false)` when the queue has no room for the whole packet;
    /// the packet is dropped and the queue is left untouched.
    pub fn push_packet(&mut self, packet: &[u8], capacity: usize) -> Result<bool, TunnelError> {
        let fragments = fragment_packet(packet, self.next_packet, self.next_seq, capacity)?;
        if self.pending.len() + fragments.len() > self.max_queued {
            warn!(
                "Send queue full ({} queued), dropping {}-byte packet",
                self.pending.len(),
                packet.len()
            );
            return Ok(false);
        }

        self.next_seq = self.next_seq.wrapping_add(fragments.len() as u16);
        self.next_packet = self.next_packet.wrapping_add(1);
        self.pending.extend(fragments);
        Ok(true)
    }

    /// Next fragment to transmit: an expired in-flight fragment first, then a
    /// new one if the window has room.
    pub fn next(&mut self, now: Instant) -> Option<Fragment> {
        let rto = self.rtt.rto();
        if let Some(entry) = self.in_flight.iter_mut().find(|f| f.deadline <= now) {
            entry.retries += 1;
            let backoff = rto.saturating_mul(1 << entry.retries.min(6));
            entry.deadline = now + backoff.min(MAX_RTO);
            debug!(
                "Retransmitting seq {} (attempt {})",
                entry.fragment.seq,
                entry.retries + 1
            );
            return Some(entry.fragment.clone());
        }

        if self.in_flight.len() >= self.window {
            return None;
        }
        let fragment = self.pending.pop_front()?;
        self.in_flight.push_back(InFlight {
            fragment: fragment.clone(),
            sent_at: now,
            deadline: now + rto,
            retries: 0,
        });
        Some(fragment)
    }

    /// Release every in-flight fragment up to and including `seq`
    pub fn ack(&mut self, seq: u16, now: Instant) -> usize {
        let before = self.in_flight.len();
        let rtt = &mut self.rtt;
        self.in_flight.retain(|f| {
            if !seq_le(f.fragment.seq, seq) {
                return true;
            }
            // Karn: retransmitted fragments give ambiguous samples
            if f.retries == 0 {
                rtt.sample(now.saturating_duration_since(f.sent_at));
            }
            false
        });
        before - self.in_flight.len()
    }

    /// Fragments not yet acknowledged, queued or in flight
    pub fn backlog(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Fragments never sent yet
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.backlog() == 0
    }

    /// Earliest retransmit deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.iter().map(|f| f.deadline).min()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }
}

/// Receiver side of one direction
#[derive(Debug, Default)]
pub struct ReceiveTracker {
    next_expected: u16,
    out_of_order: HashSet<u16>,
    received_any: bool,
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq`; returns `false` for duplicates and sequences too far
    /// ahead to track
    pub fn accept(&mut self, seq: u16) -> bool {
        if seq_lt(seq, self.next_expected) {
            return false;
        }
        if seq.wrapping_sub(self.next_expected) >= MAX_OUT_OF_ORDER {
            debug!("Sequence {} too far ahead of {}", seq, self.next_expected);
            return false;
        }
        if seq != self.next_expected {
            return self.out_of_order.insert(seq);
        }

        self.received_any = true;
        self.next_expected = self.next_expected.wrapping_add(1);
        while self.out_of_order.remove(&self.next_expected) {
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        true
    }

    /// Highest contiguous sequence received
    pub fn ack(&self) -> Option<u16> {
        self.received_any.then(|| self.next_expected.wrapping_sub(1))
    }
}

/// Adaptive poll interval
#[derive(Debug, Clone)]
pub struct PollPacer {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl PollPacer {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    pub fn interval(&self) -> Duration {
        self.current
    }

    /// Traffic flowed or the server has more queued; poll eagerly
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// Nothing happened; back off up to the keepalive interval
    pub fn backoff(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTO: Duration = Duration::from_secs(1);

    #[test]
    fn test_seq_compare_wraps() {
        assert!(seq_lt(1, 2));
        assert!(seq_lt(u16::MAX, 0));
        assert!(!seq_lt(0, u16::MAX));
        assert!(seq_le(5, 5));
        assert!(!seq_le(6, 5));
    }

    #[test]
    fn test_window_bounds_in_flight() {
        let now = Instant::now();
        let mut w = SendWindow::new(2, 64, RTO);
        assert!(w.push_packet(&[0u8; 500], 100).unwrap());
        assert_eq!(w.backlog(), 5);

        assert_eq!(w.next(now).map(|f| f.seq), Some(0));
        assert_eq!(w.next(now).map(|f| f.seq), Some(1));
        assert!(w.next(now).is_none());
        assert_eq!(w.in_flight(), 2);
    }

    #[test]
    fn test_cumulative_ack_releases() {
        let now = Instant::now();
        let mut w = SendWindow::new(4, 64, RTO);
        w.push_packet(&[0u8; 600], 100).unwrap();
        for _ in 0..4 {
            assert!(w.next(now).is_some());
        }

        assert_eq!(w.ack(1, now), 2);
        assert_eq!(w.in_flight(), 2);
        assert_eq!(w.backlog(), 4);
        // stale ack changes nothing
        assert_eq!(w.ack(0, now), 0);

        assert_eq!(w.next(now).map(|f| f.seq), Some(4));
        assert_eq!(w.next(now).map(|f| f.seq), Some(5));
        assert_eq!(w.ack(5, now), 4);
        assert!(w.is_idle());
    }

    #[test]
    fn test_expired_fragment_resent_first() {
        let start = Instant::now();
        let mut w = SendWindow::new(1, 64, RTO);
        w.push_packet(&[1u8; 200], 100).unwrap();

        assert_eq!(w.next(start).map(|f| f.seq), Some(0));
        assert!(w.next(start + RTO / 2).is_none());
        assert_eq!(w.next_deadline(), Some(start + RTO));

        let later = start + RTO;
        assert_eq!(w.next(later).map(|f| f.seq), Some(0));
        assert!(w.next(later).is_none());

        w.ack(0, later);
        assert_eq!(w.next(later).map(|f| f.seq), Some(1));
        // the retransmitted fragment gave no sample
        assert!(w.rtt().srtt().is_none());
    }

    #[test]
    fn test_queue_overflow_drops_packet() {
        let mut w = SendWindow::new(1, 4, RTO);
        assert!(w.push_packet(&[0u8; 300], 100).unwrap());
        assert!(!w.push_packet(&[0u8; 200], 100).unwrap());
        assert_eq!(w.backlog(), 3);
        assert!(w.push_packet(&[0u8; 50], 100).unwrap());
        assert_eq!(w.backlog(), 4);
    }

    #[test]
    fn test_rtt_estimator() {
        let mut rtt = RttEstimator::new(Duration::from_secs(2));
        assert_eq!(rtt.rto(), Duration::from_secs(2));

        rtt.sample(Duration::from_millis(400));
        assert_eq!(rtt.srtt(), Some(Duration::from_millis(400)));
        // 400 + 4 * 200
        assert_eq!(rtt.rto(), Duration::from_millis(1200));

        rtt.sample(Duration::from_millis(400));
        assert_eq!(rtt.rto(), Duration::from_millis(1000));

        let mut fast = RttEstimator::new(RTO);
        fast.sample(Duration::from_millis(1));
        assert_eq!(fast.rto(), MIN_RTO);
    }

    #[test]
    fn test_receive_tracker() {
        let mut r = ReceiveTracker::new();
        assert_eq!(r.ack(), None);

        assert!(r.accept(1));
        assert_eq!(r.ack(), None);
        assert!(r.accept(0));
        assert_eq!(r.ack(), Some(1));
        assert!(!r.accept(0));
        assert!(!r.accept(1));

        assert!(r.accept(3));
        assert!(!r.accept(3));
        assert_eq!(r.ack(), Some(1));
        assert!(r.accept(2));
        assert_eq!(r.ack(), Some(3));

        assert!(!r.accept(4 + MAX_OUT_OF_ORDER));
    }

    #[test]
    fn test_poll_pacer() {
        let mut p = PollPacer::new(Duration::from_millis(50), Duration::from_millis(300));
        assert_eq!(p.interval(), Duration::from_millis(50));
        p.backoff();
        p.backoff();
        assert_eq!(p.interval(), Duration::from_millis(200));
        p.backoff();
        assert_eq!(p.interval(), Duration::from_millis(300));
        p.reset();
        assert_eq!(p.interval(), Duration::from_millis(50));
    }
}
