//! Client-side wall-clock synchronization against the server's tick clock
//! (§4.6): ping/pong sampling, a bounded history with median-based outlier
//! rejection, and a smoothed offset/RTT estimate.

use std::collections::VecDeque;
use std::time::Duration;

pub const SAMPLE_WINDOW: usize = 16;
pub const CONVERGE_COUNT: u32 = 4;
pub const SYNC_FAST: Duration = Duration::from_millis(100);
pub const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Floor applied to the median RTT before doubling it into the outlier
/// threshold, so a string of near-zero-RTT loopback samples can't collapse
/// the threshold to zero and discard everything (§4.6).
const MIN_MEDIAN_RTT_SECS: f64 = 0.001;

fn median(values: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Tracks this client's estimate of `server_time - local_time`, refined by
/// one ping/pong round trip at a time.
pub struct ClockSync {
    offsets: VecDeque<f64>,
    rtts: VecDeque<f64>,
    smoothed_offset: f64,
    smoothed_rtt: f64,
    sample_count: u32,
    synced: bool,
}

impl ClockSync {
    pub fn new() -> Self {
        Self {
            offsets: VecDeque::with_capacity(SAMPLE_WINDOW),
            rtts: VecDeque::with_capacity(SAMPLE_WINDOW),
            smoothed_offset: 0.0,
            smoothed_rtt: 0.0,
            sample_count: 0,
            synced: false,
        }
    }

    /// Folds one ping/pong round trip into the estimate. `client_send_time`
    /// and `client_receive_time` are local clock readings; `server_time` is
    /// the server's clock reading echoed back in the response.
    ///
    /// Outlier rejection: the median RTT of the current window is computed,
    /// floored at [`MIN_MEDIAN_RTT_SECS`], and samples whose RTT exceeds
    /// twice that median are excluded from the smoothed offset/RTT average.
    /// Convergence is purely a function of total sample count reaching
    /// [`CONVERGE_COUNT`]; it never regresses once reached, even if a later
    /// sample is rejected as an outlier (§4.6).
    pub fn record_sample(
        &mut self,
        client_send_time: f64,
        client_receive_time: f64,
        server_time: f64,
    ) {
        let rtt = (client_receive_time - client_send_time).max(0.0);
        let offset = server_time - (client_send_time + rtt / 2.0);

        if self.offsets.len() == SAMPLE_WINDOW {
            self.offsets.pop_front();
            self.rtts.pop_front();
        }
        self.offsets.push_back(offset);
        self.rtts.push_back(rtt);
        self.sample_count += 1;

        let threshold = 2.0 * median(&self.rtts).max(MIN_MEDIAN_RTT_SECS);
        let mut offset_sum = 0.0;
        let mut rtt_sum = 0.0;
        let mut survivors = 0u32;
        for (&o, &r) in self.offsets.iter().zip(self.rtts.iter()) {
            if r <= threshold {
                offset_sum += o;
                rtt_sum += r;
                survivors += 1;
            }
        }
        if survivors > 0 {
            self.smoothed_offset = offset_sum / survivors as f64;
            self.smoothed_rtt = rtt_sum / survivors as f64;
        }

        let was_synced = self.synced;
        if self.sample_count >= CONVERGE_COUNT {
            self.synced = true;
        }
        if self.synced && !was_synced {
            log::debug!(
                "clock sync converged: offset {:.1}ms, rtt {:.1}ms",
                self.smoothed_offset * 1000.0,
                self.smoothed_rtt * 1000.0
            );
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn offset_secs(&self) -> f64 {
        self.smoothed_offset
    }

    pub fn rtt_secs(&self) -> f64 {
        self.smoothed_rtt
    }

    pub fn rtt_ms(&self) -> f64 {
        self.smoothed_rtt * 1000.0
    }

    pub fn server_time_for(&self, local_time: f64) -> f64 {
        local_time + self.smoothed_offset
    }

    /// How often to send the next ping: fast while still converging, slow
    /// once the estimate has settled.
    pub fn next_sync_interval(&self) -> Duration {
        if self.synced {
            SYNC_INTERVAL
        } else {
            SYNC_FAST
        }
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_after_consistent_samples() {
        let mut clock = ClockSync::new();
        for _ in 0..CONVERGE_COUNT {
            // symmetric 20ms rtt, true offset of 5.0s
            clock.record_sample(100.0, 100.020, 105.010);
        }
        assert!(clock.is_synced());
        assert!((clock.offset_secs() - 5.0).abs() < 0.001);
        assert_eq!(clock.next_sync_interval(), SYNC_INTERVAL);
    }

    #[test]
    fn stays_unsynced_and_fast_before_converging() {
        let mut clock = ClockSync::new();
        clock.record_sample(100.0, 100.020, 105.010);
        assert!(!clock.is_synced());
        assert_eq!(clock.next_sync_interval(), SYNC_FAST);
    }

    #[test]
    fn outlier_sample_is_excluded_from_smoothed_average_but_convergence_does_not_regress() {
        let mut clock = ClockSync::new();
        // three consistent 20ms-rtt samples, true offset 5.0s
        for _ in 0..3 {
            clock.record_sample(100.0, 100.020, 105.010);
        }
        // a wildly larger rtt sample, rejected by the 2x-median threshold
        clock.record_sample(200.0, 200.500, 250.350);

        assert!((clock.offset_secs() - 5.0).abs() < 0.001);
        // sample count alone drives convergence; it does not reset because
        // the fourth sample was an outlier
        assert!(clock.is_synced());
    }

    #[test]
    fn window_is_bounded() {
        let mut clock = ClockSync::new();
        for i in 0..(SAMPLE_WINDOW * 2) {
            clock.record_sample(i as f64, i as f64 + 0.02, i as f64 + 5.01);
        }
        assert!(clock.offsets.len() <= SAMPLE_WINDOW);
    }
}
