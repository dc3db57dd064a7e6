//! Heartbeat scheduling and silent-disconnect detection.

use std::time::{Duration, Instant};

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of intervals without a pong before giving up.
pub const DEFAULT_TIMEOUT_MULTIPLIER: u32 = 5;

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Ping period.
    pub interval: Duration,
    /// Silence tolerated, in intervals.
    pub timeout_multiplier: u32,
}

impl LivenessConfig {
    /// Silence after which the peer is declared gone.
    pub fn timeout(&self) -> Duration {
        self.interval * self.timeout_multiplier
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout_multiplier: DEFAULT_TIMEOUT_MULTIPLIER,
        }
    }
}

/// What the owner should do after [`LivenessMonitor::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    /// Nothing due.
    Idle,
    /// Send a ping now.
    SendPing,
    /// No pong within the window. Reported once.
    TimedOut,
}

/// Tracks pings sent and pongs received for one connection.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    config: LivenessConfig,
    next_ping_at: Instant,
    last_pong_at: Instant,
    rtt: Option<Duration>,
    timed_out: bool,
}

impl LivenessMonitor {
    /// Start monitoring at `now`; the first ping is due immediately.
    pub fn new(config: LivenessConfig, now: Instant) -> Self {
        Self {
            config,
            next_ping_at: now,
            last_pong_at: now,
            rtt: None,
            timed_out: false,
        }
    }

    /// Advance timers.
    pub fn poll(&mut self, now: Instant) -> LivenessAction {
        if self.timed_out {
            return LivenessAction::Idle;
        }
        if now.saturating_duration_since(self.last_pong_at) >= self.config.timeout() {
            self.timed_out = true;
            return LivenessAction::TimedOut;
        }
        if now >= self.next_ping_at {
            self.next_ping_at = now + self.config.interval;
            return LivenessAction::SendPing;
        }
        LivenessAction::Idle
    }

    /// Record a pong for a ping that left at `ping_sent_at`.
    pub fn on_pong(&mut self, now: Instant, ping_sent_at: Instant) {
        if self.timed_out {
            return;
        }
        self.last_pong_at = now;
        let sample = now.saturating_duration_since(ping_sent_at);
        // exponential moving average, 1/8 weight like TCP's SRTT
        self.rtt = Some(match self.rtt {
            Some(previous) => (previous * 7 + sample) / 8,
            None => sample,
        });
    }

    /// Smoothed round-trip estimate.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Whether the timeout already fired.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(monitor: &mut LivenessMonitor, start: Instant, secs: u64, answer: bool) -> (u32, u32) {
        let mut pings = 0;
        let mut timeouts = 0;
        for step in 0..=secs * 10 {
            let now = start + Duration::from_millis(step * 100);
            match monitor.poll(now) {
                LivenessAction::SendPing => {
                    pings += 1;
                    if answer {
                        monitor.on_pong(now + Duration::from_millis(30), now);
                    }
                }
                LivenessAction::TimedOut => timeouts += 1,
                LivenessAction::Idle => {}
            }
        }
        (pings, timeouts)
    }

    #[test]
    fn silent_peer_times_out_exactly_once() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(LivenessConfig::default(), start);
        let (pings, timeouts) = run(&mut monitor, start, 20, false);
        assert_eq!(timeouts, 1);
        assert_eq!(pings, 5);
        assert!(monitor.is_timed_out());
        assert_eq!(monitor.poll(start + Duration::from_secs(60)), LivenessAction::Idle);
    }

    #[test]
    fn answered_pings_never_time_out() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(LivenessConfig::default(), start);
        let (pings, timeouts) = run(&mut monitor, start, 30, true);
        assert_eq!(timeouts, 0);
        assert!(pings >= 30);
        assert_eq!(monitor.rtt(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn timeout_is_multiplier_times_interval() {
        let config = LivenessConfig {
            interval: Duration::from_millis(200),
            timeout_multiplier: 5,
        };
        assert_eq!(config.timeout(), Duration::from_secs(1));

        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config, start);
        assert_eq!(monitor.poll(start), LivenessAction::SendPing);
        assert_eq!(
            monitor.poll(start + Duration::from_millis(999)),
            LivenessAction::SendPing
        );
        assert_eq!(
            monitor.poll(start + Duration::from_millis(1000)),
            LivenessAction::TimedOut
        );
    }
}
