use nix::sys::time::TimeSpec;
use nix::time::{ClockId, clock_gettime};

#[cfg(any(target_os = "linux", target_os = "android"))]
const DEVICE_CLOCK: ClockId = ClockId::CLOCK_MONOTONIC_RAW;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const DEVICE_CLOCK: ClockId = ClockId::CLOCK_MONOTONIC;

pub const ZERO: TimeSpec = TimeSpec::new(0, 0);

/// Current time on the clock device timestamps are taken from.
pub fn now() -> TimeSpec {
    clock_gettime(DEVICE_CLOCK).unwrap_or(ZERO)
}

fn to_nanos(ts: TimeSpec) -> i128 {
    ts.tv_sec() as i128 * 1_000_000_000_i128 + ts.tv_nsec() as i128
}

pub fn frames_between(from: TimeSpec, to: TimeSpec, sample_rate: usize) -> u64 {
    let ns = (to_nanos(to) - to_nanos(from)).max(0);
    ((ns * sample_rate as i128) / 1_000_000_000_i128) as u64
}

/// Counts frames at a nominal rate from a fixed starting instant.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    zero: TimeSpec,
    sample_rate: usize,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self {
            zero: ZERO,
            sample_rate: 48_000,
        }
    }
}

impl FrameClock {
    pub fn init_clock(&mut self, sample_rate: usize) -> bool {
        if sample_rate == 0 {
            return false;
        }
        self.sample_rate = sample_rate;
        self.zero = now();
        true
    }

    pub fn start_time(&self) -> TimeSpec {
        self.zero
    }

    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    pub fn frames_since_start(&self) -> u64 {
        frames_between(self.zero, now(), self.sample_rate)
    }
}
