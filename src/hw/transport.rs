use crate::chmap::ChannelMapCandidate;
use crate::format::{Direction, SampleFormat};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use std::time::Duration;
use tracing::{debug, warn};

pub type TransportResult<T> = std::result::Result<T, Errno>;

pub const OPEN_ATTEMPTS: usize = 3;
pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One mapped window returned by [`PcmTransport::mmap_begin`].
///
/// `addr` is the base of the whole ring buffer (may be null on a broken
/// transport); `offset` and `frames` select the window inside it.
#[derive(Debug, Clone, Copy)]
pub struct MmapArea {
    pub addr: *mut u8,
    pub offset: usize,
    pub frames: usize,
}

/// Capability set of a PCM backend.
///
/// Hardware parameters are staged: `hw_params_any` resets the staging space,
/// the `hw_set_*` calls refine it, and nothing reaches the device until
/// `hw_params_apply`. Software parameters follow the same pattern.
pub trait PcmTransport: Send {
    fn name(&self) -> &str;
    fn direction(&self) -> Direction;

    fn open(&mut self) -> TransportResult<()>;
    fn close(&mut self) -> TransportResult<()>;
    fn start(&mut self) -> TransportResult<()>;
    fn drain(&mut self) -> TransportResult<()>;
    fn prepare(&mut self) -> TransportResult<()>;
    fn resume(&mut self) -> TransportResult<()>;
    fn recover(&mut self, err: Errno) -> TransportResult<()>;

    fn hw_params_any(&mut self) -> TransportResult<()>;
    fn hw_test_rate(&self, rate: u32) -> bool;
    fn hw_test_channels(&self, channels: u32) -> bool;
    fn hw_test_format(&self, format: SampleFormat) -> bool;
    fn hw_channels_max(&self) -> TransportResult<u32>;
    fn hw_set_rate_resample(&mut self, enable: bool) -> TransportResult<()>;
    fn hw_set_access_mmap_interleaved(&mut self) -> TransportResult<()>;
    fn hw_can_disable_period_wakeup(&self) -> bool;
    fn hw_set_period_wakeup(&mut self, enable: bool) -> TransportResult<()>;
    /// Returns the period time actually chosen, in microseconds.
    fn hw_set_period_time_near(&mut self, period_us: u32) -> TransportResult<u32>;
    fn hw_set_format(&mut self, format: SampleFormat) -> TransportResult<()>;
    /// Returns the rate actually chosen.
    fn hw_set_rate_near(&mut self, rate: u32) -> TransportResult<u32>;
    fn hw_set_channels(&mut self, channels: u32) -> TransportResult<()>;
    fn hw_buffer_size_max(&self) -> TransportResult<usize>;
    fn hw_set_buffer_size_max(&mut self, frames: usize) -> TransportResult<usize>;
    fn hw_params_apply(&mut self) -> TransportResult<()>;

    fn sw_params_current(&mut self) -> TransportResult<()>;
    fn sw_boundary(&self) -> TransportResult<usize>;
    fn sw_set_stop_threshold(&mut self, frames: usize) -> TransportResult<()>;
    fn sw_set_start_threshold(&mut self, frames: usize) -> TransportResult<()>;
    fn sw_set_period_event(&mut self, enable: bool) -> TransportResult<()>;
    fn sw_params_apply(&mut self) -> TransportResult<()>;

    /// Frames the application can write (playback) or read (capture).
    /// Playback values above the buffer size mean the hardware pointer ran
    /// past the application pointer.
    fn avail(&mut self) -> TransportResult<usize>;
    fn htimestamp(&mut self) -> TransportResult<(usize, TimeSpec)>;
    fn delay(&mut self) -> TransportResult<i64>;
    fn forward(&mut self, frames: usize) -> TransportResult<usize>;
    fn rewind(&mut self, frames: usize) -> TransportResult<usize>;
    /// Currently applied `(buffer_frames, period_frames)`.
    fn buffer_params(&self) -> TransportResult<(usize, usize)>;

    fn mmap_begin(&mut self, frames: usize) -> TransportResult<MmapArea>;
    /// Returns how many frames the transport accepted.
    fn mmap_commit(&mut self, offset: usize, frames: usize) -> TransportResult<usize>;

    fn query_chmaps(&self) -> Option<Vec<ChannelMapCandidate>>;
    fn set_chmap(&mut self, positions: &[u32]) -> TransportResult<()>;
}

/// Runs `open` until it stops failing with `EBUSY`, at most
/// [`OPEN_ATTEMPTS`] times with [`OPEN_RETRY_DELAY`] between tries.
pub fn retry_busy<T>(
    name: &str,
    mut open: impl FnMut() -> TransportResult<T>,
) -> TransportResult<T> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match open() {
            Err(Errno::EBUSY) if attempt < OPEN_ATTEMPTS => {
                debug!("{name} busy, retrying open");
                std::thread::sleep(OPEN_RETRY_DELAY);
            }
            Err(e) => {
                warn!("Failed to open PCM '{name}': {e}");
                return Err(e);
            }
            Ok(v) => return Ok(v),
        }
    }
}
