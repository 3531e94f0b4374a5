use super::list::DeviceList;
use super::loopback::TapPoint;
use super::{BufferRegion, DeviceId, IoBackend};
use crate::chmap;
use crate::clock;
use crate::config::IoOptions;
use crate::error::{IoError, Result};
use crate::format::{AudioFormat, Direction};
use crate::hw::avail::{self, UnderrunLog};
use crate::hw::mmap::{self, RingBufferRegion};
use crate::hw::params::{self, HardwareCapabilities};
use crate::hw::PcmTransport;
use nix::sys::time::TimeSpec;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A device backed by a PCM transport's mmap ring buffer.
pub struct HardwareBackend {
    id: DeviceId,
    name: String,
    list: Arc<DeviceList>,
    transport: Box<dyn PcmTransport>,
    options: IoOptions,
    caps: Option<HardwareCapabilities>,
    format: Option<AudioFormat>,
    buffer_size: usize,
    running: bool,
    start_time: TimeSpec,
    pending: Option<RingBufferRegion>,
    underrun_log: UnderrunLog,
    active_node: Option<(u32, bool)>,
}

impl HardwareBackend {
    pub fn new(
        id: DeviceId,
        list: &Arc<DeviceList>,
        transport: Box<dyn PcmTransport>,
        options: IoOptions,
    ) -> Self {
        Self {
            id,
            name: transport.name().to_string(),
            list: list.clone(),
            transport,
            options,
            caps: None,
            format: None,
            buffer_size: 0,
            running: false,
            start_time: clock::ZERO,
            pending: None,
            underrun_log: UnderrunLog::default(),
            active_node: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.transport.direction()
    }

    /// What the device reported during the last configure.
    pub fn capabilities(&self) -> Option<&HardwareCapabilities> {
        self.caps.as_ref()
    }

    pub fn start_time(&self) -> TimeSpec {
        self.start_time
    }

    pub fn active_node(&self) -> Option<(u32, bool)> {
        self.active_node
    }

    fn frame_bytes(&self) -> usize {
        self.format.as_ref().map_or(0, AudioFormat::frame_bytes)
    }

    fn available(&mut self) -> Result<(usize, TimeSpec)> {
        avail::available_frames(
            self.transport.as_mut(),
            self.buffer_size,
            self.options.severe_underrun_frames,
            &self.name,
            &mut self.underrun_log,
        )
    }

    fn start(&mut self) -> Result<()> {
        self.transport
            .start()
            .map_err(|e| IoError::transport("pcm_start", e))?;
        self.running = true;
        self.list.set_device_started(self.id, true);
        Ok(())
    }
}

impl IoBackend for HardwareBackend {
    fn configure(&mut self, fmt: &mut AudioFormat) -> Result<usize> {
        let t = self.transport.as_mut();
        t.open().map_err(|e| IoError::transport("pcm_open", e))?;

        let caps = params::probe(t)?;
        if !caps.supports(fmt) {
            return Err(IoError::Negotiation(format!(
                "{}: {}Hz {}ch {:?} not supported",
                t.name(),
                fmt.frame_rate,
                fmt.num_channels,
                fmt.format
            )));
        }
        self.caps = Some(caps);

        let buffer_size = params::commit(
            t,
            fmt,
            self.options.buffer_frames,
            self.options.period_wakeup,
            self.options.dma_period_time(),
        )?;
        params::commit_sw_params(t)?;

        match t.direction() {
            Direction::Output => {
                chmap::set_channel_map(t, fmt);
            }
            Direction::Input if fmt.num_channels > 2 => {
                if let Err(e) = chmap::get_channel_map(t, fmt) {
                    warn!("{}: {e}, using default channel layout", t.name());
                    fmt.set_default_channel_layout();
                }
            }
            Direction::Input => {}
        }

        t.prepare().map_err(|e| IoError::transport("pcm_prepare", e))?;
        self.buffer_size = buffer_size;
        self.format = Some(fmt.clone());
        self.start_time = clock::now();
        self.running = false;
        info!(
            "{}: configured {}Hz {}ch {:?}, buffer {buffer_size}",
            t.name(),
            fmt.frame_rate,
            fmt.num_channels,
            fmt.format
        );

        // Playback waits for the first samples; capture runs right away.
        if t.direction() == Direction::Input {
            self.start()?;
        }
        Ok(buffer_size)
    }

    fn close(&mut self) -> Result<()> {
        self.pending = None;
        let was_running = std::mem::take(&mut self.running);
        let res = self
            .transport
            .close()
            .map_err(|e| IoError::transport("pcm_close", e));
        if was_running {
            self.list.set_device_started(self.id, false);
        }
        self.caps = None;
        self.format = None;
        self.buffer_size = 0;
        res
    }

    fn get_buffer(&mut self, frames: usize) -> Result<BufferRegion<'_>> {
        self.pending = None;
        let (avail, _) = self.available()?;
        // A full playback ring (or empty capture ring) is not a fault.
        if avail == 0 || frames == 0 {
            return Ok(BufferRegion {
                bytes: &mut [],
                frames: 0,
            });
        }
        let frame_bytes = self.frame_bytes();
        let region = mmap::begin(self.transport.as_mut(), frame_bytes, frames.min(avail))?;
        let ptr = region.ptr();
        let len = region.len_bytes();
        let granted = region.frames;
        self.pending = Some(region);
        // SAFETY: the window stays mapped until it is committed, and the
        // returned borrow ends before the next call that could commit it.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        Ok(BufferRegion {
            bytes,
            frames: granted,
        })
    }

    fn put_buffer(&mut self, frames: usize) -> Result<()> {
        let Some(region) = self.pending.take() else {
            // Nothing was mapped for an empty grant.
            if frames == 0 {
                return Ok(());
            }
            return Err(IoError::InvalidState("no buffer outstanding"));
        };
        if frames > region.frames {
            let granted = region.frames;
            self.pending = Some(region);
            return Err(IoError::InvalidArgument(format!(
                "put {frames} frames, {granted} granted"
            )));
        }
        let output = self.direction() == Direction::Output;
        if output
            && frames > 0
            && let Some(fmt) = self.format.as_ref()
        {
            let len = frames * fmt.frame_bytes();
            // SAFETY: `frames` is within the window granted by begin.
            let bytes = unsafe { std::slice::from_raw_parts(region.ptr(), len) };
            self.list
                .run_sample_hooks(self.id, TapPoint::PostDsp, bytes, frames, fmt);
        }
        region.commit(self.transport.as_mut(), frames)?;
        if output && frames > 0 && !self.running {
            self.start()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        if self.direction() == Direction::Output {
            return Ok(0);
        }
        let (avail, _) = self.available()?;
        self.transport
            .forward(avail)
            .map_err(|e| IoError::transport("pcm_forward", e))
    }

    fn frames_queued(&mut self) -> Result<(usize, TimeSpec)> {
        let (avail, tstamp) = self.available()?;
        let queued = match self.direction() {
            Direction::Output => self.buffer_size.saturating_sub(avail),
            Direction::Input => avail,
        };
        Ok((queued, tstamp))
    }

    fn delay_frames(&mut self) -> Result<usize> {
        avail::delay_frames(self.transport.as_mut(), self.buffer_size)
    }

    fn update_active_node(&mut self, node: u32, enabled: bool) {
        debug!("{}: node {node} enabled={enabled}", self.transport.name());
        self.active_node = Some((node, enabled));
    }

    fn update_channel_layout(&mut self, fmt: &mut AudioFormat) -> Result<()> {
        // Mono and stereo never carry a committed map.
        if fmt.num_channels <= 2 {
            return Ok(());
        }
        chmap::get_channel_map(self.transport.as_mut(), fmt)?;
        self.format = Some(fmt.clone());
        Ok(())
    }

    /// Zeroes the ring and puts the application pointer just ahead of the
    /// hardware, so stale samples are not replayed after an underrun.
    fn output_underrun(&mut self) -> Result<()> {
        if self.direction() != Direction::Output {
            return Ok(());
        }
        let base = mmap::whole_buffer(self.transport.as_mut())?;
        let len = self.buffer_size * self.frame_bytes();
        // SAFETY: the mapping spans `buffer_size` frames while the PCM is open.
        unsafe { std::ptr::write_bytes(base, 0, len) };
        let moved = avail::resume_appl_ptr(self.transport.as_mut(), self.options.min_buffer_level)?;
        debug!("{}: appl_ptr moved by {moved} after underrun", self.transport.name());
        Ok(())
    }
}
