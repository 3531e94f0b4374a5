use super::transport::{MmapArea, PcmTransport, TransportResult};
use crate::chmap::ChannelMapCandidate;
use crate::clock;
use crate::format::{Direction, SampleFormat};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// What the simulated card claims to support.
#[derive(Debug, Clone)]
pub struct SimCaps {
    pub rates: Vec<usize>,
    pub channels: Vec<usize>,
    pub channels_max: u32,
    pub formats: Vec<SampleFormat>,
    pub buffer_max: usize,
    pub period_frames: usize,
    pub can_disable_period_wakeup: bool,
    pub chmaps: Option<Vec<ChannelMapCandidate>>,
}

impl Default for SimCaps {
    fn default() -> Self {
        Self {
            rates: vec![44100, 48000],
            channels: vec![2],
            channels_max: 2,
            formats: vec![SampleFormat::S16LE],
            buffer_max: 4096,
            period_frames: 1024,
            can_disable_period_wakeup: true,
            chmaps: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimHwConfig {
    pub resample: bool,
    pub mmap_interleaved: bool,
    pub period_wakeup: bool,
    pub period_time_us: u32,
    pub format: Option<SampleFormat>,
    pub rate: u32,
    pub channels: u32,
    pub buffer_frames: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimSwConfig {
    pub stop_threshold: usize,
    pub start_threshold: usize,
    pub period_event: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub open: usize,
    pub close: usize,
    pub start: usize,
    pub prepare: usize,
    pub resume: usize,
    pub recover: usize,
    pub drain: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFault {
    Short(usize),
    Error(Errno),
}

#[derive(Debug, Default)]
struct SimState {
    caps: SimCaps,
    opened: bool,
    running: bool,
    staged: Option<SimHwConfig>,
    applied: Option<SimHwConfig>,
    sw_staged: Option<SimSwConfig>,
    sw_applied: Option<SimSwConfig>,
    ring: Vec<u8>,
    frame_bytes: usize,
    hw_ptr: u64,
    appl_ptr: u64,
    open_faults: VecDeque<Errno>,
    begin_faults: VecDeque<Errno>,
    commit_faults: VecDeque<CommitFault>,
    avail_faults: VecDeque<Errno>,
    htimestamp_faults: VecDeque<Errno>,
    resume_results: VecDeque<Errno>,
    recover_result: Option<Errno>,
    null_areas: bool,
    avail_override: Option<usize>,
    delay_override: Option<i64>,
    chmap_set: Option<Vec<u32>>,
    counters: SimCounters,
}

impl SimState {
    fn buffer_frames(&self) -> usize {
        self.applied.as_ref().map_or(0, |c| c.buffer_frames)
    }

    fn raw_avail(&self, direction: Direction) -> usize {
        let buffer = self.buffer_frames() as i64;
        let hw = self.hw_ptr as i64;
        let appl = self.appl_ptr as i64;
        let avail = match direction {
            Direction::Output => buffer + hw - appl,
            Direction::Input => hw - appl,
        };
        avail.max(0) as usize
    }

    fn staged_mut(&mut self) -> TransportResult<&mut SimHwConfig> {
        self.staged.as_mut().ok_or(Errno::EBADFD)
    }
}

/// In-memory PCM with a real ring buffer behind its mmap window.
///
/// Clones share the same card, so a test can keep a handle while a device
/// owns the transport.
#[derive(Debug, Clone)]
pub struct SimPcm {
    name: String,
    direction: Direction,
    state: Arc<Mutex<SimState>>,
}

impl SimPcm {
    pub fn new(name: &str, direction: Direction, caps: SimCaps) -> Self {
        Self {
            name: name.to_string(),
            direction,
            state: Arc::new(Mutex::new(SimState {
                caps,
                ..SimState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the hardware pointer: playback consumes, capture produces.
    pub fn advance(&self, frames: usize) {
        self.lock().hw_ptr += frames as u64;
    }

    /// Writes captured bytes at the hardware pointer and advances it.
    pub fn capture(&self, bytes: &[u8]) {
        let mut st = self.lock();
        let frame_bytes = st.frame_bytes.max(1);
        let buffer = st.buffer_frames();
        if buffer == 0 {
            return;
        }
        let frames = bytes.len() / frame_bytes;
        for frame in 0..frames {
            let slot = ((st.hw_ptr as usize + frame) % buffer) * frame_bytes;
            let src = &bytes[frame * frame_bytes..(frame + 1) * frame_bytes];
            st.ring[slot..slot + frame_bytes].copy_from_slice(src);
        }
        st.hw_ptr += frames as u64;
    }

    /// Bytes stored in the ring for `frames` frames starting at absolute
    /// frame position `from`.
    pub fn ring_frames(&self, from: u64, frames: usize) -> Vec<u8> {
        let st = self.lock();
        let buffer = st.buffer_frames();
        if buffer == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(frames * st.frame_bytes);
        for frame in 0..frames as u64 {
            let slot = ((from + frame) % buffer as u64) as usize * st.frame_bytes;
            out.extend_from_slice(&st.ring[slot..slot + st.frame_bytes]);
        }
        out
    }

    pub fn push_open_fault(&self, err: Errno) {
        self.lock().open_faults.push_back(err);
    }

    pub fn push_begin_fault(&self, err: Errno) {
        self.lock().begin_faults.push_back(err);
    }

    pub fn push_commit_fault(&self, fault: CommitFault) {
        self.lock().commit_faults.push_back(fault);
    }

    pub fn push_avail_fault(&self, err: Errno) {
        self.lock().avail_faults.push_back(err);
    }

    pub fn push_htimestamp_fault(&self, err: Errno) {
        self.lock().htimestamp_faults.push_back(err);
    }

    pub fn push_resume_result(&self, err: Errno) {
        self.lock().resume_results.push_back(err);
    }

    pub fn set_recover_result(&self, err: Option<Errno>) {
        self.lock().recover_result = err;
    }

    pub fn set_null_areas(&self, null: bool) {
        self.lock().null_areas = null;
    }

    pub fn set_avail(&self, avail: Option<usize>) {
        self.lock().avail_override = avail;
    }

    pub fn set_delay(&self, delay: Option<i64>) {
        self.lock().delay_override = delay;
    }

    pub fn counters(&self) -> SimCounters {
        self.lock().counters
    }

    pub fn applied(&self) -> Option<SimHwConfig> {
        self.lock().applied.clone()
    }

    pub fn sw_applied(&self) -> Option<SimSwConfig> {
        self.lock().sw_applied.clone()
    }

    pub fn boundary(&self) -> usize {
        self.lock().buffer_frames() << 20
    }

    pub fn chmap_set(&self) -> Option<Vec<u32>> {
        self.lock().chmap_set.clone()
    }

    pub fn is_open(&self) -> bool {
        self.lock().opened
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn appl_ptr(&self) -> u64 {
        self.lock().appl_ptr
    }

    pub fn hw_ptr(&self) -> u64 {
        self.lock().hw_ptr
    }
}

impl PcmTransport for SimPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn open(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        st.counters.open += 1;
        if let Some(err) = st.open_faults.pop_front() {
            return Err(err);
        }
        st.opened = true;
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        st.counters.close += 1;
        st.opened = false;
        st.running = false;
        st.staged = None;
        st.applied = None;
        st.sw_staged = None;
        st.sw_applied = None;
        Ok(())
    }

    fn start(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        st.counters.start += 1;
        if st.applied.is_none() {
            return Err(Errno::EBADFD);
        }
        st.running = true;
        Ok(())
    }

    fn drain(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        st.counters.drain += 1;
        st.running = false;
        Ok(())
    }

    fn prepare(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        st.counters.prepare += 1;
        if st.applied.is_none() {
            return Err(Errno::EBADFD);
        }
        st.running = false;
        Ok(())
    }

    fn resume(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        st.counters.resume += 1;
        match st.resume_results.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn recover(&mut self, _err: Errno) -> TransportResult<()> {
        let mut st = self.lock();
        st.counters.recover += 1;
        if let Some(err) = st.recover_result {
            return Err(err);
        }
        st.appl_ptr = st.hw_ptr;
        Ok(())
    }

    fn hw_params_any(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        if !st.opened {
            return Err(Errno::EBADFD);
        }
        st.staged = Some(SimHwConfig {
            resample: true,
            period_wakeup: true,
            ..SimHwConfig::default()
        });
        Ok(())
    }

    fn hw_test_rate(&self, rate: u32) -> bool {
        self.lock().caps.rates.contains(&(rate as usize))
    }

    fn hw_test_channels(&self, channels: u32) -> bool {
        self.lock().caps.channels.contains(&(channels as usize))
    }

    fn hw_test_format(&self, format: SampleFormat) -> bool {
        self.lock().caps.formats.contains(&format)
    }

    fn hw_channels_max(&self) -> TransportResult<u32> {
        Ok(self.lock().caps.channels_max)
    }

    fn hw_set_rate_resample(&mut self, enable: bool) -> TransportResult<()> {
        self.lock().staged_mut()?.resample = enable;
        Ok(())
    }

    fn hw_set_access_mmap_interleaved(&mut self) -> TransportResult<()> {
        self.lock().staged_mut()?.mmap_interleaved = true;
        Ok(())
    }

    fn hw_can_disable_period_wakeup(&self) -> bool {
        self.lock().caps.can_disable_period_wakeup
    }

    fn hw_set_period_wakeup(&mut self, enable: bool) -> TransportResult<()> {
        self.lock().staged_mut()?.period_wakeup = enable;
        Ok(())
    }

    fn hw_set_period_time_near(&mut self, period_us: u32) -> TransportResult<u32> {
        self.lock().staged_mut()?.period_time_us = period_us;
        Ok(period_us)
    }

    fn hw_set_format(&mut self, format: SampleFormat) -> TransportResult<()> {
        let mut st = self.lock();
        if !st.caps.formats.contains(&format) {
            return Err(Errno::EINVAL);
        }
        st.staged_mut()?.format = Some(format);
        Ok(())
    }

    fn hw_set_rate_near(&mut self, rate: u32) -> TransportResult<u32> {
        let mut st = self.lock();
        let nearest = st
            .caps
            .rates
            .iter()
            .copied()
            .min_by_key(|&r| (r as i64 - rate as i64).abs())
            .ok_or(Errno::EINVAL)? as u32;
        st.staged_mut()?.rate = nearest;
        Ok(nearest)
    }

    fn hw_set_channels(&mut self, channels: u32) -> TransportResult<()> {
        let mut st = self.lock();
        if !st.caps.channels.contains(&(channels as usize)) {
            return Err(Errno::EINVAL);
        }
        st.staged_mut()?.channels = channels;
        Ok(())
    }

    fn hw_buffer_size_max(&self) -> TransportResult<usize> {
        Ok(self.lock().caps.buffer_max)
    }

    fn hw_set_buffer_size_max(&mut self, frames: usize) -> TransportResult<usize> {
        let mut st = self.lock();
        let frames = frames.min(st.caps.buffer_max);
        st.staged_mut()?.buffer_frames = frames;
        Ok(frames)
    }

    fn hw_params_apply(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        let staged = st.staged.clone().ok_or(Errno::EBADFD)?;
        let format = staged.format.ok_or(Errno::EINVAL)?;
        if staged.channels == 0 || staged.buffer_frames == 0 {
            return Err(Errno::EINVAL);
        }
        st.frame_bytes = format.bytes() * staged.channels as usize;
        st.ring = vec![0; staged.buffer_frames * st.frame_bytes];
        st.hw_ptr = 0;
        st.appl_ptr = 0;
        st.running = false;
        st.applied = Some(staged);
        Ok(())
    }

    fn sw_params_current(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        if st.applied.is_none() {
            return Err(Errno::EBADFD);
        }
        st.sw_staged = Some(st.sw_applied.clone().unwrap_or(SimSwConfig {
            stop_threshold: st.buffer_frames(),
            start_threshold: 1,
            period_event: true,
        }));
        Ok(())
    }

    fn sw_boundary(&self) -> TransportResult<usize> {
        Ok(self.boundary())
    }

    fn sw_set_stop_threshold(&mut self, frames: usize) -> TransportResult<()> {
        let mut st = self.lock();
        st.sw_staged.as_mut().ok_or(Errno::EBADFD)?.stop_threshold = frames;
        Ok(())
    }

    fn sw_set_start_threshold(&mut self, frames: usize) -> TransportResult<()> {
        let mut st = self.lock();
        st.sw_staged.as_mut().ok_or(Errno::EBADFD)?.start_threshold = frames;
        Ok(())
    }

    fn sw_set_period_event(&mut self, enable: bool) -> TransportResult<()> {
        let mut st = self.lock();
        st.sw_staged.as_mut().ok_or(Errno::EBADFD)?.period_event = enable;
        Ok(())
    }

    fn sw_params_apply(&mut self) -> TransportResult<()> {
        let mut st = self.lock();
        st.sw_applied = Some(st.sw_staged.clone().ok_or(Errno::EBADFD)?);
        Ok(())
    }

    fn avail(&mut self) -> TransportResult<usize> {
        let mut st = self.lock();
        if let Some(err) = st.avail_faults.pop_front() {
            return Err(err);
        }
        if st.applied.is_none() {
            return Err(Errno::EBADFD);
        }
        Ok(st
            .avail_override
            .unwrap_or_else(|| st.raw_avail(self.direction)))
    }

    fn htimestamp(&mut self) -> TransportResult<(usize, TimeSpec)> {
        let mut st = self.lock();
        if let Some(err) = st.htimestamp_faults.pop_front() {
            return Err(err);
        }
        let avail = st
            .avail_override
            .unwrap_or_else(|| st.raw_avail(self.direction));
        Ok((avail, clock::now()))
    }

    fn delay(&mut self) -> TransportResult<i64> {
        let st = self.lock();
        if st.applied.is_none() {
            return Err(Errno::EBADFD);
        }
        Ok(st.delay_override.unwrap_or(match self.direction {
            Direction::Output => st.appl_ptr as i64 - st.hw_ptr as i64,
            Direction::Input => st.hw_ptr as i64 - st.appl_ptr as i64,
        }))
    }

    fn forward(&mut self, frames: usize) -> TransportResult<usize> {
        let mut st = self.lock();
        let frames = frames.min(st.raw_avail(self.direction));
        st.appl_ptr += frames as u64;
        Ok(frames)
    }

    fn rewind(&mut self, frames: usize) -> TransportResult<usize> {
        let mut st = self.lock();
        let rewindable = match self.direction {
            Direction::Output => st.buffer_frames().saturating_sub(st.raw_avail(self.direction)),
            Direction::Input => st.appl_ptr.min(st.buffer_frames() as u64) as usize,
        };
        let frames = frames.min(rewindable);
        st.appl_ptr -= frames as u64;
        Ok(frames)
    }

    fn buffer_params(&self) -> TransportResult<(usize, usize)> {
        let st = self.lock();
        let buffer = st.buffer_frames();
        if buffer == 0 {
            return Err(Errno::EBADFD);
        }
        Ok((buffer, st.caps.period_frames.min(buffer)))
    }

    fn mmap_begin(&mut self, frames: usize) -> TransportResult<MmapArea> {
        let mut st = self.lock();
        if let Some(err) = st.begin_faults.pop_front() {
            return Err(err);
        }
        let buffer = st.buffer_frames();
        if buffer == 0 {
            return Err(Errno::EBADFD);
        }
        let avail = st.raw_avail(self.direction);
        if self.direction == Direction::Output && avail > buffer {
            return Err(Errno::EPIPE);
        }
        let offset = (st.appl_ptr % buffer as u64) as usize;
        let granted = frames.min(avail).min(buffer - offset);
        let addr = if st.null_areas {
            std::ptr::null_mut()
        } else {
            st.ring.as_mut_ptr()
        };
        Ok(MmapArea {
            addr,
            offset,
            frames: granted,
        })
    }

    fn mmap_commit(&mut self, offset: usize, frames: usize) -> TransportResult<usize> {
        let mut st = self.lock();
        match st.commit_faults.pop_front() {
            Some(CommitFault::Short(accepted)) => {
                st.appl_ptr += accepted as u64;
                return Ok(accepted);
            }
            Some(CommitFault::Error(err)) => return Err(err),
            None => {}
        }
        let buffer = st.buffer_frames();
        if buffer == 0 || offset != (st.appl_ptr % buffer as u64) as usize {
            return Err(Errno::EINVAL);
        }
        st.appl_ptr += frames as u64;
        Ok(frames)
    }

    fn query_chmaps(&self) -> Option<Vec<ChannelMapCandidate>> {
        self.lock().caps.chmaps.clone()
    }

    fn set_chmap(&mut self, positions: &[u32]) -> TransportResult<()> {
        self.lock().chmap_set = Some(positions.to_vec());
        Ok(())
    }
}
