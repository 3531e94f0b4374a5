use super::transport::{MmapArea, PcmTransport, TransportResult, retry_busy};
use crate::chmap::{ChannelMapCandidate, ChmapKind};
use crate::format::{Direction, SampleFormat};
use alsa_sys as sys;
use nix::errno::Errno;
use nix::libc::{c_int, c_uint};
use nix::sys::time::TimeSpec;
use std::ffi::CString;
use std::ptr;

const PCM_NONBLOCK: c_int = 0x0001;
const PCM_NO_AUTO_RESAMPLE: c_int = 0x0001_0000;
const PCM_NO_AUTO_CHANNELS: c_int = 0x0002_0000;
const PCM_NO_AUTO_FORMAT: c_int = 0x0004_0000;

const CHMAP_TYPE_VAR: c_uint = 2;
const CHMAP_TYPE_PAIRED: c_uint = 3;

fn check(rc: impl Into<i64>) -> TransportResult<i64> {
    let rc = rc.into();
    if rc < 0 {
        Err(Errno::from_raw((-rc) as i32))
    } else {
        Ok(rc)
    }
}

/// A libasound PCM opened for mmap access.
pub struct AlsaPcm {
    name: String,
    direction: Direction,
    handle: *mut sys::snd_pcm_t,
    hw: *mut sys::snd_pcm_hw_params_t,
    sw: *mut sys::snd_pcm_sw_params_t,
}

// The handle is only ever used from the thread that owns the device.
unsafe impl Send for AlsaPcm {}

impl AlsaPcm {
    pub fn new(name: &str, direction: Direction) -> TransportResult<Self> {
        let mut hw = ptr::null_mut();
        let mut sw = ptr::null_mut();
        unsafe {
            check(sys::snd_pcm_hw_params_malloc(&mut hw))?;
            if let Err(e) = check(sys::snd_pcm_sw_params_malloc(&mut sw)) {
                sys::snd_pcm_hw_params_free(hw);
                return Err(e);
            }
        }
        Ok(Self {
            name: name.to_string(),
            direction,
            handle: ptr::null_mut(),
            hw,
            sw,
        })
    }

    fn handle(&self) -> TransportResult<*mut sys::snd_pcm_t> {
        if self.handle.is_null() {
            Err(Errno::EBADFD)
        } else {
            Ok(self.handle)
        }
    }

    fn stream(&self) -> sys::snd_pcm_stream_t {
        match self.direction {
            Direction::Output => sys::SND_PCM_STREAM_PLAYBACK,
            Direction::Input => sys::SND_PCM_STREAM_CAPTURE,
        }
    }

    fn open_once(&mut self) -> TransportResult<()> {
        let name = CString::new(self.name.as_str()).map_err(|_| Errno::EINVAL)?;
        let mode =
            PCM_NONBLOCK | PCM_NO_AUTO_RESAMPLE | PCM_NO_AUTO_CHANNELS | PCM_NO_AUTO_FORMAT;
        let mut handle = ptr::null_mut();
        check(unsafe { sys::snd_pcm_open(&mut handle, name.as_ptr(), self.stream(), mode) })?;
        self.handle = handle;
        Ok(())
    }
}

impl Drop for AlsaPcm {
    fn drop(&mut self) {
        let _ = self.close();
        unsafe {
            sys::snd_pcm_hw_params_free(self.hw);
            sys::snd_pcm_sw_params_free(self.sw);
        }
    }
}

impl PcmTransport for AlsaPcm {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn open(&mut self) -> TransportResult<()> {
        if !self.handle.is_null() {
            return Ok(());
        }
        let name = self.name.clone();
        retry_busy(&name, || self.open_once())
    }

    fn close(&mut self) -> TransportResult<()> {
        if self.handle.is_null() {
            return Ok(());
        }
        let rc = unsafe { sys::snd_pcm_close(self.handle) };
        self.handle = ptr::null_mut();
        check(rc).map(|_| ())
    }

    fn start(&mut self) -> TransportResult<()> {
        check(unsafe { sys::snd_pcm_start(self.handle()?) }).map(|_| ())
    }

    fn drain(&mut self) -> TransportResult<()> {
        check(unsafe { sys::snd_pcm_drain(self.handle()?) }).map(|_| ())
    }

    fn prepare(&mut self) -> TransportResult<()> {
        check(unsafe { sys::snd_pcm_prepare(self.handle()?) }).map(|_| ())
    }

    fn resume(&mut self) -> TransportResult<()> {
        check(unsafe { sys::snd_pcm_resume(self.handle()?) }).map(|_| ())
    }

    fn recover(&mut self, err: Errno) -> TransportResult<()> {
        check(unsafe { sys::snd_pcm_recover(self.handle()?, -(err as c_int), 0) }).map(|_| ())
    }

    fn hw_params_any(&mut self) -> TransportResult<()> {
        check(unsafe { sys::snd_pcm_hw_params_any(self.handle()?, self.hw) }).map(|_| ())
    }

    fn hw_test_rate(&self, rate: u32) -> bool {
        let Ok(handle) = self.handle() else {
            return false;
        };
        unsafe { sys::snd_pcm_hw_params_test_rate(handle, self.hw, rate as c_uint, 0) == 0 }
    }

    fn hw_test_channels(&self, channels: u32) -> bool {
        let Ok(handle) = self.handle() else {
            return false;
        };
        unsafe { sys::snd_pcm_hw_params_test_channels(handle, self.hw, channels as c_uint) == 0 }
    }

    fn hw_test_format(&self, format: SampleFormat) -> bool {
        let Ok(handle) = self.handle() else {
            return false;
        };
        unsafe { sys::snd_pcm_hw_params_test_format(handle, self.hw, format.alsa_code() as _) == 0 }
    }

    fn hw_channels_max(&self) -> TransportResult<u32> {
        let mut max: c_uint = 0;
        check(unsafe { sys::snd_pcm_hw_params_get_channels_max(self.hw, &mut max) })?;
        Ok(max)
    }

    fn hw_set_rate_resample(&mut self, enable: bool) -> TransportResult<()> {
        let handle = self.handle()?;
        check(unsafe {
            sys::snd_pcm_hw_params_set_rate_resample(handle, self.hw, enable as c_uint)
        })
        .map(|_| ())
    }

    fn hw_set_access_mmap_interleaved(&mut self) -> TransportResult<()> {
        let handle = self.handle()?;
        check(unsafe {
            sys::snd_pcm_hw_params_set_access(
                handle,
                self.hw,
                sys::SND_PCM_ACCESS_MMAP_INTERLEAVED,
            )
        })
        .map(|_| ())
    }

    fn hw_can_disable_period_wakeup(&self) -> bool {
        unsafe { sys::snd_pcm_hw_params_can_disable_period_wakeup(self.hw) != 0 }
    }

    fn hw_set_period_wakeup(&mut self, enable: bool) -> TransportResult<()> {
        let handle = self.handle()?;
        check(unsafe {
            sys::snd_pcm_hw_params_set_period_wakeup(handle, self.hw, enable as c_uint)
        })
        .map(|_| ())
    }

    fn hw_set_period_time_near(&mut self, period_us: u32) -> TransportResult<u32> {
        let handle = self.handle()?;
        let mut val = period_us as c_uint;
        let mut dir: c_int = 0;
        check(unsafe {
            sys::snd_pcm_hw_params_set_period_time_near(handle, self.hw, &mut val, &mut dir)
        })?;
        Ok(val)
    }

    fn hw_set_format(&mut self, format: SampleFormat) -> TransportResult<()> {
        let handle = self.handle()?;
        check(unsafe { sys::snd_pcm_hw_params_set_format(handle, self.hw, format.alsa_code() as _) })
            .map(|_| ())
    }

    fn hw_set_rate_near(&mut self, rate: u32) -> TransportResult<u32> {
        let handle = self.handle()?;
        let mut val = rate as c_uint;
        let mut dir: c_int = 0;
        check(unsafe { sys::snd_pcm_hw_params_set_rate_near(handle, self.hw, &mut val, &mut dir) })?;
        Ok(val)
    }

    fn hw_set_channels(&mut self, channels: u32) -> TransportResult<()> {
        let handle = self.handle()?;
        check(unsafe { sys::snd_pcm_hw_params_set_channels(handle, self.hw, channels as c_uint) })
            .map(|_| ())
    }

    fn hw_buffer_size_max(&self) -> TransportResult<usize> {
        let mut max: sys::snd_pcm_uframes_t = 0;
        check(unsafe { sys::snd_pcm_hw_params_get_buffer_size_max(self.hw, &mut max) })?;
        Ok(max as usize)
    }

    fn hw_set_buffer_size_max(&mut self, frames: usize) -> TransportResult<usize> {
        let handle = self.handle()?;
        let mut val = frames as sys::snd_pcm_uframes_t;
        check(unsafe { sys::snd_pcm_hw_params_set_buffer_size_max(handle, self.hw, &mut val) })?;
        Ok(val as usize)
    }

    fn hw_params_apply(&mut self) -> TransportResult<()> {
        check(unsafe { sys::snd_pcm_hw_params(self.handle()?, self.hw) }).map(|_| ())
    }

    fn sw_params_current(&mut self) -> TransportResult<()> {
        check(unsafe { sys::snd_pcm_sw_params_current(self.handle()?, self.sw) }).map(|_| ())
    }

    fn sw_boundary(&self) -> TransportResult<usize> {
        let mut boundary: sys::snd_pcm_uframes_t = 0;
        check(unsafe { sys::snd_pcm_sw_params_get_boundary(self.sw, &mut boundary) })?;
        Ok(boundary as usize)
    }

    fn sw_set_stop_threshold(&mut self, frames: usize) -> TransportResult<()> {
        let handle = self.handle()?;
        check(unsafe {
            sys::snd_pcm_sw_params_set_stop_threshold(handle, self.sw, frames as _)
        })
        .map(|_| ())
    }

    fn sw_set_start_threshold(&mut self, frames: usize) -> TransportResult<()> {
        let handle = self.handle()?;
        check(unsafe {
            sys::snd_pcm_sw_params_set_start_threshold(handle, self.sw, frames as _)
        })
        .map(|_| ())
    }

    fn sw_set_period_event(&mut self, enable: bool) -> TransportResult<()> {
        let handle = self.handle()?;
        check(unsafe { sys::snd_pcm_sw_params_set_period_event(handle, self.sw, enable as c_int) })
            .map(|_| ())
    }

    fn sw_params_apply(&mut self) -> TransportResult<()> {
        check(unsafe { sys::snd_pcm_sw_params(self.handle()?, self.sw) }).map(|_| ())
    }

    fn avail(&mut self) -> TransportResult<usize> {
        let frames = check(unsafe { sys::snd_pcm_avail(self.handle()?) })?;
        Ok(frames as usize)
    }

    fn htimestamp(&mut self) -> TransportResult<(usize, TimeSpec)> {
        let handle = self.handle()?;
        let mut avail: sys::snd_pcm_uframes_t = 0;
        let mut ts: sys::snd_htimestamp_t = unsafe { std::mem::zeroed() };
        check(unsafe { sys::snd_pcm_htimestamp(handle, &mut avail, &mut ts) })?;
        Ok((avail as usize, TimeSpec::new(ts.tv_sec as _, ts.tv_nsec as _)))
    }

    fn delay(&mut self) -> TransportResult<i64> {
        let handle = self.handle()?;
        let mut delay: sys::snd_pcm_sframes_t = 0;
        check(unsafe { sys::snd_pcm_delay(handle, &mut delay) })?;
        Ok(delay as i64)
    }

    fn forward(&mut self, frames: usize) -> TransportResult<usize> {
        let moved = check(unsafe { sys::snd_pcm_forward(self.handle()?, frames as _) })?;
        Ok(moved as usize)
    }

    fn rewind(&mut self, frames: usize) -> TransportResult<usize> {
        let moved = check(unsafe { sys::snd_pcm_rewind(self.handle()?, frames as _) })?;
        Ok(moved as usize)
    }

    fn buffer_params(&self) -> TransportResult<(usize, usize)> {
        let handle = self.handle()?;
        let mut buffer: sys::snd_pcm_uframes_t = 0;
        let mut period: sys::snd_pcm_uframes_t = 0;
        check(unsafe { sys::snd_pcm_get_params(handle, &mut buffer, &mut period) })?;
        Ok((buffer as usize, period as usize))
    }

    fn mmap_begin(&mut self, frames: usize) -> TransportResult<MmapArea> {
        let handle = self.handle()?;
        let mut areas: *const sys::snd_pcm_channel_area_t = ptr::null();
        let mut offset: sys::snd_pcm_uframes_t = 0;
        let mut granted = frames as sys::snd_pcm_uframes_t;
        check(unsafe { sys::snd_pcm_mmap_begin(handle, &mut areas, &mut offset, &mut granted) })?;
        // Interleaved access: channel 0's area starts at the frame base.
        let addr = if areas.is_null() {
            ptr::null_mut()
        } else {
            unsafe { (*areas).addr as *mut u8 }
        };
        Ok(MmapArea {
            addr,
            offset: offset as usize,
            frames: granted as usize,
        })
    }

    fn mmap_commit(&mut self, offset: usize, frames: usize) -> TransportResult<usize> {
        let handle = self.handle()?;
        let done = check(unsafe { sys::snd_pcm_mmap_commit(handle, offset as _, frames as _) })?;
        Ok(done as usize)
    }

    fn query_chmaps(&self) -> Option<Vec<ChannelMapCandidate>> {
        let handle = self.handle().ok()?;
        let maps = unsafe { sys::snd_pcm_query_chmaps(handle) };
        if maps.is_null() {
            return None;
        }
        let mut out = Vec::new();
        let mut idx = 0;
        loop {
            let entry = unsafe { *maps.add(idx) };
            if entry.is_null() {
                break;
            }
            // Layout: type, channel count, then one position per channel.
            let words = entry as *const c_uint;
            let (kind, count) = unsafe { (*words, *words.add(1)) };
            let positions = (0..count as usize)
                .map(|i| unsafe { *words.add(2 + i) })
                .collect();
            let kind = match kind {
                CHMAP_TYPE_VAR => ChmapKind::Variable,
                CHMAP_TYPE_PAIRED => ChmapKind::Paired,
                // NONE-typed maps behave like fixed ones.
                _ => ChmapKind::Fixed,
            };
            out.push(ChannelMapCandidate::new(kind, positions));
            idx += 1;
        }
        unsafe { sys::snd_pcm_free_chmaps(maps) };
        Some(out)
    }

    fn set_chmap(&mut self, positions: &[u32]) -> TransportResult<()> {
        let handle = self.handle()?;
        let mut words: Vec<c_uint> = Vec::with_capacity(positions.len() + 1);
        words.push(positions.len() as c_uint);
        words.extend(positions.iter().map(|&p| p as c_uint));
        check(unsafe {
            sys::snd_pcm_set_chmap(handle, words.as_ptr() as *const sys::snd_pcm_chmap_t)
        })
        .map(|_| ())
    }
}
