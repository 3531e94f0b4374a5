use super::list::{DeviceList, HookId};
use super::{BufferRegion, DeviceId, DeviceInfo, IoBackend};
use crate::byte_buffer::ByteBuffer;
use crate::clock::{self, FrameClock};
use crate::error::{IoError, Result};
use crate::format::{AudioFormat, Direction, SampleFormat};
use nix::sys::time::TimeSpec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info};

pub const LOOPBACK_BUFFER_SIZE: usize = 8192;
pub const LOOPBACK_RATE: usize = 48_000;
pub const LOOPBACK_CHANNELS: usize = 2;
pub const LOOPBACK_FORMAT: SampleFormat = SampleFormat::S16LE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopbackType {
    PostMixPreDsp,
    PostDsp,
    /// Post-DSP tap that starts with a full queue of silence.
    PostDspDelayed,
}

/// Where along the output path a tap reads samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapPoint {
    PostMix,
    PostDsp,
}

impl LoopbackType {
    pub fn tap_point(self) -> TapPoint {
        match self {
            Self::PostMixPreDsp => TapPoint::PostMix,
            Self::PostDsp | Self::PostDspDelayed => TapPoint::PostDsp,
        }
    }

    pub fn device_name(self) -> &'static str {
        match self {
            Self::PostMixPreDsp => "Post Mix Pre DSP Loopback",
            Self::PostDsp => "Post DSP Loopback",
            Self::PostDspDelayed => "Post DSP Delayed Loopback",
        }
    }
}

#[derive(Debug)]
struct Shared {
    queue: ByteBuffer,
    /// Set while the monitored output is running.
    started: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Target {
    /// Cleared on close so a late notification cannot re-attach the tap.
    active: bool,
    sender: Option<DeviceId>,
    hook: Option<HookId>,
}

/// State reachable from the device-enabled callback.
struct Link {
    id: DeviceId,
    kind: LoopbackType,
    list: Weak<DeviceList>,
    shared: Arc<Mutex<Shared>>,
    // Serializes retargeting; taken before the registry's hook lock.
    target: Mutex<Target>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Link {
    fn register(&self, list: &DeviceList, sender: DeviceId) -> HookId {
        let samples = self.shared.clone();
        let start = self.shared.clone();
        list.register_loopback(
            self.kind,
            sender,
            self.id,
            Box::new(move |bytes, frames, fmt| {
                let frame_bytes = fmt.frame_bytes().max(1);
                let mut shared = lock(&samples);
                let fit = frames
                    .min(shared.queue.available() / frame_bytes)
                    .min(bytes.len() / frame_bytes);
                shared.queue.push(&bytes[..fit * frame_bytes]) / frame_bytes
            }),
            Box::new(move |started| lock(&start).started = started),
        )
    }

    /// Points the tap at the first enabled output, if that changed.
    fn retarget(&self) {
        let Some(list) = self.list.upgrade() else {
            return;
        };
        let mut target = lock(&self.target);
        if !target.active {
            return;
        }
        let first = list.first_enabled(Direction::Output);
        if target.sender == first {
            return;
        }
        self.detach_locked(&list, &mut target);
        if let Some(sender) = first {
            target.hook = Some(self.register(&list, sender));
            target.sender = Some(sender);
            info!("{} now monitoring device {sender}", self.kind.device_name());
        }
    }

    fn detach_locked(&self, list: &DeviceList, target: &mut Target) {
        if let Some(hook) = target.hook.take() {
            list.unregister_loopback(hook);
        }
        target.sender = None;
        lock(&self.shared).started = false;
    }

    fn detach(&self, deactivate: bool) {
        let mut target = lock(&self.target);
        if deactivate {
            target.active = false;
        }
        match self.list.upgrade() {
            Some(list) => self.detach_locked(&list, &mut target),
            None => {
                target.sender = None;
                target.hook = None;
            }
        }
    }

    fn on_device_enabled(&self, dev: &DeviceInfo, enabled: bool) {
        if dev.direction != Direction::Output {
            return;
        }
        if enabled {
            self.retarget();
            return;
        }
        let monitored = lock(&self.target).sender == Some(dev.id);
        if monitored {
            debug!("monitored device {} disabled", dev.id);
            self.detach(false);
            self.retarget();
        }
    }
}

/// Virtual capture device mirroring the first enabled output.
pub struct LoopbackBackend {
    link: Arc<Link>,
    list: Arc<DeviceList>,
    clock: FrameClock,
    read_frames: u64,
    frame_bytes: usize,
    staging: Vec<u8>,
}

impl LoopbackBackend {
    pub fn new(id: DeviceId, kind: LoopbackType, list: &Arc<DeviceList>) -> Self {
        let frame_bytes = LOOPBACK_FORMAT.bytes() * LOOPBACK_CHANNELS;
        Self {
            link: Arc::new(Link {
                id,
                kind,
                list: Arc::downgrade(list),
                shared: Arc::new(Mutex::new(Shared {
                    queue: ByteBuffer::new(LOOPBACK_BUFFER_SIZE * 4),
                    started: false,
                })),
                target: Mutex::new(Target::default()),
            }),
            list: list.clone(),
            clock: FrameClock::default(),
            read_frames: 0,
            frame_bytes,
            // Sized for the whole queue so reads never allocate.
            staging: Vec::with_capacity(LOOPBACK_BUFFER_SIZE * frame_bytes),
        }
    }

    pub fn kind(&self) -> LoopbackType {
        self.link.kind
    }

    /// The output device currently being monitored.
    pub fn sender(&self) -> Option<DeviceId> {
        lock(&self.link.target).sender
    }

    pub fn started(&self) -> bool {
        lock(&self.link.shared).started
    }
}

impl IoBackend for LoopbackBackend {
    fn configure(&mut self, fmt: &mut AudioFormat) -> Result<usize> {
        *fmt = AudioFormat::new(LOOPBACK_FORMAT, LOOPBACK_RATE, LOOPBACK_CHANNELS);
        self.frame_bytes = fmt.frame_bytes();
        self.clock.init_clock(LOOPBACK_RATE);
        self.read_frames = 0;
        lock(&self.link.shared).started = false;

        lock(&self.link.target).active = true;
        self.link.retarget();
        let link = Arc::downgrade(&self.link);
        self.list.set_device_enabled_callback(
            self.link.id,
            Arc::new(move |dev, enabled| {
                if let Some(link) = link.upgrade() {
                    link.on_device_enabled(dev, enabled);
                }
            }),
        );

        // Silence stands in for the latency of a real output path.
        if self.link.kind == LoopbackType::PostDspDelayed {
            let mut shared = lock(&self.link.shared);
            let writable = shared.queue.writable();
            shared.queue.fill_silence(writable);
        }
        Ok(LOOPBACK_BUFFER_SIZE)
    }

    fn close(&mut self) -> Result<()> {
        self.list.clear_device_enabled_callback(self.link.id);
        self.link.detach(true);
        lock(&self.link.shared).queue.reset();
        self.staging.clear();
        Ok(())
    }

    fn get_buffer(&mut self, frames: usize) -> Result<BufferRegion<'_>> {
        let shared = lock(&self.link.shared);
        let window = shared.queue.read_slice();
        let granted = (window.len() / self.frame_bytes).min(frames);
        self.staging.clear();
        self.staging
            .extend_from_slice(&window[..granted * self.frame_bytes]);
        drop(shared);
        Ok(BufferRegion {
            bytes: self.staging.as_mut_slice(),
            frames: granted,
        })
    }

    fn put_buffer(&mut self, frames: usize) -> Result<()> {
        lock(&self.link.shared)
            .queue
            .increment_read(frames * self.frame_bytes);
        self.read_frames += frames as u64;
        Ok(())
    }

    // The initial latency of the delayed tap is kept on purpose.
    fn flush(&mut self) -> Result<usize> {
        Ok(0)
    }

    fn frames_queued(&mut self) -> Result<(usize, TimeSpec)> {
        let mut shared = lock(&self.link.shared);
        if !shared.started {
            let since_start = self.clock.frames_since_start();
            let missing = since_start.saturating_sub(self.read_frames) as usize;
            let to_fill = missing.min(shared.queue.writable() / self.frame_bytes);
            if to_fill > 0 {
                shared.queue.fill_silence(to_fill * self.frame_bytes);
            }
        }
        Ok((shared.queue.queued() / self.frame_bytes, clock::now()))
    }

    fn delay_frames(&mut self) -> Result<usize> {
        self.frames_queued().map(|(frames, _)| frames)
    }

    fn update_channel_layout(&mut self, fmt: &mut AudioFormat) -> Result<()> {
        if fmt.num_channels != LOOPBACK_CHANNELS {
            return Err(IoError::InvalidArgument(format!(
                "loopback is stereo, got {} channels",
                fmt.num_channels
            )));
        }
        fmt.set_default_channel_layout();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_reuse_the_staging_buffer() {
        let list = DeviceList::new();
        let out = list.add_device("out", Direction::Output);
        list.enable(out);
        let mut lb = LoopbackBackend::new(100, LoopbackType::PostDsp, &list);
        let mut fmt = AudioFormat::new(LOOPBACK_FORMAT, LOOPBACK_RATE, LOOPBACK_CHANNELS);
        lb.configure(&mut fmt).unwrap();
        let staging = lb.staging.as_ptr();

        let bytes = vec![3u8; LOOPBACK_BUFFER_SIZE * 4];
        list.run_sample_hooks(out, TapPoint::PostDsp, &bytes, LOOPBACK_BUFFER_SIZE, &fmt);
        let region = lb.get_buffer(LOOPBACK_BUFFER_SIZE).unwrap();
        assert_eq!(region.frames, LOOPBACK_BUFFER_SIZE);
        assert!(region.bytes.iter().all(|&b| b == 3));
        assert_eq!(lb.staging.as_ptr(), staging);

        lb.put_buffer(LOOPBACK_BUFFER_SIZE).unwrap();
        lb.close().unwrap();
        assert!(lb.staging.capacity() >= LOOPBACK_BUFFER_SIZE * 4);
    }
}
