pub mod empty;
pub mod hardware;
pub mod list;
pub mod loopback;

use crate::config::IoOptions;
use crate::error::{IoError, Result};
use crate::format::{AudioFormat, Direction};
use crate::hw::PcmTransport;
use empty::EmptyBackend;
use hardware::HardwareBackend;
use list::DeviceList;
use loopback::{LoopbackBackend, LoopbackType};
use nix::sys::time::TimeSpec;
use std::sync::Arc;
use tracing::{debug, warn};

pub type DeviceId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Configuring,
    Open,
}

/// Interleaved frames handed out by `get_buffer`, valid until the next call
/// on the device.
#[derive(Debug)]
pub struct BufferRegion<'a> {
    pub bytes: &'a mut [u8],
    pub frames: usize,
}

/// Operations every device variant provides.
pub trait IoBackend: Send {
    /// Negotiates `fmt` (which may be adjusted) and returns the buffer size
    /// in frames.
    fn configure(&mut self, fmt: &mut AudioFormat) -> Result<usize>;
    fn close(&mut self) -> Result<()>;
    fn get_buffer(&mut self, frames: usize) -> Result<BufferRegion<'_>>;
    fn put_buffer(&mut self, frames: usize) -> Result<()>;
    /// Drops queued input; returns the frames dropped.
    fn flush(&mut self) -> Result<usize>;
    fn frames_queued(&mut self) -> Result<(usize, TimeSpec)>;
    fn delay_frames(&mut self) -> Result<usize>;
    fn update_active_node(&mut self, _node: u32, _enabled: bool) {}
    fn update_channel_layout(&mut self, fmt: &mut AudioFormat) -> Result<()>;
    fn output_underrun(&mut self) -> Result<()> {
        Ok(())
    }
}

pub enum Backend {
    Hardware(HardwareBackend),
    Loopback(LoopbackBackend),
    Empty(EmptyBackend),
}

impl Backend {
    fn as_io(&mut self) -> &mut dyn IoBackend {
        match self {
            Backend::Hardware(b) => b,
            Backend::Loopback(b) => b,
            Backend::Empty(b) => b,
        }
    }
}

/// A device plus the lifecycle rules every variant shares.
pub struct Iodev {
    info: DeviceInfo,
    list: Arc<DeviceList>,
    state: DeviceState,
    format: Option<AudioFormat>,
    buffer_size: usize,
    granted: Option<usize>,
    buffer_fetched: bool,
    backend: Backend,
}

impl Iodev {
    fn register(list: &Arc<DeviceList>, name: &str, direction: Direction) -> DeviceInfo {
        let id = list.add_device(name, direction);
        DeviceInfo {
            id,
            name: name.to_string(),
            direction,
        }
    }

    fn with_backend(info: DeviceInfo, list: &Arc<DeviceList>, backend: Backend) -> Self {
        Self {
            info,
            list: list.clone(),
            state: DeviceState::Closed,
            format: None,
            buffer_size: 0,
            granted: None,
            buffer_fetched: false,
            backend,
        }
    }

    pub fn hardware(
        list: &Arc<DeviceList>,
        transport: Box<dyn PcmTransport>,
        options: IoOptions,
    ) -> Self {
        let info = Self::register(list, transport.name(), transport.direction());
        let backend = HardwareBackend::new(info.id, list, transport, options);
        Self::with_backend(info, list, Backend::Hardware(backend))
    }

    pub fn loopback(list: &Arc<DeviceList>, kind: LoopbackType) -> Self {
        let info = Self::register(list, kind.device_name(), Direction::Input);
        let backend = LoopbackBackend::new(info.id, kind, list);
        Self::with_backend(info, list, Backend::Loopback(backend))
    }

    pub fn empty(list: &Arc<DeviceList>, direction: Direction) -> Self {
        let name = match direction {
            Direction::Output => "Silent playback device",
            Direction::Input => "Silent record device",
        };
        let info = Self::register(list, name, direction);
        Self::with_backend(info, list, Backend::Empty(EmptyBackend::new(direction)))
    }

    pub fn id(&self) -> DeviceId {
        self.info.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn direction(&self) -> Direction {
        self.info.direction
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == DeviceState::Open
    }

    pub fn format(&self) -> Option<&AudioFormat> {
        self.format.as_ref()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    fn require_open(&self, op: &'static str) -> Result<()> {
        if self.state == DeviceState::Open {
            Ok(())
        } else {
            debug!("{}: {op} on a device that is not open", self.info.name);
            Err(IoError::InvalidState("device not open"))
        }
    }

    /// Negotiates `requested` and opens the device. On failure everything
    /// acquired so far is released and the device stays closed.
    pub fn configure(&mut self, requested: &AudioFormat) -> Result<()> {
        if self.state != DeviceState::Closed {
            return Err(IoError::InvalidState("configure on a device that is not closed"));
        }
        requested.validate_layout().map_err(IoError::InvalidArgument)?;
        self.state = DeviceState::Configuring;
        let mut fmt = requested.clone();
        match self.backend.as_io().configure(&mut fmt) {
            Ok(buffer_size) => {
                self.format = Some(fmt);
                self.buffer_size = buffer_size;
                self.granted = None;
                self.buffer_fetched = false;
                self.state = DeviceState::Open;
                Ok(())
            }
            Err(err) => {
                warn!("{}: configure failed: {err}", self.info.name);
                if let Err(close_err) = self.backend.as_io().close() {
                    debug!("{}: close after failed configure: {close_err}", self.info.name);
                }
                self.state = DeviceState::Closed;
                Err(err)
            }
        }
    }

    /// Closing a closed device does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.state == DeviceState::Closed {
            return Ok(());
        }
        self.granted = None;
        let res = self.backend.as_io().close();
        self.format = None;
        self.buffer_size = 0;
        self.state = DeviceState::Closed;
        res
    }

    pub fn get_buffer(&mut self, frames: usize) -> Result<BufferRegion<'_>> {
        self.require_open("get_buffer")?;
        let region = self.backend.as_io().get_buffer(frames)?;
        self.granted = Some(region.frames);
        self.buffer_fetched = true;
        Ok(region)
    }

    pub fn put_buffer(&mut self, frames: usize) -> Result<()> {
        self.require_open("put_buffer")?;
        let granted = self
            .granted
            .ok_or(IoError::InvalidState("put_buffer without get_buffer"))?;
        if frames > granted {
            return Err(IoError::InvalidArgument(format!(
                "put {frames} frames, {granted} granted"
            )));
        }
        self.granted = None;
        self.backend.as_io().put_buffer(frames)
    }

    pub fn flush(&mut self) -> Result<usize> {
        self.require_open("flush")?;
        self.granted = None;
        self.backend.as_io().flush()
    }

    pub fn frames_queued(&mut self) -> Result<(usize, TimeSpec)> {
        self.require_open("frames_queued")?;
        self.backend.as_io().frames_queued()
    }

    pub fn delay_frames(&mut self) -> Result<usize> {
        self.require_open("delay_frames")?;
        self.backend.as_io().delay_frames()
    }

    pub fn update_active_node(&mut self, node: u32, enabled: bool) {
        self.backend.as_io().update_active_node(node, enabled);
    }

    /// Re-reads the channel layout. Only allowed before the first
    /// `get_buffer` after configure; an unavailable map falls back to the
    /// default layout.
    pub fn update_channel_layout(&mut self) -> Result<()> {
        self.require_open("update_channel_layout")?;
        if self.buffer_fetched {
            return Err(IoError::InvalidState(
                "channel layout is fixed once buffers are in use",
            ));
        }
        let Some(fmt) = self.format.as_mut() else {
            return Err(IoError::InvalidState("device has no format"));
        };
        match self.backend.as_io().update_channel_layout(fmt) {
            Err(IoError::ChannelMapUnavailable) => {
                warn!("{}: no channel map, using default layout", self.info.name);
                fmt.set_default_channel_layout();
                Ok(())
            }
            res => res,
        }
    }

    pub fn output_underrun(&mut self) -> Result<()> {
        self.require_open("output_underrun")?;
        self.granted = None;
        self.backend.as_io().output_underrun()
    }
}

impl Drop for Iodev {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("{}: close on drop: {err}", self.info.name);
        }
        self.list.remove_device(self.info.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::hw::sim::{SimCaps, SimPcm};

    fn stereo() -> AudioFormat {
        AudioFormat::new(SampleFormat::S16LE, 48000, 2)
    }

    #[test]
    fn lifecycle_transitions() {
        let list = DeviceList::new();
        let mut dev = Iodev::empty(&list, Direction::Output);
        assert_eq!(dev.state(), DeviceState::Closed);
        assert!(matches!(dev.get_buffer(16), Err(IoError::InvalidState(_))));

        dev.configure(&stereo()).unwrap();
        assert!(dev.is_open());
        assert_eq!(dev.buffer_size(), empty::EMPTY_BUFFER_SIZE);
        assert!(matches!(dev.configure(&stereo()), Err(IoError::InvalidState(_))));

        dev.close().unwrap();
        assert_eq!(dev.state(), DeviceState::Closed);
        dev.close().unwrap();
        assert!(dev.format().is_none());
    }

    #[test]
    fn put_buffer_is_checked_against_the_grant() {
        let list = DeviceList::new();
        let mut dev = Iodev::empty(&list, Direction::Output);
        dev.configure(&stereo()).unwrap();
        assert!(matches!(dev.put_buffer(1), Err(IoError::InvalidState(_))));

        let granted = dev.get_buffer(256).unwrap().frames;
        assert_eq!(granted, 256);
        assert!(matches!(dev.put_buffer(257), Err(IoError::InvalidArgument(_))));
        dev.put_buffer(200).unwrap();
        assert!(matches!(dev.put_buffer(1), Err(IoError::InvalidState(_))));
    }

    #[test]
    fn failed_configure_closes_the_transport() {
        let list = DeviceList::new();
        let pcm = SimPcm::new(
            "hw:0,0",
            Direction::Output,
            SimCaps {
                rates: vec![44100],
                ..SimCaps::default()
            },
        );
        let mut dev = Iodev::hardware(&list, Box::new(pcm.clone()), IoOptions::default());
        let err = dev.configure(&stereo()).unwrap_err();
        assert!(matches!(err, IoError::Negotiation(_)));
        assert_eq!(dev.state(), DeviceState::Closed);
        assert!(!pcm.is_open());
        assert!(pcm.applied().is_none());
    }

    #[test]
    fn channel_layout_is_locked_after_first_buffer() {
        let list = DeviceList::new();
        let mut dev = Iodev::empty(&list, Direction::Input);
        dev.configure(&stereo()).unwrap();
        dev.update_channel_layout().unwrap();
        let _ = dev.get_buffer(0).unwrap();
        assert!(matches!(
            dev.update_channel_layout(),
            Err(IoError::InvalidState(_))
        ));
    }

    #[test]
    fn drop_removes_the_device() {
        let list = DeviceList::new();
        let dev = Iodev::empty(&list, Direction::Output);
        let id = dev.id();
        list.enable(id);
        assert_eq!(list.first_enabled(Direction::Output), Some(id));
        drop(dev);
        assert!(list.device(id).is_none());
        assert_eq!(list.first_enabled(Direction::Output), None);
    }
}
