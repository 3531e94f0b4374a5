pub mod byte_buffer;
pub mod chmap;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod format;
pub mod hw;
pub mod iodev;
mod logging;

pub use config::IoOptions;
pub use error::{IoError, Result};
pub use format::{AudioFormat, Channel, Direction, SampleFormat};
pub use iodev::list::DeviceList;
pub use iodev::{BufferRegion, DeviceId, DeviceState, Iodev};
pub use logging::init_logging;
