#[cfg(target_os = "linux")]
pub mod alsa;
pub mod avail;
pub mod mmap;
pub mod params;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod transport;

pub use transport::{MmapArea, PcmTransport, TransportResult};
