use nix::errno::Errno;
use thiserror::Error;

/// Transport code for "the PCM was suspended and must be resumed".
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const ESTRPIPE: Errno = Errno::ESTRPIPE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const ESTRPIPE: Errno = Errno::ENOTCONN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IoError {
    #[error("transient I/O failure: {0}")]
    TransientIo(Errno),
    #[error("severe underrun: avail {avail} exceeds buffer {buffer} by more than {threshold}")]
    SevereUnderrun {
        avail: usize,
        buffer: usize,
        threshold: usize,
    },
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("no usable channel map")]
    ChannelMapUnavailable,
    #[error("{op} failed: {errno}")]
    Transport { op: &'static str, errno: Errno },
    #[error("invalid device state: {0}")]
    InvalidState(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl IoError {
    pub fn transport(op: &'static str, errno: Errno) -> Self {
        Self::Transport { op, errno }
    }

    /// The underlying errno, when the failure came from the transport.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::TransientIo(errno) | Self::Transport { errno, .. } => Some(*errno),
            Self::SevereUnderrun { .. } => Some(Errno::EPIPE),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, IoError>;

pub fn negotiation_error(step: &str, err: impl std::fmt::Display) -> IoError {
    IoError::Negotiation(format!("{step}: {err}"))
}
