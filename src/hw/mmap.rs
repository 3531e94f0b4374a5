use super::transport::{PcmTransport, TransportResult};
use crate::error::{ESTRPIPE, IoError, Result};
use crate::format::Direction;
use nix::errno::Errno;
use std::time::Duration;
use tracing::{error, info, warn};

/// Chances given to `mmap_begin` before giving up on this cycle.
pub const MAX_MMAP_BEGIN_ATTEMPTS: usize = 3;
/// Sleep between resume attempts while the device answers `EAGAIN`.
pub const SUSPENDED_SLEEP_TIME: Duration = Duration::from_millis(250);

/// A window of the transport's ring buffer, valid until it is committed.
#[derive(Debug)]
pub struct RingBufferRegion {
    base: *mut u8,
    pub offset: usize,
    pub frames: usize,
    format_bytes: usize,
}

// Only the owning device touches the window, from its audio thread.
unsafe impl Send for RingBufferRegion {}

impl RingBufferRegion {
    /// Start of the window (`base + offset * format_bytes`).
    pub fn ptr(&self) -> *mut u8 {
        self.base.wrapping_add(self.offset * self.format_bytes)
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len_bytes(&self) -> usize {
        self.frames * self.format_bytes
    }

    /// Hands `frames` frames of this window back to the transport.
    pub fn commit(self, transport: &mut dyn PcmTransport, frames: usize) -> Result<()> {
        commit(transport, self.offset, frames)
    }
}

/// Brings a suspended PCM back.
///
/// Only a stream that lives across system suspend reaches this path; the
/// regular streams are detached before suspend and reattached after resume.
pub fn attempt_resume(transport: &mut dyn PcmTransport) -> TransportResult<()> {
    info!("{}: system suspended", transport.name());
    let mut rc = loop {
        match transport.resume() {
            Err(Errno::EAGAIN) => std::thread::sleep(SUSPENDED_SLEEP_TIME),
            other => break other,
        }
    };
    if let Err(err) = rc {
        // Not every device implements resume.
        info!("System suspended, failed to resume {err}");
        if let Err(err) = transport.prepare() {
            warn!("Suspended, failed to prepare: {err}");
        }
        // start_threshold is never reached, start explicitly.
        rc = transport.start();
        if let Err(err) = rc {
            warn!("Suspended, failed to start: {err}");
        }
    }
    rc
}

/// Maps up to `frames` frames at the application pointer.
pub fn begin(
    transport: &mut dyn PcmTransport,
    format_bytes: usize,
    frames: usize,
) -> Result<RingBufferRegion> {
    for _ in 0..MAX_MMAP_BEGIN_ATTEMPTS {
        let area = match transport.mmap_begin(frames) {
            Ok(area) => area,
            Err(err) if err == ESTRPIPE => {
                attempt_resume(transport).map_err(IoError::TransientIo)?;
                continue;
            }
            Err(err) => {
                if transport.recover(err).is_ok() {
                    continue;
                }
                info!("recover failed begin: {err}");
                return Err(IoError::TransientIo(err));
            }
        };
        if area.addr.is_null() {
            error!("mmap_begin returned NULL areas");
            return Err(IoError::TransientIo(Errno::ENOMEM));
        }
        // Capture may legitimately see zero frames right after a resume.
        if transport.direction() == Direction::Output && area.frames == 0 {
            info!("mmap_begin set frames to 0");
            return Err(IoError::TransientIo(Errno::EIO));
        }
        return Ok(RingBufferRegion {
            base: area.addr,
            offset: area.offset,
            frames: area.frames,
            format_bytes,
        });
    }
    Err(IoError::TransientIo(Errno::EIO))
}

/// Commits `frames` frames at `offset`.
///
/// A short commit is a fault: it is recovered here and the caller picks up
/// the new buffer state on its next cycle instead of retrying.
pub fn commit(transport: &mut dyn PcmTransport, offset: usize, frames: usize) -> Result<()> {
    let err = match transport.mmap_commit(offset, frames) {
        Ok(done) if done == frames => return Ok(()),
        Ok(_) => Errno::EPIPE,
        Err(err) => err,
    };
    if err == ESTRPIPE {
        attempt_resume(transport).map_err(IoError::TransientIo)?;
    } else {
        transport.recover(err).map_err(|rc| {
            warn!("mmap_commit: pcm_recover failed: {rc}");
            IoError::TransientIo(rc)
        })?;
    }
    Ok(())
}

/// Base address of the whole mapped ring buffer.
pub fn whole_buffer(transport: &mut dyn PcmTransport) -> Result<*mut u8> {
    // One frame is requested so the transport does not reject the call.
    begin(transport, 0, 1).map(|region| region.base())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioFormat, SampleFormat};
    use crate::hw::params;
    use crate::hw::sim::{CommitFault, SimCaps, SimPcm};

    fn configured(direction: Direction) -> SimPcm {
        let mut pcm = SimPcm::new("sim", direction, SimCaps::default());
        pcm.open().unwrap();
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        params::commit(&mut pcm, &fmt, 4096, false, Duration::ZERO).unwrap();
        pcm
    }

    #[test]
    fn suspend_twice_then_success() {
        let mut pcm = configured(Direction::Output);
        pcm.push_begin_fault(ESTRPIPE);
        pcm.push_begin_fault(ESTRPIPE);
        let region = begin(&mut pcm, 4, 256).unwrap();
        assert_eq!(region.frames, 256);
        assert_eq!(region.offset, 0);
        assert_eq!(pcm.counters().resume, 2);
        assert_eq!(pcm.counters().recover, 0);
    }

    #[test]
    fn failed_resume_falls_back_to_prepare_and_start() {
        let mut pcm = configured(Direction::Input);
        pcm.push_resume_result(Errno::ENOSYS);
        attempt_resume(&mut pcm).unwrap();
        let counters = pcm.counters();
        assert_eq!(counters.prepare, 1);
        assert_eq!(counters.start, 1);
        assert!(pcm.is_running());
    }

    #[test]
    fn attempts_are_bounded() {
        let mut pcm = configured(Direction::Output);
        for _ in 0..MAX_MMAP_BEGIN_ATTEMPTS {
            pcm.push_begin_fault(Errno::EPIPE);
        }
        let err = begin(&mut pcm, 4, 64).unwrap_err();
        assert_eq!(err, IoError::TransientIo(Errno::EIO));
        assert_eq!(pcm.counters().recover, MAX_MMAP_BEGIN_ATTEMPTS);
    }

    #[test]
    fn unrecoverable_error_is_returned() {
        let mut pcm = configured(Direction::Output);
        pcm.push_begin_fault(Errno::ENODEV);
        pcm.set_recover_result(Some(Errno::ENODEV));
        let err = begin(&mut pcm, 4, 64).unwrap_err();
        assert_eq!(err, IoError::TransientIo(Errno::ENODEV));
    }

    #[test]
    fn null_area_is_enomem() {
        let mut pcm = configured(Direction::Output);
        pcm.set_null_areas(true);
        let err = begin(&mut pcm, 4, 64).unwrap_err();
        assert_eq!(err, IoError::TransientIo(Errno::ENOMEM));
    }

    #[test]
    fn empty_output_window_is_eio_without_retry() {
        let mut pcm = configured(Direction::Output);
        let region = begin(&mut pcm, 4, 4096).unwrap();
        region.commit(&mut pcm, 4096).unwrap();
        let err = begin(&mut pcm, 4, 64).unwrap_err();
        assert_eq!(err, IoError::TransientIo(Errno::EIO));
        assert_eq!(pcm.counters().recover, 0);

        let mut capture = configured(Direction::Input);
        assert_eq!(begin(&mut capture, 4, 64).unwrap().frames, 0);
    }

    #[test]
    fn short_commit_recovers() {
        let mut pcm = configured(Direction::Output);
        let region = begin(&mut pcm, 4, 128).unwrap();
        pcm.push_commit_fault(CommitFault::Short(64));
        region.commit(&mut pcm, 128).unwrap();
        assert_eq!(pcm.counters().recover, 1);

        let region = begin(&mut pcm, 4, 128).unwrap();
        pcm.push_commit_fault(CommitFault::Short(0));
        pcm.set_recover_result(Some(Errno::EBADFD));
        let err = region.commit(&mut pcm, 128).unwrap_err();
        assert_eq!(err, IoError::TransientIo(Errno::EBADFD));
    }

    #[test]
    fn suspended_commit_resumes() {
        let mut pcm = configured(Direction::Output);
        let region = begin(&mut pcm, 4, 32).unwrap();
        pcm.push_commit_fault(CommitFault::Error(ESTRPIPE));
        region.commit(&mut pcm, 32).unwrap();
        assert_eq!(pcm.counters().resume, 1);
    }

    #[test]
    fn whole_buffer_is_ring_base() {
        let mut pcm = configured(Direction::Output);
        let region = begin(&mut pcm, 4, 100).unwrap();
        region.commit(&mut pcm, 100).unwrap();
        let base = whole_buffer(&mut pcm).unwrap();
        let region = begin(&mut pcm, 4, 10).unwrap();
        assert_eq!(region.base(), base);
        assert_eq!(region.ptr(), base.wrapping_add(400));
    }
}
