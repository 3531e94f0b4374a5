use super::mmap::attempt_resume;
use super::transport::PcmTransport;
use crate::clock;
use crate::error::{ESTRPIPE, IoError, Result};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use std::time::{Duration, Instant};
use tracing::{error, warn};

pub const UNDERRUN_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Rate limiter for the "avail beyond buffer" warning.
#[derive(Debug, Default)]
pub struct UnderrunLog {
    last: Option<Instant>,
    suppressed: usize,
}

impl UnderrunLog {
    fn should_log(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < UNDERRUN_LOG_INTERVAL => {
                self.suppressed += 1;
                false
            }
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Underruns seen since the last one that was logged.
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }
}

/// Frames available to the application, with the time they were measured.
///
/// A suspended or overrun PCM is resumed here and reported as empty with a
/// zero timestamp; the caller sees success.
pub fn available_frames(
    transport: &mut dyn PcmTransport,
    buf_size: usize,
    severe_underrun_frames: usize,
    dev_name: &str,
    log: &mut UnderrunLog,
) -> Result<(usize, TimeSpec)> {
    let mut avail = match transport.avail() {
        Ok(avail) => avail,
        Err(err) => return resume_or_fail(transport, err, "pcm_avail", dev_name),
    };

    if avail > buf_size {
        if log.should_log(Instant::now()) {
            warn!(
                "pcm_avail returned frames larger than buf_size: {dev_name}: {avail} > {buf_size} ({} since last)",
                log.suppressed
            );
            log.suppressed = 0;
        }
        if avail - buf_size > severe_underrun_frames {
            error!("severe underrun on {dev_name}: avail {avail}, buffer {buf_size}");
            return Err(IoError::SevereUnderrun {
                avail,
                buffer: buf_size,
                threshold: severe_underrun_frames,
            });
        }
        avail = buf_size;
    }

    let tstamp = match transport.htimestamp() {
        Ok((_, tstamp)) => tstamp,
        Err(err) => return resume_or_fail(transport, err, "pcm_htimestamp", dev_name),
    };
    Ok((avail, tstamp))
}

// An xrun or suspend is absorbed: resume and report an empty buffer.
fn resume_or_fail(
    transport: &mut dyn PcmTransport,
    err: Errno,
    op: &str,
    dev_name: &str,
) -> Result<(usize, TimeSpec)> {
    if err == Errno::EPIPE || err == ESTRPIPE {
        attempt_resume(transport).map_err(IoError::TransientIo)?;
        return Ok((0, clock::ZERO));
    }
    warn!("{op} error {dev_name}, {err}");
    Err(IoError::TransientIo(err))
}

/// Frames between the application pointer and the sound leaving (or
/// entering) the device, clamped to `[0, buf_size]`.
pub fn delay_frames(transport: &mut dyn PcmTransport, buf_size: usize) -> Result<usize> {
    let delay = transport.delay().map_err(|err| {
        warn!("pcm_delay error {}, {err}", transport.name());
        IoError::TransientIo(err)
    })?;
    Ok(delay.clamp(0, buf_size as i64) as usize)
}

/// Puts the application pointer `ahead` frames in front of the hardware
/// pointer and returns how far it moved (negative for a rewind).
pub fn resume_appl_ptr(transport: &mut dyn PcmTransport, ahead: usize) -> Result<i64> {
    let (buffer, _) = transport
        .buffer_params()
        .map_err(|e| IoError::transport("get_params", e))?;
    let avail = transport
        .avail()
        .map_err(|e| IoError::transport("pcm_avail", e))?;
    let ahead = ahead.min(buffer);
    let target_avail = (buffer - ahead) as i64;
    let to_move = avail as i64 - target_avail;
    if to_move > 0 {
        let moved = transport
            .forward(to_move as usize)
            .map_err(|e| IoError::transport("pcm_forward", e))?;
        Ok(moved as i64)
    } else if to_move < 0 {
        let moved = transport
            .rewind(to_move.unsigned_abs() as usize)
            .map_err(|e| IoError::transport("pcm_rewind", e))?;
        Ok(-(moved as i64))
    } else {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioFormat, Direction, SampleFormat};
    use crate::hw::params;
    use crate::hw::sim::{SimCaps, SimPcm};

    fn configured(direction: Direction) -> SimPcm {
        let mut pcm = SimPcm::new("sim", direction, SimCaps::default());
        pcm.open().unwrap();
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        params::commit(&mut pcm, &fmt, 4096, false, Duration::ZERO).unwrap();
        pcm
    }

    #[test]
    fn avail_within_buffer_is_returned() {
        let mut pcm = configured(Direction::Output);
        let mut log = UnderrunLog::default();
        let (avail, ts) = available_frames(&mut pcm, 4096, 5000, "sim", &mut log).unwrap();
        assert_eq!(avail, 4096);
        assert_ne!(ts, clock::ZERO);
    }

    #[test]
    fn mild_underrun_is_clamped() {
        let mut pcm = configured(Direction::Output);
        pcm.set_avail(Some(4096 + 100));
        let mut log = UnderrunLog::default();
        let (avail, _) = available_frames(&mut pcm, 4096, 5000, "sim", &mut log).unwrap();
        assert_eq!(avail, 4096);
    }

    #[test]
    fn severe_underrun_is_reported() {
        let mut pcm = configured(Direction::Output);
        pcm.set_avail(Some(4096 + 5001));
        let mut log = UnderrunLog::default();
        let err = available_frames(&mut pcm, 4096, 5000, "sim", &mut log).unwrap_err();
        assert_eq!(
            err,
            IoError::SevereUnderrun {
                avail: 9097,
                buffer: 4096,
                threshold: 5000
            }
        );

        pcm.set_avail(Some(4096 + 5000));
        assert!(available_frames(&mut pcm, 4096, 5000, "sim", &mut log).is_ok());
    }

    #[test]
    fn underrun_warning_is_rate_limited() {
        let mut log = UnderrunLog::default();
        let start = Instant::now();
        assert!(log.should_log(start));
        assert!(!log.should_log(start + Duration::from_secs(10)));
        assert!(!log.should_log(start + Duration::from_secs(29)));
        assert_eq!(log.suppressed(), 2);
        assert!(log.should_log(start + Duration::from_secs(31)));
    }

    #[test]
    fn xrun_resumes_and_reports_empty() {
        let mut pcm = configured(Direction::Output);
        pcm.push_avail_fault(Errno::EPIPE);
        let mut log = UnderrunLog::default();
        let (avail, ts) = available_frames(&mut pcm, 4096, 5000, "sim", &mut log).unwrap();
        assert_eq!(avail, 0);
        assert_eq!(ts, clock::ZERO);
        assert_eq!(pcm.counters().resume, 1);

        pcm.push_avail_fault(Errno::ENODEV);
        let err = available_frames(&mut pcm, 4096, 5000, "sim", &mut log).unwrap_err();
        assert_eq!(err, IoError::TransientIo(Errno::ENODEV));
    }

    #[test]
    fn suspend_seen_by_timestamp_query_is_resumed() {
        let mut pcm = configured(Direction::Output);
        pcm.push_htimestamp_fault(ESTRPIPE);
        let mut log = UnderrunLog::default();
        let (avail, ts) = available_frames(&mut pcm, 4096, 5000, "sim", &mut log).unwrap();
        assert_eq!(avail, 0);
        assert_eq!(ts, clock::ZERO);
        assert_eq!(pcm.counters().resume, 1);

        pcm.push_htimestamp_fault(Errno::EIO);
        let err = available_frames(&mut pcm, 4096, 5000, "sim", &mut log).unwrap_err();
        assert_eq!(err, IoError::TransientIo(Errno::EIO));
    }

    #[test]
    fn delay_is_clamped() {
        let mut pcm = configured(Direction::Output);
        pcm.set_delay(Some(-12));
        assert_eq!(delay_frames(&mut pcm, 4096).unwrap(), 0);
        pcm.set_delay(Some(5000));
        assert_eq!(delay_frames(&mut pcm, 4096).unwrap(), 4096);
        pcm.set_delay(Some(300));
        assert_eq!(delay_frames(&mut pcm, 4096).unwrap(), 300);
    }

    #[test]
    fn appl_ptr_is_moved_ahead_of_hw_ptr() {
        let mut pcm = configured(Direction::Output);
        assert_eq!(resume_appl_ptr(&mut pcm, 1024).unwrap(), 1024);
        assert_eq!(pcm.appl_ptr() - pcm.hw_ptr(), 1024);

        assert_eq!(resume_appl_ptr(&mut pcm, 256).unwrap(), -768);
        assert_eq!(pcm.appl_ptr() - pcm.hw_ptr(), 256);

        assert_eq!(resume_appl_ptr(&mut pcm, 256).unwrap(), 0);
    }
}
