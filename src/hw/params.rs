use super::transport::PcmTransport;
use crate::error::{IoError, Result, negotiation_error};
use crate::format::{AudioFormat, SampleFormat};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Rates probed on every device, in order of preference.
pub const TEST_SAMPLE_RATES: [usize; 9] = [
    44100, 48000, 32000, 96000, 22050, 16000, 8000, 4000, 192000,
];
/// Channel counts probed on every device, in order of preference.
pub const TEST_CHANNEL_COUNTS: [usize; 6] = [10, 6, 4, 2, 1, 8];
pub const TEST_FORMATS: [SampleFormat; 4] = [
    SampleFormat::S16LE,
    SampleFormat::S24LE,
    SampleFormat::S32LE,
    SampleFormat::S24_3LE,
];
/// Highest channel count accepted from the transport's reported maximum.
pub const CHANNEL_LIMIT: u32 = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareCapabilities {
    pub rates: Vec<usize>,
    pub channel_counts: Vec<usize>,
    pub formats: Vec<SampleFormat>,
}

impl HardwareCapabilities {
    pub fn supports(&self, fmt: &AudioFormat) -> bool {
        self.rates.contains(&fmt.frame_rate)
            && self.channel_counts.contains(&fmt.num_channels)
            && self.formats.contains(&fmt.format)
    }
}

pub fn probe(transport: &mut dyn PcmTransport) -> Result<HardwareCapabilities> {
    transport.hw_params_any().map_err(|e| {
        warn!("hw_params_any: {e}");
        IoError::transport("hw_params_any", e)
    })?;

    let rates: Vec<usize> = TEST_SAMPLE_RATES
        .into_iter()
        .filter(|&rate| transport.hw_test_rate(rate as u32))
        .collect();
    if rates.is_empty() {
        warn!("{}: no valid sample rates", transport.name());
        return Err(IoError::Negotiation("no valid sample rates".to_string()));
    }

    let mut channel_counts: Vec<usize> = TEST_CHANNEL_COUNTS
        .into_iter()
        .filter(|&ch| transport.hw_test_channels(ch as u32))
        .collect();
    if channel_counts.is_empty() {
        match transport.hw_channels_max() {
            Ok(max) if max <= CHANNEL_LIMIT => channel_counts.push(max as usize),
            Ok(max) => {
                warn!("{}: can't support {max} channels", transport.name());
                return Err(IoError::Negotiation(format!(
                    "{max} channels exceeds limit of {CHANNEL_LIMIT}"
                )));
            }
            Err(e) => {
                warn!("{}: no valid channel counts found", transport.name());
                return Err(negotiation_error("channels_max", e));
            }
        }
    }

    let formats: Vec<SampleFormat> = TEST_FORMATS
        .into_iter()
        .filter(|&f| transport.hw_test_format(f))
        .collect();
    if formats.is_empty() {
        warn!("{}: no valid sample formats", transport.name());
        return Err(IoError::Negotiation("no valid sample formats".to_string()));
    }

    Ok(HardwareCapabilities {
        rates,
        channel_counts,
        formats,
    })
}

fn step<T>(res: std::result::Result<T, nix::errno::Errno>, op: &'static str) -> Result<T> {
    res.map_err(|e| {
        warn!("{op}: {e}");
        IoError::transport(op, e)
    })
}

/// Commits `format` to the transport and returns the buffer size in frames.
///
/// Every step refines the staged parameter space; the device only sees the
/// configuration on the final apply, so an early failure leaves it as it was.
pub fn commit(
    transport: &mut dyn PcmTransport,
    format: &AudioFormat,
    buffer_frames: usize,
    period_wakeup: bool,
    dma_period_time: Duration,
) -> Result<usize> {
    let rate = format.frame_rate as u32;

    step(transport.hw_params_any(), "hw_params_any")?;
    step(transport.hw_set_rate_resample(false), "disable resampling")?;
    step(
        transport.hw_set_access_mmap_interleaved(),
        "set mmap interleaved access",
    )?;

    // Without period wakeups the server keeps its own timer.
    if !period_wakeup && transport.hw_can_disable_period_wakeup() {
        if let Err(e) = transport.hw_set_period_wakeup(false) {
            warn!("disabling wakeups: {e}");
        }
    }

    if !dma_period_time.is_zero() {
        let wanted = dma_period_time.as_micros() as u32;
        let chosen = step(
            transport.hw_set_period_time_near(wanted),
            "set period time",
        )?;
        if chosen != wanted {
            debug!("period time set to: {chosen}us");
        }
    }

    step(transport.hw_set_format(format.format), "set format")?;

    let ret_rate = step(transport.hw_set_rate_near(rate), "set_rate_near")?;
    if ret_rate != rate {
        warn!("tried for {rate}Hz, settled for {ret_rate}Hz");
        return Err(negotiation_error(
            "set_rate_near",
            format!("tried {rate}Hz, settled for {ret_rate}Hz"),
        ));
    }

    step(
        transport.hw_set_channels(format.num_channels as u32),
        "set channels",
    )?;

    let mut buffer = buffer_frames;
    match transport.hw_buffer_size_max() {
        Ok(max) => buffer = max,
        Err(e) => warn!("get buffer max: {e}"),
    }
    // Odd buffer sizes are rejected by hw_params on some drivers.
    buffer &= !0x01;
    let buffer = step(
        transport.hw_set_buffer_size_max(buffer),
        "set_buffer_size_max",
    )?;
    debug!("buffer size set to {buffer}");

    transport.hw_params_apply().map_err(|e| {
        error!(
            "hw_params: {e}: rate: {rate}, ret_rate: {ret_rate}, channel: {}, format: {:?}",
            format.num_channels, format.format
        );
        IoError::transport("hw_params", e)
    })?;
    Ok(buffer)
}

/// Never auto-stop, never auto-start, no period events.
pub fn commit_sw_params(transport: &mut dyn PcmTransport) -> Result<()> {
    step(transport.sw_params_current(), "sw_params_current")?;
    let boundary = step(transport.sw_boundary(), "get_boundary")?;
    step(
        transport.sw_set_stop_threshold(boundary),
        "set_stop_threshold",
    )?;
    step(
        transport.sw_set_start_threshold(isize::MAX as usize),
        "set_start_threshold",
    )?;
    step(transport.sw_set_period_event(false), "set_period_event")?;
    step(transport.sw_params_apply(), "sw_params")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Direction;
    use crate::hw::sim::{SimCaps, SimPcm};

    fn opened(caps: SimCaps) -> SimPcm {
        let mut pcm = SimPcm::new("sim", Direction::Output, caps);
        pcm.open().unwrap();
        pcm
    }

    #[test]
    fn probe_keeps_preference_order() {
        let mut pcm = opened(SimCaps {
            rates: vec![48000, 44100],
            channels: vec![2, 6],
            formats: vec![SampleFormat::S32LE, SampleFormat::S16LE],
            ..SimCaps::default()
        });
        let caps = probe(&mut pcm).unwrap();
        assert_eq!(caps.rates, vec![44100, 48000]);
        assert_eq!(caps.channel_counts, vec![6, 2]);
        assert_eq!(caps.formats, vec![SampleFormat::S16LE, SampleFormat::S32LE]);
    }

    #[test]
    fn probe_falls_back_to_channels_max() {
        let mut pcm = opened(SimCaps {
            channels: vec![12],
            channels_max: 12,
            ..SimCaps::default()
        });
        assert_eq!(probe(&mut pcm).unwrap().channel_counts, vec![12]);

        let mut wide = opened(SimCaps {
            channels: vec![24],
            channels_max: 24,
            ..SimCaps::default()
        });
        assert!(matches!(probe(&mut wide), Err(IoError::Negotiation(_))));
    }

    #[test]
    fn probe_without_rates_fails() {
        let mut pcm = opened(SimCaps {
            rates: vec![11025],
            ..SimCaps::default()
        });
        assert!(matches!(probe(&mut pcm), Err(IoError::Negotiation(_))));
    }

    #[test]
    fn commit_rounds_buffer_down_to_even() {
        let mut pcm = opened(SimCaps {
            buffer_max: 4097,
            ..SimCaps::default()
        });
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        let buffer = commit(&mut pcm, &fmt, 1024, false, Duration::from_millis(5)).unwrap();
        assert_eq!(buffer, 4096);
        let applied = pcm.applied().unwrap();
        assert_eq!(applied.buffer_frames, 4096);
        assert!(!applied.resample);
        assert!(!applied.period_wakeup);
        assert_eq!(applied.period_time_us, 5000);
    }

    #[test]
    fn rate_mismatch_leaves_device_untouched() {
        let mut pcm = opened(SimCaps {
            rates: vec![44100],
            ..SimCaps::default()
        });
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        let err = commit(&mut pcm, &fmt, 4096, true, Duration::ZERO).unwrap_err();
        assert!(matches!(err, IoError::Negotiation(_)));
        assert!(pcm.applied().is_none());
    }

    #[test]
    fn unsupported_format_aborts_commit() {
        let mut pcm = opened(SimCaps {
            formats: vec![SampleFormat::S32LE],
            ..SimCaps::default()
        });
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        let err = commit(&mut pcm, &fmt, 4096, true, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err,
            IoError::Transport {
                op: "set format",
                ..
            }
        ));
        assert!(pcm.applied().is_none());
    }

    #[test]
    fn sw_params_disable_auto_start_and_stop() {
        let mut pcm = opened(SimCaps::default());
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        commit(&mut pcm, &fmt, 4096, true, Duration::ZERO).unwrap();
        commit_sw_params(&mut pcm).unwrap();
        let sw = pcm.sw_applied().unwrap();
        assert_eq!(sw.start_threshold, isize::MAX as usize);
        assert_eq!(sw.stop_threshold, pcm.boundary());
        assert!(!sw.period_event);
    }
}
