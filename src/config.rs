use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// JSON file with an [`IoOptions`] object, applied before the env overrides.
pub const PROFILE_ENV: &str = "PCM_IODEV_PROFILE";
pub const PERIOD_WAKEUP_ENV: &str = "PCM_IODEV_PERIOD_WAKEUP";
pub const DMA_PERIOD_TIME_ENV: &str = "PCM_IODEV_DMA_PERIOD_US";
pub const SEVERE_UNDERRUN_ENV: &str = "PCM_IODEV_SEVERE_UNDERRUN_FRAMES";
pub const BUFFER_FRAMES_ENV: &str = "PCM_IODEV_BUFFER_FRAMES";

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("ignoring {key}={raw}: {e}");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IoOptions {
    /// Buffer size asked for when the hardware cannot report its maximum.
    pub buffer_frames: usize,
    pub period_wakeup: bool,
    /// Requested DMA period in microseconds; 0 leaves the driver default.
    pub dma_period_time_us: u32,
    /// How far past the buffer size `avail` may go before it is an error.
    pub severe_underrun_frames: usize,
    /// Frames kept queued on output when the application pointer is reset.
    pub min_buffer_level: usize,
}

impl Default for IoOptions {
    fn default() -> Self {
        Self {
            buffer_frames: 4096,
            period_wakeup: false,
            dma_period_time_us: 0,
            severe_underrun_frames: 5000,
            min_buffer_level: 0,
        }
    }
}

impl IoOptions {
    pub fn dma_period_time(&self) -> Duration {
        Duration::from_micros(self.dma_period_time_us as u64)
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("invalid io options: {e}"))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read '{}': {e}", path.display()))?;
        Self::from_json(&json)
    }

    /// Defaults, then the profile file if one is named, then single-value
    /// overrides.
    pub fn from_env() -> Self {
        let mut opts = match std::env::var(PROFILE_ENV) {
            Ok(path) => Self::load(Path::new(&path)).unwrap_or_else(|e| {
                warn!("{e}");
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        opts.apply_env();
        opts
    }

    fn apply_env(&mut self) {
        if std::env::var_os(PERIOD_WAKEUP_ENV).is_some() {
            self.period_wakeup = env_flag(PERIOD_WAKEUP_ENV);
        }
        if let Some(us) = env_usize(DMA_PERIOD_TIME_ENV) {
            self.dma_period_time_us = us as u32;
        }
        if let Some(frames) = env_usize(SEVERE_UNDERRUN_ENV) {
            self.severe_underrun_frames = frames;
        }
        if let Some(frames) = env_usize(BUFFER_FRAMES_ENV) {
            self.buffer_frames = frames;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let opts = IoOptions::from_json(r#"{"period_wakeup": true, "dma_period_time_us": 2000}"#)
            .unwrap();
        assert!(opts.period_wakeup);
        assert_eq!(opts.dma_period_time(), Duration::from_millis(2));
        assert_eq!(opts.severe_underrun_frames, 5000);
        assert_eq!(opts.buffer_frames, 4096);
    }

    #[test]
    fn bad_json_is_an_error() {
        let err = IoOptions::from_json(r#"{"buffer_frames": "lots"}"#).unwrap_err();
        assert!(err.starts_with("invalid io options"));
    }

    #[test]
    fn env_overrides_apply() {
        // Only this test touches these variables.
        unsafe {
            std::env::set_var(SEVERE_UNDERRUN_ENV, "1200");
            std::env::set_var(PERIOD_WAKEUP_ENV, "yes");
            std::env::set_var(BUFFER_FRAMES_ENV, "not-a-number");
        }
        let mut opts = IoOptions::default();
        opts.apply_env();
        assert_eq!(opts.severe_underrun_frames, 1200);
        assert!(opts.period_wakeup);
        assert_eq!(opts.buffer_frames, 4096);
        unsafe {
            std::env::remove_var(SEVERE_UNDERRUN_ENV);
            std::env::remove_var(PERIOD_WAKEUP_ENV);
            std::env::remove_var(BUFFER_FRAMES_ENV);
        }
    }
}
