use serde::{Deserialize, Serialize};

pub const CH_MAX: usize = 11;

/// Logical channel roles, in the order the transport position codes use
/// (shifted by [`POSITION_OFFSET`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    FrontLeft = 0,
    FrontRight,
    RearLeft,
    RearRight,
    FrontCenter,
    LowFrequency,
    SideLeft,
    SideRight,
    RearCenter,
    FrontLeftCenter,
    FrontRightCenter,
}

pub const ALL_CHANNELS: [Channel; CH_MAX] = [
    Channel::FrontLeft,
    Channel::FrontRight,
    Channel::RearLeft,
    Channel::RearRight,
    Channel::FrontCenter,
    Channel::LowFrequency,
    Channel::SideLeft,
    Channel::SideRight,
    Channel::RearCenter,
    Channel::FrontLeftCenter,
    Channel::FrontRightCenter,
];

pub const POSITION_UNKNOWN: u32 = 0;
pub const POSITION_NA: u32 = 1;
pub const POSITION_MONO: u32 = 2;
pub const POSITION_OFFSET: u32 = 3;

impl Channel {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        ALL_CHANNELS.get(idx).copied()
    }

    pub fn position(self) -> u32 {
        self as u32 + POSITION_OFFSET
    }

    pub fn from_position(pos: u32) -> Option<Self> {
        pos.checked_sub(POSITION_OFFSET)
            .and_then(|idx| Self::from_index(idx as usize))
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    S16LE,
    S24LE,
    S32LE,
    S24_3LE,
}

impl SampleFormat {
    pub fn bytes(self) -> usize {
        match self {
            Self::S16LE => 2,
            Self::S24LE | Self::S32LE => 4,
            Self::S24_3LE => 3,
        }
    }

    /// libasound `snd_pcm_format_t` value.
    pub fn alsa_code(self) -> i32 {
        match self {
            Self::S16LE => 2,
            Self::S24LE => 6,
            Self::S32LE => 10,
            Self::S24_3LE => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Output,
    Input,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub format: SampleFormat,
    pub frame_rate: usize,
    pub num_channels: usize,
    pub channel_layout: [i8; CH_MAX],
}

impl AudioFormat {
    pub fn new(format: SampleFormat, frame_rate: usize, num_channels: usize) -> Self {
        let mut fmt = Self {
            format,
            frame_rate,
            num_channels,
            channel_layout: [-1; CH_MAX],
        };
        fmt.set_default_channel_layout();
        fmt
    }

    pub fn frame_bytes(&self) -> usize {
        self.format.bytes() * self.num_channels
    }

    pub fn slot_of(&self, ch: Channel) -> Option<usize> {
        let idx = self.channel_layout[ch.index()];
        (idx >= 0).then_some(idx as usize)
    }

    /// Role occupying physical slot `slot`, if any.
    pub fn channel_at(&self, slot: usize) -> Option<Channel> {
        self.channel_layout
            .iter()
            .position(|&idx| idx >= 0 && idx as usize == slot)
            .and_then(Channel::from_index)
    }

    pub fn clear_channel_layout(&mut self) {
        self.channel_layout = [-1; CH_MAX];
    }

    pub fn set_default_channel_layout(&mut self) {
        for (ch, slot) in self.channel_layout.iter_mut().enumerate() {
            *slot = if ch < self.num_channels { ch as i8 } else { -1 };
        }
    }

    pub fn validate_layout(&self) -> Result<(), String> {
        let mut seen = [false; CH_MAX];
        for (ch, &idx) in self.channel_layout.iter().enumerate() {
            if idx < 0 {
                continue;
            }
            let slot = idx as usize;
            if slot >= self.num_channels {
                return Err(format!(
                    "channel {ch} mapped to slot {slot} of {}",
                    self.num_channels
                ));
            }
            if seen[slot] {
                return Err(format!("slot {slot} assigned twice"));
            }
            seen[slot] = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_follows_channel_order() {
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 6);
        assert_eq!(fmt.channel_layout, [0, 1, 2, 3, 4, 5, -1, -1, -1, -1, -1]);
        assert_eq!(fmt.frame_bytes(), 12);
        assert_eq!(fmt.channel_at(4), Some(Channel::FrontCenter));
        assert!(fmt.validate_layout().is_ok());
    }

    #[test]
    fn duplicate_slot_is_rejected() {
        let mut fmt = AudioFormat::new(SampleFormat::S32LE, 44100, 2);
        fmt.channel_layout[Channel::FrontCenter.index()] = 0;
        assert!(fmt.validate_layout().is_err());
        fmt.channel_layout[Channel::FrontCenter.index()] = 2;
        assert!(fmt.validate_layout().is_err());
    }

    #[test]
    fn positions_are_offset_by_three() {
        assert_eq!(Channel::FrontLeft.position(), 3);
        assert_eq!(Channel::from_position(POSITION_MONO), None);
        assert_eq!(Channel::from_position(13), Some(Channel::FrontRightCenter));
        assert_eq!(Channel::from_position(14), None);
    }
}
