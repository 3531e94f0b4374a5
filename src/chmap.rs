use crate::error::{IoError, Result};
use crate::format::{ALL_CHANNELS, AudioFormat, CH_MAX, Channel, Direction, POSITION_MONO};
use crate::hw::transport::PcmTransport;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChmapKind {
    /// No reordering allowed.
    Fixed,
    /// Any permutation of the positions may be committed.
    Variable,
    /// Positions may only be swapped within adjacent pairs.
    Paired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMapCandidate {
    pub kind: ChmapKind,
    pub positions: Vec<u32>,
}

impl ChannelMapCandidate {
    pub fn new(kind: ChmapKind, positions: Vec<u32>) -> Self {
        Self { kind, positions }
    }

    pub fn from_channels(kind: ChmapKind, channels: &[Channel]) -> Self {
        Self::new(kind, channels.iter().map(|ch| ch.position()).collect())
    }

    pub fn channels(&self) -> usize {
        self.positions.len()
    }

    fn contains(&self, ch: Channel) -> bool {
        self.positions.contains(&ch.position())
    }

    /// Layout of `fmt` as seen through this candidate's positions.
    fn layout_for(&self, fmt: &AudioFormat) -> AudioFormat {
        let mut out = fmt.clone();
        out.clear_channel_layout();
        for (slot, &pos) in self.positions.iter().enumerate() {
            if let Some(ch) = Channel::from_position(pos) {
                out.channel_layout[ch.index()] = slot as i8;
            }
        }
        out
    }
}

fn is_exact_match(candidate: &ChannelMapCandidate, fmt: &AudioFormat) -> bool {
    if candidate.channels() != fmt.num_channels {
        return false;
    }
    for ch in ALL_CHANNELS {
        let Some(slot) = fmt.slot_of(ch) else {
            continue;
        };
        if slot >= candidate.channels() {
            continue;
        }
        if candidate.positions[slot] != ch.position() {
            return false;
        }
    }
    true
}

fn contains_all_roles(candidate: &ChannelMapCandidate, fmt: &AudioFormat) -> bool {
    ALL_CHANNELS
        .into_iter()
        .filter(|&ch| fmt.slot_of(ch).is_some())
        .all(|ch| candidate.contains(ch))
}

fn is_pair_swap_match(candidate: &ChannelMapCandidate, fmt: &AudioFormat) -> bool {
    let n = fmt.num_channels;
    for i in (0..n).step_by(2) {
        let Some(first) = Channel::from_position(candidate.positions[i]) else {
            return false;
        };
        let Some(second) = candidate
            .positions
            .get(i + 1)
            .and_then(|&pos| Channel::from_position(pos))
        else {
            return false;
        };
        let idx = fmt.channel_layout[first.index()];
        if idx < 0 || idx & 0x01 != 0 {
            return false;
        }
        if idx + 1 != fmt.channel_layout[second.index()] {
            return false;
        }
    }
    true
}

fn find_permutable(
    candidates: &[ChannelMapCandidate],
    fmt: &AudioFormat,
) -> Option<ChannelMapCandidate> {
    for candidate in candidates {
        if candidate.kind == ChmapKind::Fixed || candidate.channels() != fmt.num_channels {
            continue;
        }
        if candidate.kind == ChmapKind::Variable && contains_all_roles(candidate, fmt) {
            return Some(candidate.clone());
        }
        if is_pair_swap_match(candidate, fmt) {
            return Some(candidate.clone());
        }
    }
    None
}

fn find_convertible(
    candidates: &[ChannelMapCandidate],
    fmt: &AudioFormat,
) -> Option<ChannelMapCandidate> {
    candidates
        .iter()
        .filter(|c| c.channels() == fmt.num_channels)
        .find(|c| conversion_matrix(fmt, &c.layout_for(fmt)).is_some())
        .cloned()
}

/// Picks the best channel map for `fmt` among the transport's candidates.
///
/// Tiers are tried in order: exact position match, permutable (variable or
/// pair-swappable) match, convertible through a channel matrix, and for
/// capture devices the first candidate with the right channel count.
pub fn select_best_layout(
    candidates: &[ChannelMapCandidate],
    fmt: &AudioFormat,
    direction: Direction,
) -> Option<ChannelMapCandidate> {
    if let Some(exact) = candidates.iter().find(|c| is_exact_match(c, fmt)) {
        return Some(exact.clone());
    }
    if let Some(permutable) = find_permutable(candidates, fmt) {
        return Some(permutable);
    }
    if let Some(convertible) = find_convertible(candidates, fmt) {
        return Some(convertible);
    }
    if direction == Direction::Input {
        return candidates
            .iter()
            .find(|c| c.channels() == fmt.num_channels)
            .cloned();
    }
    None
}

fn surround_alternative(ch: Channel) -> Option<Channel> {
    match ch {
        Channel::SideLeft => Some(Channel::RearLeft),
        Channel::SideRight => Some(Channel::RearRight),
        Channel::RearLeft => Some(Channel::SideLeft),
        Channel::RearRight => Some(Channel::SideRight),
        _ => None,
    }
}

/// Builds an `out.num_channels x input.num_channels` matrix converting frames
/// laid out as `input` into frames laid out as `out`.
///
/// Returns `None` when a populated input role has no place in the output
/// layout, or when either layout points past its channel count.
pub fn conversion_matrix(input: &AudioFormat, out: &AudioFormat) -> Option<Vec<Vec<f32>>> {
    for ch in 0..CH_MAX {
        if input.channel_layout[ch] >= input.num_channels as i8
            || out.channel_layout[ch] >= out.num_channels as i8
        {
            warn!("Invalid channel layout, can't build conversion matrix");
            return None;
        }
    }

    let mut mtx = vec![vec![0.0_f32; input.num_channels]; out.num_channels];
    for ch in ALL_CHANNELS {
        let Some(in_idx) = input.slot_of(ch) else {
            continue;
        };
        if let Some(out_idx) = out.slot_of(ch) {
            mtx[out_idx][in_idx] = 1.0;
            continue;
        }
        if let Some(alt) = surround_alternative(ch)
            && input.slot_of(alt).is_none()
            && let Some(out_idx) = out.slot_of(alt)
        {
            mtx[out_idx][in_idx] = 1.0;
            continue;
        }
        if ch == Channel::FrontCenter
            && let (Some(left), Some(right)) = (
                out.slot_of(Channel::FrontLeft),
                out.slot_of(Channel::FrontRight),
            )
        {
            mtx[left][in_idx] += std::f32::consts::FRAC_1_SQRT_2;
            mtx[right][in_idx] += std::f32::consts::FRAC_1_SQRT_2;
            continue;
        }
        debug!("No place for {ch:?} in output layout");
        return None;
    }

    if mtx.iter().flatten().all(|&v| v == 0.0) {
        return None;
    }
    Some(mtx)
}

/// Commits the best channel map for `fmt` to the transport.
///
/// Only attempted for more than two channels. Every failure is a warning:
/// the device keeps its default channel order.
pub fn set_channel_map(
    transport: &mut dyn PcmTransport,
    fmt: &AudioFormat,
) -> Option<ChannelMapCandidate> {
    if fmt.num_channels <= 2 {
        return None;
    }
    let Some(candidates) = transport.query_chmaps() else {
        warn!("No chmap queried! Skip chmap set");
        return None;
    };
    let Some(mut best) = select_best_layout(&candidates, fmt, transport.direction()) else {
        warn!("Unable to find the best channel map");
        return None;
    };

    for slot in 0..fmt.num_channels {
        if let Some(ch) = fmt.channel_at(slot) {
            best.positions[slot] = ch.position();
        }
    }
    if let Err(err) = transport.set_chmap(&best.positions) {
        warn!("Unable to set channel map: {err}");
        return None;
    }
    Some(best)
}

/// Fills `fmt.channel_layout` from the channel map the transport would use.
pub fn get_channel_map(transport: &mut dyn PcmTransport, fmt: &mut AudioFormat) -> Result<()> {
    let candidates = transport
        .query_chmaps()
        .ok_or(IoError::ChannelMapUnavailable)?;
    let Some(best) = select_best_layout(&candidates, fmt, transport.direction()) else {
        warn!("Unable to find the best channel map");
        return Err(IoError::ChannelMapUnavailable);
    };

    fmt.clear_channel_layout();
    for (slot, &pos) in best.positions.iter().enumerate().take(fmt.num_channels) {
        if let Some(ch) = Channel::from_position(pos) {
            fmt.channel_layout[ch.index()] = slot as i8;
        }
    }
    if best.channels() == 1 && best.positions[0] == POSITION_MONO {
        fmt.channel_layout[Channel::FrontCenter.index()] = 0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use Channel::*;

    fn surround51() -> AudioFormat {
        AudioFormat::new(SampleFormat::S16LE, 48000, 6)
    }

    #[test]
    fn exact_match_wins_regardless_of_order() {
        let fmt = surround51();
        let variable = ChannelMapCandidate::from_channels(
            ChmapKind::Variable,
            &[FrontRight, FrontLeft, RearLeft, RearRight, FrontCenter, LowFrequency],
        );
        let exact = ChannelMapCandidate::from_channels(
            ChmapKind::Fixed,
            &[FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter, LowFrequency],
        );
        let candidates = vec![variable.clone(), exact.clone()];
        assert_eq!(
            select_best_layout(&candidates, &fmt, Direction::Output),
            Some(exact.clone())
        );
        let reversed = vec![exact.clone(), variable];
        assert_eq!(
            select_best_layout(&reversed, &fmt, Direction::Output),
            Some(exact)
        );
    }

    #[test]
    fn variable_permutation_is_accepted() {
        let fmt = surround51();
        let fixed = ChannelMapCandidate::from_channels(
            ChmapKind::Fixed,
            &[FrontCenter, LowFrequency, FrontLeft, FrontRight, RearLeft, SideLeft],
        );
        let variable = ChannelMapCandidate::from_channels(
            ChmapKind::Variable,
            &[FrontCenter, LowFrequency, FrontLeft, FrontRight, RearLeft, RearRight],
        );
        let got = select_best_layout(&[fixed, variable.clone()], &fmt, Direction::Output);
        assert_eq!(got, Some(variable));
    }

    #[test]
    fn paired_swap_is_accepted() {
        let fmt = surround51();
        let paired = ChannelMapCandidate::from_channels(
            ChmapKind::Paired,
            &[FrontLeft, FrontRight, FrontCenter, LowFrequency, RearLeft, RearRight],
        );
        // Pair (FC, LFE) lands on slots (4, 5) of the request.
        let got = select_best_layout(&[paired.clone()], &fmt, Direction::Output);
        assert_eq!(got, Some(paired));
    }

    #[test]
    fn side_channels_convert_to_rear() {
        let mut fmt = surround51();
        fmt.clear_channel_layout();
        for (slot, ch) in [FrontLeft, FrontRight, SideLeft, SideRight, FrontCenter, LowFrequency]
            .into_iter()
            .enumerate()
        {
            fmt.channel_layout[ch.index()] = slot as i8;
        }
        let fixed = ChannelMapCandidate::from_channels(
            ChmapKind::Fixed,
            &[FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter, LowFrequency],
        );
        let got = select_best_layout(&[fixed.clone()], &fmt, Direction::Output);
        assert_eq!(got, Some(fixed.clone()));

        let mtx = conversion_matrix(&fmt, &fixed.layout_for(&fmt)).expect("convertible");
        assert_eq!(mtx[2][2], 1.0);
        assert_eq!(mtx[3][3], 1.0);
    }

    #[test]
    fn capture_falls_back_to_first_with_channel_count() {
        let fmt = surround51();
        let odd = ChannelMapCandidate::new(ChmapKind::Fixed, vec![1, 1, 1, 1, 1, 1]);
        assert_eq!(select_best_layout(&[odd.clone()], &fmt, Direction::Output), None);
        assert_eq!(select_best_layout(&[odd.clone()], &fmt, Direction::Input), Some(odd));
    }

    #[test]
    fn matrix_rejects_unplaceable_role() {
        let input = AudioFormat::new(SampleFormat::S16LE, 48000, 6);
        let mut out = input.clone();
        out.channel_layout[LowFrequency.index()] = -1;
        assert!(conversion_matrix(&input, &out).is_none());
    }
}
