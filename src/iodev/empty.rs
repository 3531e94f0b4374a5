use super::{BufferRegion, IoBackend};
use crate::clock;
use crate::error::Result;
use crate::format::{AudioFormat, Direction};
use nix::sys::time::TimeSpec;

pub const EMPTY_BUFFER_SIZE: usize = 4096;

/// Placeholder that keeps streams alive while no real device exists.
///
/// Output frames are consumed at the nominal rate; input produces silence
/// at the nominal rate, capped at the buffer size.
pub struct EmptyBackend {
    direction: Direction,
    rate: usize,
    frame_bytes: usize,
    queued: usize,
    last_update: TimeSpec,
    scratch: Vec<u8>,
}

impl EmptyBackend {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            rate: 48_000,
            frame_bytes: 4,
            queued: 0,
            last_update: clock::ZERO,
            scratch: Vec::new(),
        }
    }

    fn advance(&mut self) -> TimeSpec {
        let now = clock::now();
        let elapsed = clock::frames_between(self.last_update, now, self.rate) as usize;
        // Only move the reference once a whole frame has elapsed.
        if elapsed > 0 {
            self.last_update = now;
        }
        self.queued = match self.direction {
            Direction::Output => self.queued.saturating_sub(elapsed),
            Direction::Input => (self.queued + elapsed).min(EMPTY_BUFFER_SIZE),
        };
        now
    }
}

impl IoBackend for EmptyBackend {
    fn configure(&mut self, fmt: &mut AudioFormat) -> Result<usize> {
        self.rate = fmt.frame_rate.max(1);
        self.frame_bytes = fmt.frame_bytes().max(1);
        self.queued = 0;
        self.last_update = clock::now();
        self.scratch = vec![0; EMPTY_BUFFER_SIZE * self.frame_bytes];
        Ok(EMPTY_BUFFER_SIZE)
    }

    fn close(&mut self) -> Result<()> {
        self.queued = 0;
        self.scratch = Vec::new();
        Ok(())
    }

    fn get_buffer(&mut self, frames: usize) -> Result<BufferRegion<'_>> {
        self.advance();
        let granted = match self.direction {
            Direction::Output => frames.min(EMPTY_BUFFER_SIZE - self.queued),
            Direction::Input => frames.min(self.queued),
        };
        let bytes = &mut self.scratch[..granted * self.frame_bytes];
        bytes.fill(0);
        Ok(BufferRegion {
            bytes,
            frames: granted,
        })
    }

    fn put_buffer(&mut self, frames: usize) -> Result<()> {
        self.queued = match self.direction {
            Direction::Output => (self.queued + frames).min(EMPTY_BUFFER_SIZE),
            Direction::Input => self.queued.saturating_sub(frames),
        };
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        self.advance();
        let dropped = match self.direction {
            Direction::Output => 0,
            Direction::Input => std::mem::take(&mut self.queued),
        };
        Ok(dropped)
    }

    fn frames_queued(&mut self) -> Result<(usize, TimeSpec)> {
        let now = self.advance();
        Ok((self.queued, now))
    }

    fn delay_frames(&mut self) -> Result<usize> {
        self.frames_queued().map(|(frames, _)| frames)
    }

    fn update_channel_layout(&mut self, fmt: &mut AudioFormat) -> Result<()> {
        fmt.set_default_channel_layout();
        Ok(())
    }
}
