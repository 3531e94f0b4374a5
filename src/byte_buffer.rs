/// Fixed-capacity byte ring with contiguous read and write windows.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    bytes: Vec<u8>,
    write_idx: usize,
    read_idx: usize,
    level: usize,
}

impl ByteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
            write_idx: 0,
            read_idx: 0,
            level: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes waiting to be read.
    pub fn queued(&self) -> usize {
        self.level
    }

    /// Bytes that can still be written, across the wrap point.
    pub fn available(&self) -> usize {
        self.capacity() - self.level
    }

    /// Writable bytes before the write index wraps.
    pub fn writable(&self) -> usize {
        if self.level >= self.capacity() {
            0
        } else if self.write_idx < self.read_idx {
            self.read_idx - self.write_idx
        } else {
            self.capacity() - self.write_idx
        }
    }

    /// Readable bytes before the read index wraps.
    pub fn readable(&self) -> usize {
        if self.level == 0 {
            0
        } else if self.read_idx < self.write_idx {
            self.write_idx - self.read_idx
        } else {
            self.capacity() - self.read_idx
        }
    }

    pub fn write_slice(&mut self) -> &mut [u8] {
        let len = self.writable();
        &mut self.bytes[self.write_idx..self.write_idx + len]
    }

    pub fn read_slice(&self) -> &[u8] {
        &self.bytes[self.read_idx..self.read_idx + self.readable()]
    }

    pub fn increment_write(&mut self, n: usize) {
        let n = n.min(self.available());
        self.level += n;
        self.write_idx = (self.write_idx + n) % self.capacity().max(1);
    }

    pub fn increment_read(&mut self, n: usize) {
        let n = n.min(self.level);
        self.level -= n;
        self.read_idx = (self.read_idx + n) % self.capacity().max(1);
    }

    /// Copies as much of `src` as fits, in at most two chunks.
    pub fn push(&mut self, mut src: &[u8]) -> usize {
        let mut copied = 0;
        while !src.is_empty() {
            let window = self.write_slice();
            let n = window.len().min(src.len());
            if n == 0 {
                break;
            }
            window[..n].copy_from_slice(&src[..n]);
            self.increment_write(n);
            copied += n;
            src = &src[n..];
        }
        copied
    }

    /// Writes `n` zero bytes (capped by free space) and returns how many.
    pub fn fill_silence(&mut self, n: usize) -> usize {
        let mut left = n.min(self.available());
        let total = left;
        while left > 0 {
            let window = self.write_slice();
            let chunk = window.len().min(left);
            window[..chunk].fill(0);
            self.increment_write(chunk);
            left -= chunk;
        }
        total
    }

    pub fn reset(&mut self) {
        self.write_idx = 0;
        self.read_idx = 0;
        self.level = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_split_at_wrap() {
        let mut buf = ByteBuffer::new(8);
        assert_eq!(buf.push(&[1, 2, 3, 4, 5, 6]), 6);
        buf.increment_read(4);
        assert_eq!(buf.read_slice(), &[5, 6]);
        assert_eq!(buf.writable(), 2);
        assert_eq!(buf.available(), 6);

        assert_eq!(buf.push(&[7, 8, 9, 10]), 4);
        assert_eq!(buf.read_slice(), &[5, 6, 7, 8]);
        buf.increment_read(4);
        assert_eq!(buf.read_slice(), &[9, 10]);
        assert_eq!(buf.queued(), 2);
    }

    #[test]
    fn push_drops_overflow() {
        let mut buf = ByteBuffer::new(4);
        assert_eq!(buf.push(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(buf.writable(), 0);
        assert_eq!(buf.push(&[7]), 0);
        assert_eq!(buf.readable(), 4);
    }

    #[test]
    fn silence_fill_is_capped() {
        let mut buf = ByteBuffer::new(8);
        buf.push(&[9; 3]);
        assert_eq!(buf.fill_silence(10), 5);
        buf.increment_read(3);
        assert_eq!(buf.read_slice(), &[0; 5]);
        buf.reset();
        assert_eq!(buf.queued(), 0);
        assert_eq!(buf.writable(), 8);
    }
}
