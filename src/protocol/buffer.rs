//! Minimal big-endian cursor over a replication frame
//!
//! Walks a CopyData payload field by field with an explicit offset, rather
//! than destructively slicing the buffer as each field is consumed.

use crate::errors::{ReplicationError, ReplicationResult};

#[derive(Debug)]
pub struct FrameReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn read_u8(&mut self) -> ReplicationResult<u8> {
        if !self.has_bytes(1) {
            return Err(ReplicationError::buffer("not enough bytes for u8"));
        }
        let v = self.buffer[self.position];
        self.position += 1;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> ReplicationResult<u64> {
        if !self.has_bytes(8) {
            return Err(ReplicationError::buffer("not enough bytes for u64"));
        }
        let v = u64::from_be_bytes(self.buffer[self.position..self.position + 8].try_into().unwrap());
        self.position += 8;
        Ok(v)
    }

    pub fn read_i64(&mut self) -> ReplicationResult<i64> {
        self.read_u64().map(|v| v as i64)
    }

    /// Consume every remaining byte as the opaque message tail.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.buffer[self.position..];
        self.position = self.buffer.len();
        rest
    }
}

/// A fixed-size big-endian frame writer, sized up front by the caller.
pub struct FrameWriter {
    buffer: Vec<u8>,
}

impl FrameWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fields_in_order() {
        let data = [0x72u8, 0, 0, 0, 0, 0, 0, 0, 42, 1];
        let mut r = FrameReader::new(&data);
        assert_eq!(r.read_u8().unwrap(), 0x72);
        assert_eq!(r.read_u64().unwrap(), 42);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn errors_on_short_buffer() {
        let data = [0u8; 3];
        let mut r = FrameReader::new(&data);
        assert!(r.read_u64().is_err());
    }

    #[test]
    fn writer_round_trips_into_reader() {
        let mut w = FrameWriter::with_capacity(9);
        w.write_u8(b'r');
        w.write_u64(0xdead_beef);
        let bytes = w.into_bytes();
        let mut r = FrameReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), b'r');
        assert_eq!(r.read_u64().unwrap(), 0xdead_beef);
    }
}
