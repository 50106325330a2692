//! Safe, hand-rolled tagged binary encoding.
//!
//! Every on-disk blob (Field, Page, Record, BPTree, Table, Database) is
//! built from these primitives. The wire format is deliberately simple —
//! length-prefixed, no varint tricks — since §6 only requires a stable
//! round-trip, not a particular byte layout.

use crate::errors::{DbError, Result};

/// Append-only binary writer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed (u32 byte count) raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    /// Length-prefixed (u32 item count) sequence; caller writes each item.
    pub fn write_seq<T, F: FnMut(&mut Writer, &T)>(&mut self, items: &[T], mut f: F) {
        self.write_u32(items.len() as u32);
        for item in items {
            f(self, item);
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based reader over an encoded blob.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(DbError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated blob",
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(i64::from_le_bytes(a))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(f64::from_le_bytes(a))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_str(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| DbError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    pub fn read_seq<T, F: FnMut(&mut Reader<'a>) -> Result<T>>(
        &mut self,
        mut f: F,
    ) -> Result<Vec<T>> {
        let len = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(f(self)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars() {
        let mut w = Writer::new();
        w.write_u32(42);
        w.write_i64(-7);
        w.write_f64(3.5);
        w.write_str("hello");
        w.write_bool(true);
        let bytes = w.into_vec();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u32().unwrap(), 42);
        assert_eq!(r.read_i64().unwrap(), -7);
        assert_eq!(r.read_f64().unwrap(), 3.5);
        assert_eq!(r.read_str().unwrap(), "hello");
        assert_eq!(r.read_bool().unwrap(), true);
    }

    #[test]
    fn round_trips_sequences() {
        let items = vec![1u32, 2, 3, 4];
        let mut w = Writer::new();
        w.write_seq(&items, |w, v| w.write_u32(*v));
        let bytes = w.into_vec();

        let mut r = Reader::new(&bytes);
        let back = r.read_seq(|r| r.read_u32()).unwrap();
        assert_eq!(back, items);
    }

    #[test]
    fn truncated_blob_errors() {
        let mut r = Reader::new(&[1, 2]);
        assert!(r.read_u32().is_err());
    }
}
