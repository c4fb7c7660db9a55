//! Minimal CBOR (RFC 8949) reader and writer covering the subset the bundle
//! wire format uses: unsigned integers, byte strings, definite-length arrays,
//! and the indefinite-length array wrapper with its break code.

use crate::error::{BpError, BpResult};

const MAJOR_UINT: u8 = 0;
const MAJOR_BYTES: u8 = 2;
const MAJOR_ARRAY: u8 = 4;

/// Start byte of an indefinite-length array.
pub const INDEFINITE_ARRAY: u8 = 0x9F;
/// "Break" stop code terminating an indefinite-length item.
pub const BREAK: u8 = 0xFF;

/// Appending CBOR writer over a growable buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    fn head(&mut self, major: u8, value: u64) {
        let m = major << 5;
        if value < 24 {
            self.buf.push(m | value as u8);
        } else if value <= u64::from(u8::MAX) {
            self.buf.push(m | 24);
            self.buf.push(value as u8);
        } else if value <= u64::from(u16::MAX) {
            self.buf.push(m | 25);
            self.buf.extend_from_slice(&(value as u16).to_be_bytes());
        } else if value <= u64::from(u32::MAX) {
            self.buf.push(m | 26);
            self.buf.extend_from_slice(&(value as u32).to_be_bytes());
        } else {
            self.buf.push(m | 27);
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn uint(&mut self, value: u64) {
        self.head(MAJOR_UINT, value);
    }

    /// Definite-length array header; the caller then writes `len` items.
    pub fn array(&mut self, len: u64) {
        self.head(MAJOR_ARRAY, len);
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.head(MAJOR_BYTES, data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    /// Byte-string header alone; the caller appends the contents with `raw`.
    pub fn bytes_header(&mut self, len: u64) {
        self.head(MAJOR_BYTES, len);
    }

    pub fn raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn indefinite_array(&mut self) {
        self.buf.push(INDEFINITE_ARRAY);
    }

    pub fn stop(&mut self) {
        self.buf.push(BREAK);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based CBOR reader over a borrowed buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn byte(&mut self) -> BpResult<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(BpError::Codec("unexpected end of input"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> BpResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(BpError::Codec("unexpected end of input"));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn head(&mut self) -> BpResult<(u8, u64)> {
        let initial = self.byte()?;
        let major = initial >> 5;
        let info = initial & 0x1F;
        let value = match info {
            0..=23 => u64::from(info),
            24 => u64::from(self.byte()?),
            25 => u64::from(u16::from_be_bytes(self.take(2)?.try_into().unwrap())),
            26 => u64::from(u32::from_be_bytes(self.take(4)?.try_into().unwrap())),
            27 => u64::from_be_bytes(self.take(8)?.try_into().unwrap()),
            _ => return Err(BpError::Codec("unsupported additional info")),
        };
        Ok((major, value))
    }

    fn expect(&mut self, major: u8, what: &'static str) -> BpResult<u64> {
        let (m, v) = self.head()?;
        if m != major {
            return Err(BpError::Codec(what));
        }
        Ok(v)
    }

    pub fn uint(&mut self) -> BpResult<u64> {
        self.expect(MAJOR_UINT, "expected unsigned integer")
    }

    /// Definite-length array header; returns the element count.
    pub fn array(&mut self) -> BpResult<u64> {
        self.expect(MAJOR_ARRAY, "expected array")
    }

    pub fn bytes(&mut self) -> BpResult<&'a [u8]> {
        let len = self.expect(MAJOR_BYTES, "expected byte string")?;
        self.take(len as usize)
    }

    pub fn expect_indefinite_array(&mut self) -> BpResult<()> {
        if self.byte()? != INDEFINITE_ARRAY {
            return Err(BpError::Codec("expected indefinite-length array"));
        }
        Ok(())
    }

    pub fn at_break(&self) -> bool {
        self.peek() == Some(BREAK)
    }

    pub fn expect_break(&mut self) -> BpResult<()> {
        if self.byte()? != BREAK {
            return Err(BpError::Codec("expected break code"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_boundaries() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (23, &[0x17]),
            (24, &[0x18, 0x18]),
            (200, &[0x18, 0xC8]),
            (255, &[0x18, 0xFF]),
            (256, &[0x19, 0x01, 0x00]),
            (65535, &[0x19, 0xFF, 0xFF]),
            (65536, &[0x1A, 0x00, 0x01, 0x00, 0x00]),
            (3_600_000, &[0x1A, 0x00, 0x36, 0xEE, 0x80]),
            (u64::from(u32::MAX), &[0x1A, 0xFF, 0xFF, 0xFF, 0xFF]),
            (
                u64::from(u32::MAX) + 1,
                &[0x1B, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
            ),
        ];
        for &(value, expected) in cases {
            let mut w = Writer::new();
            w.uint(value);
            assert_eq!(w.as_slice(), expected, "encoding {value}");
            let mut r = Reader::new(expected);
            assert_eq!(r.uint().unwrap(), value);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn array_and_bytes_round_trip() {
        let mut w = Writer::new();
        w.array(2);
        w.uint(7);
        w.bytes(b"hello world\n");
        let mut r = Reader::new(w.as_slice());
        assert_eq!(r.array().unwrap(), 2);
        assert_eq!(r.uint().unwrap(), 7);
        assert_eq!(r.bytes().unwrap(), b"hello world\n");
    }

    #[test]
    fn indefinite_array_wrapper() {
        let mut w = Writer::new();
        w.indefinite_array();
        w.uint(1);
        w.stop();
        assert_eq!(w.as_slice(), &[0x9F, 0x01, 0xFF]);
        let mut r = Reader::new(w.as_slice());
        r.expect_indefinite_array().unwrap();
        assert!(!r.at_break());
        assert_eq!(r.uint().unwrap(), 1);
        assert!(r.at_break());
        r.expect_break().unwrap();
    }

    #[test]
    fn wrong_major_type_is_an_error() {
        let mut r = Reader::new(&[0x40]);
        assert!(matches!(r.uint(), Err(BpError::Codec(_))));
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut r = Reader::new(&[0x19, 0x01]);
        assert!(matches!(r.uint(), Err(BpError::Codec(_))));
        let mut r = Reader::new(&[0x42, 0xAA]);
        assert!(matches!(r.bytes(), Err(BpError::Codec(_))));
    }
}
