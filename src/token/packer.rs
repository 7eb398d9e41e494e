// intercom-signaling-service/src/token/packer.rs

use crate::error::TokenError;

/// Smallest `base * 2^k` that is >= `len`.
pub fn padded_len(len: usize, base: usize) -> usize {
    let mut target = base;
    while target < len {
        target *= 2;
    }
    target
}

/// Big-endian writer for the token payload.
#[derive(Debug, Default)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(256) }
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn put_bytes(&mut self, field: &'static str, value: &[u8]) -> Result<(), TokenError> {
        let len = u32::try_from(value.len()).map_err(|_| TokenError::IllegalField(field))?;
        self.put_u32(len);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    pub fn put_str(&mut self, field: &'static str, value: &str) -> Result<(), TokenError> {
        self.put_bytes(field, value.as_bytes())
    }

    pub fn put_raw(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    /// Zero-fills the buffer up to the next `base * 2^k` boundary.
    pub fn pad(&mut self, base: usize) {
        let target = padded_len(self.buf.len(), base);
        self.buf.resize(target, 0);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential reader mirroring [`Packer`]. Every read names the field it
/// belongs to so a truncated buffer reports which one was cut off.
pub struct Unpacker<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], TokenError> {
        let end = self.pos.checked_add(n).ok_or(TokenError::ParseFailed(field))?;
        if end > self.data.len() {
            return Err(TokenError::ParseFailed(field));
        }
        let data: &'a [u8] = self.data;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn get_u32(&mut self, field: &'static str) -> Result<u32, TokenError> {
        let raw = self.take(4, field)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn get_bool(&mut self, field: &'static str) -> Result<bool, TokenError> {
        match self.take(1, field)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(TokenError::ParseFailed(field)),
        }
    }

    pub fn get_bytes(&mut self, field: &'static str) -> Result<&'a [u8], TokenError> {
        let len = self.get_u32(field)? as usize;
        self.take(len, field)
    }

    pub fn get_string(&mut self, field: &'static str) -> Result<String, TokenError> {
        let raw = self.get_bytes(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| TokenError::ParseFailed(field))
    }

    /// Everything not read yet.
    pub fn rest(&self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        &data[self.pos..]
    }
}
