//! Bounded datagram construction.

use std::os::fd::OwnedFd;

use spawnd_common::constants::{MAX_FDS, MAX_PAYLOAD};
use spawnd_common::error::{Result, SpawnError};

/// A finished datagram: bytes plus descriptors for `SCM_RIGHTS`.
#[derive(Debug, Default)]
pub struct Datagram {
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Descriptors in the order the payload references them.
    pub fds: Vec<OwnedFd>,
}

/// Appends little-endian fields to a datagram of at most
/// [`MAX_PAYLOAD`] bytes and [`MAX_FDS`] descriptors.
#[derive(Debug, Default)]
pub struct Serializer {
    datagram: Datagram,
}

impl Serializer {
    /// Creates an empty serializer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a serializer whose first byte is `tag`.
    #[must_use]
    pub fn with_tag(tag: impl Into<u8>) -> Self {
        Self {
            datagram: Datagram {
                data: vec![tag.into()],
                fds: Vec::new(),
            },
        }
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.datagram.data.len()
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datagram.data.is_empty()
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.datagram.data.len() + bytes.len() > MAX_PAYLOAD {
            return Err(SpawnError::malformed(format!(
                "payload exceeds {MAX_PAYLOAD} bytes"
            )));
        }
        self.datagram.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes a command tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is full.
    pub fn write_tag(&mut self, tag: impl Into<u8>) -> Result<()> {
        self.write_u8(tag.into())
    }

    /// Writes one byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is full.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    /// Writes a `u16`.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is full.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a `u32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is full.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes an `i32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is full.
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a `u64`.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is full.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a NUL-terminated byte string.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` contains a NUL byte or the datagram is full.
    pub fn write_cstr(&mut self, value: &[u8]) -> Result<()> {
        if value.contains(&0) {
            return Err(SpawnError::malformed("string contains a NUL byte"));
        }
        self.write_bytes(value)?;
        self.write_u8(0)
    }

    /// Writes a NUL-terminated string.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` contains a NUL byte or the datagram is full.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_cstr(value.as_bytes())
    }

    /// Writes a tag followed by a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is invalid or the datagram is full.
    pub fn write_tagged_str(&mut self, tag: impl Into<u8>, value: &str) -> Result<()> {
        self.write_tag(tag)?;
        self.write_str(value)
    }

    /// Attaches a descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if [`MAX_FDS`] descriptors are already attached.
    pub fn write_fd(&mut self, fd: OwnedFd) -> Result<()> {
        if self.datagram.fds.len() >= MAX_FDS {
            return Err(SpawnError::malformed(format!(
                "more than {MAX_FDS} file descriptors"
            )));
        }
        self.datagram.fds.push(fd);
        Ok(())
    }

    /// Writes a tag and attaches its descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is full.
    pub fn write_tagged_fd(&mut self, tag: impl Into<u8>, fd: OwnedFd) -> Result<()> {
        self.write_tag(tag)?;
        self.write_fd(fd)
    }

    /// Finishes the datagram.
    #[must_use]
    pub fn finish(self) -> Datagram {
        self.datagram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_little_endian() {
        let mut s = Serializer::with_tag(7u8);
        s.write_u32(0x0102_0304).unwrap();
        s.write_str("ab").unwrap();
        assert_eq!(s.finish().data, vec![7, 4, 3, 2, 1, b'a', b'b', 0]);
    }

    #[test]
    fn rejects_embedded_nul() {
        let mut s = Serializer::new();
        assert!(s.write_str("a\0b").is_err());
        assert!(s.is_empty());
    }

    #[test]
    fn enforces_size_limit() {
        let mut s = Serializer::new();
        let big = vec![b'x'; MAX_PAYLOAD - 1];
        s.write_cstr(&big).unwrap();
        assert_eq!(s.len(), MAX_PAYLOAD);
        assert!(s.write_u8(0).is_err());
    }

    #[test]
    fn enforces_fd_limit() {
        let mut s = Serializer::new();
        for _ in 0..MAX_FDS {
            let (r, _w) = spawnd_core::sys::pipe().unwrap();
            s.write_fd(r).unwrap();
        }
        let (r, _w) = spawnd_core::sys::pipe().unwrap();
        assert!(s.write_fd(r).is_err());
    }
}
