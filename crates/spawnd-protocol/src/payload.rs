//! Cursor over a received datagram.

use std::os::fd::OwnedFd;

use nom::bytes::complete::take_till;
use nom::number::complete::{le_i32, le_u8, le_u16, le_u32, le_u64};
use nom::{IResult, Parser};
use spawnd_common::error::{Result, SpawnError};

type NomError<'a> = nom::error::Error<&'a [u8]>;

/// Reads little-endian fields from the front of a byte slice.
///
/// Every read either consumes exactly the bytes of its field or fails
/// with [`SpawnError::MalformedPayload`] and leaves the cursor unchanged.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    input: &'a [u8],
}

impl<'a> Payload<'a> {
    /// Starts reading at the beginning of `input`.
    #[must_use]
    pub const fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// Returns `true` when everything has been consumed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// The unread rest.
    #[must_use]
    pub const fn remaining(&self) -> &'a [u8] {
        self.input
    }

    fn run<T>(
        &mut self,
        what: &'static str,
        parser: impl FnOnce(&'a [u8]) -> IResult<&'a [u8], T, NomError<'a>>,
    ) -> Result<T> {
        let (rest, value) = parser(self.input)
            .map_err(|_| SpawnError::malformed(format!("truncated {what}")))?;
        self.input = rest;
        Ok(value)
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Returns an error at the end of the payload.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.run("u8", le_u8)
    }

    /// Reads a `u16`.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than two bytes remain.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.run("u16", le_u16)
    }

    /// Reads a `u32`.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than four bytes remain.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.run("u32", le_u32)
    }

    /// Reads an `i32`.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than four bytes remain.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.run("i32", le_i32)
    }

    /// Reads a `u64`.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than eight bytes remain.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.run("u64", le_u64)
    }

    /// Reads a NUL-terminated byte string, without the terminator.
    ///
    /// # Errors
    ///
    /// Returns an error if no NUL byte follows.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let (rest, value) = take_till::<_, _, NomError<'a>>(|b: u8| b == 0)
            .parse(self.input)
            .map_err(|_| SpawnError::malformed("truncated string"))?;
        let Some((&0, rest)) = rest.split_first() else {
            return Err(SpawnError::malformed("unterminated string"));
        };
        self.input = rest;
        Ok(value)
    }

    /// Reads a NUL-terminated UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is unterminated or not UTF-8.
    pub fn read_str(&mut self) -> Result<&'a str> {
        let mut ahead = *self;
        let bytes = ahead.read_cstr()?;
        let value = std::str::from_utf8(bytes)
            .map_err(|_| SpawnError::malformed("string is not valid UTF-8"))?;
        *self = ahead;
        Ok(value)
    }
}

/// Descriptors received with a datagram, handed out in order.
#[derive(Debug)]
pub struct ReceivedFds {
    fds: std::vec::IntoIter<OwnedFd>,
}

impl ReceivedFds {
    /// Wraps the descriptors of one datagram.
    #[must_use]
    pub fn new(fds: Vec<OwnedFd>) -> Self {
        Self {
            fds: fds.into_iter(),
        }
    }

    /// Number of descriptors not yet taken.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Returns `true` if all descriptors were taken.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.len() == 0
    }

    /// Takes the next descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram carried fewer descriptors than
    /// its payload references.
    pub fn take(&mut self) -> Result<OwnedFd> {
        self.fds
            .next()
            .ok_or_else(|| SpawnError::malformed("missing file descriptor"))
    }

    /// Checks that every descriptor was referenced. Left-over
    /// descriptors are closed.
    ///
    /// # Errors
    ///
    /// Returns an error if descriptors are left over.
    pub fn finish(self) -> Result<()> {
        match self.fds.len() {
            0 => Ok(()),
            n => Err(SpawnError::malformed(format!(
                "{n} unreferenced file descriptors"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fields_in_order() {
        let data = [1, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff, b'h', b'i', 0, 9];
        let mut p = Payload::new(&data);
        assert_eq!(p.read_u8().unwrap(), 1);
        assert_eq!(p.read_u16().unwrap(), 0x1234);
        assert_eq!(p.read_i32().unwrap(), -1);
        assert_eq!(p.read_str().unwrap(), "hi");
        assert_eq!(p.remaining(), &[9]);
    }

    #[test]
    fn truncated_integer_leaves_cursor() {
        let data = [1, 2, 3];
        let mut p = Payload::new(&data);
        assert!(p.read_u32().is_err());
        assert_eq!(p.remaining().len(), 3);
    }

    #[test]
    fn unterminated_string_is_malformed() {
        let mut p = Payload::new(b"abc");
        let err = p.read_cstr().unwrap_err();
        assert!(err.to_string().contains("unterminated"));
        assert_eq!(p.remaining(), b"abc");
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut p = Payload::new(&[0xff, 0]);
        assert!(p.read_str().is_err());
        assert_eq!(p.read_cstr().unwrap(), &[0xff]);
    }

    #[test]
    fn fd_underflow_and_leftovers() {
        let (r, w) = spawnd_core::sys::pipe().unwrap();
        let mut fds = ReceivedFds::new(vec![r]);
        assert!(fds.take().is_ok());
        assert!(fds.take().is_err());
        assert!(fds.finish().is_ok());

        let fds = ReceivedFds::new(vec![w]);
        assert!(fds.finish().is_err());
    }
}
