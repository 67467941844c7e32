//! Little-endian wire codec used by every register image and protocol header
//! in the crate.
//!
//! EtherCAT is little-endian on the wire. Every type that crosses the wire
//! implements [`WireRead`] and/or [`WireWrite`] by hand; there is no derive
//! magic, so the byte layout of each item is visible at its definition site.

/// An encode/decode error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WireError {
    /// The source buffer is too short to decode the type from.
    ReadBufferTooShort,
    /// The destination buffer is too short to encode the type into.
    WriteBufferTooShort,
    /// A discriminant or field value is not valid for the target type.
    InvalidValue,
}

impl core::fmt::Display for WireError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WireError::ReadBufferTooShort => f.write_str("read buffer too short"),
            WireError::WriteBufferTooShort => f.write_str("write buffer too short"),
            WireError::InvalidValue => f.write_str("invalid value"),
        }
    }
}

/// A type that can be encoded into an EtherCAT frame.
pub trait WireWrite {
    /// Number of bytes this value occupies on the wire.
    fn packed_len(&self) -> usize;

    /// Encode into the start of `buf` without checking its length.
    ///
    /// Callers must guarantee `buf.len() >= self.packed_len()`.
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8];

    /// Encode into the start of `buf`, checking its length first.
    fn pack_to_slice<'buf>(&self, buf: &'buf mut [u8]) -> Result<&'buf [u8], WireError> {
        if buf.len() < self.packed_len() {
            return Err(WireError::WriteBufferTooShort);
        }

        Ok(self.pack_to_slice_unchecked(buf))
    }
}

/// A type that can be decoded from an EtherCAT frame.
pub trait WireRead: Sized {
    /// Decode an instance from the start of `buf`.
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError>;
}

/// A readable type with a size known at compile time.
///
/// Used by the typed register read primitives to size the request datagram.
pub trait WireReadSized: WireRead {
    /// Number of bytes this type occupies on the wire.
    const PACKED_LEN: usize;
}

macro_rules! impl_wire_int {
    ($ty:ty) => {
        impl WireWrite for $ty {
            fn packed_len(&self) -> usize {
                core::mem::size_of::<$ty>()
            }

            fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
                let buf = &mut buf[0..core::mem::size_of::<$ty>()];

                buf.copy_from_slice(&self.to_le_bytes());

                buf
            }
        }

        impl WireRead for $ty {
            fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
                buf.get(0..core::mem::size_of::<$ty>())
                    .ok_or(WireError::ReadBufferTooShort)
                    .map(|raw| {
                        let mut bytes = [0u8; core::mem::size_of::<$ty>()];

                        bytes.copy_from_slice(raw);

                        <$ty>::from_le_bytes(bytes)
                    })
            }
        }

        impl WireReadSized for $ty {
            const PACKED_LEN: usize = core::mem::size_of::<$ty>();
        }
    };
}

impl_wire_int!(u8);
impl_wire_int!(u16);
impl_wire_int!(u32);
impl_wire_int!(u64);
impl_wire_int!(i8);
impl_wire_int!(i16);
impl_wire_int!(i32);
impl_wire_int!(i64);

impl<const N: usize> WireWrite for [u8; N] {
    fn packed_len(&self) -> usize {
        N
    }

    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..N];

        buf.copy_from_slice(self);

        buf
    }
}

impl<const N: usize> WireRead for [u8; N] {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        buf.get(0..N)
            .ok_or(WireError::ReadBufferTooShort)
            .map(|raw| {
                let mut bytes = [0u8; N];

                bytes.copy_from_slice(raw);

                bytes
            })
    }
}

impl<const N: usize> WireReadSized for [u8; N] {
    const PACKED_LEN: usize = N;
}

impl WireWrite for () {
    fn packed_len(&self) -> usize {
        0
    }

    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        &buf[0..0]
    }
}

impl WireRead for () {
    fn unpack_from_slice(_buf: &[u8]) -> Result<Self, WireError> {
        Ok(())
    }
}

impl WireReadSized for () {
    const PACKED_LEN: usize = 0;
}

impl WireWrite for &[u8] {
    fn packed_len(&self) -> usize {
        self.len()
    }

    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let buf = &mut buf[0..self.len()];

        buf.copy_from_slice(self);

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_little_endian() {
        let mut buf = [0u8; 4];

        assert_eq!(0x1234u16.pack_to_slice(&mut buf).unwrap(), &[0x34, 0x12]);
        assert_eq!(
            0xdead_beefu32.pack_to_slice(&mut buf).unwrap(),
            &[0xef, 0xbe, 0xad, 0xde]
        );

        assert_eq!(u16::unpack_from_slice(&[0x34, 0x12]), Ok(0x1234));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut buf = [0u8; 1];

        assert_eq!(
            0x1234u16.pack_to_slice(&mut buf),
            Err(WireError::WriteBufferTooShort)
        );
        assert_eq!(
            u32::unpack_from_slice(&[0x00, 0x01]),
            Err(WireError::ReadBufferTooShort)
        );
    }
}
