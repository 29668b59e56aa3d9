//! Cursor for decoding packet payloads
use bytes::Buf;

use crate::error::{ErrorKind, Result};

/// Zero-copy cursor over a single packet payload.
///
/// Every read advances the cursor; reading past the end of the payload
/// yields [ErrorKind::MalformedPacket].
#[derive(Clone, Copy)]
pub(crate) struct PacketParser<'a>(&'a [u8]);

impl From<bytes::TryGetError> for ErrorKind {
    fn from(_value: bytes::TryGetError) -> Self {
        ErrorKind::MalformedPacket
    }
}

impl<'a> PacketParser<'a> {
    /// Construct a new parser over the given payload
    pub(crate) fn new(payload: &'a [u8]) -> Self {
        Self(payload)
    }

    /// Number of bytes left in the payload
    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.0.len()
    }

    /// Read a u8 from the payload
    #[inline]
    pub(crate) fn get_u8(&mut self) -> Result<u8> {
        Ok(self.0.try_get_u8()?)
    }

    /// Read a little-endian u16 from the payload
    #[inline]
    pub(crate) fn get_u16(&mut self) -> Result<u16> {
        Ok(self.0.try_get_u16_le()?)
    }

    /// Read a little-endian u32 from the payload
    #[inline]
    pub(crate) fn get_u32(&mut self) -> Result<u32> {
        Ok(self.0.try_get_u32_le()?)
    }

    /// Read a little-endian u64 from the payload
    #[inline]
    pub(crate) fn get_u64(&mut self) -> Result<u64> {
        Ok(self.0.try_get_u64_le()?)
    }

    /// Read a little-endian f32 from the payload
    #[inline]
    pub(crate) fn get_f32(&mut self) -> Result<f32> {
        Ok(self.0.try_get_f32_le()?)
    }

    /// Read a little-endian f64 from the payload
    #[inline]
    pub(crate) fn get_f64(&mut self) -> Result<f64> {
        Ok(self.0.try_get_f64_le()?)
    }

    /// Read a little-endian 3-byte unsigned integer from the payload
    #[inline]
    pub(crate) fn get_u24(&mut self) -> Result<u32> {
        let a: u32 = self.get_u8()?.into();
        let b: u32 = self.get_u8()?.into();
        let c: u32 = self.get_u8()?.into();
        Ok(a | (b << 8) | (c << 16))
    }

    /// Read a length-encoded integer
    ///
    /// See <https://mariadb.com/docs/server/reference/clientserver-protocol/protocol-data-types#length-encoded-integers>
    #[inline]
    pub(crate) fn get_lenenc(&mut self) -> Result<u64> {
        let v = self.get_u8()?;
        Ok(match v {
            0xFC => self.get_u16()?.into(),
            0xFD => self.get_u24()?.into(),
            0xFE => self.get_u64()?,
            v => v.into(),
        })
    }

    /// Read a length-encoded integer where the 0xFB prefix means NULL
    #[inline]
    pub(crate) fn get_nullable_lenenc(&mut self) -> Result<Option<u64>> {
        if self.0.first() == Some(&0xFB) {
            self.0.advance(1);
            return Ok(None);
        }
        Ok(Some(self.get_lenenc()?))
    }

    /// Read a length-encoded byte string
    #[inline]
    pub(crate) fn get_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_lenenc()?;
        self.get_bytes(len as usize)
    }

    /// Read a length-encoded byte string, or None for the NULL marker
    #[inline]
    pub(crate) fn get_nullable_lenenc_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        match self.get_nullable_lenenc()? {
            Some(len) => Ok(Some(self.get_bytes(len as usize)?)),
            None => Ok(None),
        }
    }

    /// Read a length-encoded utf-8 string
    #[inline]
    pub(crate) fn get_lenenc_str(&mut self) -> Result<&'a str> {
        let v = self.get_lenenc_bytes()?;
        std::str::from_utf8(v).map_err(|_| ErrorKind::MalformedPacket.into())
    }

    /// Skip past a length-encoded string or blob
    #[inline]
    pub(crate) fn skip_lenenc_str(&mut self) -> Result<()> {
        let len = self.get_lenenc()? as usize;
        if self.0.len() < len {
            return Err(ErrorKind::MalformedPacket.into());
        }
        self.0.advance(len);
        Ok(())
    }

    /// Read a null-terminated byte string
    #[inline]
    pub(crate) fn get_null_bytes(&mut self) -> Result<&'a [u8]> {
        match self.0.iter().position(|b| *b == 0) {
            Some(n) => {
                let v = &self.0[..n];
                self.0.advance(n + 1);
                Ok(v)
            }
            None => Err(ErrorKind::MalformedPacket.into()),
        }
    }

    /// Skip past a null-terminated string
    #[inline]
    pub(crate) fn skip_null_str(&mut self) -> Result<()> {
        self.get_null_bytes().map(|_| ())
    }

    /// Read the rest of the payload as raw bytes
    #[inline]
    pub(crate) fn get_eof_bytes(&mut self) -> Result<&'a [u8]> {
        let v = self.0;
        self.0.advance(v.len());
        Ok(v)
    }

    /// Read some bytes from the payload
    #[inline]
    pub(crate) fn get_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        match self.0.get(..len) {
            Some(v) => {
                self.0.advance(len);
                Ok(v)
            }
            None => Err(ErrorKind::MalformedPacket.into()),
        }
    }
}
