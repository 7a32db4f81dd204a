//! Primitive encoding shared by all binary formats.
//!
//! Integers are written as a sign byte followed by `int_size` bytes of the
//! absolute value, least significant byte first. Strings are an integer
//! length followed by the raw bytes, a length of `-1` encodes NULL.
//! File offsets are a state byte followed by `off_size` bytes, again least
//! significant first.

use std::io::{self, Read, Write};

use anyhow::{bail, format_err, Error};

use crate::error::ArchiveError;
use crate::file_formats::*;

pub(crate) fn map_read_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ArchiveError::TruncatedFile.into()
    } else {
        format_err!("could not read from input file: {}", err)
    }
}

pub(crate) fn map_write_error(err: io::Error) -> Error {
    format_err!("could not write to output file: {}", err)
}

/// Integer, string and offset encoding parameters of one archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Codec {
    pub version: u32,
    pub int_size: usize,
    pub off_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            version: K_VERS_MAX,
            int_size: DEFAULT_INT_SIZE,
            off_size: DEFAULT_OFF_SIZE,
        }
    }
}

impl Codec {
    pub fn write_byte<W: Write + ?Sized>(&self, writer: &mut W, byte: u8) -> Result<(), Error> {
        writer.write_all(&[byte]).map_err(map_write_error)
    }

    pub fn read_byte<R: Read + ?Sized>(&self, reader: &mut R) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).map_err(map_read_error)?;
        Ok(byte[0])
    }

    pub fn write_int<W: Write + ?Sized>(&self, writer: &mut W, value: i32) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(self.int_size + 1);
        buf.push(if value < 0 { 1 } else { 0 });
        let mut abs = value.unsigned_abs();
        for _ in 0..self.int_size {
            buf.push((abs & 0xff) as u8);
            abs >>= 8;
        }
        writer.write_all(&buf).map_err(map_write_error)
    }

    pub fn read_int<R: Read + ?Sized>(&self, reader: &mut R) -> Result<i32, Error> {
        // 1.0 archives carry no sign byte
        let negative = if self.version > K_VERS_1_0 {
            self.read_byte(reader)? != 0
        } else {
            false
        };

        let mut buf = vec![0u8; self.int_size];
        reader.read_exact(&mut buf).map_err(map_read_error)?;

        let mut value: u64 = 0;
        for (i, byte) in buf.iter().enumerate().take(8) {
            value |= (*byte as u64) << (i * 8);
        }

        // the magnitude of i32::MIN does not fit an i32
        let value = i64::try_from(value)
            .map_err(|_| format_err!("integer value {} out of range in archive", value))?;
        let value = if negative { -value } else { value };
        i32::try_from(value).map_err(|_| format_err!("integer value {} out of range in archive", value))
    }

    pub fn write_str<W: Write + ?Sized>(
        &self,
        writer: &mut W,
        value: Option<&str>,
    ) -> Result<(), Error> {
        match value {
            None => self.write_int(writer, -1),
            Some(text) => {
                let len = i32::try_from(text.len())
                    .map_err(|_| format_err!("string too long for archive ({} bytes)", text.len()))?;
                self.write_int(writer, len)?;
                writer.write_all(text.as_bytes()).map_err(map_write_error)
            }
        }
    }

    pub fn read_str<R: Read + ?Sized>(&self, reader: &mut R) -> Result<Option<String>, Error> {
        let len = self.read_int(reader)?;
        if len < 0 {
            return Ok(None);
        }
        let mut buf = Vec::new();
        // never trust the length for the allocation, the file may be corrupt
        reader
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(map_read_error)?;
        if buf.len() != len as usize {
            return Err(ArchiveError::TruncatedFile.into());
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Read a string, mapping NULL to an empty string.
    pub fn read_string<R: Read + ?Sized>(&self, reader: &mut R) -> Result<String, Error> {
        Ok(self.read_str(reader)?.unwrap_or_default())
    }

    pub fn write_offset<W: Write + ?Sized>(
        &self,
        writer: &mut W,
        state: u8,
        pos: u64,
    ) -> Result<(), Error> {
        let mut buf = Vec::with_capacity(self.off_size + 1);
        buf.push(state);
        let mut pos = pos;
        for _ in 0..self.off_size {
            buf.push((pos & 0xff) as u8);
            pos >>= 8;
        }
        writer.write_all(&buf).map_err(map_write_error)
    }

    /// Returns the offset state and position.
    pub fn read_offset<R: Read + ?Sized>(&self, reader: &mut R) -> Result<(u8, u64), Error> {
        if self.version < K_VERS_1_7 {
            // plain integer, negative for unknown, zero for no data
            let value = self.read_int(reader)?;
            return Ok(match value {
                v if v < 0 => (K_OFFSET_POS_NOT_SET, 0),
                0 => (K_OFFSET_NO_DATA, 0),
                v => (K_OFFSET_POS_SET, v as u64),
            });
        }

        let state = self.read_byte(reader)?;
        let mut buf = vec![0u8; self.off_size];
        reader.read_exact(&mut buf).map_err(map_read_error)?;

        let mut pos: u64 = 0;
        for (i, byte) in buf.iter().enumerate() {
            if i >= 8 {
                if *byte != 0 {
                    bail!("file offset in dump file is too large");
                }
                continue;
            }
            pos |= (*byte as u64) << (i * 8);
        }

        match state {
            K_OFFSET_POS_NOT_SET | K_OFFSET_POS_SET | K_OFFSET_NO_DATA => Ok((state, pos)),
            _ => bail!("unexpected data offset flag {}", state),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn integer_layout() -> Result<(), Error> {
        let codec = Codec::default();

        let mut buf = Vec::new();
        codec.write_int(&mut buf, 258)?;
        assert_eq!(buf, [0, 2, 1, 0, 0]);

        buf.clear();
        codec.write_int(&mut buf, -5)?;
        assert_eq!(buf, [1, 5, 0, 0, 0]);
        assert_eq!(codec.read_int(&mut &buf[..])?, -5);

        buf.clear();
        codec.write_int(&mut buf, i32::MIN)?;
        assert_eq!(buf, [1, 0, 0, 0, 0x80]);
        assert_eq!(codec.read_int(&mut &buf[..])?, i32::MIN);

        let err = codec.read_int(&mut &[0u8, 0, 0, 0, 0x80][..]).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        // 1.0 has no sign byte
        let old = Codec {
            version: K_VERS_1_0,
            ..codec
        };
        assert_eq!(old.read_int(&mut &[7u8, 0, 0, 0][..])?, 7);

        // wider integers written by other platforms
        let wide = Codec {
            int_size: 8,
            ..codec
        };
        let mut buf = Vec::new();
        wide.write_int(&mut buf, 1 << 20)?;
        assert_eq!(buf.len(), 9);
        assert_eq!(wide.read_int(&mut &buf[..])?, 1 << 20);
        Ok(())
    }

    #[test]
    fn strings_and_offsets() -> Result<(), Error> {
        let codec = Codec::default();
        let mut buf = Vec::new();
        codec.write_str(&mut buf, Some("CREATE TABLE t ();"))?;
        codec.write_str(&mut buf, None)?;
        codec.write_offset(&mut buf, K_OFFSET_POS_SET, 0x1_0000_0001)?;

        let mut reader = &buf[..];
        assert_eq!(codec.read_str(&mut reader)?.as_deref(), Some("CREATE TABLE t ();"));
        assert_eq!(codec.read_str(&mut reader)?, None);
        assert_eq!(codec.read_offset(&mut reader)?, (K_OFFSET_POS_SET, 0x1_0000_0001));
        assert!(reader.is_empty());

        let err = codec.read_str(&mut &[0u8, 10, 0, 0, 0, b'x'][..]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArchiveError>(),
            Some(ArchiveError::TruncatedFile)
        ));
        Ok(())
    }
}
