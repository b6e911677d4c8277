// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io::{Read, Result, Write};

use crate::ext::{ReadExt, WriteExt};

pub const MAJOR: u8 = 2;
pub const MINOR: u8 = 1;

/// Fixed byte size of the end-of-file trailer: six i32 fields
pub const TRAILER_SIZE: u64 = 24;

/// Two byte version header at the start of every archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major: u8,
    pub minor: u8,
}

impl Header {
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            major: reader.read_u8()?,
            minor: reader.read_u8()?,
        })
    }

    pub fn encode<W: Write>(self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.major)?;
        writer.write_u8(self.minor)?;
        Ok(())
    }

    pub fn is_supported(self) -> bool {
        self.major == MAJOR && self.minor == MINOR
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            major: MAJOR,
            minor: MINOR,
        }
    }
}

/// One indexed member of the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Index record as stored on disk. `offset` is relative
/// to the start of the data region, not the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub offset: i32,
    pub size: i32,
}

impl Index {
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            name: reader.read_utf()?,
            offset: reader.read_i32()?,
            size: reader.read_i32()?,
        })
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_utf(&self.name)?;
        writer.write_i32(self.offset)?;
        writer.write_i32(self.size)?;
        Ok(())
    }
}

/// Key/value property attached to the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub key: String,
    pub value: String,
}

impl Property {
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            key: reader.read_utf()?,
            value: reader.read_utf()?,
        })
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_utf(&self.key)?;
        writer.write_utf(&self.value)?;
        Ok(())
    }
}

/// End-of-file trailer locating the data, index and property regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub data_offset: i32,
    pub data_count: i32,
    pub index_offset: i32,
    pub index_count: i32,
    pub properties_offset: i32,
    pub properties_count: i32,
}

impl Trailer {
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            data_offset: reader.read_i32()?,
            data_count: reader.read_i32()?,
            index_offset: reader.read_i32()?,
            index_count: reader.read_i32()?,
            properties_offset: reader.read_i32()?,
            properties_count: reader.read_i32()?,
        })
    }

    pub fn encode<W: Write>(self, writer: &mut W) -> Result<()> {
        writer.write_i32(self.data_offset)?;
        writer.write_i32(self.data_count)?;
        writer.write_i32(self.index_offset)?;
        writer.write_i32(self.index_count)?;
        writer.write_i32(self.properties_offset)?;
        writer.write_i32(self.properties_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut bytes = vec![];
        Header::default().encode(&mut bytes).unwrap();
        assert_eq!(bytes, [2, 1]);

        let header = Header::decode(&mut Cursor::new(&bytes)).unwrap();
        assert!(header.is_supported());
    }

    #[test]
    fn index_roundtrip() {
        let index = Index {
            name: "dir/file.bin".into(),
            offset: 128,
            size: 42,
        };

        let mut bytes = vec![];
        index.encode(&mut bytes).unwrap();

        // i16 length prefix + name bytes + two i32 fields
        assert_eq!(bytes.len(), 2 + index.name.len() + 8);
        assert_eq!(Index::decode(&mut Cursor::new(&bytes)).unwrap(), index);
    }

    #[test]
    fn trailer_is_24_bytes() {
        let trailer = Trailer {
            data_offset: 2,
            data_count: 3,
            index_offset: 100,
            index_count: 3,
            properties_offset: 160,
            properties_count: 1,
        };

        let mut bytes = vec![];
        trailer.encode(&mut bytes).unwrap();
        assert_eq!(bytes.len() as u64, TRAILER_SIZE);
        assert_eq!(Trailer::decode(&mut Cursor::new(&bytes)).unwrap(), trailer);
    }
}
