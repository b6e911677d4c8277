// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

use crate::format::{self, Entry, Header, Index, Property, TRAILER_SIZE, Trailer};

/// Fully decoded archive. Entries keep their on-disk index order
/// so that a rebuild reproduces the original bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    pub entries: Vec<Entry>,
    pub properties: Vec<Property>,
}

impl Archive {
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.bytes.as_slice())
    }

    /// Replace the named member, or append it if absent
    pub fn put(&mut self, name: &str, bytes: Vec<u8>) {
        match self.entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => entry.bytes = bytes,
            None => self.entries.push(Entry {
                name: name.to_owned(),
                bytes,
            }),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|entry| entry.name != name);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }
}

/// Extract the archive at `path`
pub fn extract(path: impl AsRef<Path>) -> Result<Archive, ReadError> {
    let file = File::open(path.as_ref()).map_err(|error| {
        if error.kind() == io::ErrorKind::NotFound {
            ReadError::NotFound(path.as_ref().display().to_string())
        } else {
            ReadError::Io(error)
        }
    })?;

    extract_from(io::BufReader::new(file))
}

/// Extract an archive from any seekable reader
pub fn extract_from<R: Read + Seek>(mut reader: R) -> Result<Archive, ReadError> {
    let header = Header::decode(&mut reader)?;

    if !header.is_supported() {
        return Err(ReadError::WrongVersion {
            major: header.major,
            minor: header.minor,
        });
    }

    let end = reader.seek(SeekFrom::End(0))?;
    if end < 2 + TRAILER_SIZE {
        return Err(ReadError::Truncated);
    }

    reader.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;
    let trailer = Trailer::decode(&mut reader)?;

    let indexes = decode_records(
        &mut reader,
        trailer.index_offset,
        trailer.index_count,
        Index::decode,
    )?;
    let properties = decode_records(
        &mut reader,
        trailer.properties_offset,
        trailer.properties_count,
        Property::decode,
    )?;

    let data_offset = region_offset(trailer.data_offset)?;

    let entries = indexes
        .into_iter()
        .map(|index| {
            let offset = u64::try_from(index.offset).map_err(|_| ReadError::Truncated)?;
            let size = usize::try_from(index.size).map_err(|_| ReadError::Truncated)?;

            reader.seek(SeekFrom::Start(data_offset + offset))?;

            let mut bytes = vec![0u8; size];
            reader.read_exact(&mut bytes)?;

            Ok(Entry {
                name: index.name,
                bytes,
            })
        })
        .collect::<Result<Vec<_>, ReadError>>()?;

    Ok(Archive {
        entries,
        properties,
    })
}

fn decode_records<R, T>(
    reader: &mut R,
    offset: i32,
    count: i32,
    decode: impl Fn(&mut R) -> io::Result<T>,
) -> Result<Vec<T>, ReadError>
where
    R: Read + Seek,
{
    reader.seek(SeekFrom::Start(region_offset(offset)?))?;

    (0..count)
        .map(|_| decode(reader).map_err(ReadError::Io))
        .collect()
}

fn region_offset(offset: i32) -> Result<u64, ReadError> {
    u64::try_from(offset).map_err(|_| ReadError::Truncated)
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("unsupported archive version {major}.{minor}, expected {}.{}", format::MAJOR, format::MINOR)]
    WrongVersion { major: u8, minor: u8 },
    #[error("archive not found: {0}")]
    NotFound(String),
    #[error("archive shorter than its fixed regions")]
    Truncated,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn rejects_wrong_version() {
        // 3.1 header followed by a valid-sized but empty body
        let mut bytes = vec![3, 1];
        bytes.extend([0u8; 24]);

        assert!(matches!(
            extract_from(Cursor::new(&bytes)),
            Err(ReadError::WrongVersion { major: 3, minor: 1 })
        ));
    }

    #[test]
    fn rejects_truncated() {
        assert!(matches!(
            extract_from(Cursor::new(&[2u8, 1, 0, 0])),
            Err(ReadError::Truncated)
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        assert!(matches!(
            extract("/nonexistent/archive.d2p"),
            Err(ReadError::NotFound(_))
        ));
    }
}
