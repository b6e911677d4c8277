// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::format::{Header, Index, Trailer};
use crate::read::Archive;

/// Write the archive to `path`, replacing any existing file
pub fn build(path: impl AsRef<Path>, archive: &Archive) -> Result<(), WriteError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    build_to(&mut writer, archive)?;

    writer.flush()?;

    Ok(())
}

/// Emit the archive to any writer. File bodies are materialized
/// first, then indexes, then properties, then the trailer, with
/// index offsets recomputed relative to the start of the data region.
pub fn build_to<W: Write>(writer: &mut W, archive: &Archive) -> Result<(), WriteError> {
    Header::default().encode(writer)?;

    // Data region starts right after the two byte header
    let data_offset = 2i32;

    let mut indexes = Vec::with_capacity(archive.entries.len());
    let mut cursor = 0i64;

    for entry in &archive.entries {
        let size = region_field(entry.bytes.len() as i64)?;
        let offset = region_field(cursor)?;

        writer.write_all(&entry.bytes)?;

        indexes.push(Index {
            name: entry.name.clone(),
            offset,
            size,
        });
        cursor += i64::from(size);
    }

    let index_offset = region_field(i64::from(data_offset) + cursor)?;

    let mut index_bytes = vec![];
    for index in &indexes {
        index.encode(&mut index_bytes)?;
    }
    writer.write_all(&index_bytes)?;

    let properties_offset = region_field(i64::from(index_offset) + index_bytes.len() as i64)?;

    for property in &archive.properties {
        property.encode(writer)?;
    }

    Trailer {
        data_offset,
        data_count: region_field(cursor)?,
        index_offset,
        index_count: region_field(indexes.len() as i64)?,
        properties_offset,
        properties_count: region_field(archive.properties.len() as i64)?,
    }
    .encode(writer)?;

    Ok(())
}

fn region_field(value: i64) -> Result<i32, WriteError> {
    i32::try_from(value).map_err(|_| WriteError::TooLarge)
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("archive exceeds the 2GiB addressable range")]
    TooLarge,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use crate::format::{Entry, Property};
    use crate::read::extract;

    use super::*;

    #[test]
    fn build_then_extract_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.d2p");

        let archive = Archive {
            entries: vec![Entry {
                name: "a.swf".into(),
                bytes: b"payload".to_vec(),
            }],
            properties: vec![Property {
                key: "kind".into(),
                value: "maps".into(),
            }],
        };

        build(&path, &archive).unwrap();

        let reread = extract(&path).unwrap();
        assert_eq!(reread, archive);
    }

    #[test]
    fn empty_archive_is_header_plus_trailer() {
        let mut bytes = vec![];
        build_to(&mut bytes, &Archive::default()).unwrap();
        assert_eq!(bytes.len(), 2 + 24);
    }
}
