// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

pub(crate) mod ext;
mod format;
pub mod read;
pub mod write;

pub use self::format::{Entry, Header, Property, TRAILER_SIZE};
pub use self::read::{extract, extract_from, Archive, ReadError};
pub use self::write::{build, build_to, WriteError};

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    fn sample() -> Archive {
        Archive {
            entries: vec![
                Entry {
                    name: "maps/area0.ele".into(),
                    bytes: vec![0xde, 0xad, 0xbe, 0xef],
                },
                Entry {
                    name: "maps/area1.ele".into(),
                    bytes: vec![1, 2, 3],
                },
                Entry {
                    name: "empty.bin".into(),
                    bytes: vec![],
                },
            ],
            properties: vec![Property {
                key: "link".into(),
                value: "maps1.d2p".into(),
            }],
        }
    }

    #[test]
    fn roundtrip() {
        let archive = sample();

        let mut bytes = vec![];
        build_to(&mut bytes, &archive).expect("build archive");

        let reread = extract_from(Cursor::new(&bytes)).expect("extract archive");
        assert_eq!(reread.entries, archive.entries);
        assert_eq!(reread.properties, archive.properties);

        // Byte stability: rebuilding the extracted archive is identical
        let mut rebuilt = vec![];
        build_to(&mut rebuilt, &reread).expect("rebuild archive");
        assert_eq!(rebuilt, bytes);
    }

    #[test]
    fn entry_lookup() {
        let archive = sample();
        assert_eq!(archive.get("maps/area1.ele"), Some([1u8, 2, 3].as_slice()));
        assert_eq!(archive.get("missing"), None);
    }
}
