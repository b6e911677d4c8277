// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io::{Error, ErrorKind, Read, Result, Write};

/// Big-endian primitive reads used by the d2p container
pub trait ReadExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.read_array::<1>()?;
        Ok(bytes[0])
    }

    fn read_i16(&mut self) -> Result<i16> {
        let bytes = self.read_array()?;
        Ok(i16::from_be_bytes(bytes))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.read_array()?;
        Ok(i32::from_be_bytes(bytes))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut bytes = [0u8; N];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn read_vec(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; length];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// UTF string: i16 BE byte length followed by UTF-8 bytes
    fn read_utf(&mut self) -> Result<String> {
        let length = self.read_i16()?;
        if length < 0 {
            return Err(Error::new(ErrorKind::InvalidData, "negative string length"));
        }
        let bytes = self.read_vec(length as usize)?;
        String::from_utf8(bytes).map_err(|e| Error::new(ErrorKind::InvalidData, e))
    }
}

impl<T: Read> ReadExt for T {}

pub trait WriteExt: Write {
    fn write_u8(&mut self, item: u8) -> Result<()> {
        self.write_array([item])
    }

    fn write_i16(&mut self, item: i16) -> Result<()> {
        self.write_array(item.to_be_bytes())
    }

    fn write_i32(&mut self, item: i32) -> Result<()> {
        self.write_array(item.to_be_bytes())
    }

    fn write_array<const N: usize>(&mut self, bytes: [u8; N]) -> Result<()> {
        self.write_all(&bytes)?;
        Ok(())
    }

    fn write_utf(&mut self, item: &str) -> Result<()> {
        let length = i16::try_from(item.len())
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "string too long for i16 prefix"))?;
        self.write_i16(length)?;
        self.write_all(item.as_bytes())?;
        Ok(())
    }
}

impl<T: Write> WriteExt for T {}
