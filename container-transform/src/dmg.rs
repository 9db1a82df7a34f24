// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Disk image trailers.

The last 512 bytes of a disk image are a "koly" structure, which we represent
by [KolyTrailer]. Signers need its raw bytes: the code directory of a signed
image records a digest over it, with the code signature size zeroed.
*/

use {
    crate::{TransformError, TransformResult},
    scroll::{Pread, BE},
    std::io::{Read, Seek, SeekFrom},
};

/// Size of the trailer in bytes.
pub const KOLY_SIZE: u64 = 512;

const VERSION_OFFSET: usize = 4;
const HEADER_SIZE_OFFSET: usize = 8;
const DATA_FORK_LENGTH_OFFSET: usize = 32;
const PLIST_OFFSET_OFFSET: usize = 216;
const PLIST_LENGTH_OFFSET: usize = 224;

/// The fields of a UDIF trailer a disk image transform consults.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KolyTrailer {
    pub version: u32,
    pub header_size: u32,
    pub data_fork_length: u64,
    pub plist_offset: u64,
    pub plist_length: u64,
}

impl KolyTrailer {
    /// Read the trailer from the end of a seekable stream.
    ///
    /// Returns the parsed trailer and its raw bytes.
    pub fn read_from<R: Read + Seek + ?Sized>(
        reader: &mut R,
    ) -> TransformResult<(Self, Vec<u8>)> {
        let size = reader.seek(SeekFrom::End(0))?;
        if size < KOLY_SIZE {
            return Err(TransformError::TrailerTooSmall(size));
        }

        reader.seek(SeekFrom::Start(size - KOLY_SIZE))?;

        let mut data = vec![0u8; KOLY_SIZE as usize];
        reader.read_exact(&mut data)?;

        let koly = Self::parse(&data)?;

        Ok((koly, data))
    }

    /// Parse a trailer from its raw bytes.
    pub fn parse(data: &[u8]) -> TransformResult<Self> {
        let magic = data.get(0..4).unwrap_or(data);
        if magic != b"koly" {
            return Err(TransformError::TrailerBadMagic(hex::encode(magic)));
        }

        Ok(Self {
            version: data.pread_with(VERSION_OFFSET, BE)?,
            header_size: data.pread_with(HEADER_SIZE_OFFSET, BE)?,
            data_fork_length: data.pread_with(DATA_FORK_LENGTH_OFFSET, BE)?,
            plist_offset: data.pread_with(PLIST_OFFSET_OFFSET, BE)?,
            plist_length: data.pread_with(PLIST_LENGTH_OFFSET, BE)?,
        })
    }

    /// Offset of the byte after the plist data.
    ///
    /// This is where an embedded signature superblob starts, if present.
    pub fn offset_after_plist(&self) -> u64 {
        self.plist_offset + self.plist_length
    }
}
