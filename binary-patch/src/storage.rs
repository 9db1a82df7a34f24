// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Random access storage for artifacts.

use std::{
    fs::File,
    io::{Cursor, Read, Seek, SeekFrom, Write},
};

/// Random access byte storage backing an artifact.
///
/// Both the source and the destination of a signing operation are accessed
/// through this trait. Besides the standard I/O traits, implementations need
/// to report their size and support truncation (or zero extension).
pub trait ArtifactStorage: Read + Write + Seek {
    /// Current size of the storage in bytes.
    fn size(&mut self) -> std::io::Result<u64>;

    /// Resize the storage to exactly `len` bytes.
    ///
    /// Growing fills with zeroes. The stream position is not changed.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;

    /// Write `data` at an absolute offset.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }

    /// Read the full contents of the storage.
    fn read_all(&mut self) -> std::io::Result<Vec<u8>> {
        self.rewind()?;
        let mut data = vec![];
        self.read_to_end(&mut data)?;

        Ok(data)
    }

    /// Replace the full contents of the storage with `data`.
    fn replace_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.truncate(0)?;
        self.rewind()?;
        self.write_all(data)?;
        self.flush()
    }
}

impl ArtifactStorage for File {
    fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

impl ArtifactStorage for Cursor<Vec<u8>> {
    fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        let len = usize::try_from(len).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "length exceeds addressable memory",
            )
        })?;
        self.get_mut().resize(len, 0);

        Ok(())
    }
}

impl<S: ArtifactStorage + ?Sized> ArtifactStorage for &mut S {
    fn size(&mut self) -> std::io::Result<u64> {
        (**self).size()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        (**self).truncate(len)
    }
}

impl<S: ArtifactStorage + ?Sized> ArtifactStorage for Box<S> {
    fn size(&mut self) -> std::io::Result<u64> {
        (**self).size()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        (**self).truncate(len)
    }
}

/// Make `dest` a byte for byte copy of `source`.
///
/// Both storages are read and written from their start. Returns the number of
/// bytes copied.
pub fn copy_storage<S, D>(source: &mut S, dest: &mut D) -> std::io::Result<u64>
where
    S: ArtifactStorage + ?Sized,
    D: ArtifactStorage + ?Sized,
{
    source.rewind()?;
    dest.rewind()?;
    dest.truncate(0)?;

    let copied = std::io::copy(source, dest)?;
    dest.flush()?;

    Ok(copied)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cursor_truncate_extends_with_zeroes() -> std::io::Result<()> {
        let mut storage = Cursor::new(vec![1u8; 4]);
        storage.truncate(6)?;
        assert_eq!(storage.get_ref(), &vec![1, 1, 1, 1, 0, 0]);

        storage.truncate(2)?;
        assert_eq!(storage.size()?, 2);

        Ok(())
    }

    #[test]
    fn file_write_at_and_read_all() -> std::io::Result<()> {
        let mut fh = tempfile::tempfile()?;
        fh.replace_all(b"hello world")?;
        fh.write_at(6, b"there")?;

        assert_eq!(fh.read_all()?, b"hello there");
        assert_eq!(fh.size()?, 11);

        Ok(())
    }

    #[test]
    fn copy_replaces_longer_destination() -> std::io::Result<()> {
        let mut source = Cursor::new(b"short".to_vec());
        let mut dest = Cursor::new(b"much longer content".to_vec());

        assert_eq!(copy_storage(&mut source, &mut dest)?, 5);
        assert_eq!(dest.into_inner(), b"short");

        Ok(())
    }
}
