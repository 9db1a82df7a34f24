// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Zip based containers.

A zip archive's central directory lives at the end of the file. Consumers
digesting the archive in one pass need it up front, so the payload is a
synthetic archive holding the central directory (through the end of the file)
followed by the complete zip file.
*/

use {
    crate::{
        apply_patch_response, apply_patch_response_in_place, ContainerTransform, ContentKind,
        SyntheticArchiveWriter, TransformError, TransformResult, ZIP,
    },
    binary_patch::ArtifactStorage,
    byteorder::{ByteOrder, LittleEndian},
    log::debug,
    std::io::{Read, Seek, SeekFrom, Write},
};

const END_OF_DIRECTORY_SIGNATURE: u32 = 0x06054b50;
const END_OF_DIRECTORY_SIZE: usize = 22;
const ZIP64_LOCATOR_SIGNATURE: u32 = 0x07064b50;
const ZIP64_LOCATOR_SIZE: usize = 20;
const ZIP64_END_OF_DIRECTORY_SIGNATURE: u32 = 0x06064b50;
const ZIP64_END_OF_DIRECTORY_SIZE: usize = 56;
const MAX_COMMENT_SIZE: usize = u16::MAX as usize;

/// Locate the offset of the central directory of a zip archive.
///
/// The end of central directory record is found by scanning backwards from
/// the end of the file. ZIP64 archives are followed through their locator to
/// the ZIP64 end of central directory record.
pub fn find_central_directory<R: Read + Seek + ?Sized>(
    reader: &mut R,
) -> TransformResult<u64> {
    let size = reader.seek(SeekFrom::End(0))?;

    let tail_size =
        size.min((END_OF_DIRECTORY_SIZE + MAX_COMMENT_SIZE + ZIP64_LOCATOR_SIZE) as u64);
    let tail_start = size - tail_size;

    reader.seek(SeekFrom::Start(tail_start))?;
    let mut tail = vec![0u8; tail_size as usize];
    reader.read_exact(&mut tail)?;

    if tail.len() < END_OF_DIRECTORY_SIZE {
        return Err(TransformError::ZipDirectoryNotFound);
    }

    let eocd = (0..=tail.len() - END_OF_DIRECTORY_SIZE)
        .rev()
        .find(|pos| {
            let record = &tail[*pos..];
            let comment_size = LittleEndian::read_u16(&record[20..22]) as usize;

            LittleEndian::read_u32(record) == END_OF_DIRECTORY_SIGNATURE
                && pos + END_OF_DIRECTORY_SIZE + comment_size <= tail.len()
        })
        .ok_or(TransformError::ZipDirectoryNotFound)?;

    let record = &tail[eocd..];
    let eocd_offset = tail_start + eocd as u64;
    let directory_size = LittleEndian::read_u32(&record[12..16]) as u64;
    let directory_offset = LittleEndian::read_u32(&record[16..20]) as u64;

    debug!("found end of central directory at offset {}", eocd_offset);

    let zip64_locator = eocd
        .checked_sub(ZIP64_LOCATOR_SIZE)
        .map(|pos| &tail[pos..eocd])
        .filter(|locator| LittleEndian::read_u32(locator) == ZIP64_LOCATOR_SIGNATURE);

    let directory_offset = if let Some(locator) = zip64_locator {
        let record_offset = LittleEndian::read_u64(&locator[8..16]);
        if record_offset >= eocd_offset {
            return Err(TransformError::ZipDirectoryMalformed(
                "ZIP64 record is not ahead of the end of central directory",
            ));
        }

        reader.seek(SeekFrom::Start(record_offset))?;
        let mut record = [0u8; ZIP64_END_OF_DIRECTORY_SIZE];
        reader.read_exact(&mut record)?;

        if LittleEndian::read_u32(&record) != ZIP64_END_OF_DIRECTORY_SIGNATURE {
            return Err(TransformError::ZipDirectoryMalformed(
                "bad ZIP64 end of central directory signature",
            ));
        }

        debug!("following ZIP64 end of central directory at {}", record_offset);

        LittleEndian::read_u64(&record[48..56])
    } else {
        if directory_offset + directory_size > eocd_offset {
            return Err(TransformError::ZipDirectoryMalformed(
                "central directory overlaps its end record",
            ));
        }

        directory_offset
    };

    if directory_offset > eocd_offset {
        return Err(TransformError::ZipDirectoryMalformed(
            "central directory starts after its end record",
        ));
    }

    Ok(directory_offset)
}

/// Sends the zip central directory ahead of the zip file.
///
/// The response is a binary patch against the zip file.
pub struct ZipTransform<'a, S: ArtifactStorage + ?Sized> {
    source: &'a mut S,
    directory_offset: u64,
}

impl<'a, S: ArtifactStorage + ?Sized> ZipTransform<'a, S> {
    /// Construct an instance, failing if no central directory can be found.
    pub fn new(source: &'a mut S) -> TransformResult<Self> {
        let directory_offset = find_central_directory(&mut *source)?;

        Ok(Self {
            source,
            directory_offset,
        })
    }

    /// Offset of the central directory in the source.
    pub fn directory_offset(&self) -> u64 {
        self.directory_offset
    }
}

impl<'a, S: ArtifactStorage + ?Sized> ContainerTransform for ZipTransform<'a, S> {
    fn write_payload(&mut self, sink: &mut dyn Write) -> TransformResult<()> {
        let size = self.source.size()?;
        let mut writer = SyntheticArchiveWriter::new(sink, ZIP);

        self.source.seek(SeekFrom::Start(self.directory_offset))?;
        writer.append_member_from(
            ZIP.auxiliary[0],
            &mut self.source,
            size - self.directory_offset,
        )?;

        self.source.rewind()?;
        writer.finish_with_payload(&mut self.source, size)?;

        Ok(())
    }

    fn reintegrate(
        &mut self,
        dest: &mut dyn ArtifactStorage,
        _content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        apply_patch_response(&mut *self.source, dest, response)
    }

    fn reintegrate_in_place(
        &mut self,
        _content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        apply_patch_response_in_place(&mut *self.source, response)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::SyntheticArchiveReader,
        std::io::Cursor,
        zip::{write::FileOptions, CompressionMethod, ZipWriter},
    };

    fn make_zip(comment: &str) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(vec![]));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);

        writer.start_file("AndroidManifest.xml", options).unwrap();
        writer.write_all(&[0x41; 300]).unwrap();
        writer.start_file("classes.dex", options).unwrap();
        writer.write_all(&[0x42; 1000]).unwrap();
        writer.set_comment(comment);

        writer.finish().unwrap().into_inner()
    }

    /// Offset of the first central directory file header.
    fn directory_start(data: &[u8]) -> u64 {
        data.windows(4)
            .position(|w| w == [0x50, 0x4b, 0x01, 0x02])
            .unwrap() as u64
    }

    #[test]
    fn locates_directory() -> TransformResult<()> {
        for comment in ["", "signed with PK\x05\x06 in the comment"] {
            let data = make_zip(comment);
            let offset = find_central_directory(&mut Cursor::new(&data))?;
            assert_eq!(offset, directory_start(&data));
        }

        Ok(())
    }

    #[test]
    fn not_a_zip() {
        assert!(matches!(
            find_central_directory(&mut Cursor::new(vec![0u8; 1000])),
            Err(TransformError::ZipDirectoryNotFound)
        ));
        assert!(matches!(
            find_central_directory(&mut Cursor::new(vec![0u8; 3])),
            Err(TransformError::ZipDirectoryNotFound)
        ));
    }

    #[test]
    fn synthetic_archive() -> TransformResult<()> {
        let data = make_zip("");
        let start = directory_start(&data) as usize;

        let mut source = Cursor::new(data.clone());
        let mut transform = ZipTransform::new(&mut source)?;

        let mut archive = vec![];
        transform.write_payload(&mut archive)?;

        let mut archive = tar::Archive::new(Cursor::new(archive));
        let mut reader = SyntheticArchiveReader::new(&mut archive, ZIP)?;

        assert_eq!(
            reader.read_member("zipdir.bin")?,
            Some(data[start..].to_vec())
        );

        let mut payload = vec![];
        reader.payload()?.read_to_end(&mut payload)?;
        assert_eq!(payload, data);

        Ok(())
    }
}
