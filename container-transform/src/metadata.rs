// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        apply_patch_response, apply_patch_response_in_place, ArchiveLayout, ContainerTransform,
        ContentKind, KolyTrailer, SyntheticArchiveWriter, TransformError, TransformResult,
        CODE_OBJECT, DISK_IMAGE,
    },
    binary_patch::ArtifactStorage,
    log::debug,
    std::io::{Read, Seek, Write},
};

/// Wraps an artifact in a synthetic archive together with signing metadata.
///
/// Used for disk images, where the UDIF trailer is sent ahead of the image,
/// and for code objects, where code requirements, entitlements, resource
/// manifests and Info.plist content accompany the executable. The response
/// is a binary patch against the artifact.
pub struct MetadataTransform<'a, S: ArtifactStorage + ?Sized> {
    source: &'a mut S,
    layout: ArchiveLayout,
    blobs: Vec<(&'static str, Vec<u8>)>,
}

impl<'a, S: ArtifactStorage + ?Sized> MetadataTransform<'a, S> {
    /// Construct an instance for a disk image.
    ///
    /// Fails if the source does not end with a UDIF trailer.
    pub fn disk_image(source: &'a mut S, requirements: Vec<u8>) -> TransformResult<Self> {
        let (koly, raw) = KolyTrailer::read_from(&mut *source)?;

        debug!(
            "disk image data fork is {} bytes; code signature at offset {}",
            koly.data_fork_length,
            koly.offset_after_plist()
        );

        Ok(Self {
            source,
            layout: DISK_IMAGE,
            blobs: vec![
                (DISK_IMAGE.auxiliary[0], raw),
                (DISK_IMAGE.auxiliary[1], requirements),
            ],
        })
    }

    /// Construct an instance for a code object with named auxiliary blobs.
    ///
    /// Recognized names are `requirements`, `entitlements`, `resources` and
    /// `info-plist`. Blobs are sent in that order regardless of the order
    /// given.
    pub fn code_object(
        source: &'a mut S,
        blobs: impl IntoIterator<Item = (String, Vec<u8>)>,
    ) -> TransformResult<Self> {
        let mut ordered: Vec<(usize, &'static str, Vec<u8>)> = vec![];

        for (name, data) in blobs {
            let position = CODE_OBJECT
                .auxiliary
                .iter()
                .position(|n| *n == name)
                .ok_or_else(|| TransformError::UnexpectedMember(name.clone()))?;

            if ordered.iter().any(|(p, _, _)| *p == position) {
                return Err(TransformError::DuplicateAuxiliary(name));
            }

            ordered.push((position, CODE_OBJECT.auxiliary[position], data));
        }

        ordered.sort_by_key(|(position, _, _)| *position);

        Ok(Self {
            source,
            layout: CODE_OBJECT,
            blobs: ordered
                .into_iter()
                .map(|(_, name, data)| (name, data))
                .collect(),
        })
    }

    pub fn layout(&self) -> ArchiveLayout {
        self.layout
    }
}

impl<'a, S: ArtifactStorage + ?Sized> ContainerTransform for MetadataTransform<'a, S> {
    fn write_payload(&mut self, sink: &mut dyn Write) -> TransformResult<()> {
        let mut writer = SyntheticArchiveWriter::new(sink, self.layout);

        for (name, data) in &self.blobs {
            writer.append_member(name, data)?;
        }

        let size = self.source.size()?;
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
        crate::{dmg::test::disk_image, SyntheticArchiveReader},
        binary_patch::PatchSet,
        std::io::Cursor,
    };

    #[test]
    fn disk_image_archive() -> TransformResult<()> {
        let image = disk_image(&[7u8; 4096]);
        let mut source = Cursor::new(image.clone());
        let mut transform = MetadataTransform::disk_image(&mut source, b"reqs".to_vec())?;

        let mut archive = vec![];
        transform.write_payload(&mut archive)?;

        let mut archive = tar::Archive::new(Cursor::new(archive));
        let mut reader = SyntheticArchiveReader::new(&mut archive, DISK_IMAGE)?;

        let members = reader.read_auxiliary()?;
        assert_eq!(
            members.keys().collect::<Vec<_>>(),
            vec!["requirements", "udifheader.bin"]
        );
        assert_eq!(members["udifheader.bin"], &image[4096..]);
        assert_eq!(members["requirements"], b"reqs");

        let mut payload = vec![];
        reader.payload()?.read_to_end(&mut payload)?;
        assert_eq!(payload, image);

        Ok(())
    }

    #[test]
    fn disk_image_without_trailer() {
        let mut source = Cursor::new(vec![0u8; 4096]);
        assert!(matches!(
            MetadataTransform::disk_image(&mut source, vec![]),
            Err(TransformError::TrailerBadMagic(_))
        ));
    }

    #[test]
    fn code_object_orders_blobs() -> TransformResult<()> {
        let mut source = Cursor::new(b"\xcf\xfa\xed\xfemacho".to_vec());
        let mut transform = MetadataTransform::code_object(
            &mut source,
            vec![
                ("info-plist".to_string(), b"<plist/>".to_vec()),
                ("requirements".to_string(), b"reqs".to_vec()),
            ],
        )?;

        let mut archive = vec![];
        transform.write_payload(&mut archive)?;

        let mut archive = tar::Archive::new(Cursor::new(archive));
        let mut reader = SyntheticArchiveReader::new(&mut archive, CODE_OBJECT)?;
        assert_eq!(reader.read_member("requirements")?, Some(b"reqs".to_vec()));
        assert_eq!(reader.read_member("entitlements")?, None);
        assert_eq!(
            reader.read_member("info-plist")?,
            Some(b"<plist/>".to_vec())
        );

        let mut payload = vec![];
        reader.payload()?.read_to_end(&mut payload)?;
        assert_eq!(payload, b"\xcf\xfa\xed\xfemacho");

        Ok(())
    }

    #[test]
    fn code_object_member_names() -> TransformResult<()> {
        let mut source = Cursor::new(b"macho".to_vec());
        let mut transform = MetadataTransform::code_object(
            &mut source,
            vec![("entitlements".to_string(), b"<plist/>".to_vec())],
        )?;

        let mut archive = vec![];
        transform.write_payload(&mut archive)?;

        let mut archive = tar::Archive::new(Cursor::new(archive));
        let names = archive
            .entries()?
            .map(|entry| Ok(entry?.path()?.display().to_string()))
            .collect::<std::io::Result<Vec<_>>>()?;
        assert_eq!(names, vec!["entitlements", "contents.dmg"]);

        Ok(())
    }

    #[test]
    fn code_object_rejects_unknown_blob() {
        let mut source = Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            MetadataTransform::code_object(&mut source, vec![("bogus".to_string(), vec![])]),
            Err(TransformError::UnexpectedMember(name)) if name == "bogus"
        ));

        let mut source = Cursor::new(Vec::<u8>::new());
        assert!(matches!(
            MetadataTransform::code_object(
                &mut source,
                vec![
                    ("entitlements".to_string(), vec![]),
                    ("entitlements".to_string(), vec![]),
                ]
            ),
            Err(TransformError::DuplicateAuxiliary(_))
        ));
    }

    #[test]
    fn response_is_patch() -> TransformResult<()> {
        let image = disk_image(&[1u8; 1024]);
        let signature_offset = image.len() as u64 - 512;

        // Insert a signature ahead of the trailer.
        let mut patch = PatchSet::new();
        patch.add(signature_offset, 0, vec![0xfa; 64]);

        let mut source = Cursor::new(image.clone());
        let mut transform = MetadataTransform::disk_image(&mut source, vec![])?;
        let mut dest = Cursor::new(vec![]);
        transform.reintegrate(
            &mut dest,
            &ContentKind::BinaryPatch,
            &mut &patch.to_bytes()?[..],
        )?;

        let signed = dest.into_inner();
        assert_eq!(signed.len(), image.len() + 64);
        assert_eq!(&signed[1024..1088], &[0xfa; 64][..]);
        assert_eq!(&signed[1088..], &image[1024..]);

        Ok(())
    }
}
