// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        ContainerTransform, ContentKind, IdentityTransform, InstallerTransform,
        MetadataTransform, RawTransform, TransformResult, ZipTransform,
    },
    binary_patch::ArtifactStorage,
    std::io::{Read, Write},
};

/// Any of the container transforms.
pub enum Transform<'a, S: ArtifactStorage + ?Sized> {
    Identity(IdentityTransform<'a, S>),
    Raw(RawTransform<'a, S>),
    Metadata(MetadataTransform<'a, S>),
    Installer(InstallerTransform<'a, S>),
    Zip(ZipTransform<'a, S>),
}

impl<'a, S: ArtifactStorage + ?Sized> Transform<'a, S> {
    /// Short name of the variant, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity(_) => "identity",
            Self::Raw(_) => "raw",
            Self::Metadata(_) => "metadata",
            Self::Installer(_) => "installer",
            Self::Zip(_) => "zip",
        }
    }

    fn inner(&mut self) -> &mut dyn ContainerTransform {
        match self {
            Self::Identity(t) => t,
            Self::Raw(t) => t,
            Self::Metadata(t) => t,
            Self::Installer(t) => t,
            Self::Zip(t) => t,
        }
    }
}

impl<'a, S: ArtifactStorage + ?Sized> From<IdentityTransform<'a, S>> for Transform<'a, S> {
    fn from(t: IdentityTransform<'a, S>) -> Self {
        Self::Identity(t)
    }
}

impl<'a, S: ArtifactStorage + ?Sized> From<RawTransform<'a, S>> for Transform<'a, S> {
    fn from(t: RawTransform<'a, S>) -> Self {
        Self::Raw(t)
    }
}

impl<'a, S: ArtifactStorage + ?Sized> From<MetadataTransform<'a, S>> for Transform<'a, S> {
    fn from(t: MetadataTransform<'a, S>) -> Self {
        Self::Metadata(t)
    }
}

impl<'a, S: ArtifactStorage + ?Sized> From<InstallerTransform<'a, S>> for Transform<'a, S> {
    fn from(t: InstallerTransform<'a, S>) -> Self {
        Self::Installer(t)
    }
}

impl<'a, S: ArtifactStorage + ?Sized> From<ZipTransform<'a, S>> for Transform<'a, S> {
    fn from(t: ZipTransform<'a, S>) -> Self {
        Self::Zip(t)
    }
}

impl<'a, S: ArtifactStorage + ?Sized> ContainerTransform for Transform<'a, S> {
    fn has_payload(&self) -> bool {
        match self {
            Self::Identity(t) => t.has_payload(),
            Self::Raw(t) => t.has_payload(),
            Self::Metadata(t) => t.has_payload(),
            Self::Installer(t) => t.has_payload(),
            Self::Zip(t) => t.has_payload(),
        }
    }

    fn write_payload(&mut self, sink: &mut dyn Write) -> TransformResult<()> {
        self.inner().write_payload(sink)
    }

    fn reintegrate(
        &mut self,
        dest: &mut dyn ArtifactStorage,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        self.inner().reintegrate(dest, content, response)
    }

    fn reintegrate_in_place(
        &mut self,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        self.inner().reintegrate_in_place(content, response)
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::extract, binary_patch::PatchSet, std::io::Cursor};

    #[test]
    fn dispatches_to_variant() -> TransformResult<()> {
        let mut source = Cursor::new(b"0123456789".to_vec());
        let mut transform = Transform::from(RawTransform::new(&mut source));
        assert_eq!(transform.name(), "raw");
        assert!(transform.has_payload());

        let payload = extract(&mut transform, |reader| -> TransformResult<Vec<u8>> {
            let mut data = vec![];
            reader.read_to_end(&mut data)?;
            Ok(data)
        })?;
        assert_eq!(payload, b"0123456789");

        let mut patch = PatchSet::new();
        patch.add(10, 0, b"sig".to_vec());
        transform.reintegrate_in_place(&ContentKind::BinaryPatch, &mut &patch.to_bytes()?[..])?;
        drop(transform);

        assert_eq!(source.into_inner(), b"0123456789sig");

        Ok(())
    }

    #[test]
    fn identity_without_file() {
        let transform = Transform::from(IdentityTransform::<Cursor<Vec<u8>>>::without_file());
        assert_eq!(transform.name(), "identity");
        assert!(!transform.has_payload());
    }
}
