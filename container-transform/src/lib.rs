// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Container transforms for signable artifacts.

Signers rarely need an artifact byte for byte. Some containers are sent
verbatim, some are reshaped first so a one pass consumer can digest them,
and some are decomposed into their component streams. Once a signature is
made, the signer's response has to be folded back into the container.

The [ContainerTransform] trait captures those two halves. Implementations:

* [IdentityTransform] sends the artifact (or nothing) and accepts either a
  binary patch or a full replacement.
* [RawTransform] sends the artifact and always expects a binary patch.
* [MetadataTransform] wraps disk images and code objects in a synthetic
  archive carrying auxiliary metadata ahead of the payload.
* [InstallerTransform] decomposes compound document installers and inserts
  the signature stream on the way back.
* [ZipTransform] sends the zip central directory ahead of the archive.

[Transform] is the tagged union over all of them.

Payload production is decoupled from consumption through a bounded pipe:
see [extract].
*/

mod archive;
pub use archive::{
    ArchiveLayout, PayloadReader, SyntheticArchiveReader, SyntheticArchiveWriter, CODE_OBJECT,
    DISK_IMAGE, ZIP,
};
mod dmg;
pub use dmg::KolyTrailer;
mod identity;
pub use identity::IdentityTransform;
mod installer;
pub use installer::{InstallerTransform, MetadataDigest};
mod kind;
pub use kind::Transform;
mod metadata;
pub use metadata::MetadataTransform;
mod pipe;
pub use pipe::{extract, PipeReader, PipeWriter};
mod raw;
pub use raw::RawTransform;
mod zipfile;
pub use zipfile::{find_central_directory, ZipTransform};

use {
    binary_patch::{ArtifactStorage, BinaryPatchError, PatchSet},
    log::debug,
    std::io::{Read, Write},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary patch error: {0}")]
    Patch(#[from] BinaryPatchError),

    #[error("binary data decoding error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("file of {0} bytes is too small to hold a disk image trailer")]
    TrailerTooSmall(u64),

    #[error("disk image trailer has bad magic: expected 6b6f6c79, found {0}")]
    TrailerBadMagic(String),

    #[error("unable to locate zip central directory")]
    ZipDirectoryNotFound,

    #[error("malformed zip central directory locator: {0}")]
    ZipDirectoryMalformed(&'static str),

    #[error("unable to parse compound document: {0}")]
    CompoundDocument(std::io::Error),

    #[error("unexpected archive member: {0}")]
    UnexpectedMember(String),

    #[error("archive member {requested} requested out of order (next member is {next})")]
    MemberOutOfOrder { requested: String, next: String },

    #[error("archive member {0} is missing")]
    MissingMember(String),

    #[error("archive member {0} is the payload and must be streamed")]
    NotAuxiliary(String),

    #[error("archive member {next} follows payload member {payload}")]
    TrailingMember { payload: String, next: String },

    #[error("archive member {name} is {expected} bytes but only {found} were available")]
    ShortMember {
        name: String,
        expected: u64,
        found: u64,
    },

    #[error("duplicate auxiliary blob: {0}")]
    DuplicateAuxiliary(String),

    #[error("a binary patch response requires a source artifact")]
    NoSource,

    #[error("payload producer panicked")]
    ProducerPanic,
}

/// Result type for this crate.
pub type TransformResult<T> = Result<T, TransformError>;

impl From<TransformError> for std::io::Error {
    fn from(e: TransformError) -> Self {
        match e {
            TransformError::Io(e) => e,
            e => std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        }
    }
}

/// The kind of content a signer responded with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ContentKind {
    /// A serialized [PatchSet].
    BinaryPatch,
    /// Anything else, identified by media type.
    Other(String),
}

impl ContentKind {
    /// Resolve from a media type, ignoring parameters.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime.split(';').next().unwrap_or_default().trim();

        if essence.eq_ignore_ascii_case(binary_patch::MIME_TYPE) {
            Self::BinaryPatch
        } else {
            Self::Other(mime.to_string())
        }
    }

    pub fn mime_type(&self) -> &str {
        match self {
            Self::BinaryPatch => binary_patch::MIME_TYPE,
            Self::Other(mime) => mime,
        }
    }
}

/// A container format adapter.
///
/// Instances borrow the source artifact for the duration of one signing
/// operation.
pub trait ContainerTransform {
    /// Whether [Self::write_payload] produces anything.
    fn has_payload(&self) -> bool {
        true
    }

    /// Write the bytes the signer should digest to `sink`.
    fn write_payload(&mut self, sink: &mut dyn Write) -> TransformResult<()>;

    /// Produce the signed artifact in `dest`, which is distinct from the source.
    fn reintegrate(
        &mut self,
        dest: &mut dyn ArtifactStorage,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()>;

    /// Produce the signed artifact by modifying the source.
    fn reintegrate_in_place(
        &mut self,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()>;
}

fn apply_patch_response<S: ArtifactStorage + ?Sized>(
    source: &mut S,
    dest: &mut dyn ArtifactStorage,
    response: &mut dyn Read,
) -> TransformResult<()> {
    let patch = PatchSet::read_from(&mut &mut *response)?;
    let mode = patch.apply(source, dest)?;
    debug!("applied {} patch ops ({:?})", patch.len(), mode);

    Ok(())
}

fn apply_patch_response_in_place<S: ArtifactStorage + ?Sized>(
    storage: &mut S,
    response: &mut dyn Read,
) -> TransformResult<()> {
    let patch = PatchSet::read_from(&mut &mut *response)?;
    let mode = patch.apply_in_place(storage)?;
    debug!("applied {} patch ops to source ({:?})", patch.len(), mode);

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_kind_from_mime() {
        assert_eq!(
            ContentKind::from_mime("application/x-binary-patch"),
            ContentKind::BinaryPatch
        );
        assert_eq!(
            ContentKind::from_mime("Application/X-Binary-Patch; charset=binary"),
            ContentKind::BinaryPatch
        );

        let other = ContentKind::from_mime("application/pkcs7-signature");
        assert_eq!(other.mime_type(), "application/pkcs7-signature");
    }
}
