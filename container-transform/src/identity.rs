// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        apply_patch_response, apply_patch_response_in_place, ContainerTransform, ContentKind,
        TransformError, TransformResult,
    },
    binary_patch::ArtifactStorage,
    log::debug,
    std::io::{Read, Seek, Write},
};

/// Sends the artifact unchanged.
///
/// Signers may answer with a binary patch or with a complete replacement.
/// Without a source file, there is no payload and only replacements are
/// accepted.
pub struct IdentityTransform<'a, S: ArtifactStorage + ?Sized> {
    source: Option<&'a mut S>,
}

impl<'a, S: ArtifactStorage + ?Sized> IdentityTransform<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        Self {
            source: Some(source),
        }
    }

    /// An instance for signers that only need a file name.
    pub fn without_file() -> Self {
        Self { source: None }
    }
}

fn replace_with_response(
    dest: &mut dyn ArtifactStorage,
    response: &mut dyn Read,
) -> TransformResult<()> {
    dest.truncate(0)?;
    dest.rewind()?;
    let written = std::io::copy(response, dest)?;
    dest.flush()?;

    debug!("replaced destination with {} response bytes", written);

    Ok(())
}

impl<'a, S: ArtifactStorage + ?Sized> ContainerTransform for IdentityTransform<'a, S> {
    fn has_payload(&self) -> bool {
        self.source.is_some()
    }

    fn write_payload(&mut self, sink: &mut dyn Write) -> TransformResult<()> {
        if let Some(source) = self.source.as_mut() {
            source.rewind()?;
            std::io::copy(&mut **source, sink)?;
        }

        Ok(())
    }

    fn reintegrate(
        &mut self,
        dest: &mut dyn ArtifactStorage,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        match content {
            ContentKind::BinaryPatch => {
                let source = self.source.as_mut().ok_or(TransformError::NoSource)?;
                apply_patch_response(&mut **source, dest, response)
            }
            ContentKind::Other(_) => replace_with_response(dest, response),
        }
    }

    fn reintegrate_in_place(
        &mut self,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        let source = self.source.as_mut().ok_or(TransformError::NoSource)?;

        match content {
            ContentKind::BinaryPatch => apply_patch_response_in_place(&mut **source, response),
            ContentKind::Other(_) => {
                // The source is only truncated once the response was fully read.
                let mut buffered = buffer_response(response)?;
                replace_with_response(source, &mut buffered)
            }
        }
    }
}

fn buffer_response(response: &mut dyn Read) -> TransformResult<std::io::Cursor<Vec<u8>>> {
    let mut data = vec![];
    response.read_to_end(&mut data)?;

    Ok(std::io::Cursor::new(data))
}
