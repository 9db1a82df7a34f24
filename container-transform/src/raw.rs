// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        apply_patch_response, apply_patch_response_in_place, ContainerTransform, ContentKind,
        TransformResult,
    },
    binary_patch::ArtifactStorage,
    log::warn,
    std::io::{Read, Seek, Write},
};

/// Sends the artifact unchanged and expects a binary patch back.
///
/// This is the transform for formats whose signature lives at fixed
/// offsets, like PE files and scripts.
pub struct RawTransform<'a, S: ArtifactStorage + ?Sized> {
    source: &'a mut S,
}

impl<'a, S: ArtifactStorage + ?Sized> RawTransform<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        Self { source }
    }
}

fn check_content(content: &ContentKind) {
    if let ContentKind::Other(mime) = content {
        warn!("treating {} response as a binary patch", mime);
    }
}

impl<'a, S: ArtifactStorage + ?Sized> ContainerTransform for RawTransform<'a, S> {
    fn write_payload(&mut self, sink: &mut dyn Write) -> TransformResult<()> {
        self.source.rewind()?;
        std::io::copy(&mut *self.source, sink)?;

        Ok(())
    }

    fn reintegrate(
        &mut self,
        dest: &mut dyn ArtifactStorage,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        check_content(content);
        apply_patch_response(&mut *self.source, dest, response)
    }

    fn reintegrate_in_place(
        &mut self,
        content: &ContentKind,
        response: &mut dyn Read,
    ) -> TransformResult<()> {
        check_content(content);
        apply_patch_response_in_place(&mut *self.source, response)
    }
}
