// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        open_transform, ArtifactFormat, PayloadSigner, RelayError, RelayResult, SignRequest,
        SignerResponse, SigningConfig, TransformOptions,
    },
    binary_patch::ArtifactStorage,
    container_transform::{extract, ContainerTransform, Transform},
    log::{debug, info, warn},
    std::{
        fs::{File, OpenOptions},
        path::Path,
    },
};

/// Signs artifact files: extract, sign, reintegrate.
#[derive(Clone, Debug)]
pub struct Pipeline {
    format: ArtifactFormat,
    options: TransformOptions,
}

impl Pipeline {
    pub fn new(format: ArtifactFormat, options: TransformOptions) -> Self {
        Self { format, options }
    }

    /// Construct from a validated configuration, reading auxiliary blobs.
    pub fn from_config(config: &SigningConfig) -> RelayResult<Self> {
        Ok(Self::new(
            config.signature_type.unwrap_or(ArtifactFormat::Auto),
            TransformOptions::from_files(&config.auxiliary, config.msi_extended_signature)?,
        ))
    }

    pub fn format(&self) -> ArtifactFormat {
        self.format
    }

    /// Sign `input`, writing the result to `output`.
    ///
    /// When both name the same file, the input is modified in place.
    /// Otherwise the input is only read. A failure before reintegration
    /// leaves the file system untouched.
    pub fn run(
        &self,
        signer: &mut dyn PayloadSigner,
        input: &Path,
        output: &Path,
    ) -> RelayResult<()> {
        let in_place = same_file(input, output);

        let mut source = if in_place {
            OpenOptions::new().read(true).write(true).open(input)
        } else {
            File::open(input)
        }
        .map_err(|e| RelayError::FileRead(input.to_path_buf(), e))?;

        let file_name = input
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut transform = open_transform(self.format, &mut source, &self.options)?;

        let request = SignRequest {
            format: self.format,
            file_name: &file_name,
        };
        let response = sign_transform(&mut transform, &request, signer)?;

        info!(
            "reintegrating {} response of {} bytes",
            response.content.mime_type(),
            response.data.len()
        );

        if in_place {
            transform.reintegrate_in_place(&response.content, &mut response.data.as_slice())?;
            info!("signed {} in place", input.display());

            return Ok(());
        }

        let mut dest = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(output)?;

        match transform.reintegrate(&mut dest, &response.content, &mut response.data.as_slice()) {
            Ok(()) => {
                info!("wrote {}", output.display());
                Ok(())
            }
            Err(e) => {
                drop(dest);
                warn!("removing incomplete output {}", output.display());
                if let Err(remove) = std::fs::remove_file(output) {
                    warn!("unable to remove {}: {}", output.display(), remove);
                }

                Err(e.into())
            }
        }
    }
}

/// Stream the payload of a transform through a signer.
pub fn sign_transform<S: ArtifactStorage + Send + ?Sized>(
    transform: &mut Transform<'_, S>,
    request: &SignRequest<'_>,
    signer: &mut dyn PayloadSigner,
) -> RelayResult<SignerResponse> {
    if transform.has_payload() {
        debug!("streaming {} payload to signer", transform.name());
        extract(transform, |reader| signer.sign_payload(request, reader))
    } else {
        debug!("{} transform has no payload", transform.name());
        signer.sign_payload(request, &mut std::io::empty())
    }
}

/// Whether two paths resolve to the same existing file.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
