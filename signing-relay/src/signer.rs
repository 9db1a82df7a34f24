// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{ArtifactFormat, RelayError, RelayResult},
    container_transform::ContentKind,
    log::{debug, warn},
    std::{io::Read, path::PathBuf},
};

/// What is being signed.
#[derive(Clone, Copy, Debug)]
pub struct SignRequest<'a> {
    pub format: ArtifactFormat,

    /// File name of the artifact, without directories.
    pub file_name: &'a str,
}

/// What a signer hands back for reintegration.
#[derive(Clone, Debug)]
pub struct SignerResponse {
    pub content: ContentKind,
    pub data: Vec<u8>,
}

/// Digests a payload and produces the signature or patch for it.
///
/// Implementations own the format specific digest rules and whatever key
/// they sign with.
pub trait PayloadSigner {
    fn sign_payload(
        &mut self,
        request: &SignRequest<'_>,
        payload: &mut dyn Read,
    ) -> RelayResult<SignerResponse>;
}

/// A [PayloadSigner] delegating to an external program.
///
/// The payload is fed to the program's stdin and its stdout is the
/// response. The artifact format and file name are exported as
/// `SIGRELAY_FORMAT` and `SIGRELAY_FILE_NAME`.
#[derive(Clone, Debug)]
pub struct CommandSigner {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    content: ContentKind,
}

impl CommandSigner {
    /// The response is assumed to be a binary patch.
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            env: vec![],
            content: ContentKind::BinaryPatch,
        }
    }

    #[must_use]
    pub fn with_content(mut self, content: ContentKind) -> Self {
        self.content = content;
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

impl PayloadSigner for CommandSigner {
    fn sign_payload(
        &mut self,
        request: &SignRequest<'_>,
        payload: &mut dyn Read,
    ) -> RelayResult<SignerResponse> {
        // The program reads the payload from a regular file.
        let mut spool = tempfile::NamedTempFile::new()?;
        let size = std::io::copy(payload, spool.as_file_mut())?;
        debug!(
            "spooled {} byte payload for {}",
            size,
            self.program.display()
        );

        let mut command = duct::cmd(&self.program, &self.args)
            .stdin_path(spool.path())
            .stdout_capture()
            .env("SIGRELAY_FORMAT", request.format.as_str())
            .env("SIGRELAY_FILE_NAME", request.file_name)
            .unchecked();

        for (key, value) in &self.env {
            command = command.env(key, value);
        }

        let output = command.run()?;

        if !output.status.success() {
            warn!(
                "{} produced {} bytes before failing",
                self.program.display(),
                output.stdout.len()
            );

            return Err(RelayError::Signer(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }

        debug!("signer responded with {} bytes", output.stdout.len());

        Ok(SignerResponse {
            content: self.content.clone(),
            data: output.stdout,
        })
    }
}
