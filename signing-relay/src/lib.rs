// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Drive artifacts through a signing operation.

A signing operation is three steps:

1. A [container_transform::ContainerTransform] is chosen from the declared
   [ArtifactFormat] and presents the signable payload of the artifact.
2. The payload is streamed into a [PayloadSigner], which digests it, has
   the digest signed (typically by a [remote_signing_key::RemoteSigningKey])
   and responds with either a binary patch or a signature blob.
3. The response is folded back into the artifact, producing the output
   file.

[Pipeline] performs these steps. [SigningConfig] describes an operation and
the custodian holding the key.
*/

mod config;
pub use config::{
    default_config_path, default_output_path, AuxiliaryFiles, AzureConfig, CertificateConfig,
    SigningConfig, TokenType, TrustedSigningConfig, CONFIG_BASE64_ENV, CONFIG_ENV,
    DEFAULT_MS_TIMESTAMP_URL, DEFAULT_TIMESTAMP_URL,
};
mod format;
pub use format::{open_transform, ArtifactFormat, TransformOptions};
mod pipeline;
pub use pipeline::{same_file, sign_transform, Pipeline};
mod signer;
pub use signer::{CommandSigner, PayloadSigner, SignRequest, SignerResponse};

use {
    binary_patch::BinaryPatchError, container_transform::TransformError,
    remote_signing_key::RemoteKeyError, std::path::PathBuf, thiserror::Error,
};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument: {0}")]
    CliBadArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error reading {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("binary patch error: {0}")]
    Patch(#[from] BinaryPatchError),

    #[error("container transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("remote key error: {0}")]
    RemoteKey(#[from] RemoteKeyError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("unable to resolve home directory for default configuration file")]
    NoHomeDirectory,

    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    #[error("unknown artifact format: {0}")]
    UnknownFormat(String),

    #[error("artifact format must be declared explicitly; auto detection is not supported")]
    AutoFormat,

    #[error("signer failed: {0}")]
    Signer(String),
}

/// Result type for this crate.
pub type RelayResult<T> = Result<T, RelayError>;
