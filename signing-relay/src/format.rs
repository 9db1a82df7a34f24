// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{AuxiliaryFiles, RelayError, RelayResult},
    binary_patch::ArtifactStorage,
    container_transform::{
        IdentityTransform, InstallerTransform, MetadataDigest, MetadataTransform, RawTransform,
        Transform, ZipTransform,
    },
    log::{info, warn},
    serde::{Deserialize, Serialize},
    std::str::FromStr,
};

/// Declared format of an artifact.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Raw,
    Pecoff,
    Powershell,
    Appx,
    Msi,
    Dmg,
    Macho,
    Zip,
    Appmanifest,
    Auto,
}

impl ArtifactFormat {
    pub const ALL: [Self; 10] = [
        Self::Raw,
        Self::Pecoff,
        Self::Powershell,
        Self::Appx,
        Self::Msi,
        Self::Dmg,
        Self::Macho,
        Self::Zip,
        Self::Appmanifest,
        Self::Auto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Pecoff => "pecoff",
            Self::Powershell => "powershell",
            Self::Appx => "appx",
            Self::Msi => "msi",
            Self::Dmg => "dmg",
            Self::Macho => "macho",
            Self::Zip => "zip",
            Self::Appmanifest => "appmanifest",
            Self::Auto => "auto",
        }
    }
}

impl std::fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RelayError::UnknownFormat(s.to_string()))
    }
}

/// Inputs to transform construction beyond the artifact itself.
#[derive(Clone, Debug, Default)]
pub struct TransformOptions {
    /// Named auxiliary blobs for code objects and disk images.
    pub blobs: Vec<(String, Vec<u8>)>,

    /// Produce an extended signature for installers.
    pub metadata_digest: Option<MetadataDigest>,
}

impl TransformOptions {
    /// Read auxiliary blobs from disk.
    pub fn from_files(files: &AuxiliaryFiles, msi_extended_signature: bool) -> RelayResult<Self> {
        let mut blobs = vec![];

        for (name, path) in files.entries() {
            let data =
                std::fs::read(path).map_err(|e| RelayError::FileRead(path.to_path_buf(), e))?;
            blobs.push((name.to_string(), data));
        }

        Ok(Self {
            blobs,
            metadata_digest: if msi_extended_signature {
                Some(MetadataDigest::Sha256)
            } else {
                None
            },
        })
    }

    fn blob(&self, name: &str) -> Option<&[u8]> {
        self.blobs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }
}

/// Construct the transform for an artifact of the given format.
///
/// Nothing is written to `source`. `auto` is rejected: the format must be
/// declared.
pub fn open_transform<'a, S: ArtifactStorage + ?Sized>(
    format: ArtifactFormat,
    source: &'a mut S,
    options: &TransformOptions,
) -> RelayResult<Transform<'a, S>> {
    let transform: Transform<'a, S> = match format {
        ArtifactFormat::Raw | ArtifactFormat::Pecoff => RawTransform::new(source).into(),
        ArtifactFormat::Powershell | ArtifactFormat::Appmanifest => {
            IdentityTransform::new(source).into()
        }
        ArtifactFormat::Appx | ArtifactFormat::Zip => ZipTransform::new(source)?.into(),
        ArtifactFormat::Msi => InstallerTransform::new(source, options.metadata_digest)?.into(),
        ArtifactFormat::Dmg => {
            for (name, _) in options.blobs.iter().filter(|(n, _)| n != "requirements") {
                warn!("ignoring {} blob; disk images only carry requirements", name);
            }

            let requirements = options.blob("requirements").unwrap_or_default().to_vec();
            MetadataTransform::disk_image(source, requirements)?.into()
        }
        ArtifactFormat::Macho => {
            MetadataTransform::code_object(source, options.blobs.clone())?.into()
        }
        ArtifactFormat::Auto => return Err(RelayError::AutoFormat),
    };

    info!("using {} transform for {} artifact", transform.name(), format);

    Ok(transform)
}
