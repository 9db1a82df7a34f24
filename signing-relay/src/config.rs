// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing operation configuration.

use {
    crate::{ArtifactFormat, RelayError, RelayResult},
    log::{info, warn},
    remote_signing_key::{
        ClientSecretCredential, ConfiguredKey, KeyVaultClient, LocalKey, StaticTokenCredential,
        TokenCredential, TrustedSigningClient, TrustedSigningKey, VaultKey,
    },
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
};

/// Environment variable holding a complete JSON or YAML configuration.
pub const CONFIG_ENV: &str = "SIGRELAY_CONFIG";

/// Environment variable holding a base64 encoded configuration.
///
/// Takes precedence over [CONFIG_ENV].
pub const CONFIG_BASE64_ENV: &str = "SIGRELAY_CONFIG_BASE64";

pub const DEFAULT_TIMESTAMP_URL: &str = "http://timestamp.globalsign.com/tsa/advanced";

pub const DEFAULT_MS_TIMESTAMP_URL: &str = "http://timestamp.microsoft.com/tsa";

/// Which custodian holds the signing key.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenType {
    /// Azure Key Vault.
    Azure,
    /// Azure Trusted Signing.
    AzureTrusted,
    /// A certificate and private key on hand.
    Certificate,
}

/// Azure Key Vault settings.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AzureConfig {
    pub vault_url: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Pre-issued bearer token, used instead of the client secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub certificate_name: String,
    /// Empty means the current version.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub certificate_version: String,
}

/// Azure Trusted Signing settings.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrustedSigningConfig {
    /// Short region name like `eus`.
    pub region: String,
    /// Explicit service endpoint, overriding [Self::region].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub account_name: String,
    pub certificate_profile: String,
}

/// Local certificate settings.
///
/// `certificate` and `privateKey` hold PEM text, or otherwise name a file
/// holding PEM or DER.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CertificateConfig {
    pub certificate: String,
    pub private_key: String,
    /// Decrypts an encrypted private key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl CertificateConfig {
    /// Construct the key, reading files as needed.
    pub fn load_key(&self) -> RelayResult<LocalKey> {
        if self.certificate.is_empty() {
            return Err(RelayError::MissingConfig("certificate.certificate"));
        }
        if self.private_key.is_empty() {
            return Err(RelayError::MissingConfig("certificate.privateKey"));
        }

        Ok(LocalKey::from_pem_or_der(
            &inline_or_file(&self.certificate)?,
            &inline_or_file(&self.private_key)?,
            self.passphrase.as_deref(),
        )?)
    }
}

fn inline_or_file(value: &str) -> RelayResult<Vec<u8>> {
    if value.contains("-----BEGIN ") {
        return Ok(value.as_bytes().to_vec());
    }

    let path = Path::new(value.trim());
    std::fs::read(path).map_err(|e| RelayError::FileRead(path.to_path_buf(), e))
}

/// Paths to auxiliary blobs sent ahead of code objects and disk images.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuxiliaryFiles {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_plist: Option<PathBuf>,
}

impl AuxiliaryFiles {
    /// Blob names and the paths they are read from, in archive order.
    pub fn entries(&self) -> Vec<(&'static str, &Path)> {
        [
            ("requirements", &self.requirements),
            ("entitlements", &self.entitlements),
            ("resources", &self.resources),
            ("info-plist", &self.info_plist),
        ]
        .into_iter()
        .filter_map(|(name, path)| path.as_deref().map(|path| (name, path)))
        .collect()
    }
}

/// Describes a signing operation.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SigningConfig {
    pub token_type: Option<TokenType>,
    pub signature_type: Option<ArtifactFormat>,
    pub azure: AzureConfig,
    pub azure_trusted: TrustedSigningConfig,
    pub certificate: CertificateConfig,
    pub timestamp_url: Option<String>,
    pub ms_timestamp_url: Option<String>,
    pub input_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub auxiliary: AuxiliaryFiles,
    /// Write an extended signature to installers.
    pub msi_extended_signature: bool,
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("token_type", &self.token_type)
            .field("signature_type", &self.signature_type)
            .field("timestamp_url", &self.timestamp_url)
            .field("ms_timestamp_url", &self.ms_timestamp_url)
            .field("input_file", &self.input_file)
            .field("output_file", &self.output_file)
            .field("auxiliary", &self.auxiliary)
            .field("msi_extended_signature", &self.msi_extended_signature)
            .finish_non_exhaustive()
    }
}

impl SigningConfig {
    /// Parse JSON or YAML.
    pub fn parse(data: &[u8]) -> RelayResult<Self> {
        match serde_json::from_slice(data) {
            Ok(config) => Ok(config),
            Err(_) => Ok(serde_yaml::from_slice(data)?),
        }
    }

    /// Read from a file.
    pub fn from_path(path: &Path) -> RelayResult<Self> {
        let data =
            std::fs::read(path).map_err(|e| RelayError::FileRead(path.to_path_buf(), e))?;

        Self::parse(&data)
    }

    /// Load from the environment, falling back to a configuration file.
    ///
    /// `path` defaults to [default_config_path].
    pub fn load(path: Option<&Path>) -> RelayResult<Self> {
        Self::load_with_env(|name| std::env::var(name).ok(), path)
    }

    fn load_with_env(
        env: impl Fn(&str) -> Option<String>,
        path: Option<&Path>,
    ) -> RelayResult<Self> {
        if let Some(encoded) = env(CONFIG_BASE64_ENV).filter(|v| !v.trim().is_empty()) {
            info!("using configuration from {}", CONFIG_BASE64_ENV);
            return Self::parse(&base64::decode(encoded.trim())?);
        }

        if let Some(raw) = env(CONFIG_ENV).filter(|v| !v.trim().is_empty()) {
            info!("using configuration from {}", CONFIG_ENV);
            return Self::parse(raw.as_bytes());
        }

        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_config_path().ok_or(RelayError::NoHomeDirectory)?,
        };

        info!("using configuration file {}", path.display());
        Self::from_path(&path)
    }

    /// Check required settings and fill in defaults.
    pub fn validate(&mut self) -> RelayResult<()> {
        let input = self
            .input_file
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(RelayError::MissingConfig("inputFile"))?;

        if self.output_file.is_none() {
            self.output_file = Some(default_output_path(input));
        }

        match self.token_type {
            None => return Err(RelayError::MissingConfig("tokenType")),
            Some(TokenType::Azure) => {
                if self.azure.client_secret.is_empty() && self.azure.access_token.is_none() {
                    return Err(RelayError::MissingConfig("azure.clientSecret"));
                }
            }
            Some(TokenType::AzureTrusted) => {
                if self.azure_trusted.client_secret.is_empty()
                    && self.azure_trusted.access_token.is_none()
                {
                    return Err(RelayError::MissingConfig("azureTrusted.clientSecret"));
                }
            }
            Some(TokenType::Certificate) => {
                if self.certificate.private_key.is_empty() {
                    return Err(RelayError::MissingConfig("certificate.privateKey"));
                }
                if self.certificate.certificate.is_empty() {
                    return Err(RelayError::MissingConfig("certificate.certificate"));
                }
            }
        }

        if self.signature_type.is_none() {
            self.signature_type = Some(ArtifactFormat::Auto);
        }

        if self.timestamp_url.is_none() {
            self.timestamp_url = Some(DEFAULT_TIMESTAMP_URL.to_string());
        }

        if self.ms_timestamp_url.is_none() {
            self.ms_timestamp_url = Some(DEFAULT_MS_TIMESTAMP_URL.to_string());
        }

        Ok(())
    }

    /// Construct the signing key described by this configuration.
    ///
    /// No network requests are made until the key is used. Local keys are
    /// read and checked immediately.
    pub fn remote_key(&self) -> RelayResult<ConfiguredKey> {
        match self.token_type {
            Some(TokenType::Azure) => {
                let azure = &self.azure;

                if azure.vault_url.is_empty() {
                    return Err(RelayError::MissingConfig("azure.vaultUrl"));
                }
                if azure.certificate_name.is_empty() {
                    return Err(RelayError::MissingConfig("azure.certificateName"));
                }

                let credential = credential(
                    &azure.tenant_id,
                    &azure.client_id,
                    &azure.client_secret,
                    azure.access_token.as_deref(),
                )?;
                let client = KeyVaultClient::new(&azure.vault_url, credential)?;

                Ok(ConfiguredKey::Vault(VaultKey::new(
                    client,
                    &azure.certificate_name,
                    &azure.certificate_version,
                )))
            }
            Some(TokenType::AzureTrusted) => {
                let trusted = &self.azure_trusted;

                if trusted.account_name.is_empty() {
                    return Err(RelayError::MissingConfig("azureTrusted.accountName"));
                }
                if trusted.certificate_profile.is_empty() {
                    return Err(RelayError::MissingConfig("azureTrusted.certificateProfile"));
                }

                let credential = credential(
                    &trusted.tenant_id,
                    &trusted.client_id,
                    &trusted.client_secret,
                    trusted.access_token.as_deref(),
                )?;

                let client = match &trusted.endpoint {
                    Some(endpoint) => TrustedSigningClient::with_endpoint(
                        endpoint,
                        &trusted.account_name,
                        &trusted.certificate_profile,
                        credential,
                    )?,
                    None if !trusted.region.is_empty() => TrustedSigningClient::new(
                        &trusted.region,
                        &trusted.account_name,
                        &trusted.certificate_profile,
                        credential,
                    )?,
                    None => return Err(RelayError::MissingConfig("azureTrusted.region")),
                };

                Ok(ConfiguredKey::Trusted(TrustedSigningKey::new(client)))
            }
            Some(TokenType::Certificate) => {
                Ok(ConfiguredKey::Local(self.certificate.load_key()?))
            }
            None => Err(RelayError::MissingConfig("tokenType")),
        }
    }
}

fn credential(
    tenant_id: &str,
    client_id: &str,
    client_secret: &str,
    access_token: Option<&str>,
) -> RelayResult<Box<dyn TokenCredential>> {
    if let Some(token) = access_token {
        if !client_secret.is_empty() {
            warn!("access token configured; ignoring client secret");
        }

        return Ok(Box::new(StaticTokenCredential::new(token)));
    }

    if tenant_id.is_empty() {
        return Err(RelayError::MissingConfig("tenantId"));
    }
    if client_id.is_empty() {
        return Err(RelayError::MissingConfig("clientId"));
    }

    Ok(Box::new(ClientSecretCredential::new(
        tenant_id,
        client_id,
        client_secret,
    )?))
}

/// `~/.sigrelay/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".sigrelay").join("config.yaml"))
}

/// Derive an output path by appending `-signed` to the file stem.
///
/// `dir/app.exe` becomes `dir/app-signed.exe`.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let name = match input.extension() {
        Some(ext) => format!("{}-signed.{}", stem, ext.to_string_lossy()),
        None => format!("{}-signed", stem),
    };

    input.with_file_name(name)
}
