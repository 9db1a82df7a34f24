// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing keys held by remote custodians.

The private key never leaves the custodian. We send it a digest and a
negotiated algorithm name and get a signature back. Two custodians are
supported:

* Azure Key Vault, through [VaultKey]. The signing certificate and the key
  share a name and version in the vault.
* Azure Trusted Signing, through [TrustedSigningKey]. Signing is an
  asynchronous operation which we poll until it reaches a terminal state.

Both implement [RemoteSigningKey]. So does [LocalKey], a certificate chain
and private key loaded from local data. [ConfiguredKey] is the union of all
three as configured against the real services.

The HTTP protocol of each custodian sits behind a trait ([KeyVaultApi],
[TrustedSigningApi]) so key logic can be exercised without a network.
Authentication is a [TokenCredential].
*/

mod chain;
pub use chain::parse_certificate_chain;
mod credential;
pub use credential::{ClientSecretCredential, StaticTokenCredential, TokenCredential};
pub mod ecdsa;
mod http;
mod key_vault;
pub use key_vault::{JsonWebKey, KeyVaultApi, KeyVaultClient, VaultKey};
mod local;
pub use local::{private_key_pkcs8, LocalKey};
mod options;
pub use options::{HashAlgorithm, KeyKind, PublicKeyInfo, SignOptions, SignaturePadding};
mod trusted_signing;
pub use trusted_signing::{
    OperationStatus, SignOperation, TrustedSigningApi, TrustedSigningClient, TrustedSigningKey,
};

use {
    cryptographic_message_syntax::CmsError, thiserror::Error,
    x509_certificate::{CapturedX509Certificate, X509CertificateError},
};

#[derive(Debug, Error)]
pub enum RemoteKeyError {
    #[error("{0} digests are not supported by this key")]
    UnsupportedHash(HashAlgorithm),

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("custodian responded with HTTP {status}: {body}")]
    Custodian { status: u16, body: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("signing operation {operation_id} ended in state {status}")]
    OperationFailed {
        operation_id: String,
        status: OperationStatus,
    },

    #[error("signing operation {0} completed without a signature")]
    MissingSignature(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PEM error: {0}")]
    Pem(#[from] pem::PemError),

    #[error("X.509 certificate error: {0}")]
    X509(#[from] X509CertificateError),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("no certificates found in certificate data")]
    NoCertificates,

    #[error("malformed certificate data: {0}")]
    MalformedCertificates(&'static str),

    #[error("{hash} digests are {} bytes; got {actual}", .hash.digest_len())]
    DigestLength { hash: HashAlgorithm, actual: usize },

    #[error("private key does not belong to the leaf certificate")]
    KeyMismatch,

    #[error("malformed key: {0}")]
    MalformedKey(String),

    #[error("malformed signature: {0}")]
    MalformedSignature(String),
}

impl RemoteKeyError {
    /// Whether the error stems from an unsupported hash or key combination.
    ///
    /// These are detected before the custodian is asked to sign anything.
    pub fn is_negotiation(&self) -> bool {
        matches!(self, Self::UnsupportedHash(_) | Self::UnsupportedKeyType(_))
    }
}

/// Result type for this crate.
pub type RemoteKeyResult<T> = Result<T, RemoteKeyError>;

/// A signing key whose private half is held by a remote custodian.
pub trait RemoteSigningKey {
    /// A stable identifier for the key.
    fn key_id(&self) -> RemoteKeyResult<String>;

    /// The public half of the key.
    fn public_key(&self) -> RemoteKeyResult<PublicKeyInfo>;

    /// The certificate chain of the key, leaf first.
    ///
    /// Fetched on first use and cached for the lifetime of the key.
    fn certificate_chain(&self) -> RemoteKeyResult<&[CapturedX509Certificate]>;

    /// Sign a digest.
    ///
    /// `digest` is the output of [SignOptions::hash]. RSA signatures are raw
    /// signature bytes. ECDSA signatures are DER encoded `Ecdsa-Sig-Value`.
    fn sign(&self, digest: &[u8], options: &SignOptions) -> RemoteKeyResult<Vec<u8>>;
}

/// Signing keys as configured for a signing operation.
pub enum ConfiguredKey {
    Vault(VaultKey<KeyVaultClient>),
    Trusted(TrustedSigningKey<TrustedSigningClient>),
    Local(LocalKey),
}

impl ConfiguredKey {
    fn inner(&self) -> &dyn RemoteSigningKey {
        match self {
            Self::Vault(key) => key,
            Self::Trusted(key) => key,
            Self::Local(key) => key,
        }
    }
}

impl RemoteSigningKey for ConfiguredKey {
    fn key_id(&self) -> RemoteKeyResult<String> {
        self.inner().key_id()
    }

    fn public_key(&self) -> RemoteKeyResult<PublicKeyInfo> {
        self.inner().public_key()
    }

    fn certificate_chain(&self) -> RemoteKeyResult<&[CapturedX509Certificate]> {
        self.inner().certificate_chain()
    }

    fn sign(&self, digest: &[u8], options: &SignOptions) -> RemoteKeyResult<Vec<u8>> {
        self.inner().sign(digest, options)
    }
}

/// Everything a signer needs to produce signatures with a remote key.
pub struct CertificateBundle<'a> {
    /// The signing certificate.
    pub leaf: CapturedX509Certificate,

    /// The full chain, leaf first.
    pub chain: Vec<CapturedX509Certificate>,

    /// The key producing signatures for [Self::leaf].
    pub key: &'a dyn RemoteSigningKey,

    /// URL of an RFC 3161 time-stamp authority.
    pub timestamp_url: Option<String>,
}

impl<'a> CertificateBundle<'a> {
    /// Resolve the certificate chain of a key into a bundle.
    pub fn from_key(
        key: &'a dyn RemoteSigningKey,
        timestamp_url: Option<String>,
    ) -> RemoteKeyResult<Self> {
        let chain = key.certificate_chain()?.to_vec();
        let leaf = chain.first().cloned().ok_or(RemoteKeyError::NoCertificates)?;

        Ok(Self {
            leaf,
            chain,
            key,
            timestamp_url,
        })
    }

    /// Certificates other than the leaf.
    pub fn intermediates(&self) -> &[CapturedX509Certificate] {
        &self.chain[1..]
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub const LEAF_PEM: &[u8] = include_bytes!("testdata/leaf.pem");
    pub const LEAF_DER: &[u8] = include_bytes!("testdata/leaf.der");
    pub const CA_PEM: &[u8] = include_bytes!("testdata/ca.pem");
    pub const EC_PEM: &[u8] = include_bytes!("testdata/ec.pem");
    pub const CHAIN_PEM: &[u8] = include_bytes!("testdata/chain.pem");
    pub const CHAIN_DER: &[u8] = include_bytes!("testdata/chain.der");
    pub const CHAIN_P7B: &[u8] = include_bytes!("testdata/chain.p7b");
    pub const CHAIN_P7_PEM: &[u8] = include_bytes!("testdata/chain.p7.pem");
    pub const LOCAL_PEM: &[u8] = include_bytes!("testdata/local.pem");
    pub const LOCAL_KEY_PEM: &[u8] = include_bytes!("testdata/local.key.pem");
    pub const LOCAL_KEY_ENCRYPTED_PEM: &[u8] = include_bytes!("testdata/local.key.enc.pem");
    pub const LOCAL_RSA_PEM: &[u8] = include_bytes!("testdata/local.rsa.pem");

    /// Passphrase of [LOCAL_KEY_ENCRYPTED_PEM].
    pub const LOCAL_PASSPHRASE: &str = "correct-horse";
    /// Serial number of the local certificate.
    pub const LOCAL_SERIAL: &str = "518b953f6576347c5cffbc17716163e1d4bba119";

    /// Serial number of the leaf certificate.
    pub const LEAF_SERIAL: &str = "0b39b442d6df6c90be22147e2227320ed5af22b9";

    pub fn leaf() -> CapturedX509Certificate {
        CapturedX509Certificate::from_der(LEAF_DER.to_vec()).unwrap()
    }

    pub fn ca() -> CapturedX509Certificate {
        CapturedX509Certificate::from_pem(CA_PEM).unwrap()
    }
}

#[cfg(test)]
mod test {
    use {super::*, testutil::*};

    struct FixedKey(Vec<CapturedX509Certificate>);

    impl RemoteSigningKey for FixedKey {
        fn key_id(&self) -> RemoteKeyResult<String> {
            Ok("fixed".into())
        }

        fn public_key(&self) -> RemoteKeyResult<PublicKeyInfo> {
            Err(RemoteKeyError::UnsupportedKeyType("fixed".into()))
        }

        fn certificate_chain(&self) -> RemoteKeyResult<&[CapturedX509Certificate]> {
            Ok(&self.0)
        }

        fn sign(&self, _digest: &[u8], _options: &SignOptions) -> RemoteKeyResult<Vec<u8>> {
            Ok(vec![])
        }
    }

    #[test]
    fn bundle_from_key() -> RemoteKeyResult<()> {
        let key = FixedKey(vec![leaf(), ca()]);
        let bundle =
            CertificateBundle::from_key(&key, Some("http://timestamp.example".to_string()))?;

        assert_eq!(bundle.leaf, leaf());
        assert_eq!(bundle.chain.len(), 2);
        assert_eq!(bundle.intermediates(), &[ca()][..]);
        assert_eq!(
            bundle.timestamp_url.as_deref(),
            Some("http://timestamp.example")
        );

        assert!(matches!(
            CertificateBundle::from_key(&FixedKey(vec![]), None),
            Err(RemoteKeyError::NoCertificates)
        ));

        Ok(())
    }

    #[test]
    fn negotiation_errors() {
        assert!(RemoteKeyError::UnsupportedHash(HashAlgorithm::Sha1).is_negotiation());
        assert!(RemoteKeyError::UnsupportedKeyType("oct".into()).is_negotiation());
        assert!(!RemoteKeyError::NoCertificates.is_negotiation());
        assert!(!RemoteKeyError::Custodian {
            status: 401,
            body: String::new()
        }
        .is_negotiation());
    }
}
