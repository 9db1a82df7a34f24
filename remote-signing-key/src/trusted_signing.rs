// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Azure Trusted Signing certificate profiles.

use {
    crate::{
        http::{check_response, default_client},
        parse_certificate_chain, HashAlgorithm, KeyKind, PublicKeyInfo, RemoteKeyError,
        RemoteKeyResult, RemoteSigningKey, SignOptions, SignaturePadding, TokenCredential,
    },
    log::{debug, info},
    once_cell::sync::OnceCell,
    reqwest::blocking::Client,
    serde::{Deserialize, Serialize},
    std::{fmt::Display, time::Duration},
    x509_certificate::CapturedX509Certificate,
};

pub const TRUSTED_SIGNING_API_VERSION: &str = "2022-06-15-preview";

/// OAuth2 scope of Trusted Signing operations.
pub const TRUSTED_SIGNING_SCOPE: &str = "https://codesigning.azure.net/.default";

/// Default delay between polls of a pending signing operation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// State of a signing operation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub enum OperationStatus {
    InProgress,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    NotFound,
    #[serde(other)]
    Unknown,
}

impl OperationStatus {
    /// Whether the operation will not change state anymore.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress | Self::Running)
    }
}

impl Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A signing operation as reported by the service.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOperation {
    pub operation_id: String,
    pub status: OperationStatus,
    /// Base64 signature, once succeeded.
    #[serde(default)]
    pub signature: Option<String>,
    /// Base64 signing certificate, once succeeded.
    #[serde(default)]
    pub signing_certificate: Option<String>,
}

/// The Trusted Signing operations a [TrustedSigningKey] needs.
pub trait TrustedSigningApi {
    /// Submit a digest for signing.
    fn submit(&self, algorithm: &str, digest: &[u8]) -> RemoteKeyResult<SignOperation>;

    /// Fetch the current state of a signing operation.
    fn operation(&self, operation_id: &str) -> RemoteKeyResult<SignOperation>;

    /// Fetch the certificate chain of the certificate profile.
    fn certificate_chain(&self) -> RemoteKeyResult<Vec<u8>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    signature_algorithm: &'a str,
    digest: String,
}

/// Trusted Signing REST client bound to a certificate profile.
pub struct TrustedSigningClient {
    client: Client,
    sign_url: String,
    credential: Box<dyn TokenCredential>,
}

impl TrustedSigningClient {
    /// Construct an instance for a region like `eus`.
    pub fn new(
        region: &str,
        account: &str,
        profile: &str,
        credential: Box<dyn TokenCredential>,
    ) -> RemoteKeyResult<Self> {
        Self::with_endpoint(
            &format!("https://{}.codesigning.azure.net", region),
            account,
            profile,
            credential,
        )
    }

    /// Construct an instance against an explicit service endpoint.
    pub fn with_endpoint(
        endpoint: &str,
        account: &str,
        profile: &str,
        credential: Box<dyn TokenCredential>,
    ) -> RemoteKeyResult<Self> {
        Ok(Self {
            client: default_client()?,
            sign_url: format!(
                "{}/codesigningaccounts/{}/certificateprofiles/{}/sign",
                endpoint.trim_end_matches('/'),
                account,
                profile
            ),
            credential,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}{}?api-version={}",
            self.sign_url, suffix, TRUSTED_SIGNING_API_VERSION
        )
    }
}

impl TrustedSigningApi for TrustedSigningClient {
    fn submit(&self, algorithm: &str, digest: &[u8]) -> RemoteKeyResult<SignOperation> {
        let token = self.credential.token(TRUSTED_SIGNING_SCOPE)?;

        let response = self
            .client
            .post(self.url(""))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(&SignRequest {
                signature_algorithm: algorithm,
                digest: base64::encode(digest),
            })
            .send()?;

        Ok(check_response(response, "Trusted Signing sign")?.json::<SignOperation>()?)
    }

    fn operation(&self, operation_id: &str) -> RemoteKeyResult<SignOperation> {
        let token = self.credential.token(TRUSTED_SIGNING_SCOPE)?;

        let response = self
            .client
            .get(self.url(&format!("/{}", operation_id)))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()?;

        Ok(check_response(response, "Trusted Signing operation status")?.json::<SignOperation>()?)
    }

    fn certificate_chain(&self) -> RemoteKeyResult<Vec<u8>> {
        let token = self.credential.token(TRUSTED_SIGNING_SCOPE)?;

        let response = self
            .client
            .get(self.url("/certchain"))
            .bearer_auth(token)
            .header("Accept", "application/pkcs7-mime")
            .send()?;

        Ok(check_response(response, "Trusted Signing certificate chain")?
            .bytes()?
            .to_vec())
    }
}

/// Digest size suffix of service algorithm names.
///
/// The name derives from the canonical hash name without separators, so
/// `SHA-256` becomes `256`.
fn algorithm_bits(hash: HashAlgorithm) -> RemoteKeyResult<&'static str> {
    match hash.name().replace('-', "").as_str() {
        "SHA256" => Ok("256"),
        "SHA384" => Ok("384"),
        "SHA512" => Ok("512"),
        _ => Err(RemoteKeyError::UnsupportedHash(hash)),
    }
}

/// Service algorithm name for a key and signing parameters, like `RS256`.
fn signature_algorithm(key: &KeyKind, options: &SignOptions) -> RemoteKeyResult<String> {
    let bits = algorithm_bits(options.hash)?;

    let family = match (key, options.padding) {
        (KeyKind::Rsa { .. }, SignaturePadding::Pkcs1v15) => "RS",
        (KeyKind::Rsa { .. }, SignaturePadding::Pss) => "PS",
        (KeyKind::Ec { .. }, _) => "ES",
    };

    Ok(format!("{}{}", family, bits))
}

/// A certificate profile in Azure Trusted Signing.
pub struct TrustedSigningKey<A: TrustedSigningApi> {
    api: A,
    poll_interval: Duration,
    chain: OnceCell<Vec<CapturedX509Certificate>>,
}

impl<A: TrustedSigningApi> TrustedSigningKey<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            poll_interval: DEFAULT_POLL_INTERVAL,
            chain: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn leaf(&self) -> RemoteKeyResult<&CapturedX509Certificate> {
        self.certificate_chain()?
            .first()
            .ok_or(RemoteKeyError::NoCertificates)
    }

    /// Poll an operation until it reaches a terminal state.
    fn wait(&self, mut operation: SignOperation) -> RemoteKeyResult<SignOperation> {
        let mut polls = 0;

        while !operation.status.is_terminal() {
            std::thread::sleep(self.poll_interval);
            operation = self.api.operation(&operation.operation_id)?;
            polls += 1;
        }

        debug!(
            "signing operation {} reached {} after {} polls",
            operation.operation_id, operation.status, polls
        );

        Ok(operation)
    }
}

impl<A: TrustedSigningApi> RemoteSigningKey for TrustedSigningKey<A> {
    fn key_id(&self) -> RemoteKeyResult<String> {
        Ok(hex::encode(self.leaf()?.serial_number_asn1().as_slice()))
    }

    fn public_key(&self) -> RemoteKeyResult<PublicKeyInfo> {
        PublicKeyInfo::from_certificate(self.leaf()?)
    }

    fn certificate_chain(&self) -> RemoteKeyResult<&[CapturedX509Certificate]> {
        self.chain
            .get_or_try_init(|| {
                let data = self.api.certificate_chain()?;
                let chain = parse_certificate_chain(&data)?;
                info!("certificate profile has a chain of {}", chain.len());

                Ok(chain)
            })
            .map(|chain| chain.as_slice())
    }

    fn sign(&self, digest: &[u8], options: &SignOptions) -> RemoteKeyResult<Vec<u8>> {
        // Reject unsupported digests before fetching the chain.
        algorithm_bits(options.hash)?;
        let algorithm = signature_algorithm(&self.public_key()?.kind, options)?;

        let operation = self.api.submit(&algorithm, digest)?;
        debug!(
            "submitted {} signing operation {}",
            algorithm, operation.operation_id
        );

        let operation = self.wait(operation)?;

        match operation.status {
            OperationStatus::Succeeded => {
                let signature = operation
                    .signature
                    .ok_or_else(|| RemoteKeyError::MissingSignature(operation.operation_id))?;

                Ok(base64::decode(signature)?)
            }
            status => Err(RemoteKeyError::OperationFailed {
                operation_id: operation.operation_id,
                status,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::testutil::*,
        std::{cell::RefCell, collections::VecDeque},
    };

    struct MockService {
        states: RefCell<VecDeque<OperationStatus>>,
        calls: RefCell<Vec<String>>,
        chain: Vec<u8>,
    }

    impl MockService {
        fn new(states: &[OperationStatus]) -> Self {
            Self {
                states: RefCell::new(states.iter().copied().collect()),
                calls: RefCell::new(vec![]),
                chain: CHAIN_P7B.to_vec(),
            }
        }

        fn next(&self) -> SignOperation {
            let status = self
                .states
                .borrow_mut()
                .pop_front()
                .unwrap_or(OperationStatus::Unknown);

            SignOperation {
                operation_id: "op-1".into(),
                status,
                signature: if status == OperationStatus::Succeeded {
                    Some(base64::encode(b"signature"))
                } else {
                    None
                },
                signing_certificate: None,
            }
        }
    }

    impl TrustedSigningApi for MockService {
        fn submit(&self, algorithm: &str, digest: &[u8]) -> RemoteKeyResult<SignOperation> {
            self.calls
                .borrow_mut()
                .push(format!("submit {} {}", algorithm, digest.len()));
            Ok(self.next())
        }

        fn operation(&self, operation_id: &str) -> RemoteKeyResult<SignOperation> {
            self.calls
                .borrow_mut()
                .push(format!("poll {}", operation_id));
            Ok(self.next())
        }

        fn certificate_chain(&self) -> RemoteKeyResult<Vec<u8>> {
            self.calls.borrow_mut().push("certchain".into());
            Ok(self.chain.clone())
        }
    }

    fn key(states: &[OperationStatus]) -> TrustedSigningKey<MockService> {
        TrustedSigningKey::new(MockService::new(states)).with_poll_interval(Duration::ZERO)
    }

    fn ec_key(states: &[OperationStatus]) -> TrustedSigningKey<MockService> {
        let mut service = MockService::new(states);
        service.chain = EC_PEM.to_vec();

        TrustedSigningKey::new(service).with_poll_interval(Duration::ZERO)
    }

    #[test]
    fn polls_until_done() -> RemoteKeyResult<()> {
        let key = key(&[
            OperationStatus::InProgress,
            OperationStatus::Running,
            OperationStatus::Succeeded,
        ]);

        let signature = key.sign(&[0; 32], &SignOptions::new(HashAlgorithm::Sha256))?;
        assert_eq!(signature, b"signature");
        assert_eq!(
            *key.api.calls.borrow(),
            vec!["certchain", "submit RS256 32", "poll op-1", "poll op-1"]
        );

        Ok(())
    }

    #[test]
    fn immediate_success() -> RemoteKeyResult<()> {
        let key = key(&[OperationStatus::Succeeded]);

        key.sign(&[0; 64], &SignOptions::new(HashAlgorithm::Sha512))?;
        assert_eq!(
            *key.api.calls.borrow(),
            vec!["certchain", "submit RS512 64"]
        );

        Ok(())
    }

    #[test]
    fn failed_operation() {
        let key = key(&[OperationStatus::InProgress, OperationStatus::Failed]);

        let err = key
            .sign(&[0; 48], &SignOptions::pss(HashAlgorithm::Sha384))
            .unwrap_err();
        assert!(matches!(
            err,
            RemoteKeyError::OperationFailed {
                status: OperationStatus::Failed,
                ..
            }
        ));
        assert!(!err.is_negotiation());
        assert_eq!(key.api.calls.borrow()[1], "submit PS384 48");
    }

    #[test]
    fn unsupported_hash() {
        let key = key(&[]);

        let err = key
            .sign(&[0; 20], &SignOptions::new(HashAlgorithm::Sha1))
            .unwrap_err();
        assert!(err.is_negotiation());
        assert!(key.api.calls.borrow().is_empty());
    }

    #[test]
    fn ec_certificate_algorithm() -> RemoteKeyResult<()> {
        let key = ec_key(&[OperationStatus::Succeeded]);
        key.sign(&[0; 32], &SignOptions::new(HashAlgorithm::Sha256))?;

        let key = ec_key(&[OperationStatus::Succeeded]);
        key.sign(&[0; 48], &SignOptions::pss(HashAlgorithm::Sha384))?;

        assert_eq!(
            *key.api.calls.borrow(),
            vec!["certchain", "submit ES384 48"]
        );
        assert!(key.public_key()?.is_ec());

        Ok(())
    }

    #[test]
    fn chain_and_key() -> RemoteKeyResult<()> {
        let key = key(&[]);

        assert_eq!(key.certificate_chain()?, &[leaf(), ca()][..]);
        assert_eq!(key.key_id()?, LEAF_SERIAL);
        assert_eq!(
            key.public_key()?.kind,
            KeyKind::Rsa { modulus_bits: 2048 }
        );
        assert_eq!(*key.api.calls.borrow(), vec!["certchain"]);

        Ok(())
    }

    #[test]
    fn operation_from_json() -> RemoteKeyResult<()> {
        let operation: SignOperation = serde_json::from_str(
            r#"{"operationId": "abc", "status": "Succeeded", "signature": "c2ln", "signingCertificate": "Y2VydA=="}"#,
        )?;
        assert_eq!(operation.status, OperationStatus::Succeeded);
        assert_eq!(operation.signature.as_deref(), Some("c2ln"));

        let operation: SignOperation =
            serde_json::from_str(r#"{"operationId": "abc", "status": "Cancelled"}"#)?;
        assert_eq!(operation.status, OperationStatus::Unknown);
        assert!(operation.status.is_terminal());

        Ok(())
    }
}
