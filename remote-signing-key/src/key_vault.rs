// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Azure Key Vault keys.

use {
    crate::{
        ecdsa,
        http::{check_response, decode_base64url, default_client, encode_base64url},
        parse_certificate_chain, HashAlgorithm, KeyKind, PublicKeyInfo, RemoteKeyError,
        RemoteKeyResult, RemoteSigningKey, SignOptions, SignaturePadding, TokenCredential,
    },
    log::{debug, info},
    once_cell::sync::OnceCell,
    reqwest::blocking::Client,
    serde::{Deserialize, Serialize},
    x509_certificate::CapturedX509Certificate,
};

pub const KEY_VAULT_API_VERSION: &str = "7.4";

/// OAuth2 scope of Key Vault data plane operations.
pub const KEY_VAULT_SCOPE: &str = "https://vault.azure.net/.default";

/// Public key as returned by Key Vault.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct JsonWebKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl JsonWebKey {
    /// The key type without the `-HSM` suffix of HSM backed keys.
    pub fn key_type(&self) -> &str {
        self.kty.trim_end_matches("-HSM")
    }

    pub fn public_key(&self) -> RemoteKeyResult<PublicKeyInfo> {
        let field = |value: &Option<String>, name: &str| -> RemoteKeyResult<Vec<u8>> {
            decode_base64url(value.as_deref().ok_or_else(|| {
                RemoteKeyError::MalformedKey(format!("{} key lacks {}", self.kty, name))
            })?)
        };

        match self.key_type() {
            "RSA" => Ok(PublicKeyInfo::rsa(&field(&self.n, "n")?, &field(&self.e, "e")?)),
            "EC" => {
                let curve = self.crv.as_deref().ok_or_else(|| {
                    RemoteKeyError::MalformedKey(format!("{} key lacks crv", self.kty))
                })?;

                Ok(PublicKeyInfo::ec(
                    curve,
                    &field(&self.x, "x")?,
                    &field(&self.y, "y")?,
                ))
            }
            _ => Err(RemoteKeyError::UnsupportedKeyType(self.kty.clone())),
        }
    }
}

/// The Key Vault operations a [VaultKey] needs.
pub trait KeyVaultApi {
    /// Fetch the `cer` of a certificate.
    fn get_certificate(&self, name: &str, version: &str) -> RemoteKeyResult<Vec<u8>>;

    /// Fetch the public half of a key.
    fn get_key(&self, name: &str, version: &str) -> RemoteKeyResult<JsonWebKey>;

    /// Sign a digest with a JWS algorithm like `RS256`.
    fn sign(
        &self,
        name: &str,
        version: &str,
        algorithm: &str,
        digest: &[u8],
    ) -> RemoteKeyResult<Vec<u8>>;
}

#[derive(Deserialize)]
struct CertificateResponse {
    cer: String,
}

#[derive(Deserialize)]
struct KeyResponse {
    key: JsonWebKey,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    alg: &'a str,
    value: String,
}

#[derive(Deserialize)]
struct SignResponse {
    value: String,
}

/// Key Vault REST client.
pub struct KeyVaultClient {
    client: Client,
    vault_url: String,
    credential: Box<dyn TokenCredential>,
}

impl KeyVaultClient {
    /// Construct an instance for a vault URL like `https://example.vault.azure.net`.
    pub fn new(
        vault_url: impl ToString,
        credential: Box<dyn TokenCredential>,
    ) -> RemoteKeyResult<Self> {
        Ok(Self {
            client: default_client()?,
            vault_url: vault_url.to_string().trim_end_matches('/').to_string(),
            credential,
        })
    }

    fn url(&self, collection: &str, name: &str, version: &str, suffix: &str) -> String {
        let mut url = format!("{}/{}/{}", self.vault_url, collection, name);
        if !version.is_empty() {
            url.push('/');
            url.push_str(version);
        }
        url.push_str(suffix);
        url.push_str("?api-version=");
        url.push_str(KEY_VAULT_API_VERSION);

        url
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        operation: &str,
    ) -> RemoteKeyResult<T> {
        let token = self.credential.token(KEY_VAULT_SCOPE)?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()?;

        Ok(check_response(response, operation)?.json::<T>()?)
    }
}

impl KeyVaultApi for KeyVaultClient {
    fn get_certificate(&self, name: &str, version: &str) -> RemoteKeyResult<Vec<u8>> {
        let response: CertificateResponse = self.get(
            self.url("certificates", name, version, ""),
            "Key Vault get certificate",
        )?;

        Ok(base64::decode(response.cer)?)
    }

    fn get_key(&self, name: &str, version: &str) -> RemoteKeyResult<JsonWebKey> {
        let response: KeyResponse =
            self.get(self.url("keys", name, version, ""), "Key Vault get key")?;

        Ok(response.key)
    }

    fn sign(
        &self,
        name: &str,
        version: &str,
        algorithm: &str,
        digest: &[u8],
    ) -> RemoteKeyResult<Vec<u8>> {
        let token = self.credential.token(KEY_VAULT_SCOPE)?;

        let response = self
            .client
            .post(self.url("keys", name, version, "/sign"))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(&SignRequest {
                alg: algorithm,
                value: encode_base64url(digest),
            })
            .send()?;

        let response = check_response(response, "Key Vault sign")?.json::<SignResponse>()?;

        decode_base64url(&response.value)
    }
}

/// JWS algorithm name for a key and signing parameters.
fn signature_algorithm(key: &PublicKeyInfo, options: &SignOptions) -> RemoteKeyResult<String> {
    let bits = match options.hash {
        HashAlgorithm::Sha256 | HashAlgorithm::Sha384 | HashAlgorithm::Sha512 => {
            options.hash.digest_bits()
        }
        hash => return Err(RemoteKeyError::UnsupportedHash(hash)),
    };

    let family = match (&key.kind, options.padding) {
        (KeyKind::Rsa { .. }, SignaturePadding::Pkcs1v15) => "RS",
        (KeyKind::Rsa { .. }, SignaturePadding::Pss) => "PS",
        (KeyKind::Ec { .. }, _) => "ES",
    };

    Ok(format!("{}{}", family, bits))
}

/// A key and certificate stored in Azure Key Vault.
///
/// The certificate and its key share a name and version. Both are fetched on
/// first use.
pub struct VaultKey<A: KeyVaultApi> {
    api: A,
    name: String,
    version: String,
    key: OnceCell<PublicKeyInfo>,
    chain: OnceCell<Vec<CapturedX509Certificate>>,
}

impl<A: KeyVaultApi> VaultKey<A> {
    /// Construct an instance. An empty `version` means the latest version.
    pub fn new(api: A, name: impl ToString, version: impl ToString) -> Self {
        Self {
            api,
            name: name.to_string(),
            version: version.to_string(),
            key: OnceCell::new(),
            chain: OnceCell::new(),
        }
    }

    fn key(&self) -> RemoteKeyResult<&PublicKeyInfo> {
        self.key.get_or_try_init(|| {
            let jwk = self.api.get_key(&self.name, &self.version)?;
            let key = jwk.public_key()?;
            info!("vault key {} is {}", self.name, key.kind);

            Ok(key)
        })
    }
}

impl<A: KeyVaultApi> RemoteSigningKey for VaultKey<A> {
    fn key_id(&self) -> RemoteKeyResult<String> {
        Ok(format!("{}/{}", self.name, self.version))
    }

    fn public_key(&self) -> RemoteKeyResult<PublicKeyInfo> {
        self.key().cloned()
    }

    fn certificate_chain(&self) -> RemoteKeyResult<&[CapturedX509Certificate]> {
        self.chain
            .get_or_try_init(|| {
                let cer = self.api.get_certificate(&self.name, &self.version)?;
                parse_certificate_chain(&cer)
            })
            .map(|chain| chain.as_slice())
    }

    fn sign(&self, digest: &[u8], options: &SignOptions) -> RemoteKeyResult<Vec<u8>> {
        if options.hash == HashAlgorithm::Sha1 {
            return Err(RemoteKeyError::UnsupportedHash(options.hash));
        }

        let key = self.key()?;
        let algorithm = signature_algorithm(key, options)?;

        debug!(
            "signing {} byte digest with vault key {} using {}",
            digest.len(),
            self.name,
            algorithm
        );
        let signature = self
            .api
            .sign(&self.name, &self.version, &algorithm, digest)?;

        if key.is_ec() {
            ecdsa::fixed_to_der(&signature)
        } else {
            Ok(signature)
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::testutil::*, std::cell::RefCell};

    struct MockVault {
        key: JsonWebKey,
        cer: Vec<u8>,
        signature: Vec<u8>,
        calls: RefCell<Vec<String>>,
    }

    impl MockVault {
        fn new(key: JsonWebKey) -> Self {
            Self {
                key,
                cer: CHAIN_P7B.to_vec(),
                signature: vec![0x42; 256],
                calls: RefCell::new(vec![]),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl KeyVaultApi for MockVault {
        fn get_certificate(&self, name: &str, version: &str) -> RemoteKeyResult<Vec<u8>> {
            self.calls
                .borrow_mut()
                .push(format!("certificate {}/{}", name, version));
            Ok(self.cer.clone())
        }

        fn get_key(&self, name: &str, version: &str) -> RemoteKeyResult<JsonWebKey> {
            self.calls
                .borrow_mut()
                .push(format!("key {}/{}", name, version));
            Ok(self.key.clone())
        }

        fn sign(
            &self,
            _name: &str,
            _version: &str,
            algorithm: &str,
            digest: &[u8],
        ) -> RemoteKeyResult<Vec<u8>> {
            self.calls
                .borrow_mut()
                .push(format!("sign {} {}", algorithm, digest.len()));
            Ok(self.signature.clone())
        }
    }

    fn rsa_jwk(kty: &str) -> JsonWebKey {
        JsonWebKey {
            kty: kty.to_string(),
            n: Some(encode_base64url(&[0xb7; 256])),
            e: Some("AQAB".to_string()),
            ..Default::default()
        }
    }

    fn ec_jwk() -> JsonWebKey {
        JsonWebKey {
            kty: "EC-HSM".to_string(),
            crv: Some("P-256".to_string()),
            x: Some(encode_base64url(&[1; 32])),
            y: Some(encode_base64url(&[2; 32])),
            ..Default::default()
        }
    }

    #[test]
    fn rsa_signatures() -> RemoteKeyResult<()> {
        let key = VaultKey::new(MockVault::new(rsa_jwk("RSA-HSM")), "signer", "abc123");
        assert_eq!(key.key_id()?, "signer/abc123");
        assert_eq!(key.public_key()?.kind, KeyKind::Rsa { modulus_bits: 2048 });

        let signature = key.sign(&[0; 32], &SignOptions::new(HashAlgorithm::Sha256))?;
        assert_eq!(signature, vec![0x42; 256]);
        key.sign(&[0; 48], &SignOptions::pss(HashAlgorithm::Sha384))?;

        assert_eq!(
            key.api.calls(),
            vec!["key signer/abc123", "sign RS256 32", "sign PS384 48"]
        );

        Ok(())
    }

    #[test]
    fn ec_signature_is_der() -> RemoteKeyResult<()> {
        let mut vault = MockVault::new(ec_jwk());
        vault.signature = [[0x80u8; 32], [0x11u8; 32]].concat();
        let key = VaultKey::new(vault, "ec", "");

        assert!(key.public_key()?.is_ec());
        assert_eq!(key.public_key()?.data.len(), 65);

        let signature = key.sign(&[0; 64], &SignOptions::new(HashAlgorithm::Sha512))?;
        let (r, s) = ecdsa::der_to_integers(&signature)?;
        assert_eq!(r, vec![0x80; 32]);
        assert_eq!(s, vec![0x11; 32]);

        assert_eq!(key.api.calls(), vec!["key ec/", "sign ES512 64"]);

        Ok(())
    }

    #[test]
    fn unsupported_hash_needs_no_custodian() {
        let key = VaultKey::new(MockVault::new(rsa_jwk("RSA")), "signer", "1");

        let err = key
            .sign(&[0; 20], &SignOptions::new(HashAlgorithm::Sha1))
            .unwrap_err();
        assert!(err.is_negotiation());
        assert!(key.api.calls().is_empty());
    }

    #[test]
    fn unsupported_key_type() {
        let key = VaultKey::new(
            MockVault::new(JsonWebKey {
                kty: "oct-HSM".to_string(),
                ..Default::default()
            }),
            "secret",
            "1",
        );

        let err = key
            .sign(&[0; 32], &SignOptions::new(HashAlgorithm::Sha256))
            .unwrap_err();
        assert!(matches!(&err, RemoteKeyError::UnsupportedKeyType(kty) if kty == "oct-HSM"));
        assert!(err.is_negotiation());
        assert_eq!(key.api.calls(), vec!["key secret/1"]);
    }

    #[test]
    fn chain_is_cached() -> RemoteKeyResult<()> {
        let key = VaultKey::new(MockVault::new(rsa_jwk("RSA")), "signer", "1");

        assert_eq!(key.certificate_chain()?, &[leaf(), ca()][..]);
        assert_eq!(key.certificate_chain()?.len(), 2);
        assert_eq!(key.api.calls(), vec!["certificate signer/1"]);

        Ok(())
    }

    #[test]
    fn jwk_from_json() -> RemoteKeyResult<()> {
        let jwk: JsonWebKey = serde_json::from_str(
            r#"{"kid": "https://example.vault.azure.net/keys/signer/1", "kty": "RSA", "key_ops": ["sign"], "n": "tw", "e": "AQAB"}"#,
        )?;

        assert_eq!(jwk.key_type(), "RSA");
        assert_eq!(jwk.public_key()?.kind, KeyKind::Rsa { modulus_bits: 8 });

        let missing = JsonWebKey {
            kty: "EC".into(),
            ..Default::default()
        };
        assert!(matches!(
            missing.public_key(),
            Err(RemoteKeyError::MalformedKey(_))
        ));

        Ok(())
    }
}
