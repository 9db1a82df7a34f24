// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keys held in local files.

use {
    crate::{
        parse_certificate_chain, HashAlgorithm, PublicKeyInfo, RemoteKeyError, RemoteKeyResult,
        RemoteSigningKey, SignOptions, SignaturePadding,
    },
    log::{debug, warn},
    pkcs8::{der::Document, EncryptedPrivateKeyInfo},
    rand::rngs::OsRng,
    rsa::{
        pkcs1::DecodeRsaPrivateKey,
        pkcs8::{DecodePrivateKey, EncodePrivateKey},
        Hash, PaddingScheme, RsaPrivateKey,
    },
    x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, KeyAlgorithm, Sign},
};

/// Decode a private key into PKCS#8 DER.
///
/// Accepts PEM `PRIVATE KEY`, `ENCRYPTED PRIVATE KEY` and `RSA PRIVATE KEY`
/// blocks, or bare PKCS#8 DER (encrypted when a passphrase is given).
pub fn private_key_pkcs8(data: &[u8], passphrase: Option<&str>) -> RemoteKeyResult<Vec<u8>> {
    if !data.windows(11).any(|window| window == b"-----BEGIN ") {
        return match passphrase {
            Some(passphrase) => decrypt_pkcs8(data, passphrase),
            None => Ok(data.to_vec()),
        };
    }

    let block = pem::parse_many(data)?
        .into_iter()
        .find(|block| block.tag.ends_with("PRIVATE KEY"))
        .ok_or_else(|| RemoteKeyError::MalformedKey("no PEM private key block".into()))?;

    match block.tag.as_str() {
        "PRIVATE KEY" => Ok(block.contents),
        "ENCRYPTED PRIVATE KEY" => {
            let passphrase = passphrase.ok_or_else(|| {
                RemoteKeyError::MalformedKey("private key is encrypted; passphrase required".into())
            })?;

            decrypt_pkcs8(&block.contents, passphrase)
        }
        "RSA PRIVATE KEY" => {
            let key = RsaPrivateKey::from_pkcs1_der(&block.contents)
                .map_err(|e| RemoteKeyError::MalformedKey(e.to_string()))?;
            let document = key
                .to_pkcs8_der()
                .map_err(|e| RemoteKeyError::MalformedKey(e.to_string()))?;

            Ok(document.as_der().to_vec())
        }
        tag => Err(RemoteKeyError::UnsupportedKeyType(tag.to_string())),
    }
}

fn decrypt_pkcs8(der: &[u8], passphrase: &str) -> RemoteKeyResult<Vec<u8>> {
    let info = EncryptedPrivateKeyInfo::try_from(der)
        .map_err(|e| RemoteKeyError::MalformedKey(e.to_string()))?;
    let document = info
        .decrypt(passphrase)
        .map_err(|e| RemoteKeyError::MalformedKey(format!("unable to decrypt: {}", e)))?;

    Ok(document.as_der().to_vec())
}

fn rsa_hash(hash: HashAlgorithm) -> Hash {
    match hash {
        HashAlgorithm::Sha1 => Hash::SHA1,
        HashAlgorithm::Sha256 => Hash::SHA2_256,
        HashAlgorithm::Sha384 => Hash::SHA2_384,
        HashAlgorithm::Sha512 => Hash::SHA2_512,
    }
}

/// A certificate chain and its private key, loaded from local data.
///
/// The key pair must belong to the leaf certificate. Only RSA keys can sign
/// precomputed digests.
pub struct LocalKey {
    chain: Vec<CapturedX509Certificate>,
    key_pair: InMemorySigningKeyPair,
    rsa: Option<RsaPrivateKey>,
}

impl LocalKey {
    /// Construct from a parsed chain, leaf first, and a PKCS#8 DER key.
    pub fn new(chain: Vec<CapturedX509Certificate>, pkcs8_der: &[u8]) -> RemoteKeyResult<Self> {
        let leaf = chain.first().ok_or(RemoteKeyError::NoCertificates)?;
        let key_pair = InMemorySigningKeyPair::from_pkcs8_der(pkcs8_der)?;

        if key_pair.public_key_data().as_ref() != leaf.public_key_data().as_ref() {
            return Err(RemoteKeyError::KeyMismatch);
        }

        let rsa = match key_pair.key_algorithm() {
            Some(KeyAlgorithm::Rsa) => Some(
                RsaPrivateKey::from_pkcs8_der(pkcs8_der)
                    .map_err(|e| RemoteKeyError::MalformedKey(e.to_string()))?,
            ),
            algorithm => {
                warn!(
                    "{:?} keys cannot sign digests locally; only the certificate chain is usable",
                    algorithm
                );
                None
            }
        };

        Ok(Self {
            chain,
            key_pair,
            rsa,
        })
    }

    /// Construct from certificate and private key data, each PEM or DER.
    pub fn from_pem_or_der(
        certificates: &[u8],
        private_key: &[u8],
        passphrase: Option<&str>,
    ) -> RemoteKeyResult<Self> {
        let chain = parse_certificate_chain(certificates)?;
        let der = private_key_pkcs8(private_key, passphrase)?;

        Self::new(chain, &der)
    }

    fn leaf(&self) -> &CapturedX509Certificate {
        // Construction requires a leaf.
        &self.chain[0]
    }
}

impl RemoteSigningKey for LocalKey {
    fn key_id(&self) -> RemoteKeyResult<String> {
        Ok(hex::encode(self.leaf().serial_number_asn1().as_slice()))
    }

    fn public_key(&self) -> RemoteKeyResult<PublicKeyInfo> {
        PublicKeyInfo::from_certificate(self.leaf())
    }

    fn certificate_chain(&self) -> RemoteKeyResult<&[CapturedX509Certificate]> {
        Ok(&self.chain)
    }

    fn sign(&self, digest: &[u8], options: &SignOptions) -> RemoteKeyResult<Vec<u8>> {
        let key = self.rsa.as_ref().ok_or_else(|| {
            RemoteKeyError::UnsupportedKeyType(format!("{:?}", self.key_pair.key_algorithm()))
        })?;

        if digest.len() != options.hash.digest_len() {
            return Err(RemoteKeyError::DigestLength {
                hash: options.hash,
                actual: digest.len(),
            });
        }

        let salt = options.hash.digest_len();
        let padding = match (options.padding, options.hash) {
            (SignaturePadding::Pkcs1v15, hash) => {
                PaddingScheme::new_pkcs1v15_sign(Some(rsa_hash(hash)))
            }
            (SignaturePadding::Pss, HashAlgorithm::Sha256) => {
                PaddingScheme::new_pss_with_salt::<sha2::Sha256, _>(OsRng, salt)
            }
            (SignaturePadding::Pss, HashAlgorithm::Sha384) => {
                PaddingScheme::new_pss_with_salt::<sha2::Sha384, _>(OsRng, salt)
            }
            (SignaturePadding::Pss, HashAlgorithm::Sha512) => {
                PaddingScheme::new_pss_with_salt::<sha2::Sha512, _>(OsRng, salt)
            }
            (SignaturePadding::Pss, hash) => return Err(RemoteKeyError::UnsupportedHash(hash)),
        };

        debug!("signing {} digest with local key", options.hash);

        key.sign(padding, digest)
            .map_err(|e| RemoteKeyError::MalformedSignature(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{testutil::*, KeyKind},
        ring::signature::{
            UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
            RSA_PSS_2048_8192_SHA384,
        },
        sha2::Digest,
    };

    const MESSAGE: &[u8] = b"payload digest input";

    fn local_key() -> LocalKey {
        LocalKey::from_pem_or_der(LOCAL_PEM, LOCAL_KEY_PEM, None).unwrap()
    }

    fn verify(
        key: &LocalKey,
        algorithm: &'static dyn ring::signature::VerificationAlgorithm,
        signature: &[u8],
    ) -> bool {
        let leaf = &key.certificate_chain().unwrap()[0];

        UnparsedPublicKey::new(algorithm, leaf.public_key_data())
            .verify(MESSAGE, signature)
            .is_ok()
    }

    #[test]
    fn pkcs1_sign_verify() -> RemoteKeyResult<()> {
        let key = local_key();

        let digest = sha2::Sha256::digest(MESSAGE);
        let signature = key.sign(&digest, &SignOptions::new(HashAlgorithm::Sha256))?;
        assert_eq!(signature.len(), 256);
        assert!(verify(&key, &RSA_PKCS1_2048_8192_SHA256, &signature));
        assert!(!verify(&key, &RSA_PKCS1_2048_8192_SHA512, &signature));

        let digest = sha2::Sha512::digest(MESSAGE);
        let signature = key.sign(&digest, &SignOptions::new(HashAlgorithm::Sha512))?;
        assert!(verify(&key, &RSA_PKCS1_2048_8192_SHA512, &signature));

        Ok(())
    }

    #[test]
    fn pss_sign_verify() -> RemoteKeyResult<()> {
        let key = local_key();

        let digest = sha2::Sha384::digest(MESSAGE);
        let signature = key.sign(&digest, &SignOptions::pss(HashAlgorithm::Sha384))?;
        assert!(verify(&key, &RSA_PSS_2048_8192_SHA384, &signature));

        assert!(matches!(
            key.sign(&[0; 20], &SignOptions::pss(HashAlgorithm::Sha1)),
            Err(RemoteKeyError::UnsupportedHash(HashAlgorithm::Sha1))
        ));

        Ok(())
    }

    #[test]
    fn digest_length_checked() {
        assert!(matches!(
            local_key().sign(&[0; 20], &SignOptions::new(HashAlgorithm::Sha256)),
            Err(RemoteKeyError::DigestLength {
                hash: HashAlgorithm::Sha256,
                actual: 20
            })
        ));
    }

    #[test]
    fn key_encodings() -> RemoteKeyResult<()> {
        let expected = private_key_pkcs8(LOCAL_KEY_PEM, None)?;

        assert_eq!(
            private_key_pkcs8(LOCAL_KEY_ENCRYPTED_PEM, Some(LOCAL_PASSPHRASE))?,
            expected
        );
        assert_eq!(private_key_pkcs8(&expected, None)?, expected);

        let key = LocalKey::from_pem_or_der(LOCAL_PEM, LOCAL_RSA_PEM, None)?;
        let digest = sha2::Sha256::digest(MESSAGE);
        let signature = key.sign(&digest, &SignOptions::new(HashAlgorithm::Sha256))?;
        assert!(verify(&key, &RSA_PKCS1_2048_8192_SHA256, &signature));

        assert!(matches!(
            private_key_pkcs8(LOCAL_KEY_ENCRYPTED_PEM, None),
            Err(RemoteKeyError::MalformedKey(_))
        ));
        assert!(matches!(
            private_key_pkcs8(LOCAL_KEY_ENCRYPTED_PEM, Some("wrong")),
            Err(RemoteKeyError::MalformedKey(_))
        ));
        assert!(matches!(
            private_key_pkcs8(LOCAL_PEM, None),
            Err(RemoteKeyError::MalformedKey(_))
        ));

        Ok(())
    }

    #[test]
    fn chain_and_key_id() -> RemoteKeyResult<()> {
        let key = LocalKey::from_pem_or_der(
            &[LOCAL_PEM, CA_PEM].concat(),
            LOCAL_KEY_PEM,
            None,
        )?;

        assert_eq!(key.certificate_chain()?.len(), 2);
        assert_eq!(key.key_id()?, LOCAL_SERIAL);
        assert_eq!(
            key.public_key()?.kind,
            KeyKind::Rsa { modulus_bits: 2048 }
        );

        Ok(())
    }

    #[test]
    fn mismatched_certificate() {
        assert!(matches!(
            LocalKey::from_pem_or_der(LEAF_PEM, LOCAL_KEY_PEM, None),
            Err(RemoteKeyError::KeyMismatch)
        ));
        assert!(matches!(
            LocalKey::new(vec![], &private_key_pkcs8(LOCAL_KEY_PEM, None).unwrap()),
            Err(RemoteKeyError::NoCertificates)
        ));
    }
}
