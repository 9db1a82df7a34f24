// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{fmt::Display, str::FromStr};

/// Hash function a digest was computed with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Canonical name, like `SHA-256`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Size of digests in bits.
    pub fn digest_bits(&self) -> usize {
        match self {
            Self::Sha1 => 160,
            Self::Sha256 => 256,
            Self::Sha384 => 384,
            Self::Sha512 => 512,
        }
    }

    /// Size of digests in bytes.
    pub fn digest_len(&self) -> usize {
        self.digest_bits() / 8
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "").to_ascii_uppercase().as_str() {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA384" => Ok(Self::Sha384),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(format!("unknown hash algorithm: {}", s)),
        }
    }
}

/// RSA signature padding scheme.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignaturePadding {
    Pkcs1v15,
    Pss,
}

/// Parameters of a signing operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignOptions {
    pub hash: HashAlgorithm,
    pub padding: SignaturePadding,
}

impl SignOptions {
    pub fn new(hash: HashAlgorithm) -> Self {
        Self {
            hash,
            padding: SignaturePadding::Pkcs1v15,
        }
    }

    pub fn pss(hash: HashAlgorithm) -> Self {
        Self {
            hash,
            padding: SignaturePadding::Pss,
        }
    }
}

/// The kind of a public key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KeyKind {
    Rsa { modulus_bits: usize },
    Ec { curve: String },
}

impl Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa { modulus_bits } => write!(f, "RSA-{}", modulus_bits),
            Self::Ec { curve } => write!(f, "EC {}", curve),
        }
    }
}

/// The public half of a remote key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicKeyInfo {
    pub kind: KeyKind,

    /// DER `RSAPublicKey` for RSA keys, an uncompressed point for EC keys.
    pub data: Vec<u8>,
}

impl PublicKeyInfo {
    pub fn is_ec(&self) -> bool {
        matches!(self.kind, KeyKind::Ec { .. })
    }

    /// Interpret the subject public key of a certificate.
    pub fn from_certificate(
        cert: &x509_certificate::CapturedX509Certificate,
    ) -> crate::RemoteKeyResult<Self> {
        let data = cert.public_key_data().to_vec();

        // Uncompressed points are 0x04 followed by two coordinates.
        let curve = match (data.first(), data.len()) {
            (Some(0x04), 65) => Some("P-256"),
            (Some(0x04), 97) => Some("P-384"),
            (Some(0x04), 133) => Some("P-521"),
            _ => None,
        };

        let kind = if let Some(curve) = curve {
            KeyKind::Ec {
                curve: curve.to_string(),
            }
        } else {
            let modulus = rsa_modulus(&data)?;
            KeyKind::Rsa {
                modulus_bits: modulus_bits(&modulus),
            }
        };

        Ok(Self { kind, data })
    }

    /// Construct an RSA key from its modulus and public exponent.
    pub fn rsa(modulus: &[u8], exponent: &[u8]) -> Self {
        let data = yasna::construct_der(|writer| {
            writer.write_sequence(|writer| {
                writer.next().write_bigint_bytes(modulus, true);
                writer.next().write_bigint_bytes(exponent, true);
            })
        });

        Self {
            kind: KeyKind::Rsa {
                modulus_bits: modulus_bits(modulus),
            },
            data,
        }
    }

    /// Construct an EC key from its curve name and point coordinates.
    pub fn ec(curve: &str, x: &[u8], y: &[u8]) -> Self {
        let mut data = vec![0x04];
        data.extend_from_slice(x);
        data.extend_from_slice(y);

        Self {
            kind: KeyKind::Ec {
                curve: curve.to_string(),
            },
            data,
        }
    }
}

fn modulus_bits(modulus: &[u8]) -> usize {
    let significant = match modulus.iter().position(|b| *b != 0) {
        Some(pos) => &modulus[pos..],
        None => return 0,
    };

    significant.len() * 8 - significant[0].leading_zeros() as usize
}

fn rsa_modulus(der: &[u8]) -> crate::RemoteKeyResult<Vec<u8>> {
    yasna::parse_der(der, |reader| {
        reader.read_sequence(|reader| {
            let (modulus, _) = reader.next().read_bigint_bytes()?;
            reader.next().read_bigint_bytes()?;

            Ok(modulus)
        })
    })
    .map_err(|e| crate::RemoteKeyError::MalformedKey(format!("RSA public key: {}", e)))
}
