// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{RemoteKeyError, RemoteKeyResult},
    cryptographic_message_syntax::SignedData,
    log::{debug, warn},
    x509_certificate::CapturedX509Certificate,
};

/// DER encoding of the OID of PKCS#7 signed-data (1.2.840.113549.1.7.2).
const SIGNED_DATA_OID: &[u8] = &[
    0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02,
];

/// How far into a blob we look for [SIGNED_DATA_OID].
const SIGNED_DATA_WINDOW: usize = 32;

/// Parse a certificate chain as distributed by custodians.
///
/// The blob may be a PKCS#7 signed-data envelope carrying the chain, PEM
/// with `CERTIFICATE` and/or `PKCS7` blocks, or concatenated DER
/// certificates. Certificates are returned in the order they appear, which
/// custodians use to put the leaf first.
pub fn parse_certificate_chain(data: &[u8]) -> RemoteKeyResult<Vec<CapturedX509Certificate>> {
    let certs = if is_signed_data(data) {
        signed_data_certificates(data)?
    } else if looks_like_pem(data) {
        pem_certificates(data)?
    } else {
        der_certificates(data)?
    };

    if certs.is_empty() {
        return Err(RemoteKeyError::NoCertificates);
    }

    debug!("parsed certificate chain of {} certificates", certs.len());

    Ok(certs)
}

fn is_signed_data(data: &[u8]) -> bool {
    data[..data.len().min(SIGNED_DATA_WINDOW)]
        .windows(SIGNED_DATA_OID.len())
        .any(|window| window == SIGNED_DATA_OID)
}

fn looks_like_pem(data: &[u8]) -> bool {
    data.windows(11).any(|window| window == b"-----BEGIN ")
}

fn signed_data_certificates(data: &[u8]) -> RemoteKeyResult<Vec<CapturedX509Certificate>> {
    let signed_data = SignedData::parse_ber(data)?;

    Ok(signed_data.certificates().cloned().collect())
}

fn pem_certificates(data: &[u8]) -> RemoteKeyResult<Vec<CapturedX509Certificate>> {
    let mut certs = vec![];

    for block in pem::parse_many(data)? {
        match block.tag.as_str() {
            "CERTIFICATE" => {
                certs.push(CapturedX509Certificate::from_der(block.contents)?);
            }
            "PKCS7" => {
                certs.extend(signed_data_certificates(&block.contents)?);
            }
            tag => {
                warn!("ignoring {} PEM block in certificate data", tag);
            }
        }
    }

    Ok(certs)
}

fn der_certificates(mut data: &[u8]) -> RemoteKeyResult<Vec<CapturedX509Certificate>> {
    let mut certs = vec![];

    while !data.is_empty() {
        let len = der_element_len(data)?;
        let (cert, remaining) = data.split_at(len);

        certs.push(CapturedX509Certificate::from_der(cert.to_vec())?);
        data = remaining;
    }

    Ok(certs)
}

/// Total length of the DER SEQUENCE at the start of `data`.
fn der_element_len(data: &[u8]) -> RemoteKeyResult<usize> {
    if data.len() < 2 {
        return Err(RemoteKeyError::MalformedCertificates("truncated DER header"));
    }

    if data[0] != 0x30 {
        return Err(RemoteKeyError::MalformedCertificates(
            "certificate is not a DER SEQUENCE",
        ));
    }

    let (header_len, content_len) = match data[1] {
        len @ 0..=0x7f => (2, len as usize),
        count @ 0x81..=0x84 => {
            let count = (count & 0x7f) as usize;
            let bytes = data
                .get(2..2 + count)
                .ok_or(RemoteKeyError::MalformedCertificates("truncated DER length"))?;

            (
                2 + count,
                bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize),
            )
        }
        _ => {
            return Err(RemoteKeyError::MalformedCertificates(
                "unsupported DER length encoding",
            ))
        }
    };

    let total = header_len + content_len;
    if total > data.len() {
        return Err(RemoteKeyError::MalformedCertificates(
            "DER certificate extends past end of data",
        ));
    }

    Ok(total)
}
