// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ECDSA signature encodings.
//!
//! JOSE style custodians return ECDSA signatures as the fixed width
//! concatenation of `r` and `s`. X.509 and CMS consumers want the DER
//! `Ecdsa-Sig-Value ::= SEQUENCE { r INTEGER, s INTEGER }`.

use crate::{RemoteKeyError, RemoteKeyResult};

/// Re-encode a fixed width `r || s` signature as DER.
pub fn fixed_to_der(signature: &[u8]) -> RemoteKeyResult<Vec<u8>> {
    if signature.is_empty() || signature.len() % 2 != 0 {
        return Err(RemoteKeyError::MalformedSignature(format!(
            "fixed width ECDSA signature has odd length {}",
            signature.len()
        )));
    }

    let (r, s) = signature.split_at(signature.len() / 2);
    let (r, s) = (minimal(r), minimal(s));

    Ok(yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_bigint_bytes(r, true);
            writer.next().write_bigint_bytes(s, true);
        })
    }))
}

/// Decode a DER signature into the magnitudes of `r` and `s`.
pub fn der_to_integers(der: &[u8]) -> RemoteKeyResult<(Vec<u8>, Vec<u8>)> {
    yasna::parse_der(der, |reader| {
        reader.read_sequence(|reader| {
            let (r, _) = reader.next().read_bigint_bytes()?;
            let (s, _) = reader.next().read_bigint_bytes()?;

            Ok((trim(r), trim(s)))
        })
    })
    .map_err(|e| RemoteKeyError::MalformedSignature(e.to_string()))
}

/// Strip leading zeroes, keeping at least one byte.
fn minimal(value: &[u8]) -> &[u8] {
    let zeros = value.iter().take_while(|b| **b == 0).count();

    &value[zeros.min(value.len() - 1)..]
}

fn trim(mut value: Vec<u8>) -> Vec<u8> {
    let zeros = value.iter().take_while(|b| **b == 0).count();
    value.drain(..zeros);

    value
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_integers() -> RemoteKeyResult<()> {
        // r has its high bit set and needs a sign byte, s has leading zeroes.
        let mut fixed = vec![0xd1u8; 32];
        fixed.extend_from_slice(&[0u8; 3]);
        fixed.extend_from_slice(&[0x42u8; 29]);

        let der = fixed_to_der(&fixed)?;
        assert_eq!(der[0], 0x30);
        assert_eq!(&der[2..5], &[0x02, 33, 0x00]);

        let (r, s) = der_to_integers(&der)?;
        assert_eq!(r, vec![0xd1u8; 32]);
        assert_eq!(s, vec![0x42u8; 29]);

        Ok(())
    }

    #[test]
    fn p384_width() -> RemoteKeyResult<()> {
        let fixed = (1..=96u8).collect::<Vec<_>>();

        let (r, s) = der_to_integers(&fixed_to_der(&fixed)?)?;
        assert_eq!(r, &fixed[..48]);
        assert_eq!(s, &fixed[48..]);

        Ok(())
    }

    #[test]
    fn odd_length_rejected() {
        assert!(matches!(
            fixed_to_der(&[1, 2, 3]),
            Err(RemoteKeyError::MalformedSignature(_))
        ));
        assert!(fixed_to_der(&[]).is_err());
    }
}
