// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{RemoteKeyError, RemoteKeyResult},
    log::error,
    reqwest::blocking::{Client, ClientBuilder, Response},
};

/// Obtain the default [Client] to use for custodian requests.
pub(crate) fn default_client() -> RemoteKeyResult<Client> {
    Ok(ClientBuilder::default()
        .user_agent("remote-signing-key crate (https://github.com/indygreg/PyOxidizer)")
        .build()?)
}

/// Turn a non-2xx response into [RemoteKeyError::Custodian].
pub(crate) fn check_response(response: Response, operation: &str) -> RemoteKeyResult<Response> {
    let status = response.status();

    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().unwrap_or_default();
        error!("{} failed with HTTP {}", operation, status);
        error!("{}", body);

        Err(RemoteKeyError::Custodian {
            status: status.as_u16(),
            body,
        })
    }
}

pub(crate) fn encode_base64url(data: &[u8]) -> String {
    base64::encode_config(data, base64::URL_SAFE_NO_PAD)
}

/// Decode base64url, with or without padding.
pub(crate) fn decode_base64url(data: &str) -> RemoteKeyResult<Vec<u8>> {
    Ok(base64::decode_config(
        data.trim_end_matches('='),
        base64::URL_SAFE_NO_PAD,
    )?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn base64url() -> RemoteKeyResult<()> {
        let data = [0xfb, 0xff, 0xfe, 0x01];
        let encoded = encode_base64url(&data);
        assert_eq!(encoded, "-__-AQ");
        assert_eq!(decode_base64url(&encoded)?, data);
        assert_eq!(decode_base64url("-__-AQ==")?, data);

        Ok(())
    }
}
