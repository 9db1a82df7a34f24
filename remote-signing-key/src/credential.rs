// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bearer tokens for Azure APIs.

use {
    crate::{http::default_client, RemoteKeyError, RemoteKeyResult},
    log::debug,
    reqwest::blocking::Client,
    serde::Deserialize,
    std::{
        collections::HashMap,
        sync::Mutex,
        time::{Duration, Instant},
    },
};

/// Microsoft identity platform endpoint of the public cloud.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Tokens this close to expiry are refreshed.
const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

/// Source of OAuth2 bearer tokens.
pub trait TokenCredential {
    /// Obtain a token valid for `scope`, like `https://vault.azure.net/.default`.
    fn token(&self, scope: &str) -> RemoteKeyResult<String>;
}

/// A pre-issued token, used for every scope.
#[derive(Clone)]
pub struct StaticTokenCredential {
    token: String,
}

impl StaticTokenCredential {
    pub fn new(token: impl ToString) -> Self {
        Self {
            token: token.to_string(),
        }
    }
}

impl TokenCredential for StaticTokenCredential {
    fn token(&self, _scope: &str) -> RemoteKeyResult<String> {
        Ok(self.token.clone())
    }
}

impl std::fmt::Debug for StaticTokenCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenCredential")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Clone, Debug)]
struct CachedToken {
    token: String,
    expires: Instant,
}

/// OAuth2 client credentials grant against Azure Active Directory.
///
/// Tokens are cached per scope until shortly before they expire.
pub struct ClientSecretCredential {
    client: Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl ToString,
        client_id: impl ToString,
        client_secret: impl ToString,
    ) -> RemoteKeyResult<Self> {
        Ok(Self {
            client: default_client()?,
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Use a different identity platform, for sovereign clouds.
    #[must_use]
    pub fn with_authority(mut self, authority: impl ToString) -> Self {
        self.authority = authority.to_string().trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }

    fn cached(&self, scope: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());

        tokens
            .get(scope)
            .filter(|cached| cached.expires > Instant::now() + EXPIRY_MARGIN)
            .map(|cached| cached.token.clone())
    }

    fn store(&self, scope: &str, token: String, lifetime: Duration) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                scope.to_string(),
                CachedToken {
                    token,
                    expires: Instant::now() + lifetime,
                },
            );
    }

    fn request_token(&self, scope: &str) -> RemoteKeyResult<TokenResponse> {
        let response = self
            .client
            .post(self.token_url())
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()?;

        if response.status().is_success() {
            Ok(response.json::<TokenResponse>()?)
        } else {
            let status = response.status();
            let body = response.text().unwrap_or_default();

            Err(RemoteKeyError::Authentication(
                match serde_json::from_str::<TokenErrorResponse>(&body) {
                    Ok(e) => format!(
                        "{} ({})",
                        e.error,
                        e.error_description.unwrap_or_default()
                    ),
                    Err(_) => format!("HTTP {}: {}", status, body),
                },
            ))
        }
    }
}

impl TokenCredential for ClientSecretCredential {
    fn token(&self, scope: &str) -> RemoteKeyResult<String> {
        if let Some(token) = self.cached(scope) {
            return Ok(token);
        }

        debug!("requesting token for {} from {}", scope, self.authority);
        let response = self.request_token(scope)?;

        // Tokens without a stated lifetime are good for an hour.
        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(3600));
        self.store(scope, response.access_token.clone(), lifetime);

        Ok(response.access_token)
    }
}

impl std::fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("authority", &self.authority)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}
