//! `GoogleOAuthRefresher`: the concrete `AuthTokenRefresher` (C2) this binary
//! needs to actually run. `cloudgate-core` only consumes the trait; this is
//! the "externally implemented" OAuth client `spec.md` §1 calls out.
//!
//! Grounded on the donor's `refresh_access_token`
//! (`gproxy-provider-impl/src/providers/antigravity/oauth.rs`): same
//! form-encoded POST against the Google token endpoint. Unlike the donor,
//! which embeds its own OAuth client id/secret as constants, this reads them
//! from the environment — this gateway is not registered under the donor's
//! OAuth client and must not ship with credentials it doesn't own.

use async_trait::async_trait;
use wreq::Client;

use cloudgate_core::{AuthTokenRefresher, RefreshedToken};

const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub struct GoogleOAuthRefresher {
    client: Client,
    client_id: String,
    client_secret: String,
    token_url: String,
}

impl GoogleOAuthRefresher {
    /// Reads `GOOGLE_OAUTH_CLIENT_ID` / `GOOGLE_OAUTH_CLIENT_SECRET` from the
    /// process environment. `GOOGLE_OAUTH_TOKEN_URL` overrides the endpoint
    /// for testing against a mock.
    pub fn from_env() -> anyhow::Result<Self> {
        let client_id = std::env::var("GOOGLE_OAUTH_CLIENT_ID")
            .map_err(|_| anyhow::anyhow!("GOOGLE_OAUTH_CLIENT_ID is not set"))?;
        let client_secret = std::env::var("GOOGLE_OAUTH_CLIENT_SECRET")
            .map_err(|_| anyhow::anyhow!("GOOGLE_OAUTH_CLIENT_SECRET is not set"))?;
        let token_url = std::env::var("GOOGLE_OAUTH_TOKEN_URL").unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string());
        Ok(Self {
            client: Client::builder().build()?,
            client_id,
            client_secret,
            token_url,
        })
    }
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[async_trait]
impl AuthTokenRefresher for GoogleOAuthRefresher {
    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<RefreshedToken> {
        let body = format!(
            "refresh_token={}&client_id={}&client_secret={}&grant_type=refresh_token",
            urlencoding::encode(refresh_token),
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.client_secret),
        );

        let resp = self
            .client
            .post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            anyhow::bail!("refresh_token_failed: {status} {text}");
        }

        let parsed: TokenResponse = serde_json::from_slice(&bytes)?;
        Ok(RefreshedToken {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_in: parsed.expires_in.unwrap_or(3600),
        })
    }
}

