//! Kite Connect session exchange: `request_token` in, `access_token` out.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::Instrument;
use url::Url;

use crate::error::RefreshError;
use crate::models::{AccessToken, AuthorizationCode};
use crate::utils::Clock;

const KITE_API_VERSION: &str = "3";
const SESSION_TOKEN_PATH: &str = "session/token";

/// One-shot exchange of an authorization code for an access token.
///
/// Implementations never retry: a code is single-use, so a failed exchange is
/// recovered only by a fresh login.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(
        &self,
        code: &AuthorizationCode,
        api_key: &str,
        api_secret: &str,
    ) -> Result<AccessToken, RefreshError>;
}

/// Builds the interactive login URL for an API key.
pub fn login_url(base: &str, api_key: &str) -> Result<String, RefreshError> {
    let url = Url::parse_with_params(base, &[("v", KITE_API_VERSION), ("api_key", api_key)])
        .map_err(|e| RefreshError::InvalidSetting {
            name: "KITE_LOGIN_BASE_URL".into(),
            reason: e.to_string(),
        })?;
    Ok(url.into())
}

/// `hex(sha256(api_key + request_token + api_secret))`, as Kite expects.
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Deserialize)]
struct KiteEnvelope {
    status: String,
    #[serde(default)]
    data: Option<SessionData>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

pub struct KiteTokenExchanger {
    client: Client,
    endpoint: Url,
    owner_key: String,
    clock: Arc<dyn Clock>,
}

impl KiteTokenExchanger {
    pub fn new(
        api_base_url: &str,
        timeout: Duration,
        owner_key: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let mut base = Url::parse(api_base_url)
            .with_context(|| format!("Invalid KITE_API_BASE_URL: {api_base_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(SESSION_TOKEN_PATH)
            .context("Failed to build session endpoint")?;

        let client = Client::builder()
            .user_agent(concat!("kite-token-refresher/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to initialize HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            owner_key: owner_key.into(),
            clock,
        })
    }

    async fn request_access_token(
        &self,
        code: &AuthorizationCode,
        api_key: &str,
        api_secret: &str,
    ) -> anyhow::Result<String> {
        let checksum = session_checksum(api_key, code.as_str(), api_secret);
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("X-Kite-Version", KITE_API_VERSION)
            .form(&[
                ("api_key", api_key),
                ("request_token", code.as_str()),
                ("checksum", checksum.as_str()),
            ])
            .send()
            .await
            .context("Failed to reach Kite session endpoint")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read Kite session response")?;

        let envelope: KiteEnvelope = serde_json::from_str(&body)
            .with_context(|| format!("Unexpected Kite response (HTTP {status})"))?;

        if !status.is_success() || envelope.status != "success" {
            return Err(anyhow!(
                "Kite rejected the session request (HTTP {}, {}): {}",
                status.as_u16(),
                envelope.error_type.as_deref().unwrap_or("UnknownError"),
                envelope.message.as_deref().unwrap_or("no message")
            ));
        }

        let data = envelope
            .data
            .ok_or_else(|| anyhow!("Kite session response has no data"))?;
        if let Some(user_id) = data.user_id.as_deref() {
            tracing::debug!(kite_user_id = user_id, "Kite session established");
        }
        data.access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| anyhow!("Kite session response has no access_token"))
    }
}

#[async_trait]
impl TokenExchanger for KiteTokenExchanger {
    async fn exchange(
        &self,
        code: &AuthorizationCode,
        api_key: &str,
        api_secret: &str,
    ) -> Result<AccessToken, RefreshError> {
        let span = tracing::info_span!("kite_session_exchange", endpoint = %self.endpoint);
        let value = self
            .request_access_token(code, api_key, api_secret)
            .instrument(span)
            .await
            .map_err(RefreshError::TokenExchange)?;

        Ok(AccessToken::issue(value, self.owner_key.clone(), self.clock.now()))
    }
}
