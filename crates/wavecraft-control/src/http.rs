//! HTTP control-plane client (`/tts-stream`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use wavecraft_core::config::ControlPlaneConfig;
use wavecraft_core::types::{Endpoint, VoiceParameters};

use crate::{EndpointResolver, ResolutionError, SettlementError, TurnSettlement};

const DEFAULT_VOICE: &str = "x5_lingfeiyi_flow";

/// Body returned by `GET /tts-stream`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamGrant {
    session_id: Option<String>,
    websocket_url: Option<String>,
    #[serde(default)]
    parameters: Option<VoiceParameters>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// Client for the control plane's `/tts-stream` resource.
pub struct ControlPlaneClient {
    config: ControlPlaneConfig,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(config: ControlPlaneConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn stream_url(&self) -> String {
        format!("{}/tts-stream", self.config.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.resolve_auth_token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn settle(&self, req: reqwest::RequestBuilder) -> Result<(), SettlementError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| SettlementError(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SettlementError(format!("{status}: {body}")));
        }
        Ok(())
    }
}

#[async_trait]
impl EndpointResolver for ControlPlaneClient {
    async fn resolve(&self, intent: &str) -> Result<Endpoint, ResolutionError> {
        let voice = self.config.voice.as_deref().unwrap_or(DEFAULT_VOICE);
        let url = self.stream_url();
        debug!(%url, voice, "Requesting synthesis endpoint");

        let req = self.http.get(&url).query(&[
            ("text", intent.to_string()),
            ("voice", voice.to_string()),
            ("speed", self.config.speed.to_string()),
            ("volume", self.config.volume.to_string()),
            ("pitch", self.config.pitch.to_string()),
        ]);

        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| ResolutionError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ResolutionError::Rejected { status, body });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| ResolutionError::Network(e.to_string()))?;
        let grant: StreamGrant = serde_json::from_str(&body)
            .map_err(|e| ResolutionError::Malformed(e.to_string()))?;

        let endpoint = endpoint_from_grant(grant, Utc::now())?;
        info!(
            session_id = %endpoint.session_id,
            url = endpoint.redacted_url(),
            "Resolved synthesis endpoint"
        );
        Ok(endpoint)
    }
}

#[async_trait]
impl TurnSettlement for ControlPlaneClient {
    async fn confirm(
        &self,
        session_id: &str,
        success: bool,
        actual_text_length: usize,
    ) -> Result<(), SettlementError> {
        debug!(session_id, success, actual_text_length, "Confirming turn");
        let req = self.http.post(self.stream_url()).json(&json!({
            "sessionId": session_id,
            "success": success,
            "actualTextLength": actual_text_length,
        }));
        self.settle(req).await
    }

    async fn cancel(&self, session_id: &str) -> Result<(), SettlementError> {
        debug!(session_id, "Cancelling turn");
        let req = self
            .http
            .delete(self.stream_url())
            .query(&[("sessionId", session_id)]);
        self.settle(req).await
    }
}

/// Validate a grant and turn it into an [`Endpoint`].
fn endpoint_from_grant(grant: StreamGrant, now: DateTime<Utc>) -> Result<Endpoint, ResolutionError> {
    let session_id = grant
        .session_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResolutionError::Malformed("missing sessionId".into()))?;

    let url = grant
        .websocket_url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ResolutionError::Credential("missing websocketUrl".into()))?;

    let parsed = reqwest::Url::parse(&url)
        .map_err(|e| ResolutionError::Malformed(format!("websocketUrl: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(ResolutionError::Malformed(format!(
            "websocketUrl has unsupported scheme `{}`",
            parsed.scheme()
        )));
    }

    if let Some(expires_at) = grant.expires_at {
        if expires_at <= now {
            return Err(ResolutionError::Credential(format!(
                "credential expired at {expires_at}"
            )));
        }
    }

    Ok(Endpoint {
        session_id,
        url,
        parameters: grant.parameters.unwrap_or_default(),
        expires_at: grant.expires_at,
    })
}
