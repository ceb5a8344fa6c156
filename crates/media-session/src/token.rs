//! Media token issuing.

use crate::{MediaError, MediaResult};
use async_trait::async_trait;
use room_config_and_utils::{Config, SessionHandle};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{debug, error};

/// What the token is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaTokenRequest {
    pub room_id: String,
    /// Speaker scope lets the holder publish audio.
    pub as_speaker: bool,
}

/// A signed grant and the server it is valid for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MediaGrant {
    pub token: String,
    #[serde(alias = "url", alias = "serverUrl")]
    pub session_url: String,
}

/// Mints media-session tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, request: &MediaTokenRequest) -> MediaResult<MediaGrant>;
}

fn summarize_response_body(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("len={},digest={:016x}", body.len(), hasher.finish())
}

/// Token issuer backed by a serverless function (`/functions/v1/<name>`).
#[derive(Clone)]
pub struct FunctionTokenIssuer {
    http_client: reqwest::Client,
    api_url: String,
    anon_key: String,
    function: String,
    session: SessionHandle,
}

impl FunctionTokenIssuer {
    pub fn new(
        api_url: impl Into<String>,
        anon_key: impl Into<String>,
        function: impl Into<String>,
        session: SessionHandle,
    ) -> Self {
        let api_url: String = api_url.into();
        Self {
            http_client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            function: function.into(),
            session,
        }
    }

    pub fn from_config(config: &Config, session: SessionHandle) -> MediaResult<Self> {
        let url = config
            .supabase_url()
            .map_err(|e| MediaError::Config(e.to_string()))?;
        Ok(Self::new(
            url.as_str(),
            config.supabase_publishable_key.clone(),
            config.media_token_function.clone(),
            session,
        ))
    }

    fn function_url(&self) -> String {
        format!("{}/functions/v1/{}", self.api_url, self.function)
    }
}

#[async_trait]
impl TokenIssuer for FunctionTokenIssuer {
    async fn issue(&self, request: &MediaTokenRequest) -> MediaResult<MediaGrant> {
        let access_token = self.session.access_token().ok_or(MediaError::NotSignedIn)?;

        debug!(
            room_id = %request.room_id,
            as_speaker = request.as_speaker,
            "Requesting media token"
        );

        let response = self
            .http_client
            .post(self.function_url())
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let body_summary = summarize_response_body(&body);
            error!(status = %status, body_summary = %body_summary, "Media token request failed");
            return Err(MediaError::TokenRejected {
                status: status.as_u16(),
                message: body_summary,
            });
        }

        let grant: MediaGrant = response.json().await?;
        debug!(room_id = %request.room_id, "Media token issued");
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let body = serde_json::to_value(MediaTokenRequest {
            room_id: "r1".to_string(),
            as_speaker: true,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "room_id": "r1", "as_speaker": true }));
    }

    #[test]
    fn grant_accepts_url_aliases() {
        let grant: MediaGrant =
            serde_json::from_str(r#"{"token":"t","url":"wss://media.example"}"#).unwrap();
        assert_eq!(grant.session_url, "wss://media.example");

        let grant: MediaGrant =
            serde_json::from_str(r#"{"token":"t","serverUrl":"wss://m2"}"#).unwrap();
        assert_eq!(grant.session_url, "wss://m2");
    }

    #[test]
    fn function_url_from_config() {
        let mut config = Config::default();
        config.supabase_url = "https://abc.supabase.co".to_string();
        config.media_token_function = "media-token".to_string();
        let issuer = FunctionTokenIssuer::from_config(&config, SessionHandle::new()).unwrap();
        assert_eq!(
            issuer.function_url(),
            "https://abc.supabase.co/functions/v1/media-token"
        );
    }

    #[tokio::test]
    async fn issue_requires_session() {
        let issuer = FunctionTokenIssuer::new(
            "https://abc.supabase.co",
            "pk",
            "livekit-token",
            SessionHandle::new(),
        );
        let err = issuer
            .issue(&MediaTokenRequest {
                room_id: "r1".to_string(),
                as_speaker: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NotSignedIn));
    }
}
