//! Inbound webhook receiver for the source-code host.
//!
//! The webhook itself carries only the PR action and identifying fields.
//! Image tags and service definitions come from the caller's CI pipeline
//! through `POST /api/previews` — the webhook's role is to trigger
//! `closed` -> Destroy for the affected PR preview and to record the
//! other lifecycle actions as events for visibility.

use std::sync::Arc;

use axum::{body::Bytes, extract::State, http::HeaderMap, response::IntoResponse, Json};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use crate::api::error::ApiError;
use crate::naming;
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

fn verify_signature(secret: &str, signature_header: &str, payload: &[u8]) -> bool {
    let signature = match signature_header.strip_prefix("sha256=") {
        Some(sig) => sig,
        None => return false,
    };
    let expected = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Deserialize)]
pub struct SourceWebhookPayload {
    pub action: String,
    pub number: i64,
    pub repository: SourceRepository,
    pub pull_request: SourcePullRequest,
}

#[derive(Debug, Deserialize)]
pub struct SourceRepository {
    pub owner: SourceOwner,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SourceOwner {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct SourcePullRequest {
    pub head: SourceRef,
}

#[derive(Debug, Deserialize)]
pub struct SourceRef {
    #[serde(rename = "ref")]
    pub branch: String,
    pub sha: String,
}

pub async fn source_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(secret) = &state.config.webhooks.secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing X-Hub-Signature-256 header"))?;
        if !verify_signature(secret, signature, &body) {
            return Err(ApiError::unauthorized("webhook signature verification failed"));
        }
    }

    let payload: SourceWebhookPayload =
        serde_json::from_slice(&body).map_err(|e| ApiError::validation(format!("malformed webhook payload: {e}")))?;

    let preview_id = naming::preview_id(naming::PreviewKind::PullRequest, Some(payload.number), &payload.pull_request.head.branch);

    match payload.action.as_str() {
        "closed" => {
            state
                .orchestrator
                .destroy(&preview_id)
                .await
                .map_err(ApiError::from)?;
        }
        "opened" | "synchronize" | "reopened" => {
            tracing::info!(
                action = %payload.action,
                preview_id = %preview_id,
                repo = %format!("{}/{}", payload.repository.owner.login, payload.repository.name),
                commit_sha = %payload.pull_request.head.sha,
                "received PR event; awaiting CI-supplied preview config via REST"
            );
        }
        other => {
            tracing::debug!(action = other, "ignoring unrecognized webhook action");
        }
    }

    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_valid_signature() {
        let secret = "topsecret";
        let body = b"{\"hello\":\"world\"}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");
        assert!(verify_signature(secret, &header, body));
    }

    #[test]
    fn rejects_tampered_payload() {
        let secret = "topsecret";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"original");
        let digest = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={digest}");
        assert!(!verify_signature(secret, &header, b"tampered"));
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(!verify_signature("secret", "deadbeef", b"payload"));
    }
}
