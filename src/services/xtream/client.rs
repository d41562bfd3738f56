//! Xtream Codes API Client
//!
//! HTTP client for the live-TV subset of the Xtream Player API v2.

use super::types::*;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

/// Xtream API Client
pub struct XtreamClient {
    http: Client,
    base_url: String,
    user_agent: String,
    timeout: Duration,
}

impl XtreamClient {
    pub fn new(http: Client, creds: &XtreamCredentials, user_agent: &str, timeout: Duration) -> Self {
        Self {
            http,
            base_url: creds.api_url(),
            user_agent: user_agent.to_string(),
            timeout,
        }
    }

    /// Make a GET request with optional action parameter
    async fn get<T: DeserializeOwned>(&self, action: &str) -> Result<T, XtreamError> {
        let url = if action.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}&action={}", self.base_url, action)
        };

        debug!("Xtream API request: {}", action);

        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .header("User-Agent", self.user_agent.as_str())
            .send()
            .await
            .map_err(|e| XtreamError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(XtreamError::Http(status.as_u16()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| XtreamError::Network(e.to_string()))?;

        if text.trim().is_empty() || text.trim() == "null" {
            return Err(XtreamError::EmptyResponse);
        }

        serde_json::from_str(&text).map_err(|e| {
            error!(
                "Failed to parse Xtream response for action '{}': {}",
                action, e
            );
            debug!("Response text: {}", &text[..text.len().min(500)]);
            XtreamError::Parse(e.to_string())
        })
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Get authentication info (user_info + server_info)
    pub async fn get_auth(&self) -> Result<XtreamAuthResponse, XtreamError> {
        let auth: XtreamAuthResponse = self.get("").await?;
        if !auth.user_info.is_active() {
            return Err(XtreamError::Inactive(
                auth.user_info.status.clone().unwrap_or_else(|| "denied".to_string()),
            ));
        }
        Ok(auth)
    }

    // ========================================================================
    // Live
    // ========================================================================

    /// Get live stream categories
    pub async fn get_live_categories(&self) -> Result<Vec<XtreamCategory>, XtreamError> {
        self.get("get_live_categories").await
    }

    /// Get all live streams as raw records
    pub async fn get_live_streams(&self) -> Result<Vec<Value>, XtreamError> {
        self.get("get_live_streams").await
    }
}

/// Xtream API Error types
#[derive(Debug, thiserror::Error)]
pub enum XtreamError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error: {0}")]
    Http(u16),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Empty response")]
    EmptyResponse,
    #[error("Account not active: {0}")]
    Inactive(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_server;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    async fn player_api(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        if params.get("password").map(String::as_str) != Some("pass") {
            return Json(json!({"user_info": {"auth": 0}}));
        }
        Json(match params.get("action").map(String::as_str) {
            None => json!({
                "user_info": {"username": "user", "status": "Active", "auth": 1},
                "server_info": {"url": "example.com", "port": "8080"}
            }),
            Some("get_live_categories") => json!([
                {"category_id": "1", "category_name": "News"},
                {"category_id": 2, "category_name": "Sports"}
            ]),
            Some("get_live_streams") => json!([
                {"num": 1, "name": "CNN", "stream_id": 101, "category_id": "1"},
                {"num": 2, "name": "ESPN", "stream_id": 102, "category_id": "2"}
            ]),
            Some(_) => json!([]),
        })
    }

    async fn client_with(password: &str) -> XtreamClient {
        let base = spawn_server(Router::new().route("/player_api.php", get(player_api))).await;
        let creds = XtreamCredentials::new(&base, "user", password);
        XtreamClient::new(Client::new(), &creds, "VLC/3.0.20", Duration::from_secs(5))
    }

    #[test]
    fn test_client_url_trailing_slash() {
        let creds = XtreamCredentials::new("http://example.com:8080/", "user", "pass");
        let client = XtreamClient::new(Client::new(), &creds, "ua", Duration::from_secs(1));
        assert!(!client.base_url.contains("//player_api"));
        assert!(client.base_url.contains("username=user"));
    }

    #[tokio::test]
    async fn test_live_endpoints() {
        let client = client_with("pass").await;

        let auth = client.get_auth().await.unwrap();
        assert_eq!(auth.user_info.username.as_deref(), Some("user"));

        let categories = client.get_live_categories().await.unwrap();
        assert_eq!(categories.len(), 2);
        assert_eq!(categories[1].category_id, "2");

        let streams = client.get_live_streams().await.unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0]["name"], "CNN");
    }

    #[tokio::test]
    async fn test_denied_account() {
        let client = client_with("wrong").await;
        assert!(matches!(client.get_auth().await, Err(XtreamError::Inactive(_))));
    }
}
