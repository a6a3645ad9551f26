//! CRM API client: OAuth token endpoints, identity lookup, and the contact
//! resource calls used by the outbound sync path.
//!
//! Provider-shape parsing stays in this module; business logic never touches
//! raw CRM payloads.

use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::config::CrmConfig;
use crate::credentials::Platform;
use crate::error::{SyncError, SyncResult};

/// Parsed CRM token endpoint response.
///
/// The tenant identifier usually rides along on the token response; when it
/// does not, callers fall back to [`CrmClient::fetch_identity`].
#[derive(Debug, Clone, Deserialize)]
pub struct CrmTokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(rename = "locationId")]
    pub location_id: Option<String>,
}

#[derive(Clone)]
pub struct CrmClient {
    http: reqwest::Client,
    config: CrmConfig,
}

impl CrmClient {
    pub fn new(config: CrmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Browser-facing authorization URL with the correlation token as `state`.
    pub fn authorize_url(&self, state: &str) -> SyncResult<String> {
        let url = Url::parse_with_params(
            &format!("{}/oauth/chooselocation", self.config.auth_base_url),
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", self.config.scopes.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| SyncError::Config(format!("invalid CRM auth base URL: {e}")))?;
        Ok(url.into())
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> SyncResult<CrmTokenResponse> {
        self.token_request(&[
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh(&self, refresh_token: &str) -> SyncResult<CrmTokenResponse> {
        self.token_request(&[
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> SyncResult<CrmTokenResponse> {
        let url = format!("{}/oauth/token", self.config.api_base_url);
        let res = self
            .http
            .post(&url)
            .form(params)
            .send()
            .await
            .map_err(|e| SyncError::remote(Platform::Crm, e))?;
        let body: serde_json::Value = res
            .json()
            .await
            .map_err(|e| SyncError::remote(Platform::Crm, e))?;

        // A token response without access_token is fatal to the leg; keep the
        // raw payload so an operator can see what the provider actually said.
        if body.get("access_token").and_then(|v| v.as_str()).is_none() {
            return Err(SyncError::MalformedTokenResponse {
                platform: Platform::Crm,
                raw: body.to_string(),
            });
        }

        serde_json::from_value(body.clone()).map_err(|_| SyncError::MalformedTokenResponse {
            platform: Platform::Crm,
            raw: body.to_string(),
        })
    }

    /// "Who am I" lookup used when the token response carries no tenant id.
    pub async fn fetch_identity(&self, access_token: &str) -> SyncResult<serde_json::Value> {
        let url = format!("{}/users/me", self.config.api_base_url);
        let res = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .header("Version", &self.config.api_version)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| SyncError::remote(Platform::Crm, e))?;

        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized {
                platform: Platform::Crm,
            });
        }

        res.json()
            .await
            .map_err(|e| SyncError::remote(Platform::Crm, e))
    }

    /// Apply a tag to a remote contact.
    pub async fn add_tag(&self, access_token: &str, contact_id: &str, tag: &str) -> SyncResult<()> {
        let url = format!("{}/contacts/{}/tags", self.config.api_base_url, contact_id);
        let res = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .header("Version", &self.config.api_version)
            .json(&json!({ "tags": [tag] }))
            .send()
            .await
            .map_err(|e| SyncError::remote(Platform::Crm, e))?;
        check_resource_response(res).await
    }

    /// Set a custom field on a remote contact.
    pub async fn set_custom_field(
        &self,
        access_token: &str,
        contact_id: &str,
        field_key: &str,
        value: &str,
    ) -> SyncResult<()> {
        let mut fields = serde_json::Map::new();
        fields.insert(field_key.to_string(), json!(value));

        let url = format!("{}/contacts/{}", self.config.api_base_url, contact_id);
        let res = self
            .http
            .patch(&url)
            .bearer_auth(access_token)
            .header("Version", &self.config.api_version)
            .json(&json!({ "customFields": fields }))
            .send()
            .await
            .map_err(|e| SyncError::remote(Platform::Crm, e))?;
        check_resource_response(res).await
    }
}

async fn check_resource_response(res: reqwest::Response) -> SyncResult<()> {
    let status = res.status();
    if status.is_success() {
        return Ok(());
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(SyncError::Unauthorized {
            platform: Platform::Crm,
        });
    }
    let body = res.text().await.unwrap_or_default();
    Err(SyncError::RemoteCallFailed {
        platform: Platform::Crm,
        context: format!("status {status}: {body}"),
    })
}

/// First non-empty location id in an identity payload, if any.
pub fn first_location_id(identity: &serde_json::Value) -> Option<String> {
    identity
        .get("company")?
        .get("locations")?
        .as_array()?
        .iter()
        .filter_map(|loc| loc.get("id").and_then(|v| v.as_str()))
        .find(|id| !id.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(base: &str) -> CrmConfig {
        CrmConfig {
            client_id: "crm-client".to_string(),
            client_secret: "crm-secret".to_string(),
            redirect_uri: "https://app.example.com/oauth/crm/callback".to_string(),
            auth_base_url: base.to_string(),
            api_base_url: base.to_string(),
            api_version: "2021-07-28".to_string(),
            scopes: "contacts.readonly contacts.write".to_string(),
        }
    }

    #[test]
    fn authorize_url_embeds_state_and_client() {
        let client = CrmClient::new(test_config("https://auth.crm.test"));
        let url = client.authorize_url("tok-123").unwrap();

        assert!(url.starts_with("https://auth.crm.test/oauth/chooselocation?"));
        assert!(url.contains("state=tok-123"));
        assert!(url.contains("client_id=crm-client"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn first_location_id_skips_empty_entries() {
        let identity = json!({
            "company": {
                "locations": [
                    { "id": "" },
                    { "name": "no id here" },
                    { "id": "loc_123" },
                ]
            }
        });
        assert_eq!(first_location_id(&identity), Some("loc_123".to_string()));
    }

    #[test]
    fn first_location_id_handles_missing_company() {
        assert_eq!(first_location_id(&json!({})), None);
        assert_eq!(first_location_id(&json!({ "company": {} })), None);
    }

    #[tokio::test]
    async fn exchange_code_parses_tokens_and_location() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"at-1","refresh_token":"rt-1","locationId":"loc_123"}"#,
            )
            .create_async()
            .await;

        let client = CrmClient::new(test_config(&server.url()));
        let tokens = client.exchange_code("code-1").await.unwrap();

        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(tokens.location_id.as_deref(), Some("loc_123"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_access_token_surfaces_raw_payload() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let client = CrmClient::new(test_config(&server.url()));
        let err = client.exchange_code("bad-code").await.unwrap_err();

        match err {
            SyncError::MalformedTokenResponse { raw, .. } => {
                assert!(raw.contains("invalid_grant"));
            }
            other => panic!("expected MalformedTokenResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_tag_maps_401_to_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/contacts/c-1/tags")
            .with_status(401)
            .with_body(r#"{"message":"Invalid JWT"}"#)
            .create_async()
            .await;

        let client = CrmClient::new(test_config(&server.url()));
        let err = client.add_tag("stale-token", "c-1", "payment_confirmed").await.unwrap_err();

        assert!(matches!(err, SyncError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn identity_fallback_returns_payload() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/me")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"company":{"locations":[{"id":"loc_9"}]}}"#)
            .create_async()
            .await;

        let client = CrmClient::new(test_config(&server.url()));
        let identity = client.fetch_identity("at-1").await.unwrap();

        assert_eq!(first_location_id(&identity), Some("loc_9".to_string()));
    }
}
