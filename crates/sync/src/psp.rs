//! PSP API client: OAuth token endpoints, account identity, payment reads
//! used by ingestion and reconciliation, and checkout preference creation.

use serde::{Deserialize, Deserializer};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use url::Url;

use crate::config::PspConfig;
use crate::credentials::Platform;
use crate::error::{SyncError, SyncResult};

/// Parsed PSP token endpoint response. `user_id` is the PSP-side account
/// identifier and becomes the credential tenant key.
#[derive(Debug, Clone, Deserialize)]
pub struct PspTokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub user_id: Option<String>,
}

/// A payment as the PSP reports it, from the detail or search endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePayment {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub status: String,
    pub external_reference: Option<String>,
    pub transaction_amount: Option<f64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RemotePayment>,
}

/// Checkout preference creation request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PreferenceRequest {
    pub items: Vec<PreferenceItem>,
    pub external_reference: String,
    pub metadata: serde_json::Value,
    pub back_urls: BackUrls,
    pub auto_return: String,
    pub notification_url: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PreferenceItem {
    pub title: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub currency_id: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreferenceResponse {
    pub id: String,
    pub init_point: String,
}

#[derive(Clone)]
pub struct PspClient {
    http: reqwest::Client,
    config: PspConfig,
}

impl PspClient {
    pub fn new(config: PspConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Browser-facing authorization URL with the correlation token as `state`.
    pub fn authorize_url(&self, state: &str) -> SyncResult<String> {
        let url = Url::parse_with_params(
            &format!("{}/authorization", self.config.auth_base_url),
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", "read write"),
                ("state", state),
            ],
        )
        .map_err(|e| SyncError::Config(format!("invalid PSP auth base URL: {e}")))?;
        Ok(url.into())
    }

    /// Exchange an authorization code for tokens. The response must carry
    /// both an access token and the account's user id.
    pub async fn exchange_code(&self, code: &str) -> SyncResult<PspTokenResponse> {
        let tokens = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .await?;

        if tokens.user_id.is_none() {
            return Err(SyncError::MalformedTokenResponse {
                platform: Platform::Psp,
                raw: "token response missing user_id".to_string(),
            });
        }
        Ok(tokens)
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh(&self, refresh_token: &str) -> SyncResult<PspTokenResponse> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> SyncResult<PspTokenResponse> {
        let url = format!("{}/oauth/token", self.config.api_base_url);
        let res = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::RemoteCallFailed {
                platform: Platform::Psp,
                context: format!("token endpoint status {status}: {body}"),
            });
        }

        let body: serde_json::Value = res
            .json()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))?;

        if body.get("access_token").and_then(|v| v.as_str()).is_none() {
            return Err(SyncError::MalformedTokenResponse {
                platform: Platform::Psp,
                raw: body.to_string(),
            });
        }

        serde_json::from_value(body.clone()).map_err(|_| SyncError::MalformedTokenResponse {
            platform: Platform::Psp,
            raw: body.to_string(),
        })
    }

    /// Fetch the account's public identity. Best-effort: a non-success
    /// response yields `None` rather than failing the onboarding leg.
    pub async fn fetch_public_key(&self, access_token: &str) -> SyncResult<Option<String>> {
        let url = format!("{}/users/me", self.config.api_base_url);
        let res = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))?;

        if !res.status().is_success() {
            tracing::warn!(status = %res.status(), "PSP identity lookup returned non-success");
            return Ok(None);
        }

        let body: serde_json::Value = res
            .json()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))?;
        Ok(body
            .get("public_key")
            .and_then(|v| v.as_str())
            .map(str::to_owned))
    }

    /// Detail fetch for thin webhook notifications that only carry an id.
    pub async fn fetch_payment(&self, access_token: &str, payment_id: &str) -> SyncResult<RemotePayment> {
        let url = format!("{}/v1/payments/{}", self.config.api_base_url, payment_id);
        let res = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))?;

        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized {
                platform: Platform::Psp,
            });
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::RemoteCallFailed {
                platform: Platform::Psp,
                context: format!("payment detail status {status}: {body}"),
            });
        }

        res.json()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))
    }

    /// Payments created since `from`, newest first. Used by reconciliation.
    pub async fn search_payments(
        &self,
        access_token: &str,
        from: OffsetDateTime,
    ) -> SyncResult<Vec<RemotePayment>> {
        let date_from = from.format(&Rfc3339).map_err(|e| SyncError::RemoteCallFailed {
            platform: Platform::Psp,
            context: format!("window format: {e}"),
        })?;

        let url = format!("{}/v1/payments/search", self.config.api_base_url);
        let res = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .query(&[
                ("sort", "date_created"),
                ("criteria", "desc"),
                ("date_created_from", date_from.as_str()),
                ("limit", "50"),
            ])
            .send()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))?;

        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized {
                platform: Platform::Psp,
            });
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::RemoteCallFailed {
                platform: Platform::Psp,
                context: format!("payment search status {status}: {body}"),
            });
        }

        let parsed: SearchResponse = res
            .json()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))?;
        Ok(parsed.results)
    }

    /// Create a checkout preference and return its id and checkout URL.
    pub async fn create_preference(
        &self,
        access_token: &str,
        request: &PreferenceRequest,
    ) -> SyncResult<PreferenceResponse> {
        let url = format!("{}/checkout/preferences", self.config.api_base_url);
        let res = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(request)
            .send()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))?;

        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized {
                platform: Platform::Psp,
            });
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::RemoteCallFailed {
                platform: Platform::Psp,
                context: format!("preference creation status {status}: {body}"),
            });
        }

        res.json()
            .await
            .map_err(|e| SyncError::remote(Platform::Psp, e))
    }
}

/// Convert a provider decimal amount into integer cents.
pub(crate) fn amount_to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// The PSP serializes ids as numbers in some payloads and strings in others.
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base: &str) -> PspConfig {
        PspConfig {
            client_id: "psp-client".to_string(),
            client_secret: "psp-secret".to_string(),
            redirect_uri: "https://app.example.com/oauth/psp/callback".to_string(),
            auth_base_url: base.to_string(),
            api_base_url: base.to_string(),
        }
    }

    #[test]
    fn authorize_url_embeds_state() {
        let client = PspClient::new(test_config("https://auth.psp.test"));
        let url = client.authorize_url("tok-456").unwrap();

        assert!(url.starts_with("https://auth.psp.test/authorization?"));
        assert!(url.contains("state=tok-456"));
        assert!(url.contains("client_id=psp-client"));
    }

    #[tokio::test]
    async fn exchange_code_normalizes_numeric_user_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-9","refresh_token":"rt-9","user_id":987654}"#)
            .create_async()
            .await;

        let client = PspClient::new(test_config(&server.url()));
        let tokens = client.exchange_code("code-9").await.unwrap();

        assert_eq!(tokens.user_id.as_deref(), Some("987654"));
    }

    #[tokio::test]
    async fn exchange_code_requires_user_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at-9"}"#)
            .create_async()
            .await;

        let client = PspClient::new(test_config(&server.url()));
        let err = client.exchange_code("code-9").await.unwrap_err();

        assert!(matches!(err, SyncError::MalformedTokenResponse { .. }));
    }

    #[tokio::test]
    async fn failed_token_exchange_carries_provider_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_client"}"#)
            .create_async()
            .await;

        let client = PspClient::new(test_config(&server.url()));
        let err = client.refresh("rt-old").await.unwrap_err();

        match err {
            SyncError::RemoteCallFailed { context, .. } => {
                assert!(context.contains("invalid_client"));
            }
            other => panic!("expected RemoteCallFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_payment_normalizes_numeric_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payments/314")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":314,"status":"approved","external_reference":"appointment_a1","transaction_amount":50.0}"#,
            )
            .create_async()
            .await;

        let client = PspClient::new(test_config(&server.url()));
        let payment = client.fetch_payment("at-1", "314").await.unwrap();

        assert_eq!(payment.id, "314");
        assert_eq!(payment.status, "approved");
        assert_eq!(payment.external_reference.as_deref(), Some("appointment_a1"));
    }

    #[tokio::test]
    async fn search_payments_parses_results() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payments/search")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results":[
                    {"id":1,"status":"approved","transaction_amount":10.5},
                    {"id":2,"status":"pending","transaction_amount":20.0}
                ]}"#,
            )
            .create_async()
            .await;

        let client = PspClient::new(test_config(&server.url()));
        let payments = client
            .search_payments("at-1", OffsetDateTime::now_utc() - time::Duration::hours(24))
            .await
            .unwrap();

        assert_eq!(payments.len(), 2);
        assert_eq!(payments[0].id, "1");
        assert_eq!(payments[1].status, "pending");
    }

    #[tokio::test]
    async fn fetch_public_key_is_best_effort() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/me")
            .with_status(403)
            .with_body("forbidden")
            .create_async()
            .await;

        let client = PspClient::new(test_config(&server.url()));
        let key = client.fetch_public_key("at-1").await.unwrap();

        assert_eq!(key, None);
    }
}
