//! REST binding of the session and reference APIs.
//!
//! | Operation     | Request                                        |
//! |---------------|------------------------------------------------|
//! | join          | `POST  /api/cases/{id}/session/join`           |
//! | leave         | `POST  /api/cases/{id}/session/leave`          |
//! | participants  | `GET   /api/cases/{id}/session/participants`   |
//! | form state    | `GET   /api/cases/{id}/session/form`           |
//! | patch field   | `PATCH /api/cases/{id}/session/form/{field}`   |
//! | reference     | `GET   /api/reference/{category}`              |

use std::time::Duration;

use async_trait::async_trait;
use casesync_core::api::ApiResult;
use casesync_core::{
    ApiError, FieldKey, FormSnapshot, Participant, ReferenceApi, ReferenceCategory, SessionApi,
    SessionId,
};
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// [`SessionApi`] and [`ReferenceApi`] over HTTP with bearer auth.
pub struct HttpSessionApi {
    client: Client,
    base: Url,
    token: Option<String>,
}

#[derive(Serialize)]
struct PatchBody<'a> {
    value: &'a Value,
    client_timestamp: DateTime<Utc>,
}

/// Servers answer either with a bare list or wrapped in an object.
#[derive(Deserialize)]
#[serde(untagged)]
enum ParticipantsBody {
    Bare(Vec<Participant>),
    Wrapped { participants: Vec<Participant> },
}

impl HttpSessionApi {
    /// Create a client for `server_url`.
    pub fn new(server_url: &str, token: Option<String>) -> Result<Self, String> {
        let base = Url::parse(server_url).map_err(|e| format!("Invalid server URL {}: {}", server_url, e))?;
        if base.cannot_be_a_base() {
            return Err(format!("Invalid server URL {}", server_url));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn session_endpoint(&self, session: &SessionId, tail: &[&str]) -> Url {
        let mut segments = vec!["api", "cases", session.as_str(), "session"];
        segments.extend_from_slice(tail);
        self.endpoint(&segments)
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> ApiResult<Response> {
        tracing::debug!("{} {}", method, url);
        let mut request = self.client.request(method, url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(url.path().to_string())),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(ApiError::Server {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> ApiResult<T> {
        self.send(Method::GET, url, None)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn join(&self, session: &SessionId) -> ApiResult<()> {
        let url = self.session_endpoint(session, &["join"]);
        self.send(Method::POST, url, None).await.map(|_| ())
    }

    async fn leave(&self, session: &SessionId) -> ApiResult<()> {
        let url = self.session_endpoint(session, &["leave"]);
        self.send(Method::POST, url, None).await.map(|_| ())
    }

    async fn participants(&self, session: &SessionId) -> ApiResult<Vec<Participant>> {
        let url = self.session_endpoint(session, &["participants"]);
        Ok(match self.get_json::<ParticipantsBody>(url).await? {
            ParticipantsBody::Bare(list) => list,
            ParticipantsBody::Wrapped { participants } => participants,
        })
    }

    async fn form_state(&self, session: &SessionId) -> ApiResult<FormSnapshot> {
        let url = self.session_endpoint(session, &["form"]);
        self.get_json(url).await
    }

    async fn patch_field(
        &self,
        session: &SessionId,
        key: &FieldKey,
        value: &Value,
        client_timestamp: DateTime<Utc>,
    ) -> ApiResult<()> {
        let url = self.session_endpoint(session, &["form", key.as_str()]);
        let body = serde_json::to_value(PatchBody {
            value,
            client_timestamp,
        })
        .map_err(|e| ApiError::Decode(e.to_string()))?;
        self.send(Method::PATCH, url, Some(body)).await.map(|_| ())
    }
}

#[async_trait]
impl ReferenceApi for HttpSessionApi {
    async fn reference_list(&self, category: ReferenceCategory) -> ApiResult<Value> {
        let url = self.endpoint(&["api", "reference", category.as_str()]);
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        let api = HttpSessionApi::new("https://cases.example.org/", None).unwrap();
        let session = SessionId::new("2026/0042");

        assert_eq!(
            api.session_endpoint(&session, &["join"]).as_str(),
            "https://cases.example.org/api/cases/2026%2F0042/session/join"
        );
        assert_eq!(
            api.session_endpoint(&session, &["form", FieldKey::HeartRate.as_str()])
                .as_str(),
            "https://cases.example.org/api/cases/2026%2F0042/session/form/heart_rate"
        );
        assert_eq!(
            api.endpoint(&["api", "reference", "hospitals"]).as_str(),
            "https://cases.example.org/api/reference/hospitals"
        );
    }

    #[test]
    fn test_base_path_is_kept() {
        let api = HttpSessionApi::new("http://localhost:8080/ems", None).unwrap();
        assert_eq!(
            api.endpoint(&["api", "reference", "users"]).as_str(),
            "http://localhost:8080/ems/api/reference/users"
        );
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(HttpSessionApi::new("not a url", None).is_err());
        assert!(HttpSessionApi::new("mailto:ops@example.org", None).is_err());
    }

    #[test]
    fn test_participants_body_shapes() {
        let wrapped: ParticipantsBody = serde_json::from_str(
            r#"{"participants": [{"user_id": "u1", "display_name": "Selin", "role": "nurse", "last_activity": "2026-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();
        assert!(matches!(wrapped, ParticipantsBody::Wrapped { participants } if participants.len() == 1));

        let bare: ParticipantsBody = serde_json::from_str("[]").unwrap();
        assert!(matches!(bare, ParticipantsBody::Bare(list) if list.is_empty()));
    }
}
