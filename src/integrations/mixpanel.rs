//! Mixpanel integration.
//!
//! Enabled when `MIXPANEL_TOKEN` is set. Mixpanel takes its payload as a
//! base64 encoded `data` query parameter on a GET request:
//!
//! ```text
//! GET http://api.mixpanel.com/track?data=<base64(json)>
//! ```
//!
//! Events older than five days must go through `import` (which also wants
//! the token as `api_key`), and events older than five years are refused
//! outright. Mixpanel answers `200` with a body of `0` when it drops a
//! payload; that is reported as a rejection.

use super::{
    with_received_at, ApiRequest, Credential, Integration, IntegrationError, Transport,
    TIMESTAMP_ATTRIBUTE,
};
use crate::event::{Action, Identification, PageView, Properties, PropertyValue};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Months, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

pub const NAME: &str = "mixpanel";

pub const DEFAULT_BASE_URL: &str = "http://api.mixpanel.com/";

pub const TOKEN_VAR: &str = "MIXPANEL_TOKEN";

#[derive(Debug, Serialize)]
struct Profile<'a> {
    #[serde(rename = "$set")]
    set: Properties,
    #[serde(rename = "$distinct_id")]
    distinct_id: &'a str,
    #[serde(rename = "$token")]
    token: String,
    #[serde(rename = "$name")]
    name: String,
    #[serde(rename = "$email")]
    email: String,
}

#[derive(Debug, Serialize)]
struct MixpanelEvent<'a> {
    event: &'a str,
    properties: Properties,
}

pub struct Mixpanel {
    token: Credential,
    api: Arc<dyn Transport>,
}

impl Mixpanel {
    pub fn new(token: Credential, api: Arc<dyn Transport>) -> Self {
        Self { token, api }
    }

    fn token(&self) -> String {
        self.token.get().unwrap_or_default()
    }

    async fn send(&self, endpoint: &str, payload: &impl Serialize) -> Result<(), IntegrationError> {
        let data = STANDARD.encode(serde_json::to_vec(payload)?);
        let mut params = vec![("data".to_string(), data)];
        if endpoint == "import" {
            params.push(("api_key".to_string(), self.token()));
        }

        let response = self
            .api
            .send(ApiRequest::get_query(endpoint, params))
            .await
            .map_err(|e| {
                error!(error = %e, endpoint = %endpoint, "Error sending request to Mixpanel");
                e
            })?;

        if response.body.trim() == "0" {
            error!(endpoint = %endpoint, "Mixpanel dropped the payload");
            return Err(IntegrationError::Rejected {
                status: response.status,
                body: response.body,
            });
        }

        info!(endpoint = %endpoint, status = response.status, "Sent to Mixpanel");
        Ok(())
    }
}

/// Remove a string trait, returning its value.
fn take_string(properties: &mut Properties, key: &str) -> String {
    match properties.remove(key) {
        Some(PropertyValue::String(s)) => s,
        Some(other) => {
            // Not a string: leave it where it was.
            properties.insert(key.to_string(), other);
            String::new()
        }
        None => String::new(),
    }
}

#[async_trait]
impl Integration for Mixpanel {
    fn enabled(&self) -> bool {
        self.token.is_set()
    }

    async fn identify(&self, identification: &Identification) -> Result<(), IntegrationError> {
        let mut set = with_received_at(&identification.user_traits, identification.received_at);
        set.insert(
            TIMESTAMP_ATTRIBUTE.to_string(),
            PropertyValue::from(identification.timestamp),
        );
        let email = take_string(&mut set, "email");
        let name = take_string(&mut set, "name");

        let profile = Profile {
            set,
            distinct_id: &identification.user_id,
            token: self.token(),
            name,
            email,
        };
        self.send("engage", &profile).await
    }

    async fn track(&self, action: &Action) -> Result<(), IntegrationError> {
        let now = Utc::now();
        let five_years_ago = now
            .checked_sub_months(Months::new(60))
            .map(|t| t.timestamp())
            .unwrap_or(i64::MIN);
        if action.timestamp < five_years_ago {
            error!(timestamp = action.timestamp, "Mixpanel won't accept events older than 5 years");
            return Err(IntegrationError::Rejected {
                status: 0,
                body: "Mixpanel doesn't support importing events with a timestamp more than 5 years ago".into(),
            });
        }

        let mut properties = with_received_at(&action.properties, action.received_at);
        properties.insert("time".to_string(), PropertyValue::from(action.timestamp));
        properties.insert("token".to_string(), PropertyValue::from(self.token()));
        properties.insert(
            "distinct_id".to_string(),
            PropertyValue::from(action.user_id.as_str()),
        );
        properties.remove("email");

        let five_days_ago = (now - Duration::days(5)).timestamp();
        let endpoint = if action.timestamp > five_days_ago {
            "track"
        } else {
            "import"
        };

        let event = MixpanelEvent {
            event: &action.name,
            properties,
        };
        self.send(endpoint, &event).await
    }

    async fn page(&self, page: &PageView) -> Result<(), IntegrationError> {
        // No page API: forward as an action named after the page.
        let action = Action {
            name: page.name.clone(),
            user_id: page.user_id.clone(),
            properties: page.properties.clone(),
            timestamp: page.timestamp,
            received_at: page.received_at,
        }
        .with_property("url", page.url.as_str())
        .with_property("event", "page");

        self.track(&action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::transport::testing::RecordingTransport;
    use crate::integrations::{ApiBody, ApiResponse};
    use serde_json::Value;

    fn mixpanel(api: Arc<RecordingTransport>) -> Mixpanel {
        Mixpanel::new(Credential::Fixed("tok".into()), api)
    }

    /// Decode the `data` parameter of a recorded request.
    fn decoded_data(body: &ApiBody) -> Value {
        let ApiBody::Query(params) = body else {
            panic!("expected query parameters");
        };
        let (_, data) = params
            .iter()
            .find(|(k, _)| k == "data")
            .expect("no data parameter");
        serde_json::from_slice(&STANDARD.decode(data).unwrap()).unwrap()
    }

    #[test]
    fn test_enabled_with_token() {
        let api = Arc::new(RecordingTransport::default());
        assert!(mixpanel(api.clone()).enabled());
        assert!(!Mixpanel::new(Credential::Fixed(String::new()), api).enabled());
    }

    #[tokio::test]
    async fn test_identify() {
        let api = Arc::new(RecordingTransport::default());
        let identification = Identification {
            received_at: 8765432,
            ..Identification::new("123", 1234567)
                .with_trait("email", "john@example.com")
                .with_trait("name", "John")
                .with_trait("plan", "pro")
        };

        mixpanel(api.clone()).identify(&identification).await.unwrap();

        let request = api.last();
        assert_eq!(request.method, reqwest::Method::GET);
        assert_eq!(request.endpoint, "engage");
        assert_eq!(
            decoded_data(&request.body),
            serde_json::json!({
                "$set": {
                    "plan": "pro",
                    "forwardlyticsReceivedAt": 8765432,
                    "forwardlyticsTimestamp": 1234567
                },
                "$distinct_id": "123",
                "$token": "tok",
                "$name": "John",
                "$email": "john@example.com"
            })
        );
    }

    #[tokio::test]
    async fn test_recent_track_uses_track_endpoint() {
        let api = Arc::new(RecordingTransport::default());
        let now = Utc::now().timestamp();
        let action = Action {
            received_at: now,
            ..Action::new("invoice.paid", "123", now).with_property("email", "john@example.com")
        };

        mixpanel(api.clone()).track(&action).await.unwrap();

        let request = api.last();
        assert_eq!(request.endpoint, "track");
        let data = decoded_data(&request.body);
        assert_eq!(data["event"], "invoice.paid");
        assert_eq!(data["properties"]["distinct_id"], "123");
        assert_eq!(data["properties"]["token"], "tok");
        assert_eq!(data["properties"]["time"], now);
        assert!(data["properties"].get("email").is_none());
    }

    #[tokio::test]
    async fn test_old_track_uses_import_endpoint() {
        let api = Arc::new(RecordingTransport::default());
        let ten_days_ago = Utc::now().timestamp() - 10 * 24 * 3600;

        mixpanel(api.clone())
            .track(&Action::new("a", "1", ten_days_ago))
            .await
            .unwrap();

        let request = api.last();
        assert_eq!(request.endpoint, "import");
        let ApiBody::Query(params) = request.body else {
            panic!("expected query parameters");
        };
        assert!(params.contains(&("api_key".to_string(), "tok".to_string())));
    }

    #[tokio::test]
    async fn test_ancient_track_is_rejected() {
        let api = Arc::new(RecordingTransport::default());
        let error = mixpanel(api.clone())
            .track(&Action::new("a", "1", 12345678))
            .await
            .unwrap_err();

        assert!(!error.is_retryable());
        assert!(api.requests().is_empty());
    }

    #[tokio::test]
    async fn test_zero_body_is_a_rejection() {
        let api = Arc::new(RecordingTransport::default());
        api.respond_with(Ok(ApiResponse {
            status: 200,
            body: "0".into(),
        }));

        let error = mixpanel(api)
            .track(&Action::new("a", "1", Utc::now().timestamp()))
            .await
            .unwrap_err();
        assert!(matches!(error, IntegrationError::Rejected { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_page_is_forwarded_as_track() {
        let api = Arc::new(RecordingTransport::default());
        let now = Utc::now().timestamp();

        mixpanel(api.clone())
            .page(&PageView::new("Pricing", "https://example.com/pricing", "123", now))
            .await
            .unwrap();

        let data = decoded_data(&api.last().body);
        assert_eq!(data["event"], "Pricing");
        assert_eq!(data["properties"]["url"], "https://example.com/pricing");
        assert_eq!(data["properties"]["event"], "page");
    }
}
