//! Drip integration.
//!
//! Enabled when both `DRIP_API_TOKEN` and `DRIP_ACCOUNT_ID` are set. Drip
//! keys everything on email, so events without an `email` trait/property
//! fail with [`IntegrationError::MissingField`].
//!
//! Page views are sent as a `Page visited` event.

use super::{
    with_received_at, ApiRequest, Credential, Integration, IntegrationError, Transport,
    TIMESTAMP_ATTRIBUTE,
};
use crate::event::{Action, Identification, PageView, Properties, PropertyValue};
use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

pub const NAME: &str = "drip";

pub const DEFAULT_BASE_URL: &str = "https://api.getdrip.com/v2/";

pub const API_TOKEN_VAR: &str = "DRIP_API_TOKEN";

pub const ACCOUNT_ID_VAR: &str = "DRIP_ACCOUNT_ID";

const PAGE_ACTION: &str = "Page visited";

#[derive(Debug, Serialize)]
struct Subscriber<'a> {
    custom_fields: Properties,
    email: &'a str,
    user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct DripEvent<'a> {
    action: &'a str,
    email: &'a str,
    occurred_at: String,
    properties: Properties,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    attribute: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrors {
    errors: Vec<ApiErrorDetail>,
}

pub struct Drip {
    api_token: Credential,
    account_id: Credential,
    api: Arc<dyn Transport>,
}

impl Drip {
    /// The transport is expected to authenticate with the API token and to
    /// point at [`DEFAULT_BASE_URL`]; the account id is part of every endpoint.
    pub fn new(api_token: Credential, account_id: Credential, api: Arc<dyn Transport>) -> Self {
        Self {
            api_token,
            account_id,
            api,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.account_id.get().unwrap_or_default(), path)
    }

    async fn send(&self, path: &str, payload: serde_json::Value) -> Result<(), IntegrationError> {
        let request = ApiRequest::post_json(self.endpoint(path), payload);
        match self.api.send(request).await {
            Ok(_) => Ok(()),
            Err(IntegrationError::Rejected { status, body }) => {
                let body = describe_errors(&body).unwrap_or(body);
                error!(status, endpoint = %path, "{}", body);
                Err(IntegrationError::Rejected { status, body })
            }
            Err(e) => {
                error!(error = %e, endpoint = %path, "Error sending request to Drip");
                Err(e)
            }
        }
    }
}

/// Drip reports failures as `{"errors": [{code, attribute, message}]}`.
fn describe_errors(body: &str) -> Option<String> {
    let parsed: ApiErrors = serde_json::from_str(body).ok()?;
    let first = parsed.errors.first()?;
    Some(format!(
        "Drip API returned errors: [{}] {} (on attribute: {})",
        first.code, first.message, first.attribute
    ))
}

fn email(properties: &Properties) -> Result<&str, IntegrationError> {
    properties
        .get("email")
        .and_then(PropertyValue::as_str)
        .ok_or(IntegrationError::MissingField {
            integration: NAME,
            field: "Email",
        })
}

fn occurred_at(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S%z").to_string())
        .unwrap_or_default()
}

#[async_trait]
impl Integration for Drip {
    fn enabled(&self) -> bool {
        self.api_token.is_set() && self.account_id.is_set()
    }

    async fn identify(&self, identification: &Identification) -> Result<(), IntegrationError> {
        let email = email(&identification.user_traits)?;

        let mut custom_fields =
            with_received_at(&identification.user_traits, identification.received_at);
        custom_fields.insert(
            TIMESTAMP_ATTRIBUTE.to_string(),
            PropertyValue::from(identification.timestamp),
        );

        let subscriber = Subscriber {
            custom_fields,
            email,
            user_id: &identification.user_id,
        };
        self.send("subscribers", json!({ "subscribers": [subscriber] }))
            .await
    }

    async fn track(&self, action: &Action) -> Result<(), IntegrationError> {
        let email = email(&action.properties)?;

        let event = DripEvent {
            action: &action.name,
            email,
            occurred_at: occurred_at(action.timestamp),
            properties: with_received_at(&action.properties, action.received_at),
        };
        self.send("events", json!({ "events": [event] })).await
    }

    async fn page(&self, page: &PageView) -> Result<(), IntegrationError> {
        let email = email(&page.properties)?;

        let mut properties = with_received_at(&page.properties, page.received_at);
        properties.insert("url".to_string(), PropertyValue::from(page.url.as_str()));
        properties.insert("pagename".to_string(), PropertyValue::from(page.name.as_str()));

        let event = DripEvent {
            action: PAGE_ACTION,
            email,
            occurred_at: occurred_at(page.timestamp),
            properties,
        };
        self.send("events", json!({ "events": [event] })).await
    }
}
