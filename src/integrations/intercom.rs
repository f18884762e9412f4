//! Intercom integration.
//!
//! Enabled when `INTERCOM_APP_ID` and `INTERCOM_API_KEY` are set. Only
//! identifications are forwarded: they upsert the Intercom user keyed on
//! `user_id`. Well-known traits (`email`, `name`, `createdAt`) are lifted
//! into Intercom's own fields; every trait is also sent as a custom
//! attribute.

use super::{with_received_at, ApiRequest, Credential, Integration, IntegrationError, Transport};
use crate::event::{Action, EventKind, Identification, PageView, Properties, PropertyValue};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

pub const NAME: &str = "intercom";

pub const DEFAULT_BASE_URL: &str = "https://api.intercom.io/";

pub const APP_ID_VAR: &str = "INTERCOM_APP_ID";

pub const API_KEY_VAR: &str = "INTERCOM_API_KEY";

#[derive(Debug, Serialize)]
struct User<'a> {
    user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    signed_up_at: Option<i64>,
    custom_attributes: Properties,
}

pub struct Intercom {
    app_id: Credential,
    api_key: Credential,
    api: Arc<dyn Transport>,
}

impl Intercom {
    /// The transport is expected to authenticate with `app_id:api_key`.
    pub fn new(app_id: Credential, api_key: Credential, api: Arc<dyn Transport>) -> Self {
        Self {
            app_id,
            api_key,
            api,
        }
    }
}

#[async_trait]
impl Integration for Intercom {
    fn enabled(&self) -> bool {
        self.api_key.is_set() && self.app_id.is_set()
    }

    async fn identify(&self, identification: &Identification) -> Result<(), IntegrationError> {
        let traits = &identification.user_traits;
        let created_at = traits.get("createdAt").and_then(PropertyValue::as_i64);

        let user = User {
            user_id: &identification.user_id,
            email: traits.get("email").and_then(PropertyValue::as_str),
            name: traits.get("name").and_then(PropertyValue::as_str),
            created_at,
            signed_up_at: created_at,
            custom_attributes: with_received_at(traits, identification.received_at),
        };

        let payload = serde_json::to_value(&user)?;
        match self.api.send(ApiRequest::post_json("users", payload)).await {
            Ok(_) => {
                info!(user_id = %identification.user_id, "User saved on Intercom");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, user_id = %identification.user_id, "Error while saving on Intercom");
                Err(e)
            }
        }
    }

    async fn track(&self, _action: &Action) -> Result<(), IntegrationError> {
        Err(IntegrationError::Unsupported(EventKind::Action))
    }

    async fn page(&self, _page: &PageView) -> Result<(), IntegrationError> {
        Err(IntegrationError::Unsupported(EventKind::PageView))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::transport::testing::RecordingTransport;
    use crate::integrations::ApiBody;
    use serde_json::json;

    fn intercom(api: Arc<RecordingTransport>) -> Intercom {
        Intercom::new(
            Credential::Fixed("app".into()),
            Credential::Fixed("key".into()),
            api,
        )
    }

    #[test]
    fn test_enabled_requires_both_credentials() {
        let api = Arc::new(RecordingTransport::default());
        assert!(intercom(api.clone()).enabled());
        assert!(!Intercom::new(
            Credential::Fixed("app".into()),
            Credential::Fixed(String::new()),
            api
        )
        .enabled());
    }

    #[tokio::test]
    async fn test_identify_lifts_known_traits() {
        let api = Arc::new(RecordingTransport::default());
        let identification = Identification {
            received_at: 99,
            ..Identification::new("123", 1)
                .with_trait("email", "john@example.com")
                .with_trait("name", "John")
                .with_trait("createdAt", 1_500_000_000)
        };

        intercom(api.clone()).identify(&identification).await.unwrap();

        let request = api.last();
        assert_eq!(request.endpoint, "users");
        assert_eq!(
            request.body,
            ApiBody::Json(json!({
                "user_id": "123",
                "email": "john@example.com",
                "name": "John",
                "created_at": 1_500_000_000,
                "signed_up_at": 1_500_000_000,
                "custom_attributes": {
                    "createdAt": 1_500_000_000,
                    "email": "john@example.com",
                    "forwardlyticsReceivedAt": 99,
                    "name": "John"
                }
            }))
        );
    }

    #[tokio::test]
    async fn test_identify_without_known_traits() {
        let api = Arc::new(RecordingTransport::default());
        intercom(api.clone())
            .identify(&Identification::new("123", 1))
            .await
            .unwrap();

        let ApiBody::Json(body) = api.last().body else {
            panic!("expected a JSON body");
        };
        assert!(body.get("email").is_none());
        assert!(body.get("created_at").is_none());
    }

    #[tokio::test]
    async fn test_track_and_page_are_unsupported() {
        let api = Arc::new(RecordingTransport::default());
        let intercom = intercom(api.clone());

        assert!(matches!(
            intercom.track(&Action::new("a", "1", 2)).await,
            Err(IntegrationError::Unsupported(EventKind::Action))
        ));
        assert!(matches!(
            intercom.page(&PageView::new("p", "u", "1", 2)).await,
            Err(IntegrationError::Unsupported(EventKind::PageView))
        ));
        assert!(api.requests().is_empty());
    }
}
