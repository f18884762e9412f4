//! Drift integration.
//!
//! Enabled when `DRIFT_ORG_ID` is set. Identifications go to `identify`,
//! actions and page views to `track` (page views as a `page` event).

use super::{
    with_received_at, ApiRequest, Credential, Integration, IntegrationError, Transport,
    TIMESTAMP_ATTRIBUTE,
};
use crate::event::{Action, Identification, PageView, Properties, PropertyValue};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

pub const NAME: &str = "drift";

pub const DEFAULT_BASE_URL: &str = "https://event.api.drift.com/";

pub const ORG_ID_VAR: &str = "DRIFT_ORG_ID";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Subscriber<'a> {
    attributes: Properties,
    created_at: i64,
    user_id: &'a str,
    org_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DriftEvent<'a> {
    org_id: String,
    user_id: &'a str,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    created_at: i64,
    attributes: Properties,
}

pub struct Drift {
    org_id: Credential,
    api: Arc<dyn Transport>,
}

impl Drift {
    pub fn new(org_id: Credential, api: Arc<dyn Transport>) -> Self {
        Self { org_id, api }
    }

    fn org_id(&self) -> String {
        self.org_id.get().unwrap_or_default()
    }

    async fn send(&self, request: ApiRequest) -> Result<(), IntegrationError> {
        let endpoint = request.endpoint.clone();
        self.api.send(request).await.map(|_| ()).map_err(|e| {
            error!(error = %e, endpoint = %endpoint, "Error sending request to Drift");
            e
        })
    }
}

#[async_trait]
impl Integration for Drift {
    fn enabled(&self) -> bool {
        self.org_id.is_set()
    }

    async fn identify(&self, identification: &Identification) -> Result<(), IntegrationError> {
        let mut attributes =
            with_received_at(&identification.user_traits, identification.received_at);
        attributes.insert(
            TIMESTAMP_ATTRIBUTE.to_string(),
            PropertyValue::from(identification.timestamp),
        );

        let subscriber = Subscriber {
            attributes,
            created_at: identification.timestamp,
            user_id: &identification.user_id,
            org_id: self.org_id(),
        };
        debug!(user_id = %identification.user_id, "Sending identify to Drift");

        let payload = serde_json::to_value(&subscriber)?;
        self.send(ApiRequest::post_json("identify", payload)).await
    }

    async fn track(&self, action: &Action) -> Result<(), IntegrationError> {
        let event = DriftEvent {
            org_id: self.org_id(),
            user_id: &action.user_id,
            event: &action.name,
            url: None,
            created_at: action.timestamp,
            attributes: with_received_at(&action.properties, action.received_at),
        };

        let payload = serde_json::to_value(&event)?;
        self.send(ApiRequest::post_json("track", payload)).await
    }

    async fn page(&self, page: &PageView) -> Result<(), IntegrationError> {
        let mut attributes = with_received_at(&page.properties, page.received_at);
        attributes.insert("name".to_string(), PropertyValue::from(page.name.as_str()));

        let event = DriftEvent {
            org_id: self.org_id(),
            user_id: &page.user_id,
            event: "page",
            url: Some(&page.url),
            created_at: page.timestamp,
            attributes,
        };

        let payload = serde_json::to_value(&event)?;
        self.send(ApiRequest::post_json("track", payload)).await
    }
}
