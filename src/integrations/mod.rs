//! Integration system for Forwardlytics.
//!
//! Integrations are the destinations events are relayed to. The
//! [`Integration`] trait is the capability set every destination implements:
//! one method per event kind, plus an [`Integration::enabled`] predicate.
//!
//! ## Built-in Integrations
//!
//! - [`Drift`]: identify, track and page
//! - [`Drip`]: identify, track and page (requires an `email` trait/property)
//! - [`Intercom`]: identify only
//! - [`Keen`]: placeholder, never enabled
//! - [`Mixpanel`]: identify, track and page
//!
//! ## Creating Custom Integrations
//!
//! ```rust,ignore
//! use forwardlytics::integrations::{Integration, IntegrationError};
//! use forwardlytics::event::{Action, EventKind, Identification, PageView};
//! use async_trait::async_trait;
//!
//! struct MyIntegration;
//!
//! #[async_trait]
//! impl Integration for MyIntegration {
//!     fn enabled(&self) -> bool {
//!         true
//!     }
//!
//!     async fn identify(&self, _: &Identification) -> Result<(), IntegrationError> {
//!         Ok(())
//!     }
//!
//!     async fn track(&self, _: &Action) -> Result<(), IntegrationError> {
//!         Ok(())
//!     }
//!
//!     async fn page(&self, _: &PageView) -> Result<(), IntegrationError> {
//!         Err(IntegrationError::Unsupported(EventKind::PageView))
//!     }
//! }
//! ```

pub mod drift;
pub mod drip;
pub mod intercom;
pub mod keen;
pub mod mixpanel;
pub mod transport;

use crate::event::{Action, EventKind, Identification, PageView, Properties, PropertyValue};
use async_trait::async_trait;
use std::env;
use thiserror::Error;
use tracing::warn;

pub use drift::Drift;
pub use drip::Drip;
pub use intercom::Intercom;
pub use keen::Keen;
pub use mixpanel::Mixpanel;
pub use transport::{ApiBody, ApiRequest, ApiResponse, Auth, HttpTransport, Transport};

/// Attribute added to every forwarded payload, holding `receivedAt`.
pub const RECEIVED_AT_ATTRIBUTE: &str = "forwardlyticsReceivedAt";

/// Attribute added to identification payloads, holding `timestamp`.
pub const TIMESTAMP_ATTRIBUTE: &str = "forwardlyticsTimestamp";

/// Errors returned by integrations.
///
/// The dispatcher only needs to know whether an error is worth retrying,
/// see [`IntegrationError::is_retryable`].
#[derive(Error, Debug)]
pub enum IntegrationError {
    /// The destination is temporarily unavailable (5xx, 429, ...)
    #[error("destination unavailable: {0}")]
    Unavailable(String),

    /// The destination refused the request for good
    #[error("destination rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// A field this destination requires is absent from the event
    #[error("{field} is required for doing a {integration} request")]
    MissingField {
        integration: &'static str,
        field: &'static str,
    },

    /// The integration has no capability for this kind of event
    #[error("{0} is not supported by this integration")]
    Unsupported(EventKind),

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic integration failure
    #[error("{0}")]
    Failed(String),
}

impl IntegrationError {
    /// Transient failures: the same call may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// The capability set of a destination.
///
/// Every method is required. Integrations that cannot handle a kind of
/// event return [`IntegrationError::Unsupported`].
///
/// # Thread Safety
///
/// Integrations are shared across request tasks and must be `Send + Sync`.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Whether the destination credentials are configured.
    ///
    /// Evaluated on every dispatch, so implementations must not cache it.
    fn enabled(&self) -> bool;

    async fn identify(&self, identification: &Identification) -> Result<(), IntegrationError>;

    async fn track(&self, action: &Action) -> Result<(), IntegrationError>;

    async fn page(&self, page: &PageView) -> Result<(), IntegrationError>;
}

/// A destination credential.
///
/// `Env` credentials are read from the environment each time they are
/// looked up, so a long-running process picks up changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Fixed(String),
    Env(String),
}

impl Credential {
    /// Use the configured value if there is one, else the environment variable.
    ///
    /// Values still holding a `${VAR}` placeholder are treated as unset.
    pub fn from_config(value: Option<&str>, var: &str) -> Self {
        match value {
            Some(v) if v.contains("${") => {
                warn!(
                    var = %var,
                    "Credential contains unsubstituted placeholder, reading {} instead",
                    var
                );
                Self::Env(var.to_string())
            }
            Some(v) if !v.is_empty() => Self::Fixed(v.to_string()),
            _ => Self::Env(var.to_string()),
        }
    }

    /// Current value, `None` when empty or unset.
    pub fn get(&self) -> Option<String> {
        let value = match self {
            Self::Fixed(v) => v.clone(),
            Self::Env(var) => env::var(var).ok()?,
        };
        (!value.is_empty()).then_some(value)
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

/// Copy a property bag and stamp the `receivedAt` attribute on it.
pub(crate) fn with_received_at(properties: &Properties, received_at: i64) -> Properties {
    let mut attributes = properties.clone();
    attributes.insert(
        RECEIVED_AT_ATTRIBUTE.to_string(),
        PropertyValue::from(received_at),
    );
    attributes
}
