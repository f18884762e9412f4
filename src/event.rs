//! Event types accepted by Forwardlytics.
//!
//! Three kinds of events flow through the system, each decoded from the JSON
//! body of its own endpoint:
//!
//! - [`Identification`] (`POST /identify`): associate traits with a user
//! - [`Action`] (`POST /track`): a named occurrence tied to a user
//! - [`PageView`] (`POST /page`): a page visit, carrying a URL
//!
//! # Example
//!
//! ```json
//! {
//!   "name": "invoice.paid",
//!   "userID": "123",
//!   "properties": { "amount": 97, "plan": { "tier": "pro" } },
//!   "timestamp": 1718000000
//! }
//! ```
//!
//! Missing or `null` string fields decode as empty and a missing or `null`
//! timestamp decodes as zero, so that [`Event::missing_fields`] (not the JSON
//! decoder) reports them. A `null` property bag is an empty one.
//! `receivedAt` is never read from the wire.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Number;
use std::collections::BTreeMap;
use std::fmt;

/// Open property bag attached to events.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Decode `null` as the type's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// A value inside a [`Properties`] bag.
///
/// Closed over the JSON shapes integrations know how to forward. `null` and
/// arrays are rejected at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(Number),
    String(String),
    Map(Properties),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Properties> for PropertyValue {
    fn from(value: Properties) -> Self {
        Self::Map(value)
    }
}

/// The three kinds of events, one per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Identification,
    Action,
    PageView,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Capability names, as seen by integrations.
        f.write_str(match self {
            Self::Identification => "identify",
            Self::Action => "track",
            Self::PageView => "page",
        })
    }
}

/// "Associate these traits with this user."
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identification {
    /// Stable user identifier. Never reassigned.
    #[serde(rename = "userID", deserialize_with = "null_as_default")]
    pub user_id: String,

    #[serde(rename = "userTraits", alias = "traits", deserialize_with = "null_as_default")]
    pub user_traits: Properties,

    /// Epoch seconds at which the identification happened (caller supplied)
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,

    /// Epoch seconds at which Forwardlytics received the request
    #[serde(rename = "receivedAt", skip_deserializing)]
    pub received_at: i64,
}

impl Identification {
    pub fn new(user_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            user_id: user_id.into(),
            timestamp,
            ..Self::default()
        }
    }

    /// Add a trait
    pub fn with_trait(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.user_traits.insert(key.into(), value.into());
        self
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.user_id.is_empty() {
            missing.push("userID");
        }
        if self.timestamp == 0 {
            missing.push("timestamp");
        }
        missing
    }
}

/// A named occurrence tied to a user (`/track`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Action {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,

    #[serde(rename = "userID", deserialize_with = "null_as_default")]
    pub user_id: String,

    #[serde(deserialize_with = "null_as_default")]
    pub properties: Properties,

    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,

    #[serde(rename = "receivedAt", skip_deserializing)]
    pub received_at: i64,
}

impl Action {
    pub fn new(name: impl Into<String>, user_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            user_id: user_id.into(),
            timestamp,
            ..Self::default()
        }
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.is_empty() {
            missing.push("name");
        }
        if self.user_id.is_empty() {
            missing.push("userID");
        }
        if self.timestamp == 0 {
            missing.push("timestamp");
        }
        missing
    }
}

/// A page visit (`/page`). `name` is the page name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageView {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,

    #[serde(deserialize_with = "null_as_default")]
    pub url: String,

    #[serde(rename = "userID", deserialize_with = "null_as_default")]
    pub user_id: String,

    #[serde(deserialize_with = "null_as_default")]
    pub properties: Properties,

    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,

    #[serde(rename = "receivedAt", skip_deserializing)]
    pub received_at: i64,
}

impl PageView {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        user_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            user_id: user_id.into(),
            timestamp,
            ..Self::default()
        }
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.is_empty() {
            missing.push("name");
        }
        if self.url.is_empty() {
            missing.push("url");
        }
        if self.user_id.is_empty() {
            missing.push("userID");
        }
        if self.timestamp == 0 {
            missing.push("timestamp");
        }
        missing
    }
}

/// An event received by Forwardlytics, built once per request.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Identification(Identification),
    Action(Action),
    PageView(PageView),
}

impl Event {
    /// Decode a request body of the given kind and stamp `receivedAt`.
    ///
    /// Any `receivedAt` present in the body is ignored.
    pub fn decode(kind: EventKind, body: &[u8], received_at: i64) -> Result<Self, serde_json::Error> {
        let event = match kind {
            EventKind::Identification => {
                let mut identification: Identification = serde_json::from_slice(body)?;
                identification.received_at = received_at;
                Self::Identification(identification)
            }
            EventKind::Action => {
                let mut action: Action = serde_json::from_slice(body)?;
                action.received_at = received_at;
                Self::Action(action)
            }
            EventKind::PageView => {
                let mut page: PageView = serde_json::from_slice(body)?;
                page.received_at = received_at;
                Self::PageView(page)
            }
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Identification(_) => EventKind::Identification,
            Self::Action(_) => EventKind::Action,
            Self::PageView(_) => EventKind::PageView,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Identification(i) => &i.user_id,
            Self::Action(a) => &a.user_id,
            Self::PageView(p) => &p.user_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Identification(i) => i.timestamp,
            Self::Action(a) => a.timestamp,
            Self::PageView(p) => p.timestamp,
        }
    }

    pub fn received_at(&self) -> i64 {
        match self {
            Self::Identification(i) => i.received_at,
            Self::Action(a) => a.received_at,
            Self::PageView(p) => p.received_at,
        }
    }

    /// Names of the required fields that are absent, in reporting order.
    ///
    /// Empty strings and a zero timestamp count as absent.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        match self {
            Self::Identification(i) => i.missing_fields(),
            Self::Action(a) => a.missing_fields(),
            Self::PageView(p) => p.missing_fields(),
        }
    }
}

/// Validate an event, returning the missing field names (empty when valid).
pub fn validate(event: &Event) -> Vec<&'static str> {
    event.missing_fields()
}

impl From<Identification> for Event {
    fn from(value: Identification) -> Self {
        Self::Identification(value)
    }
}

impl From<Action> for Event {
    fn from(value: Action) -> Self {
        Self::Action(value)
    }
}

impl From<PageView> for Event {
    fn from(value: PageView) -> Self {
        Self::PageView(value)
    }
}
