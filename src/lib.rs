//! # Forwardlytics
//!
//! Receives analytics events over HTTP and forwards each one, in real time,
//! to every configured analytics or CRM destination.
//!
//! ## Architecture
//!
//! ```text
//! Client -> HTTP API -> Validator -> Dispatcher -> Integrations -> Destinations
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Identification, Action and PageView events and their validation
//! - [`integrations`]: Integration trait and the built-in destinations
//! - [`registry`]: Name-keyed catalogue of integrations
//! - [`dispatcher`]: Sequential fan-out with abort on first failure
//! - [`retry`]: Backoff policy for transient destination errors
//! - [`server`]: HTTP endpoints
//! - [`config`]: TOML and environment configuration
//! - [`shutdown`]: Graceful shutdown signal

pub mod config;
pub mod dispatcher;
pub mod event;
pub mod integrations;
pub mod registry;
pub mod retry;
pub mod server;
pub mod shutdown;

// Re-export commonly used types at crate root
pub use config::{ConfigError, ForwardlyticsConfig};
pub use dispatcher::{DispatchError, DispatchReport, Dispatcher};
pub use event::{Action, Event, EventKind, Identification, PageView, Properties, PropertyValue};
pub use integrations::{Integration, IntegrationError};
pub use registry::{Registry, RegistryError};
pub use retry::RetryPolicy;
pub use server::{app, AppState};
pub use shutdown::ShutdownSignal;
