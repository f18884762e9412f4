//! Event Dispatcher - fans an event out to the enabled integrations.
//!
//! The [`Dispatcher`] walks the registry in name order and hands the event
//! to every enabled integration, one at a time:
//!
//! ```text
//! Event (kind: track)
//!     │
//!     ▼
//! ┌──────────────────────────────────────────────┐
//! │            DISPATCHER                        │
//! │                                              │
//! │  drift     enabled?  YES -> track()  ok      │
//! │  drip      enabled?  YES -> track()  503     │
//! │                               retry  ok      │
//! │  intercom  enabled?  NO  -> skipped          │
//! │  mixpanel  enabled?  YES -> track()  422     │
//! │                               abort          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Failure Handling
//!
//! - Transient errors are retried according to the [`RetryPolicy`]
//! - The first unrecoverable error (or exhausted retries) aborts the whole
//!   dispatch: integrations later in the order are not attempted
//!
//! A caller therefore always gets one definitive outcome per event.

use crate::event::Event;
use crate::integrations::{Integration, IntegrationError};
use crate::registry::Registry;
use crate::retry::{RetryFailure, RetryPolicy};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum DispatchError {
    /// An integration failed for good; later integrations were skipped
    #[error("integration '{integration}' failed after {attempts} attempt(s): {source}")]
    Integration {
        integration: String,
        attempts: u32,
        #[source]
        source: IntegrationError,
    },
}

impl DispatchError {
    /// Name of the failing integration.
    pub fn integration(&self) -> &str {
        match self {
            Self::Integration { integration, .. } => integration,
        }
    }

    /// The error returned by the integration on its last attempt.
    pub fn cause(&self) -> &IntegrationError {
        match self {
            Self::Integration { source, .. } => source,
        }
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Integrations that accepted the event, in dispatch order
    pub delivered: Vec<String>,

    /// Integrations skipped because they are not enabled
    pub skipped: Vec<String>,
}

/// Delivers events to every enabled integration in the registry.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatch an event, stopping at the first unrecoverable failure.
    pub async fn dispatch(&self, event: &Event) -> Result<DispatchReport, DispatchError> {
        let kind = event.kind();
        let mut report = DispatchReport::default();

        debug!(kind = %kind, user_id = %event.user_id(), "Dispatching event");

        for name in self.registry.list() {
            // The registry lock is released before any destination call.
            let Some(integration) = self.registry.get(&name) else {
                continue;
            };

            if !integration.enabled() {
                debug!(integration = %name, "Integration not enabled, skipping");
                report.skipped.push(name);
                continue;
            }

            info!(integration = %name, kind = %kind, "Forwarding {} to {}", kind, name);

            match self.retry.run(|| deliver(integration.as_ref(), event)).await {
                Ok(attempts) => {
                    debug!(integration = %name, attempts, "Integration accepted event");
                    report.delivered.push(name);
                }
                Err(RetryFailure { error, attempts }) => {
                    error!(
                        integration = %name,
                        event = ?event,
                        error = %error,
                        attempts,
                        "Fatal error during {}",
                        kind
                    );
                    return Err(DispatchError::Integration {
                        integration: name,
                        attempts,
                        source: error,
                    });
                }
            }
        }

        info!(
            kind = %kind,
            delivered = report.delivered.len(),
            skipped = report.skipped.len(),
            "Event dispatched"
        );

        Ok(report)
    }
}

/// Call the capability matching the event kind.
async fn deliver(integration: &dyn Integration, event: &Event) -> Result<(), IntegrationError> {
    match event {
        Event::Identification(identification) => integration.identify(identification).await,
        Event::Action(action) => integration.track(action).await,
        Event::PageView(page) => integration.page(page).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, EventKind, Identification, PageView};
    use crate::integrations::testing::FakeIntegration;
    use crate::integrations::Keen;

    fn action() -> Event {
        Action::new("something.created", "123", 12345678).into()
    }

    fn unavailable() -> IntegrationError {
        IntegrationError::Unavailable("503".into())
    }

    fn dispatcher(registry: Registry, retry: RetryPolicy) -> Dispatcher {
        Dispatcher::new(Arc::new(registry), retry)
    }

    #[tokio::test]
    async fn test_no_integrations() {
        let dispatcher = dispatcher(Registry::new(), RetryPolicy::none());
        let report = dispatcher.dispatch(&action()).await.unwrap();
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_disabled_integrations_are_not_contacted() {
        let disabled = Arc::new(FakeIntegration::working().disabled());
        let registry = Registry::new();
        registry.register("a", disabled.clone());
        registry.register("keen", Arc::new(Keen));

        let report = dispatcher(registry, RetryPolicy::none())
            .dispatch(&action())
            .await
            .unwrap();

        assert!(report.delivered.is_empty());
        assert_eq!(report.skipped, vec!["a", "keen"]);
        assert_eq!(disabled.calls(), 0);
    }

    #[tokio::test]
    async fn test_each_kind_reaches_matching_capability() {
        let fake = Arc::new(FakeIntegration::working());
        let registry = Registry::new();
        registry.register("fake", fake.clone());
        let dispatcher = dispatcher(registry, RetryPolicy::none());

        let events: Vec<Event> = vec![
            Identification::new("1", 2).into(),
            Action::new("a", "1", 2).into(),
            PageView::new("p", "https://example.com", "1", 2).into(),
        ];
        for event in &events {
            dispatcher.dispatch(event).await.unwrap();
        }

        let kinds: Vec<EventKind> = fake.events().iter().map(Event::kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Identification, EventKind::Action, EventKind::PageView]
        );
    }

    #[tokio::test]
    async fn test_first_failure_aborts_dispatch() {
        let failing = Arc::new(FakeIntegration::failing(|| {
            IntegrationError::Failed("some random error".into())
        }));
        let working = Arc::new(FakeIntegration::working());

        let registry = Registry::new();
        // Registered out of order on purpose: dispatch order is by name.
        registry.register("b-working", working.clone());
        registry.register("a-failing", failing.clone());

        let error = dispatcher(registry, RetryPolicy::new(3))
            .dispatch(&action())
            .await
            .unwrap_err();

        assert_eq!(error.integration(), "a-failing");
        assert_eq!(error.cause().to_string(), "some random error");
        assert_eq!(failing.calls(), 1);
        assert_eq!(working.calls(), 0);
    }

    #[tokio::test]
    async fn test_integrations_before_the_failure_are_delivered() {
        let working = Arc::new(FakeIntegration::working());
        let failing = Arc::new(FakeIntegration::failing(|| {
            IntegrationError::Unsupported(EventKind::Action)
        }));

        let registry = Registry::new();
        registry.register("a-working", working.clone());
        registry.register("b-failing", failing.clone());

        let error = dispatcher(registry, RetryPolicy::new(3))
            .dispatch(&action())
            .await
            .unwrap_err();

        assert_eq!(error.integration(), "b-failing");
        assert_eq!(working.calls(), 1);
        // Unsupported capability is never retried
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let flaky = Arc::new(FakeIntegration::flaky(2, unavailable));
        let registry = Registry::new();
        registry.register("flaky", flaky.clone());

        let report = dispatcher(registry, RetryPolicy::new(2))
            .dispatch(&action())
            .await
            .unwrap();

        assert_eq!(report.delivered, vec!["flaky"]);
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_abort() {
        let flaky = Arc::new(FakeIntegration::flaky(5, unavailable));
        let later = Arc::new(FakeIntegration::working());
        let registry = Registry::new();
        registry.register("flaky", flaky.clone());
        registry.register("later", later.clone());

        let error = dispatcher(registry, RetryPolicy::new(2))
            .dispatch(&action())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            DispatchError::Integration { attempts: 3, .. }
        ));
        assert_eq!(flaky.calls(), 3);
        assert_eq!(later.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_without_retries_is_fatal() {
        let flaky = Arc::new(FakeIntegration::flaky(1, unavailable));
        let registry = Registry::new();
        registry.register("flaky", flaky.clone());

        let error = dispatcher(registry, RetryPolicy::none())
            .dispatch(&action())
            .await
            .unwrap_err();

        assert_eq!(error.integration(), "flaky");
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn test_enabled_is_checked_on_every_dispatch() {
        let fake = Arc::new(FakeIntegration::working().disabled());
        let registry = Registry::new();
        registry.register("fake", fake.clone());
        let dispatcher = dispatcher(registry, RetryPolicy::none());

        dispatcher.dispatch(&action()).await.unwrap();
        assert_eq!(fake.calls(), 0);

        fake.set_enabled(true);
        let report = dispatcher.dispatch(&action()).await.unwrap();
        assert_eq!(report.delivered, vec!["fake"]);
        assert_eq!(fake.calls(), 1);
    }
}
