//! Keen.io integration.
//!
//! Not wired to the Keen API yet: it is never enabled, and identifications
//! are only logged if it is called directly.

use super::{Integration, IntegrationError};
use crate::event::{Action, EventKind, Identification, PageView};
use async_trait::async_trait;
use tracing::info;

pub const NAME: &str = "keen";

#[derive(Debug, Clone, Default)]
pub struct Keen;

#[async_trait]
impl Integration for Keen {
    fn enabled(&self) -> bool {
        false
    }

    async fn identify(&self, identification: &Identification) -> Result<(), IntegrationError> {
        info!(
            user_id = %identification.user_id,
            "Keen identify is not implemented, dropping identification"
        );
        Ok(())
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

    #[tokio::test]
    async fn test_keen_is_a_disabled_placeholder() {
        assert!(!Keen.enabled());
        assert!(Keen.identify(&Identification::new("1", 2)).await.is_ok());
        assert!(Keen.track(&Action::new("a", "1", 2)).await.is_err());
    }
}
