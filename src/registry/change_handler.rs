//! The capability contract for table change handlers.

use async_trait::async_trait;
use tracing::error;

use crate::error::Result;
use crate::messaging::envelope::ChangeEvent;

/// Callback capability for one table's change events.
///
/// Implement the methods for the operations the registration declares; the
/// dispatcher never routes an operation the registration does not support, so
/// the defaults only fire on a misconfigured registration and log loudly.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Handle an INSERT event.
    async fn on_insert(&self, event: ChangeEvent) -> Result<()> {
        error!(event_id = %event.event_id, table = %event.table_name, "INSERT event not handled");
        Ok(())
    }

    /// Handle an UPDATE event.
    async fn on_update(&self, event: ChangeEvent) -> Result<()> {
        error!(event_id = %event.event_id, table = %event.table_name, "UPDATE event not handled");
        Ok(())
    }

    /// Handle a DELETE event.
    async fn on_delete(&self, event: ChangeEvent) -> Result<()> {
        error!(event_id = %event.event_id, table = %event.table_name, "DELETE event not handled");
        Ok(())
    }

    /// Called once when the handler is registered, after validation.
    fn on_registered(&self, _table_name: &str) {}

    /// Called once at registry build. Returning an error removes the
    /// registration.
    fn validate_setup(&self) -> Result<()> {
        Ok(())
    }
}
