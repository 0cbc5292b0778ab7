use crate::errors::RovacError;
use crate::inventory::InventorySnapshot;
use async_trait::async_trait;

/// The account collaborator: fetches the raw device inventory of an account.
///
/// Authentication and the HTTP plumbing behind this call are out of scope;
/// the device manager only relies on this contract and treats any failure
/// as "no change" during background reconciliation.
#[async_trait]
pub trait AccountClient: Send + Sync + 'static {
    async fn fetch_inventory(&self) -> Result<InventorySnapshot, RovacError>;
}
