use async_trait::async_trait;

use crate::{
    error::Result,
    types::{DeliveryLogEntry, DeliveryLogId, NewDeliveryLogEntry, Transition},
};

/// Persistence for delivery log entries.
///
/// Every row belongs to exactly one recipient attempt, so concurrent writers
/// never touch the same row except through duplicate completion calls. Each
/// implementation only has to make single-row create and update atomic.
#[async_trait]
pub trait DeliveryLogStore: Send + Sync + std::fmt::Debug {
    /// Record a new `pending` attempt and return its id.
    ///
    /// Must be called, and must succeed, before any network attempt is made
    /// for the recipient.
    async fn create(&self, entry: NewDeliveryLogEntry) -> Result<DeliveryLogId>;

    /// Move a `pending` entry to `sent`. A no-op on a terminal entry.
    async fn mark_sent(&self, id: &DeliveryLogId, provider_message_id: &str)
    -> Result<Transition>;

    /// Move a `pending` entry to `failed`. A no-op on a terminal entry.
    async fn mark_failed(&self, id: &DeliveryLogId, error_detail: &str) -> Result<Transition>;

    async fn get(&self, id: &DeliveryLogId) -> Result<DeliveryLogEntry>;

    /// All entries for a tenant, oldest first.
    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<DeliveryLogEntry>>;

    /// All entries for one campaign run of a tenant, oldest first.
    async fn list_by_campaign(
        &self,
        tenant_id: &str,
        campaign_id: &str,
    ) -> Result<Vec<DeliveryLogEntry>>;
}
