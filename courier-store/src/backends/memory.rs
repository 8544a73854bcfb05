use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{
    StoreError,
    error::Result,
    store::DeliveryLogStore,
    types::{DeliveryLogEntry, DeliveryLogId, NewDeliveryLogEntry, Transition},
};

/// In-memory delivery log
///
/// Entries live in a `HashMap` behind an `RwLock`. Transitions take the
/// write lock for the whole check-and-update, so a duplicate completion can
/// never interleave with the first one.
///
/// An optional capacity bounds memory growth; `create` fails once it is
/// reached.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeliveryLog {
    entries: Arc<RwLock<HashMap<DeliveryLogId, DeliveryLogEntry>>>,
    capacity: Option<usize>,
}

impl MemoryDeliveryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Recovers gracefully if the lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn transition(
        &self,
        id: &DeliveryLogId,
        apply: impl FnOnce(&mut DeliveryLogEntry) -> Transition,
    ) -> Result<Transition> {
        let mut entries = self.entries.write()?;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        Ok(apply(entry))
    }

    fn collect(&self, filter: impl Fn(&DeliveryLogEntry) -> bool) -> Result<Vec<DeliveryLogEntry>> {
        let mut matching: Vec<_> = self
            .entries
            .read()?
            .values()
            .filter(|entry| filter(entry))
            .cloned()
            .collect();

        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(matching)
    }
}

#[async_trait]
impl DeliveryLogStore for MemoryDeliveryLog {
    async fn create(&self, entry: NewDeliveryLogEntry) -> Result<DeliveryLogId> {
        let id = DeliveryLogId::generate();
        let mut entries = self.entries.write()?;

        if let Some(cap) = self.capacity
            && entries.len() >= cap
        {
            return Err(StoreError::CapacityExceeded(format!(
                "{}/{cap} entries",
                entries.len()
            )));
        }

        entries.insert(id.clone(), DeliveryLogEntry::pending(id.clone(), entry));
        Ok(id)
    }

    async fn mark_sent(
        &self,
        id: &DeliveryLogId,
        provider_message_id: &str,
    ) -> Result<Transition> {
        self.transition(id, |entry| entry.mark_sent(provider_message_id))
    }

    async fn mark_failed(&self, id: &DeliveryLogId, error_detail: &str) -> Result<Transition> {
        self.transition(id, |entry| entry.mark_failed(error_detail))
    }

    async fn get(&self, id: &DeliveryLogId) -> Result<DeliveryLogEntry> {
        self.entries
            .read()?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<DeliveryLogEntry>> {
        self.collect(|entry| entry.tenant_id == tenant_id)
    }

    async fn list_by_campaign(
        &self,
        tenant_id: &str,
        campaign_id: &str,
    ) -> Result<Vec<DeliveryLogEntry>> {
        self.collect(|entry| {
            entry.tenant_id == tenant_id && entry.campaign_id.as_deref() == Some(campaign_id)
        })
    }
}
