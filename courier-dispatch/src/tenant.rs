use std::{collections::HashMap, sync::Arc};

use serde::Deserialize;

/// A sending account, as far as dispatch is concerned.
///
/// Tenants are owned by the account layer; here they only supply the
/// authoritative `from` address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub from: String,
}

impl Tenant {
    pub fn new(id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
        }
    }
}

/// Lookup of configured tenants by id.
#[derive(Debug, Clone, Default)]
pub struct TenantRegistry {
    tenants: HashMap<String, Arc<Tenant>>,
}

impl TenantRegistry {
    /// Later tenants with a duplicate id replace earlier ones.
    pub fn new(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        Self {
            tenants: tenants
                .into_iter()
                .map(|tenant| (tenant.id.clone(), Arc::new(tenant)))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Tenant>> {
        self.tenants.get(id).cloned()
    }

    /// Every tenant's sending address; all of them belong behind the
    /// self-send shield.
    pub fn from_addresses(&self) -> impl Iterator<Item = &str> {
        self.tenants.values().map(|tenant| tenant.from.as_str())
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}
