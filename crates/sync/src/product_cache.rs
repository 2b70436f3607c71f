//! Product attribute cache fed by catalog events.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use common::Sku;
use serde::Serialize;

use crate::inbound::ProductChangedData;
use crate::read_model::ReadModel;

/// Latest known catalog attributes of one product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedProduct {
    pub sku: Sku,
    pub attributes: HashMap<String, serde_json::Value>,
    pub changed_at: DateTime<Utc>,
    /// Number of catalog updates applied.
    pub revision: u64,
}

/// Read model of product attributes keyed by SKU.
///
/// Catalog events may arrive out of order; an update older than the cached one
/// is dropped.
#[derive(Clone, Default)]
pub struct ProductCacheView {
    products: Arc<RwLock<HashMap<Sku, CachedProduct>>>,
}

impl ProductCacheView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a catalog update. Returns false if it was stale.
    pub fn apply(&self, change: &ProductChangedData) -> bool {
        let mut products = match self.products.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let revision = match products.get(&change.sku) {
            Some(cached) if cached.changed_at > change.changed_at => {
                tracing::debug!(sku = %change.sku, "stale product change ignored");
                return false;
            }
            Some(cached) => cached.revision + 1,
            None => 1,
        };
        products.insert(
            change.sku.clone(),
            CachedProduct {
                sku: change.sku.clone(),
                attributes: change.attributes.clone(),
                changed_at: change.changed_at,
                revision,
            },
        );
        true
    }

    pub fn get(&self, sku: &Sku) -> Option<CachedProduct> {
        self.read().get(sku).cloned()
    }

    /// All cached products, ordered by SKU.
    pub fn all(&self) -> Vec<CachedProduct> {
        let mut products: Vec<_> = self.read().values().cloned().collect();
        products.sort_by(|a, b| a.sku.cmp(&b.sku));
        products
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Sku, CachedProduct>> {
        match self.products.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ReadModel for ProductCacheView {
    fn name(&self) -> &'static str {
        "ProductCacheView"
    }

    fn count(&self) -> usize {
        self.read().len()
    }
}
