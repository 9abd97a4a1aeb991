//! The record store capability the pipeline writes into.
//!
//! The pipeline only needs the [`RecordStore`] trait. [`MemoryStore`] is a
//! complete in-process implementation used by the binaries and tests.

use crate::model::{ProductRecord, SkuKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crc32fast::Hasher as Crc32;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Largest page a [`ProductQuery`] may ask for.
pub const MAX_PER_PAGE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The batch was rejected; nothing from it was applied.
    #[error("batch write failed: {0}")]
    Write(String),
    /// The store could not be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    Created,
    Updated,
}

/// Per-record result of an upsert, in the order the records were given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub key: SkuKey,
    pub kind: UpsertKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredProduct {
    pub id: u64,
    #[serde(flatten)]
    pub record: ProductRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ProductQuery {
    /// Case-insensitive substring over sku, name and description.
    pub search: Option<String>,
    pub active: Option<bool>,
    /// 1-based.
    pub page: usize,
    pub per_page: usize,
}

impl Default for ProductQuery {
    fn default() -> Self {
        Self {
            search: None,
            active: None,
            page: 1,
            per_page: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductPage {
    pub products: Vec<StoredProduct>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

/// Durable keyed storage for products.
///
/// Uniqueness is on [`SkuKey`], which is already case-folded.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &SkuKey) -> Result<Option<StoredProduct>, StoreError>;

    /// Insert or fully replace every record, all-or-nothing.
    ///
    /// On `Err` none of the records may have been applied.
    async fn upsert_batch(&self, records: &[ProductRecord])
        -> Result<Vec<UpsertOutcome>, StoreError>;

    /// Remove every product, returning how many were removed.
    async fn delete_all(&self) -> Result<u64, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn query(&self, query: &ProductQuery) -> Result<ProductPage, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    products: BTreeMap<SkuKey, StoredProduct>,
    next_id: u64,
}

/// In-process [`RecordStore`]. A batch is applied under one write lock, so
/// readers never observe half of it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// CRC32 over every stored record's content (ids and timestamps excluded),
    /// in key order. Two stores holding the same products agree.
    pub async fn fingerprint(&self) -> u32 {
        let inner = self.inner.read().await;
        let mut crc = Crc32::new();
        for product in inner.products.values() {
            let r = &product.record;
            for field in [r.key.as_str(), r.sku.as_str(), r.name.as_str(), r.description.as_str()] {
                crc.update(field.as_bytes());
                crc.update(&[0x1f]);
            }
            crc.update(&[r.active as u8]);
            for (column, value) in &r.attributes {
                crc.update(column.as_bytes());
                crc.update(&[0x1f]);
                crc.update(value.as_bytes());
            }
            crc.update(&[0x1e]);
        }
        crc.finalize()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &SkuKey) -> Result<Option<StoredProduct>, StoreError> {
        Ok(self.inner.read().await.products.get(key).cloned())
    }

    async fn upsert_batch(
        &self,
        records: &[ProductRecord],
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let now = Utc::now();
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            let kind = match inner.products.get_mut(&record.key) {
                Some(existing) => {
                    existing.record = record.clone();
                    existing.updated_at = Some(now);
                    UpsertKind::Updated
                }
                None => {
                    inner.next_id += 1;
                    let id = inner.next_id;
                    inner.products.insert(
                        record.key.clone(),
                        StoredProduct {
                            id,
                            record: record.clone(),
                            created_at: now,
                            updated_at: None,
                        },
                    );
                    UpsertKind::Created
                }
            };
            outcomes.push(UpsertOutcome {
                key: record.key.clone(),
                kind,
            });
        }
        Ok(outcomes)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let removed = inner.products.len() as u64;
        inner.products.clear();
        Ok(removed)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.read().await.products.len() as u64)
    }

    async fn query(&self, query: &ProductQuery) -> Result<ProductPage, StoreError> {
        let page = query.page.max(1);
        let per_page = query.per_page.clamp(1, MAX_PER_PAGE);
        let needle = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let inner = self.inner.read().await;
        let mut matching: Vec<&StoredProduct> = inner
            .products
            .values()
            .filter(|p| query.active.map_or(true, |active| p.record.active == active))
            .filter(|p| match &needle {
                Some(needle) => [&p.record.sku, &p.record.name, &p.record.description]
                    .iter()
                    .any(|field| field.to_lowercase().contains(needle.as_str())),
                None => true,
            })
            .collect();
        // newest first
        matching.sort_unstable_by(|a, b| b.id.cmp(&a.id));

        let total = matching.len();
        let products = matching
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .cloned()
            .collect();

        Ok(ProductPage {
            products,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page),
        })
    }
}
