// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The dual-key descriptor cache and the permission cache.
//!
//! A descriptor is cached twice: once keyed by qualified name, once keyed by
//! object identifier. Both caches must, at any point in time, either both
//! miss or both resolve to the *same* descriptor instance for a given
//! object. A miss in either cache loads from storage and then registers the
//! loaded `Arc` into the sibling cache; the registration happens after the
//! triggering cache has dropped its internal lock, because taking the
//! sibling's lock while holding it would deadlock against a lookup arriving
//! in the opposite key order.

use std::sync::Arc;

use tracing::warn;

use crate::cache::{CacheEntry, CacheManager};
use crate::descriptor::{
    CatalogId, PermissionsKey, QualifiedName, SchemaId, TableDescriptor, TablePermissions,
};
use crate::error::DictionaryError;
use crate::store::CatalogStore;

/// Name-keyed cache slot for a table descriptor.
#[derive(Debug)]
pub struct NameKeyedDescriptor {
    key: QualifiedName,
    descriptor: Arc<TableDescriptor>,
}

impl NameKeyedDescriptor {
    pub fn descriptor(&self) -> &Arc<TableDescriptor> {
        &self.descriptor
    }
}

impl<S: CatalogStore> CacheEntry<S> for NameKeyedDescriptor {
    type Key = QualifiedName;
    type Seed = Arc<TableDescriptor>;

    fn bind_new(key: QualifiedName, seed: Arc<TableDescriptor>) -> Option<Self> {
        Some(NameKeyedDescriptor {
            key,
            descriptor: seed,
        })
    }

    fn bind_by_key(key: &QualifiedName, store: &S) -> Result<Option<Self>, DictionaryError> {
        let descriptor = store.table_by_name(key.schema, &key.name)?;
        Ok(descriptor.map(|descriptor| NameKeyedDescriptor {
            key: key.clone(),
            descriptor: Arc::new(descriptor),
        }))
    }

    fn key(&self) -> &QualifiedName {
        &self.key
    }
}

/// Identifier-keyed cache slot for a table descriptor.
#[derive(Debug)]
pub struct IdKeyedDescriptor {
    key: CatalogId,
    descriptor: Arc<TableDescriptor>,
}

impl IdKeyedDescriptor {
    pub fn descriptor(&self) -> &Arc<TableDescriptor> {
        &self.descriptor
    }
}

impl<S: CatalogStore> CacheEntry<S> for IdKeyedDescriptor {
    type Key = CatalogId;
    type Seed = Arc<TableDescriptor>;

    fn bind_new(key: CatalogId, seed: Arc<TableDescriptor>) -> Option<Self> {
        Some(IdKeyedDescriptor {
            key,
            descriptor: seed,
        })
    }

    fn bind_by_key(key: &CatalogId, store: &S) -> Result<Option<Self>, DictionaryError> {
        let descriptor = store.table_by_id(*key)?;
        Ok(descriptor.map(|descriptor| IdKeyedDescriptor {
            key: *key,
            descriptor: Arc::new(descriptor),
        }))
    }

    fn key(&self) -> &CatalogId {
        &self.key
    }
}

/// Two independently-keyed caches over the same descriptors, kept
/// referentially consistent by cross-population.
#[derive(Debug)]
pub struct DescriptorCache<S> {
    store: Arc<S>,
    by_name: CacheManager<QualifiedName, NameKeyedDescriptor>,
    by_id: CacheManager<CatalogId, IdKeyedDescriptor>,
}

impl<S: CatalogStore> DescriptorCache<S> {
    pub fn new(store: Arc<S>, capacity: usize) -> DescriptorCache<S> {
        DescriptorCache {
            store,
            by_name: CacheManager::new("table descriptors by name", capacity),
            by_id: CacheManager::new("table descriptors by id", capacity),
        }
    }

    pub fn table_by_name(
        &self,
        schema: SchemaId,
        name: &str,
    ) -> Result<Option<Arc<TableDescriptor>>, DictionaryError> {
        let key = QualifiedName {
            schema,
            name: name.to_string(),
        };
        let Some(entry) = self.by_name.find(&key, self.store.as_ref())? else {
            return Ok(None);
        };
        let descriptor = Arc::clone(entry.descriptor());
        self.by_name.release(&key);
        // Register the same instance under the sibling key. The name cache's
        // lock is already dropped here; see the module docs.
        self.by_id
            .cache_new(descriptor.id, Arc::clone(&descriptor), self.store.as_ref());
        Ok(Some(descriptor))
    }

    pub fn table_by_id(
        &self,
        id: CatalogId,
    ) -> Result<Option<Arc<TableDescriptor>>, DictionaryError> {
        let Some(entry) = self.by_id.find(&id, self.store.as_ref())? else {
            return Ok(None);
        };
        let descriptor = Arc::clone(entry.descriptor());
        self.by_id.release(&id);
        self.by_name.cache_new(
            descriptor.qualified_name(),
            Arc::clone(&descriptor),
            self.store.as_ref(),
        );
        Ok(Some(descriptor))
    }

    /// Seeds both caches with a descriptor the caller just materialized
    /// (e.g. a freshly inserted catalog row).
    pub fn cache_descriptor(&self, descriptor: Arc<TableDescriptor>) {
        self.by_name.cache_new(
            descriptor.qualified_name(),
            Arc::clone(&descriptor),
            self.store.as_ref(),
        );
        self.by_id
            .cache_new(descriptor.id, descriptor, self.store.as_ref());
    }

    /// Diagnostic consistency check, off the hot path: re-reads the
    /// authoritative row for a cached descriptor and compares identifier,
    /// container, qualified name, and kind. Mismatches are reported, never
    /// auto-corrected. Returns `true` when nothing is cached or the cached
    /// value matches storage.
    pub fn verify_cached(&self, id: CatalogId) -> Result<bool, DictionaryError> {
        let Some(cached) = self.by_id.find_cached(&id) else {
            return Ok(true);
        };
        let descriptor = Arc::clone(cached.descriptor());
        self.by_id.release(&id);
        let fresh = self.store.table_by_id(id)?;
        let consistent = match &fresh {
            Some(fresh) => {
                fresh.id == descriptor.id
                    && fresh.schema == descriptor.schema
                    && fresh.name == descriptor.name
                    && fresh.kind == descriptor.kind
            }
            None => false,
        };
        if !consistent {
            warn!(
                %id,
                cached = ?descriptor,
                fresh = ?fresh,
                "cached descriptor does not match storage",
            );
        }
        Ok(consistent)
    }

    /// Evicts everything unheld from both caches.
    pub fn evict_all(&self) {
        self.by_name.evict_all(self.store.as_ref());
        self.by_id.evict_all(self.store.as_ref());
    }
}

/// Permission cache slot.
#[derive(Debug)]
pub struct PermissionsEntry {
    key: PermissionsKey,
    permissions: Arc<TablePermissions>,
}

impl PermissionsEntry {
    pub fn permissions(&self) -> &Arc<TablePermissions> {
        &self.permissions
    }
}

impl<S: CatalogStore> CacheEntry<S> for PermissionsEntry {
    type Key = PermissionsKey;
    type Seed = TablePermissions;

    fn bind_new(key: PermissionsKey, seed: TablePermissions) -> Option<Self> {
        Some(PermissionsEntry {
            key,
            permissions: Arc::new(seed),
        })
    }

    /// Loads the stored grant, or synthesizes one when storage has none:
    /// system-owned namespaces are readable by everyone, a schema's owner
    /// holds every privilege, and anyone else holds none. The synthesized
    /// record is cached exactly as if read from storage, so repeated
    /// negative permission checks are cache hits.
    fn bind_by_key(key: &PermissionsKey, store: &S) -> Result<Option<Self>, DictionaryError> {
        if let Some(stored) = store.permissions(key)? {
            return Ok(Some(PermissionsEntry {
                key: key.clone(),
                permissions: Arc::new(stored),
            }));
        }
        let Some(table) = store.table_by_id(key.object)? else {
            return Ok(None);
        };
        let Some(schema) = store.schema(table.schema)? else {
            return Ok(None);
        };
        let synthesized = if schema.system {
            TablePermissions::select_only(key.grantee.clone(), key.object)
        } else if key.grantee == schema.authorization_id {
            TablePermissions::all(key.grantee.clone(), key.object)
        } else {
            TablePermissions::none(key.grantee.clone(), key.object)
        };
        Ok(Some(PermissionsEntry {
            key: key.clone(),
            permissions: Arc::new(synthesized),
        }))
    }

    fn key(&self) -> &PermissionsKey {
        &self.key
    }
}

/// Cache of per-grantee, per-object privilege records.
#[derive(Debug)]
pub struct PermissionsCache<S> {
    store: Arc<S>,
    entries: CacheManager<PermissionsKey, PermissionsEntry>,
}

impl<S: CatalogStore> PermissionsCache<S> {
    pub fn new(store: Arc<S>, capacity: usize) -> PermissionsCache<S> {
        PermissionsCache {
            store,
            entries: CacheManager::new("table permissions", capacity),
        }
    }

    /// The privileges `grantee` holds on `object`. `None` only when the
    /// object itself does not exist.
    pub fn permissions(
        &self,
        grantee: &str,
        object: CatalogId,
    ) -> Result<Option<Arc<TablePermissions>>, DictionaryError> {
        let key = PermissionsKey {
            grantee: grantee.to_string(),
            object,
        };
        let Some(entry) = self.entries.find(&key, self.store.as_ref())? else {
            return Ok(None);
        };
        let permissions = Arc::clone(entry.permissions());
        self.entries.release(&key);
        Ok(Some(permissions))
    }

    pub fn evict_all(&self) {
        self.entries.evict_all(self.store.as_ref());
    }
}
