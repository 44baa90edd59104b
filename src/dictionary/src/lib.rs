// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The catalog dictionary: cached metadata and sequence number generation
//! for a transactional storage engine.
//!
//! The dictionary sits between query execution and durable catalog storage.
//! It caches three kinds of objects, all through the same slot lifecycle
//! ([`cache::CacheManager`]):
//!
//!   * table descriptors, keyed both by qualified name and by id, with the
//!     two key spaces resolving to the same shared instance
//!     ([`descriptor_cache::DescriptorCache`]);
//!   * per-grantee privilege records, including synthesized records for
//!     grants storage does not hold ([`descriptor_cache::PermissionsCache`]);
//!   * sequence updaters, each owning an in-memory pre-allocated range of
//!     values and writing range boundaries back through short nested
//!     sub-transactions ([`updater::SequenceUpdater`]).
//!
//! [`DataDictionary`] ties the three together behind one handle.

pub mod cache;
pub mod descriptor;
pub mod descriptor_cache;
pub mod error;
pub mod sequence;
pub mod store;
pub mod testing;
pub mod updater;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::CacheManager;
use crate::descriptor::{CatalogId, SchemaId, TableDescriptor, TablePermissions};
use crate::descriptor_cache::{DescriptorCache, PermissionsCache};
use crate::error::DictionaryError;
use crate::sequence::SequenceRangeSizer;
use crate::store::{CatalogStore, TransactionContext};
use crate::updater::{SequenceCacheContext, SequenceConfig, SequenceUpdater};

/// Dictionary-wide configuration.
#[derive(Debug)]
pub struct DictionaryConfig {
    /// Raw value of the sequence range-size property; `None` uses the
    /// built-in default.
    pub preallocator: Option<String>,
    /// Named range sizers the property may refer to.
    pub range_sizers: BTreeMap<String, Arc<dyn SequenceRangeSizer>>,
    pub descriptor_cache_size: usize,
    pub permissions_cache_size: usize,
    pub sequence_cache_size: usize,
}

impl Default for DictionaryConfig {
    fn default() -> Self {
        DictionaryConfig {
            preallocator: None,
            range_sizers: BTreeMap::new(),
            descriptor_cache_size: 64,
            permissions_cache_size: 32,
            sequence_cache_size: 64,
        }
    }
}

/// The dictionary facade: descriptor, permission, and sequence caches over
/// one catalog store.
#[derive(Debug)]
pub struct DataDictionary<S> {
    descriptors: DescriptorCache<S>,
    permissions: PermissionsCache<S>,
    sequences: CacheManager<String, SequenceUpdater>,
    sequence_config: SequenceConfig,
}

impl<S: CatalogStore> DataDictionary<S> {
    pub fn new(store: Arc<S>, config: DictionaryConfig) -> DataDictionary<S> {
        DataDictionary {
            descriptors: DescriptorCache::new(Arc::clone(&store), config.descriptor_cache_size),
            permissions: PermissionsCache::new(store, config.permissions_cache_size),
            sequences: CacheManager::new("sequence updaters", config.sequence_cache_size),
            sequence_config: SequenceConfig {
                preallocator: config.preallocator,
                range_sizers: config.range_sizers,
            },
        }
    }

    pub fn table_by_name(
        &self,
        schema: SchemaId,
        name: &str,
    ) -> Result<Option<Arc<TableDescriptor>>, DictionaryError> {
        self.descriptors.table_by_name(schema, name)
    }

    pub fn table_by_id(
        &self,
        id: CatalogId,
    ) -> Result<Option<Arc<TableDescriptor>>, DictionaryError> {
        self.descriptors.table_by_id(id)
    }

    /// See [`DescriptorCache::verify_cached`].
    pub fn verify_table(&self, id: CatalogId) -> Result<bool, DictionaryError> {
        self.descriptors.verify_cached(id)
    }

    /// The privileges `grantee` holds on `object`; `None` only when the
    /// object does not exist.
    pub fn permissions(
        &self,
        grantee: &str,
        object: CatalogId,
    ) -> Result<Option<Arc<TablePermissions>>, DictionaryError> {
        self.permissions.permissions(grantee, object)
    }

    /// Hands out the next value of sequence `id`, pre-allocating a fresh
    /// range from storage when the cached one is spent.
    pub fn next_sequence_value<T: TransactionContext>(
        &self,
        id: CatalogId,
        tc: &T,
    ) -> Result<i64, DictionaryError> {
        let ctx = SequenceCacheContext {
            tc,
            config: &self.sequence_config,
        };
        let key = id.to_string();
        let Some(updater) = self.sequences.find(&key, &ctx)? else {
            return Err(DictionaryError::MissingSequence(key));
        };
        let value = updater.next_value(tc);
        self.sequences.release(&key);
        value
    }

    /// The value the next [`next_sequence_value`] call would return, without
    /// consuming it. `None` once the sequence is exhausted.
    ///
    /// [`next_sequence_value`]: DataDictionary::next_sequence_value
    pub fn peek_sequence_value<T: TransactionContext>(
        &self,
        id: CatalogId,
        tc: &T,
    ) -> Result<Option<i64>, DictionaryError> {
        let ctx = SequenceCacheContext {
            tc,
            config: &self.sequence_config,
        };
        let key = id.to_string();
        let Some(updater) = self.sequences.find(&key, &ctx)? else {
            return Err(DictionaryError::MissingSequence(key));
        };
        let value = updater.peek();
        self.sequences.release(&key);
        Ok(value)
    }

    /// Evicts every unheld sequence updater, flushing each one's unissued
    /// position back to storage so pre-allocated ranges are not leaked.
    /// Called when sequence metadata changes underneath the cache (DDL).
    pub fn clear_sequence_caches<T: TransactionContext>(&self, tc: &T) {
        let ctx = SequenceCacheContext {
            tc,
            config: &self.sequence_config,
        };
        self.sequences.evict_all(&ctx);
    }

    /// Evicts unheld descriptor and permission entries. Called when table or
    /// grant metadata changes underneath the caches.
    pub fn invalidate_metadata(&self) {
        self.descriptors.evict_all();
        self.permissions.evict_all();
    }
}
