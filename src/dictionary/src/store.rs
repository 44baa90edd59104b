// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Interfaces onto the transactional key/value substrate.
//!
//! The dictionary treats storage as a black box: catalog rows read through
//! [`CatalogStore`], and the single persisted scalar per sequence (its range
//! boundary) read and advanced through [`TransactionContext`] /
//! [`SequenceTransaction`]. Row-level locking, nested transaction mechanics,
//! and on-disk layout all live behind these traits.

use crate::descriptor::{
    CatalogId, PermissionsKey, SchemaDescriptor, SchemaId, SequenceDescriptor, TableDescriptor,
    TablePermissions,
};
use crate::error::StorageError;

/// A nested sub-transaction whose commit and abort are independent of the
/// enclosing transaction.
///
/// Dropping an uncommitted sub-transaction aborts and destroys it; every
/// sub-transaction is created, committed or aborted, and destroyed within a
/// single dictionary call.
pub trait SequenceTransaction {
    /// Reads the sequence's catalog row.
    fn read_sequence(&mut self, id: CatalogId) -> Result<Option<SequenceDescriptor>, StorageError>;

    /// Optimistic compare-and-write of the sequence's persisted boundary.
    ///
    /// `expected = Some(v)` only writes if the stored boundary is still `v`;
    /// `expected = None` writes unconditionally (eviction flush). `new = None`
    /// writes the terminal exhaustion marker. Returns `false` when the
    /// expectation did not hold. With `wait = false` a held row lock raises
    /// [`StorageError::LockTimeout`] instead of blocking.
    fn compare_and_write(
        &mut self,
        id: CatalogId,
        expected: Option<i64>,
        new: Option<i64>,
        wait: bool,
    ) -> Result<bool, StorageError>;

    fn commit(&mut self) -> Result<(), StorageError>;
}

/// The caller's execution transaction.
///
/// One exists per session; the dictionary never stores one. Operations called
/// directly on it participate in the caller's transaction lifetime (and roll
/// back with it), which is why the sequence updater prefers a nested
/// sub-transaction and only falls back here under contention.
pub trait TransactionContext {
    type Nested: SequenceTransaction;

    fn start_nested_transaction(&self, read_only: bool) -> Result<Self::Nested, StorageError>;

    /// Reads the sequence row inside the caller's transaction.
    fn read_sequence(&self, id: CatalogId) -> Result<Option<SequenceDescriptor>, StorageError>;

    /// Compare-and-write inside the caller's transaction. Semantics as in
    /// [`SequenceTransaction::compare_and_write`].
    fn compare_and_write(
        &self,
        id: CatalogId,
        expected: Option<i64>,
        new: Option<i64>,
        wait: bool,
    ) -> Result<bool, StorageError>;

    /// The configured lock-wait budget in milliseconds; negative means wait
    /// forever. Read once when a sequence updater is constructed.
    fn lock_wait_timeout_ms(&self) -> i64;
}

/// Read-only access to catalog rows, used by the descriptor and permission
/// caches to populate slots on a miss.
pub trait CatalogStore: Send + Sync {
    fn table_by_name(
        &self,
        schema: SchemaId,
        name: &str,
    ) -> Result<Option<TableDescriptor>, StorageError>;

    fn table_by_id(&self, id: CatalogId) -> Result<Option<TableDescriptor>, StorageError>;

    fn schema(&self, id: SchemaId) -> Result<Option<SchemaDescriptor>, StorageError>;

    /// The stored grant for `key`, if any. Absence is meaningful: the
    /// permission cache synthesizes a default record for it.
    fn permissions(&self, key: &PermissionsKey)
        -> Result<Option<TablePermissions>, StorageError>;
}
