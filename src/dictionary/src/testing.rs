// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory implementations of the storage traits, for tests.
//!
//! [`MemoryEngine`] is the shared, durable side: one catalog and one write
//! log visible to every session. [`MemorySession`] plays the caller's
//! transaction; writes made through it apply immediately but are undone by
//! [`MemorySession::rollback`], which is how the tests exercise the
//! rollback behavior of the contention fallback path. Failure injection
//! (forced compare mismatches, forced row-lock timeouts) lives on the
//! engine.

use std::sync::{Arc, Mutex};

use crate::descriptor::{
    CatalogId, PermissionsKey, SchemaDescriptor, SchemaId, SequenceDescriptor, SequenceKind,
    TableDescriptor, TablePermissions,
};
use crate::error::StorageError;
use crate::store::{CatalogStore, SequenceTransaction, TransactionContext};

/// Which transaction performed a recorded sequence write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// A nested sub-transaction (the cheap, non-blocking path).
    Nested,
    /// The caller's own transaction (the contention fallback).
    Caller,
}

/// One applied sequence write, for assertions about which path ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub origin: WriteOrigin,
    pub id: CatalogId,
    pub previous: Option<i64>,
    pub value: Option<i64>,
}

#[derive(Debug, Default)]
struct EngineState {
    sequences: std::collections::BTreeMap<CatalogId, SequenceDescriptor>,
    tables: std::collections::BTreeMap<CatalogId, TableDescriptor>,
    schemas: std::collections::BTreeMap<SchemaId, SchemaDescriptor>,
    permissions: std::collections::BTreeMap<PermissionsKey, TablePermissions>,
    write_log: Vec<WriteRecord>,
    /// Remaining compare-and-writes that report a mismatch regardless of the
    /// stored value.
    forced_mismatches: usize,
    /// Remaining non-blocking compare-and-writes that report a held row lock.
    forced_lock_timeouts: usize,
    lock_timeout_ms: i64,
}

enum CasOutcome {
    Updated { previous: Option<i64> },
    Mismatch,
}

/// The shared storage engine behind every session in a test.
#[derive(Debug)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
}

impl MemoryEngine {
    pub fn new() -> Arc<MemoryEngine> {
        Arc::new(MemoryEngine {
            state: Mutex::new(EngineState {
                lock_timeout_ms: -1,
                ..EngineState::default()
            }),
        })
    }

    pub fn insert_sequence(&self, descriptor: SequenceDescriptor) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.sequences.insert(descriptor.id, descriptor);
    }

    pub fn insert_table(&self, descriptor: TableDescriptor) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.tables.insert(descriptor.id, descriptor);
    }

    pub fn insert_schema(&self, descriptor: SchemaDescriptor) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.schemas.insert(descriptor.id, descriptor);
    }

    pub fn insert_permissions(&self, permissions: TablePermissions) {
        let mut state = self.state.lock().expect("lock poisoned");
        let key = PermissionsKey {
            grantee: permissions.grantee.clone(),
            object: permissions.object,
        };
        state.permissions.insert(key, permissions);
    }

    /// The persisted range boundary for `id`: `Some(None)` is the exhaustion
    /// marker, outer `None` means the row does not exist.
    pub fn sequence_value(&self, id: CatalogId) -> Option<Option<i64>> {
        let state = self.state.lock().expect("lock poisoned");
        state.sequences.get(&id).map(|row| row.current_value)
    }

    pub fn write_log(&self) -> Vec<WriteRecord> {
        let state = self.state.lock().expect("lock poisoned");
        state.write_log.clone()
    }

    /// Forces the next `n` compare-and-writes to report a mismatch, as if a
    /// concurrent session had already moved the boundary.
    pub fn fail_next_cas(&self, n: usize) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.forced_mismatches = n;
    }

    /// Forces the next `n` non-blocking compare-and-writes to report a held
    /// row lock, pushing the updater onto its fallback path.
    pub fn fail_next_nested_cas(&self, n: usize) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.forced_lock_timeouts = n;
    }

    pub fn set_lock_timeout_ms(&self, timeout: i64) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.lock_timeout_ms = timeout;
    }

    pub fn session(self: &Arc<Self>) -> MemorySession {
        MemorySession {
            engine: Arc::clone(self),
            undo: Mutex::new(Vec::new()),
        }
    }

    fn read_sequence(&self, id: CatalogId) -> Result<Option<SequenceDescriptor>, StorageError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.sequences.get(&id).cloned())
    }

    fn compare_and_write(
        &self,
        origin: WriteOrigin,
        id: CatalogId,
        expected: Option<i64>,
        new: Option<i64>,
        wait: bool,
    ) -> Result<CasOutcome, StorageError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !wait && state.forced_lock_timeouts > 0 {
            state.forced_lock_timeouts -= 1;
            return Err(StorageError::LockTimeout);
        }
        if expected.is_some() && state.forced_mismatches > 0 {
            state.forced_mismatches -= 1;
            return Ok(CasOutcome::Mismatch);
        }
        let Some(row) = state.sequences.get_mut(&id) else {
            return Err(StorageError::Internal(format!("unknown sequence {id}")));
        };
        if expected.is_some() && row.current_value != expected {
            return Ok(CasOutcome::Mismatch);
        }
        let previous = row.current_value;
        row.current_value = new;
        state.write_log.push(WriteRecord {
            origin,
            id,
            previous,
            value: new,
        });
        Ok(CasOutcome::Updated { previous })
    }

    fn restore(&self, id: CatalogId, value: Option<i64>) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(row) = state.sequences.get_mut(&id) {
            row.current_value = value;
        }
    }
}

impl CatalogStore for MemoryEngine {
    fn table_by_name(
        &self,
        schema: SchemaId,
        name: &str,
    ) -> Result<Option<TableDescriptor>, StorageError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .tables
            .values()
            .find(|table| table.schema == schema && table.name == name)
            .cloned())
    }

    fn table_by_id(&self, id: CatalogId) -> Result<Option<TableDescriptor>, StorageError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.tables.get(&id).cloned())
    }

    fn schema(&self, id: SchemaId) -> Result<Option<SchemaDescriptor>, StorageError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.schemas.get(&id).cloned())
    }

    fn permissions(
        &self,
        key: &PermissionsKey,
    ) -> Result<Option<TablePermissions>, StorageError> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.permissions.get(key).cloned())
    }
}

/// One caller transaction. Writes apply to the shared engine immediately and
/// stay applied unless [`rollback`] runs; dropping a session without rolling
/// back behaves like a commit.
///
/// [`rollback`]: MemorySession::rollback
#[derive(Debug)]
pub struct MemorySession {
    engine: Arc<MemoryEngine>,
    // Mutex because the trait hands out `&self`; a session is still used by
    // one thread at a time.
    undo: Mutex<Vec<(CatalogId, Option<i64>)>>,
}

impl MemorySession {
    pub fn commit(&self) {
        self.undo.lock().expect("lock poisoned").clear();
    }

    /// Undoes every write made directly in this transaction. Writes made by
    /// nested sub-transactions it started are unaffected, which is the point
    /// of running sequence updates in them.
    pub fn rollback(&self) {
        let mut undo = self.undo.lock().expect("lock poisoned");
        while let Some((id, previous)) = undo.pop() {
            self.engine.restore(id, previous);
        }
    }
}

impl TransactionContext for MemorySession {
    type Nested = MemoryNested;

    fn start_nested_transaction(&self, _read_only: bool) -> Result<MemoryNested, StorageError> {
        Ok(MemoryNested {
            engine: Arc::clone(&self.engine),
            undo: Vec::new(),
            committed: false,
        })
    }

    fn read_sequence(&self, id: CatalogId) -> Result<Option<SequenceDescriptor>, StorageError> {
        self.engine.read_sequence(id)
    }

    fn compare_and_write(
        &self,
        id: CatalogId,
        expected: Option<i64>,
        new: Option<i64>,
        wait: bool,
    ) -> Result<bool, StorageError> {
        match self
            .engine
            .compare_and_write(WriteOrigin::Caller, id, expected, new, wait)?
        {
            CasOutcome::Updated { previous } => {
                self.undo.lock().expect("lock poisoned").push((id, previous));
                Ok(true)
            }
            CasOutcome::Mismatch => Ok(false),
        }
    }

    fn lock_wait_timeout_ms(&self) -> i64 {
        let state = self.engine.state.lock().expect("lock poisoned");
        state.lock_timeout_ms
    }
}

/// A nested sub-transaction: writes apply immediately and are undone if the
/// transaction is dropped without [`commit`].
///
/// [`commit`]: SequenceTransaction::commit
#[derive(Debug)]
pub struct MemoryNested {
    engine: Arc<MemoryEngine>,
    undo: Vec<(CatalogId, Option<i64>)>,
    committed: bool,
}

impl SequenceTransaction for MemoryNested {
    fn read_sequence(&mut self, id: CatalogId) -> Result<Option<SequenceDescriptor>, StorageError> {
        self.engine.read_sequence(id)
    }

    fn compare_and_write(
        &mut self,
        id: CatalogId,
        expected: Option<i64>,
        new: Option<i64>,
        wait: bool,
    ) -> Result<bool, StorageError> {
        match self
            .engine
            .compare_and_write(WriteOrigin::Nested, id, expected, new, wait)?
        {
            CasOutcome::Updated { previous } => {
                self.undo.push((id, previous));
                Ok(true)
            }
            CasOutcome::Mismatch => Ok(false),
        }
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.committed = true;
        self.undo.clear();
        Ok(())
    }
}

impl Drop for MemoryNested {
    fn drop(&mut self) {
        if !self.committed {
            while let Some((id, previous)) = self.undo.pop() {
                self.engine.restore(id, previous);
            }
        }
    }
}

/// A sequence descriptor with sensible defaults: ascending by one from 1 to
/// [`i64::MAX`], no cycling.
pub fn sequence_fixture(schema: SchemaId, name: &str) -> SequenceDescriptor {
    SequenceDescriptor {
        id: CatalogId::new(),
        schema,
        schema_name: "app".to_string(),
        name: name.to_string(),
        kind: SequenceKind::Sequence,
        current_value: Some(1),
        start_value: 1,
        minimum_value: 1,
        maximum_value: i64::MAX,
        increment: 1,
        can_cycle: false,
    }
}
