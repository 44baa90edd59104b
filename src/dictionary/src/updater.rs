// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The sequence updater: the cache slot bridging one in-memory
//! [`SequenceGenerator`] to durable storage.
//!
//! Advancing the persisted boundary is optimistic. The cheap path runs a
//! non-blocking compare-and-write inside a fresh nested sub-transaction,
//! whose commit releases the row lock immediately and survives the caller's
//! rollback. Only under contention does the update fall back to the caller's
//! own transaction, accepting that a later rollback of that transaction can
//! leave the persisted boundary behind the in-memory generator (sequences
//! guarantee gap-tolerant, not gap-free, uniqueness).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cache::CacheEntry;
use crate::descriptor::CatalogId;
use crate::error::{DictionaryError, StorageError};
use crate::sequence::{NextValue, RangePolicy, SequenceGenerator, SequenceRangeSizer};
use crate::store::{SequenceTransaction, TransactionContext};

/// Sequence-cache configuration: the raw range-size property and the
/// registry it resolves against. The property is resolved per generator
/// creation, so changing it takes effect the next time a sequence enters the
/// cache.
#[derive(Debug, Default)]
pub struct SequenceConfig {
    pub preallocator: Option<String>,
    pub range_sizers: BTreeMap<String, Arc<dyn SequenceRangeSizer>>,
}

/// What binding or flushing a sequence cache slot needs: the caller's
/// transaction plus the dictionary-level sequence configuration.
#[derive(Debug)]
pub struct SequenceCacheContext<'a, T> {
    pub tc: &'a T,
    pub config: &'a SequenceConfig,
}

/// Cache slot wrapping exactly one [`SequenceGenerator`]. One updater exists
/// per distinct sequence per cache; concurrent callers resolving the same
/// key share it, and the generator's internal mutex is what serializes them.
#[derive(Debug)]
pub struct SequenceUpdater {
    /// Stable string form of the sequence's catalog id.
    key: String,
    id: CatalogId,
    generator: Arc<SequenceGenerator>,
    /// Wall-clock budget for the optimistic retry loop; `None` retries
    /// forever.
    lock_timeout: Option<Duration>,
}

impl SequenceUpdater {
    /// Hands out the next sequence value, extending the persisted boundary
    /// when the generator's local range is spent.
    pub fn next_value<T: TransactionContext>(&self, tc: &T) -> Result<i64, DictionaryError> {
        let mut retry_started: Option<Instant> = None;
        loop {
            match self.generator.next() {
                NextValue::Value(value) => return Ok(value),
                NextValue::Exhausted => {
                    return Err(DictionaryError::SequenceExhausted {
                        sequence: self.generator.qualified_name(),
                    });
                }
                NextValue::MarkExhausted(value) => {
                    // One-time terminal write so future requests fail fast
                    // instead of re-deriving exhaustion. The generator is
                    // already exhausted in memory; if the marker loses its
                    // compare (another session moved the row underneath us),
                    // exhaustion stands regardless.
                    let updated = self.update_on_disk(tc, Some(value), None)?;
                    if !updated {
                        debug!(
                            sequence = %self.key,
                            "exhaustion marker lost its compare-and-write",
                        );
                    }
                    return Ok(value);
                }
                NextValue::AllocateNewValues(allocation) => {
                    let updated = self.update_on_disk(
                        tc,
                        Some(allocation.old_value),
                        Some(allocation.new_value),
                    )?;
                    if updated {
                        self.generator.allocate_new_range(&allocation);
                        continue;
                    }
                    // Lost the optimistic race: another caller moved the
                    // boundary first. Leave the generator alone and re-derive
                    // from its current state.
                    debug!(
                        sequence = %self.key,
                        "lost optimistic race extending sequence range",
                    );
                    let started = retry_started.get_or_insert_with(Instant::now);
                    if let Some(budget) = self.lock_timeout {
                        if started.elapsed() > budget {
                            return Err(DictionaryError::TooMuchContention {
                                sequence: self.generator.qualified_name(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// The next value without advancing, for identity/sequence
    /// introspection. `None` once exhausted.
    pub fn peek(&self) -> Option<i64> {
        self.generator.peek_next_value()
    }

    /// Moves the persisted boundary from `expected` to `new`.
    ///
    /// First attempt: a fresh nested sub-transaction, non-blocking. A lock
    /// timeout there is expected contention, not failure: the
    /// sub-transaction is committed (releasing its resources) and the same
    /// compare-and-write retries inside the caller's transaction, blocking.
    /// Every other storage failure propagates.
    fn update_on_disk<T: TransactionContext>(
        &self,
        tc: &T,
        expected: Option<i64>,
        new: Option<i64>,
    ) -> Result<bool, DictionaryError> {
        let mut nested = tc.start_nested_transaction(false)?;
        match nested.compare_and_write(self.id, expected, new, false) {
            Ok(updated) => {
                nested.commit()?;
                return Ok(updated);
            }
            Err(StorageError::LockTimeout) => {
                nested.commit()?;
                debug!(
                    sequence = %self.key,
                    "sequence row is locked, falling back to the caller's transaction",
                );
            }
            Err(other) => return Err(other.into()),
        }
        Ok(tc.compare_and_write(self.id, expected, new, true)?)
    }
}

impl<'a, T: TransactionContext> CacheEntry<SequenceCacheContext<'a, T>> for SequenceUpdater {
    type Key = String;
    type Seed = SequenceUpdater;

    fn bind_new(_key: String, seed: SequenceUpdater) -> Option<Self> {
        Some(seed)
    }

    /// Reads the sequence descriptor inside a short read-only
    /// sub-transaction (read-only work must never hold a lock past the
    /// read), then constructs the generator. An absent or unparsable key
    /// fails the bind; the cache retains nothing.
    fn bind_by_key(
        key: &String,
        ctx: &SequenceCacheContext<'a, T>,
    ) -> Result<Option<Self>, DictionaryError> {
        let Some(id) = CatalogId::parse(key) else {
            return Ok(None);
        };
        let policy = RangePolicy::resolve(
            ctx.config.preallocator.as_deref(),
            &ctx.config.range_sizers,
        )?;
        let mut nested = ctx.tc.start_nested_transaction(true)?;
        let descriptor = nested.read_sequence(id)?;
        nested.commit()?;
        let Some(descriptor) = descriptor else {
            return Ok(None);
        };
        let generator = SequenceGenerator::new(&descriptor, policy);
        let lock_timeout = match ctx.tc.lock_wait_timeout_ms() {
            timeout if timeout < 0 => None,
            timeout => Some(Duration::from_millis(timeout as u64)),
        };
        Ok(Some(SequenceUpdater {
            key: key.clone(),
            id,
            generator: Arc::new(generator),
            lock_timeout,
        }))
    }

    fn key(&self) -> &String {
        &self.key
    }

    fn is_dirty(&self) -> bool {
        self.generator.peek_current_value().is_some()
    }

    /// Writes the next unissued value back unconditionally, so eviction
    /// (e.g. a DDL-driven metadata clear) does not leak the pre-allocated
    /// but unconsumed remainder of the range.
    fn flush(
        &self,
        ctx: &SequenceCacheContext<'a, T>,
        _for_removal: bool,
    ) -> Result<(), DictionaryError> {
        let Some(value) = self.generator.peek_current_value() else {
            return Ok(());
        };
        self.update_on_disk(ctx.tc, None, Some(value))?;
        Ok(())
    }
}
