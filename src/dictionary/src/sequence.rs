// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The in-memory sequence range generator.
//!
//! A [`SequenceGenerator`] owns a contiguous pre-allocated block of values
//! for one sequence or identity column and hands them out from memory. It
//! never touches storage: when its local range is spent it describes the
//! disk update it needs ([`NextValue::AllocateNewValues`]) and commits the
//! extension only after the caller reports that the new boundary was durably
//! persisted. The generator's internal mutex is the only synchronization
//! point shared by sessions drawing from the same sequence; it is
//! deliberately narrower than any cache or catalog lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::descriptor::SequenceDescriptor;
use crate::error::DictionaryError;

/// Number of values claimed per disk update when no policy is configured.
pub const DEFAULT_RANGE_SIZE: u64 = 5;

/// The property that selects the range-size policy: either a positive
/// integer, or the name of a registered [`SequenceRangeSizer`].
pub const RANGE_SIZE_PROPERTY: &str = "garnet.sequence.preallocator";

/// A user-registered range-size policy, consulted per sequence.
pub trait SequenceRangeSizer: fmt::Debug + Send + Sync {
    /// Number of values to claim per disk update for the named sequence.
    fn range_size(&self, schema: &str, sequence: &str) -> u64;
}

/// How many values a generator claims each time it extends the persisted
/// boundary.
#[derive(Debug, Clone)]
pub enum RangePolicy {
    Fixed(u64),
    Custom(Arc<dyn SequenceRangeSizer>),
}

impl RangePolicy {
    /// Resolves the configured policy against the registry of user-supplied
    /// sizers. Called once per generator creation, so a malformed property
    /// fails sequence binding, never an individual value request.
    pub fn resolve(
        property_value: Option<&str>,
        registry: &BTreeMap<String, Arc<dyn SequenceRangeSizer>>,
    ) -> Result<RangePolicy, DictionaryError> {
        let Some(raw) = property_value else {
            return Ok(RangePolicy::Fixed(DEFAULT_RANGE_SIZE));
        };
        if let Ok(n) = raw.parse::<u64>() {
            if n == 0 {
                return Err(DictionaryError::Misconfiguration {
                    property: RANGE_SIZE_PROPERTY.to_string(),
                    value: raw.to_string(),
                });
            }
            return Ok(RangePolicy::Fixed(n));
        }
        match registry.get(raw) {
            Some(sizer) => Ok(RangePolicy::Custom(Arc::clone(sizer))),
            None => Err(DictionaryError::Misconfiguration {
                property: RANGE_SIZE_PROPERTY.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    fn size_for(&self, schema: &str, sequence: &str) -> u64 {
        match self {
            RangePolicy::Fixed(n) => (*n).max(1),
            RangePolicy::Custom(sizer) => sizer.range_size(schema, sequence).max(1),
        }
    }
}

/// Outcome of a single [`SequenceGenerator::next`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextValue {
    /// Hand out the value; no disk work needed.
    Value(i64),
    /// The final legal value. The caller must durably record exhaustion (a
    /// one-time terminal write); the generator is already exhausted in
    /// memory so no concurrent caller can draw the same value.
    MarkExhausted(i64),
    /// The local range is spent but more values exist. Persist the new
    /// boundary, feed the allocation back via
    /// [`SequenceGenerator::allocate_new_range`], and retry.
    AllocateNewValues(SequencePreallocation),
    /// The sequence is permanently spent.
    Exhausted,
}

/// A candidate extension of the persisted range boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePreallocation {
    /// The boundary currently on disk, to compare-and-write against.
    pub old_value: i64,
    /// The candidate new boundary. When cycling crosses the limit this wraps
    /// to the opposite bound.
    pub new_value: i64,
    /// First value of the new local range; differs from `old_value` only
    /// when the previous range ended exactly at the legal bound.
    pub first_value: i64,
    /// Number of values the new range owns.
    pub values_allocated: u64,
    /// The generator position this allocation was computed from; a stale
    /// allocation (another caller extended the range first) is ignored.
    observed: i128,
}

#[derive(Debug)]
struct GeneratorState {
    /// Next value to hand out. Kept as i128 so advancing past an i64 bound
    /// cannot wrap.
    current: i128,
    /// Exclusive end of the locally owned range; `current == boundary` means
    /// the range is empty.
    boundary: i128,
    /// Whether any value has been handed out since creation.
    used: bool,
    exhausted: bool,
}

/// An in-memory counter owning a pre-allocated block of one sequence's
/// values. See the module docs.
#[derive(Debug)]
pub struct SequenceGenerator {
    schema_name: String,
    sequence_name: String,
    increment: i64,
    minimum_value: i64,
    maximum_value: i64,
    can_cycle: bool,
    policy: RangePolicy,
    state: Mutex<GeneratorState>,
}

impl SequenceGenerator {
    /// Constructs a generator from a freshly-read descriptor. The generator
    /// owns no values yet; the first `next` call requests an allocation.
    pub fn new(descriptor: &SequenceDescriptor, policy: RangePolicy) -> SequenceGenerator {
        debug_assert!(descriptor.increment != 0, "increment must be nonzero");
        let (current, exhausted) = match descriptor.current_value {
            Some(value) => (i128::from(value), false),
            None => (0, true),
        };
        SequenceGenerator {
            schema_name: descriptor.schema_name.clone(),
            sequence_name: descriptor.name.clone(),
            increment: descriptor.increment,
            minimum_value: descriptor.minimum_value,
            maximum_value: descriptor.maximum_value,
            can_cycle: descriptor.can_cycle,
            policy,
            state: Mutex::new(GeneratorState {
                current,
                boundary: current,
                used: false,
                exhausted,
            }),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.sequence_name)
    }

    /// Hands out the next value, or describes the disk work standing in the
    /// way. Exactly one `next`/`allocate_new_range` exchange is in flight at
    /// a time per generator.
    pub fn next(&self) -> NextValue {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.exhausted {
            return NextValue::Exhausted;
        }

        let increment = i128::from(self.increment);
        let advanced = state.current + increment;

        // Hand out `current` if the advanced position stays inside the owned
        // range.
        if self.within(advanced, state.boundary) {
            let value = state.current as i64;
            state.current = advanced;
            state.used = true;
            return NextValue::Value(value);
        }

        let legal_bound = self.legal_bound();
        if self.within(state.current, legal_bound) {
            // `current` is still legal; how many further steps are?
            let steps_after = ((legal_bound - state.current) / increment) as u64;
            let requested = self.policy.size_for(&self.schema_name, &self.sequence_name);
            if self.can_cycle {
                return NextValue::AllocateNewValues(self.preallocate(
                    state.current,
                    state.current,
                    steps_after,
                    requested,
                ));
            }
            if steps_after == 0 {
                // `current` is the last legal value: hand it out together
                // with the terminal marker.
                let value = state.current as i64;
                state.used = true;
                state.exhausted = true;
                return NextValue::MarkExhausted(value);
            }
            // Clip the claim by reducing the count, keeping the persisted
            // boundary increment-aligned and inside the legal range.
            let count = requested.min(steps_after);
            let new_boundary = state.current + increment * i128::from(count);
            return NextValue::AllocateNewValues(SequencePreallocation {
                old_value: state.current as i64,
                new_value: new_boundary as i64,
                first_value: state.current as i64,
                values_allocated: count,
                observed: state.current,
            });
        }

        // `current` crossed the legal bound. Only reachable with cycling
        // (the previous range ended exactly at the bound, and the boundary
        // on disk already holds the wrapped restart value) or from a
        // malformed descriptor.
        if !self.can_cycle {
            state.exhausted = true;
            return NextValue::Exhausted;
        }
        let restart = i128::from(self.wrapped_bound());
        let steps_after = ((legal_bound - restart) / increment) as u64;
        let requested = self.policy.size_for(&self.schema_name, &self.sequence_name);
        NextValue::AllocateNewValues(self.preallocate(
            state.current,
            restart,
            steps_after,
            requested,
        ))
    }

    /// Builds a cycling allocation starting at `first` (already wrapped if
    /// needed), computed from raw position `observed`.
    fn preallocate(
        &self,
        observed: i128,
        first: i128,
        steps_after: u64,
        requested: u64,
    ) -> SequencePreallocation {
        // A cycling range may own the bound value itself; the range after it
        // restarts at the opposite bound, which is also what goes to disk so
        // a recreated generator resumes there.
        let span = steps_after.saturating_add(1);
        let count = requested.min(span);
        let reaches_bound = count == span;
        let new_value = if reaches_bound {
            self.wrapped_bound()
        } else {
            (first + i128::from(self.increment) * i128::from(count)) as i64
        };
        SequencePreallocation {
            old_value: first as i64,
            new_value,
            first_value: first as i64,
            values_allocated: count,
            observed,
        }
    }

    /// Commits a persisted range extension to memory. Ignored if the
    /// generator has moved since the allocation was computed (another caller
    /// extended the range first); the caller simply retries `next`.
    pub fn allocate_new_range(&self, allocation: &SequencePreallocation) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.exhausted || state.current != allocation.observed {
            return;
        }
        state.current = i128::from(allocation.first_value);
        state.boundary = state.current
            + i128::from(self.increment) * i128::from(allocation.values_allocated);
    }

    /// The position to persist when this generator is evicted: the next
    /// unissued value, or `None` if nothing was ever issued (leave disk
    /// alone) or the sequence is exhausted (the terminal marker is already
    /// durable). Flushing it forfeits the unconsumed remainder of the local
    /// range: a gap, never a duplicate.
    pub fn peek_current_value(&self) -> Option<i64> {
        let state = self.state.lock().expect("lock poisoned");
        if !state.used || state.exhausted {
            return None;
        }
        if self.within(state.current, self.legal_bound()) {
            Some(state.current as i64)
        } else {
            // raw position past the bound; the honest restart is the wrap
            Some(self.wrapped_bound())
        }
    }

    /// The next value `next` would hand out, without advancing. `None` once
    /// exhausted.
    pub fn peek_next_value(&self) -> Option<i64> {
        let state = self.state.lock().expect("lock poisoned");
        if state.exhausted {
            return None;
        }
        if self.within(state.current, self.legal_bound()) {
            Some(state.current as i64)
        } else if self.can_cycle {
            Some(self.wrapped_bound())
        } else {
            None
        }
    }

    fn within(&self, value: i128, bound: i128) -> bool {
        if self.increment > 0 {
            value <= bound
        } else {
            value >= bound
        }
    }

    fn legal_bound(&self) -> i128 {
        if self.increment > 0 {
            i128::from(self.maximum_value)
        } else {
            i128::from(self.minimum_value)
        }
    }

    fn wrapped_bound(&self) -> i64 {
        if self.increment > 0 {
            self.minimum_value
        } else {
            self.maximum_value
        }
    }
}
