// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Error types for the dictionary core.

use thiserror::Error;

/// An error raised by the transactional storage substrate.
///
/// Lock timeouts are the only variant the dictionary ever recovers from
/// locally (by falling back from a nested sub-transaction to the caller's
/// transaction); everything else propagates unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("timed out waiting for a row lock")]
    LockTimeout,
    #[error("storage failure: {0}")]
    Internal(String),
}

/// An error raised by the dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DictionaryError {
    /// The optimistic retry loop exceeded its lock-wait budget.
    #[error("too much contention on sequence generator {sequence}")]
    TooMuchContention { sequence: String },
    /// The sequence has handed out its final legal value and cannot cycle.
    #[error("sequence {sequence} is exhausted")]
    SequenceExhausted { sequence: String },
    /// A configuration property could not be resolved.
    #[error("invalid value for property {property}: {value}")]
    Misconfiguration { property: String, value: String },
    /// No sequence descriptor exists for the given key.
    #[error("no sequence found for {0}")]
    MissingSequence(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
