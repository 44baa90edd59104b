// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Catalog descriptors: the plain value objects the dictionary caches.
//!
//! Descriptors are immutable snapshots of catalog rows. A descriptor is never
//! mutated in place; changing an object means evicting its cache entries and
//! re-reading the row.

use std::collections::BTreeSet;
use std::fmt;

use uuid::Uuid;

/// The authorization id under which synthesized grants are recorded.
pub const SYSTEM_AUTHORIZATION_ID: &str = "_SYSTEM";

/// Identifies one catalog object (table, view, sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CatalogId(Uuid);

impl CatalogId {
    pub fn new() -> CatalogId {
        CatalogId(Uuid::new_v4())
    }

    /// Parses the stable string form produced by [`CatalogId::to_string`].
    pub fn parse(s: &str) -> Option<CatalogId> {
        Uuid::parse_str(s).ok().map(CatalogId)
    }
}

impl Default for CatalogId {
    fn default() -> Self {
        CatalogId::new()
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaId(Uuid);

impl SchemaId {
    pub fn new() -> SchemaId {
        SchemaId(Uuid::new_v4())
    }
}

impl Default for SchemaId {
    fn default() -> Self {
        SchemaId::new()
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A schema-qualified object name, the key of the name-keyed descriptor cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    pub schema: SchemaId,
    pub name: String,
}

/// What kind of relation a [`TableDescriptor`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Table,
    View,
}

/// Snapshot of one relation's catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub id: CatalogId,
    pub schema: SchemaId,
    pub name: String,
    pub kind: DescriptorKind,
}

impl TableDescriptor {
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName {
            schema: self.schema,
            name: self.name.clone(),
        }
    }
}

/// Snapshot of one schema's catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub id: SchemaId,
    pub name: String,
    /// The authorization id that owns every object in the schema.
    pub authorization_id: String,
    /// System-owned schemas grant read access to everyone.
    pub system: bool,
}

/// Whether a sequence row backs a SQL sequence object or an identity column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    Sequence,
    IdentityColumn,
}

/// Snapshot of one sequence's catalog row.
///
/// Invariant: `minimum_value <= v <= maximum_value` for the persisted
/// `current_value` `v` whenever cycling is disabled and the sequence is not
/// exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceDescriptor {
    pub id: CatalogId,
    pub schema: SchemaId,
    pub schema_name: String,
    pub name: String,
    pub kind: SequenceKind,
    /// The persisted range boundary: the next value not yet claimed by any
    /// generator. `None` marks a permanently exhausted sequence.
    pub current_value: Option<i64>,
    pub start_value: i64,
    pub minimum_value: i64,
    pub maximum_value: i64,
    /// Signed, nonzero.
    pub increment: i64,
    pub can_cycle: bool,
}

/// One grantable privilege on a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    Select,
    Insert,
    Update,
    Delete,
    References,
    Trigger,
}

impl Privilege {
    pub const ALL: [Privilege; 6] = [
        Privilege::Select,
        Privilege::Insert,
        Privilege::Update,
        Privilege::Delete,
        Privilege::References,
        Privilege::Trigger,
    ];
}

/// Key of the permission cache: who is asking about what.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermissionsKey {
    pub grantee: String,
    pub object: CatalogId,
}

/// The privileges one grantee holds on one relation.
///
/// A record with an empty privilege set is meaningful: it is the cached form
/// of "no grant exists", so repeated negative permission checks hit the cache
/// instead of rescanning storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePermissions {
    pub grantee: String,
    pub object: CatalogId,
    pub grantor: String,
    pub privileges: BTreeSet<Privilege>,
}

impl TablePermissions {
    /// An explicit no-privileges record.
    pub fn none(grantee: String, object: CatalogId) -> TablePermissions {
        TablePermissions {
            grantee,
            object,
            grantor: SYSTEM_AUTHORIZATION_ID.to_string(),
            privileges: BTreeSet::new(),
        }
    }

    /// All privileges, granted by the system (schema owners).
    pub fn all(grantee: String, object: CatalogId) -> TablePermissions {
        TablePermissions {
            grantee,
            object,
            grantor: SYSTEM_AUTHORIZATION_ID.to_string(),
            privileges: Privilege::ALL.into_iter().collect(),
        }
    }

    /// Select only, granted to everyone (system-owned namespaces).
    pub fn select_only(grantee: String, object: CatalogId) -> TablePermissions {
        TablePermissions {
            grantee,
            object,
            grantor: SYSTEM_AUTHORIZATION_ID.to_string(),
            privileges: BTreeSet::from([Privilege::Select]),
        }
    }

    pub fn has(&self, privilege: Privilege) -> bool {
        self.privileges.contains(&privilege)
    }
}
