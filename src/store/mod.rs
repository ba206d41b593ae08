//! The document store the tracker persists into.
//!
//! Records live in named collections, keyed by a store-assigned identity that
//! never appears inside the body. Besides single-document writes the store
//! offers point-in-time queries, an all-or-nothing batch commit and a live
//! snapshot feed per collection.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::sanitize::Fields;
use crate::watch::Subscription;

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Companies,
    Tasks,
    CommonTexts,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Self::Companies, Self::Tasks, Self::CommonTexts];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Companies => "companies",
            Self::Tasks => "tasks",
            Self::CommonTexts => "commonTexts",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored record: its identity plus its body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn decode<T: DeserializeOwned>(&self, collection: Collection) -> Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|source| Error::Decode {
            collection,
            id: self.id.clone(),
            source,
        })
    }
}

/// Conjunction of top-level field equality clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and_eq(field, value)
    }

    pub fn and_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    /// Value the filter pins `field` to, if it has such a clause.
    pub fn value_of(&self, field: &str) -> Option<&Value> {
        self.clauses
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.clauses
            .iter()
            .all(|(field, value)| fields.get(field) == Some(value))
    }
}

/// One mutation inside a [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        collection: Collection,
        fields: Fields,
    },
    /// Field-level merge; the whole batch fails if the target is absent.
    Update {
        collection: Collection,
        id: String,
        fields: Fields,
    },
    /// Absent targets are skipped.
    Delete { collection: Collection, id: String },
}

impl WriteOp {
    pub fn collection(&self) -> Collection {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. } => *collection,
        }
    }
}

/// Writes committed together: all of them apply or none does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    ops: Vec<WriteOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection: Collection, fields: Fields) -> &mut Self {
        self.ops.push(WriteOp::Insert { collection, fields });
        self
    }

    pub fn update(&mut self, collection: Collection, id: impl Into<String>, fields: Fields) -> &mut Self {
        self.ops.push(WriteOp::Update {
            collection,
            id: id.into(),
            fields,
        });
        self
    }

    pub fn delete(&mut self, collection: Collection, id: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            collection,
            id: id.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Distinct collections the batch touches, in first-use order.
    pub fn collections(&self) -> Vec<Collection> {
        let mut seen = Vec::new();
        for op in &self.ops {
            if !seen.contains(&op.collection()) {
                seen.push(op.collection());
            }
        }
        seen
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Identity for a new document. Always minted store-side.
pub(crate) fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Merge `patch` into `body`, replacing each named field.
pub(crate) fn merge_fields(body: &mut Fields, patch: Fields) {
    for (key, value) in patch {
        body.insert(key, value);
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new document and return the identity the store assigned.
    async fn insert(&self, collection: Collection, fields: Fields) -> Result<String>;

    /// Merge fields into an existing document; `NotFound` if it is absent.
    async fn update(&self, collection: Collection, id: &str, fields: Fields) -> Result<()>;

    /// Remove a document. Removing an absent identity succeeds.
    async fn delete(&self, collection: Collection, id: &str) -> Result<()>;

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>>;

    /// Point-in-time list of matching documents in insertion order.
    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>>;

    /// Apply every op in the batch or none of them. Returns the identities
    /// assigned to the batch's inserts, in op order.
    async fn commit(&self, batch: Batch) -> Result<Vec<String>>;

    /// Live feed of full snapshots of the matching documents: one right away,
    /// then one after every change to the collection.
    fn subscribe(&self, collection: Collection, filter: Filter) -> Subscription;
}
