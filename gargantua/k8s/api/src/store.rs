//! A typed object store.
//!
//! Controllers read and write resources exclusively through [`Store`]. Every write that replaces
//! an existing object is preconditioned on the object's resource version, so concurrent writers
//! observe [`Error::Conflict`] rather than silently overwriting one another. Spec/metadata and
//! status are separate: [`Store::replace`] never changes a stored status and
//! [`Store::replace_status`] never changes anything else.

mod client;
mod memory;
mod selector;

pub use self::{
    client::KubeStore,
    memory::{MemoryStore, Watch},
    selector::{Selector, SelectorError},
};
use kube::{api::ListParams, core::NamespaceResourceScope, Resource};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// The bounds every stored kind satisfies.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} has been modified")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: String, reason: String },

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

/// Typed CRUD over namespaced resources.
///
/// An empty namespace in `list` and `delete_collection` addresses all namespaces.
#[async_trait::async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K>;

    async fn list<K: Object>(&self, namespace: &str, params: &ListParams) -> Result<Vec<K>>;

    /// Creates an object in `namespace`. A server-generated name is assigned when the object
    /// sets `metadata.generateName` but no name.
    async fn create<K: Object>(&self, namespace: &str, object: &K) -> Result<K>;

    /// Replaces an object's spec and metadata, preserving its stored status.
    async fn replace<K: Object>(&self, object: &K) -> Result<K>;

    /// Replaces an object's status, preserving its stored spec and metadata.
    async fn replace_status<K: Object>(&self, object: &K) -> Result<K>;

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()>;

    /// Deletes every object matching `params`, returning how many were deleted.
    async fn delete_collection<K: Object>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> Result<usize>;

    async fn get_opt<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        match self.get::<K>(namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }
}

// === impl Error ===

impl Error {
    pub fn not_found<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind: K::kind(&()).into_owned(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn conflict<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Self {
        Self::Conflict {
            kind: K::kind(&()).into_owned(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Self {
        Self::AlreadyExists {
            kind: K::kind(&()).into_owned(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn invalid<K: Resource<DynamicType = ()>>(reason: impl fmt::Display) -> Self {
        Self::Invalid {
            kind: K::kind(&()).into_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

fn object_name<K: Resource>(object: &K) -> (&str, &str) {
    let meta = object.meta();
    (
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}
