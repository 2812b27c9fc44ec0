//! The boundary between the reconciliation core and the cluster's object store. Everything the
//! reconciler, the status converger, and the default convergence delegate do goes through the
//! `Store` trait, which is implemented by the real api server client and by the in-memory
//! `MemoryStore` that's used in tests.
#[cfg(any(test, feature = "testkit"))]
pub mod memory;

#[cfg(any(test, feature = "testkit"))]
pub use self::memory::{MemoryStore, StoreOp, WriteRecord};

use crate::error::ErrorClass;
use crate::k8s_types::K8sType;
use crate::resource::{InvalidResourceError, K8sResource, ObjectId, ObjectIdRef};
use crate::runner::client::Error as ClientError;

use async_trait::async_trait;
use serde_json::Value;

use std::fmt::{self, Display};

/// An error returned from a `Store` operation. Conflicts and missing objects get their own
/// variants, since the reconciler treats those very differently from other failures.
#[derive(Debug)]
pub enum StoreError {
    /// The requested object does not exist
    NotFound(ObjectId),
    /// A write was rejected because the object was modified concurrently, or it already exists
    Conflict(ObjectId, String),
    /// The store returned something that isn't a valid resource
    Invalid(InvalidResourceError),
    /// Any other failure from the api client
    Client(ClientError),
    /// The operation was abandoned before it completed
    Cancelled,
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound(_) => ErrorClass::NotFound,
            StoreError::Conflict(..) => ErrorClass::Conflict,
            _ => ErrorClass::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    /// Converts a client error into a store error, using the id of the object that the request
    /// was made for so that 404 and 409 responses can be reported properly
    pub fn from_client(err: ClientError, id: &ObjectIdRef<'_>) -> StoreError {
        if err.is_http_status(404) {
            StoreError::NotFound(id.to_owned())
        } else if err.is_http_status(409) {
            StoreError::Conflict(id.to_owned(), err.to_string())
        } else {
            StoreError::Client(err)
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "Object '{}' was not found", id),
            StoreError::Conflict(id, msg) => write!(f, "Conflict writing '{}': {}", id, msg),
            StoreError::Invalid(err) => write!(f, "Invalid object returned from store: {}", err),
            StoreError::Client(err) => write!(f, "Client error: {}", err),
            StoreError::Cancelled => f.write_str("Store operation was cancelled"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Invalid(err) => Some(err),
            StoreError::Client(err) => Some(err),
            _ => None,
        }
    }
}

impl From<InvalidResourceError> for StoreError {
    fn from(err: InvalidResourceError) -> StoreError {
        StoreError::Invalid(err)
    }
}

/// Read and write access to the objects in the cluster. Writes are optimistic: `replace` and
/// `update_status` are rejected with `StoreError::Conflict` if the `metadata.resourceVersion` of
/// the given object doesn't match the one that's currently stored.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<K8sResource, StoreError>;

    /// Lists all the objects of the given type, optionally restricted to one namespace
    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
    ) -> Result<Vec<K8sResource>, StoreError>;

    async fn create(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError>;

    /// Replaces the whole object. The status of objects with a status subresource is not
    /// modified by this.
    async fn replace(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, StoreError>;

    /// Writes only the `status` of the given object
    async fn update_status(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, StoreError>;

    /// Deletes the object. Deleting an object that's already gone is not an error.
    async fn delete(&self, k8s_type: &'static K8sType, id: &ObjectIdRef<'_>) -> Result<(), StoreError>;
}
