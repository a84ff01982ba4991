#![forbid(unsafe_code)]
//! Identifier types shared across the blkmirror daemon.
//!
//! Defines the pool and image identity newtypes plus the local pool I/O
//! handle that removal operations borrow. Two deletion requests refer to the
//! same image iff both their [`PoolId`] and [`GlobalImageId`] are equal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a local storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub i64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster-agnostic identifier of a mirrored image, stable across pools and
/// clusters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalImageId(pub String);

impl GlobalImageId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GlobalImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GlobalImageId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for GlobalImageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Handle to a local pool through which mirrored images are addressable.
///
/// Carries no I/O machinery itself; removal operations perform the actual
/// cluster calls through it and only borrow it for their duration.
#[derive(Debug, Clone)]
pub struct PoolIoCtx {
    pool_id: PoolId,
    pool_name: String,
}

impl PoolIoCtx {
    #[must_use]
    pub fn new(pool_id: PoolId, pool_name: impl Into<String>) -> Self {
        Self {
            pool_id,
            pool_name: pool_name.into(),
        }
    }

    #[must_use]
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }
}

/// Shared reference to a local pool handle, as passed between daemon
/// components.
pub type IoCtxRef = Arc<PoolIoCtx>;
