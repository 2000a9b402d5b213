//! Read-only capability boundary to one storage pool.
//!
//! The engine never opens images through the full client path; everything it
//! needs is reachable through these primitive reads. Implementations must be
//! safe for concurrent use: many per-image pipelines share one session.

use async_trait::async_trait;
use bytes::Bytes;
use imagemeta_common::Result;

/// One live client registration on an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatcherInfo {
    /// Client network address, as reported by the cluster.
    pub addr: String,
    /// Registration cookie distinguishing watches from the same client.
    pub cookie: u64,
}

/// Authenticated read-only handle to one pool/namespace.
///
/// Supplied by a connection layer outside this crate. All methods may fail
/// with a session fault (`Error::Unreachable`) which aborts a whole scan;
/// `Error::NotFound` / `Error::PermissionDenied` are per-object outcomes.
#[async_trait]
pub trait PoolSession: Send + Sync {
    /// Numeric id of the pool this session is bound to.
    fn pool_id(&self) -> i64;

    /// Namespace within the pool; empty for the default namespace.
    fn pool_namespace(&self) -> &str;

    /// List omap key/value pairs of `oid`, strictly after `start_after`,
    /// returning at most `max` entries. Fails with `NotFound` when the
    /// object itself does not exist.
    async fn omap_list(
        &self,
        oid: &str,
        start_after: &str,
        max: usize,
    ) -> Result<Vec<(String, Bytes)>>;

    /// Read one omap value; `None` when the key is absent.
    async fn omap_get(&self, oid: &str, key: &str) -> Result<Option<Bytes>>;

    /// Read a whole object; `None` when it does not exist.
    async fn read_object(&self, oid: &str) -> Result<Option<Bytes>>;

    /// Read one extended attribute; `None` when absent.
    async fn get_xattr(&self, oid: &str, name: &str) -> Result<Option<Bytes>>;

    /// Size in bytes of an object, optionally as of a snapshot; `None` when
    /// the object does not exist (at that snapshot).
    async fn stat_object(&self, oid: &str, snap_id: Option<u64>) -> Result<Option<u64>>;

    /// Live watchers registered on an object. Empty when none.
    async fn list_watchers(&self, oid: &str) -> Result<Vec<WatcherInfo>>;
}
