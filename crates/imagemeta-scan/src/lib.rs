//! Pool-wide block-image metadata aggregation.
//!
//! Given a read-only [`PoolSession`], this crate enumerates every image in a
//! pool and reconstructs, per image, a consistency-checked metadata record:
//! identity, geometry, feature flags, snapshot lineage and derived disk
//! usage. Images are read as independent metadata fragments (header omap,
//! snapshot directory, watcher list, object-map bitmaps) rather than through
//! a heavyweight open-image handshake, and every image gets its own terminal
//! status so one failure never drops results for the rest of the pool.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Scanner         │  bulk scan / single-image query
//! │  (orchestrator)  │
//! └───────┬──────────┘
//!         │ per image, bounded fan-out
//! ┌───────▼──────────┐
//! │ reader → assemble│  fragment fetch + record assembly
//! │        → usage   │  object-map decode / stat fallback
//! └───────┬──────────┘
//!         │
//! ┌───────▼──────────┐
//! │  PoolSession     │  object / omap / xattr reads
//! └──────────────────┘
//! ```

pub mod assemble;
pub mod enumerate;
pub mod mock;
pub mod reader;
pub mod scan;
pub mod session;
pub mod usage;

pub use scan::{ScanOutput, Scanner};
pub use session::{PoolSession, WatcherInfo};

/// Well-known object holding the pool's image directory omap.
pub const DIRECTORY_OBJECT: &str = "image_directory";

/// Directory omap key prefix mapping image id to name.
pub const DIRECTORY_ID_PREFIX: &str = "id_";

/// Directory omap key prefix mapping image name to id (ignored by scans).
pub const DIRECTORY_NAME_PREFIX: &str = "name_";

/// Name of the header object for an image.
#[must_use]
pub fn header_object(image_id: &str) -> String {
    format!("image_header.{image_id}")
}

/// Name of the object-map object for an image head or one of its snapshots.
#[must_use]
pub fn object_map_object(image_id: &str, snap_id: Option<u64>) -> String {
    match snap_id {
        Some(id) => format!("object_map.{image_id}.{id:016x}"),
        None => format!("object_map.{image_id}"),
    }
}

/// Name of the backing data object at `index` for an image.
#[must_use]
pub fn data_object(image_id: &str, index: u64) -> String {
    format!("image_data.{image_id}.{index:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_names() {
        assert_eq!(header_object("ab12"), "image_header.ab12");
        assert_eq!(object_map_object("ab12", None), "object_map.ab12");
        assert_eq!(
            object_map_object("ab12", Some(5)),
            "object_map.ab12.0000000000000005"
        );
        assert_eq!(data_object("ab12", 16), "image_data.ab12.0000000000000010");
    }
}
