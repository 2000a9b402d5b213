//! Shared vocabulary for the imagemeta engine.
//!
//! This crate defines the canonical record shapes returned by a pool scan
//! (`ImageInfo`, `SnapInfo`, lineage references), the closed enumerations for
//! snapshot type and protection status, the `InfoFilter` flag set callers use
//! to trade completeness for latency, and the error taxonomy shared by every
//! engine component.

pub mod config;
pub mod error;
pub mod types;

pub use config::ScanConfig;
pub use error::{Error, Result, ScanStatus};
pub use types::{
    Child, ImageInfo, InfoFilter, Parent, ProtectionStatus, SnapInfo, SnapType,
    FEATURE_FAST_DIFF, FEATURE_LAYERING, FEATURE_OBJECT_MAP,
};
