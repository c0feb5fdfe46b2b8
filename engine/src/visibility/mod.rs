//! Visibility Module
//!
//! Bake results and their consumers. Compiled in every build: the runtime
//! needs the store reader, the artifact loader and the hash to detect stale
//! data even when the bake pipeline is compiled out.

pub mod artifact;
pub mod groups;
pub mod hash;
pub mod runtime;
pub mod store;

pub use artifact::{
    HEADER_SIZE, OCVB_MAGIC, OCVB_VERSION, VisibilityArtifactHeader, decode_artifact,
    encode_artifact, load_artifact, read_header, save_artifact,
};
pub use groups::{BakeGroup, MAX_BAKE_RENDERERS, RendererIndexTable, StripReport, strip_groups};
pub use hash::BakeHash;
pub use runtime::OcclusionLookup;
pub use store::{BakeData, BakeStatus, CompactVisibilityStore, NotBakedReason, StoreStats};
