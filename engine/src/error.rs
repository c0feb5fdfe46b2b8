//! Error types
//!
//! One enum per concern. Configuration and validation problems are ordinary
//! values (the bake is simply not started / the prototype is simply not
//! registered); only genuinely unexpected conditions travel as `Err`.

use thiserror::Error;

use crate::scene::ScenePath;

/// Errors raised by a [`SceneHost`](crate::scene::SceneHost) implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SceneError {
    #[error("scene `{0}` is not known to the host")]
    UnknownScene(ScenePath),
    #[error("scene `{0}` is not loaded")]
    NotLoaded(ScenePath),
    #[error("failed to save scene `{path}`: {reason}")]
    SaveFailed { path: ScenePath, reason: String },
    #[error("scene split is not symmetric with the merge: {0}")]
    AsymmetricSplit(String),
    #[error("host error: {0}")]
    Host(String),
}

/// Errors raised by a point-visibility query backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("query backend has not been prepared with a renderer set")]
    NotPrepared,
    #[error("unknown query handle {0}")]
    UnknownHandle(u64),
    #[error("no free query slot (capacity {0})")]
    NoFreeSlot(usize),
    #[error("GPU readback failed: {0}")]
    Readback(String),
    #[error("GPU device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Errors raised by the compact visibility store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("location index {index} out of range (store holds {len} locations)")]
    LocationOutOfRange { index: usize, len: usize },
    #[error("store already completed; raw data is read-only")]
    AlreadyCompleted,
    #[error("malformed compact data: {0}")]
    Malformed(String),
}

/// Errors raised while reading or writing a persisted visibility artifact.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("file too short for visibility artifact")]
    FileTooShort,
    #[error("invalid magic bytes (expected OCVB)")]
    InvalidMagic,
    #[error("unsupported visibility artifact version: {0}")]
    UnsupportedVersion(u32),
    #[error("corrupt artifact: {0}")]
    Corrupt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a prototype cannot be registered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PrototypeError {
    #[error("prototype `{prototype}` has no LOD levels")]
    NoLods { prototype: String },
    #[error("prototype `{prototype}` LOD {lod} has no mesh")]
    MissingMesh { prototype: String, lod: usize },
    #[error("prototype `{prototype}` LOD {lod} material slot {slot} is empty")]
    MissingMaterial {
        prototype: String,
        lod: usize,
        slot: usize,
    },
    #[error("material `{material}` has no shader")]
    MissingShader { material: String },
    #[error("shader `{shader}` failed to convert for {platform}: {reason}")]
    ShaderConversionFailed {
        shader: String,
        platform: String,
        reason: String,
    },
}

/// Errors raised by the render source registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error(transparent)]
    Prototype(#[from] PrototypeError),
    #[error("render key {0} is not registered")]
    UnknownKey(u32),
    #[error("no prototype with id {0} is registered")]
    UnknownPrototype(u32),
    #[error("render key space exhausted")]
    KeysExhausted,
    #[error("instance buffer allocation of {0} bytes failed")]
    AllocationFailed(u64),
}

/// Errors surfaced by the bake pipeline itself.
#[cfg(feature = "bake")]
#[derive(Error, Debug)]
pub enum BakeError {
    #[error("sampler batch is full ({0} pending); complete the batch first")]
    BatchFull(usize),
    #[error("a bake is already running")]
    AlreadyRunning,
    #[error("no bake has been started")]
    NotStarted,
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("post-bake hook `{hook}` failed: {reason}")]
    Hook { hook: String, reason: String },
}
