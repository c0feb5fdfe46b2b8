//! Instancing Module
//!
//! Runtime bookkeeping for instanced rendering: prototype validation, the
//! render source registry with its shared instance buffer, LOD statistics,
//! instance managers, and per-camera visibility count buffers.

pub mod allocator;
pub mod lod_stats;
pub mod manager;
pub mod prototype;
pub mod registry;
pub mod visibility_buffer;

pub use allocator::{BufferAllocator, BufferRegion};
pub use lod_stats::{LodRenderStatistics, compute_lod_statistics};
pub use manager::{InstanceManager, ManagedPrototype, RenderContext};
pub use prototype::{
    LodLevel, MaterialInfo, MeshInfo, PassthroughShaderConverter, Prototype, PrototypeId,
    ShaderConversionCache, ShaderConverter,
};
pub use registry::{
    GroupId, OwnerId, OwnerNotification, RenderKey, RenderSource, RenderSourceGroup,
    RenderSourceRegistry, RendererRegistration, TransformBufferType,
};
pub use visibility_buffer::{
    CameraDataRegistry, CameraId, CameraVisibilityBuffer, CpuVisibilityStorage,
    GpuVisibilityStorage, VisibilityBufferLayout, VisibilityData, VisibilitySnapshot,
    VisibilityStorage,
};
