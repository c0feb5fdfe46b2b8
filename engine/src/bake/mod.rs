//! Bake Module
//!
//! The bake-time half of the crate: sampling location generation, the batched
//! occluder sampler over a swappable point-visibility backend, the phase
//! state machine and the multi-bake queue. Compiled only with the `bake`
//! feature; runtime consumers need just [`crate::visibility`].

pub mod gpu_backend;
pub mod orchestrator;
pub mod progress;
pub mod query;
pub mod queue;
pub mod raycast;
pub mod sampler;
pub mod sampling;

pub use gpu_backend::GpuVisibilityQuery;
pub use orchestrator::{
    AbortCause, AbortReason, BakeContext, BakeOrchestrator, BakeOutcome, BakePhase, BakeReport,
    BakeRequest, BakeScope, CancelToken, ConfigIssue, GroupSpec, MeshStatistics, PostBakeHook,
    StepResult,
};
pub use progress::{BakeProgress, Ema, LogProgressSink, ProgressSink, RecordingProgressSink};
pub use query::{PointVisibilityQuery, QueryHandle, QueryParams, QueryResult, SampleTarget};
pub use queue::{BakeQueue, QueueStep};
pub use raycast::{RaycastVisibilityQuery, evaluate_visibility};
pub use sampler::{BatchedOccluderSampler, SamplerCounters};
pub use sampling::{
    AboveHeightProvider, ActiveProvider, InsideBoundsProvider, OutsideRenderersProvider,
    ProviderSpec, SamplingLocation, SamplingLocationTable,
};
