//! Bake Orchestrator
//!
//! Drives one bake through its phases, one host tick per `step`:
//!
//! ```text
//! Idle -> Preparing -> SceneDuplicated -> Sampling -> PostProcessing -> Completed
//!             |               |               |             |
//!             +---------------+---------------+-------------+--> Aborted(reason)
//! ```
//!
//! Nothing touches the scene until validation passes. Once the temporary
//! scene exists, every exit path (completion, cancellation, failure) closes it
//! and restores the scenes that were open before the bake. Sampling only ever
//! manipulates the temporary scene.
//!
//! The orchestrator owns its sampler (and through it the query backend) for
//! its whole lifetime, so one orchestrator can run many bakes in sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::progress::{BakeProgress, Ema, LogProgressSink, ProgressSink};
use super::query::{PointVisibilityQuery, QueryParams, SampleTarget};
use super::sampler::{BatchedOccluderSampler, SamplerCounters};
use super::sampling::{ActiveProvider, ProviderSpec, SamplingLocationTable};
use crate::config::BakeSettings;
use crate::error::{BakeError, QueryError, SceneError, StoreError};
use crate::scene::{RendererId, RendererRef, SaveOutcome, SceneHost, ScenePath, SceneState};
use crate::visibility::{
    BakeData, BakeGroup, BakeHash, CompactVisibilityStore, MAX_BAKE_RENDERERS,
    RendererIndexTable, StripReport, save_artifact, strip_groups,
};
use crate::world::{BakeVolume, GridLayout, SamplingGrid};

// ============================================================================
// REQUEST
// ============================================================================

/// Renderers of one bake group, referenced by id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub renderers: Vec<RendererId>,
}

/// Which scenes a bake covers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BakeScope {
    Single(ScenePath),
    /// Merged into one temporary scene and split back afterwards
    MultiScene(Vec<ScenePath>),
}

impl BakeScope {
    pub fn scenes(&self) -> &[ScenePath] {
        match self {
            BakeScope::Single(path) => std::slice::from_ref(path),
            BakeScope::MultiScene(paths) => paths,
        }
    }
}

/// One bake target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BakeRequest {
    pub name: String,
    pub scope: BakeScope,
    pub volume: BakeVolume,
    /// Regular grid with `BakeSettings::cell_size` when `None`
    #[serde(default)]
    pub layout: Option<GridLayout>,
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
    /// Overrides `BakeSettings::output_path`
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

// ============================================================================
// PHASES AND OUTCOMES
// ============================================================================

/// Why a bake could not start. Nothing needs to be restored.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigIssue {
    EmptyScope,
    TooFewGroups { non_empty: usize },
    TooManyRenderers(usize),
    InvalidVolume,
    EmptyGrid,
    InvalidSettings(String),
    SaveDeclined(ScenePath),
    Scene(SceneError),
}

/// Why a running bake stopped.
#[derive(Clone, Debug, PartialEq)]
pub enum AbortCause {
    Cancelled,
    Query(QueryError),
    Store(StoreError),
    Scene(SceneError),
    Hook { hook: String, reason: String },
    Internal(String),
}

impl From<BakeError> for AbortCause {
    fn from(e: BakeError) -> Self {
        match e {
            BakeError::Query(q) => AbortCause::Query(q),
            BakeError::Store(s) => AbortCause::Store(s),
            BakeError::Scene(s) => AbortCause::Scene(s),
            BakeError::Hook { hook, reason } => AbortCause::Hook { hook, reason },
            other => AbortCause::Internal(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AbortReason {
    /// Rejected before any scene mutation
    BakeNotStarted(ConfigIssue),
    /// Stopped after the scene was touched; pending queries were drained and
    /// the scene restored
    BakeAborted(AbortCause),
}

#[derive(Clone, Debug, PartialEq)]
pub enum BakePhase {
    Idle,
    Preparing,
    SceneDuplicated,
    Sampling,
    PostProcessing,
    Completed,
    Aborted(AbortReason),
}

impl BakePhase {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BakePhase::Preparing
                | BakePhase::SceneDuplicated
                | BakePhase::Sampling
                | BakePhase::PostProcessing
        )
    }
}

/// What one `step` call did.
#[derive(Clone, Debug, PartialEq)]
pub enum StepResult {
    /// Call again right away
    Continue,
    /// Work was dispatched; call again next tick
    Yield,
    /// Nothing left to do
    Done,
    Aborted(AbortReason),
}

/// Aggregated mesh statistics of the baked renderers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStatistics {
    pub renderer_count: usize,
    pub vertex_count: u64,
    pub submesh_count: u64,
}

impl MeshStatistics {
    pub fn of<'a>(renderers: impl IntoIterator<Item = &'a RendererRef>) -> Self {
        renderers
            .into_iter()
            .fold(MeshStatistics::default(), |mut acc, r| {
                acc.renderer_count += 1;
                acc.vertex_count += u64::from(r.stats.vertex_count);
                acc.submesh_count += u64::from(r.stats.submesh_count);
                acc
            })
    }
}

/// Result of a completed bake.
#[derive(Clone, Debug)]
pub struct BakeReport {
    pub data: BakeData,
    pub mesh_stats: MeshStatistics,
    pub strip: StripReport,
    pub sampled_locations: usize,
    pub skipped_locations: usize,
    pub persisted_to: Option<PathBuf>,
    /// Scene restore problem after an otherwise successful bake
    pub restore_error: Option<SceneError>,
}

#[derive(Clone, Debug)]
pub struct BakeOutcome {
    pub name: String,
    pub result: Result<BakeReport, AbortReason>,
}

// ============================================================================
// CONTEXT
// ============================================================================

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs after sampling, before the temporary scene is torn down. An error
/// aborts the bake.
pub trait PostBakeHook {
    fn name(&self) -> &str;
    fn run(&mut self, data: &BakeData, stats: &MeshStatistics) -> Result<(), BakeError>;
}

/// Everything a bake needs besides the scene host and the backend.
pub struct BakeContext {
    pub settings: BakeSettings,
    hooks: Vec<Box<dyn PostBakeHook>>,
    cancel: CancelToken,
    progress: Box<dyn ProgressSink>,
}

impl BakeContext {
    pub fn new(settings: BakeSettings) -> Self {
        Self {
            settings,
            hooks: Vec::new(),
            cancel: CancelToken::new(),
            progress: Box::new(LogProgressSink::default()),
        }
    }

    pub fn with_hook(mut self, hook: impl PostBakeHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn with_progress_sink(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Box::new(sink);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// State of the bake currently in flight.
struct ActiveBake {
    request: BakeRequest,
    started: Instant,
    groups: Vec<BakeGroup>,
    strip: StripReport,
    table: RendererIndexTable,
    renderers: Vec<RendererRef>,
    mesh_stats: MeshStatistics,
    grid: SamplingGrid,
    hash: BakeHash,
    /// Scene states before any host call; `Some` once the scene may be touched
    snapshot: Option<Vec<SceneState>>,
    temp_scene: Option<ScenePath>,
    locations: Option<SamplingLocationTable>,
    store: CompactVisibilityStore,
    next_location: usize,
    sampled: usize,
    skipped: usize,
    ema: Ema,
    batch_started: Option<Instant>,
    data: Option<BakeData>,
}

pub struct BakeOrchestrator<Q: PointVisibilityQuery> {
    sampler: BatchedOccluderSampler<Q>,
    context: BakeContext,
    phase: BakePhase,
    request: Option<BakeRequest>,
    /// Name of the current or last bake
    name: String,
    active: Option<ActiveBake>,
    outcome: Option<BakeOutcome>,
}

impl<Q: PointVisibilityQuery> BakeOrchestrator<Q> {
    pub fn new(backend: Q, context: BakeContext) -> Self {
        let sampler = BatchedOccluderSampler::new(
            backend,
            context.settings.batch_count,
            context.settings.validate_raw_data,
        );
        Self {
            sampler,
            context,
            phase: BakePhase::Idle,
            request: None,
            name: String::new(),
            active: None,
            outcome: None,
        }
    }

    pub fn phase(&self) -> &BakePhase {
        &self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase.is_active()
    }

    pub fn context(&self) -> &BakeContext {
        &self.context
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.context.cancel_token()
    }

    pub fn sampler(&self) -> &BatchedOccluderSampler<Q> {
        &self.sampler
    }

    pub fn sampler_counters(&self) -> SamplerCounters {
        self.sampler.counters()
    }

    /// Outcome of the last finished bake, if not taken yet.
    pub fn take_outcome(&mut self) -> Option<BakeOutcome> {
        self.outcome.take()
    }

    /// Queue `request` as the next bake. Work starts on the next `step`.
    pub fn start(&mut self, request: BakeRequest) -> Result<(), BakeError> {
        if self.is_running() {
            return Err(BakeError::AlreadyRunning);
        }
        log::info!("[Bake] starting `{}`", request.name);
        self.context.cancel.reset();
        self.sampler.set_batch_count(self.context.settings.batch_count);
        self.sampler.set_validate(self.context.settings.validate_raw_data);
        self.name = request.name.clone();
        self.request = Some(request);
        self.outcome = None;
        self.phase = BakePhase::Preparing;
        Ok(())
    }

    /// Request cancellation; the next `step` aborts unless sampling has
    /// already finished, in which case the bake completes normally.
    pub fn cancel(&self) {
        self.context.cancel.cancel();
    }

    /// Advance the bake by one host tick.
    pub fn step(&mut self, host: &mut dyn SceneHost) -> StepResult {
        if !self.phase.is_active() {
            return match &self.phase {
                BakePhase::Aborted(reason) => StepResult::Aborted(reason.clone()),
                _ => StepResult::Done,
            };
        }

        // Sampling results are complete once post-processing starts
        if self.context.cancel.is_cancelled() && self.phase != BakePhase::PostProcessing {
            log::info!("[Bake] cancellation requested");
            return self.abort(host, AbortReason::BakeAborted(AbortCause::Cancelled));
        }

        let result = match self.phase {
            BakePhase::Preparing => self.step_preparing(host),
            BakePhase::SceneDuplicated => self.step_scene_duplicated(host),
            BakePhase::Sampling => self.step_sampling(),
            BakePhase::PostProcessing => self.step_post_processing(),
            _ => Ok(StepResult::Done),
        };

        match result {
            Ok(StepResult::Done) if self.phase == BakePhase::Completed => self.finish(host),
            Ok(step) => step,
            Err(reason) => self.abort(host, reason),
        }
    }

    /// Step until the bake finishes and return its outcome.
    pub fn run_to_completion(&mut self, host: &mut dyn SceneHost) -> Option<BakeOutcome> {
        loop {
            match self.step(host) {
                StepResult::Continue | StepResult::Yield => continue,
                StepResult::Done | StepResult::Aborted(_) => break,
            }
        }
        self.take_outcome()
    }

    // ------------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------------

    fn step_preparing(&mut self, host: &mut dyn SceneHost) -> Result<StepResult, AbortReason> {
        let not_started = AbortReason::BakeNotStarted;
        let Some(request) = self.request.take() else {
            return Err(AbortReason::BakeAborted(AbortCause::Internal(
                "no request to prepare".into(),
            )));
        };
        let settings = &self.context.settings;

        settings
            .validate()
            .map_err(|e| not_started(ConfigIssue::InvalidSettings(e.to_string())))?;
        if request.scope.scenes().is_empty() {
            return Err(not_started(ConfigIssue::EmptyScope));
        }
        if !request.volume.is_valid() {
            return Err(not_started(ConfigIssue::InvalidVolume));
        }
        let layout = request.layout.clone().unwrap_or(GridLayout::Regular {
            cell_size: settings.cell_size,
        });
        let grid = SamplingGrid::new(request.volume, layout);
        if grid.location_count() == 0 {
            return Err(not_started(ConfigIssue::EmptyGrid));
        }

        // Resolve group membership against the scenes in scope.
        let mut by_id: HashMap<RendererId, RendererRef> = HashMap::new();
        for scene in request.scope.scenes() {
            let renderers = host
                .renderers_in_scene(scene)
                .map_err(|e| not_started(ConfigIssue::Scene(e)))?;
            for r in renderers {
                by_id.entry(r.id).or_insert(r);
            }
        }
        let mut missing = 0usize;
        let raw_groups: Vec<BakeGroup> = request
            .groups
            .iter()
            .map(|group| {
                let renderers = group
                    .renderers
                    .iter()
                    .filter_map(|id| {
                        let found = by_id.get(id).cloned();
                        if found.is_none() {
                            missing += 1;
                        }
                        found
                    })
                    .collect();
                BakeGroup::new(group.name.clone(), renderers)
            })
            .collect();
        if missing > 0 {
            log::warn!("[Bake] {missing} group renderers are not present in the scene(s)");
        }

        let (groups, strip) = strip_groups(&raw_groups);
        if strip.total() > 0 {
            log::info!(
                "[Bake] stripped {} renderers ({} excluded, {} invalid, {} duplicate)",
                strip.total(),
                strip.excluded,
                strip.invalid,
                strip.duplicate
            );
        }
        let non_empty = groups.iter().filter(|g| !g.is_empty()).count();
        if non_empty < 2 {
            return Err(not_started(ConfigIssue::TooFewGroups { non_empty }));
        }
        let renderers: Vec<RendererRef> = groups
            .iter()
            .flat_map(|g| g.renderers.iter().cloned())
            .collect();
        if renderers.len() > MAX_BAKE_RENDERERS {
            return Err(not_started(ConfigIssue::TooManyRenderers(renderers.len())));
        }

        let table = RendererIndexTable::from_groups(&groups);
        let mesh_stats = MeshStatistics::of(&renderers);
        let hash = BakeHash::compute(&groups, &grid, settings.max_sample_distance);
        log::info!(
            "[Bake] `{}`: {} groups, {} renderers, {} vertices, {} locations, hash {hash}",
            request.name,
            groups.len(),
            mesh_stats.renderer_count,
            mesh_stats.vertex_count,
            grid.location_count()
        );

        // Save before anything is duplicated; a refusal means no bake.
        if settings.save_scene_before_bake {
            for scene in request.scope.scenes() {
                match host.save_scene(scene) {
                    Ok(SaveOutcome::Saved) => {}
                    Ok(SaveOutcome::Declined) => {
                        return Err(not_started(ConfigIssue::SaveDeclined(scene.clone())));
                    }
                    Err(e) => return Err(not_started(ConfigIssue::Scene(e))),
                }
            }
        }

        let store = CompactVisibilityStore::new(grid.location_count(), renderers.len());
        let mut active = ActiveBake {
            request,
            started: Instant::now(),
            groups,
            strip,
            table,
            renderers,
            mesh_stats,
            grid,
            hash,
            snapshot: Some(host.scene_states()),
            temp_scene: None,
            locations: None,
            store,
            next_location: 0,
            sampled: 0,
            skipped: 0,
            ema: Ema::new(settings.ema_smoothing),
            batch_started: None,
            data: None,
        };

        let temp = match &active.request.scope {
            BakeScope::Single(scene) => host.duplicate_scene_additive(scene),
            BakeScope::MultiScene(scenes) => host.merge_scenes(scenes),
        };
        let temp = match temp {
            Ok(temp) => temp,
            Err(e) => {
                self.active = Some(active);
                return Err(AbortReason::BakeAborted(AbortCause::Scene(e)));
            }
        };
        log::debug!("[Bake] sampling scene `{temp}`");
        active.temp_scene = Some(temp);
        self.active = Some(active);
        self.phase = BakePhase::SceneDuplicated;
        Ok(StepResult::Yield)
    }

    fn step_scene_duplicated(
        &mut self,
        host: &mut dyn SceneHost,
    ) -> Result<StepResult, AbortReason> {
        let aborted = AbortReason::BakeAborted;
        let Some(active) = self.active.as_mut() else {
            return Err(aborted(AbortCause::Internal("no active bake".into())));
        };
        let Some(temp) = active.temp_scene.clone() else {
            return Err(aborted(AbortCause::Internal("temporary scene missing".into())));
        };
        let ids: Vec<RendererId> = active.renderers.iter().map(|r| r.id).collect();
        host.prepare_sampling_scene(&temp, &ids)
            .map_err(|e| aborted(AbortCause::Scene(e)))?;

        let providers: Vec<Box<dyn ActiveProvider>> = active
            .request
            .providers
            .iter()
            .map(|p| p.build(&active.renderers))
            .collect();
        let provider_refs: Vec<&dyn ActiveProvider> = providers.iter().map(|p| p.as_ref()).collect();
        let locations = SamplingLocationTable::from_grid(active.grid.clone(), &provider_refs);
        log::info!(
            "[Bake] {} of {} locations active",
            locations.active_count(),
            locations.len()
        );
        active.locations = Some(locations);

        let targets = SampleTarget::from_renderers(&active.renderers);
        let params = QueryParams {
            max_sample_distance: self.context.settings.max_sample_distance,
            probe_shrink: self.context.settings.probe_shrink,
        };
        self.sampler
            .prepare(&targets, params)
            .map_err(|e| aborted(e.into()))?;
        log::debug!("[Bake] backend `{}` prepared", self.sampler.backend().name());

        self.phase = BakePhase::Sampling;
        Ok(StepResult::Yield)
    }

    fn step_sampling(&mut self) -> Result<StepResult, AbortReason> {
        let aborted = |e: BakeError| AbortReason::BakeAborted(e.into());
        let Some(active) = self.active.as_mut() else {
            return Err(AbortReason::BakeAborted(AbortCause::Internal(
                "no active bake".into(),
            )));
        };
        let sampler = &mut self.sampler;

        // Complete the batch issued last tick.
        if sampler.has_pending() {
            let written = sampler.complete_pending(&mut active.store).map_err(aborted)?;
            if let Some(started) = active.batch_started.take()
                && written > 0
            {
                let per_sample = started.elapsed().as_secs_f64() / written as f64;
                active.ema.update(per_sample);
            }
            active.sampled += written;
        }

        // Issue the next batch.
        let Some(locations) = active.locations.as_ref() else {
            return Err(AbortReason::BakeAborted(AbortCause::Internal(
                "sampling locations missing".into(),
            )));
        };
        let total = locations.len();
        while !sampler.is_full() && active.next_location < total {
            let index = active.next_location;
            let Some(location) = locations.location(index) else {
                break;
            };
            if location.active {
                sampler
                    .sample_position(index, location.position)
                    .map_err(aborted)?;
            } else {
                active
                    .store
                    .set_raw_data(index, &[], false)
                    .map_err(|e| aborted(e.into()))?;
                active.skipped += 1;
            }
            active.next_location += 1;
        }
        if sampler.has_pending() {
            active.batch_started = Some(Instant::now());
        }

        let done = active.sampled + active.skipped;
        let remaining_active = locations.active_count().saturating_sub(active.sampled);
        let progress = BakeProgress {
            title: active.request.name.clone(),
            info: format!("{done}/{total} locations"),
            fraction: if total == 0 { 1.0 } else { done as f32 / total as f32 },
            completed_samples: done,
            total_samples: total,
            estimated_remaining: active
                .ema
                .value()
                .map(|per| Duration::from_secs_f64(per * remaining_active as f64)),
        };
        self.context.progress.report(&progress);

        if active.next_location >= total && !sampler.has_pending() {
            self.phase = BakePhase::PostProcessing;
            return Ok(StepResult::Continue);
        }
        Ok(StepResult::Yield)
    }

    fn step_post_processing(&mut self) -> Result<StepResult, AbortReason> {
        let Some(active) = self.active.as_mut() else {
            return Err(AbortReason::BakeAborted(AbortCause::Internal(
                "no active bake".into(),
            )));
        };
        active.store.complete_bake();

        let render_date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let data = BakeData {
            bake_completed: false,
            bake_hash: active.hash,
            grid: active.grid.clone(),
            store: std::mem::take(&mut active.store),
            render_date,
            render_duration: active.started.elapsed(),
            renderers: active.table.clone(),
        };

        for hook in self.context.hooks.iter_mut() {
            if let Err(e) = hook.run(&data, &active.mesh_stats) {
                log::error!("[Bake] post-bake hook `{}` failed: {e}", hook.name());
                return Err(AbortReason::BakeAborted(AbortCause::Hook {
                    hook: hook.name().to_string(),
                    reason: e.to_string(),
                }));
            }
        }

        active.data = Some(data);
        self.phase = BakePhase::Completed;
        Ok(StepResult::Done)
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    fn finish(&mut self, host: &mut dyn SceneHost) -> StepResult {
        let Some(mut active) = self.active.take() else {
            return StepResult::Done;
        };
        let restore_error = restore_scenes(host, active.temp_scene.take(), active.snapshot.as_deref());

        let Some(mut data) = active.data.take() else {
            return self.abort(
                host,
                AbortReason::BakeAborted(AbortCause::Internal("bake data missing".into())),
            );
        };
        data.bake_completed = true;

        let output = active
            .request
            .output_path
            .clone()
            .or_else(|| self.context.settings.output_path.clone());
        let persisted_to = output.and_then(|path| match save_artifact(&path, &data) {
            Ok(()) => Some(path),
            Err(e) => {
                log::error!("[Bake] failed to write {}: {e}", path.display());
                None
            }
        });

        log::info!(
            "[Bake] `{}` completed in {:.2}s ({} sampled, {} skipped)",
            active.request.name,
            data.render_duration.as_secs_f32(),
            active.sampled,
            active.skipped
        );
        self.context.progress.clear();
        self.outcome = Some(BakeOutcome {
            name: self.name.clone(),
            result: Ok(BakeReport {
                data,
                mesh_stats: active.mesh_stats,
                strip: active.strip,
                sampled_locations: active.sampled,
                skipped_locations: active.skipped,
                persisted_to,
                restore_error,
            }),
        });
        StepResult::Done
    }

    fn abort(&mut self, host: &mut dyn SceneHost, reason: AbortReason) -> StepResult {
        self.sampler.abort();
        let name = self.name.clone();
        self.request = None;
        if let Some(mut active) = self.active.take()
            && active.snapshot.is_some()
            && let Some(e) =
                restore_scenes(host, active.temp_scene.take(), active.snapshot.as_deref())
        {
            log::error!("[Bake] restore after abort failed: {e}");
        }
        match &reason {
            AbortReason::BakeNotStarted(issue) => {
                log::warn!("[Bake] `{name}` not started: {issue:?}")
            }
            AbortReason::BakeAborted(cause) => log::warn!("[Bake] `{name}` aborted: {cause:?}"),
        }
        self.context.progress.clear();
        self.phase = BakePhase::Aborted(reason.clone());
        self.outcome = Some(BakeOutcome {
            name,
            result: Err(reason.clone()),
        });
        StepResult::Aborted(reason)
    }
}

/// Close the temporary scene and put every scene back in its recorded state.
///
/// Errors are logged and the first one is returned; teardown always runs to
/// the end.
fn restore_scenes(
    host: &mut dyn SceneHost,
    temp_scene: Option<ScenePath>,
    snapshot: Option<&[SceneState]>,
) -> Option<SceneError> {
    let mut first_error: Option<SceneError> = None;
    let mut note = |e: SceneError| {
        log::error!("[Bake] scene teardown: {e}");
        first_error.get_or_insert(e);
    };

    if let Some(temp) = temp_scene
        && let Err(e) = host.close_scene(&temp, false)
    {
        note(e);
    }

    let Some(snapshot) = snapshot else {
        return first_error;
    };
    let current: HashMap<ScenePath, bool> = host
        .scene_states()
        .into_iter()
        .map(|s| (s.path, s.loaded))
        .collect();
    for state in snapshot {
        let now_loaded = current.get(&state.path).copied();
        let result = match (state.loaded, now_loaded) {
            (true, Some(true)) | (false, Some(false)) => Ok(()),
            (true, _) => host.reopen_scene(&state.path),
            (false, _) => host.set_scene_loaded(&state.path, false),
        };
        if let Err(e) = result {
            note(e);
        }
    }

    // Every scene present before must be present after, with the same flag.
    let after: HashMap<ScenePath, bool> = host
        .scene_states()
        .into_iter()
        .map(|s| (s.path, s.loaded))
        .collect();
    let mismatched: Vec<String> = snapshot
        .iter()
        .filter(|s| after.get(&s.path) != Some(&s.loaded))
        .map(|s| s.path.to_string())
        .collect();
    if !mismatched.is_empty() {
        note(SceneError::AsymmetricSplit(mismatched.join(", ")));
    }
    first_error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bake::progress::RecordingProgressSink;
    use crate::bake::raycast::RaycastVisibilityQuery;
    use crate::scene::{MemorySceneHost, MeshStats};
    use crate::world::Aabb;
    use glam::Vec3;

    fn renderer(id: u64, center: Vec3) -> RendererRef {
        RendererRef::mesh(
            id,
            Aabb::from_center_size(center, Vec3::ONE),
            MeshStats {
                vertex_count: 24,
                submesh_count: 1,
            },
        )
    }

    fn host() -> MemorySceneHost {
        let mut host = MemorySceneHost::new();
        host.add_scene(
            ScenePath::new("level"),
            vec![
                renderer(1, Vec3::new(4.0, 0.0, 0.0)),
                renderer(2, Vec3::new(-4.0, 0.0, 0.0)),
            ],
        );
        host
    }

    fn request(groups: Vec<GroupSpec>) -> BakeRequest {
        BakeRequest {
            name: "level".into(),
            scope: BakeScope::Single(ScenePath::new("level")),
            volume: BakeVolume::new(Vec3::ZERO, Vec3::splat(4.0)),
            layout: None,
            groups,
            providers: Vec::new(),
            output_path: None,
        }
    }

    fn two_groups() -> Vec<GroupSpec> {
        vec![
            GroupSpec {
                name: "east".into(),
                renderers: vec![RendererId(1)],
            },
            GroupSpec {
                name: "west".into(),
                renderers: vec![RendererId(2)],
            },
        ]
    }

    fn orchestrator() -> BakeOrchestrator<RaycastVisibilityQuery> {
        BakeOrchestrator::new(
            RaycastVisibilityQuery::new(),
            BakeContext::new(BakeSettings::default()),
        )
    }

    #[test]
    fn test_full_bake_walks_every_phase() {
        let mut host = host();
        let mut orch = orchestrator();
        orch.start(request(two_groups())).unwrap();
        assert_eq!(orch.phase(), &BakePhase::Preparing);

        let mut seen = vec![orch.phase().clone()];
        loop {
            let step = orch.step(&mut host);
            if seen.last() != Some(orch.phase()) {
                seen.push(orch.phase().clone());
            }
            if matches!(step, StepResult::Done | StepResult::Aborted(_)) {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                BakePhase::Preparing,
                BakePhase::SceneDuplicated,
                BakePhase::Sampling,
                BakePhase::PostProcessing,
                BakePhase::Completed,
            ]
        );

        let report = orch.take_outcome().unwrap().result.unwrap();
        assert!(report.data.bake_completed);
        assert_eq!(report.data.store.location_count(), 8);
        // Both cubes are visible from every location inside the volume.
        for (_, visible) in report.data.store.iter() {
            assert_eq!(visible, &[0u16, 1][..]);
        }
        assert_eq!(report.mesh_stats.vertex_count, 48);
        assert!(host.temporary_scenes().is_empty());
        assert_eq!(host.live_mutations(), 0);
    }

    #[test]
    fn test_start_while_running_is_refused() {
        let mut orch = orchestrator();
        orch.start(request(two_groups())).unwrap();
        assert!(matches!(
            orch.start(request(two_groups())),
            Err(BakeError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_single_group_never_touches_scene() {
        let mut host = host();
        let mut orch = orchestrator();
        let mut groups = two_groups();
        groups.truncate(1);
        orch.start(request(groups)).unwrap();
        let outcome = orch.run_to_completion(&mut host).unwrap();
        assert_eq!(
            outcome.result.unwrap_err(),
            AbortReason::BakeNotStarted(ConfigIssue::TooFewGroups { non_empty: 1 })
        );
        assert!(host.journal().is_empty());
        assert_eq!(orch.sampler_counters().issued, 0);
    }

    #[test]
    fn test_cancel_restores_scene() {
        let mut host = host();
        let sink = RecordingProgressSink::new();
        let mut orch = BakeOrchestrator::new(
            RaycastVisibilityQuery::new(),
            BakeContext::new(BakeSettings {
                batch_count: 2,
                ..BakeSettings::default()
            })
            .with_progress_sink(sink.clone()),
        );
        orch.start(request(two_groups())).unwrap();
        while orch.phase() != &BakePhase::Sampling {
            orch.step(&mut host);
        }
        orch.step(&mut host);
        orch.cancel_token().cancel();
        let step = orch.step(&mut host);

        assert_eq!(
            step,
            StepResult::Aborted(AbortReason::BakeAborted(AbortCause::Cancelled))
        );
        let c = orch.sampler_counters();
        assert_eq!(c.issued, c.released);
        assert!(host.temporary_scenes().is_empty());
        assert!(host.is_loaded(&ScenePath::new("level")));
        assert_eq!(sink.cleared(), 1);
    }

    #[test]
    fn test_cancel_after_sampling_keeps_bake() {
        let mut host = host();
        let mut orch = BakeOrchestrator::new(
            RaycastVisibilityQuery::new(),
            BakeContext::new(BakeSettings::default()),
        );
        orch.start(request(two_groups())).unwrap();
        while orch.phase() != &BakePhase::PostProcessing {
            orch.step(&mut host);
        }
        orch.cancel();

        assert_eq!(orch.step(&mut host), StepResult::Done);
        let report = orch.take_outcome().unwrap().result.unwrap();
        assert!(report.data.bake_completed);
        assert!(host.temporary_scenes().is_empty());
    }

    #[test]
    fn test_failing_hook_aborts() {
        struct Reject;
        impl PostBakeHook for Reject {
            fn name(&self) -> &str {
                "reject"
            }
            fn run(&mut self, _: &BakeData, _: &MeshStatistics) -> Result<(), BakeError> {
                Err(BakeError::Hook {
                    hook: "reject".into(),
                    reason: "nope".into(),
                })
            }
        }

        let mut host = host();
        let mut orch = BakeOrchestrator::new(
            RaycastVisibilityQuery::new(),
            BakeContext::new(BakeSettings::default()).with_hook(Reject),
        );
        orch.start(request(two_groups())).unwrap();
        let outcome = orch.run_to_completion(&mut host).unwrap();
        assert!(matches!(
            outcome.result,
            Err(AbortReason::BakeAborted(AbortCause::Hook { .. }))
        ));
        assert!(host.temporary_scenes().is_empty());
    }

    #[test]
    fn test_cancel_token_clones_share_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!other.is_cancelled());
    }
}
