//! Bake Scene - Headless Visibility Baker
//!
//! Bakes every request in a JSON scene file against an in-memory scene host
//! and writes one `.ocvb` artifact per request.
//!
//! Run with: `cargo run --bin bake_scene -- scene.json [options]`
//!
//! Options:
//! - `--settings <file>`: BakeSettings JSON (defaults otherwise)
//! - `--backend <auto|cpu|gpu>`: override the settings' backend
//! - `--out <dir>`: directory for artifacts of requests without an output path
//!
//! Scene file:
//!
//! ```json
//! {
//!   "scenes": [{ "path": "level", "renderers": [ ... ] }],
//!   "bakes": [{ "name": "level", "scope": { "single": "level" }, "volume": { ... }, "groups": [ ... ] }]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use serde::Deserialize;

use occlusion_bake_engine::bake::{
    BakeContext, BakeOrchestrator, BakeQueue, BakeRequest, GpuVisibilityQuery,
    PointVisibilityQuery, RaycastVisibilityQuery,
};
use occlusion_bake_engine::config::{BakeSettings, SamplerBackendKind};
use occlusion_bake_engine::gpu::{HeadlessGpu, HeadlessGpuConfig};
use occlusion_bake_engine::scene::{MemorySceneHost, SceneDescription};
use occlusion_bake_engine::visibility::StoreStats;

#[derive(Debug, Deserialize)]
struct SceneFile {
    scenes: Vec<SceneDescription>,
    bakes: Vec<BakeRequest>,
}

#[derive(Debug, Default)]
struct Args {
    scene: PathBuf,
    settings: Option<PathBuf>,
    backend: Option<SamplerBackendKind>,
    out_dir: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut scene = None;
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--settings" => {
                args.settings = Some(iter.next().ok_or("--settings needs a file")?.into());
            }
            "--out" => {
                args.out_dir = Some(iter.next().ok_or("--out needs a directory")?.into());
            }
            "--backend" => {
                let value = iter.next().ok_or("--backend needs a value")?;
                args.backend = Some(match value.as_str() {
                    "auto" => SamplerBackendKind::Auto,
                    "cpu" => SamplerBackendKind::Cpu,
                    "gpu" => SamplerBackendKind::Gpu,
                    other => return Err(format!("unknown backend `{other}`")),
                });
            }
            other if other.starts_with("--") => return Err(format!("unknown option `{other}`")),
            other => scene = Some(PathBuf::from(other)),
        }
    }
    args.scene = scene.ok_or("missing scene file")?;
    Ok(args)
}

fn create_backend(
    kind: SamplerBackendKind,
    batch_count: usize,
) -> Result<Box<dyn PointVisibilityQuery>, String> {
    match kind {
        SamplerBackendKind::Cpu => Ok(Box::new(RaycastVisibilityQuery::new())),
        SamplerBackendKind::Gpu => {
            let gpu = HeadlessGpu::new(HeadlessGpuConfig::default()).map_err(|e| e.to_string())?;
            Ok(Box::new(GpuVisibilityQuery::new(Arc::new(gpu), batch_count)))
        }
        SamplerBackendKind::Auto => match HeadlessGpu::try_default() {
            Some(gpu) => Ok(Box::new(GpuVisibilityQuery::new(Arc::new(gpu), batch_count))),
            None => {
                log::info!("[BakeScene] no GPU adapter; using the CPU backend");
                Ok(Box::new(RaycastVisibilityQuery::new()))
            }
        },
    }
}

fn load_scene_file(path: &Path) -> Result<SceneFile, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}

fn run(args: Args) -> Result<bool, String> {
    let mut settings = match &args.settings {
        Some(path) => BakeSettings::from_json_file(path).map_err(|e| e.to_string())?,
        None => BakeSettings::default(),
    };
    if let Some(backend) = args.backend {
        settings.backend = backend;
    }
    settings.validate().map_err(|e| e.to_string())?;

    let scene_file = load_scene_file(&args.scene)?;
    let out_dir = args
        .out_dir
        .clone()
        .or_else(|| args.scene.parent().map(Path::to_path_buf))
        .unwrap_or_default();

    let backend = create_backend(settings.backend, settings.batch_count)?;
    log::info!("[BakeScene] backend: {}", backend.name());

    let mut host = MemorySceneHost::from_descriptions(scene_file.scenes);
    let mut queue = BakeQueue::new(BakeOrchestrator::new(backend, BakeContext::new(settings)));
    for mut request in scene_file.bakes {
        if request.output_path.is_none() {
            request.output_path = Some(out_dir.join(format!("{}.ocvb", request.name)));
        }
        queue.enqueue(request);
    }

    let mut all_ok = true;
    for outcome in queue.run_all(&mut host) {
        match outcome.result {
            Ok(report) => {
                let stats = StoreStats::of(&report.data.store);
                log::info!(
                    "[BakeScene] `{}`: {} locations ({} empty), {} entries, max {} per location, hash {}",
                    outcome.name,
                    stats.locations,
                    stats.empty_locations,
                    stats.total_entries,
                    stats.max_entries,
                    report.data.bake_hash
                );
                match &report.persisted_to {
                    Some(path) => log::info!("[BakeScene] wrote {}", path.display()),
                    None => {
                        log::error!("[BakeScene] `{}` was not written", outcome.name);
                        all_ok = false;
                    }
                }
                if let Some(e) = report.restore_error {
                    log::warn!("[BakeScene] scene restore issue: {e}");
                }
            }
            Err(reason) => {
                log::error!("[BakeScene] `{}` failed: {reason:?}", outcome.name);
                all_ok = false;
            }
        }
    }
    Ok(all_ok)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("usage: bake_scene <scene.json> [--settings file] [--backend auto|cpu|gpu] [--out dir]");
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("[BakeScene] {e}");
            ExitCode::FAILURE
        }
    }
}
