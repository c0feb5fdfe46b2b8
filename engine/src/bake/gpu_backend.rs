//! GPU point-visibility backend
//!
//! Runs the visibility rule from `raycast.rs` as a compute shader. Every
//! in-flight query owns a preallocated slot (params uniform, output buffer,
//! staging buffer). `sample` submits the dispatch and starts the `map_async`
//! readback; `complete` waits on the device once and collects every slot.

use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use super::query::{PointVisibilityQuery, QueryHandle, QueryParams, QueryResult, SampleTarget};
use crate::error::QueryError;
use crate::gpu::{HeadlessGpu, storage_entry, uniform_entry};

const SHADER_SOURCE: &str = include_str!("shaders/point_visibility.wgsl");
const WORKGROUP_SIZE: u32 = 64;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct GpuQueryParams {
    position: [f32; 3],
    max_distance: f32,
    probe_shrink: f32,
    target_count: u32,
    _pad: [u32; 2],
}

static_assertions::assert_eq_size!(GpuQueryParams, [u8; 32]);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
struct GpuTarget {
    min: [f32; 3],
    occluder: u32,
    max: [f32; 3],
    _pad: u32,
}

static_assertions::assert_eq_size!(GpuTarget, [u8; 32]);

type MapResult = Arc<Mutex<Option<Result<(), wgpu::BufferAsyncError>>>>;

enum SlotState {
    Free,
    Pending { handle: u64, mapped: MapResult },
    Done { handle: u64, result: Vec<u16> },
}

impl SlotState {
    fn handle(&self) -> Option<u64> {
        match self {
            SlotState::Free => None,
            SlotState::Pending { handle, .. } | SlotState::Done { handle, .. } => Some(*handle),
        }
    }
}

struct QuerySlot {
    params: wgpu::Buffer,
    output: wgpu::Buffer,
    staging: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    state: SlotState,
}

/// wgpu compute backend with a fixed number of in-flight slots.
pub struct GpuVisibilityQuery {
    gpu: Arc<HeadlessGpu>,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    capacity: usize,
    targets: Vec<SampleTarget>,
    params: QueryParams,
    slots: Vec<QuerySlot>,
    next_handle: u64,
}

impl GpuVisibilityQuery {
    /// `capacity` is the number of queries that may be in flight at once.
    /// A sampler with a larger batch count is clamped to it.
    pub fn new(gpu: Arc<HeadlessGpu>, capacity: usize) -> Self {
        let bind_group_layout =
            gpu.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("point_visibility_bind_group_layout"),
                    entries: &[uniform_entry(0), storage_entry(1, true), storage_entry(2, false)],
                });
        let pipeline =
            gpu.create_compute_pipeline("point_visibility", SHADER_SOURCE, "main", &bind_group_layout);
        Self {
            gpu,
            pipeline,
            bind_group_layout,
            capacity: capacity.max(1),
            targets: Vec::new(),
            params: QueryParams::default(),
            slots: Vec::new(),
            next_handle: 0,
        }
    }

    fn output_size(&self) -> u64 {
        (self.targets.len().max(1) * std::mem::size_of::<u32>()) as u64
    }

    fn wait_for_maps(&self) -> Result<(), QueryError> {
        self.gpu.wait_idle()
    }

    fn read_slot(&self, slot: &QuerySlot) -> Vec<u16> {
        let slice = slot.staging.slice(..);
        let flags: Vec<u32> = {
            let mapped = slice.get_mapped_range();
            bytemuck::pod_collect_to_vec(&mapped[..self.targets.len() * 4])
        };
        slot.staging.unmap();
        let mut visible: Vec<u16> = flags
            .iter()
            .zip(&self.targets)
            .filter(|(flag, _)| **flag != 0)
            .map(|(_, t)| t.index)
            .collect();
        visible.sort_unstable();
        visible.dedup();
        visible
    }
}

impl PointVisibilityQuery for GpuVisibilityQuery {
    fn name(&self) -> &'static str {
        "gpu-compute"
    }

    fn prepare(&mut self, targets: &[SampleTarget], params: QueryParams) -> Result<(), QueryError> {
        if self.in_flight() > 0 {
            log::warn!(
                "[GpuQuery] prepare with {} live queries; waiting and dropping them",
                self.in_flight()
            );
            let live: Vec<u64> = self.slots.iter().filter_map(|s| s.state.handle()).collect();
            for handle in live {
                self.release(QueryHandle(handle));
            }
        }

        self.targets = targets.to_vec();
        self.params = params;

        let mut gpu_targets: Vec<GpuTarget> = targets
            .iter()
            .map(|t| GpuTarget {
                min: t.bounds.min.to_array(),
                occluder: t.occluder as u32,
                max: t.bounds.max.to_array(),
                _pad: 0,
            })
            .collect();
        if gpu_targets.is_empty() {
            // Zero-sized storage bindings are invalid.
            gpu_targets.push(GpuTarget::default());
        }
        let target_buffer = self.gpu.create_storage_buffer("point_visibility_targets", &gpu_targets);

        let output_size = self.output_size();
        self.slots = (0..self.capacity)
            .map(|i| {
                let params = self
                    .gpu
                    .create_uniform_buffer(&format!("point_visibility_params_{i}"), &GpuQueryParams::default());
                let output = self
                    .gpu
                    .create_output_buffer(&format!("point_visibility_output_{i}"), output_size);
                let staging = self
                    .gpu
                    .create_readback_buffer(&format!("point_visibility_staging_{i}"), output_size);
                let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("point_visibility_bind_group"),
                    layout: &self.bind_group_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: params.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: target_buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: output.as_entire_binding(),
                        },
                    ],
                });
                QuerySlot {
                    params,
                    output,
                    staging,
                    bind_group,
                    state: SlotState::Free,
                }
            })
            .collect();

        log::debug!(
            "[GpuQuery] prepared {} targets, {} slots",
            self.targets.len(),
            self.slots.len()
        );
        Ok(())
    }

    fn sample(&mut self, world_pos: Vec3) -> Result<QueryHandle, QueryError> {
        if self.slots.is_empty() {
            return Err(QueryError::NotPrepared);
        }
        let capacity = self.capacity;
        let output_size = self.output_size();
        let target_count = self.targets.len() as u32;
        let params = GpuQueryParams {
            position: world_pos.to_array(),
            max_distance: self.params.max_sample_distance,
            probe_shrink: self.params.probe_shrink,
            target_count,
            _pad: [0; 2],
        };

        let slot = self
            .slots
            .iter_mut()
            .find(|s| matches!(s.state, SlotState::Free))
            .ok_or(QueryError::NoFreeSlot(capacity))?;

        self.gpu.queue.write_buffer(&slot.params, 0, bytemuck::bytes_of(&params));

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("point_visibility_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("point_visibility_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &slot.bind_group, &[]);
            pass.dispatch_workgroups(target_count.div_ceil(WORKGROUP_SIZE).max(1), 1, 1);
        }
        encoder.copy_buffer_to_buffer(&slot.output, 0, &slot.staging, 0, output_size);
        self.gpu.queue.submit(Some(encoder.finish()));

        let mapped: MapResult = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&mapped);
        slot.staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                if let Ok(mut guard) = sink.lock() {
                    *guard = Some(result);
                }
            });

        self.next_handle += 1;
        let handle = self.next_handle;
        slot.state = SlotState::Pending { handle, mapped };
        Ok(QueryHandle(handle))
    }

    fn complete(&mut self, handles: &[QueryHandle]) -> Vec<QueryResult> {
        let needs_wait = self
            .slots
            .iter()
            .any(|s| matches!(s.state, SlotState::Pending { .. }));
        let wait_error = if needs_wait {
            self.wait_for_maps().err()
        } else {
            None
        };

        let mut results = Vec::with_capacity(handles.len());
        for &handle in handles {
            let Some(index) = self
                .slots
                .iter()
                .position(|s| s.state.handle() == Some(handle.0))
            else {
                results.push((handle, Err(QueryError::UnknownHandle(handle.0))));
                continue;
            };

            let outcome = match &self.slots[index].state {
                SlotState::Done { result, .. } => Ok(result.clone()),
                SlotState::Pending { mapped, .. } => {
                    let status = mapped.lock().ok().and_then(|mut g| g.take());
                    match (status, &wait_error) {
                        (Some(Ok(())), _) => Ok(self.read_slot(&self.slots[index])),
                        (Some(Err(e)), _) => Err(QueryError::Readback(e.to_string())),
                        (None, Some(e)) => Err(e.clone()),
                        (None, None) => {
                            Err(QueryError::Readback("map callback did not fire".into()))
                        }
                    }
                }
                SlotState::Free => Err(QueryError::UnknownHandle(handle.0)),
            };

            if let Ok(result) = &outcome {
                self.slots[index].state = SlotState::Done {
                    handle: handle.0,
                    result: result.clone(),
                };
            }
            results.push((handle, outcome));
        }
        results
    }

    fn release(&mut self, handle: QueryHandle) {
        let Some(index) = self
            .slots
            .iter()
            .position(|s| s.state.handle() == Some(handle.0))
        else {
            return;
        };
        if let SlotState::Pending { mapped, .. } = &self.slots[index].state {
            // The staging buffer must be unmapped before the slot is reused.
            let mapped = Arc::clone(mapped);
            if let Err(e) = self.wait_for_maps() {
                log::warn!("[GpuQuery] wait during release failed: {e}");
            }
            let status = mapped.lock().ok().and_then(|mut g| g.take());
            if matches!(status, Some(Ok(()))) {
                self.slots[index].staging.unmap();
            }
        }
        self.slots[index].state = SlotState::Free;
    }

    fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.state, SlotState::Free))
            .count()
    }

    fn slot_capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }
}
