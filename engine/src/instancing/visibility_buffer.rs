//! Per-Camera Visibility Buffer
//!
//! Each tracked camera owns one buffer of visible-instance counts, written
//! once per frame by the culling pass. The layout is one entry per
//! (group, LOD, opaque/shadow):
//!
//! ```text
//! group 1: [lod0 .. lodN opaque][lod0 .. lodN shadow]
//! group 2: [lod0 .. lodM opaque][lod0 .. lodM shadow]
//! ...
//! ```
//!
//! Groups are laid out in id order. The layout is rebuilt whenever the
//! registry generation changes.
//!
//! Readback is asynchronous by default: a non-blocking request is answered
//! one or more frames later with a snapshot that is already slightly stale.
//! Blocking requests wait for the device and answer immediately. A readback
//! that fails answers its callers with the last counts that did arrive.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;

use super::registry::{GroupId, RenderSourceRegistry};
use crate::error::QueryError;
use crate::gpu::HeadlessGpu;

/// Visible instances for one (group, LOD, pass) entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct VisibilityData {
    pub visible_count: u32,
}

assert_eq_size!(VisibilityData, u32);

// ============================================================================
// LAYOUT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct GroupSpan {
    start: usize,
    lod_count: usize,
}

/// Where each group's entries live in the buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VisibilityBufferLayout {
    generation: Option<u64>,
    spans: BTreeMap<GroupId, GroupSpan>,
    len: usize,
}

impl VisibilityBufferLayout {
    /// Rebuild from `registry` if its generation moved. Returns whether the
    /// layout changed.
    pub fn sync(&mut self, registry: &RenderSourceRegistry) -> bool {
        if self.generation == Some(registry.generation()) {
            return false;
        }
        self.spans.clear();
        let mut cursor = 0;
        for group in registry.groups() {
            let lod_count = group.lod_count();
            self.spans.insert(
                group.id(),
                GroupSpan {
                    start: cursor,
                    lod_count,
                },
            );
            cursor += lod_count * 2;
        }
        self.len = cursor;
        self.generation = Some(registry.generation());
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// First entry of `group`.
    pub fn index_of(&self, group: GroupId) -> Option<usize> {
        self.spans.get(&group).map(|s| s.start)
    }

    /// Entry for one (group, LOD, pass).
    pub fn entry(&self, group: GroupId, lod: usize, shadow: bool) -> Option<usize> {
        let span = self.spans.get(&group)?;
        if lod >= span.lod_count {
            return None;
        }
        Some(span.start + lod + if shadow { span.lod_count } else { 0 })
    }
}

/// Owned copy of a camera's counts at the frame it was read back from.
#[derive(Clone, Debug, PartialEq)]
pub struct VisibilitySnapshot {
    /// Frame the data was written in
    pub frame: u64,
    pub layout: VisibilityBufferLayout,
    pub data: Vec<VisibilityData>,
}

impl VisibilitySnapshot {
    pub fn visible_count(&self, group: GroupId, lod: usize, shadow: bool) -> Option<u32> {
        let index = self.layout.entry(group, lod, shadow)?;
        self.data.get(index).map(|d| d.visible_count)
    }

    pub fn total_visible(&self, shadow: bool) -> u64 {
        self.layout
            .spans
            .values()
            .flat_map(|span| {
                let start = span.start + if shadow { span.lod_count } else { 0 };
                self.data.get(start..start + span.lod_count).unwrap_or(&[])
            })
            .map(|d| u64::from(d.visible_count))
            .sum()
    }
}

// ============================================================================
// STORAGE
// ============================================================================

/// Where a camera's counts live and how they come back to the CPU.
pub trait VisibilityStorage {
    /// Upload this frame's counts.
    fn write(&mut self, data: &[VisibilityData]);

    /// Start copying the last written counts back. At most one readback is
    /// pending at a time.
    fn request_readback(&mut self) -> Result<(), QueryError>;

    fn readback_pending(&self) -> bool;

    /// Result of the pending readback once it is available. `blocking`
    /// waits for it. An error ends the readback; a new one may be requested.
    fn poll_readback(&mut self, blocking: bool)
    -> Option<Result<Vec<VisibilityData>, QueryError>>;
}

/// CPU storage. A readback becomes available on the poll after the one that
/// first sees it, giving one frame of latency.
#[derive(Clone, Debug, Default)]
pub struct CpuVisibilityStorage {
    written: Vec<VisibilityData>,
    in_flight: Option<(Vec<VisibilityData>, bool)>,
}

impl CpuVisibilityStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VisibilityStorage for CpuVisibilityStorage {
    fn write(&mut self, data: &[VisibilityData]) {
        self.written.clear();
        self.written.extend_from_slice(data);
    }

    fn request_readback(&mut self) -> Result<(), QueryError> {
        if self.in_flight.is_none() {
            self.in_flight = Some((self.written.clone(), false));
        }
        Ok(())
    }

    fn readback_pending(&self) -> bool {
        self.in_flight.is_some()
    }

    fn poll_readback(
        &mut self,
        blocking: bool,
    ) -> Option<Result<Vec<VisibilityData>, QueryError>> {
        let (_, ready) = self.in_flight.as_mut()?;
        if blocking || *ready {
            return self.in_flight.take().map(|(data, _)| Ok(data));
        }
        *ready = true;
        None
    }
}

type MapResult = Arc<Mutex<Option<Result<(), wgpu::BufferAsyncError>>>>;

struct PendingReadback {
    staging: wgpu::Buffer,
    len: usize,
    mapped: MapResult,
}

/// GPU storage: a storage buffer written by the culling pass and a
/// `MAP_READ` staging buffer per readback.
pub struct GpuVisibilityStorage {
    gpu: Arc<HeadlessGpu>,
    buffer: wgpu::Buffer,
    len: usize,
    pending: Option<PendingReadback>,
}

impl GpuVisibilityStorage {
    pub fn new(gpu: Arc<HeadlessGpu>) -> Self {
        let buffer = gpu.create_output_buffer("Camera Visibility", Self::byte_size(0));
        Self {
            gpu,
            buffer,
            len: 0,
            pending: None,
        }
    }

    /// Buffer the culling pass binds.
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    fn byte_size(len: usize) -> u64 {
        (len.max(1) * std::mem::size_of::<VisibilityData>()) as u64
    }

    fn take_mapped(&mut self) -> Option<Result<Vec<VisibilityData>, QueryError>> {
        let state = self.pending.as_ref()?.mapped.lock().ok()?.take()?;
        let pending = self.pending.take()?;
        match state {
            Ok(()) => {
                let bytes = pending.len * std::mem::size_of::<VisibilityData>();
                let data: Vec<VisibilityData> = {
                    let mapped = pending.staging.slice(..).get_mapped_range();
                    bytemuck::pod_collect_to_vec(&mapped[..bytes])
                };
                pending.staging.unmap();
                Some(Ok(data))
            }
            Err(e) => Some(Err(QueryError::Readback(e.to_string()))),
        }
    }
}

impl VisibilityStorage for GpuVisibilityStorage {
    fn write(&mut self, data: &[VisibilityData]) {
        if data.len() != self.len {
            self.buffer = self
                .gpu
                .create_output_buffer("Camera Visibility", Self::byte_size(data.len()));
            self.len = data.len();
        }
        if !data.is_empty() {
            self.gpu.write_buffer(&self.buffer, data);
        }
    }

    fn request_readback(&mut self) -> Result<(), QueryError> {
        if self.pending.is_some() {
            return Ok(());
        }
        let size = Self::byte_size(self.len);
        let staging = self.gpu.create_readback_buffer("Camera Visibility Readback", size);
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Camera Visibility Readback"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, size);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let mapped: MapResult = Arc::new(Mutex::new(None));
        let signal = Arc::clone(&mapped);
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                if let Ok(mut slot) = signal.lock() {
                    *slot = Some(result);
                }
            });
        self.pending = Some(PendingReadback {
            staging,
            len: self.len,
            mapped,
        });
        Ok(())
    }

    fn readback_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn poll_readback(
        &mut self,
        blocking: bool,
    ) -> Option<Result<Vec<VisibilityData>, QueryError>> {
        self.pending.as_ref()?;
        if blocking {
            if let Err(e) = self.gpu.wait_idle() {
                self.pending = None;
                return Some(Err(e));
            }
        } else {
            self.gpu.poll();
        }
        self.take_mapped()
    }
}

// ============================================================================
// CAMERA BUFFER
// ============================================================================

type ReadbackCallback = Box<dyn FnOnce(&VisibilitySnapshot)>;

/// Visibility counts of one camera.
pub struct CameraVisibilityBuffer<S: VisibilityStorage> {
    storage: S,
    layout: VisibilityBufferLayout,
    data: Vec<VisibilityData>,
    frame: u64,
    /// Requests not yet issued to the storage
    waiting: Vec<ReadbackCallback>,
    /// Requests answered by the pending readback, with its frame and layout
    in_flight: Vec<ReadbackCallback>,
    in_flight_source: Option<(u64, VisibilityBufferLayout)>,
    /// Frame and layout of the last `write`
    written: Option<(u64, VisibilityBufferLayout)>,
    /// Last snapshot delivered, reused when a readback fails
    last_delivered: Option<VisibilitySnapshot>,
}

impl<S: VisibilityStorage> CameraVisibilityBuffer<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            layout: VisibilityBufferLayout::default(),
            data: Vec::new(),
            frame: 0,
            waiting: Vec::new(),
            in_flight: Vec::new(),
            in_flight_source: None,
            written: None,
            last_delivered: None,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn layout(&self) -> &VisibilityBufferLayout {
        &self.layout
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Requests waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.waiting.len() + self.in_flight.len()
    }

    pub fn try_get_visibility_buffer_index(&self, group: GroupId) -> Option<usize> {
        self.layout.index_of(group)
    }

    /// Sync the layout with `registry` and zero the counts.
    pub fn begin_frame(&mut self, registry: &RenderSourceRegistry) {
        self.frame += 1;
        if self.layout.sync(registry) {
            log::debug!(
                "[VisibilityBuffer] layout rebuilt: {} entries",
                self.layout.len()
            );
        }
        self.data.clear();
        self.data.resize(self.layout.len(), VisibilityData::zeroed());
    }

    /// Add `count` visible instances. Returns `false` for unknown entries.
    pub fn record(&mut self, group: GroupId, lod: usize, shadow: bool, count: u32) -> bool {
        match self
            .layout
            .entry(group, lod, shadow)
            .and_then(|i| self.data.get_mut(i))
        {
            Some(entry) => {
                entry.visible_count = entry.visible_count.saturating_add(count);
                true
            }
            None => false,
        }
    }

    /// Upload this frame's counts, issue waiting requests and answer any
    /// readback that completed.
    pub fn end_frame(&mut self) {
        self.storage.write(&self.data);
        self.written = Some((self.frame, self.layout.clone()));

        if !self.waiting.is_empty() && !self.storage.readback_pending() {
            self.issue_readback();
        }
        if let Some(result) = self.storage.poll_readback(false) {
            self.deliver(result);
        }
    }

    /// Ask for a copy of the counts. Non-blocking requests are answered from
    /// a later `end_frame`; blocking requests are answered before returning,
    /// from the last uploaded frame.
    pub fn async_data_request(
        &mut self,
        callback: impl FnOnce(&VisibilitySnapshot) + 'static,
        blocking: bool,
    ) {
        if !blocking {
            self.waiting.push(Box::new(callback));
            return;
        }

        // Finish whatever is in flight first so its callers see their frame.
        if self.storage.readback_pending()
            && let Some(result) = self.storage.poll_readback(true)
        {
            self.deliver(result);
        }
        self.waiting.push(Box::new(callback));
        self.issue_readback();
        if let Some(result) = self.storage.poll_readback(true) {
            self.deliver(result);
        }
    }

    fn issue_readback(&mut self) {
        if let Err(e) = self.storage.request_readback() {
            log::warn!("[VisibilityBuffer] readback request failed: {e}");
            return;
        }
        self.in_flight.append(&mut self.waiting);
        self.in_flight_source = self.written.clone();
    }

    fn deliver(&mut self, result: Result<Vec<VisibilityData>, QueryError>) {
        let source = self.in_flight_source.take();
        let snapshot = match result {
            Ok(data) => {
                let (frame, layout) = source.unwrap_or_default();
                let snapshot = VisibilitySnapshot {
                    frame,
                    layout,
                    data,
                };
                self.last_delivered = Some(snapshot.clone());
                snapshot
            }
            Err(e) => {
                log::warn!(
                    "[VisibilityBuffer] readback failed: {e}; answering {} requests with older counts",
                    self.in_flight.len()
                );
                self.last_delivered.clone().unwrap_or(VisibilitySnapshot {
                    frame: 0,
                    layout: VisibilityBufferLayout::default(),
                    data: Vec::new(),
                })
            }
        };
        for callback in self.in_flight.drain(..) {
            callback(&snapshot);
        }
    }
}

/// Camera identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(pub u64);

/// Visibility buffers of every tracked camera.
pub struct CameraDataRegistry<S: VisibilityStorage> {
    cameras: HashMap<CameraId, CameraVisibilityBuffer<S>>,
    make_storage: Box<dyn Fn() -> S>,
}

impl CameraDataRegistry<CpuVisibilityStorage> {
    pub fn cpu() -> Self {
        Self::new(CpuVisibilityStorage::new)
    }
}

impl CameraDataRegistry<GpuVisibilityStorage> {
    pub fn gpu(gpu: Arc<HeadlessGpu>) -> Self {
        Self::new(move || GpuVisibilityStorage::new(Arc::clone(&gpu)))
    }
}

impl<S: VisibilityStorage> CameraDataRegistry<S> {
    pub fn new(make_storage: impl Fn() -> S + 'static) -> Self {
        Self {
            cameras: HashMap::new(),
            make_storage: Box::new(make_storage),
        }
    }

    /// Start tracking `camera`, replacing any existing buffer.
    pub fn track_camera(&mut self, camera: CameraId) -> &mut CameraVisibilityBuffer<S> {
        let buffer = CameraVisibilityBuffer::new((self.make_storage)());
        match self.cameras.entry(camera) {
            Entry::Occupied(mut entry) => {
                log::debug!("[VisibilityBuffer] recreated buffer for camera {}", camera.0);
                entry.insert(buffer);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(buffer),
        }
    }

    /// Stop tracking `camera` and drop its buffer.
    pub fn untrack_camera(&mut self, camera: CameraId) -> bool {
        self.cameras.remove(&camera).is_some()
    }

    pub fn get(&self, camera: CameraId) -> Option<&CameraVisibilityBuffer<S>> {
        self.cameras.get(&camera)
    }

    pub fn get_mut(&mut self, camera: CameraId) -> Option<&mut CameraVisibilityBuffer<S>> {
        self.cameras.get_mut(&camera)
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn begin_frame(&mut self, registry: &RenderSourceRegistry) {
        for buffer in self.cameras.values_mut() {
            buffer.begin_frame(registry);
        }
    }

    pub fn end_frame(&mut self) {
        for buffer in self.cameras.values_mut() {
            buffer.end_frame();
        }
    }
}
