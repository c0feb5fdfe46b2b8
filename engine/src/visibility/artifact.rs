//! Visibility Artifact (.ocvb)
//!
//! Binary file format for persisting bake results.
//! Layout: fixed 48-byte header | CSR offsets | CSR indices | metadata JSON.
//!
//! The header carries magic bytes, version, counts, the bake hash and byte
//! offsets of every section. Every multi-byte integer in the file is
//! little-endian: header fields, u32 offsets and u16 indices. Metadata (grid,
//! timings, renderer table) is JSON.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use super::groups::RendererIndexTable;
use super::hash::BakeHash;
use super::store::{duration_to_secs, secs_to_duration, BakeData, CompactVisibilityStore};
use crate::error::ArtifactError;
use crate::world::SamplingGrid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Magic bytes identifying a visibility artifact.
pub const OCVB_MAGIC: [u8; 4] = *b"OCVB";

/// Current file format version.
pub const OCVB_VERSION: u32 = 1;

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = 48;

// ============================================================================
// HEADER
// ============================================================================

/// Fixed-size binary header.
///
/// `magic` (4) + `version` (4) + `location_count` (4) + `renderer_count` (4)
/// + `index_count` (4) + `offsets_offset` (4) + `bake_hash` (8)
/// + `indices_offset` (4) + `metadata_offset` (4) + `metadata_len` (4)
/// + `_reserved` (4) = 48.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct VisibilityArtifactHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub location_count: u32,
    pub renderer_count: u32,
    /// Total entries in the CSR index array
    pub index_count: u32,
    pub offsets_offset: u32,
    pub bake_hash: u64,
    pub indices_offset: u32,
    pub metadata_offset: u32,
    pub metadata_len: u32,
    pub _reserved: u32,
}

static_assertions::assert_eq_size!(VisibilityArtifactHeader, [u8; HEADER_SIZE]);

impl VisibilityArtifactHeader {
    /// Byte-swap every integer field into file order. A no-op on
    /// little-endian targets.
    pub fn to_little_endian(self) -> Self {
        Self {
            magic: self.magic,
            version: self.version.to_le(),
            location_count: self.location_count.to_le(),
            renderer_count: self.renderer_count.to_le(),
            index_count: self.index_count.to_le(),
            offsets_offset: self.offsets_offset.to_le(),
            bake_hash: self.bake_hash.to_le(),
            indices_offset: self.indices_offset.to_le(),
            metadata_offset: self.metadata_offset.to_le(),
            metadata_len: self.metadata_len.to_le(),
            _reserved: self._reserved.to_le(),
        }
    }

    /// Inverse of [`to_little_endian`](Self::to_little_endian).
    pub fn to_native_endian(self) -> Self {
        Self {
            magic: self.magic,
            version: u32::from_le(self.version),
            location_count: u32::from_le(self.location_count),
            renderer_count: u32::from_le(self.renderer_count),
            index_count: u32::from_le(self.index_count),
            offsets_offset: u32::from_le(self.offsets_offset),
            bake_hash: u64::from_le(self.bake_hash),
            indices_offset: u32::from_le(self.indices_offset),
            metadata_offset: u32::from_le(self.metadata_offset),
            metadata_len: u32::from_le(self.metadata_len),
            _reserved: u32::from_le(self._reserved),
        }
    }
}

// ============================================================================
// METADATA
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct ArtifactMetadata {
    grid: SamplingGrid,
    render_date: u64,
    render_duration_secs: f64,
    bake_completed: bool,
    renderers: RendererIndexTable,
}

// ============================================================================
// ENCODE / DECODE
// ============================================================================

/// Serialize bake data. The store must be completed.
pub fn encode_artifact(data: &BakeData) -> Result<Vec<u8>, ArtifactError> {
    let store = &data.store;
    if !store.is_completed() {
        return Err(ArtifactError::Corrupt(
            "visibility store has not been completed".into(),
        ));
    }

    let metadata = ArtifactMetadata {
        grid: data.grid.clone(),
        render_date: data.render_date,
        render_duration_secs: duration_to_secs(data.render_duration),
        bake_completed: data.bake_completed,
        renderers: data.renderers.clone(),
    };
    let metadata_json = serde_json::to_vec(&metadata)?;

    let offsets = store.offsets();
    let indices = store.indices();
    let offsets_offset = HEADER_SIZE;
    let indices_offset = offsets_offset + offsets.len() * 4;
    let metadata_offset = indices_offset + indices.len() * 2;

    let header = VisibilityArtifactHeader {
        magic: OCVB_MAGIC,
        version: OCVB_VERSION,
        location_count: store.location_count() as u32,
        renderer_count: store.renderer_count() as u32,
        index_count: indices.len() as u32,
        offsets_offset: offsets_offset as u32,
        bake_hash: data.bake_hash.0,
        indices_offset: indices_offset as u32,
        metadata_offset: metadata_offset as u32,
        metadata_len: metadata_json.len() as u32,
        _reserved: 0,
    };

    let mut bytes = Vec::with_capacity(metadata_offset + metadata_json.len());
    bytes.extend_from_slice(bytemuck::bytes_of(&header.to_little_endian()));
    for o in offsets {
        bytes.extend_from_slice(&o.to_le_bytes());
    }
    for i in indices {
        bytes.extend_from_slice(&i.to_le_bytes());
    }
    bytes.extend_from_slice(&metadata_json);
    Ok(bytes)
}

/// Read the header only (useful for staleness checks without decoding).
/// Fields come back in native byte order.
pub fn read_header(bytes: &[u8]) -> Result<VisibilityArtifactHeader, ArtifactError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ArtifactError::FileTooShort);
    }
    // Unaligned read: the input slice carries no alignment guarantee.
    let header = bytemuck::pod_read_unaligned::<VisibilityArtifactHeader>(&bytes[..HEADER_SIZE])
        .to_native_endian();
    if header.magic != OCVB_MAGIC {
        return Err(ArtifactError::InvalidMagic);
    }
    if header.version != OCVB_VERSION {
        return Err(ArtifactError::UnsupportedVersion(header.version));
    }
    Ok(header)
}

pub fn decode_artifact(bytes: &[u8]) -> Result<BakeData, ArtifactError> {
    let header = read_header(bytes)?;

    let offsets_start = header.offsets_offset as usize;
    let offsets_end = offsets_start + (header.location_count as usize + 1) * 4;
    let indices_start = header.indices_offset as usize;
    let indices_end = indices_start + header.index_count as usize * 2;
    let meta_start = header.metadata_offset as usize;
    let meta_end = meta_start + header.metadata_len as usize;

    if offsets_end > indices_start || indices_end > meta_start {
        return Err(ArtifactError::Corrupt("overlapping sections".into()));
    }
    if bytes.len() < meta_end {
        return Err(ArtifactError::FileTooShort);
    }

    let offsets: Vec<u32> = bytes[offsets_start..offsets_end]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let indices: Vec<u16> = bytes[indices_start..indices_end]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let metadata: ArtifactMetadata = serde_json::from_slice(&bytes[meta_start..meta_end])?;

    let store =
        CompactVisibilityStore::from_compact(offsets, indices, header.renderer_count as usize)
            .map_err(|e| ArtifactError::Corrupt(e.to_string()))?;
    if store.location_count() != metadata.grid.location_count() {
        return Err(ArtifactError::Corrupt(format!(
            "{} stored locations but grid describes {}",
            store.location_count(),
            metadata.grid.location_count()
        )));
    }
    if metadata.renderers.len() != header.renderer_count as usize {
        return Err(ArtifactError::Corrupt(format!(
            "header lists {} renderers, metadata {}",
            header.renderer_count,
            metadata.renderers.len()
        )));
    }

    Ok(BakeData {
        bake_completed: metadata.bake_completed,
        bake_hash: BakeHash(header.bake_hash),
        grid: metadata.grid,
        store,
        render_date: metadata.render_date,
        render_duration: secs_to_duration(metadata.render_duration_secs),
        renderers: metadata.renderers,
    })
}

// ============================================================================
// SAVE / LOAD
// ============================================================================

pub fn save_artifact(path: &Path, data: &BakeData) -> Result<(), ArtifactError> {
    let bytes = encode_artifact(data)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    log::info!(
        "[Artifact] wrote {} ({} locations, hash {})",
        path.display(),
        data.store.location_count(),
        data.bake_hash
    );
    Ok(())
}

pub fn load_artifact(path: &Path) -> Result<BakeData, ArtifactError> {
    let bytes = std::fs::read(path)?;
    decode_artifact(&bytes)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::RendererId;
    use crate::world::{BakeVolume, GridLayout};
    use glam::Vec3;
    use std::time::Duration;

    fn make_bake_data() -> BakeData {
        let grid = SamplingGrid::new(
            BakeVolume::new(Vec3::ZERO, Vec3::new(4.0, 2.0, 2.0)),
            GridLayout::Regular {
                cell_size: Vec3::splat(2.0),
            },
        );
        let mut store = CompactVisibilityStore::new(grid.location_count(), 3);
        store.set_raw_data(0, &[0, 2], true).unwrap();
        store.set_raw_data(1, &[1], true).unwrap();
        store.complete_bake();
        BakeData {
            bake_completed: true,
            bake_hash: BakeHash(0xdead_beef_0123_4567),
            grid,
            store,
            render_date: 1_760_000_000,
            render_duration: Duration::from_millis(1500),
            renderers: RendererIndexTable {
                renderer_ids: vec![RendererId(10), RendererId(11), RendererId(12)],
                group_offsets: vec![0, 2, 3],
            },
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(std::mem::size_of::<VisibilityArtifactHeader>(), 48);
    }

    #[test]
    fn test_encode_decode() {
        let data = make_bake_data();
        let bytes = encode_artifact(&data).unwrap();
        let decoded = decode_artifact(&bytes).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_header_fields_are_little_endian() {
        let data = make_bake_data();
        let bytes = encode_artifact(&data).unwrap();
        let header = read_header(&bytes).unwrap();

        let u32_at = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        assert_eq!(u32_at(4), OCVB_VERSION.to_le_bytes());
        assert_eq!(u32_at(8), (data.store.location_count() as u32).to_le_bytes());
        assert_eq!(u32_at(12), 3u32.to_le_bytes());
        assert_eq!(u32_at(20), (HEADER_SIZE as u32).to_le_bytes());
        assert_eq!(&bytes[24..32], &data.bake_hash.0.to_le_bytes());
        assert_eq!(u32_at(40), header.metadata_len.to_le_bytes());
        assert_eq!(header.bake_hash, data.bake_hash.0);
    }

    #[test]
    fn test_decode_from_unaligned_slice() {
        let data = make_bake_data();
        let mut bytes = vec![0u8];
        bytes.extend(encode_artifact(&data).unwrap());
        let decoded = decode_artifact(&bytes[1..]).unwrap();
        assert_eq!(decoded.bake_hash, data.bake_hash);
    }

    #[test]
    fn test_incomplete_store_not_encoded() {
        let mut data = make_bake_data();
        data.store = CompactVisibilityStore::new(2, 3);
        assert!(matches!(
            encode_artifact(&data),
            Err(ArtifactError::Corrupt(_))
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bad = [0u8; HEADER_SIZE];
        bad[0..4].copy_from_slice(b"NOPE");
        match decode_artifact(&bad) {
            Err(ArtifactError::InvalidMagic) => {}
            other => panic!("expected InvalidMagic, got {other:?}"),
        }
    }

    #[test]
    fn test_file_too_short() {
        match decode_artifact(&[0u8; 10]) {
            Err(ArtifactError::FileTooShort) => {}
            other => panic!("expected FileTooShort, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_version() {
        let mut header = VisibilityArtifactHeader::zeroed();
        header.magic = OCVB_MAGIC;
        header.version = 99;
        match decode_artifact(bytemuck::bytes_of(&header.to_little_endian())) {
            Err(ArtifactError::UnsupportedVersion(99)) => {}
            other => panic!("expected UnsupportedVersion(99), got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_body() {
        let bytes = encode_artifact(&make_bake_data()).unwrap();
        match decode_artifact(&bytes[..bytes.len() - 4]) {
            Err(ArtifactError::FileTooShort) => {}
            other => panic!("expected FileTooShort, got {other:?}"),
        }
    }

    #[test]
    fn test_save_load_file() {
        let dir = std::env::temp_dir().join("ocvb_test_save_load");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("level.ocvb");

        let data = make_bake_data();
        save_artifact(&path, &data).unwrap();
        let loaded = load_artifact(&path).unwrap();
        assert_eq!(loaded, data);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
