//! In-memory model of the LCC container, produced by the encoders and
//! drained by the writer.

use glam::Vec3;

use crate::types::{cell_x, cell_y, AttributeRanges, BBox, EnvBounds};

pub const SPLAT_RECORD_SIZE: usize = 32;
pub const SH_RECORD_SIZE: usize = 64;
pub const BVH_NODE_SIZE: usize = 32;
pub const BVH_HEADER_SIZE: usize = 16;

/// Encoded splats for one (cell, LOD) pair.
#[derive(Debug, Default)]
pub struct EncodedCellData {
    pub cell_id: u32,
    pub lod: usize,
    pub count: usize,
    /// 32 bytes per splat.
    pub data: Vec<u8>,
    /// 64 bytes per splat; empty in Portable mode.
    pub shcoef: Vec<u8>,
}

impl EncodedCellData {
    pub fn new(cell_id: u32, lod: usize) -> Self {
        Self {
            cell_id,
            lod,
            ..Default::default()
        }
    }
}

/// Environment splats, already interleaved (32 or 96 bytes per splat).
#[derive(Debug, Default)]
pub struct EncodedEnvironment {
    pub count: usize,
    pub data: Vec<u8>,
    pub bounds: EnvBounds,
}

impl EncodedEnvironment {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Triangle {
    pub v0: u32,
    pub v1: u32,
    pub v2: u32,
}

/// One BVH node, serialized to exactly 32 bytes.
#[derive(Clone, Copy, Debug)]
pub struct BvhNode {
    pub bbox_min: [f32; 3],
    pub bbox_max: [f32; 3],
    /// Right-child index for internal nodes, face offset for leaves.
    pub data0: u32,
    /// Split axis for internal nodes, face count for leaves.
    pub data1: u16,
    pub flags: u16,
}

impl BvhNode {
    pub const LEAF_FLAG: u16 = 0xffff;

    pub fn internal(bbox_min: [f32; 3], bbox_max: [f32; 3], right_child: u32, axis: u16) -> Self {
        Self {
            bbox_min,
            bbox_max,
            data0: right_child,
            data1: axis,
            flags: 0,
        }
    }

    pub fn leaf(bbox_min: [f32; 3], bbox_max: [f32; 3], face_offset: u32, face_count: u16) -> Self {
        Self {
            bbox_min,
            bbox_max,
            data0: face_offset,
            data1: face_count,
            flags: Self::LEAF_FLAG,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.flags == Self::LEAF_FLAG
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        for v in self.bbox_min.iter().chain(&self.bbox_max) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.data0.to_le_bytes());
        out.extend_from_slice(&self.data1.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }
}

/// One grid cell of the collision layer: locally indexed mesh plus its
/// serialized BVH payload (16-byte reserved header, then nodes).
#[derive(Debug, Default)]
pub struct CollisionCell {
    pub index: u32,
    pub vertices: Vec<Vec3>,
    pub faces: Vec<Triangle>,
    pub bvh_data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct CollisionData {
    pub bbox: BBox,
    pub cell_size_x: f32,
    pub cell_size_y: f32,
    pub cells: Vec<CollisionCell>,
}

impl CollisionData {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn total_triangles(&self) -> usize {
        self.cells.iter().map(|c| c.faces.len()).sum()
    }
}

/// Per-LOD placement of one cell's data in `data.bin`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LccNodeInfo {
    pub splat_count: u32,
    pub data_offset: u64,
    pub data_size: u32,
}

/// One `index.bin` record: a cell id and its per-LOD placements.
#[derive(Clone, Debug)]
pub struct LccUnitInfo {
    pub index: u32,
    pub lods: Vec<LccNodeInfo>,
}

/// Everything the writer needs, produced by the encoding stages.
#[derive(Debug, Default)]
pub struct LccData {
    pub cells: Vec<EncodedCellData>,
    pub environment: EncodedEnvironment,
    pub collision: CollisionData,

    pub num_lods: usize,
    pub total_splats: usize,
    pub splats_per_lod: Vec<usize>,
    pub bbox: BBox,
    pub ranges: AttributeRanges,
    pub has_sh: bool,
    pub sh_degree: usize,
    pub cell_size_x: f32,
    pub cell_size_y: f32,
}

impl LccData {
    /// Orders cells by `(cell_x, cell_y, lod)`. This is the on-disk
    /// order of `data.bin` and the offset base of `index.bin`; note it
    /// differs from the numeric order of the packed cell ids.
    pub fn sort_cells(&mut self) {
        self.cells.sort_by_key(|cell| {
            (cell_x(cell.cell_id), cell_y(cell.cell_id), cell.lod)
        });
    }

    /// Walks the sorted cells and assigns cumulative `data.bin` offsets,
    /// grouping consecutive LOD entries of the same cell into one unit.
    pub fn build_index(&self) -> Vec<LccUnitInfo> {
        let mut units: Vec<LccUnitInfo> = Vec::new();
        let mut data_offset = 0u64;

        for cell in &self.cells {
            if cell.count == 0 {
                continue;
            }

            let start_new = units.last().map_or(true, |u| u.index != cell.cell_id);
            if start_new {
                units.push(LccUnitInfo {
                    index: cell.cell_id,
                    lods: vec![LccNodeInfo::default(); self.num_lods],
                });
            }

            let unit = units.last_mut().unwrap();
            unit.lods[cell.lod] = LccNodeInfo {
                splat_count: cell.count as u32,
                data_offset,
                data_size: cell.data.len() as u32,
            };
            data_offset += cell.data.len() as u64;
        }

        units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::pack_cell_id;

    fn cell(cell_id: u32, lod: usize, count: usize) -> EncodedCellData {
        EncodedCellData {
            cell_id,
            lod,
            count,
            data: vec![0u8; count * SPLAT_RECORD_SIZE],
            shcoef: Vec::new(),
        }
    }

    #[test]
    fn bvh_node_serializes_to_32_bytes() {
        let mut out = Vec::new();
        BvhNode::leaf([0.0; 3], [1.0; 3], 7, 3).write_to(&mut out);
        assert_eq!(out.len(), BVH_NODE_SIZE);
        assert_eq!(&out[24..28], &7u32.to_le_bytes());
        assert_eq!(&out[28..30], &3u16.to_le_bytes());
        assert_eq!(&out[30..32], &[0xff, 0xff]);

        out.clear();
        BvhNode::internal([0.0; 3], [1.0; 3], 2, 1).write_to(&mut out);
        assert_eq!(&out[30..32], &[0, 0]);
    }

    #[test]
    fn sort_is_column_major_not_numeric() {
        // Numeric id order would put (0,1) before (1,0); the writer
        // order must not.
        let mut data = LccData {
            cells: vec![
                cell(pack_cell_id(1, 0), 0, 1),
                cell(pack_cell_id(0, 1), 0, 1),
                cell(pack_cell_id(0, 0), 1, 1),
                cell(pack_cell_id(0, 0), 0, 1),
            ],
            num_lods: 2,
            ..Default::default()
        };
        data.sort_cells();
        let order: Vec<_> = data.cells.iter().map(|c| (c.cell_id, c.lod)).collect();
        assert_eq!(
            order,
            vec![
                (pack_cell_id(0, 0), 0),
                (pack_cell_id(0, 0), 1),
                (pack_cell_id(0, 1), 0),
                (pack_cell_id(1, 0), 0),
            ]
        );
    }

    #[test]
    fn index_offsets_are_cumulative() {
        let mut data = LccData {
            cells: vec![
                cell(pack_cell_id(0, 0), 0, 2),
                cell(pack_cell_id(0, 0), 1, 1),
                cell(pack_cell_id(1, 0), 0, 3),
            ],
            num_lods: 2,
            ..Default::default()
        };
        data.sort_cells();
        let units = data.build_index();
        assert_eq!(units.len(), 2);

        assert_eq!(units[0].lods[0].splat_count, 2);
        assert_eq!(units[0].lods[0].data_offset, 0);
        assert_eq!(units[0].lods[0].data_size, 64);
        assert_eq!(units[0].lods[1].data_offset, 64);
        assert_eq!(units[0].lods[1].data_size, 32);

        assert_eq!(units[1].lods[0].data_offset, 96);
        assert_eq!(units[1].lods[0].data_size, 96);
        assert_eq!(units[1].lods[1].splat_count, 0);
    }
}
