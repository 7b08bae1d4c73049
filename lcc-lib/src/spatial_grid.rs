//! Ground-plane spatial partitioning of the splat cloud.
//!
//! Two passes over every LOD file: the first computes the global
//! bounding box and fixes the SH layout from LOD 0, the second assigns
//! every splat to a grid cell and aggregates attribute ranges. The
//! second pass fans out over static row chunks with thread-local
//! accumulators; the merge is a sequential fold in chunk order, which
//! keeps every cell's index list in ascending row order.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use glam::Vec3;
use rayon::prelude::*;

use crate::splat_buffer::SplatBuffer;
use crate::types::{pack_cell_id, sigmoid, AttributeRanges, BBox};
use crate::Result;

/// One occupied grid cell: splat row indices per LOD.
#[derive(Debug)]
pub struct GridCell {
    pub index: u32,
    pub splat_indices: Vec<Vec<usize>>,
}

impl GridCell {
    fn new(index: u32, num_lods: usize) -> Self {
        Self {
            index,
            splat_indices: vec![Vec::new(); num_lods],
        }
    }
}

#[derive(Default)]
struct ThreadLocalGrid {
    cell_indices: HashMap<u32, Vec<usize>>,
    ranges: AttributeRanges,
}

fn cell_index_for(pos: Vec3, bbox_min: Vec3, cell_size_x: f32, cell_size_y: f32) -> u32 {
    let cell_x = ((pos.x - bbox_min.x) / cell_size_x).floor() as i64;
    let cell_y = ((pos.y - bbox_min.y) / cell_size_y).floor() as i64;
    let cell_x = cell_x.clamp(0, 65535) as u32;
    let cell_y = cell_y.clamp(0, 65535) as u32;
    pack_cell_id(cell_x, cell_y)
}

pub struct SpatialGrid {
    cell_size_x: f32,
    cell_size_y: f32,
    bbox: BBox,
    num_lods: usize,
    cells: BTreeMap<u32, GridCell>,
    ranges: AttributeRanges,
    has_sh: bool,
    sh_degree: usize,
    num_f_rest: usize,
}

impl SpatialGrid {
    /// Builds the grid from the ordered LOD file list (LOD 0 first).
    pub fn from_files(lod_files: &[PathBuf], cell_size_x: f32, cell_size_y: f32) -> Result<Self> {
        let num_lods = lod_files.len();

        // Pass 1: global bbox; SH layout is whatever LOD 0 declares.
        let mut bbox = BBox::default();
        let mut has_sh = false;
        let mut sh_degree = 0;
        let mut num_f_rest = 0;
        for (lod, path) in lod_files.iter().enumerate() {
            let buffer = SplatBuffer::open(path)?;
            bbox.expand_bbox(&buffer.compute_bbox());
            if lod == 0 {
                num_f_rest = buffer.num_f_rest();
                sh_degree = buffer.sh_degree();
                has_sh = num_f_rest > 0;
            }
        }

        let bands = if has_sh { num_f_rest / 3 } else { 0 };

        // Pass 2: per LOD, partition rows across static chunks.
        let mut cells: BTreeMap<u32, GridCell> = BTreeMap::new();
        let mut ranges = AttributeRanges::default();

        for (lod, path) in lod_files.iter().enumerate() {
            let splats = SplatBuffer::open(path)?;
            // A LOD with a narrower SH layout than LOD 0 contributes
            // only the bands it actually stores.
            let bands = bands.min(splats.num_f_rest() / 3);
            let num_rows = splats.len();
            let num_chunks = rayon::current_num_threads().max(1);
            let chunk_size = num_rows.div_ceil(num_chunks).max(1);

            let locals: Vec<ThreadLocalGrid> = (0..num_chunks)
                .into_par_iter()
                .map(|chunk| {
                    let start = chunk * chunk_size;
                    let end = num_rows.min(start + chunk_size);
                    let mut local = ThreadLocalGrid::default();

                    for i in start..end {
                        let sv = splats.get(i);
                        let cell_id =
                            cell_index_for(sv.pos(), bbox.min, cell_size_x, cell_size_y);
                        local.cell_indices.entry(cell_id).or_default().push(i);

                        let log_scale = sv.scale();
                        local.ranges.expand_scale(Vec3::new(
                            log_scale.x.exp(),
                            log_scale.y.exp(),
                            log_scale.z.exp(),
                        ));
                        local.ranges.expand_opacity(sigmoid(sv.opacity()));
                        for band in 0..bands {
                            local.ranges.expand_sh(
                                sv.f_rest(band),
                                sv.f_rest(band + bands),
                                sv.f_rest(band + 2 * bands),
                            );
                        }
                    }
                    local
                })
                .collect();

            // Sequential merge; chunk order keeps per-cell lists sorted
            // by row index.
            for local in locals {
                for (cell_id, indices) in local.cell_indices {
                    cells
                        .entry(cell_id)
                        .or_insert_with(|| GridCell::new(cell_id, num_lods))
                        .splat_indices[lod]
                        .extend(indices);
                }
                ranges.merge(&local.ranges);
            }
        }

        Ok(Self {
            cell_size_x,
            cell_size_y,
            bbox,
            num_lods,
            cells,
            ranges,
            has_sh,
            sh_degree,
            num_f_rest,
        })
    }

    pub fn compute_cell_index(&self, pos: Vec3) -> u32 {
        cell_index_for(pos, self.bbox.min, self.cell_size_x, self.cell_size_y)
    }

    pub fn cells(&self) -> &BTreeMap<u32, GridCell> {
        &self.cells
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn ranges(&self) -> &AttributeRanges {
        &self.ranges
    }

    pub fn num_lods(&self) -> usize {
        self.num_lods
    }

    pub fn has_sh(&self) -> bool {
        self.has_sh
    }

    pub fn sh_degree(&self) -> usize {
        self.sh_degree
    }

    pub fn num_f_rest(&self) -> usize {
        self.num_f_rest
    }

    pub fn cell_size_x(&self) -> f32 {
        self.cell_size_x
    }

    pub fn cell_size_y(&self) -> f32 {
        self.cell_size_y
    }
}
