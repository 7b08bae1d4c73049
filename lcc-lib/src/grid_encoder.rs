//! Parallel quantizing encoder: one encoded blob per (cell, LOD), plus
//! the optional environment cloud.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use glam::Vec3;
use log::warn;
use rayon::prelude::*;

use crate::lcc::{EncodedCellData, EncodedEnvironment, LccData, SH_RECORD_SIZE, SPLAT_RECORD_SIZE};
use crate::spatial_grid::SpatialGrid;
use crate::splat_buffer::SplatBuffer;
use crate::splat_encode::{self, encode_splat};
use crate::types::{EnvBounds, ProgressFn};
use crate::Result;

#[derive(Default)]
pub struct GridEncoder {
    progress: Option<ProgressFn>,
}

impl GridEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_progress(&mut self, cb: ProgressFn) {
        self.progress = Some(cb);
    }

    /// Encodes every occupied (cell, LOD) pair and returns the sorted
    /// container data. Cells are encoded in parallel; each worker owns
    /// its output until the final merge.
    pub fn encode(&self, grid: &SpatialGrid, lod_files: &[PathBuf]) -> Result<LccData> {
        let mut result = LccData {
            num_lods: grid.num_lods(),
            bbox: *grid.bbox(),
            ranges: *grid.ranges(),
            has_sh: grid.has_sh(),
            sh_degree: grid.sh_degree(),
            cell_size_x: grid.cell_size_x(),
            cell_size_y: grid.cell_size_y(),
            splats_per_lod: vec![0; grid.num_lods()],
            ..Default::default()
        };

        let cells_vec: Vec<_> = grid.cells().values().collect();
        let total_work = cells_vec.len() * grid.num_lods();
        let report_interval = (total_work / 100).max(1);
        let processed = AtomicUsize::new(0);

        for (lod, path) in lod_files.iter().enumerate() {
            let splats = SplatBuffer::open(path)?;
            result.splats_per_lod[lod] = splats.len();

            let mut encoded: Vec<EncodedCellData> = cells_vec
                .par_iter()
                .filter_map(|cell| {
                    let out = self.encode_cell(&splats, cell.index, lod, &cell.splat_indices[lod], &result);

                    let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if done % report_interval == 0 {
                        if let Some(cb) = &self.progress {
                            let percent = (done * 100 / total_work) as u32;
                            cb(percent, &format!("Encoding cell {done}/{total_work}"));
                        }
                    }
                    out
                })
                .collect();

            for cell in &encoded {
                result.total_splats += cell.count;
            }
            result.cells.append(&mut encoded);
        }

        result.sort_cells();
        Ok(result)
    }

    fn encode_cell(
        &self,
        splats: &SplatBuffer,
        cell_id: u32,
        lod: usize,
        indices: &[usize],
        result: &LccData,
    ) -> Option<EncodedCellData> {
        if indices.is_empty() {
            return None;
        }

        let mut enc = EncodedCellData::new(cell_id, lod);
        enc.data.reserve(indices.len() * SPLAT_RECORD_SIZE);
        if result.has_sh {
            enc.shcoef.reserve(indices.len() * SH_RECORD_SIZE);
        }

        for &idx in indices {
            let sv = splats.get(idx);
            encode_splat(&sv, &result.ranges, result.has_sh, &mut enc.data, &mut enc.shcoef);
        }
        enc.count = indices.len();
        Some(enc)
    }

    /// Encodes the environment PLY into one contiguous blob with its own
    /// bounds. A file that cannot be read as a splat PLY is skipped with
    /// a warning, matching the splat pipeline's tolerance for optional
    /// inputs.
    pub fn encode_environment(&self, env_path: &Path, has_sh: bool) -> EncodedEnvironment {
        let buffer = match SplatBuffer::open(env_path) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("skipping environment {}: {err}", env_path.display());
                return EncodedEnvironment::default();
            }
        };

        let mut bounds = EnvBounds::default();
        let bands = buffer.num_f_rest() / 3;

        for sv in buffer.iter() {
            bounds.expand_pos(sv.pos());
            let log_scale = sv.scale();
            bounds.expand_scale(Vec3::new(
                log_scale.x.exp(),
                log_scale.y.exp(),
                log_scale.z.exp(),
            ));
            for band in 0..bands {
                bounds.expand_sh(
                    sv.f_rest(band),
                    sv.f_rest(band + bands),
                    sv.f_rest(band + 2 * bands),
                );
            }
        }

        let bytes_per_splat = if has_sh {
            SPLAT_RECORD_SIZE + SH_RECORD_SIZE
        } else {
            SPLAT_RECORD_SIZE
        };
        let mut data = Vec::with_capacity(buffer.len() * bytes_per_splat);
        let (sh_min, sh_max) = bounds.sh_scalar_bounds();

        let mut f_rest = [0.0f32; splat_encode::SH_BANDS * 3];
        for sv in buffer.iter() {
            let pos = sv.pos();
            data.extend_from_slice(&pos.x.to_le_bytes());
            data.extend_from_slice(&pos.y.to_le_bytes());
            data.extend_from_slice(&pos.z.to_le_bytes());

            let color = splat_encode::encode_color(sv.f_dc(), sv.opacity());
            data.extend_from_slice(&color.to_le_bytes());

            let scales = splat_encode::encode_scale(sv.scale(), bounds.scale_min, bounds.scale_max);
            for s in scales {
                data.extend_from_slice(&s.to_le_bytes());
            }

            let rot = splat_encode::encode_rotation(sv.rot());
            data.extend_from_slice(&rot.to_le_bytes());
            data.extend_from_slice(&[0u8; 6]);

            if has_sh {
                let count = sv.num_f_rest().min(f_rest.len());
                for (i, v) in f_rest.iter_mut().take(count).enumerate() {
                    *v = sv.f_rest(i);
                }
                for word in splat_encode::encode_sh(&f_rest[..count], sh_min, sh_max) {
                    data.extend_from_slice(&word.to_le_bytes());
                }
            }
        }

        EncodedEnvironment {
            count: buffer.len(),
            data,
            bounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial_grid::SpatialGrid;
    use crate::splat_buffer::test_support::{write_splat_ply, TestSplat};

    fn encode_fixture(splats: &[TestSplat]) -> LccData {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("point_cloud.ply");
        write_splat_ply(&path, splats);
        let files = vec![path];
        let grid = SpatialGrid::from_files(&files, 30.0, 30.0).unwrap();
        GridEncoder::new().encode(&grid, &files).unwrap()
    }

    #[test]
    fn portable_record_sizes() {
        let data = encode_fixture(&[
            TestSplat {
                pos: [0.0, 0.0, 0.0],
                ..Default::default()
            },
            TestSplat {
                pos: [60.0, 0.0, 0.0],
                ..Default::default()
            },
        ]);

        assert!(!data.has_sh);
        assert_eq!(data.total_splats, 2);
        assert_eq!(data.cells.len(), 2);
        for cell in &data.cells {
            assert_eq!(cell.data.len(), cell.count * SPLAT_RECORD_SIZE);
            assert!(cell.shcoef.is_empty());
        }
    }

    #[test]
    fn quality_emits_sh_records() {
        let data = encode_fixture(&[TestSplat {
            f_rest: (0..45).map(|i| i as f32).collect(),
            ..Default::default()
        }]);

        assert!(data.has_sh);
        assert_eq!(data.sh_degree, 3);
        assert_eq!(data.cells.len(), 1);
        assert_eq!(data.cells[0].data.len(), SPLAT_RECORD_SIZE);
        assert_eq!(data.cells[0].shcoef.len(), SH_RECORD_SIZE);
        // Reserved 16th word.
        assert_eq!(&data.cells[0].shcoef[60..64], &[0, 0, 0, 0]);
    }

    #[test]
    fn cells_arrive_sorted_with_lods_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let lod0 = dir.path().join("point_cloud.ply");
        let lod1 = dir.path().join("point_cloud_1.ply");
        write_splat_ply(
            &lod0,
            &[
                TestSplat {
                    pos: [0.0, 0.0, 0.0],
                    ..Default::default()
                },
                TestSplat {
                    pos: [60.0, 0.0, 0.0],
                    ..Default::default()
                },
            ],
        );
        write_splat_ply(
            &lod1,
            &[TestSplat {
                pos: [1.0, 1.0, 0.0],
                ..Default::default()
            }],
        );

        let files = vec![lod0, lod1];
        let grid = SpatialGrid::from_files(&files, 30.0, 30.0).unwrap();
        let data = GridEncoder::new().encode(&grid, &files).unwrap();

        assert_eq!(data.splats_per_lod, vec![2, 1]);
        let order: Vec<_> = data.cells.iter().map(|c| (c.cell_id, c.lod)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (2, 0)]);
    }

    #[test]
    fn environment_uses_own_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.ply");
        write_splat_ply(
            &path,
            &[
                TestSplat {
                    pos: [100.0, 200.0, 300.0],
                    scale: [0.0, 0.0, 0.0],
                    ..Default::default()
                },
                TestSplat {
                    pos: [-100.0, -200.0, -300.0],
                    scale: [1.0, 1.0, 1.0],
                    ..Default::default()
                },
            ],
        );

        let env = GridEncoder::new().encode_environment(&path, false);
        assert_eq!(env.count, 2);
        assert_eq!(env.data.len(), 2 * SPLAT_RECORD_SIZE);
        assert_eq!(env.bounds.pos_min, Vec3::new(-100.0, -200.0, -300.0));
        assert_eq!(env.bounds.pos_max, Vec3::new(100.0, 200.0, 300.0));
    }

    #[test]
    fn environment_quality_is_96_bytes_per_splat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.ply");
        write_splat_ply(
            &path,
            &[TestSplat {
                f_rest: (0..45).map(|i| i as f32 * 0.1).collect(),
                ..Default::default()
            }],
        );

        let env = GridEncoder::new().encode_environment(&path, true);
        assert_eq!(env.data.len(), 96);
    }

    #[test]
    fn missing_environment_yields_empty() {
        let env =
            GridEncoder::new().encode_environment(Path::new("/nonexistent/env.ply"), false);
        assert!(env.is_empty());
    }
}
