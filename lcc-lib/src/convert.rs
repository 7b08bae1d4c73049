//! End-to-end conversion driver: input resolution, LOD discovery and
//! the five pipeline phases.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use crate::collision::CollisionEncoder;
use crate::grid_encoder::GridEncoder;
use crate::spatial_grid::SpatialGrid;
use crate::types::{ConvertConfig, LogFn, ProgressFn};
use crate::writer::LccWriter;
use crate::{LccError, Result};

pub struct Converter {
    config: ConvertConfig,
    progress: Option<ProgressFn>,
    log: Option<LogFn>,
}

impl Converter {
    pub fn new(config: ConvertConfig) -> Self {
        Self {
            config,
            progress: None,
            log: None,
        }
    }

    pub fn set_progress(&mut self, cb: ProgressFn) {
        self.progress = Some(cb);
    }

    pub fn set_log(&mut self, cb: LogFn) {
        self.log = Some(cb);
    }

    fn report(&self, percent: u32, msg: &str) {
        if let Some(cb) = &self.progress {
            cb(percent, msg);
        }
    }

    fn log(&self, msg: &str) {
        match &self.log {
            Some(cb) => cb(msg),
            None => info!("{}", msg.trim_end()),
        }
    }

    /// Resolves the configured input to the LOD 0 file. A directory
    /// input implies `point_cloud.ply` inside it.
    fn resolve_input(&self) -> Result<PathBuf> {
        let input = &self.config.input_path;
        if input.as_os_str().is_empty() {
            return Err(LccError::InvalidArgument("missing input path".into()));
        }
        let base = if input.is_dir() {
            input.join("point_cloud.ply")
        } else {
            input.clone()
        };
        if !base.is_file() {
            return Err(LccError::InputMissing(base));
        }
        if base.extension().map(|e| e.to_string_lossy().to_lowercase()) != Some("ply".into()) {
            return Err(LccError::InvalidArgument(format!(
                "input file must have .ply extension: {}",
                base.display()
            )));
        }
        Ok(base)
    }

    /// LOD 0 is the base file; numbered siblings `<base>_k.ply` join in
    /// ascending order until the first gap.
    fn find_lod_files(&self, base: &PathBuf) -> Vec<PathBuf> {
        let mut lod_files = vec![base.clone()];

        let dir = base.parent().map(PathBuf::from).unwrap_or_default();
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut k = 1;
        loop {
            let candidate = dir.join(format!("{stem}_{k}.ply"));
            if !candidate.is_file() {
                break;
            }
            lod_files.push(candidate);
            k += 1;
        }

        self.log(&format!(
            "Found {} LOD level{}:\n",
            lod_files.len(),
            if lod_files.len() > 1 { "s" } else { "" }
        ));
        for (i, path) in lod_files.iter().enumerate() {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            let name = name.unwrap_or_default();
            if self.config.single_lod && i > 0 {
                self.log(&format!("  LOD{i}: {name} (skipped: --single-lod)\n"));
            } else {
                self.log(&format!("  LOD{i}: {name}\n"));
            }
        }

        if self.config.single_lod {
            lod_files.truncate(1);
        }
        lod_files
    }

    pub fn run(&self) -> Result<()> {
        self.report(0, "Starting conversion...");

        if self.config.output_dir.as_os_str().is_empty() {
            return Err(LccError::InvalidArgument("missing output directory".into()));
        }

        let base = self.resolve_input()?;
        self.log(&format!("Input: {}\n", base.display()));
        let lod_files = self.find_lod_files(&base);
        self.report(2, &format!("Found {} LOD files", lod_files.len()));

        self.log(&format!("Output: {}\n", self.config.output_dir.display()));
        self.log(&format!(
            "Cell size: {} x {}\n",
            self.config.cell_size_x, self.config.cell_size_y
        ));

        self.report(5, "Building spatial grid...");
        self.log("\nPhase 1: Building spatial grid...\n");
        let grid = SpatialGrid::from_files(
            &lod_files,
            self.config.cell_size_x,
            self.config.cell_size_y,
        )?;
        let bbox = grid.bbox();
        self.log(&format!(
            "Global bbox: ({}, {}, {}) - ({}, {}, {})\n",
            bbox.min.x, bbox.min.y, bbox.min.z, bbox.max.x, bbox.max.y, bbox.max.z
        ));
        self.log(&format!("Created {} grid cells\n", grid.cells().len()));
        if grid.has_sh() {
            self.log(&format!(
                "SH: degree {} ({} coefficients)\n",
                grid.sh_degree(),
                grid.num_f_rest()
            ));
        } else {
            self.log("SH: none\n");
        }

        self.report(15, "Encoding splats...");
        self.log("\nPhase 2: Encoding splats...\n");
        let mut encoder = GridEncoder::new();
        if let Some(progress) = self.progress.clone() {
            encoder.set_progress(Arc::new(move |pct, msg: &str| {
                progress(15 + pct * 75 / 100, msg);
            }));
        }
        let mut data = encoder.encode(&grid, &lod_files)?;

        if self.config.include_env {
            match self.config.env_path.as_deref().filter(|p| p.is_file()) {
                Some(env_path) => {
                    self.log("\nPhase 3: Encoding environment...\n");
                    data.environment = encoder.encode_environment(env_path, grid.has_sh());
                    self.log(&format!(
                        "  Environment: {} splats\n",
                        data.environment.count
                    ));
                }
                None => {
                    let shown = self
                        .config
                        .env_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    self.log(&format!("Warning: environment file not found: {shown}\n"));
                }
            }
        }

        if self.config.include_collision {
            match self
                .config
                .collision_path
                .as_deref()
                .filter(|p| p.is_file())
            {
                Some(mesh_path) => {
                    self.report(85, "Encoding collision mesh...");
                    self.log("\nPhase 4: Encoding collision mesh...\n");
                    let mut collision_encoder = CollisionEncoder::new();
                    if let Some(log) = self.log.clone() {
                        collision_encoder.set_log(log);
                    }
                    // A failed collision build never invalidates the
                    // splat output.
                    match collision_encoder.encode(
                        mesh_path,
                        self.config.cell_size_x,
                        self.config.cell_size_y,
                    ) {
                        Ok(collision) => data.collision = collision,
                        Err(err) => {
                            self.log(&format!("Warning: collision encoding failed: {err}\n"));
                        }
                    }
                }
                None => {
                    let shown = self
                        .config
                        .collision_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    self.log(&format!("Warning: collision file not found: {shown}\n"));
                }
            }
        }

        let poses_path = if self.config.include_poses {
            let found = self.config.poses_path.as_deref().filter(|p| p.is_file());
            if found.is_none() {
                let shown = self
                    .config
                    .poses_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                self.log(&format!("Warning: poses file not found: {shown}\n"));
            }
            found
        } else {
            None
        };

        self.report(90, "Writing output files...");
        self.log("\nPhase 5: Writing LCC data...\n");
        let writer = LccWriter::new(&self.config.output_dir)?;
        writer.write(&data, poses_path)?;

        self.report(100, "Conversion complete!");
        self.log("\nConversion complete!\n");
        self.log(&format!("Total splats: {}\n", data.total_splats));
        self.log(&format!("Output: {}\n", self.config.output_dir.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat_buffer::test_support::{write_splat_ply, TestSplat};

    fn config(input: PathBuf, output: PathBuf) -> ConvertConfig {
        ConvertConfig {
            input_path: input,
            output_dir: output,
            ..Default::default()
        }
    }

    #[test]
    fn directory_input_implies_point_cloud_ply() {
        let dir = tempfile::tempdir().unwrap();
        write_splat_ply(&dir.path().join("point_cloud.ply"), &[TestSplat::default()]);

        let converter = Converter::new(config(dir.path().to_path_buf(), dir.path().join("out")));
        let base = converter.resolve_input().unwrap();
        assert_eq!(base, dir.path().join("point_cloud.ply"));
    }

    #[test]
    fn missing_input_is_input_missing() {
        let dir = tempfile::tempdir().unwrap();
        let converter = Converter::new(config(
            dir.path().join("absent.ply"),
            dir.path().join("out"),
        ));
        assert!(matches!(
            converter.run().unwrap_err(),
            LccError::InputMissing(_)
        ));
    }

    #[test]
    fn lod_discovery_stops_at_gap() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("scene.ply");
        let splat = [TestSplat::default()];
        write_splat_ply(&base, &splat);
        write_splat_ply(&dir.path().join("scene_1.ply"), &splat);
        write_splat_ply(&dir.path().join("scene_2.ply"), &splat);
        // scene_3.ply missing; scene_4.ply must not be picked up.
        write_splat_ply(&dir.path().join("scene_4.ply"), &splat);

        let converter = Converter::new(config(base.clone(), dir.path().join("out")));
        let lods = converter.find_lod_files(&base);
        assert_eq!(lods.len(), 3);
        assert_eq!(lods[2], dir.path().join("scene_2.ply"));
    }

    #[test]
    fn single_lod_keeps_base_only() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("scene.ply");
        let splat = [TestSplat::default()];
        write_splat_ply(&base, &splat);
        write_splat_ply(&dir.path().join("scene_1.ply"), &splat);

        let mut cfg = config(base.clone(), dir.path().join("out"));
        cfg.single_lod = true;
        let converter = Converter::new(cfg);
        let lods = converter.find_lod_files(&base);
        assert_eq!(lods, vec![base]);
    }
}
