//! Serialization of the encoded artifact set into the LCC output
//! directory: `data.bin`, `shcoef.bin`, `index.bin`, `meta.lcc`,
//! `attrs.lcp` and the optional `environment.bin` / `collision.lci`.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use glam::Vec3;
use serde::Serialize;
use serde_json::json;
use serde_json::ser::{Formatter, PrettyFormatter};

use crate::lcc::{LccData, BVH_HEADER_SIZE};
use crate::types::{cell_x, cell_y};
use crate::Result;

pub const COLLISION_MAGIC: u32 = 0x6c6c6f63; // "coll"
pub const COLLISION_VERSION: u32 = 2;

/// 32 lowercase hex digits from the thread-local RNG.
pub fn generate_guid() -> String {
    let bytes: [u8; 16] = rand::random();
    let mut guid = String::with_capacity(32);
    for b in bytes {
        guid.push_str(&format!("{b:02x}"));
    }
    guid
}

/// Formats like C's `%.15g`: up to 15 significant digits, trailing
/// zeros trimmed, integral values without a decimal point.
fn format_g15(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return "0".to_string();
    }
    let exp = v.abs().log10().floor() as i32;
    if !(-4..15).contains(&exp) {
        let s = format!("{:.*e}", 14, v);
        match s.find('e') {
            Some(pos) => {
                let (mantissa, exponent) = s.split_at(pos);
                let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
                format!("{mantissa}{exponent}")
            }
            None => s,
        }
    } else {
        let decimals = (14 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, v);
        // Only fractional padding is trimmed; a bare integer string
        // (decimals == 0) has no '.' to stop at and must stay intact.
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    }
}

/// Tab-indented pretty printing with `%.15g` floats for `meta.lcc`.
struct MetaFormatter<'a> {
    inner: PrettyFormatter<'a>,
}

impl<'a> MetaFormatter<'a> {
    fn new() -> Self {
        Self {
            inner: PrettyFormatter::with_indent(b"\t"),
        }
    }
}

impl<'a> Formatter for MetaFormatter<'a> {
    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        writer.write_all(format_g15(value).as_bytes())
    }

    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.inner.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.inner.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object_value(writer)
    }
}

fn jnum(v: f32) -> serde_json::Value {
    serde_json::Number::from_f64(v as f64)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|| json!(0))
}

fn jvec3(v: Vec3) -> serde_json::Value {
    json!([jnum(v.x), jnum(v.y), jnum(v.z)])
}

pub struct LccWriter {
    output_dir: PathBuf,
}

impl LccWriter {
    pub fn new(output_dir: &Path) -> Result<Self> {
        fs::create_dir_all(output_dir)?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
        })
    }

    /// Writes the complete artifact set. `poses_path`, when given,
    /// is copied into the container and referenced from `attrs.lcp`.
    pub fn write(&self, data: &LccData, poses_path: Option<&Path>) -> Result<()> {
        self.write_data_bin(data)?;
        self.write_index_bin(data)?;
        self.write_meta_lcc(data)?;

        if !data.environment.is_empty() {
            self.write_environment(data)?;
        }
        let collision_written = if data.collision.is_empty() {
            false
        } else {
            self.write_collision(data)?;
            true
        };
        let poses_written = match poses_path {
            Some(src) => {
                fs::copy(src, self.output_dir.join("poses.lcp"))?;
                true
            }
            None => false,
        };
        self.write_attrs_lcp(collision_written, poses_written)?;
        Ok(())
    }

    fn write_data_bin(&self, data: &LccData) -> Result<()> {
        let mut data_file = BufWriter::new(File::create(self.output_dir.join("data.bin"))?);
        let mut sh_file = if data.has_sh {
            Some(BufWriter::new(File::create(
                self.output_dir.join("shcoef.bin"),
            )?))
        } else {
            None
        };

        for cell in &data.cells {
            data_file.write_all(&cell.data)?;
            if let Some(sh_file) = sh_file.as_mut() {
                sh_file.write_all(&cell.shcoef)?;
            }
        }

        data_file.flush()?;
        if let Some(mut sh_file) = sh_file {
            sh_file.flush()?;
        }
        Ok(())
    }

    fn write_index_bin(&self, data: &LccData) -> Result<()> {
        let units = data.build_index();
        let mut file = BufWriter::new(File::create(self.output_dir.join("index.bin"))?);

        for unit in &units {
            file.write_all(&unit.index.to_le_bytes())?;
            for lod in &unit.lods {
                file.write_all(&lod.splat_count.to_le_bytes())?;
                file.write_all(&lod.data_offset.to_le_bytes())?;
                file.write_all(&lod.data_size.to_le_bytes())?;
            }
        }
        file.flush()?;
        Ok(())
    }

    fn write_meta_lcc(&self, data: &LccData) -> Result<()> {
        let file_type = if data.has_sh { "Quality" } else { "Portable" };
        let has_env = !data.environment.is_empty();
        let env = &data.environment.bounds;
        let ranges = &data.ranges;

        let position = if has_env {
            (env.pos_min, env.pos_max)
        } else {
            (data.bbox.min, data.bbox.max)
        };
        let shcoef = if data.has_sh {
            (jvec3(ranges.sh_min), jvec3(ranges.sh_max))
        } else {
            (json!([0, 0, 0]), json!([1, 1, 1]))
        };
        let env_shcoef = if !data.has_sh {
            (json!([0, 0, 0]), json!([1, 1, 1]))
        } else if has_env {
            (jvec3(env.sh_min), jvec3(env.sh_max))
        } else {
            (jvec3(ranges.sh_min), jvec3(ranges.sh_max))
        };
        let env_scale = if has_env {
            (jvec3(env.scale_min), jvec3(env.scale_max))
        } else {
            (jvec3(ranges.scale_min), jvec3(ranges.scale_max))
        };

        let meta = json!({
            "version": "5.0",
            "guid": generate_guid(),
            "name": "XGrids Splats",
            "description": "Converted from PLY",
            "source": "ply",
            "dataType": "DIMENVUE",
            "totalSplats": data.total_splats,
            "totalLevel": data.num_lods,
            "cellLengthX": jnum(data.cell_size_x),
            "cellLengthY": jnum(data.cell_size_y),
            "indexDataSize": 4 + 16 * data.num_lods,
            "offset": [0, 0, 0],
            "epsg": 0,
            "shift": [0, 0, 0],
            "scale": [1, 1, 1],
            "splats": &data.splats_per_lod,
            "boundingBox": {
                "min": jvec3(data.bbox.min),
                "max": jvec3(data.bbox.max),
            },
            "encoding": "COMPRESS",
            "fileType": file_type,
            "attributes": [
                { "name": "position", "min": jvec3(position.0), "max": jvec3(position.1) },
                { "name": "normal", "min": [0, 0, 0], "max": [0, 0, 0] },
                { "name": "color", "min": [0, 0, 0], "max": [1, 1, 1] },
                { "name": "shcoef", "min": shcoef.0, "max": shcoef.1 },
                { "name": "opacity", "min": [jnum(ranges.opacity_min)], "max": [jnum(ranges.opacity_max)] },
                { "name": "scale", "min": jvec3(ranges.scale_min), "max": jvec3(ranges.scale_max) },
                { "name": "envnormal", "min": [0, 0, 0], "max": [0, 0, 0] },
                { "name": "envshcoef", "min": env_shcoef.0, "max": env_shcoef.1 },
                { "name": "envscale", "min": env_scale.0, "max": env_scale.1 },
            ],
        });

        let mut out = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut out, MetaFormatter::new());
        meta.serialize(&mut ser)?;
        out.push(b'\n');
        fs::write(self.output_dir.join("meta.lcc"), out)?;
        Ok(())
    }

    fn write_attrs_lcp(&self, collision_written: bool, poses_written: bool) -> Result<()> {
        let mut attrs = json!({
            "spawnPoint": {
                "position": [0, 0, 0],
                "rotation": [0.7071068, 0, 0, 0.7071068],
            },
            "transform": {
                "position": [0, 0, 0],
                "rotation": [0, 0, 0, 1],
                "scale": [1, 1, 1],
            },
        });
        if collision_written {
            attrs["collider"] = json!({
                "simpleMesh": { "type": "ply", "path": "collision.lci" }
            });
        }
        if poses_written {
            attrs["poses"] = json!({ "path": "poses.lcp" });
        }

        let mut out = serde_json::to_string(&attrs)?;
        out.push('\n');
        fs::write(self.output_dir.join("attrs.lcp"), out)?;
        Ok(())
    }

    fn write_environment(&self, data: &LccData) -> Result<()> {
        let mut file = BufWriter::new(File::create(self.output_dir.join("environment.bin"))?);
        file.write_all(&data.environment.data)?;
        file.flush()?;
        Ok(())
    }

    fn write_collision(&self, data: &LccData) -> Result<()> {
        let collision = &data.collision;
        let mesh_num = collision.cells.len() as u32;
        let header_len = 48 + 40 * mesh_num;

        let mut file = BufWriter::new(File::create(self.output_dir.join("collision.lci"))?);
        file.write_all(&COLLISION_MAGIC.to_le_bytes())?;
        file.write_all(&COLLISION_VERSION.to_le_bytes())?;
        file.write_all(&header_len.to_le_bytes())?;
        for v in [collision.bbox.min, collision.bbox.max] {
            file.write_all(&v.x.to_le_bytes())?;
            file.write_all(&v.y.to_le_bytes())?;
            file.write_all(&v.z.to_le_bytes())?;
        }
        file.write_all(&collision.cell_size_x.to_le_bytes())?;
        file.write_all(&collision.cell_size_y.to_le_bytes())?;
        file.write_all(&mesh_num.to_le_bytes())?;

        // Mesh headers; cell payloads are packed back-to-back after the
        // header block.
        let mut offset = header_len as u64;
        for cell in &collision.cells {
            let vertex_bytes = cell.vertices.len() * 12;
            let face_bytes = cell.faces.len() * 12;
            let bytes_size = (vertex_bytes + face_bytes + cell.bvh_data.len()) as u64;

            file.write_all(&cell_x(cell.index).to_le_bytes())?;
            file.write_all(&cell_y(cell.index).to_le_bytes())?;
            file.write_all(&offset.to_le_bytes())?;
            file.write_all(&bytes_size.to_le_bytes())?;
            file.write_all(&(cell.vertices.len() as u32).to_le_bytes())?;
            file.write_all(&(cell.faces.len() as u32).to_le_bytes())?;
            file.write_all(&(cell.bvh_data.len() as u32).to_le_bytes())?;
            file.write_all(&0u32.to_le_bytes())?;

            offset += bytes_size;
        }

        for cell in &collision.cells {
            for v in &cell.vertices {
                file.write_all(&v.x.to_le_bytes())?;
                file.write_all(&v.y.to_le_bytes())?;
                file.write_all(&v.z.to_le_bytes())?;
            }
            for tri in &cell.faces {
                file.write_all(&tri.v0.to_le_bytes())?;
                file.write_all(&tri.v1.to_le_bytes())?;
                file.write_all(&tri.v2.to_le_bytes())?;
            }
            debug_assert!(cell.bvh_data.len() >= BVH_HEADER_SIZE);
            file.write_all(&cell.bvh_data)?;
        }

        file.flush()?;
        Ok(())
    }
}
