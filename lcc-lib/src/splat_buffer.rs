//! Memory-mapped zero-copy access to Gaussian splat PLY data.
//!
//! The vertex element of a binary little-endian PLY is exposed as a
//! fixed-stride byte region plus a [`PropTable`] of byte offsets, so the
//! encoders read any field with pointer arithmetic and never allocate
//! per row.

use std::fs::File;
use std::path::Path;

use glam::Vec3;
use memmap2::Mmap;

use crate::ply::{self, PlyFormat, PlyScalarType};
use crate::types::BBox;
use crate::{LccError, Result};

/// Byte offsets of the splat properties within one vertex row.
#[derive(Clone, Debug, Default)]
pub struct PropTable {
    pub pos: usize,
    pub normal: usize,
    pub f_dc: usize,
    pub opacity: usize,
    pub scale: usize,
    pub rot: usize,
    pub f_rest: usize,
    pub row_stride: usize,
    pub num_rows: usize,
    pub num_f_rest: usize,
    pub sh_degree: usize,
    pub has_normal: bool,
}

fn sh_degree_for(num_f_rest: usize) -> usize {
    match num_f_rest {
        0 => 0,
        9 => 1,
        24 => 2,
        45 => 3,
        72 => 4,
        _ => 3,
    }
}

/// Borrowed view of a single splat row. All fields are float32 in the
/// file; rotation is stored scalar-first `(w, x, y, z)`, scale is
/// log-space and opacity logit-space.
#[derive(Clone, Copy)]
pub struct SplatView<'a> {
    row: &'a [u8],
    table: &'a PropTable,
}

impl<'a> SplatView<'a> {
    fn f32_at(&self, offset: usize) -> f32 {
        f32::from_le_bytes(self.row[offset..offset + 4].try_into().unwrap())
    }

    fn vec3_at(&self, offset: usize) -> Vec3 {
        Vec3::new(
            self.f32_at(offset),
            self.f32_at(offset + 4),
            self.f32_at(offset + 8),
        )
    }

    pub fn pos(&self) -> Vec3 {
        self.vec3_at(self.table.pos)
    }

    pub fn normal(&self) -> Vec3 {
        if self.table.has_normal {
            self.vec3_at(self.table.normal)
        } else {
            Vec3::ZERO
        }
    }

    pub fn f_dc(&self) -> Vec3 {
        self.vec3_at(self.table.f_dc)
    }

    pub fn opacity(&self) -> f32 {
        self.f32_at(self.table.opacity)
    }

    pub fn scale(&self) -> Vec3 {
        self.vec3_at(self.table.scale)
    }

    /// Rotation quaternion in file order `[w, x, y, z]`.
    pub fn rot(&self) -> [f32; 4] {
        [
            self.f32_at(self.table.rot),
            self.f32_at(self.table.rot + 4),
            self.f32_at(self.table.rot + 8),
            self.f32_at(self.table.rot + 12),
        ]
    }

    pub fn f_rest(&self, i: usize) -> f32 {
        self.f32_at(self.table.f_rest + i * 4)
    }

    pub fn num_f_rest(&self) -> usize {
        self.table.num_f_rest
    }
}

/// Read-only memory mapping over a splat PLY file.
///
/// The mapping outlives every [`SplatView`] handed out; views borrow the
/// buffer and carry no data of their own.
#[derive(Debug)]
pub struct SplatBuffer {
    mmap: Mmap,
    data_offset: usize,
    table: PropTable,
}

impl SplatBuffer {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(LccError::InputMissing(path.to_path_buf()));
        }
        let file = File::open(path)?;
        // Safety: the mapping is read-only and private; concurrent
        // truncation of the input is outside the supported contract.
        let mmap = unsafe { Mmap::map(&file)? };

        let header = ply::parse_header(&mmap)?;
        if header.format != PlyFormat::BinaryLittleEndian {
            return Err(LccError::InvalidFormat(format!(
                "{}: only binary little-endian PLY is supported",
                path.display()
            )));
        }

        // The vertex payload offset is the header end plus every
        // preceding element's payload, which must be fixed-size to be
        // skippable.
        let mut data_offset = header.data_offset;
        let mut vertex = None;
        for element in &header.elements {
            if element.name == "vertex" {
                vertex = Some(element);
                break;
            }
            if !element.fixed_size {
                return Err(LccError::InvalidFormat(format!(
                    "{}: variable-size element precedes vertex data",
                    path.display()
                )));
            }
            data_offset += element.row_stride * element.count;
        }
        let vertex = vertex.ok_or_else(|| {
            LccError::InvalidFormat(format!("{}: no vertex element", path.display()))
        })?;
        if !vertex.fixed_size {
            return Err(LccError::InvalidFormat(format!(
                "{}: vertex element has variable-size properties",
                path.display()
            )));
        }

        let float_offset = |name: &str| -> Result<usize> {
            match vertex.scalar(name) {
                Some((PlyScalarType::Float, offset)) => Ok(offset),
                Some(_) => Err(LccError::InvalidFormat(format!(
                    "{}: property {name} is not float32",
                    path.display()
                ))),
                None => Err(LccError::InvalidFormat(format!(
                    "{}: missing property {name}",
                    path.display()
                ))),
            }
        };

        let pos = float_offset("x")?;
        float_offset("y")?;
        float_offset("z")?;
        let f_dc = float_offset("f_dc_0")?;
        float_offset("f_dc_1")?;
        float_offset("f_dc_2")?;
        let opacity = float_offset("opacity")?;
        let scale = float_offset("scale_0")?;
        float_offset("scale_1")?;
        float_offset("scale_2")?;
        let rot = float_offset("rot_0")?;
        float_offset("rot_1")?;
        float_offset("rot_2")?;
        float_offset("rot_3")?;

        let has_normal = vertex.scalar("nx").is_some()
            && vertex.scalar("ny").is_some()
            && vertex.scalar("nz").is_some();
        let normal = if has_normal {
            float_offset("nx")?
        } else {
            0
        };

        // f_rest_i counted contiguously from 0; a gap ends the run.
        let mut num_f_rest = 0;
        let mut f_rest = 0;
        while let Some((ty, offset)) = vertex.scalar(&format!("f_rest_{num_f_rest}")) {
            if ty != PlyScalarType::Float {
                return Err(LccError::InvalidFormat(format!(
                    "{}: property f_rest_{num_f_rest} is not float32",
                    path.display()
                )));
            }
            if num_f_rest == 0 {
                f_rest = offset;
            } else if offset != f_rest + num_f_rest * 4 {
                return Err(LccError::InvalidFormat(format!(
                    "{}: f_rest properties are not contiguous",
                    path.display()
                )));
            }
            num_f_rest += 1;
        }

        let payload = vertex.row_stride * vertex.count;
        if data_offset + payload > mmap.len() {
            return Err(LccError::InvalidFormat(format!(
                "{}: vertex data extends beyond end of file",
                path.display()
            )));
        }

        let table = PropTable {
            pos,
            normal,
            f_dc,
            opacity,
            scale,
            rot,
            f_rest,
            row_stride: vertex.row_stride,
            num_rows: vertex.count,
            num_f_rest,
            sh_degree: sh_degree_for(num_f_rest),
            has_normal,
        };

        Ok(Self {
            mmap,
            data_offset,
            table,
        })
    }

    pub fn len(&self) -> usize {
        self.table.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.table.num_rows == 0
    }

    pub fn get(&self, i: usize) -> SplatView<'_> {
        let start = self.data_offset + i * self.table.row_stride;
        SplatView {
            row: &self.mmap[start..start + self.table.row_stride],
            table: &self.table,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = SplatView<'_>> {
        (0..self.len()).map(|i| self.get(i))
    }

    pub fn table(&self) -> &PropTable {
        &self.table
    }

    pub fn sh_degree(&self) -> usize {
        self.table.sh_degree
    }

    pub fn num_f_rest(&self) -> usize {
        self.table.num_f_rest
    }

    pub fn has_normal(&self) -> bool {
        self.table.has_normal
    }

    /// Scans positions only.
    pub fn compute_bbox(&self) -> BBox {
        let mut bbox = BBox::default();
        for splat in self.iter() {
            bbox.expand_point(splat.pos());
        }
        bbox
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use std::path::Path;

    /// One logical splat for building fixture files.
    #[derive(Clone)]
    pub struct TestSplat {
        pub pos: [f32; 3],
        pub f_dc: [f32; 3],
        pub opacity: f32,
        pub scale: [f32; 3],
        pub rot: [f32; 4],
        pub f_rest: Vec<f32>,
    }

    impl Default for TestSplat {
        fn default() -> Self {
            Self {
                pos: [0.0; 3],
                f_dc: [0.0; 3],
                opacity: 0.0,
                scale: [0.0; 3],
                rot: [1.0, 0.0, 0.0, 0.0],
                f_rest: Vec::new(),
            }
        }
    }

    pub fn write_splat_ply(path: &Path, splats: &[TestSplat]) {
        let num_f_rest = splats.first().map_or(0, |s| s.f_rest.len());
        let mut header = String::from("ply\nformat binary_little_endian 1.0\n");
        header.push_str(&format!("element vertex {}\n", splats.len()));
        for name in ["x", "y", "z"] {
            header.push_str(&format!("property float {name}\n"));
        }
        for i in 0..3 {
            header.push_str(&format!("property float f_dc_{i}\n"));
        }
        for i in 0..num_f_rest {
            header.push_str(&format!("property float f_rest_{i}\n"));
        }
        header.push_str("property float opacity\n");
        for i in 0..3 {
            header.push_str(&format!("property float scale_{i}\n"));
        }
        for i in 0..4 {
            header.push_str(&format!("property float rot_{i}\n"));
        }
        header.push_str("end_header\n");

        let mut bytes = header.into_bytes();
        for s in splats {
            for v in s.pos.iter().chain(&s.f_dc).chain(&s.f_rest) {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            bytes.extend_from_slice(&s.opacity.to_le_bytes());
            for v in s.scale.iter().chain(&s.rot) {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }

        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&bytes).unwrap();
    }
}
