use std::path::PathBuf;
use std::sync::Arc;

use glam::Vec3;

/// Progress callback: percentage in `[0, 100]` plus a short status line.
pub type ProgressFn = Arc<dyn Fn(u32, &str) + Send + Sync>;

/// Log callback for user-facing messages. Lines end with `\n`.
pub type LogFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Axis-aligned bounding box, empty until the first point is added.
#[derive(Clone, Copy, Debug)]
pub struct BBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for BBox {
    fn default() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }
}

impl BBox {
    pub fn expand_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn expand_bbox(&mut self, other: &BBox) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }
}

/// Globally aggregated attribute ranges used for quantization.
///
/// Scale is tracked in linear space (after `exp`), opacity after
/// `sigmoid`, SH per channel (x=R, y=G, z=B). Merging is commutative so
/// thread-local accumulators can fold in any order.
#[derive(Clone, Copy, Debug)]
pub struct AttributeRanges {
    pub scale_min: Vec3,
    pub scale_max: Vec3,
    pub sh_min: Vec3,
    pub sh_max: Vec3,
    pub opacity_min: f32,
    pub opacity_max: f32,
}

impl Default for AttributeRanges {
    fn default() -> Self {
        Self {
            scale_min: Vec3::splat(f32::INFINITY),
            scale_max: Vec3::splat(f32::NEG_INFINITY),
            sh_min: Vec3::splat(f32::INFINITY),
            sh_max: Vec3::splat(f32::NEG_INFINITY),
            opacity_min: f32::INFINITY,
            opacity_max: f32::NEG_INFINITY,
        }
    }
}

impl AttributeRanges {
    pub fn expand_scale(&mut self, linear_scale: Vec3) {
        self.scale_min = self.scale_min.min(linear_scale);
        self.scale_max = self.scale_max.max(linear_scale);
    }

    pub fn expand_sh(&mut self, r: f32, g: f32, b: f32) {
        let v = Vec3::new(r, g, b);
        self.sh_min = self.sh_min.min(v);
        self.sh_max = self.sh_max.max(v);
    }

    pub fn expand_opacity(&mut self, sigmoid_opacity: f32) {
        self.opacity_min = self.opacity_min.min(sigmoid_opacity);
        self.opacity_max = self.opacity_max.max(sigmoid_opacity);
    }

    pub fn merge(&mut self, other: &AttributeRanges) {
        self.scale_min = self.scale_min.min(other.scale_min);
        self.scale_max = self.scale_max.max(other.scale_max);
        self.sh_min = self.sh_min.min(other.sh_min);
        self.sh_max = self.sh_max.max(other.sh_max);
        self.opacity_min = self.opacity_min.min(other.opacity_min);
        self.opacity_max = self.opacity_max.max(other.opacity_max);
    }

    /// Scalar SH bounds collapsed across channels, as the downstream
    /// unpacker expects.
    pub fn sh_scalar_bounds(&self) -> (f32, f32) {
        (self.sh_min.min_element(), self.sh_max.max_element())
    }
}

/// Separate bounds for the environment cloud; it does not share ranges
/// with the grid splats.
#[derive(Clone, Copy, Debug)]
pub struct EnvBounds {
    pub pos_min: Vec3,
    pub pos_max: Vec3,
    pub sh_min: Vec3,
    pub sh_max: Vec3,
    pub scale_min: Vec3,
    pub scale_max: Vec3,
}

impl Default for EnvBounds {
    fn default() -> Self {
        Self {
            pos_min: Vec3::splat(f32::INFINITY),
            pos_max: Vec3::splat(f32::NEG_INFINITY),
            sh_min: Vec3::splat(f32::INFINITY),
            sh_max: Vec3::splat(f32::NEG_INFINITY),
            scale_min: Vec3::splat(f32::INFINITY),
            scale_max: Vec3::splat(f32::NEG_INFINITY),
        }
    }
}

impl EnvBounds {
    pub fn expand_pos(&mut self, p: Vec3) {
        self.pos_min = self.pos_min.min(p);
        self.pos_max = self.pos_max.max(p);
    }

    pub fn expand_sh(&mut self, r: f32, g: f32, b: f32) {
        let v = Vec3::new(r, g, b);
        self.sh_min = self.sh_min.min(v);
        self.sh_max = self.sh_max.max(v);
    }

    pub fn expand_scale(&mut self, linear_scale: Vec3) {
        self.scale_min = self.scale_min.min(linear_scale);
        self.scale_max = self.scale_max.max(linear_scale);
    }

    pub fn sh_scalar_bounds(&self) -> (f32, f32) {
        (self.sh_min.min_element(), self.sh_max.max_element())
    }
}

/// Conversion settings shared by the CLI and any embedding shell.
#[derive(Clone, Debug)]
pub struct ConvertConfig {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub cell_size_x: f32,
    pub cell_size_y: f32,
    pub single_lod: bool,
    pub include_env: bool,
    pub env_path: Option<PathBuf>,
    pub include_collision: bool,
    pub collision_path: Option<PathBuf>,
    pub include_poses: bool,
    pub poses_path: Option<PathBuf>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::new(),
            output_dir: PathBuf::new(),
            cell_size_x: 30.0,
            cell_size_y: 30.0,
            single_lod: false,
            include_env: false,
            env_path: None,
            include_collision: false,
            collision_path: None,
            include_poses: false,
            poses_path: None,
        }
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Packs grid coordinates into a cell id: low 16 bits x, high 16 bits y.
pub fn pack_cell_id(cell_x: u32, cell_y: u32) -> u32 {
    (cell_y << 16) | cell_x
}

pub fn cell_x(cell_id: u32) -> u32 {
    cell_id & 0xffff
}

pub fn cell_y(cell_id: u32) -> u32 {
    cell_id >> 16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_starts_empty_and_expands() {
        let mut bbox = BBox::default();
        bbox.expand_point(Vec3::new(1.0, -2.0, 3.0));
        bbox.expand_point(Vec3::new(-1.0, 2.0, 0.0));
        assert_eq!(bbox.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(bbox.max, Vec3::new(1.0, 2.0, 3.0));
        assert!(bbox.contains(Vec3::ZERO));
    }

    #[test]
    fn ranges_merge_is_commutative() {
        let mut a = AttributeRanges::default();
        a.expand_scale(Vec3::new(0.5, 1.0, 2.0));
        a.expand_opacity(0.25);
        a.expand_sh(-1.0, 0.0, 1.0);

        let mut b = AttributeRanges::default();
        b.expand_scale(Vec3::new(3.0, 0.1, 1.0));
        b.expand_opacity(0.75);
        b.expand_sh(2.0, -2.0, 0.5);

        let mut ab = a;
        ab.merge(&b);
        let mut ba = b;
        ba.merge(&a);

        assert_eq!(ab.scale_min, ba.scale_min);
        assert_eq!(ab.scale_max, ba.scale_max);
        assert_eq!(ab.sh_min, ba.sh_min);
        assert_eq!(ab.sh_max, ba.sh_max);
        assert_eq!(ab.opacity_min, ba.opacity_min);
        assert_eq!(ab.opacity_max, ba.opacity_max);
        assert_eq!(ab.sh_scalar_bounds(), (-2.0, 2.0));
    }

    #[test]
    fn cell_id_packs_x_low_y_high() {
        let id = pack_cell_id(3, 7);
        assert_eq!(id, (7 << 16) | 3);
        assert_eq!(cell_x(id), 3);
        assert_eq!(cell_y(id), 7);
    }
}
