//! Quantization primitives for the 32-byte splat record and the 64-byte
//! SH record.

use glam::Vec3;

use crate::splat_buffer::SplatView;
use crate::types::{sigmoid, AttributeRanges};

/// Zeroth-order spherical harmonic basis constant.
pub const SH_C0: f32 = 0.28209479177387814;

const RSQRT2: f32 = 0.7071067811865475;
const SQRT2: f32 = 1.414213562373095;

/// Higher-order SH bands carried per channel in the output record.
pub const SH_BANDS: usize = 15;

/// Packs DC color and logit opacity into RGBA, R in the lowest byte.
pub fn encode_color(f_dc: Vec3, opacity: f32) -> u32 {
    let to_channel = |dc: f32| -> u32 {
        let color = (0.5 + SH_C0 * dc).clamp(0.0, 1.0);
        (color * 255.0 + 0.5) as u32
    };
    let r = to_channel(f_dc.x);
    let g = to_channel(f_dc.y);
    let b = to_channel(f_dc.z);
    let a = (sigmoid(opacity).clamp(0.0, 1.0) * 255.0 + 0.5) as u32;
    (a << 24) | (b << 16) | (g << 8) | r
}

/// Quantizes log-space scales against linear-space bounds, per axis.
/// A degenerate range maps to 0.
pub fn encode_scale(log_scale: Vec3, scale_min: Vec3, scale_max: Vec3) -> [u16; 3] {
    let mut out = [0u16; 3];
    for i in 0..3 {
        let linear = log_scale[i].exp();
        let range = scale_max[i] - scale_min[i];
        let normalized = if range > 0.0 {
            ((linear - scale_min[i]) / range).clamp(0.0, 1.0)
        } else {
            0.0
        };
        out[i] = (normalized * 65535.0 + 0.5) as u16;
    }
    out
}

/// 10/10/10/2-bit smallest-three quaternion packing.
///
/// Input is the PLY order `(w, x, y, z)`. The output index in bits 30-31
/// names the dropped component's slot in `(x, y, z, w)` order, which is
/// what the runtime's decode table expects.
pub fn encode_rotation(rot: [f32; 4]) -> u32 {
    let [mut w, mut x, mut y, mut z] = rot;

    let len = (w * w + x * x + y * y + z * z).sqrt();
    if len > 0.0 {
        w /= len;
        x /= len;
        y /= len;
        z /= len;
    }

    let abs_vals = [w.abs(), x.abs(), y.abs(), z.abs()];
    let mut max_idx_wxyz = 0;
    for i in 1..4 {
        if abs_vals[i] > abs_vals[max_idx_wxyz] {
            max_idx_wxyz = i;
        }
    }

    // Negating the whole quaternion preserves the rotation and makes
    // the dropped component non-negative, so it can be reconstructed.
    let src = [w, x, y, z];
    let src = if src[max_idx_wxyz] < 0.0 {
        src.map(|v| -v)
    } else {
        src
    };

    // Destination slot of the dropped component in (x, y, z, w) order.
    const WXYZ_TO_XYZW: [usize; 4] = [3, 0, 1, 2];
    let idx = WXYZ_TO_XYZW[max_idx_wxyz];

    // Emitted components per destination slot, as indices into (w,x,y,z).
    const ORDER: [[usize; 3]; 4] = [
        [2, 3, 0], // idx 0: y, z, w
        [1, 3, 0], // idx 1: x, z, w
        [1, 2, 0], // idx 2: x, y, w
        [1, 2, 3], // idx 3: x, y, z
    ];

    let encode_component = |v: f32| -> u32 {
        let normalized = ((v + RSQRT2) / SQRT2).clamp(0.0, 1.0);
        (normalized * 1023.0 + 0.5) as u32
    };

    let p0 = encode_component(src[ORDER[idx][0]]);
    let p1 = encode_component(src[ORDER[idx][1]]);
    let p2 = encode_component(src[ORDER[idx][2]]);

    p0 | (p1 << 10) | (p2 << 20) | ((idx as u32) << 30)
}

/// One SH band for all three channels, 11/10/11 bits. A zero range maps
/// every channel to the midpoint.
pub fn encode_sh_triplet(r: f32, g: f32, b: f32, sh_min: f32, sh_max: f32) -> u32 {
    let range = sh_max - sh_min;
    let normalize = |v: f32| -> f32 {
        if range <= 0.0 {
            0.5
        } else {
            ((v - sh_min) / range).clamp(0.0, 1.0)
        }
    };

    let r_enc = (normalize(r) * 2047.0 + 0.5) as u32;
    let g_enc = (normalize(g) * 1023.0 + 0.5) as u32;
    let b_enc = (normalize(b) * 2047.0 + 0.5) as u32;

    r_enc | (g_enc << 11) | (b_enc << 21)
}

/// Packs the higher-order bands of one splat into 16 words (the 16th is
/// reserved zero).
///
/// `f_rest` is the file's planar layout `[R_1..R_B, G_1..G_B, B_1..B_B]`
/// with `B = f_rest.len() / 3`; bands past `B` encode 0.0.
pub fn encode_sh(f_rest: &[f32], sh_min: f32, sh_max: f32) -> [u32; 16] {
    let bands = (f_rest.len() / 3).min(SH_BANDS);
    let channel = |c: usize, band: usize| -> f32 {
        if band < bands {
            f_rest[c * bands + band]
        } else {
            0.0
        }
    };

    let mut out = [0u32; 16];
    for (band, word) in out.iter_mut().take(SH_BANDS).enumerate() {
        *word = encode_sh_triplet(
            channel(0, band),
            channel(1, band),
            channel(2, band),
            sh_min,
            sh_max,
        );
    }
    out
}

/// Appends one splat's 32-byte record to `data` and, when `has_sh`, its
/// 64-byte SH record to `shcoef`.
pub fn encode_splat(
    splat: &SplatView<'_>,
    ranges: &AttributeRanges,
    has_sh: bool,
    data: &mut Vec<u8>,
    shcoef: &mut Vec<u8>,
) {
    let pos = splat.pos();
    data.extend_from_slice(&pos.x.to_le_bytes());
    data.extend_from_slice(&pos.y.to_le_bytes());
    data.extend_from_slice(&pos.z.to_le_bytes());

    let color = encode_color(splat.f_dc(), splat.opacity());
    data.extend_from_slice(&color.to_le_bytes());

    let scales = encode_scale(splat.scale(), ranges.scale_min, ranges.scale_max);
    for s in scales {
        data.extend_from_slice(&s.to_le_bytes());
    }

    let rot = encode_rotation(splat.rot());
    data.extend_from_slice(&rot.to_le_bytes());

    // Normals are always zero for 3DGS input.
    data.extend_from_slice(&[0u8; 6]);

    if has_sh {
        let mut f_rest = [0.0f32; SH_BANDS * 3];
        let count = splat.num_f_rest().min(f_rest.len());
        for (i, v) in f_rest.iter_mut().take(count).enumerate() {
            *v = splat.f_rest(i);
        }
        let (sh_min, sh_max) = ranges.sh_scalar_bounds();
        for word in encode_sh(&f_rest[..count], sh_min, sh_max) {
            shcoef.extend_from_slice(&word.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpack_color(color: u32) -> [u8; 4] {
        [
            (color & 0xff) as u8,
            ((color >> 8) & 0xff) as u8,
            ((color >> 16) & 0xff) as u8,
            ((color >> 24) & 0xff) as u8,
        ]
    }

    fn unpack_rotation(word: u32) -> ([u32; 3], u32) {
        (
            [word & 0x3ff, (word >> 10) & 0x3ff, (word >> 20) & 0x3ff],
            word >> 30,
        )
    }

    /// Inverse of [`encode_rotation`], returning (w, x, y, z).
    fn decode_rotation(word: u32) -> [f32; 4] {
        let (parts, idx) = unpack_rotation(word);
        let decode = |p: u32| -> f32 { (p as f32 / 1023.0) * SQRT2 - RSQRT2 };
        let a = decode(parts[0]);
        let b = decode(parts[1]);
        let c = decode(parts[2]);
        let d = (1.0 - a * a - b * b - c * c).max(0.0).sqrt();
        // idx is the dropped slot in (x, y, z, w).
        let [x, y, z, w] = match idx {
            0 => [d, a, b, c],
            1 => [a, d, b, c],
            2 => [a, b, d, c],
            _ => [a, b, c, d],
        };
        [w, x, y, z]
    }

    #[test]
    fn color_zero_dc_is_mid_gray() {
        let color = encode_color(Vec3::ZERO, 0.0);
        for channel in unpack_color(color) {
            assert!((channel as i32 - 128).abs() <= 1);
        }
    }

    #[test]
    fn color_saturates_to_white() {
        let color = encode_color(Vec3::splat(10.0), 10.0);
        let [r, g, b, a] = unpack_color(color);
        assert_eq!([r, g, b], [255, 255, 255]);
        assert!(a >= 254);
    }

    #[test]
    fn scale_hits_range_endpoints() {
        let min = Vec3::splat(0.1);
        let max = Vec3::splat(10.0);
        assert_eq!(encode_scale(Vec3::splat(0.1f32.ln()), min, max), [0; 3]);
        assert_eq!(
            encode_scale(Vec3::splat(10.0f32.ln()), min, max),
            [65535; 3]
        );
    }

    #[test]
    fn scale_midpoint_and_degenerate_range() {
        let out = encode_scale(Vec3::ZERO, Vec3::ZERO, Vec3::splat(2.0));
        assert!((out[0] as i32 - 32768).abs() <= 1);

        let out = encode_scale(Vec3::ZERO, Vec3::ONE, Vec3::ONE);
        assert_eq!(out, [0; 3]);
    }

    #[test]
    fn rotation_identity_drops_w_slot() {
        let word = encode_rotation([1.0, 0.0, 0.0, 0.0]);
        let (parts, idx) = unpack_rotation(word);
        assert_eq!(idx, 3);
        for p in parts {
            assert!((p as i32 - 512).abs() <= 2);
        }
    }

    #[test]
    fn rotation_normalizes_input() {
        assert_eq!(
            encode_rotation([2.0, 0.0, 0.0, 0.0]),
            encode_rotation([1.0, 0.0, 0.0, 0.0])
        );
    }

    #[test]
    fn rotation_dominant_axis_slots() {
        // Largest component x, y, z map to slots 0, 1, 2.
        let (_, idx) = unpack_rotation(encode_rotation([0.1, 0.9, 0.1, 0.1]));
        assert_eq!(idx, 0);
        let (_, idx) = unpack_rotation(encode_rotation([0.1, 0.1, 0.9, 0.1]));
        assert_eq!(idx, 1);
        let (_, idx) = unpack_rotation(encode_rotation([0.1, 0.1, 0.1, 0.9]));
        assert_eq!(idx, 2);
    }

    #[test]
    fn rotation_round_trip_preserves_orientation() {
        let cases: [[f32; 4]; 6] = [
            [1.0, 0.0, 0.0, 0.0],
            [0.7071068, 0.7071068, 0.0, 0.0],
            [-0.8, 0.2, 0.4, 0.4],
            [0.1, -0.9, 0.3, 0.2],
            [0.5, 0.5, 0.5, 0.5],
            [0.2, 0.3, 0.1, -0.9],
        ];
        for q in cases {
            let len = q.iter().map(|v| v * v).sum::<f32>().sqrt();
            let q = q.map(|v| v / len);
            let decoded = decode_rotation(encode_rotation(q));
            let dot: f32 = q.iter().zip(&decoded).map(|(a, b)| a * b).sum();
            assert!(dot.abs() >= 0.9995, "round-trip failed for {q:?}: dot {dot}");
        }
    }

    #[test]
    fn sh_triplet_endpoints_and_midpoint() {
        let enc = encode_sh_triplet(-3.0, -3.0, -3.0, -3.0, 3.0);
        assert_eq!(enc & 0x7ff, 0);
        assert_eq!((enc >> 11) & 0x3ff, 0);
        assert_eq!((enc >> 21) & 0x7ff, 0);

        let enc = encode_sh_triplet(3.0, 3.0, 3.0, -3.0, 3.0);
        assert_eq!(enc & 0x7ff, 2047);
        assert_eq!((enc >> 11) & 0x3ff, 1023);
        assert_eq!((enc >> 21) & 0x7ff, 2047);

        let enc = encode_sh_triplet(0.0, 0.0, 0.0, -2.0, 2.0);
        assert!(((enc & 0x7ff) as i32 - 1024).abs() <= 1);
        assert!((((enc >> 11) & 0x3ff) as i32 - 512).abs() <= 1);
    }

    #[test]
    fn sh_triplet_zero_range_is_midpoint() {
        let enc = encode_sh_triplet(1.0, 1.0, 1.0, 1.0, 1.0);
        assert!(((enc & 0x7ff) as i32 - 1024).abs() <= 1);
        assert!((((enc >> 11) & 0x3ff) as i32 - 512).abs() <= 1);
        assert!((((enc >> 21) & 0x7ff) as i32 - 1024).abs() <= 1);
    }

    #[test]
    fn sh_words_use_planar_channel_layout() {
        // 45 coefficients valued by index: R bands are 0..14, G 15..29,
        // B 30..44.
        let f_rest: Vec<f32> = (0..45).map(|i| i as f32).collect();
        let words = encode_sh(&f_rest, 0.0, 44.0);
        assert_eq!(words[15], 0);

        let first = words[0];
        let r = (first & 0x7ff) as f32 / 2047.0 * 44.0;
        let g = ((first >> 11) & 0x3ff) as f32 / 1023.0 * 44.0;
        let b = ((first >> 21) & 0x7ff) as f32 / 2047.0 * 44.0;
        assert!((r - 0.0).abs() < 0.05);
        assert!((g - 15.0).abs() < 0.05);
        assert!((b - 30.0).abs() < 0.05);
    }

    #[test]
    fn sh_short_input_pads_missing_bands() {
        // Degree 1: 3 bands per channel, planar.
        let f_rest = [1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0];
        let words = encode_sh(&f_rest, 0.0, 4.0);
        // Band 3 has no data: encodes 0.0, which normalizes to 0.
        assert_eq!(words[3] & 0x7ff, 0);
        // Band 0 reads R=1, G=2, B=3.
        let w = words[0];
        assert!(((w & 0x7ff) as f32 / 2047.0 * 4.0 - 1.0).abs() < 0.05);
        assert!((((w >> 11) & 0x3ff) as f32 / 1023.0 * 4.0 - 2.0).abs() < 0.05);
        assert!((((w >> 21) & 0x7ff) as f32 / 2047.0 * 4.0 - 3.0).abs() < 0.05);
    }
}
