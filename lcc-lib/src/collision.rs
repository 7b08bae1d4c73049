//! Collision layer: triangle-mesh ingestion, grid partitioning and the
//! per-cell BVH build.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use glam::Vec3;
use ordered_float::OrderedFloat;
use smallvec::SmallVec;

use crate::lcc::{BvhNode, CollisionCell, CollisionData, Triangle, BVH_HEADER_SIZE};
use crate::ply::{self, PlyFormat, PlyPropertyKind};
use crate::types::{pack_cell_id, BBox, LogFn};
use crate::{LccError, Result};

const MAX_LEAF_SIZE: usize = 4;

#[derive(Default)]
pub struct CollisionEncoder {
    log: Option<LogFn>,
}

impl CollisionEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_log(&mut self, cb: LogFn) {
        self.log = Some(cb);
    }

    fn log(&self, msg: &str) {
        match &self.log {
            Some(cb) => cb(msg),
            None => log::info!("{}", msg.trim_end()),
        }
    }

    /// Reads the mesh, partitions triangles to the splat grid's cell
    /// layout and builds one BVH per cell.
    pub fn encode(
        &self,
        mesh_path: &Path,
        cell_size_x: f32,
        cell_size_y: f32,
    ) -> Result<CollisionData> {
        let mut data = CollisionData {
            cell_size_x,
            cell_size_y,
            ..Default::default()
        };

        self.log(&format!("Reading collision mesh: {}\n", mesh_path.display()));
        let (vertices, faces) = read_mesh(mesh_path)?;
        self.log(&format!(
            "  Read {} vertices, {} triangles\n",
            vertices.len(),
            faces.len()
        ));

        data.bbox = partition_by_cell(
            &vertices,
            &faces,
            cell_size_x,
            cell_size_y,
            &mut data.cells,
        );
        self.log(&format!("  Partitioned into {} cells\n", data.cells.len()));

        for cell in &mut data.cells {
            build_bvh(cell);
        }
        self.log(&format!(
            "Collision encoding complete: {} triangles in {} cells\n",
            data.total_triangles(),
            data.cells.len()
        ));

        Ok(data)
    }
}

/// Extension-based dispatch to the PLY or OBJ reader.
pub fn read_mesh(path: &Path) -> Result<(Vec<Vec3>, Vec<Triangle>)> {
    if !path.is_file() {
        return Err(LccError::InputMissing(path.to_path_buf()));
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "obj" => read_obj(path),
        "ply" => read_ply(path),
        _ => Err(LccError::InvalidFormat(format!(
            "unknown mesh format .{ext} (supported: .ply, .obj)"
        ))),
    }
}

fn read_obj(path: &Path) -> Result<(Vec<Vec3>, Vec<Triangle>)> {
    let text = fs::read_to_string(path)?;
    let mut vertices: Vec<Vec3> = Vec::new();
    let mut faces: Vec<Triangle> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("v") => {
                let mut coords = [0.0f32; 3];
                for c in &mut coords {
                    *c = fields
                        .next()
                        .and_then(|t| t.parse().ok())
                        .ok_or_else(|| {
                            LccError::InvalidFormat(format!("malformed OBJ vertex: {line}"))
                        })?;
                }
                vertices.push(Vec3::from_array(coords));
            }
            Some("f") => {
                let mut indices: SmallVec<[u32; 8]> = SmallVec::new();
                for token in fields {
                    // Accept v, v/vt, v//vn and v/vt/vn references.
                    let idx_str = token.split('/').next().unwrap_or(token);
                    let idx: i64 = idx_str.parse().map_err(|_| {
                        LccError::InvalidFormat(format!("malformed OBJ face index: {token}"))
                    })?;
                    // Negative indices are relative to the vertices seen
                    // so far; positive are 1-based.
                    let resolved = if idx < 0 {
                        vertices.len() as i64 + idx
                    } else {
                        idx - 1
                    };
                    if resolved < 0 || resolved as usize >= vertices.len() {
                        return Err(LccError::InvalidFormat(format!(
                            "OBJ face index {idx} out of range"
                        )));
                    }
                    indices.push(resolved as u32);
                }
                // Fan triangulation anchored at the first face vertex.
                for i in 2..indices.len() {
                    faces.push(Triangle {
                        v0: indices[0],
                        v1: indices[i - 1],
                        v2: indices[i],
                    });
                }
            }
            // vt, vn, mtllib, usemtl, o, g, s ...
            _ => {}
        }
    }

    if vertices.is_empty() || faces.is_empty() {
        return Err(LccError::InvalidFormat(format!(
            "{}: OBJ mesh has no triangles",
            path.display()
        )));
    }
    Ok((vertices, faces))
}

fn read_ply(path: &Path) -> Result<(Vec<Vec3>, Vec<Triangle>)> {
    let bytes = fs::read(path)?;
    let header = ply::parse_header(&bytes)?;

    let (vertices, faces) = match header.format {
        PlyFormat::BinaryLittleEndian => read_ply_binary(&bytes, &header)?,
        PlyFormat::Ascii => read_ply_ascii(&bytes, &header)?,
    };

    if vertices.is_empty() || faces.is_empty() {
        return Err(LccError::InvalidFormat(format!(
            "{}: PLY mesh has no triangles",
            path.display()
        )));
    }
    Ok((vertices, faces))
}

fn indices_property(element: &ply::PlyElement) -> Result<(&str, ply::PlyScalarType, ply::PlyScalarType)> {
    for name in &element.order {
        if let PlyPropertyKind::List {
            count_type,
            item_type,
        } = element.properties[name].kind
        {
            return Ok((name.as_str(), count_type, item_type));
        }
    }
    Err(LccError::InvalidFormat(
        "face element has no index list property".into(),
    ))
}

fn push_fan(indices: &[u32], faces: &mut Vec<Triangle>) {
    for i in 2..indices.len() {
        faces.push(Triangle {
            v0: indices[0],
            v1: indices[i - 1],
            v2: indices[i],
        });
    }
}

fn read_ply_binary(bytes: &[u8], header: &ply::PlyHeader) -> Result<(Vec<Vec3>, Vec<Triangle>)> {
    let mut vertices: Vec<Vec3> = Vec::new();
    let mut faces: Vec<Triangle> = Vec::new();
    let mut offset = header.data_offset;

    for element in &header.elements {
        if element.name == "vertex" {
            if !element.fixed_size {
                return Err(LccError::InvalidFormat(
                    "vertex element has list properties".into(),
                ));
            }
            let (tx, ox) = element
                .scalar("x")
                .ok_or_else(|| LccError::InvalidFormat("vertex missing x".into()))?;
            let (ty, oy) = element
                .scalar("y")
                .ok_or_else(|| LccError::InvalidFormat("vertex missing y".into()))?;
            let (tz, oz) = element
                .scalar("z")
                .ok_or_else(|| LccError::InvalidFormat("vertex missing z".into()))?;

            vertices.reserve(element.count);
            for row in 0..element.count {
                let base = offset + row * element.row_stride;
                if base + element.row_stride > bytes.len() {
                    return Err(LccError::InvalidFormat("vertex data truncated".into()));
                }
                vertices.push(Vec3::new(
                    tx.read_le_f64(bytes, base + ox) as f32,
                    ty.read_le_f64(bytes, base + oy) as f32,
                    tz.read_le_f64(bytes, base + oz) as f32,
                ));
            }
            offset += element.count * element.row_stride;
        } else if element.fixed_size {
            offset += element.count * element.row_stride;
        } else {
            // Variable-size element; walk it row by row. Only the face
            // element's index list is kept.
            let is_face = element.name == "face";
            let indices_name = if is_face {
                Some(indices_property(element)?.0.to_string())
            } else {
                None
            };

            let mut polygon: SmallVec<[u32; 8]> = SmallVec::new();
            for _ in 0..element.count {
                polygon.clear();
                for name in &element.order {
                    match element.properties[name].kind {
                        PlyPropertyKind::Scalar(ty) => {
                            if offset + ty.size() > bytes.len() {
                                return Err(LccError::InvalidFormat("face data truncated".into()));
                            }
                            offset += ty.size();
                        }
                        PlyPropertyKind::List {
                            count_type,
                            item_type,
                        } => {
                            if offset + count_type.size() > bytes.len() {
                                return Err(LccError::InvalidFormat("face data truncated".into()));
                            }
                            let count = count_type.read_le_f64(bytes, offset) as usize;
                            offset += count_type.size();
                            if offset + count * item_type.size() > bytes.len() {
                                return Err(LccError::InvalidFormat("face data truncated".into()));
                            }
                            let keep = indices_name.as_deref() == Some(name.as_str());
                            for _ in 0..count {
                                if keep {
                                    polygon.push(item_type.read_le_f64(bytes, offset) as u32);
                                }
                                offset += item_type.size();
                            }
                        }
                    }
                }
                if is_face {
                    push_fan(&polygon, &mut faces);
                }
            }
        }
    }

    Ok((vertices, faces))
}

fn next_line<'t>(lines: &mut std::str::Lines<'t>) -> Result<&'t str> {
    lines
        .next()
        .ok_or_else(|| LccError::InvalidFormat("ascii PLY payload truncated".into()))
}

fn read_ply_ascii(bytes: &[u8], header: &ply::PlyHeader) -> Result<(Vec<Vec3>, Vec<Triangle>)> {
    let text = std::str::from_utf8(&bytes[header.data_offset..])
        .map_err(|_| LccError::InvalidFormat("ascii PLY payload is not UTF-8".into()))?;
    let mut lines = text.lines();

    let mut vertices: Vec<Vec3> = Vec::new();
    let mut faces: Vec<Triangle> = Vec::new();

    for element in &header.elements {
        if element.name == "vertex" {
            let col = |name: &str| -> Result<usize> {
                element
                    .order
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| LccError::InvalidFormat(format!("vertex missing {name}")))
            };
            let (cx, cy, cz) = (col("x")?, col("y")?, col("z")?);

            vertices.reserve(element.count);
            for _ in 0..element.count {
                let tokens: Vec<f32> = next_line(&mut lines)?
                    .split_whitespace()
                    .map(|t| t.parse().unwrap_or(0.0))
                    .collect();
                if tokens.len() < element.order.len() {
                    return Err(LccError::InvalidFormat("short ascii vertex row".into()));
                }
                vertices.push(Vec3::new(tokens[cx], tokens[cy], tokens[cz]));
            }
        } else if element.name == "face" {
            indices_property(element)?;
            let mut polygon: SmallVec<[u32; 8]> = SmallVec::new();
            for _ in 0..element.count {
                let mut tokens = next_line(&mut lines)?.split_whitespace();
                let count: usize = tokens
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| LccError::InvalidFormat("malformed ascii face row".into()))?;
                polygon.clear();
                for _ in 0..count {
                    let idx = tokens
                        .next()
                        .and_then(|t| t.parse().ok())
                        .ok_or_else(|| LccError::InvalidFormat("short ascii face row".into()))?;
                    polygon.push(idx);
                }
                push_fan(&polygon, &mut faces);
            }
        } else {
            for _ in 0..element.count {
                next_line(&mut lines)?;
            }
        }
    }

    Ok((vertices, faces))
}

/// Assigns each triangle to the cell containing its centroid, remapping
/// vertex indices local to the cell. Returns the mesh bounding box used
/// as the grid origin.
fn partition_by_cell(
    vertices: &[Vec3],
    faces: &[Triangle],
    cell_size_x: f32,
    cell_size_y: f32,
    cells: &mut Vec<CollisionCell>,
) -> BBox {
    let mut bbox = BBox::default();
    for v in vertices {
        bbox.expand_point(*v);
    }

    let mut cell_map: BTreeMap<u32, CollisionCell> = BTreeMap::new();

    for tri in faces {
        let v0 = vertices[tri.v0 as usize];
        let v1 = vertices[tri.v1 as usize];
        let v2 = vertices[tri.v2 as usize];
        let centroid = (v0 + v1 + v2) / 3.0;

        // Cell coordinates are 16-bit in the packed id; coordinates
        // past 65535 collapse into the boundary cell rather than
        // spilling into the other axis's bits.
        let cx = (((centroid.x - bbox.min.x) / cell_size_x).floor() as i64).clamp(0, 65535) as u32;
        let cy = (((centroid.y - bbox.min.y) / cell_size_y).floor() as i64).clamp(0, 65535) as u32;
        let cell_id = pack_cell_id(cx, cy);

        let cell = cell_map.entry(cell_id).or_insert_with(|| CollisionCell {
            index: cell_id,
            ..Default::default()
        });

        // Exact-equality dedup keeps the output bit-identical to the
        // historical layout; duplicated near-equal vertices are accepted.
        let mut local_idx = |v: Vec3| -> u32 {
            for (i, existing) in cell.vertices.iter().enumerate() {
                if existing.x == v.x && existing.y == v.y && existing.z == v.z {
                    return i as u32;
                }
            }
            cell.vertices.push(v);
            (cell.vertices.len() - 1) as u32
        };

        let local = Triangle {
            v0: local_idx(v0),
            v1: local_idx(v1),
            v2: local_idx(v2),
        };
        cell.faces.push(local);
    }

    cells.clear();
    cells.extend(cell_map.into_values());
    bbox
}

fn triangle_bbox(vertices: &[Vec3], tri: &Triangle) -> (Vec3, Vec3) {
    let v0 = vertices[tri.v0 as usize];
    let v1 = vertices[tri.v1 as usize];
    let v2 = vertices[tri.v2 as usize];
    (v0.min(v1).min(v2), v0.max(v1).max(v2))
}

fn triangle_centroid(vertices: &[Vec3], tri: &Triangle, axis: usize) -> f32 {
    let v0 = vertices[tri.v0 as usize];
    let v1 = vertices[tri.v1 as usize];
    let v2 = vertices[tri.v2 as usize];
    (v0[axis] + v1[axis] + v2[axis]) / 3.0
}

struct BuildEntry {
    start: usize,
    count: usize,
    parent: Option<usize>,
    is_right_child: bool,
}

/// Median-split BVH over the cell's triangles. Leaves hold at most
/// [`MAX_LEAF_SIZE`] faces; the face array is reordered so each leaf
/// references a contiguous range. The serialized payload is a 16-byte
/// reserved header followed by the nodes in build order.
pub fn build_bvh(cell: &mut CollisionCell) {
    if cell.faces.is_empty() {
        cell.bvh_data = vec![0u8; BVH_HEADER_SIZE];
        return;
    }

    let mut nodes: Vec<BvhNode> = Vec::new();
    let mut face_order: Vec<usize> = Vec::new();
    let mut indices: Vec<usize> = (0..cell.faces.len()).collect();

    let mut stack = vec![BuildEntry {
        start: 0,
        count: indices.len(),
        parent: None,
        is_right_child: false,
    }];

    while let Some(entry) = stack.pop() {
        let mut bmin = Vec3::splat(f32::INFINITY);
        let mut bmax = Vec3::splat(f32::NEG_INFINITY);
        for &face in &indices[entry.start..entry.start + entry.count] {
            let (tmin, tmax) = triangle_bbox(&cell.vertices, &cell.faces[face]);
            bmin = bmin.min(tmin);
            bmax = bmax.max(tmax);
        }

        let node_idx = nodes.len();
        if let Some(parent) = entry.parent {
            if entry.is_right_child {
                nodes[parent].data0 = node_idx as u32;
            }
        }

        if entry.count <= MAX_LEAF_SIZE {
            let face_offset = face_order.len() as u32;
            face_order.extend_from_slice(&indices[entry.start..entry.start + entry.count]);
            nodes.push(BvhNode::leaf(
                bmin.to_array(),
                bmax.to_array(),
                face_offset,
                entry.count as u16,
            ));
        } else {
            let extent = bmax - bmin;
            let mut axis = 0;
            if extent.y > extent[axis] {
                axis = 1;
            }
            if extent.z > extent[axis] {
                axis = 2;
            }

            indices[entry.start..entry.start + entry.count].sort_by_key(|&face| {
                OrderedFloat(triangle_centroid(&cell.vertices, &cell.faces[face], axis))
            });
            let mid = entry.count / 2;

            nodes.push(BvhNode::internal(
                bmin.to_array(),
                bmax.to_array(),
                0,
                axis as u16,
            ));

            // Right child is pushed first so the left child is built
            // (and numbered) immediately after its parent.
            stack.push(BuildEntry {
                start: entry.start + mid,
                count: entry.count - mid,
                parent: Some(node_idx),
                is_right_child: true,
            });
            stack.push(BuildEntry {
                start: entry.start,
                count: mid,
                parent: Some(node_idx),
                is_right_child: false,
            });
        }
    }

    let reordered: Vec<Triangle> = face_order.iter().map(|&i| cell.faces[i]).collect();
    cell.faces = reordered;

    let mut bvh_data = vec![0u8; BVH_HEADER_SIZE];
    for node in &nodes {
        node.write_to(&mut bvh_data);
    }
    cell.bvh_data = bvh_data;
}
