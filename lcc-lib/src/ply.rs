//! PLY header parsing shared by the splat buffer and the collision
//! mesh reader.
//!
//! Only the textual header is handled here; element payload access is
//! the caller's business (memory-mapped for splats, buffered for
//! meshes). Offsets are byte offsets within one fixed-size row.

use std::collections::HashMap;

use crate::{LccError, Result};

pub const HEADER_TERMINATOR: &[u8] = b"end_header\n";
const MAX_HEADER_SIZE: usize = 65536;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlyFormat {
    Ascii,
    BinaryLittleEndian,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlyScalarType {
    Char,
    Uchar,
    Short,
    Ushort,
    Int,
    Uint,
    Float,
    Double,
}

impl PlyScalarType {
    pub fn size(self) -> usize {
        match self {
            Self::Char | Self::Uchar => 1,
            Self::Short | Self::Ushort => 2,
            Self::Int | Self::Uint | Self::Float => 4,
            Self::Double => 8,
        }
    }

    fn parse(s: &str) -> Result<Self> {
        let ty = match s {
            "char" | "int8" => Self::Char,
            "uchar" | "uint8" => Self::Uchar,
            "short" | "int16" => Self::Short,
            "ushort" | "uint16" => Self::Ushort,
            "int" | "int32" => Self::Int,
            "uint" | "uint32" => Self::Uint,
            "float" | "float32" => Self::Float,
            "double" | "float64" => Self::Double,
            _ => {
                return Err(LccError::InvalidFormat(format!(
                    "unsupported PLY property type: {s}"
                )))
            }
        };
        Ok(ty)
    }

    /// Reads one little-endian scalar at `offset` and widens it to f64.
    pub fn read_le_f64(self, bytes: &[u8], offset: usize) -> f64 {
        match self {
            Self::Char => bytes[offset] as i8 as f64,
            Self::Uchar => bytes[offset] as f64,
            Self::Short => i16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as f64,
            Self::Ushort => u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as f64,
            Self::Int => i32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as f64,
            Self::Uint => u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as f64,
            Self::Float => f32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as f64,
            Self::Double => f64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum PlyPropertyKind {
    Scalar(PlyScalarType),
    List {
        count_type: PlyScalarType,
        item_type: PlyScalarType,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct PlyProperty {
    pub kind: PlyPropertyKind,
    /// Byte offset within a row; meaningless when the element has any
    /// list property.
    pub offset: usize,
}

#[derive(Clone, Debug)]
pub struct PlyElement {
    pub name: String,
    pub count: usize,
    /// Properties in declaration order.
    pub order: Vec<String>,
    pub properties: HashMap<String, PlyProperty>,
    /// Bytes per row; valid only when `fixed_size`.
    pub row_stride: usize,
    pub fixed_size: bool,
}

impl PlyElement {
    pub fn scalar(&self, name: &str) -> Option<(PlyScalarType, usize)> {
        match self.properties.get(name) {
            Some(PlyProperty {
                kind: PlyPropertyKind::Scalar(ty),
                offset,
            }) => Some((*ty, *offset)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlyHeader {
    pub format: PlyFormat,
    pub elements: Vec<PlyElement>,
    /// Byte offset of the first element's payload.
    pub data_offset: usize,
}

impl PlyHeader {
    pub fn element(&self, name: &str) -> Option<&PlyElement> {
        self.elements.iter().find(|e| e.name == name)
    }
}

#[derive(Default)]
struct ElementBuilder {
    name: String,
    count: usize,
    order: Vec<String>,
    properties: HashMap<String, PlyProperty>,
    row_stride: usize,
    fixed_size: bool,
}

impl ElementBuilder {
    fn new(name: &str, count: usize) -> Self {
        Self {
            name: name.to_string(),
            count,
            fixed_size: true,
            ..Default::default()
        }
    }

    fn add_scalar(&mut self, name: &str, ty: PlyScalarType) {
        let prop = PlyProperty {
            kind: PlyPropertyKind::Scalar(ty),
            offset: self.row_stride,
        };
        self.row_stride += ty.size();
        self.order.push(name.to_string());
        self.properties.insert(name.to_string(), prop);
    }

    fn add_list(&mut self, name: &str, count_type: PlyScalarType, item_type: PlyScalarType) {
        let prop = PlyProperty {
            kind: PlyPropertyKind::List {
                count_type,
                item_type,
            },
            offset: 0,
        };
        self.fixed_size = false;
        self.order.push(name.to_string());
        self.properties.insert(name.to_string(), prop);
    }

    fn build(self) -> PlyElement {
        PlyElement {
            name: self.name,
            count: self.count,
            order: self.order,
            properties: self.properties,
            row_stride: self.row_stride,
            fixed_size: self.fixed_size,
        }
    }
}

/// Parses the header at the start of `bytes`.
pub fn parse_header(bytes: &[u8]) -> Result<PlyHeader> {
    if bytes.len() < 4 || &bytes[0..3] != b"ply" {
        return Err(LccError::InvalidFormat("not a PLY file".into()));
    }

    let search_limit = bytes.len().min(MAX_HEADER_SIZE);
    let header_end = bytes[..search_limit]
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .ok_or_else(|| LccError::InvalidFormat("missing end_header".into()))?;
    let data_offset = header_end + HEADER_TERMINATOR.len();

    let header = std::str::from_utf8(&bytes[..header_end])
        .map_err(|_| LccError::InvalidFormat("PLY header is not UTF-8".into()))?;

    let mut format = None;
    let mut builders: Vec<ElementBuilder> = Vec::new();
    let mut current: Option<ElementBuilder> = None;

    for raw_line in header.lines().skip(1) {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<_> = line.split_whitespace().collect();
        match fields[0] {
            "format" if fields.len() == 3 => {
                format = Some(match fields[1] {
                    "ascii" => PlyFormat::Ascii,
                    "binary_little_endian" => PlyFormat::BinaryLittleEndian,
                    other => {
                        return Err(LccError::InvalidFormat(format!(
                            "unsupported PLY format: {other}"
                        )))
                    }
                });
            }
            "comment" | "obj_info" => {}
            "element" if fields.len() == 3 => {
                if let Some(cur) = current.take() {
                    builders.push(cur);
                }
                let count = fields[2].parse().map_err(|_| {
                    LccError::InvalidFormat(format!("invalid element count: {}", fields[2]))
                })?;
                current = Some(ElementBuilder::new(fields[1], count));
            }
            "property" => {
                let Some(cur) = current.as_mut() else {
                    return Err(LccError::InvalidFormat("property outside of element".into()));
                };
                if fields.get(1).copied() == Some("list") {
                    if fields.len() != 5 {
                        return Err(LccError::InvalidFormat(format!(
                            "invalid list property line: {line}"
                        )));
                    }
                    let count_type = PlyScalarType::parse(fields[2])?;
                    let item_type = PlyScalarType::parse(fields[3])?;
                    cur.add_list(fields[4], count_type, item_type);
                } else {
                    if fields.len() != 3 {
                        return Err(LccError::InvalidFormat(format!(
                            "invalid property line: {line}"
                        )));
                    }
                    cur.add_scalar(fields[2], PlyScalarType::parse(fields[1])?);
                }
            }
            "end_header" => break,
            _ => {
                return Err(LccError::InvalidFormat(format!(
                    "unsupported PLY header line: {line}"
                )))
            }
        }
    }

    if let Some(cur) = current.take() {
        builders.push(cur);
    }

    let format = format.ok_or_else(|| LccError::InvalidFormat("missing PLY format line".into()))?;

    Ok(PlyHeader {
        format,
        elements: builders.into_iter().map(|b| b.build()).collect(),
        data_offset,
    })
}
