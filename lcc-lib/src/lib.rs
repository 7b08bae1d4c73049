//! Core library for converting 3D Gaussian splatting scenes to LCC.
//!
//! The pipeline runs in five stages over a set of LOD PLY files:
//! memory-mapped splat access ([`splat_buffer`]), spatial partitioning on
//! the ground plane ([`spatial_grid`]), per-cell quantization
//! ([`grid_encoder`]), optional collision-mesh partitioning with per-cell
//! BVHs ([`collision`]), and container emission ([`writer`]).
//! [`convert::Converter`] drives the stages end to end.

pub mod collision;
pub mod convert;
pub mod grid_encoder;
pub mod lcc;
pub mod ply;
pub mod spatial_grid;
pub mod splat_buffer;
pub mod splat_encode;
pub mod types;
pub mod writer;

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced at component boundaries.
#[derive(Error, Debug)]
pub enum LccError {
    #[error("input not found: {0}")]
    InputMissing(PathBuf),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, LccError>;
