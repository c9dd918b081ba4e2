//! # Kernel Configuration and Handle Models
//!
//! This module defines the two values that flow through the compile/run
//! workflow. Both are plain data with no identity beyond their fields.
//!
//! - `KernelConfig`: What to compile. Element datatype, block tile sizes and
//!   problem dimensions of a matrix-multiply kernel.
//! - `KernelHandle`: Where the compiled kernel lives. Produced by the compiler,
//!   consumed by the executor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the runnable entry point inside a compiled kernel directory.
pub const ENTRY_POINT: &str = "test";

/// Describes a single matrix-multiply kernel to be generated by the toolchain.
///
/// The toolchain owns all validation of these values (supported dtypes,
/// divisibility of `m`/`n`/`k` by the tile sizes, ...). This struct only
/// carries them, in the order the toolchain expects them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Element type tag understood by the toolchain (e.g. "fp16")
    pub dtype: String,
    /// Block tile size along M
    pub bm: u32,
    /// Block tile size along N
    pub bn: u32,
    /// Block tile size along K
    pub bk: u32,
    /// Matrix dimension M
    pub m: u32,
    /// Matrix dimension N
    pub n: u32,
    /// Matrix dimension K
    pub k: u32,
}

impl KernelConfig {
    /// Create a new kernel configuration
    pub fn new(dtype: impl Into<String>, bm: u32, bn: u32, bk: u32, m: u32, n: u32, k: u32) -> Self {
        Self {
            dtype: dtype.into(),
            bm,
            bn,
            bk,
            m,
            n,
            k,
        }
    }

    /// Square problem with square tiles, all of size `dim`
    pub fn square(dtype: impl Into<String>, dim: u32) -> Self {
        Self::new(dtype, dim, dim, dim, dim, dim, dim)
    }

    /// Tile sizes as `(BM, BN, BK)`
    pub fn tiles(&self) -> (u32, u32, u32) {
        (self.bm, self.bn, self.bk)
    }

    /// Problem dimensions as `(M, N, K)`
    pub fn dims(&self) -> (u32, u32, u32) {
        (self.m, self.n, self.k)
    }

    /// Calculate FLOPs for this GEMM
    pub fn flops(&self) -> u64 {
        // 2 * M * N * K for standard GEMM
        2 * (self.m as u64) * (self.n as u64) * (self.k as u64)
    }
}

impl Default for KernelConfig {
    /// The configuration the example driver has always used.
    fn default() -> Self {
        Self::square("fp16", 16)
    }
}

/// Identifies a compiled kernel by the directory holding its artifacts.
///
/// An empty `path` is the failure marker returned by
/// [`compile_kernel`](crate::compiler::compile_kernel) and must never be
/// handed to the executor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelHandle {
    /// Directory containing the compiled kernel and its `test` binary
    pub path: String,
}

impl KernelHandle {
    /// Create a handle for an existing kernel directory
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Handle signalling a failed compilation
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this handle names a kernel at all
    pub fn is_valid(&self) -> bool {
        !self.path.is_empty()
    }

    /// Kernel directory as a path
    pub fn dir(&self) -> &Path {
        Path::new(&self.path)
    }

    /// Full path of the runnable entry point
    pub fn entry_point(&self) -> PathBuf {
        self.dir().join(ENTRY_POINT)
    }
}
