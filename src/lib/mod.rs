#![allow(missing_docs)]
//! # Triton Kernel Runner
//!
//! This crate is the glue between a host program and the Triton ahead-of-time
//! toolchain. It describes a matmul kernel, has the toolchain compile it into a
//! directory holding a shared library and a `test` driver binary, and then runs
//! that binary on CSV-encoded input matrices.
//!
//! ```text
//! KernelConfig --compile_kernel--> KernelHandle --KernelExecutor::run--> c.csv
//!  (dtype, tiles,   (triton_module.compile    (dir with ./test)   (./test a b c)
//!   M, N, K)          via interpreter)
//! ```
//!
//! ## Core Modules
//!
//! - `model`: `KernelConfig` and `KernelHandle`.
//! - `compiler`: The `KernelCompiler` trait and the out-of-process Python bridge.
//! - `executor`: Stages inputs and launches the compiled `test` binary.
//! - `settings`: Deployment paths (interpreter, module path, library path, working root).
//! - `data`: Random input generation, the kernel's CSV format, and result checking.

pub mod compiler;
pub mod data;
pub mod executor;
pub mod model;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use compiler::{compile_kernel, CompileError, KernelCompiler, PythonCompiler};
pub use executor::{run_kernel, ExecError, KernelExecutor, RunReport};
pub use model::{KernelConfig, KernelHandle};
pub use settings::{Settings, SettingsOverrides};

// Re-export common types
pub use anyhow::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
