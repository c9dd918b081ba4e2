//! # Kernel Compiler Invocation
//!
//! This module turns a `KernelConfig` into a `KernelHandle` by calling the
//! external Triton toolchain. The toolchain is a Python module, `triton_module`,
//! whose `compile(dtype, BM, BN, BK, M, N, K)` function generates, compiles and
//! links a matmul kernel plus a `test` driver binary, and returns the directory
//! it put them in.
//!
//! The call is made out of process. Every compile spawns a fresh interpreter
//! running a small bridge script, so interpreter state is created and torn
//! down around exactly one toolchain call and never shared between calls.
//!
//! ```text
//!      tkrun                         interpreter (python3 -c bridge.py)
//! +----------------+   argv: module, fn, [dtype,BM,BN,BK,M,N,K]   +------------------+
//! | PythonCompiler | -------------------------------------------> | import module    |
//! |                |                                              | resolve function |
//! |                | <------------------------------------------- | call, check str  |
//! +----------------+   stdout: "@@tkrun-bridge@@ {json reply}"    +------------------+
//! ```

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Instant;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::model::{KernelConfig, KernelHandle};
use crate::settings::Settings;

/// Module the toolchain is imported from. Part of the toolchain contract.
pub const TOOLCHAIN_MODULE: &str = "triton_module";
/// Function called inside [`TOOLCHAIN_MODULE`]. Part of the toolchain contract.
pub const COMPILE_FUNCTION: &str = "compile";

/// Prefix of the single reply line the bridge writes to stdout.
pub const BRIDGE_MARKER: &str = "@@tkrun-bridge@@";

const BRIDGE_SCRIPT: &str = include_str!("bridge.py");

/// Ways a toolchain compile call can fail.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Failed to load \"{module}\"\n{message}")]
    ModuleNotFound { module: String, message: String },
    #[error("Cannot find function \"{function}\" in \"{module}\"")]
    FunctionNotFound { module: String, function: String },
    #[error("Call to {module}.{function} failed\n{message}")]
    InvocationFailed {
        module: String,
        function: String,
        message: String,
    },
    #[error("Toolchain returned a {type_name} instead of a path string")]
    NotAString { type_name: String },
    #[error("Toolchain returned an empty path")]
    EmptyPath,
    #[error("Failed to start interpreter {interpreter:?}: {source}")]
    Spawn {
        interpreter: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Interpreter exited ({status}) without a reply")]
    NoReply { status: ExitStatus },
    #[error("Malformed bridge reply: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("Invalid toolchain module path: {0}")]
    ModulePath(#[from] std::env::JoinPathsError),
    #[error("Failed to create working root {path:?}: {source}")]
    WorkingRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Produces compiled kernels for a configuration.
///
/// Implementations return the directory of the compiled kernel. Use
/// [`compile_kernel`] to get the degrade-to-empty-handle behaviour callers
/// of the workflow expect.
pub trait KernelCompiler {
    /// Compile `config` and return the kernel directory
    fn compile(&self, config: &KernelConfig) -> Result<String, CompileError>;
}

/// What the bridge reports back, one JSON object tagged by `status`.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum BridgeReply {
    Ok { path: String },
    ModuleNotFound { message: String },
    FunctionNotFound,
    InvocationFailed { message: String },
    NotAString { type_name: String },
}

/// Calls `triton_module.compile` through a short-lived interpreter process.
#[derive(Debug, Clone, Default)]
pub struct PythonCompiler {
    settings: Settings,
}

impl PythonCompiler {
    /// Create a compiler using the interpreter and search paths in `settings`
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Settings this compiler runs with
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn command(&self, config: &KernelConfig) -> Result<Command, CompileError> {
        // Positional order is fixed by the toolchain: dtype, BM, BN, BK, M, N, K
        let args = serde_json::json!([
            config.dtype,
            config.bm,
            config.bn,
            config.bk,
            config.m,
            config.n,
            config.k
        ]);

        let mut cmd = Command::new(&self.settings.interpreter);
        cmd.arg("-c")
            .arg(BRIDGE_SCRIPT)
            .arg(TOOLCHAIN_MODULE)
            .arg(COMPILE_FUNCTION)
            .arg(args.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()); // Tracebacks and compiler errors go straight through

        if let Some(python_path) = self.settings.python_path()? {
            cmd.env("PYTHONPATH", python_path);
        }

        // The toolchain allocates kernel directories with tempfile.mkdtemp()
        if let Some(root) = &self.settings.working_root {
            fs::create_dir_all(root).map_err(|source| CompileError::WorkingRoot {
                path: root.clone(),
                source,
            })?;
            cmd.env("TMPDIR", root);
        }

        Ok(cmd)
    }
}

impl KernelCompiler for PythonCompiler {
    fn compile(&self, config: &KernelConfig) -> Result<String, CompileError> {
        let mut cmd = self.command(config)?;

        debug!(
            "[COMPILER:SPAWN] {:?} -c <bridge> {} {}",
            self.settings.interpreter, TOOLCHAIN_MODULE, COMPILE_FUNCTION
        );
        let output = cmd.output().map_err(|source| CompileError::Spawn {
            interpreter: self.settings.interpreter.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut reply_line = None;
        for line in stdout.lines() {
            match line.find(BRIDGE_MARKER) {
                Some(at) => {
                    let (chatter, reply) = line.split_at(at);
                    if !chatter.is_empty() {
                        info!("[COMPILER:TOOLCHAIN] {}", chatter);
                    }
                    reply_line = Some(reply[BRIDGE_MARKER.len()..].trim());
                }
                None if line.is_empty() => {}
                None => info!("[COMPILER:TOOLCHAIN] {}", line),
            }
        }

        let reply_line = reply_line.ok_or(CompileError::NoReply {
            status: output.status,
        })?;
        let reply: BridgeReply = serde_json::from_str(reply_line)?;

        match reply {
            BridgeReply::Ok { path } if path.is_empty() => Err(CompileError::EmptyPath),
            BridgeReply::Ok { path } => Ok(path),
            BridgeReply::ModuleNotFound { message } => Err(CompileError::ModuleNotFound {
                module: TOOLCHAIN_MODULE.to_string(),
                message,
            }),
            BridgeReply::FunctionNotFound => Err(CompileError::FunctionNotFound {
                module: TOOLCHAIN_MODULE.to_string(),
                function: COMPILE_FUNCTION.to_string(),
            }),
            BridgeReply::InvocationFailed { message } => Err(CompileError::InvocationFailed {
                module: TOOLCHAIN_MODULE.to_string(),
                function: COMPILE_FUNCTION.to_string(),
                message,
            }),
            BridgeReply::NotAString { type_name } => Err(CompileError::NotAString { type_name }),
        }
    }
}

/// Compile `config`, degrading every failure to an empty handle.
///
/// Failures are reported as they happen on the error log; nothing is
/// returned to the caller besides the empty `path`, which callers must check
/// with [`KernelHandle::is_valid`] before executing.
pub fn compile_kernel(compiler: &dyn KernelCompiler, config: &KernelConfig) -> KernelHandle {
    info!(
        "[COMPILER:START] Compiling {} kernel: BM={} BN={} BK={} M={} N={} K={}",
        config.dtype, config.bm, config.bn, config.bk, config.m, config.n, config.k
    );
    let start = Instant::now();

    match compiler.compile(config) {
        Ok(path) => {
            info!(
                "[COMPILER:DONE] Kernel compiled in {:.2} ms: {}",
                start.elapsed().as_secs_f64() * 1000.0,
                path
            );
            KernelHandle::new(path)
        }
        Err(err) => {
            error!("[COMPILER:ERROR] {}", err);
            KernelHandle::empty()
        }
    }
}
