#![deny(missing_docs)]
//! # Kernel Driver
//!
//! The `tkrun` binary runs the whole workflow once: build a `KernelConfig`,
//! compile it with the Triton toolchain, run the resulting `test` binary on
//! `a.csv` and `b.csv`, and optionally check `c.csv` against a CPU reference.
//!
//! With no flags it reproduces the classic run: an FP16 kernel with every tile
//! and problem dimension set to 16, reading `./data/a.csv` and `./data/b.csv`
//! and writing `./data/c.csv` (generate them with `gen_data`).

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, warn};

use tkrun::data::{verify_files, Verification};
use tkrun::{
    compile_kernel, KernelConfig, KernelExecutor, PythonCompiler, RunReport, Settings,
    SettingsOverrides,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Compile a Triton matmul kernel and run it")]
/// Command-line arguments for the driver.
struct Args {
    /// Element data type understood by the toolchain
    #[arg(long, default_value = "fp16")]
    dtype: String,

    /// Block tile size along M
    #[arg(long, default_value = "16")]
    bm: u32,

    /// Block tile size along N
    #[arg(long, default_value = "16")]
    bn: u32,

    /// Block tile size along K
    #[arg(long, default_value = "16")]
    bk: u32,

    /// M dimension
    #[arg(long, default_value = "16")]
    m: u32,

    /// N dimension
    #[arg(long, default_value = "16")]
    n: u32,

    /// K dimension
    #[arg(long, default_value = "16")]
    k: u32,

    /// Directory holding a.csv and b.csv (and receiving c.csv)
    #[arg(long, default_value = "./data/")]
    data_dir: PathBuf,

    /// Matrix A file (defaults to <data-dir>/a.csv)
    #[arg(long)]
    a: Option<PathBuf>,

    /// Matrix B file (defaults to <data-dir>/b.csv)
    #[arg(long)]
    b: Option<PathBuf>,

    /// Output file (defaults to <data-dir>/c.csv)
    #[arg(long)]
    out: Option<PathBuf>,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interpreter that runs the toolchain
    #[arg(long)]
    interpreter: Option<PathBuf>,

    /// Extra search path for triton_module (repeatable)
    #[arg(long = "toolchain-path")]
    toolchain_path: Vec<PathBuf>,

    /// Extra shared-library directory for the kernel (repeatable)
    #[arg(long = "lib-path")]
    lib_path: Vec<PathBuf>,

    /// Directory the toolchain creates kernel directories under
    #[arg(long)]
    working_root: Option<PathBuf>,

    /// Check c.csv against a CPU reference (fp16 only)
    #[arg(long)]
    verify: bool,

    /// Relative tolerance for --verify
    #[arg(long, default_value = "0.01")]
    tolerance: f32,

    /// Write a JSON run report here
    #[arg(long)]
    report: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn settings(&self) -> Result<Settings> {
        Settings::layered(self.config.as_deref(), &self.overrides())
    }

    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            interpreter: self.interpreter.clone(),
            toolchain_module_path: self.toolchain_path.clone(),
            runtime_lib_path: self.lib_path.clone(),
            working_root: self.working_root.clone(),
        }
    }

    fn input_paths(&self) -> (PathBuf, PathBuf, PathBuf) {
        let pick = |explicit: &Option<PathBuf>, name: &str| {
            explicit.clone().unwrap_or_else(|| self.data_dir.join(name))
        };
        (pick(&self.a, "a.csv"), pick(&self.b, "b.csv"), pick(&self.out, "c.csv"))
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false) // Don't show module target
        .with_writer(std::io::stderr)
        .init();

    let settings = args.settings()?;
    let config = KernelConfig::new(&args.dtype, args.bm, args.bn, args.bk, args.m, args.n, args.k);
    let (a_path, b_path, c_path) = args.input_paths();

    info!(
        "[DRIVER:INIT] Data type: {}, tiles: {}x{}x{}, problem: {}x{}x{}",
        config.dtype.to_uppercase(),
        config.bm,
        config.bn,
        config.bk,
        config.m,
        config.n,
        config.k
    );
    info!("[DRIVER:INIT] Interpreter: {:?}", settings.interpreter);

    let start_time = Instant::now();

    let compiler = PythonCompiler::new(settings.clone());
    let handle = compile_kernel(&compiler, &config);
    if !handle.is_valid() {
        bail!("Kernel compilation failed; nothing to run");
    }
    info!("[DRIVER:COMPILE] Kernel in path: {}", handle.path);

    let executor = KernelExecutor::new(settings);
    let report = executor
        .run(&handle, &a_path, &b_path, &c_path)
        .context("Failed to launch kernel")?;

    let verification = if args.verify && report.success {
        Some(verify(&config, &a_path, &b_path, &report.output, args.tolerance)?)
    } else {
        if args.verify {
            warn!("[DRIVER:VERIFY] Skipping verification, kernel failed");
        }
        None
    };

    let elapsed = start_time.elapsed();
    info!(
        "[DRIVER:DONE] Test completed. Total time: {:.2} ms",
        elapsed.as_secs_f64() * 1000.0
    );

    if let Some(path) = &args.report {
        save_report(path, &config, &handle.path, &report, verification.as_ref())?;
    }

    let passed = verification.as_ref().map_or(true, Verification::passed);
    if report.success && passed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn verify(
    config: &KernelConfig,
    a_path: &Path,
    b_path: &Path,
    c_path: &Path,
    tolerance: f32,
) -> Result<Verification> {
    if config.dtype != "fp16" {
        bail!("--verify only supports fp16 inputs, got {}", config.dtype);
    }
    let dims = (config.m as usize, config.n as usize, config.k as usize);
    let verification = verify_files(a_path, b_path, c_path, dims, tolerance)?;
    if verification.passed() {
        info!(
            "[DRIVER:VERIFY] Output matches reference ({} values, max abs err {:.3e})",
            verification.len, verification.max_abs_err
        );
    } else {
        error!(
            "[DRIVER:VERIFY] {} of {} values outside tolerance (max abs err {:.3e})",
            verification.mismatches, verification.len, verification.max_abs_err
        );
    }
    Ok(verification)
}

/// Saves the run configuration and outcome to a JSON file.
fn save_report(
    path: &Path,
    config: &KernelConfig,
    kernel_path: &str,
    report: &RunReport,
    verification: Option<&Verification>,
) -> Result<()> {
    let results = json!({
        "config": config,
        "kernel_path": kernel_path,
        "run": report,
        "verification": verification,
    });

    let mut file =
        File::create(path).with_context(|| format!("Failed to create report {:?}", path))?;
    writeln!(file, "{}", serde_json::to_string_pretty(&results)?)?;
    info!("[DRIVER:DONE] Saved report to {}", path.display());

    Ok(())
}
