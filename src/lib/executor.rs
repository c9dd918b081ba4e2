//! # Kernel Execution
//!
//! Runs the `test` binary the toolchain leaves in every compiled kernel
//! directory:
//!
//! ```text
//! <kernel dir>/test <kernel dir>/a.csv <kernel dir>/b.csv /abs/path/c.csv
//! ```
//!
//! The two input matrices are copied into the kernel directory first, the
//! child runs with that directory as its working directory and first
//! `LD_LIBRARY_PATH` entry (it links against `libkernel.so` next to it), and
//! its stdout and stderr both land on our stdout. The binary writes the result
//! itself; nothing here reads the output file.
//!
//! Running the same handle from several processes at once is not supported:
//! the staged input copies would race.

use std::env;
use std::fs;
use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::model::{KernelHandle, ENTRY_POINT};
use crate::settings::Settings;

/// Errors that prevent a kernel from being launched at all.
///
/// A kernel that launches and then exits non-zero is not an error; it is
/// reported through [`RunReport`].
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Kernel handle is empty (compilation failed?)")]
    InvalidHandle,
    #[error("Kernel directory {0:?} does not exist")]
    MissingKernelDir(PathBuf),
    #[error("Kernel entry point {0:?} not found")]
    MissingEntryPoint(PathBuf),
    #[error("Input file {0:?} does not exist")]
    MissingInput(PathBuf),
    #[error("Both inputs are named {0:?}; they would overwrite each other in the kernel directory")]
    InputNameCollision(String),
    #[error("Failed to copy {from:?} to {to:?}: {source}")]
    Stage {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to resolve output path {path:?}: {source}")]
    OutputPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid runtime library path: {0}")]
    LibraryPath(#[from] env::JoinPathsError),
    #[error("Failed to launch {program:?}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of one kernel run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Exit code, `None` if the child was killed by a signal
    pub exit_code: Option<i32>,
    /// Whether the child exited with status 0
    pub success: bool,
    /// Input paths as passed to the child
    pub inputs: [PathBuf; 2],
    /// Output path as passed to the child
    pub output: PathBuf,
    /// Wall-clock time of the child in milliseconds
    pub wall_time_ms: f64,
}

/// Launches compiled kernels.
#[derive(Debug, Clone, Default)]
pub struct KernelExecutor {
    settings: Settings,
}

impl KernelExecutor {
    /// Create an executor that uses the runtime library path in `settings`
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run the kernel behind `handle` on `input_a` and `input_b`, asking it to
    /// write its result to `output`. Blocks until the child exits.
    pub fn run(
        &self,
        handle: &KernelHandle,
        input_a: impl AsRef<Path>,
        input_b: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<RunReport, ExecError> {
        let kernel_dir = kernel_dir(handle)?;
        let entry_point = kernel_dir.join(ENTRY_POINT);
        if !entry_point.is_file() {
            return Err(ExecError::MissingEntryPoint(entry_point));
        }

        let input_a = input_a.as_ref();
        let input_b = input_b.as_ref();
        check_input_names(input_a, input_b)?;
        let staged_a = stage_input(&kernel_dir, input_a)?;
        let staged_b = stage_input(&kernel_dir, input_b)?;
        let output = resolve_output(output.as_ref())?;

        // stderr shares our stdout descriptor so the two streams interleave
        let merged = io::stdout()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|source| ExecError::Launch {
                program: entry_point.clone(),
                source,
            })?;

        let mut cmd = Command::new(&entry_point);
        cmd.arg(&staged_a)
            .arg(&staged_b)
            .arg(&output)
            .current_dir(&kernel_dir)
            .env("LD_LIBRARY_PATH", self.settings.library_path(&kernel_dir)?)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::from(merged));

        info!(
            "[EXECUTOR:START] Running kernel with arguments: {} {} {} {}",
            kernel_dir.display(),
            staged_a.display(),
            staged_b.display(),
            output.display()
        );
        let start = Instant::now();
        let status = cmd.status().map_err(|source| ExecError::Launch {
            program: entry_point.clone(),
            source,
        })?;
        let wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        if status.success() {
            info!("[EXECUTOR:DONE] Kernel finished in {:.2} ms", wall_time_ms);
        } else {
            error!(
                "[EXECUTOR:ERROR] The command failed to execute properly ({})",
                status
            );
        }

        Ok(RunReport {
            exit_code: status.code(),
            success: status.success(),
            inputs: [staged_a, staged_b],
            output,
            wall_time_ms,
        })
    }
}

/// Run a kernel, logging instead of returning launch errors.
///
/// Returns `None` when the kernel could not be launched. Callers that need to
/// know why should use [`KernelExecutor::run`].
pub fn run_kernel(
    executor: &KernelExecutor,
    handle: &KernelHandle,
    input_a: impl AsRef<Path>,
    input_b: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> Option<RunReport> {
    match executor.run(handle, input_a, input_b, output) {
        Ok(report) => Some(report),
        Err(err) => {
            error!("[EXECUTOR:ERROR] {}", err);
            None
        }
    }
}

fn kernel_dir(handle: &KernelHandle) -> Result<PathBuf, ExecError> {
    if !handle.is_valid() {
        return Err(ExecError::InvalidHandle);
    }
    let dir = handle.dir();
    if !dir.is_dir() {
        return Err(ExecError::MissingKernelDir(dir.to_path_buf()));
    }
    fs::canonicalize(dir).map_err(|_| ExecError::MissingKernelDir(dir.to_path_buf()))
}

fn check_input_names(input_a: &Path, input_b: &Path) -> Result<(), ExecError> {
    if let (Some(a), Some(b)) = (input_a.file_name(), input_b.file_name()) {
        if a == b && !same_file(input_a, input_b) {
            return Err(ExecError::InputNameCollision(
                a.to_string_lossy().into_owned(),
            ));
        }
    }
    Ok(())
}

/// Copy `input` into `kernel_dir` under its own file name, replacing any
/// previous copy.
fn stage_input(kernel_dir: &Path, input: &Path) -> Result<PathBuf, ExecError> {
    if !input.is_file() {
        return Err(ExecError::MissingInput(input.to_path_buf()));
    }
    let name = input
        .file_name()
        .ok_or_else(|| ExecError::MissingInput(input.to_path_buf()))?;
    let staged = kernel_dir.join(name);

    // Copying a file onto itself would truncate it
    if same_file(input, &staged) {
        debug!("[EXECUTOR:STAGE] {} already in kernel dir", staged.display());
        return Ok(staged);
    }

    fs::copy(input, &staged).map_err(|source| ExecError::Stage {
        from: input.to_path_buf(),
        to: staged.clone(),
        source,
    })?;
    debug!(
        "[EXECUTOR:STAGE] {} -> {}",
        input.display(),
        staged.display()
    );
    Ok(staged)
}

/// Relative output paths are taken relative to the caller, not to the kernel
/// directory the child runs in.
fn resolve_output(output: &Path) -> Result<PathBuf, ExecError> {
    if output.is_absolute() {
        return Ok(output.to_path_buf());
    }
    env::current_dir()
        .map(|cwd| cwd.join(output))
        .map_err(|source| ExecError::OutputPath {
            path: output.to_path_buf(),
            source,
        })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{with_captured_logs, write_script};
    use std::collections::BTreeSet;

    struct Fixture {
        _root: tempfile::TempDir,
        kernel: PathBuf,
        data: PathBuf,
        out: PathBuf,
    }

    impl Fixture {
        fn new(test_body: &str) -> Self {
            let root = tempfile::tempdir().unwrap();
            let kernel = root.path().join("tmpkernel");
            let data = root.path().join("data");
            let out = root.path().join("out");
            for dir in [&kernel, &data, &out] {
                fs::create_dir_all(dir).unwrap();
            }
            write_script(&kernel, ENTRY_POINT, test_body);
            fs::write(data.join("a.csv"), "15360,15360,15360,15360").unwrap();
            fs::write(data.join("b.csv"), "14336,14336,14336,14336").unwrap();

            Self {
                _root: root,
                kernel,
                data,
                out,
            }
        }

        fn handle(&self) -> KernelHandle {
            KernelHandle::new(self.kernel.to_string_lossy())
        }

        fn canonical_kernel(&self) -> PathBuf {
            fs::canonicalize(&self.kernel).unwrap()
        }
    }

    fn listing(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_echo_kernel_receives_resolved_paths() {
        let fx = Fixture::new(r#"printf '%s %s %s' "$1" "$2" "$3" > "$3""#);
        let out = fx.out.join("c.csv");

        let report = KernelExecutor::default()
            .run(&fx.handle(), fx.data.join("a.csv"), fx.data.join("b.csv"), &out)
            .unwrap();

        assert!(report.success);
        assert_eq!(report.exit_code, Some(0));

        let kernel = fx.canonical_kernel();
        let expected = format!(
            "{} {} {}",
            kernel.join("a.csv").display(),
            kernel.join("b.csv").display(),
            out.display()
        );
        assert_eq!(fs::read_to_string(&out).unwrap(), expected);
        assert_eq!(report.inputs, [kernel.join("a.csv"), kernel.join("b.csv")]);
    }

    #[test]
    fn test_failing_kernel_is_reported_not_raised() {
        let fx = Fixture::new("echo 'kernel launch failed' >&2\nexit 1");
        let out = fx.out.join("c.csv");
        fs::write(&out, "previous result").unwrap();

        let (report, logs) = with_captured_logs(|| {
            KernelExecutor::default().run(
                &fx.handle(),
                fx.data.join("a.csv"),
                fx.data.join("b.csv"),
                &out,
            )
        });
        let report = report.unwrap();

        assert!(!report.success);
        assert_eq!(report.exit_code, Some(1));
        assert!(logs.contains("The command failed to execute properly"));
        assert_eq!(fs::read_to_string(&out).unwrap(), "previous result");
    }

    #[test]
    fn test_repeated_runs_keep_one_current_copy() {
        let fx = Fixture::new("exit 0");
        let executor = KernelExecutor::default();
        let out = fx.out.join("c.csv");

        executor
            .run(&fx.handle(), fx.data.join("a.csv"), fx.data.join("b.csv"), &out)
            .unwrap();
        fs::write(fx.data.join("a.csv"), "0,0,0,0").unwrap();
        executor
            .run(&fx.handle(), fx.data.join("a.csv"), fx.data.join("b.csv"), &out)
            .unwrap();

        let expected: BTreeSet<String> = ["a.csv", "b.csv", "test"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(listing(&fx.kernel), expected);
        assert_eq!(
            fs::read_to_string(fx.kernel.join("a.csv")).unwrap(),
            "0,0,0,0"
        );
        assert_eq!(
            fs::read_to_string(fx.kernel.join("b.csv")).unwrap(),
            "14336,14336,14336,14336"
        );
    }

    #[test]
    fn test_child_environment() {
        let fx = Fixture::new(r#"printf '%s|%s' "$(pwd -P)" "$LD_LIBRARY_PATH" > "$3""#);
        let out = fx.out.join("env.txt");
        let executor = KernelExecutor::new(Settings {
            runtime_lib_path: vec![PathBuf::from("/opt/conda/envs/triton/lib")],
            ..Settings::default()
        });

        executor
            .run(&fx.handle(), fx.data.join("a.csv"), fx.data.join("b.csv"), &out)
            .unwrap();

        let kernel = fx.canonical_kernel();
        let expected = format!(
            "{}|{}:/opt/conda/envs/triton/lib",
            kernel.display(),
            kernel.display()
        );
        assert_eq!(fs::read_to_string(&out).unwrap(), expected);
    }

    #[test]
    fn test_input_already_in_kernel_dir_is_left_intact() {
        let fx = Fixture::new("exit 0");
        fs::write(fx.kernel.join("a.csv"), "1,2,3,4").unwrap();

        KernelExecutor::default()
            .run(
                &fx.handle(),
                fx.kernel.join("a.csv"),
                fx.data.join("b.csv"),
                fx.out.join("c.csv"),
            )
            .unwrap();

        assert_eq!(
            fs::read_to_string(fx.kernel.join("a.csv")).unwrap(),
            "1,2,3,4"
        );
    }

    #[test]
    fn test_precondition_failures() {
        let fx = Fixture::new("exit 0");
        let executor = KernelExecutor::default();
        let a = fx.data.join("a.csv");
        let b = fx.data.join("b.csv");
        let out = fx.out.join("c.csv");

        assert!(matches!(
            executor.run(&KernelHandle::empty(), &a, &b, &out),
            Err(ExecError::InvalidHandle)
        ));
        assert!(matches!(
            executor.run(&KernelHandle::new("/nonexistent/tmpkernel"), &a, &b, &out),
            Err(ExecError::MissingKernelDir(_))
        ));
        assert!(matches!(
            executor.run(&fx.handle(), fx.data.join("missing.csv"), &b, &out),
            Err(ExecError::MissingInput(_))
        ));

        let other = fx.out.join("a.csv");
        fs::write(&other, "0").unwrap();
        assert!(matches!(
            executor.run(&fx.handle(), &a, &other, &out),
            Err(ExecError::InputNameCollision(ref name)) if name == "a.csv"
        ));

        fs::remove_file(fx.kernel.join(ENTRY_POINT)).unwrap();
        assert!(matches!(
            executor.run(&fx.handle(), &a, &b, &out),
            Err(ExecError::MissingEntryPoint(_))
        ));
    }

    #[test]
    fn test_run_kernel_logs_launch_errors() {
        let (report, logs) = with_captured_logs(|| {
            run_kernel(
                &KernelExecutor::default(),
                &KernelHandle::empty(),
                "./data/a.csv",
                "./data/b.csv",
                "./data/c.csv",
            )
        });
        assert!(report.is_none());
        assert!(logs.contains("Kernel handle is empty"));
    }

    #[test]
    fn test_relative_output_resolves_against_caller() {
        let resolved = resolve_output(Path::new("data/c.csv")).unwrap();
        assert_eq!(resolved, env::current_dir().unwrap().join("data/c.csv"));

        let absolute = resolve_output(Path::new("/tmp/c.csv")).unwrap();
        assert_eq!(absolute, PathBuf::from("/tmp/c.csv"));
    }
}
