//! Test helpers shared by the module test suites.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// Write an executable `#!/bin/sh` script named `name` into `dir`.
///
/// Tests spawn children from many threads at once, and a child forked while
/// this process holds a file open for writing keeps that descriptor until it
/// execs. Executing such a file fails with ETXTBSY. So the contents go to a
/// staging file first and `cp` creates the real script: the only writer of
/// the final inode is the `cp` child, which has exited before we return.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let staging = dir.join(format!(".{}.tmp", name));
    fs::write(&staging, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&staging, fs::Permissions::from_mode(0o755)).unwrap();
    let _ = fs::remove_file(&path);
    let status = Command::new("cp").arg(&staging).arg(&path).status().unwrap();
    assert!(status.success(), "cp {:?} failed", staging);
    fs::remove_file(&staging).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Whether a real `python3` is on PATH.
pub fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Collects everything a `fmt` subscriber writes.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a thread-local subscriber and return its result plus the log text.
pub fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, logs.contents())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_script_is_runnable_and_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        // Rewriting an existing script replaces it.
        write_script(dir.path(), "hello", "echo first");
        let path = write_script(dir.path(), "hello", "echo \"hello $1\"");

        let output = Command::new(&path).arg("world").output().unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello world\n");

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("hello")]);
    }

    #[test]
    fn test_scripts_written_while_others_run() {
        let dir = tempfile::tempdir().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dir = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    for round in 0..10 {
                        let name = format!("s{}_{}", i, round);
                        let path = write_script(&dir, &name, "exit 0");
                        let status = Command::new(&path).status().unwrap();
                        assert!(status.success());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
