//! # Matmul Test Data
//!
//! The compiled `test` binary reads its inputs and writes its output as
//! single-line CSV files:
//!
//! - inputs `a.csv` (M×K) and `b.csv` (K×N): FP16 values stored as their raw
//!   `int16` bit patterns, row-major, comma separated;
//! - output `c.csv` (M×N): FP32 values stored as their raw `int32` bit
//!   patterns.
//!
//! This module generates random inputs in that format, reads the kernel's
//! result back, and checks it against a CPU reference of what the kernel
//! computes (`(A·B)²` elementwise, accumulated in FP32).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thiserror::Error;

/// Errors reading or writing matrix CSV files.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid value {value:?} at index {index} in {path:?}")]
    Parse {
        path: PathBuf,
        index: usize,
        value: String,
    },
    #[error("Expected {expected} values in {path:?}, found {found}")]
    Length {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

/// Generated inputs and the file layout the driver uses.
#[derive(Debug, Clone)]
pub struct MatmulData {
    /// Matrix A, M×K row-major
    pub a: Vec<f16>,
    /// Matrix B, K×N row-major
    pub b: Vec<f16>,
    pub a_path: PathBuf,
    pub b_path: PathBuf,
    /// Where the kernel should write C
    pub c_path: PathBuf,
}

/// Create `dir` and fill `a.csv`/`b.csv` with random FP16 matrices.
///
/// Values are uniform in [-1, 1). The same `seed` always produces the same
/// files.
pub fn generate_matmul_data(
    dir: impl AsRef<Path>,
    m: usize,
    n: usize,
    k: usize,
    seed: u64,
) -> Result<MatmulData, DataError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|source| DataError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut rng = StdRng::seed_from_u64(seed);
    let a: Vec<f16> = (0..m * k)
        .map(|_| f16::from_f32(rng.gen_range(-1.0..1.0)))
        .collect();
    let b: Vec<f16> = (0..k * n)
        .map(|_| f16::from_f32(rng.gen_range(-1.0..1.0)))
        .collect();

    let a_path = dir.join("a.csv");
    let b_path = dir.join("b.csv");
    write_f16_csv(&a_path, &a)?;
    write_f16_csv(&b_path, &b)?;

    Ok(MatmulData {
        a,
        b,
        a_path,
        b_path,
        c_path: dir.join("c.csv"),
    })
}

/// Write FP16 values as one line of `int16` bit patterns.
pub fn write_f16_csv(path: impl AsRef<Path>, values: &[f16]) -> Result<(), DataError> {
    let line = values
        .iter()
        .map(|v| (v.to_bits() as i16).to_string())
        .collect::<Vec<_>>()
        .join(",");
    write_file(path.as_ref(), line)
}

/// Read a matrix written by [`write_f16_csv`], expecting exactly `len` values.
pub fn read_f16_csv(path: impl AsRef<Path>, len: usize) -> Result<Vec<f16>, DataError> {
    let path = path.as_ref();
    let bits: Vec<i16> = read_values(path, len)?;
    Ok(bits.into_iter().map(|b| f16::from_bits(b as u16)).collect())
}

/// Read the kernel's output, FP32 values stored as `int32` bit patterns.
pub fn read_output_csv(path: impl AsRef<Path>, len: usize) -> Result<Vec<f32>, DataError> {
    let path = path.as_ref();
    let bits: Vec<i32> = read_values(path, len)?;
    Ok(bits.into_iter().map(|b| f32::from_bits(b as u32)).collect())
}

/// Write FP32 values the way the kernel does. Mostly useful for stand-ins.
pub fn write_output_csv(path: impl AsRef<Path>, values: &[f32]) -> Result<(), DataError> {
    let line = values
        .iter()
        .map(|v| (v.to_bits() as i32).to_string())
        .collect::<Vec<_>>()
        .join(",");
    write_file(path.as_ref(), line)
}

/// CPU reference for the toolchain's matmul kernel.
///
/// The kernel accumulates `A·B` in FP32 and stores the square of every
/// accumulator element.
pub fn reference_output(a: &[f16], b: &[f16], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * k + p].to_f32() * b[p * n + j].to_f32();
            }
            c[i * n + j] = acc * acc;
        }
    }
    c
}

/// Result of comparing kernel output against the reference.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    /// Number of compared elements
    pub len: usize,
    /// Elements outside tolerance
    pub mismatches: usize,
    /// Largest absolute difference seen
    pub max_abs_err: f32,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }
}

/// Compare elementwise with `|e - a| <= tol * (1 + |e|)`.
pub fn verify_output(expected: &[f32], actual: &[f32], tolerance: f32) -> Verification {
    let mut mismatches = expected.len().abs_diff(actual.len());
    let mut max_abs_err = 0.0f32;

    for (e, a) in expected.iter().zip(actual) {
        let err = (e - a).abs();
        // NaN never compares within tolerance
        if !(err <= tolerance * (1.0 + e.abs())) {
            mismatches += 1;
        }
        if err > max_abs_err || err.is_nan() {
            max_abs_err = err;
        }
    }

    Verification {
        len: expected.len().max(actual.len()),
        mismatches,
        max_abs_err,
    }
}

/// Check the kernel output in `c_path` against the CPU reference computed
/// from the FP16 inputs in `a_path` and `b_path`.
pub fn verify_files(
    a_path: impl AsRef<Path>,
    b_path: impl AsRef<Path>,
    c_path: impl AsRef<Path>,
    (m, n, k): (usize, usize, usize),
    tolerance: f32,
) -> Result<Verification, DataError> {
    let a = read_f16_csv(a_path, m * k)?;
    let b = read_f16_csv(b_path, k * n)?;
    let actual = read_output_csv(c_path, m * n)?;
    let expected = reference_output(&a, &b, m, n, k);
    Ok(verify_output(&expected, &actual, tolerance))
}

fn write_file(path: &Path, contents: String) -> Result<(), DataError> {
    fs::write(path, contents).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_values<T: std::str::FromStr>(path: &Path, len: usize) -> Result<Vec<T>, DataError> {
    let raw = fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    // A single trailing comma is tolerated, empty fields elsewhere are not
    let line = raw.trim();
    let line = line.strip_suffix(',').unwrap_or(line);
    let fields: Vec<&str> = if line.is_empty() {
        Vec::new()
    } else {
        line.split(',').collect()
    };

    let values = fields
        .into_iter()
        .enumerate()
        .map(|(index, field)| {
            field.trim().parse::<T>().map_err(|_| DataError::Parse {
                path: path.to_path_buf(),
                index,
                value: field.to_string(),
            })
        })
        .collect::<Result<Vec<T>, DataError>>()?;

    if values.len() != len {
        return Err(DataError::Length {
            path: path.to_path_buf(),
            expected: len,
            found: values.len(),
        });
    }
    Ok(values)
}
