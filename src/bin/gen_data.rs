//! Writes random `a.csv`/`b.csv` inputs in the kernel's FP16 CSV format.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use tkrun::data::generate_matmul_data;

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate matmul test data for tkrun")]
struct Args {
    /// Output directory
    #[arg(long, default_value = "data")]
    dir: PathBuf,

    /// M dimension
    #[arg(long, default_value = "16")]
    m: usize,

    /// N dimension
    #[arg(long, default_value = "16")]
    n: usize,

    /// K dimension
    #[arg(long, default_value = "16")]
    k: usize,

    /// RNG seed
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .init();

    let data = generate_matmul_data(&args.dir, args.m, args.n, args.k, args.seed)
        .with_context(|| format!("Failed to generate data in {:?}", args.dir))?;

    info!(
        "[GEN:DONE] A {}x{} -> {}",
        args.m,
        args.k,
        data.a_path.display()
    );
    info!(
        "[GEN:DONE] B {}x{} -> {}",
        args.k,
        args.n,
        data.b_path.display()
    );
    info!("[GEN:DONE] Kernel output goes to {}", data.c_path.display());

    Ok(())
}
