use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use docseal::{IntegrityEngine, RsaSigner};

/// Checks a document against the hash and signature recorded when it was
/// signed, without contacting the service.
#[derive(Parser)]
struct Args {
    /// Document bytes to check
    #[clap(long)]
    file: PathBuf,
    /// Hex SHA-256 recorded at signing time
    #[clap(long)]
    hash: String,
    /// Base64 signature recorded at signing time
    #[clap(long)]
    signature: String,
    /// PEM file holding the service's RSA public key
    #[clap(long)]
    public_key: PathBuf,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let public_pem = std::fs::read_to_string(&args.public_key)
        .with_context(|| format!("reading public key {}", args.public_key.display()))?;
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;

    let engine = IntegrityEngine::new(Arc::new(RsaSigner::verify_only(&public_pem)?));
    let report = engine.verify_integrity(&bytes, &args.hash, &args.signature);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.is_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
