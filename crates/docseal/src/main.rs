use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use docseal::{
    AppState, FsObjectStore, IntegrityEngine, RsaSigner, ServiceSettings, SignatureDb,
    SignatureService, run, spawn_expiry_sweeper,
};
use eyre::{Result, WrapErr, eyre};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    #[clap(long, env = "DOCSEAL_HOST", default_value = "127.0.0.1")]
    host: String,
    #[clap(long, env = "DOCSEAL_PORT", default_value = "3000")]
    port: u16,
    #[clap(long, env = "DOCSEAL_DATABASE", default_value = "docseal.db")]
    database: PathBuf,
    #[clap(long, env = "DOCSEAL_STORAGE_DIR", default_value = "docseal-data")]
    storage_dir: PathBuf,
    /// PEM file holding the RSA private key (PKCS#8 or PKCS#1)
    #[clap(long, env = "DOCSEAL_PRIVATE_KEY")]
    private_key: PathBuf,
    /// PEM file holding the matching RSA public key
    #[clap(long, env = "DOCSEAL_PUBLIC_KEY")]
    public_key: PathBuf,
    /// Seconds between expiration sweeps; 0 disables the background sweep
    #[clap(long, env = "DOCSEAL_EXPIRY_SWEEP_SECS", default_value = "60")]
    expiry_sweep_secs: u64,
    #[clap(long, env = "DOCSEAL_REQUEST_TTL_DAYS", default_value = "30")]
    request_ttl_days: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let private_pem = std::fs::read_to_string(&args.private_key)
        .wrap_err_with(|| format!("reading private key {}", args.private_key.display()))?;
    let public_pem = std::fs::read_to_string(&args.public_key)
        .wrap_err_with(|| format!("reading public key {}", args.public_key.display()))?;
    let signer = RsaSigner::from_pem(&private_pem, &public_pem)
        .map_err(|e| eyre!("loading signing keys: {e:#}"))?;
    let engine = IntegrityEngine::new(Arc::new(signer));

    let db = SignatureDb::open(&args.database).wrap_err("opening database")?;
    let storage = FsObjectStore::new(&args.storage_dir)
        .await
        .wrap_err("opening object store")?;

    if args.request_ttl_days <= 0 {
        return Err(eyre!("--request-ttl-days must be positive"));
    }
    let settings = ServiceSettings {
        request_ttl: chrono::Duration::days(args.request_ttl_days),
    };
    let service = SignatureService::new(Arc::new(db), Arc::new(storage), engine, settings);

    if args.expiry_sweep_secs > 0 {
        spawn_expiry_sweeper(service.clone(), Duration::from_secs(args.expiry_sweep_secs));
    }

    info!(algorithm = service.engine().algorithm(), "Signing key loaded");
    run(args.host, args.port, AppState { service })
        .await
        .map_err(|e| eyre!("{e:#}"))
}
