pub mod compositor;
pub mod db;
pub mod error;
pub mod integrity;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod server;
pub mod signing;
pub mod storage;

pub use db::SignatureDb;
pub use error::SealError;
pub use integrity::{IntegrityEngine, IntegrityReport, SignedDigest};
pub use model::{Actor, Role};
pub use orchestrator::{ServiceSettings, SignatureService};
pub use server::{AppState, router, run, spawn_expiry_sweeper};
pub use signing::{DigestSigner, RsaSigner};
pub use storage::{FsObjectStore, MemoryObjectStore, ObjectStore};
