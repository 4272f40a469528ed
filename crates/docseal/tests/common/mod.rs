#![allow(dead_code)]

use std::io::Cursor;
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use docseal::model::{Actor, Role, SignatureStamp};
use docseal::orchestrator::NewStamp;
use docseal::{
    IntegrityEngine, MemoryObjectStore, ObjectStore, RsaSigner, SealError, ServiceSettings,
    SignatureDb, SignatureService,
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use lopdf::{Dictionary, Document, Object, Stream};
use tokio::sync::oneshot;
use uuid::Uuid;

static SIGNER: LazyLock<Arc<RsaSigner>> = LazyLock::new(|| {
    Arc::new(RsaSigner::from_seed_with_bits("docseal-fixture", 1024).unwrap())
});

pub struct Fixture {
    pub service: SignatureService,
    pub storage: Arc<MemoryObjectStore>,
    pub admin: Actor,
}

impl Fixture {
    pub fn new() -> Self {
        let storage = Arc::new(MemoryObjectStore::new());
        Self::over(storage.clone(), storage)
    }

    /// A fixture whose service reads through a [`GatedStore`], so a test can
    /// hold one workflow at its first read of a key while others run.
    pub fn gated() -> (Self, Arc<GatedStore>) {
        let storage = Arc::new(MemoryObjectStore::new());
        let gated = Arc::new(GatedStore::new(storage.clone()));
        (Self::over(gated.clone(), storage), gated)
    }

    fn over(store: Arc<dyn ObjectStore>, storage: Arc<MemoryObjectStore>) -> Self {
        let engine = IntegrityEngine::new(SIGNER.clone());
        let service = SignatureService::new(
            Arc::new(SignatureDb::open_in_memory().unwrap()),
            store,
            engine,
            ServiceSettings::default(),
        );
        Self {
            service,
            storage,
            admin: Actor::new(Uuid::new_v4(), Role::Administrator),
        }
    }

    pub async fn stamp(&self, name: &str) -> SignatureStamp {
        self.service
            .create_stamp(
                &self.admin,
                NewStamp {
                    name: name.into(),
                    mime_type: "image/png".into(),
                    image: png_stamp(),
                },
            )
            .await
            .unwrap()
    }
}

struct Gate {
    prefix: String,
    reached: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

/// Test handle for an armed gate.
pub struct GateHandle {
    reached: oneshot::Receiver<()>,
    release: oneshot::Sender<()>,
}

impl GateHandle {
    /// Waits until a `get` has stopped at the gate.
    pub async fn reached(&mut self) {
        (&mut self.reached).await.unwrap();
    }

    pub fn release(self) {
        self.release.send(()).unwrap();
    }
}

/// Memory store whose next `get` under an armed prefix waits to be released.
pub struct GatedStore {
    inner: Arc<MemoryObjectStore>,
    gate: Mutex<Option<Gate>>,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryObjectStore>) -> Self {
        Self {
            inner,
            gate: Mutex::new(None),
        }
    }

    /// Holds the next `get` of a key starting with `prefix`. Only that one
    /// read is held; later reads pass straight through.
    pub fn arm(&self, prefix: impl Into<String>) -> GateHandle {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(Gate {
            prefix: prefix.into(),
            reached: reached_tx,
            release: release_rx,
        });
        GateHandle {
            reached: reached_rx,
            release: release_tx,
        }
    }
}

#[async_trait]
impl ObjectStore for GatedStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, SealError> {
        let gate = {
            let mut slot = self.gate.lock().unwrap();
            if slot.as_ref().is_some_and(|gate| key.starts_with(&gate.prefix)) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            let _ = gate.reached.send(());
            let _ = gate.release.await;
        }
        self.inner.get(key).await
    }

    async fn put(&self, bytes: Vec<u8>, key: &str, content_type: &str) -> Result<(), SealError> {
        self.inner.put(bytes, key, content_type).await
    }

    async fn delete(&self, key: &str) -> Result<(), SealError> {
        self.inner.delete(key).await
    }
}

pub fn member() -> Actor {
    Actor::new(Uuid::new_v4(), Role::Member)
}

pub fn engine() -> IntegrityEngine {
    IntegrityEngine::new(SIGNER.clone())
}

/// A minimal US Letter PDF whose MediaBox lives on the page tree root.
pub fn sample_pdf(page_count: usize) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    for index in 0..page_count {
        let body = format!("BT /F1 12 Tf 72 720 Td (Page {index}) Tj ET");
        let content_id =
            doc.add_object(Object::Stream(Stream::new(Dictionary::new(), body.into_bytes())));
        let mut page = Dictionary::new();
        page.set("Type", Object::Name(b"Page".to_vec()));
        page.set("Parent", Object::Reference(pages_id));
        page.set("Contents", Object::Reference(content_id));
        kids.push(Object::Reference(doc.add_object(Object::Dictionary(page))));
    }

    let mut pages = Dictionary::new();
    pages.set("Type", Object::Name(b"Pages".to_vec()));
    pages.set("Count", Object::Integer(page_count as i64));
    pages.set("Kids", Object::Array(kids));
    pages.set(
        "MediaBox",
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(612),
            Object::Integer(792),
        ]),
    );
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", Object::Reference(pages_id));
    let catalog_id = doc.add_object(Object::Dictionary(catalog));
    doc.trailer.set("Root", Object::Reference(catalog_id));

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

pub fn png_stamp() -> Vec<u8> {
    let img = RgbaImage::from_pixel(6, 3, Rgba([10, 80, 200, 200]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}
