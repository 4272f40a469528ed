//! Embeds a stamp image onto the first page of a PDF.
//!
//! The image is decoded, re-encoded as a Flate-compressed DeviceRGB image
//! XObject (with a DeviceGray soft mask when the source carries alpha) and
//! drawn at a fixed 150×75 pt footprint, 42.5 pt (1.5 cm) in from the top-left
//! corner of the page's visible area: the CropBox clipped to the MediaBox, or
//! the MediaBox when there is no usable CropBox. `/Rotate` is not compensated,
//! so on a rotated page the stamp sits at the top-left of the unrotated page.
//! Existing page content is wrapped in `q … Q` so whatever graphics state it
//! leaves behind does not move the stamp.

use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use crate::error::SealError;

pub const STAMP_WIDTH: f32 = 150.0;
pub const STAMP_HEIGHT: f32 = 75.0;
pub const STAMP_PADDING: f32 = 42.5;

const XOBJECT_PREFIX: &str = "DocSealStamp";
const MAX_TREE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampImageFormat {
    Png,
    Jpeg,
}

impl StampImageFormat {
    pub fn from_mime(mime: &str) -> Result<Self, SealError> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Ok(Self::Png),
            "image/jpeg" => Ok(Self::Jpeg),
            other => Err(SealError::Validation(format!(
                "unsupported stamp image type {other:?}; expected image/png or image/jpeg"
            ))),
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// Lower-left corner and size of the stamp, in PDF user space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampPlacement {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl StampPlacement {
    /// Top-left placement inside a normalized `[llx, lly, urx, ury]` box.
    pub fn top_left(area: [f32; 4]) -> Self {
        Self {
            x: area[0] + STAMP_PADDING,
            y: area[3] - STAMP_PADDING - STAMP_HEIGHT,
            width: STAMP_WIDTH,
            height: STAMP_HEIGHT,
        }
    }
}

/// Decodes `image` as `format`, failing with a composition error.
pub fn decode_stamp(image: &[u8], format: StampImageFormat) -> Result<DynamicImage, SealError> {
    image::load_from_memory_with_format(image, format.image_format())
        .map_err(|e| composition("decoding stamp image", e))
}

/// Returns a new PDF with the stamp drawn on page 1.
pub fn composite_stamp(
    pdf: &[u8],
    stamp: &[u8],
    format: StampImageFormat,
) -> Result<Vec<u8>, SealError> {
    let image = decode_stamp(stamp, format)?;
    let mut doc = Document::load_mem(pdf).map_err(|e| composition("parsing PDF", e))?;

    let page_id = doc
        .get_pages()
        .get(&1)
        .copied()
        .ok_or_else(|| SealError::Composition("document has no pages".into()))?;

    let placement = StampPlacement::top_left(visible_box(&doc, page_id)?);
    let xobject_id = embed_image(&mut doc, &image)?;
    let name = attach_xobject(&mut doc, page_id, xobject_id)?;
    append_draw_ops(&mut doc, page_id, &name, &placement)?;

    let mut out = Vec::with_capacity(pdf.len() + 4096);
    doc.save_to(&mut out)
        .map_err(|e| composition("serializing PDF", e))?;
    Ok(out)
}

fn composition(stage: &str, err: impl std::fmt::Display) -> SealError {
    SealError::Composition(format!("{stage}: {err}"))
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Object, SealError> {
    match obj {
        Object::Reference(id) => doc
            .get_object(*id)
            .map_err(|e| composition("resolving reference", e)),
        other => Ok(other),
    }
}

/// Looks `key` up on the page, walking `/Parent` for inheritable attributes.
fn inherited<'a>(
    doc: &'a Document,
    page_id: ObjectId,
    key: &[u8],
) -> Result<Option<&'a Object>, SealError> {
    let mut current = page_id;
    for _ in 0..MAX_TREE_DEPTH {
        let dict = doc
            .get_dictionary(current)
            .map_err(|e| composition("reading page tree", e))?;
        if let Ok(value) = dict.get(key) {
            return resolve(doc, value).map(Some);
        }
        match dict.get(b"Parent").and_then(|parent| parent.as_reference()) {
            Ok(parent) => current = parent,
            Err(_) => return Ok(None),
        }
    }
    Err(SealError::Composition("page tree is too deep".into()))
}

fn number(obj: &Object) -> Result<f32, SealError> {
    match obj {
        Object::Integer(value) => Ok(*value as f32),
        Object::Real(value) => Ok(*value as f32),
        other => Err(SealError::Composition(format!(
            "expected a number in a page box, found {other:?}"
        ))),
    }
}

fn visible_box(doc: &Document, page_id: ObjectId) -> Result<[f32; 4], SealError> {
    let media = page_box(doc, page_id, b"MediaBox")?
        .ok_or_else(|| SealError::Composition("page has no MediaBox".into()))?;
    let Some(crop) = page_box(doc, page_id, b"CropBox")? else {
        return Ok(media);
    };
    let clipped = [
        crop[0].max(media[0]),
        crop[1].max(media[1]),
        crop[2].min(media[2]),
        crop[3].min(media[3]),
    ];
    if clipped[0] < clipped[2] && clipped[1] < clipped[3] {
        Ok(clipped)
    } else {
        Ok(media)
    }
}

/// Reads an inheritable page rectangle, normalized to `[llx, lly, urx, ury]`.
fn page_box(doc: &Document, page_id: ObjectId, key: &[u8]) -> Result<Option<[f32; 4]>, SealError> {
    let Some(obj) = inherited(doc, page_id, key)? else {
        return Ok(None);
    };
    let name = String::from_utf8_lossy(key);
    let entries = obj
        .as_array()
        .map_err(|e| composition(&format!("reading {name}"), e))?;
    if entries.len() != 4 {
        return Err(SealError::Composition(format!(
            "{name} has {} entries",
            entries.len()
        )));
    }

    let mut raw = [0f32; 4];
    for (slot, entry) in raw.iter_mut().zip(entries) {
        *slot = number(resolve(doc, entry)?)?;
    }
    Ok(Some([
        raw[0].min(raw[2]),
        raw[1].min(raw[3]),
        raw[0].max(raw[2]),
        raw[1].max(raw[3]),
    ]))
}

fn deflate(raw: &[u8]) -> Result<Vec<u8>, SealError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .map_err(|e| composition("compressing image data", e))?;
    encoder
        .finish()
        .map_err(|e| composition("compressing image data", e))
}

fn image_dictionary(width: u32, height: u32, color_space: &str) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"XObject".to_vec()));
    dict.set("Subtype", Object::Name(b"Image".to_vec()));
    dict.set("Width", Object::Integer(i64::from(width)));
    dict.set("Height", Object::Integer(i64::from(height)));
    dict.set("ColorSpace", Object::Name(color_space.as_bytes().to_vec()));
    dict.set("BitsPerComponent", Object::Integer(8));
    dict.set("Filter", Object::Name(b"FlateDecode".to_vec()));
    dict
}

fn embed_image(doc: &mut Document, image: &DynamicImage) -> Result<ObjectId, SealError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(SealError::Composition("stamp image is empty".into()));
    }

    let mut dict = image_dictionary(width, height, "DeviceRGB");
    if image.color().has_alpha() {
        let alpha: Vec<u8> = image.to_rgba8().pixels().map(|pixel| pixel.0[3]).collect();
        let mask = Stream::new(image_dictionary(width, height, "DeviceGray"), deflate(&alpha)?);
        let mask_id = doc.add_object(Object::Stream(mask));
        dict.set("SMask", Object::Reference(mask_id));
    }

    let rgb = image.to_rgb8();
    let stream = Stream::new(dict, deflate(rgb.as_raw())?);
    Ok(doc.add_object(Object::Stream(stream)))
}

/// Registers the XObject in the page's own resource dictionary.
///
/// Inherited or shared resources are copied onto the page first so that
/// sibling pages are left untouched.
fn attach_xobject(
    doc: &mut Document,
    page_id: ObjectId,
    xobject_id: ObjectId,
) -> Result<String, SealError> {
    let mut resources = match inherited(doc, page_id, b"Resources")? {
        Some(obj) => obj
            .as_dict()
            .map_err(|e| composition("reading Resources", e))?
            .clone(),
        None => Dictionary::new(),
    };
    let mut xobjects = match resources.get(b"XObject") {
        Ok(obj) => resolve(doc, obj)?
            .as_dict()
            .map_err(|e| composition("reading XObject resources", e))?
            .clone(),
        Err(_) => Dictionary::new(),
    };

    let mut index = 1;
    let mut name = format!("{XOBJECT_PREFIX}{index}");
    while xobjects.has(name.as_bytes()) {
        index += 1;
        name = format!("{XOBJECT_PREFIX}{index}");
    }

    xobjects.set(name.as_bytes().to_vec(), Object::Reference(xobject_id));
    resources.set("XObject", Object::Dictionary(xobjects));
    page_dict_mut(doc, page_id)?.set("Resources", Object::Dictionary(resources));
    Ok(name)
}

fn page_dict_mut(doc: &mut Document, page_id: ObjectId) -> Result<&mut Dictionary, SealError> {
    doc.get_object_mut(page_id)
        .and_then(|obj| obj.as_dict_mut())
        .map_err(|e| composition("updating page", e))
}

fn append_draw_ops(
    doc: &mut Document,
    page_id: ObjectId,
    name: &str,
    placement: &StampPlacement,
) -> Result<(), SealError> {
    let existing = {
        let page = doc
            .get_dictionary(page_id)
            .map_err(|e| composition("reading page", e))?;
        match page.get(b"Contents") {
            Ok(Object::Reference(id)) => match doc.get_object(*id) {
                Ok(Object::Array(items)) => items.clone(),
                _ => vec![Object::Reference(*id)],
            },
            Ok(Object::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    };

    let ops = format!(
        "Q\nq\n{w:.2} 0 0 {h:.2} {x:.2} {y:.2} cm\n/{name} Do\nQ\n",
        w = placement.width,
        h = placement.height,
        x = placement.x,
        y = placement.y,
    );
    let save_id = doc.add_object(Object::Stream(Stream::new(Dictionary::new(), b"q\n".to_vec())));
    let draw_id = doc.add_object(Object::Stream(Stream::new(Dictionary::new(), ops.into_bytes())));

    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(save_id));
    contents.extend(existing);
    contents.push(Object::Reference(draw_id));
    page_dict_mut(doc, page_id)?.set("Contents", Object::Array(contents));
    Ok(())
}
