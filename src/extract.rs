use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use crate::config::Config;
use crate::filters::{self, Filter, FilterError, FilterStep, Predictor};
use crate::storage::{self, TempUpload};

// ── Constants ────────────────────────────────────────────────────────────────

const MAX_INDIRECTION: usize = 32;
const MAX_FORM_DEPTH: usize = 16;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("could not parse PDF: {0}")]
    Parse(lopdf::Error),
    #[error("no embedded images found in document")]
    NoImages,
    #[error("unsupported image: {0}")]
    Unsupported(String),
    #[error("malformed image: {0}")]
    Malformed(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("extraction task failed: {0}")]
    Task(String),
}

fn malformed(message: impl Into<String>) -> ExtractionError {
    ExtractionError::Malformed(message.into())
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Stage `bytes`, save every embedded image as PNG and return the URL of the
/// last one. Runs on the blocking pool.
pub async fn extract_logo(config: Arc<Config>, bytes: Bytes) -> Result<String, ExtractionError> {
    tokio::task::spawn_blocking(move || handle_upload(&config, &bytes))
        .await
        .map_err(|e| ExtractionError::Task(e.to_string()))?
}

pub fn handle_upload(config: &Config, bytes: &[u8]) -> Result<String, ExtractionError> {
    let upload = TempUpload::write(&config.temp_dir, bytes, config.keep_failed_uploads)?;
    tracing::debug!("staged {} byte upload at {}", bytes.len(), upload.path().display());

    let saved = extract_images(upload.path(), &config.images_dir)?;
    upload.finish()?;

    let mut urls: Vec<String> = saved
        .iter()
        .map(|path| storage::image_url(&config.url_prefix, path))
        .collect();
    tracing::info!("extracted {} image(s) from upload", urls.len());

    // Only the final image is reported; the others stay on disk.
    urls.pop().ok_or(ExtractionError::NoImages)
}

/// Save every image of every page, in page order, as a PNG in `images_dir`.
pub fn extract_images(pdf_path: &Path, images_dir: &Path) -> Result<Vec<PathBuf>, ExtractionError> {
    let doc = open_document(pdf_path)?;
    let mut saved = Vec::new();

    for (page_number, page_id) in doc.get_pages() {
        let images = page_images(&doc, page_id)?;
        tracing::debug!("page {}: {} image(s)", page_number, images.len());

        for image in images {
            let bitmap = decode_image(&doc, image.stream)?;
            let path = storage::save_png(images_dir, &bitmap)?;
            tracing::debug!(
                "page {} /{} {:?} ({}x{}) -> {}",
                page_number,
                image.name,
                image.id,
                bitmap.width(),
                bitmap.height(),
                path.display()
            );
            saved.push(path);
        }
    }

    Ok(saved)
}

/// Load the document, unlocking it when it is encrypted with an empty user
/// password. Only RC4 (`/V` 1 or 2) security handlers can be opened.
pub fn open_document(path: &Path) -> Result<Document, ExtractionError> {
    let mut doc = Document::load(path).map_err(ExtractionError::Parse)?;
    if doc.is_encrypted() {
        doc.decrypt("").map_err(ExtractionError::Parse)?;
        tracing::debug!("decrypted {} with the empty user password", path.display());
    }
    Ok(doc)
}

// ── Object helpers ───────────────────────────────────────────────────────────

fn resolve<'a>(doc: &'a Document, mut object: &'a Object) -> Result<&'a Object, ExtractionError> {
    for _ in 0..MAX_INDIRECTION {
        match object {
            Object::Reference(id) => {
                object = doc.get_object(*id).map_err(ExtractionError::Parse)?;
            }
            _ => return Ok(object),
        }
    }
    Err(malformed("reference chain too long"))
}

/// Resolved dictionary entry; missing and `null` entries are both `None`.
fn lookup<'a>(
    doc: &'a Document,
    dict: &'a Dictionary,
    key: &[u8],
) -> Result<Option<&'a Object>, ExtractionError> {
    match dict.get(key) {
        Ok(object) => match resolve(doc, object)? {
            Object::Null => Ok(None),
            resolved => Ok(Some(resolved)),
        },
        Err(_) => Ok(None),
    }
}

fn integer(doc: &Document, dict: &Dictionary, key: &[u8]) -> Result<Option<i64>, ExtractionError> {
    match lookup(doc, dict, key)? {
        None => Ok(None),
        Some(Object::Integer(i)) => Ok(Some(*i)),
        Some(Object::Real(r)) => Ok(Some(*r as i64)),
        Some(_) => Err(malformed(format!(
            "/{} is not a number",
            String::from_utf8_lossy(key)
        ))),
    }
}

fn dimension(doc: &Document, dict: &Dictionary, key: &[u8]) -> Result<u32, ExtractionError> {
    let name = String::from_utf8_lossy(key);
    let value = integer(doc, dict, key)?.ok_or_else(|| malformed(format!("missing /{}", name)))?;
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| malformed(format!("/{} {} out of range", name, value)))
}

// ── Page image listing ───────────────────────────────────────────────────────

/// An image XObject reachable from a page.
#[derive(Debug)]
pub struct PageImage<'a> {
    /// Resource name the image was found under, without the leading slash.
    pub name: String,
    pub id: Option<ObjectId>,
    pub stream: &'a Stream,
}

/// Resources of a page, falling back to those inherited from the page tree.
fn page_resources(doc: &Document, page_id: ObjectId) -> Result<Option<&Dictionary>, ExtractionError> {
    let mut node = doc.get_dictionary(page_id).map_err(ExtractionError::Parse)?;
    let mut visited = HashSet::from([page_id]);
    loop {
        if let Some(resources) = lookup(doc, node, b"Resources")? {
            return resources
                .as_dict()
                .map(Some)
                .map_err(|_| malformed("/Resources is not a dictionary"));
        }
        match node.get(b"Parent") {
            Ok(Object::Reference(parent)) if visited.insert(*parent) => {
                node = doc.get_dictionary(*parent).map_err(ExtractionError::Parse)?;
            }
            _ => return Ok(None),
        }
    }
}

/// Every image on the page, including those drawn through form XObjects, in
/// resource order. Each image object is listed once per page.
pub fn page_images(doc: &Document, page_id: ObjectId) -> Result<Vec<PageImage<'_>>, ExtractionError> {
    let mut images = Vec::new();
    if let Some(resources) = page_resources(doc, page_id)? {
        let mut seen = HashSet::new();
        collect_images(doc, resources, &mut seen, &mut images, 0)?;
    }
    Ok(images)
}

fn collect_images<'a>(
    doc: &'a Document,
    resources: &'a Dictionary,
    seen: &mut HashSet<ObjectId>,
    out: &mut Vec<PageImage<'a>>,
    depth: usize,
) -> Result<(), ExtractionError> {
    let xobjects = match lookup(doc, resources, b"XObject")? {
        Some(Object::Dictionary(dict)) => dict,
        _ => return Ok(()),
    };

    for (name, entry) in xobjects.iter() {
        let id = match entry {
            Object::Reference(id) => Some(*id),
            _ => None,
        };
        if let Some(id) = id {
            if !seen.insert(id) {
                continue;
            }
        }
        let stream = match resolve(doc, entry)? {
            Object::Stream(stream) => stream,
            _ => continue,
        };

        match stream.dict.get(b"Subtype").and_then(Object::as_name) {
            Ok(b"Image") => out.push(PageImage {
                name: String::from_utf8_lossy(name).into_owned(),
                id,
                stream,
            }),
            Ok(b"Form") if depth < MAX_FORM_DEPTH => {
                if let Some(Object::Dictionary(form_resources)) =
                    lookup(doc, &stream.dict, b"Resources")?
                {
                    collect_images(doc, form_resources, seen, out, depth + 1)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Filters ──────────────────────────────────────────────────────────────────

fn filter_chain(doc: &Document, dict: &Dictionary) -> Result<Vec<FilterStep>, ExtractionError> {
    let names: Vec<&Object> = match lookup(doc, dict, b"Filter")? {
        None => return Ok(Vec::new()),
        Some(Object::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
    };
    let params: Vec<Option<&Dictionary>> = match lookup(doc, dict, b"DecodeParms")? {
        Some(Object::Array(items)) => items
            .iter()
            .map(|p| resolve(doc, p).ok().and_then(|p| p.as_dict().ok()))
            .collect(),
        Some(Object::Dictionary(single)) => vec![Some(single)],
        _ => Vec::new(),
    };

    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| -> Result<FilterStep, ExtractionError> {
            let name = resolve(doc, name)?
                .as_name()
                .map_err(|_| malformed("/Filter entry is not a name"))?;
            let predictor = match params.get(i).copied().flatten() {
                Some(p) => predictor_params(doc, p)?,
                None => Predictor::default(),
            };
            Ok(FilterStep {
                filter: Filter::from_name(name)?,
                predictor,
            })
        })
        .collect()
}

fn predictor_params(doc: &Document, params: &Dictionary) -> Result<Predictor, ExtractionError> {
    let defaults = Predictor::default();
    let positive = |key: &[u8], default: usize| -> Result<usize, ExtractionError> {
        Ok(integer(doc, params, key)?
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(default))
    };
    Ok(Predictor {
        predictor: integer(doc, params, b"Predictor")?.unwrap_or(defaults.predictor),
        colors: positive(b"Colors", defaults.colors)?,
        bits_per_component: positive(b"BitsPerComponent", defaults.bits_per_component)?,
        columns: positive(b"Columns", defaults.columns)?,
    })
}

/// Undo every general-purpose filter on a stream that is not itself an image.
fn stream_data(doc: &Document, stream: &Stream) -> Result<Vec<u8>, ExtractionError> {
    Ok(filters::decode(&stream.content, &filter_chain(doc, &stream.dict)?)?)
}

// ── Colour spaces ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum ColorSpace {
    Gray,
    Rgb,
    Cmyk,
    Indexed {
        base: Box<ColorSpace>,
        hival: usize,
        palette: Vec<u8>,
    },
}

impl ColorSpace {
    fn components(&self) -> usize {
        match self {
            ColorSpace::Gray | ColorSpace::Indexed { .. } => 1,
            ColorSpace::Rgb => 3,
            ColorSpace::Cmyk => 4,
        }
    }
}

fn device_space(name: &[u8]) -> Result<ColorSpace, ExtractionError> {
    match name {
        b"DeviceGray" | b"G" | b"CalGray" => Ok(ColorSpace::Gray),
        b"DeviceRGB" | b"RGB" | b"CalRGB" => Ok(ColorSpace::Rgb),
        b"DeviceCMYK" | b"CMYK" => Ok(ColorSpace::Cmyk),
        other => Err(ExtractionError::Unsupported(format!(
            "colour space /{}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn color_space(doc: &Document, object: &Object, depth: usize) -> Result<ColorSpace, ExtractionError> {
    if depth > MAX_FORM_DEPTH {
        return Err(malformed("colour space nested too deeply"));
    }
    let items = match resolve(doc, object)? {
        Object::Name(name) => return device_space(name),
        Object::Array(items) => items,
        _ => return Err(malformed("/ColorSpace is neither a name nor an array")),
    };
    let family = match items.first() {
        Some(first) => resolve(doc, first)?
            .as_name()
            .map_err(|_| malformed("colour space family is not a name"))?,
        None => return Err(malformed("empty colour space array")),
    };

    match family {
        b"ICCBased" => {
            let profile = items
                .get(1)
                .map(|p| resolve(doc, p))
                .transpose()?
                .and_then(|p| p.as_stream().ok())
                .ok_or_else(|| malformed("ICCBased without a profile stream"))?;
            match integer(doc, &profile.dict, b"N")? {
                Some(1) => Ok(ColorSpace::Gray),
                Some(3) => Ok(ColorSpace::Rgb),
                Some(4) => Ok(ColorSpace::Cmyk),
                _ => match lookup(doc, &profile.dict, b"Alternate")? {
                    Some(alternate) => color_space(doc, alternate, depth + 1),
                    None => Err(malformed("ICCBased profile without /N")),
                },
            }
        }
        b"Indexed" | b"I" => {
            let (base, hival, table) = match items.as_slice() {
                [_, base, hival, table] => (base, hival, table),
                _ => return Err(malformed("Indexed colour space needs 4 entries")),
            };
            let base = color_space(doc, base, depth + 1)?;
            if matches!(base, ColorSpace::Indexed { .. }) {
                return Err(malformed("Indexed base cannot itself be Indexed"));
            }
            let hival = match resolve(doc, hival)? {
                Object::Integer(v) if (0..=255).contains(v) => *v as usize,
                _ => return Err(malformed("Indexed hival must be 0..=255")),
            };
            let palette = match resolve(doc, table)? {
                Object::String(bytes, _) => bytes.clone(),
                Object::Stream(stream) => stream_data(doc, stream)?,
                _ => return Err(malformed("Indexed lookup is neither string nor stream")),
            };
            Ok(ColorSpace::Indexed {
                base: Box::new(base),
                hival,
                palette,
            })
        }
        single => device_space(single),
    }
}

// ── Image decoding ───────────────────────────────────────────────────────────

/// Decode an image XObject into a bitmap.
pub fn decode_image(doc: &Document, stream: &Stream) -> Result<DynamicImage, ExtractionError> {
    let steps = filter_chain(doc, &stream.dict)?;
    let (codec, steps) = match steps.split_last() {
        Some((last, rest)) if last.filter.is_image_codec() => (Some(last.filter), rest),
        _ => (None, steps.as_slice()),
    };
    if steps.iter().any(|s| s.filter.is_image_codec()) {
        return Err(malformed("image codec must be the last filter"));
    }

    let data = filters::decode(&stream.content, steps)?;
    match codec {
        Some(Filter::Dct) => Ok(image::load_from_memory_with_format(&data, ImageFormat::Jpeg)?),
        Some(other) => Err(ExtractionError::Unsupported(format!("/{} image data", other.name()))),
        None => decode_samples(doc, &stream.dict, &data),
    }
}

fn decode_samples(doc: &Document, dict: &Dictionary, data: &[u8]) -> Result<DynamicImage, ExtractionError> {
    let width = dimension(doc, dict, b"Width")?;
    let height = dimension(doc, dict, b"Height")?;

    let is_mask = matches!(lookup(doc, dict, b"ImageMask")?, Some(Object::Boolean(true)));
    let (bits, space) = if is_mask {
        (1, ColorSpace::Gray)
    } else {
        let space = lookup(doc, dict, b"ColorSpace")?
            .ok_or_else(|| malformed("image has no /ColorSpace"))?;
        let bits = integer(doc, dict, b"BitsPerComponent")?.unwrap_or(8);
        (bits, color_space(doc, space, 0)?)
    };
    let bits = match bits {
        1 | 2 | 4 | 8 | 16 => bits as usize,
        other => return Err(malformed(format!("unsupported /BitsPerComponent {}", other))),
    };

    let samples = unpack_samples(data, width as usize, height as usize, bits, space.components())?;

    match &space {
        ColorSpace::Indexed { base, hival, palette } => {
            let n = base.components();
            let mut values = Vec::with_capacity(samples.len() * n);
            for &index in &samples {
                let start = (index as usize).min(*hival) * n;
                values.extend((start..start + n).map(|i| palette.get(i).copied().unwrap_or(0)));
            }
            to_bitmap(base, width, height, values)
        }
        _ => {
            let n = space.components();
            let inverted = inverted_components(doc, dict, n)?;
            let values = samples
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    let v = scale_to_u8(v, bits);
                    if inverted[i % n] {
                        255 - v
                    } else {
                        v
                    }
                })
                .collect();
            to_bitmap(&space, width, height, values)
        }
    }
}

/// Components whose `/Decode` range runs from high to low.
fn inverted_components(doc: &Document, dict: &Dictionary, n: usize) -> Result<Vec<bool>, ExtractionError> {
    let mut inverted = vec![false; n];
    if let Some(Object::Array(range)) = lookup(doc, dict, b"Decode")? {
        let number = |o: &Object| match o {
            Object::Integer(i) => Some(*i as f64),
            Object::Real(r) => Some(*r as f64),
            _ => None,
        };
        for (c, pair) in range.chunks_exact(2).take(n).enumerate() {
            if let (Some(lo), Some(hi)) = (number(&pair[0]), number(&pair[1])) {
                inverted[c] = lo > hi;
            }
        }
    }
    Ok(inverted)
}

fn unpack_samples(
    data: &[u8],
    width: usize,
    height: usize,
    bits: usize,
    components: usize,
) -> Result<Vec<u16>, ExtractionError> {
    let per_row = width
        .checked_mul(components)
        .ok_or_else(|| malformed("image too large"))?;
    let row_bytes = per_row
        .checked_mul(bits)
        .map(|b| (b + 7) / 8)
        .ok_or_else(|| malformed("image too large"))?;
    let needed = row_bytes
        .checked_mul(height)
        .ok_or_else(|| malformed("image too large"))?;
    if data.len() < needed {
        return Err(malformed(format!(
            "image data truncated: {} of {} bytes",
            data.len(),
            needed
        )));
    }

    let mut samples = Vec::with_capacity(per_row * height);
    for row in data.chunks_exact(row_bytes).take(height) {
        match bits {
            8 => samples.extend(row.iter().map(|&b| b as u16)),
            16 => samples.extend(row.chunks_exact(2).map(|p| u16::from_be_bytes([p[0], p[1]]))),
            _ => {
                let mask = (1u16 << bits) - 1;
                for i in 0..per_row {
                    let bit = i * bits;
                    let shift = 8 - bits - bit % 8;
                    samples.push((row[bit / 8] as u16 >> shift) & mask);
                }
            }
        }
    }
    Ok(samples)
}

fn scale_to_u8(value: u16, bits: usize) -> u8 {
    match bits {
        8 => value as u8,
        16 => (value >> 8) as u8,
        _ => (value as u32 * 255 / ((1u32 << bits) - 1)) as u8,
    }
}

fn to_bitmap(
    space: &ColorSpace,
    width: u32,
    height: u32,
    values: Vec<u8>,
) -> Result<DynamicImage, ExtractionError> {
    let bitmap = match space {
        ColorSpace::Gray => GrayImage::from_raw(width, height, values).map(DynamicImage::ImageLuma8),
        ColorSpace::Rgb => RgbImage::from_raw(width, height, values).map(DynamicImage::ImageRgb8),
        ColorSpace::Cmyk => {
            RgbImage::from_raw(width, height, cmyk_to_rgb(&values)).map(DynamicImage::ImageRgb8)
        }
        ColorSpace::Indexed { .. } => None,
    };
    bitmap.ok_or_else(|| malformed("sample count does not match image size"))
}

fn cmyk_to_rgb(values: &[u8]) -> Vec<u8> {
    values
        .chunks_exact(4)
        .flat_map(|px| {
            let k = 255 - px[3] as u16;
            [0, 1, 2].map(|c| ((255 - px[c] as u16) * k / 255) as u8)
        })
        .collect()
}
