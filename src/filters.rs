//! Stream filters needed to get at image samples.
//!
//! Only the general-purpose filters are decoded here. Image-specific
//! encodings (`DCTDecode`, `JPXDecode`, ...) are left for the image layer,
//! which hands JPEG data straight to the `image` crate.

use std::io::Read;

use flate2::read::ZlibDecoder;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unknown filter /{0}")]
    Unknown(String),
    #[error("filter /{0} is not supported")]
    Unsupported(&'static str),
    #[error("corrupt {filter} data: {message}")]
    Corrupt {
        filter: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    AsciiHex,
    Ascii85,
    Lzw,
    Flate,
    RunLength,
    CcittFax,
    Jbig2,
    Dct,
    Jpx,
}

impl Filter {
    pub fn from_name(name: &[u8]) -> Result<Self, FilterError> {
        Ok(match name {
            b"ASCIIHexDecode" | b"AHx" => Filter::AsciiHex,
            b"ASCII85Decode" | b"A85" => Filter::Ascii85,
            b"LZWDecode" | b"LZW" => Filter::Lzw,
            b"FlateDecode" | b"Fl" => Filter::Flate,
            b"RunLengthDecode" | b"RL" => Filter::RunLength,
            b"CCITTFaxDecode" | b"CCF" => Filter::CcittFax,
            b"JBIG2Decode" => Filter::Jbig2,
            b"DCTDecode" | b"DCT" => Filter::Dct,
            b"JPXDecode" => Filter::Jpx,
            other => return Err(FilterError::Unknown(String::from_utf8_lossy(other).into_owned())),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Filter::AsciiHex => "ASCIIHexDecode",
            Filter::Ascii85 => "ASCII85Decode",
            Filter::Lzw => "LZWDecode",
            Filter::Flate => "FlateDecode",
            Filter::RunLength => "RunLengthDecode",
            Filter::CcittFax => "CCITTFaxDecode",
            Filter::Jbig2 => "JBIG2Decode",
            Filter::Dct => "DCTDecode",
            Filter::Jpx => "JPXDecode",
        }
    }

    /// Filters whose output is an encoded image rather than raw samples.
    pub fn is_image_codec(self) -> bool {
        matches!(
            self,
            Filter::CcittFax | Filter::Jbig2 | Filter::Dct | Filter::Jpx
        )
    }
}

/// `/DecodeParms` entries that matter for `FlateDecode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predictor {
    pub predictor: i64,
    pub colors: usize,
    pub bits_per_component: usize,
    pub columns: usize,
}

impl Default for Predictor {
    fn default() -> Self {
        Predictor {
            predictor: 1,
            colors: 1,
            bits_per_component: 8,
            columns: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterStep {
    pub filter: Filter,
    pub predictor: Predictor,
}

/// Run `data` through every step in order. Image codecs must not appear here.
pub fn decode(data: &[u8], steps: &[FilterStep]) -> Result<Vec<u8>, FilterError> {
    let mut out = data.to_vec();
    for step in steps {
        out = match step.filter {
            Filter::Flate => {
                let inflated = inflate(&out)?;
                unpredict(inflated, &step.predictor)?
            }
            Filter::AsciiHex => ascii_hex(&out)?,
            Filter::Ascii85 => ascii85(&out)?,
            Filter::RunLength => run_length(&out)?,
            other => return Err(FilterError::Unsupported(other.name())),
        };
    }
    Ok(out)
}

fn corrupt(filter: &'static str, message: impl Into<String>) -> FilterError {
    FilterError::Corrupt {
        filter,
        message: message.into(),
    }
}

// ── FlateDecode ──────────────────────────────────────────────────────────────

fn inflate(data: &[u8]) -> Result<Vec<u8>, FilterError> {
    let mut out = Vec::new();
    match ZlibDecoder::new(data).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        // Many writers truncate the adler checksum; keep what was inflated.
        Err(_) if !out.is_empty() => Ok(out),
        Err(e) => Err(corrupt("FlateDecode", e.to_string())),
    }
}

fn unpredict(data: Vec<u8>, params: &Predictor) -> Result<Vec<u8>, FilterError> {
    match params.predictor {
        1 => Ok(data),
        2 => tiff_unpredict(data, params),
        10..=15 => png_unpredict(&data, params),
        other => Err(corrupt("FlateDecode", format!("unknown predictor {}", other))),
    }
}

fn tiff_unpredict(mut data: Vec<u8>, params: &Predictor) -> Result<Vec<u8>, FilterError> {
    if params.bits_per_component != 8 {
        return Err(FilterError::Unsupported("FlateDecode TIFF predictor below 8 bits"));
    }
    let row_len = params.colors * params.columns;
    if row_len == 0 {
        return Ok(data);
    }
    for row in data.chunks_mut(row_len) {
        for i in params.colors..row.len() {
            row[i] = row[i].wrapping_add(row[i - params.colors]);
        }
    }
    Ok(data)
}

fn png_unpredict(data: &[u8], params: &Predictor) -> Result<Vec<u8>, FilterError> {
    let bits_per_pixel = params.colors * params.bits_per_component;
    let bpp = ((bits_per_pixel + 7) / 8).max(1);
    let row_len = (bits_per_pixel * params.columns + 7) / 8;
    if row_len == 0 {
        return Ok(Vec::new());
    }

    let mut out = Vec::with_capacity(data.len());
    let mut prev = vec![0u8; row_len];
    for chunk in data.chunks(row_len + 1) {
        // A short trailing row is padded rather than rejected.
        let kind = chunk[0];
        let mut row = chunk[1..].to_vec();
        row.resize(row_len, 0);

        for i in 0..row_len {
            let left = if i >= bpp { row[i - bpp] } else { 0 };
            let up = prev[i];
            let up_left = if i >= bpp { prev[i - bpp] } else { 0 };
            row[i] = match kind {
                0 => row[i],
                1 => row[i].wrapping_add(left),
                2 => row[i].wrapping_add(up),
                3 => row[i].wrapping_add(((left as u16 + up as u16) / 2) as u8),
                4 => row[i].wrapping_add(paeth(left, up, up_left)),
                other => {
                    return Err(corrupt("FlateDecode", format!("bad PNG row filter {}", other)))
                }
            };
        }
        out.extend_from_slice(&row);
        prev = row;
    }
    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

// ── ASCIIHexDecode ───────────────────────────────────────────────────────────

fn ascii_hex(data: &[u8]) -> Result<Vec<u8>, FilterError> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut pending: Option<u8> = None;
    for &b in data {
        if b == b'>' {
            break;
        }
        if b.is_ascii_whitespace() {
            continue;
        }
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(corrupt("ASCIIHexDecode", format!("invalid digit {:?}", b as char))),
        };
        pending = match pending {
            Some(high) => {
                out.push(high << 4 | nibble);
                None
            }
            None => Some(nibble),
        };
    }
    if let Some(high) = pending {
        out.push(high << 4);
    }
    Ok(out)
}

// ── ASCII85Decode ────────────────────────────────────────────────────────────

fn ascii85(data: &[u8]) -> Result<Vec<u8>, FilterError> {
    let body = data.strip_prefix(b"<~").unwrap_or(data);
    let mut out = Vec::with_capacity(body.len() * 4 / 5);
    let mut group = [0u8; 5];
    let mut len = 0;

    for b in body.iter().copied().filter(|b| !b.is_ascii_whitespace()) {
        match b {
            b'~' => break,
            b'z' if len == 0 => out.extend_from_slice(&[0; 4]),
            b'!'..=b'u' => {
                group[len] = b - b'!';
                len += 1;
                if len == 5 {
                    out.extend_from_slice(&ascii85_word(&group)?);
                    len = 0;
                }
            }
            _ => return Err(corrupt("ASCII85Decode", format!("invalid character {:?}", b as char))),
        }
    }

    match len {
        0 => {}
        1 => return Err(corrupt("ASCII85Decode", "dangling final character")),
        n => {
            for slot in group.iter_mut().skip(n) {
                *slot = 84;
            }
            out.extend_from_slice(&ascii85_word(&group)?[..n - 1]);
        }
    }
    Ok(out)
}

fn ascii85_word(group: &[u8; 5]) -> Result<[u8; 4], FilterError> {
    let value = group.iter().fold(0u64, |acc, &d| acc * 85 + d as u64);
    u32::try_from(value)
        .map(u32::to_be_bytes)
        .map_err(|_| corrupt("ASCII85Decode", "group out of range"))
}

// ── RunLengthDecode ──────────────────────────────────────────────────────────

fn run_length(data: &[u8]) -> Result<Vec<u8>, FilterError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let len = data[i];
        i += 1;
        match len {
            128 => break,
            0..=127 => {
                let n = len as usize + 1;
                let literal = data
                    .get(i..i + n)
                    .ok_or_else(|| corrupt("RunLengthDecode", "literal run past end of data"))?;
                out.extend_from_slice(literal);
                i += n;
            }
            _ => {
                let byte = *data
                    .get(i)
                    .ok_or_else(|| corrupt("RunLengthDecode", "repeat run past end of data"))?;
                out.extend(std::iter::repeat(byte).take(257 - len as usize));
                i += 1;
            }
        }
    }
    Ok(out)
}
