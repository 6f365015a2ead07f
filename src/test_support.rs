//! Builders for small in-memory PDFs used across the test modules.

use std::io::{Cursor, Write};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use lopdf::{dictionary, encryption, Dictionary, Document, Object, ObjectId, Stream, StringFormat};

pub struct PdfBuilder {
    doc: Document,
    pages_id: ObjectId,
    pages_resources: Option<Dictionary>,
    kids: Vec<Object>,
}

impl PdfBuilder {
    pub fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        PdfBuilder {
            doc,
            pages_id,
            pages_resources: None,
            kids: Vec::new(),
        }
    }

    pub fn add_stream(&mut self, dict: Dictionary, content: Vec<u8>) -> ObjectId {
        self.doc.add_object(Stream::new(dict, content))
    }

    pub fn add_jpeg(&mut self, width: u32, height: u32) -> ObjectId {
        self.add_stream(jpeg_dict(width, height), jpeg_bytes(width, height))
    }

    /// Page whose resources list `images` as `/Im0`, `/Im1`, ...
    pub fn add_page(&mut self, images: &[ObjectId]) -> ObjectId {
        let mut xobjects = Dictionary::new();
        for (i, id) in images.iter().enumerate() {
            xobjects.set(format!("Im{}", i), *id);
        }
        self.add_page_with_resources(Some(dictionary! { "XObject" => xobjects }))
    }

    pub fn add_page_with_resources(&mut self, resources: Option<Dictionary>) -> ObjectId {
        let content = self.add_stream(dictionary! {}, b"q 100 0 0 100 0 0 cm /Im0 Do Q".to_vec());
        let mut page = dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "Contents" => content,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(612),
                Object::Integer(792),
            ],
        };
        if let Some(resources) = resources {
            page.set("Resources", resources);
        }
        let id = self.doc.add_object(page);
        self.kids.push(id.into());
        id
    }

    /// Resources on the page tree root, inherited by pages without their own.
    pub fn set_inherited_resources(&mut self, resources: Dictionary) {
        self.pages_resources = Some(resources);
    }

    pub fn build(self) -> Vec<u8> {
        save(self.finish())
    }

    /// Same document, RC4-encrypted (`/V 1 /R 2`, 40-bit) with an empty user
    /// password, as permission-only PDFs are.
    pub fn build_encrypted(self) -> Vec<u8> {
        let mut doc = self.finish();
        let encrypt_id = doc.add_object(dictionary! {
            "Filter" => "Standard",
            "V" => 1,
            "R" => 2,
            "Length" => 40,
            "O" => Object::String(vec![0x5a; 32], StringFormat::Hexadecimal),
            "P" => -44,
        });
        let file_id = Object::String(b"0123456789abcdef".to_vec(), StringFormat::Hexadecimal);
        doc.trailer.set("ID", vec![file_id.clone(), file_id]);
        doc.trailer.set("Encrypt", encrypt_id);

        // No /U entry, so lopdf derives the key without checking a password.
        let key = encryption::get_encryption_key(&doc, "", false).unwrap();
        for (&id, object) in doc.objects.iter_mut() {
            if id == encrypt_id {
                continue;
            }
            // RC4 is symmetric: "decrypting" plaintext encrypts it.
            let Ok(cipher) = encryption::decrypt_object(&key, id, &*object) else {
                continue;
            };
            match object {
                Object::Stream(stream) => stream.set_content(cipher),
                Object::String(bytes, _) => *bytes = cipher,
                _ => {}
            }
        }
        save(doc)
    }

    fn finish(mut self) -> Document {
        let count = self.kids.len() as i64;
        let mut pages = dictionary! {
            "Type" => "Pages",
            "Kids" => self.kids,
            "Count" => count,
        };
        if let Some(resources) = self.pages_resources {
            pages.set("Resources", resources);
        }
        self.doc.objects.insert(self.pages_id, Object::Dictionary(pages));
        let catalog = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog);
        self.doc
    }
}

fn save(mut doc: Document) -> Vec<u8> {
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 40, 40])));
    let mut cursor = Cursor::new(Vec::new());
    image.write_to(&mut cursor, ImageFormat::Jpeg).unwrap();
    cursor.into_inner()
}

pub fn jpeg_dict(width: u32, height: u32) -> Dictionary {
    dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => width as i64,
        "Height" => height as i64,
        "ColorSpace" => "DeviceRGB",
        "BitsPerComponent" => 8,
        "Filter" => "DCTDecode",
    }
}

/// Raw-sample image dictionary with `FlateDecode` and no predictor.
pub fn raw_dict(width: u32, height: u32, color_space: Object, bits: i64) -> Dictionary {
    dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => width as i64,
        "Height" => height as i64,
        "ColorSpace" => color_space,
        "BitsPerComponent" => bits,
        "Filter" => "FlateDecode",
    }
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// One page holding one JPEG of the given size.
pub fn single_jpeg_pdf(width: u32, height: u32) -> Vec<u8> {
    let mut pdf = PdfBuilder::new();
    let image = pdf.add_jpeg(width, height);
    pdf.add_page(&[image]);
    pdf.build()
}

pub fn pdf_without_images() -> Vec<u8> {
    let mut pdf = PdfBuilder::new();
    pdf.add_page(&[]);
    pdf.build()
}
