use serde::{Deserialize, Serialize};

/// Body returned by `POST /upload_pdf/`.
///
/// `extracted_images` carries a single URL even though the name is plural;
/// front-end consumers already depend on this shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExtractImagesResponse {
    pub extracted_images: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}
