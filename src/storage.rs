use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};
use uuid::Uuid;

// ── Unique paths ─────────────────────────────────────────────────────────────

/// `<dir>/<uuid-v4>.<extension>`. Requests share the directories, so the
/// random token is the only thing keeping their files apart.
pub fn unique_path(dir: &Path, extension: &str) -> PathBuf {
    dir.join(format!("{}.{}", Uuid::new_v4(), extension))
}

fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

// ── Staged upload ────────────────────────────────────────────────────────────

/// An uploaded PDF written to the transient directory.
///
/// Call [`TempUpload::finish`] once extraction succeeded. If the guard is
/// dropped without finishing, the file is removed too, unless it was staged
/// with `keep_on_failure` set.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
    keep_on_failure: bool,
    finished: bool,
}

impl TempUpload {
    pub fn write(dir: &Path, bytes: &[u8], keep_on_failure: bool) -> io::Result<Self> {
        let path = unique_path(dir, "pdf");
        let mut file = create_new(&path)?;
        // From here on the guard owns the file, so a failed write still
        // goes through the drop cleanup.
        let upload = TempUpload {
            path,
            keep_on_failure,
            finished: false,
        };
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(upload)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.finished = true;
        fs::remove_file(&self.path)
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.keep_on_failure {
            tracing::warn!("leaving failed upload on disk: {}", self.path.display());
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

// ── Extracted images ─────────────────────────────────────────────────────────

/// Encode `image` as PNG under a fresh name in `dir`. Existing files are never
/// overwritten; a name clash surfaces as `AlreadyExists`.
pub fn save_png(dir: &Path, image: &DynamicImage) -> Result<PathBuf, image::ImageError> {
    let path = unique_path(dir, "png");
    let mut writer = BufWriter::new(create_new(&path)?);
    image.write_to(&mut writer, ImageFormat::Png)?;
    writer.flush()?;
    Ok(path)
}

pub fn image_url(prefix: &str, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}
