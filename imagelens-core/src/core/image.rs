use serde::{Deserialize, Serialize};
use std::path::Path;

pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// One file handed to the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFile {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Read a file from disk, keeping only its file name.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        Ok(Self::new(filename, bytes))
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Declared MIME type, else sniffed from the content, else a generic binary type.
    pub fn resolved_mime_type(&self) -> String {
        self.mime_type
            .as_deref()
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
            .map(str::to_string)
            .or_else(|| sniff_mime_type(&self.bytes).map(str::to_string))
            .unwrap_or_else(|| FALLBACK_MIME_TYPE.to_string())
    }
}

pub fn sniff_mime_type(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::from_fn(4, 4, |_, _| Rgb([10u8, 20, 30]));
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_declared_mime_type_wins() {
        let upload = UploadFile::new("a.png", png_bytes()).with_mime_type("image/x-custom");
        assert_eq!(upload.resolved_mime_type(), "image/x-custom");
    }

    #[test]
    fn test_sniffed_mime_type() {
        let upload = UploadFile::new("a.bin", png_bytes());
        assert_eq!(upload.resolved_mime_type(), "image/png");
    }

    #[test]
    fn test_unknown_content_falls_back() {
        let upload = UploadFile::new("notes.txt", b"hello".to_vec()).with_mime_type("  ");
        assert_eq!(upload.resolved_mime_type(), FALLBACK_MIME_TYPE);
    }

    #[test]
    fn test_from_path_keeps_file_name() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sunset.png");
        std::fs::write(&path, png_bytes()).unwrap();

        let upload = UploadFile::from_path(&path).unwrap();
        assert_eq!(upload.filename, "sunset.png");
        assert_eq!(upload.size_bytes(), std::fs::metadata(&path).unwrap().len());
    }
}
