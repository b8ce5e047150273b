use std::path::Path;

use crate::error::{Error, Result};

/// Extensions read as plain text.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "org", "csv", "tsv", "json", "yaml", "yml",
    "toml", "xml", "html", "htm", "log", "ini", "cfg", "conf", "tex", "py", "rs",
    "js", "ts", "go", "java", "c", "h", "cpp", "hpp", "sh", "sql",
];

const IMAGE_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

/// Number of leading bytes inspected when deciding whether a "text" file is
/// actually binary.
const BINARY_SNIFF_BYTES: usize = 8192;

/// How a file's content is turned into something the model can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Text,
    Pdf,
    Image,
}

/// Extracted content, ready for the summarization adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Text(String),
    Image { bytes: Vec<u8>, mime: String },
}

/// Category of a file by extension, or `None` for unsupported files.
pub fn category(path: &Path) -> Option<FileCategory> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if ext == "pdf" {
        Some(FileCategory::Pdf)
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(FileCategory::Image)
    } else if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        Some(FileCategory::Text)
    } else {
        None
    }
}

pub fn is_supported(path: &Path) -> bool {
    category(path).is_some()
}

pub fn is_image(path: &Path) -> bool {
    category(path) == Some(FileCategory::Image)
}

/// Extract already-loaded bytes. `path` only supplies the name used for
/// category detection and error messages, so uploaded attachments go through
/// the same code as files on disk.
pub fn extract_bytes(path: &Path, bytes: &[u8]) -> Result<Extracted> {
    let fail = |message: String| Error::Extraction {
        path: path.to_path_buf(),
        message,
    };

    match category(path) {
        Some(FileCategory::Image) => Ok(Extracted::Image {
            bytes: bytes.to_vec(),
            mime: mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string(),
        }),
        Some(FileCategory::Pdf) => {
            let text = pdf_extract::extract_text_from_mem(bytes)
                .map_err(|e| fail(e.to_string()))?;
            Ok(Extracted::Text(clean_text(&text)))
        }
        Some(FileCategory::Text) => {
            let head = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
            if head.contains(&0) {
                return Err(fail("file looks binary".into()));
            }
            Ok(Extracted::Text(String::from_utf8_lossy(bytes).into_owned()))
        }
        None => Err(fail("unsupported file type".into())),
    }
}

/// Collapse blank lines and surrounding whitespace left by PDF extraction.
fn clean_text(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_by_extension() {
        assert_eq!(category(Path::new("a/b.PDF")), Some(FileCategory::Pdf));
        assert_eq!(category(Path::new("cat.png")), Some(FileCategory::Image));
        assert_eq!(category(Path::new("notes.md")), Some(FileCategory::Text));
        assert_eq!(category(Path::new("app.exe")), None);
        assert_eq!(category(Path::new("Makefile")), None);
    }

    #[test]
    fn decodes_text_lossily() {
        let extracted =
            extract_bytes(Path::new("note.txt"), b"quarterly budget \xffreview")
                .unwrap();
        assert_eq!(
            extracted,
            Extracted::Text("quarterly budget \u{fffd}review".into())
        );
    }

    #[test]
    fn image_keeps_bytes_and_mime() {
        let extracted =
            extract_bytes(Path::new("cat.png"), &[0x89, b'P', b'N', b'G'])
                .unwrap();
        match extracted {
            Extracted::Image { bytes, mime } => {
                assert_eq!(bytes.len(), 4);
                assert_eq!(mime, "image/png");
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn binary_text_file_is_rejected() {
        let err =
            extract_bytes(Path::new("/docs/data.txt"), b"ab\0cd").unwrap_err();
        assert_eq!(err.kind(), "extraction_error");
    }

    #[test]
    fn corrupt_pdf_is_extraction_error() {
        let err = extract_bytes(Path::new("/docs/broken.pdf"), b"not a pdf")
            .unwrap_err();
        assert!(matches!(err, Error::Extraction { .. }));
    }

    #[test]
    fn unsupported_upload_is_extraction_error() {
        let err = extract_bytes(Path::new("setup.exe"), b"MZ").unwrap_err();
        assert_eq!(err.kind(), "extraction_error");
    }

    #[test]
    fn clean_text_drops_blank_lines() {
        assert_eq!(clean_text("  a \n\n   \n b"), "a\nb");
    }
}
