//! Page rasterization: every supported input becomes one PNG per page.
//!
//! | Input | Path to images |
//! |-------|----------------|
//! | `.pdf` | rendered page by page with PDFium |
//! | `.docx` | laid out as a synthetic PDF ([`crate::office`]), then rendered |
//! | `.png` `.jpg` `.jpeg` | decoded and re-encoded as a single PNG page |
//!
//! Rendering is CPU-bound and synchronous; async callers run it on the
//! blocking pool. The PDFium library is bound per operation and located via
//! `PDFIUM_DYNAMIC_LIB_PATH`, the executable's directory, then the system
//! library path.

use std::io::Cursor;
use std::path::Path;

use image::{GenericImageView, ImageOutputFormat};
use pdfium_render::prelude::*;
use thiserror::Error;

use crate::office;

/// Longest allowed side of a rendered page, in pixels.
const MAX_DIMENSION_PX: u32 = 4096;

const POINTS_PER_INCH: f32 = 72.0;

#[derive(Error, Debug)]
pub enum RasterizeError {
    /// The file cannot be opened as any supported format.
    #[error("unsupported or unreadable input: {0}")]
    UnsupportedInput(String),

    #[error("PDFium unavailable: {0}")]
    PdfiumUnavailable(String),

    #[error("failed to render page {page}: {reason}")]
    Render { page: usize, reason: String },

    #[error("image encoding failed: {0}")]
    Encode(String),

    #[error("document normalization failed: {0}")]
    Normalize(#[from] office::OfficeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One rendered page.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 0-based page index.
    pub index: usize,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Converts a document on disk into page images.
pub trait PageRasterizer: Send + Sync {
    fn rasterize(&self, path: &Path, dpi: u32) -> Result<Vec<PageImage>, RasterizeError>;
}

/// Input kinds recognized by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    Docx,
    Image,
}

impl InputKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(InputKind::Pdf),
            "docx" => Some(InputKind::Docx),
            "png" | "jpg" | "jpeg" => Some(InputKind::Image),
            _ => None,
        }
    }
}

/// Production rasterizer backed by PDFium and the `image` crate.
#[derive(Default)]
pub struct PdfiumRasterizer;

impl PdfiumRasterizer {
    pub fn new() -> Self {
        Self
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn rasterize(&self, path: &Path, dpi: u32) -> Result<Vec<PageImage>, RasterizeError> {
        let kind = InputKind::from_path(path)
            .ok_or_else(|| RasterizeError::UnsupportedInput(path.display().to_string()))?;

        match kind {
            InputKind::Pdf => {
                let bytes = std::fs::read(path)?;
                render_pdf(&bytes, dpi)
            }
            InputKind::Docx => {
                let (pdf, placeholder) = office::docx_to_pdf(path)?;
                if placeholder {
                    tracing::warn!(path = %path.display(), "rendering placeholder page for DOCX");
                }
                render_pdf(&pdf, dpi)
            }
            InputKind::Image => {
                let bytes = std::fs::read(path)?;
                image_page(&bytes).map(|page| vec![page])
            }
        }
    }
}

fn load_pdfium() -> Result<Pdfium, RasterizeError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        tracing::debug!(path = %path, "loading PDFium from env var");
        let bindings = Pdfium::bind_to_library(&path).map_err(|e| {
            RasterizeError::PdfiumUnavailable(format!("failed to load {}: {}", path, e))
        })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
    {
        let lib_path =
            Pdfium::pdfium_platform_library_name_at_path(exe_dir.to_string_lossy().as_ref());
        if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
            tracing::debug!(dir = %exe_dir.display(), "loaded PDFium next to executable");
            return Ok(Pdfium::new(bindings));
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        RasterizeError::PdfiumUnavailable(format!(
            "set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {}",
            e
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

/// Pixel size for a page at `dpi`, longest side capped at [`MAX_DIMENSION_PX`].
pub fn render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);
    cap_dimensions(raw_w, raw_h)
}

fn cap_dimensions(w: f32, h: f32) -> (u32, u32) {
    let longest = w.max(h);
    if longest > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / longest;
        (
            ((w * ratio).round() as u32).clamp(1, MAX_DIMENSION_PX),
            ((h * ratio).round() as u32).clamp(1, MAX_DIMENSION_PX),
        )
    } else {
        ((w.round() as u32).max(1), (h.round() as u32).max(1))
    }
}

fn encode_png(image: &image::DynamicImage) -> Result<Vec<u8>, RasterizeError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| RasterizeError::Encode(e.to_string()))?;
    Ok(cursor.into_inner())
}

fn render_pdf(bytes: &[u8], dpi: u32) -> Result<Vec<PageImage>, RasterizeError> {
    let pdfium = load_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| RasterizeError::UnsupportedInput(format!("cannot open PDF: {}", e)))?;

    let mut pages = Vec::new();
    for (index, page) in document.pages().iter().enumerate() {
        let (width, height) = render_dimensions(page.width().value, page.height().value, dpi);
        let config = PdfRenderConfig::new()
            .set_target_width(width as i32)
            .set_maximum_height(height as i32);

        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| RasterizeError::Render {
                page: index,
                reason: e.to_string(),
            })?;
        let png = encode_png(&bitmap.as_image())?;

        tracing::debug!(page = index, width, height, png_size = png.len(), "rendered PDF page");
        pages.push(PageImage {
            index,
            png,
            width,
            height,
        });
    }

    tracing::info!(pages = pages.len(), dpi, "PDF rasterized");
    Ok(pages)
}

/// A raster image as a single page, downscaled past the dimension cap.
pub fn image_page(bytes: &[u8]) -> Result<PageImage, RasterizeError> {
    let mut img = image::load_from_memory(bytes)
        .map_err(|e| RasterizeError::UnsupportedInput(format!("cannot decode image: {}", e)))?;

    let (w, h) = img.dimensions();
    let (target_w, target_h) = cap_dimensions(w as f32, h as f32);
    if (target_w, target_h) != (w, h) {
        tracing::warn!(width = w, height = h, target_w, target_h, "image downscaled");
        img = img.resize(target_w, target_h, image::imageops::FilterType::Triangle);
    }

    let (width, height) = img.dimensions();
    Ok(PageImage {
        index: 0,
        png: encode_png(&img)?,
        width,
        height,
    })
}

/// Returns `pages` blank PNGs regardless of input. For tests.
pub struct MockRasterizer {
    pub pages: usize,
}

impl PageRasterizer for MockRasterizer {
    fn rasterize(&self, path: &Path, _dpi: u32) -> Result<Vec<PageImage>, RasterizeError> {
        if InputKind::from_path(path).is_none() {
            return Err(RasterizeError::UnsupportedInput(path.display().to_string()));
        }
        Ok((0..self.pages)
            .map(|index| PageImage {
                index,
                png: minimal_png(),
                width: 1,
                height: 1,
            })
            .collect())
    }
}

/// 1x1 white RGB PNG.
pub fn minimal_png() -> Vec<u8> {
    vec![
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90,
        0x77, 0x53, 0xDE, 0x00, 0x00, 0x00, 0x0C, 0x49, 0x44, 0x41, 0x54, 0x78, 0xDA, 0x63, 0xF8,
        0xFF, 0xFF, 0x3F, 0x00, 0x05, 0xFE, 0x02, 0xFE, 0x33, 0x12, 0x95, 0x14, 0x00, 0x00, 0x00,
        0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_page_at_200_dpi() {
        assert_eq!(render_dimensions(612.0, 792.0, 200), (1700, 2200));
    }

    #[test]
    fn fractional_sizes_round_to_nearest_pixel() {
        assert_eq!(render_dimensions(595.0, 842.0, 150), (1240, 1754));
    }

    #[test]
    fn minimal_png_decodes() {
        let img = image::load_from_memory(&minimal_png()).unwrap();
        assert_eq!(img.dimensions(), (1, 1));
    }

    #[test]
    fn oversized_page_is_capped_preserving_aspect() {
        let (w, h) = render_dimensions(2000.0, 1000.0, 600);
        assert_eq!(w, MAX_DIMENSION_PX);
        assert_eq!(h, MAX_DIMENSION_PX / 2);
    }

    #[test]
    fn kind_from_extension_is_case_insensitive() {
        assert_eq!(InputKind::from_path(Path::new("a.PDF")), Some(InputKind::Pdf));
        assert_eq!(InputKind::from_path(Path::new("b.Jpeg")), Some(InputKind::Image));
        assert_eq!(InputKind::from_path(Path::new("c.docx")), Some(InputKind::Docx));
        assert_eq!(InputKind::from_path(Path::new("d.odt")), None);
        assert_eq!(InputKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = PdfiumRasterizer::new()
            .rasterize(Path::new("/tmp/notes.odt"), 200)
            .unwrap_err();
        assert!(matches!(err, RasterizeError::UnsupportedInput(_)));
    }

    #[test]
    fn png_is_a_single_page() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("scan.png");
        std::fs::write(&path, minimal_png()).unwrap();

        let pages = PdfiumRasterizer::new().rasterize(&path, 200).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].index, 0);
        assert_eq!((pages[0].width, pages[0].height), (1, 1));
        assert!(pages[0].png.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn corrupt_image_is_unsupported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("scan.jpg");
        std::fs::write(&path, b"not a jpeg").unwrap();

        let err = PdfiumRasterizer::new().rasterize(&path, 200).unwrap_err();
        assert!(matches!(err, RasterizeError::UnsupportedInput(_)));
    }
}
