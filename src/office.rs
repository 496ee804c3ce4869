//! Office document normalization (DOCX → synthetic PDF).
//!
//! The vision extractor only ever sees page images, so word-processing
//! files are first flattened to text and re-laid on plain US-letter pages:
//!
//! - body paragraphs in document order, word-wrapped;
//! - heading paragraphs as `*** title ***`, set in bold;
//! - tables as ` | `-joined rows between `=== TABLEAU ===` and
//!   `=== FIN TABLEAU ===` markers.
//!
//! Layout is not preserved. When the text cannot be extracted the result
//! degrades to a one-page placeholder naming the file.

use std::io::{BufWriter, Read};
use std::path::Path;

use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference};

/// Maximum decompressed bytes to read from `word/document.xml` (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

pub const TABLE_START: &str = "=== TABLEAU ===";
pub const TABLE_END: &str = "=== FIN TABLEAU ===";

// US letter, in points.
const PAGE_WIDTH_PT: f32 = 612.0;
const PAGE_HEIGHT_PT: f32 = 792.0;
const MARGIN_PT: f32 = 50.0;
const BODY_FONT_SIZE: f32 = 10.0;
const HEADING_FONT_SIZE: f32 = 12.0;
const MARKER_FONT_SIZE: f32 = 9.0;

#[derive(thiserror::Error, Debug)]
pub enum OfficeError {
    #[error("DOCX archive error: {0}")]
    Zip(String),
    #[error("DOCX XML error: {0}")]
    Xml(String),
    #[error("PDF layout error: {0}")]
    Pdf(String),
}

/// A top-level block of a word-processing document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocxBlock {
    Heading(String),
    Paragraph(String),
    Table(Vec<Vec<String>>),
}

/// Lays a DOCX file out as a synthetic PDF.
///
/// Never fails on bad input: extraction or layout errors produce a
/// placeholder page instead. The returned flag is `true` when the
/// placeholder was used. Only a failure to write even the placeholder is
/// reported as an error.
pub fn docx_to_pdf(path: &Path) -> Result<(Vec<u8>, bool), OfficeError> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let laid_out = std::fs::read(path)
        .map_err(|e| OfficeError::Zip(e.to_string()))
        .and_then(|bytes| extract_docx_blocks(&bytes))
        .and_then(|blocks| layout_pdf(&filename, &blocks_to_lines(&blocks)));

    match laid_out {
        Ok((pdf, pages)) => {
            tracing::info!(file = %filename, pages, "DOCX normalized to PDF");
            Ok((pdf, false))
        }
        Err(e) => {
            tracing::warn!(file = %filename, error = %e, "DOCX extraction failed, using placeholder page");
            placeholder_pdf(&filename).map(|pdf| (pdf, true))
        }
    }
}

/// Extracts headings, paragraphs, and tables from DOCX bytes, in document order.
pub fn extract_docx_blocks(bytes: &[u8]) -> Result<Vec<DocxBlock>, OfficeError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| OfficeError::Zip(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| OfficeError::Zip(e.to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| OfficeError::Zip(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(OfficeError::Zip(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    parse_document_xml(&xml)
}

fn is_heading_style(style: &str) -> bool {
    let lower = style.to_ascii_lowercase();
    lower.starts_with("heading") || lower.starts_with("titre") || lower == "title"
}

fn parse_document_xml(xml: &[u8]) -> Result<Vec<DocxBlock>, OfficeError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut blocks = Vec::new();
    let mut paragraph = String::new();
    let mut paragraph_style: Option<String> = None;
    let mut in_text = false;

    let mut table_depth = 0usize;
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    paragraph.clear();
                    paragraph_style = None;
                }
                b"t" => in_text = true,
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        rows.clear();
                    }
                }
                b"tr" if table_depth == 1 => row.clear(),
                b"tc" if table_depth == 1 => cell.clear(),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => {
                    paragraph_style = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.local_name().as_ref() == b"val")
                        .map(|a| String::from_utf8_lossy(&a.value).into_owned());
                }
                b"tab" | b"br" => paragraph.push(' '),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| OfficeError::Xml(e.to_string()))?;
                paragraph.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = paragraph.trim().to_string();
                    if table_depth > 0 {
                        if !text.is_empty() {
                            if !cell.is_empty() {
                                cell.push(' ');
                            }
                            cell.push_str(&text);
                        }
                    } else if !text.is_empty() {
                        match paragraph_style.as_deref() {
                            Some(style) if is_heading_style(style) => {
                                blocks.push(DocxBlock::Heading(text))
                            }
                            _ => blocks.push(DocxBlock::Paragraph(text)),
                        }
                    }
                    paragraph.clear();
                }
                b"tc" if table_depth == 1 => row.push(cell.trim().to_string()),
                b"tr" if table_depth == 1 => rows.push(std::mem::take(&mut row)),
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 {
                        blocks.push(DocxBlock::Table(std::mem::take(&mut rows)));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(OfficeError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(blocks)
}

/// A line of the synthetic layout.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutLine {
    Heading(String),
    Marker(String),
    Text(String),
}

/// Flattens blocks into layout lines (headings, table markers, text).
pub fn blocks_to_lines(blocks: &[DocxBlock]) -> Vec<LayoutLine> {
    let mut lines = Vec::new();
    for block in blocks {
        match block {
            DocxBlock::Heading(text) => lines.push(LayoutLine::Heading(format!("*** {} ***", text))),
            DocxBlock::Paragraph(text) => lines.push(LayoutLine::Text(text.clone())),
            DocxBlock::Table(rows) => {
                lines.push(LayoutLine::Marker(TABLE_START.to_string()));
                for row in rows {
                    let cells: Vec<&str> = row
                        .iter()
                        .map(|c| c.as_str())
                        .filter(|c| !c.is_empty())
                        .collect();
                    if !cells.is_empty() {
                        lines.push(LayoutLine::Text(cells.join(" | ")));
                    }
                }
                lines.push(LayoutLine::Marker(TABLE_END.to_string()));
            }
        }
    }
    lines
}

/// Greedy word wrap on character count.
pub fn wrap_words(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let len = current.chars().count();
        if len > 0 && len + 1 + word.chars().count() > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn pt(value: f32) -> Mm {
    Mm(value * 25.4 / 72.0)
}

/// Builtin Helvetica averages about half an em per character.
fn chars_per_line(font_size: f32) -> usize {
    ((PAGE_WIDTH_PT - 2.0 * MARGIN_PT) / (font_size * 0.5)) as usize
}

struct PageCursor {
    doc: PdfDocumentReference,
    layer: printpdf::PdfLayerReference,
    y: f32,
    pages: usize,
}

impl PageCursor {
    fn new(title: &str) -> Self {
        let (doc, page, layer) =
            PdfDocument::new(title, pt(PAGE_WIDTH_PT), pt(PAGE_HEIGHT_PT), "Layer 1");
        let layer = doc.get_page(page).get_layer(layer);
        Self {
            doc,
            layer,
            y: PAGE_HEIGHT_PT - MARGIN_PT,
            pages: 1,
        }
    }

    fn ensure_room(&mut self, floor: f32) {
        if self.y < floor {
            let (page, layer) =
                self.doc
                    .add_page(pt(PAGE_WIDTH_PT), pt(PAGE_HEIGHT_PT), "Layer 1");
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = PAGE_HEIGHT_PT - MARGIN_PT;
            self.pages += 1;
        }
    }

    fn write(&mut self, text: &str, size: f32, font: &IndirectFontRef, advance: f32) {
        self.layer.use_text(text, size, pt(MARGIN_PT), pt(self.y), font);
        self.y -= advance;
    }

    fn finish(self) -> Result<Vec<u8>, OfficeError> {
        let mut buf = BufWriter::new(Vec::new());
        self.doc
            .save(&mut buf)
            .map_err(|e| OfficeError::Pdf(e.to_string()))?;
        buf.into_inner()
            .map_err(|e| OfficeError::Pdf(e.to_string()))
    }
}

/// Lays `lines` out on letter pages; returns the PDF and its page count.
fn layout_pdf(title: &str, lines: &[LayoutLine]) -> Result<(Vec<u8>, usize), OfficeError> {
    let mut cursor = PageCursor::new(title);
    let font = cursor
        .doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| OfficeError::Pdf(e.to_string()))?;
    let bold = cursor
        .doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| OfficeError::Pdf(e.to_string()))?;

    let body_width = chars_per_line(BODY_FONT_SIZE);

    for line in lines {
        match line {
            LayoutLine::Heading(text) => {
                cursor.ensure_room(100.0);
                cursor.write(text, HEADING_FONT_SIZE, &bold, 20.0);
            }
            LayoutLine::Marker(text) => {
                cursor.ensure_room(MARGIN_PT);
                cursor.write(text, MARKER_FONT_SIZE, &bold, 15.0);
            }
            LayoutLine::Text(text) => {
                for wrapped in wrap_words(text, body_width) {
                    cursor.ensure_room(MARGIN_PT);
                    cursor.write(&wrapped, BODY_FONT_SIZE, &font, 12.0);
                }
                cursor.y -= 8.0;
            }
        }
    }

    let pages = cursor.pages;
    tracing::debug!(pages, lines = lines.len(), "synthetic PDF laid out");
    Ok((cursor.finish()?, pages))
}

/// One page with the filename and an extraction-failure notice.
pub fn placeholder_pdf(filename: &str) -> Result<Vec<u8>, OfficeError> {
    let mut cursor = PageCursor::new(filename);
    let font = cursor
        .doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| OfficeError::Pdf(e.to_string()))?;
    cursor.write(&format!("Document: {}", filename), 12.0, &font, 20.0);
    cursor.write(
        "Erreur lors de l'extraction du contenu DOCX",
        12.0,
        &font,
        20.0,
    );
    cursor.finish()
}
