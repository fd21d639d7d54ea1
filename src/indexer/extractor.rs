use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::RagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    PlainText,
    Pdf,
    Docx,
    Xlsx,
    Pptx,
}

impl FileKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "txt" | "md" | "markdown" | "csv" | "log" | "rs" | "py" | "js" | "ts" | "json"
            | "yaml" | "yml" | "toml" | "html" | "xml" => Some(Self::PlainText),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "xlsx" => Some(Self::Xlsx),
            "pptx" => Some(Self::Pptx),
            _ => None,
        }
    }

    pub fn from_filename(filename: &str) -> crate::error::Result<Self> {
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
            .ok_or_else(|| RagError::unsupported(filename, "unknown file extension"))
    }
}

/// Turns uploaded bytes into plain text.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, bytes: &[u8], kind: FileKind) -> Result<String>;

    /// Resolve the kind from `filename` and parse, reporting any failure as
    /// an unsupported document.
    fn parse_file(&self, filename: &str, bytes: &[u8]) -> crate::error::Result<String> {
        let kind = FileKind::from_filename(filename)?;
        self.parse(bytes, kind)
            .map_err(|e| RagError::unsupported(filename, format!("{:#}", e)))
    }
}

/// Parser for the built-in formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileParser;

impl DocumentParser for FileParser {
    fn parse(&self, bytes: &[u8], kind: FileKind) -> Result<String> {
        extract_text(bytes, kind)
    }
}

pub fn extract_text(bytes: &[u8], kind: FileKind) -> Result<String> {
    match kind {
        FileKind::PlainText => extract_plain_text(bytes),
        FileKind::Pdf => extract_pdf(bytes),
        FileKind::Docx => extract_docx(bytes),
        FileKind::Xlsx => extract_xlsx(bytes),
        FileKind::Pptx => extract_pptx(bytes),
    }
}

fn extract_plain_text(bytes: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(bytes).context("Text file is not valid UTF-8")?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    // pdf-extract panics on some malformed input
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(result) => result.context("Failed to extract PDF text"),
        Err(_) => anyhow::bail!("PDF extraction panicked"),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("Failed to read DOCX as ZIP")?;

    let mut xml_content = String::new();
    archive
        .by_name("word/document.xml")
        .context("No word/document.xml found in DOCX")?
        .read_to_string(&mut xml_content)?;

    Ok(extract_paragraphs(&xml_content, "w:p", "w:t").join("\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String> {
    use calamine::{Reader, Xlsx};

    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes)).context("Failed to open XLSX")?;

    let mut all_text = Vec::new();
    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();

    for sheet_name in sheet_names {
        let range = match workbook.worksheet_range(&sheet_name) {
            Ok(range) => range,
            Err(e) => {
                tracing::warn!("Skipping sheet {}: {}", sheet_name, e);
                continue;
            }
        };
        for row in range.rows() {
            let row_text: Vec<String> = row
                .iter()
                .map(|cell| cell.to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !row_text.is_empty() {
                all_text.push(row_text.join("\t"));
            }
        }
    }

    Ok(all_text.join("\n"))
}

fn extract_pptx(bytes: &[u8]) -> Result<String> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("Failed to read PPTX as ZIP")?;

    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name
                .strip_prefix("ppt/slides/slide")?
                .strip_suffix(".xml")?
                .parse()
                .ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    slides.sort();

    let mut all_text = Vec::new();
    for (_, name) in slides {
        let mut xml_content = String::new();
        archive.by_name(&name)?.read_to_string(&mut xml_content)?;
        let text = extract_paragraphs(&xml_content, "a:p", "a:t").join("\n");
        if !text.is_empty() {
            all_text.push(text);
        }
    }

    Ok(all_text.join("\n\n"))
}

/// Text runs (`text_tag`) grouped by paragraph (`para_tag`). Empty
/// paragraphs are dropped.
fn extract_paragraphs(xml: &str, para_tag: &str, text_tag: &str) -> Vec<String> {
    let close_para = format!("</{}>", para_tag);
    xml.split(close_para.as_str())
        .map(|segment| extract_text_from_xml(segment, text_tag))
        .filter(|text| !text.trim().is_empty())
        .collect()
}

fn extract_text_from_xml(xml: &str, tag: &str) -> String {
    let open_tag = format!("<{}", tag);
    let close_tag = format!("</{}>", tag);
    let mut text = String::new();
    let mut search_from = 0;

    while let Some(open_pos) = xml[search_from..].find(&open_tag) {
        let abs_open = search_from + open_pos;
        let after_name = abs_open + open_tag.len();

        // <w:tbl>, <w:tab/> and friends share the prefix
        if !matches!(xml[after_name..].chars().next(), Some('>' | ' ' | '/')) {
            search_from = after_name;
            continue;
        }

        let Some(tag_end) = xml[abs_open..].find('>') else {
            break;
        };
        let content_start = abs_open + tag_end + 1;
        if xml[..content_start].ends_with("/>") {
            search_from = content_start;
            continue;
        }

        let Some(close_pos) = xml[content_start..].find(&close_tag) else {
            break;
        };
        text.push_str(&unescape_xml(&xml[content_start..content_start + close_pos]));
        search_from = content_start + close_pos + close_tag.len();
    }

    text
}

fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
