use anyhow::{Context, Result};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use std::io::{Cursor, Read};

use crate::error::AnimaError;

/// Raw document bytes as delivered by the intake layer.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime_hint: Option<String>,
}

/// Extracted plain text. Paragraph boundaries are preserved as `\n\n`,
/// intra-paragraph line breaks as `\n`.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    pub filename: String,
}

pub struct DocumentParser;

impl DocumentParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, input: &DocumentInput) -> std::result::Result<ParsedDocument, AnimaError> {
        let extension = extension_of(&input.filename, input.mime_hint.as_deref());

        let text = match extension.as_str() {
            "pdf" => self.parse_pdf(&input.bytes),
            "txt" | "md" | "markdown" => self.parse_plain(&input.bytes),
            "docx" => self.parse_docx(&input.bytes),
            "pptx" => self.parse_pptx(&input.bytes),
            "xlsx" | "xls" | "ods" => self.parse_spreadsheet(&input.bytes),
            "html" | "htm" => self.parse_html(&input.bytes),
            other => {
                return Err(AnimaError::UnsupportedFormat(format!(
                    "unknown extension '{}' for {}",
                    other, input.filename
                )))
            }
        }
        .map_err(|e| AnimaError::ParseFailure(format!("{}: {:#}", input.filename, e)))?;

        let text = normalize_paragraphs(&text);
        if text.trim().is_empty() {
            return Err(AnimaError::ParseFailure(format!(
                "{}: no extractable text",
                input.filename
            )));
        }

        Ok(ParsedDocument {
            text,
            filename: input.filename.clone(),
        })
    }

    fn parse_pdf(&self, bytes: &[u8]) -> Result<String> {
        // Layer 1: pdf_extract for fast text extraction
        if let Ok(text) = pdf_extract::extract_text_from_mem(bytes) {
            if !text.trim().is_empty() {
                return Ok(text);
            }
        }

        // pdf_extract failed — fall back to lopdf's per-page extraction
        let doc = lopdf::Document::load_mem(bytes).context("failed to load PDF")?;
        let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
        let mut out = String::new();
        for page in pages {
            if let Ok(page_text) = doc.extract_text(&[page]) {
                let page_text = page_text.trim();
                if !page_text.is_empty() {
                    if !out.is_empty() {
                        out.push_str("\n\n");
                    }
                    out.push_str(page_text);
                }
            }
        }

        if out.trim().is_empty() {
            anyhow::bail!("PDF contains no extractable text (scanned/image-based)");
        }
        Ok(out)
    }

    fn parse_plain(&self, bytes: &[u8]) -> Result<String> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        // Strip UTF-8 BOM and normalize line endings
        let text = text.trim_start_matches('\u{feff}').replace("\r\n", "\n");
        Ok(text)
    }

    fn parse_docx(&self, bytes: &[u8]) -> Result<String> {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).context("failed to read DOCX as ZIP")?;

        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .context("DOCX missing word/document.xml")?
            .read_to_string(&mut xml)
            .context("failed to read document.xml from DOCX")?;

        let text = extract_xml_runs(&xml, "<w:p", "</w:p>", "<w:t");
        if text.is_empty() {
            anyhow::bail!("DOCX contains no extractable text");
        }
        Ok(text)
    }

    /// Parse PPTX by extracting text from each slide's XML.
    fn parse_pptx(&self, bytes: &[u8]) -> Result<String> {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).context("failed to read PPTX as ZIP")?;

        let mut slides: Vec<(usize, String)> = Vec::new();
        for i in 0..archive.len() {
            let mut entry = match archive.by_index(i) {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.name().to_string();
            if !name.starts_with("ppt/slides/slide") || !name.ends_with(".xml") {
                continue;
            }
            let slide_num = name
                .trim_start_matches("ppt/slides/slide")
                .trim_end_matches(".xml")
                .parse::<usize>()
                .unwrap_or(0);

            let mut xml = String::new();
            if entry.read_to_string(&mut xml).is_ok() {
                let text = extract_xml_runs(&xml, "<a:p", "</a:p>", "<a:t");
                if !text.is_empty() {
                    slides.push((slide_num, text));
                }
            }
        }

        if slides.is_empty() {
            anyhow::bail!("PPTX contains no extractable text");
        }

        slides.sort_by_key(|(num, _)| *num);
        Ok(slides
            .into_iter()
            .map(|(_, text)| text)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    /// Parse Excel/ODS spreadsheet into flat text (one row per line, pipe-separated).
    fn parse_spreadsheet(&self, bytes: &[u8]) -> Result<String> {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
            .context("failed to open spreadsheet")?;

        let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
        let mut all_text = String::new();

        for sheet_name in &sheet_names {
            let range = match workbook.worksheet_range(sheet_name) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if range.is_empty() {
                continue;
            }
            if sheet_names.len() > 1 {
                all_text.push_str(&format!("\n\n{}\n", sheet_name));
            }
            for row in range.rows() {
                let cells: Vec<String> = row.iter().map(cell_to_string).collect();
                if cells.iter().all(|c| c.is_empty()) {
                    continue;
                }
                all_text.push_str(&cells.join(" | "));
                all_text.push('\n');
            }
        }

        if all_text.trim().is_empty() {
            anyhow::bail!("spreadsheet contains no data");
        }
        Ok(all_text)
    }

    fn parse_html(&self, bytes: &[u8]) -> Result<String> {
        let raw = self.parse_plain(bytes)?;
        Ok(strip_html_tags(&raw))
    }
}

impl Default for DocumentParser {
    fn default() -> Self {
        Self::new()
    }
}

fn extension_of(filename: &str, mime_hint: Option<&str>) -> String {
    let from_name = filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
    if let Some(ext) = from_name {
        if !ext.is_empty() {
            return ext;
        }
    }
    match mime_hint {
        Some("application/pdf") => "pdf".into(),
        Some("text/plain") => "txt".into(),
        Some("text/markdown") => "md".into(),
        Some("text/html") => "html".into(),
        Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document") => {
            "docx".into()
        }
        Some("application/vnd.openxmlformats-officedocument.presentationml.presentation") => {
            "pptx".into()
        }
        Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet") => "xlsx".into(),
        _ => String::new(),
    }
}

/// Collapse runs of three or more newlines to a paragraph break and trim
/// trailing whitespace per line.
fn normalize_paragraphs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        blank_run = 0;
        out.push_str(line);
    }
    out
}

/// Extract text runs from WordprocessingML/DrawingML: paragraphs delimited
/// by `para_open`..`para_close`, text held in `text_open` elements.
fn extract_xml_runs(xml: &str, para_open: &str, para_close: &str, text_open: &str) -> String {
    let close_len = para_close.len();
    let mut result = String::new();
    let mut pos = 0;

    while let Some(p_start) = xml[pos..].find(para_open) {
        let abs_p_start = pos + p_start;
        let p_end = match xml[abs_p_start..].find(para_close) {
            Some(end) => abs_p_start + end + close_len,
            None => xml.len(),
        };

        let paragraph = &xml[abs_p_start..p_end];
        let mut para_text = String::new();
        let mut t_pos = 0;

        while let Some(t_start) = paragraph[t_pos..].find(text_open) {
            let abs_t_start = t_pos + t_start;
            let Some(tag_end) = paragraph[abs_t_start..].find('>') else {
                break;
            };
            // Skip self-closing runs and sibling tags sharing the prefix
            // (e.g. <w:tab/>, <a:tbl>): a text element's tag is exactly
            // `<w:t>` or `<w:t attr...>`.
            let tag = &paragraph[abs_t_start..abs_t_start + tag_end + 1];
            let after_prefix = tag.as_bytes().get(text_open.len()).copied();
            if !matches!(after_prefix, Some(b'>') | Some(b' ')) || tag.ends_with("/>") {
                t_pos = abs_t_start + tag_end + 1;
                continue;
            }
            let content_start = abs_t_start + tag_end + 1;
            let close_tag = format!("</{}>", &text_open[1..]);
            match paragraph[content_start..].find(&close_tag) {
                Some(t_end) => {
                    para_text.push_str(&decode_xml_entities(
                        &paragraph[content_start..content_start + t_end],
                    ));
                    t_pos = content_start + t_end + close_tag.len();
                }
                None => break,
            }
        }

        if !para_text.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&para_text);
        }
        pos = p_end;
    }

    result
}

fn decode_xml_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

/// Strip tags and collapse whitespace; drops script/style bodies.
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let lower = html.to_lowercase();

    let mut skip_until: Option<usize> = None;
    let mut in_tag = false;

    for (i, c) in html.char_indices() {
        if let Some(end) = skip_until {
            if i < end {
                continue;
            }
            skip_until = None;
            in_tag = false;
        }
        if c == '<' {
            for blocked in ["script", "style"] {
                let open = format!("<{}", blocked);
                if lower[i..].starts_with(&open) {
                    let close = format!("</{}>", blocked);
                    if let Some(rel) = lower[i..].find(&close) {
                        skip_until = Some(i + rel + close.len());
                    }
                }
            }
            in_tag = true;
            continue;
        }
        if c == '>' {
            in_tag = false;
            out.push(' ');
            continue;
        }
        if !in_tag {
            out.push(c);
        }
    }

    // Collapse whitespace runs into single spaces, keeping line structure
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Convert a calamine cell to a clean string representation.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                (*f as i64).to_string()
            } else {
                format!("{:.4}", f)
                    .trim_end_matches('0')
                    .trim_end_matches('.')
                    .to_string()
            }
        }
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::Error(e) => format!("#ERR:{:?}", e),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(filename: &str, bytes: &[u8]) -> DocumentInput {
        DocumentInput {
            bytes: bytes.to_vec(),
            filename: filename.to_string(),
            mime_hint: None,
        }
    }

    #[test]
    fn plain_text_passes_through_with_bom_stripped() {
        let parser = DocumentParser::new();
        let parsed = parser
            .parse(&input("notes.txt", "\u{feff}first line\r\nsecond line".as_bytes()))
            .unwrap();
        assert_eq!(parsed.text, "first line\nsecond line");
        assert_eq!(parsed.filename, "notes.txt");
    }

    #[test]
    fn markdown_passes_through() {
        let parser = DocumentParser::new();
        let parsed = parser
            .parse(&input("essay.md", b"# Title\n\nBody paragraph."))
            .unwrap();
        assert!(parsed.text.contains("# Title"));
        assert!(parsed.text.contains("\n\n"));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let parser = DocumentParser::new();
        let err = parser.parse(&input("blob.bin", b"data")).unwrap_err();
        assert_eq!(err.kind(), "unsupported_format");
    }

    #[test]
    fn empty_text_is_a_parse_failure() {
        let parser = DocumentParser::new();
        let err = parser.parse(&input("empty.txt", b"   \n  ")).unwrap_err();
        assert_eq!(err.kind(), "parse_failure");
    }

    #[test]
    fn mime_hint_resolves_missing_extension() {
        let parser = DocumentParser::new();
        let parsed = parser
            .parse(&DocumentInput {
                bytes: b"hinted body".to_vec(),
                filename: "upload".to_string(),
                mime_hint: Some("text/plain".to_string()),
            })
            .unwrap();
        assert_eq!(parsed.text, "hinted body");
    }

    #[test]
    fn paragraph_normalization_collapses_blank_runs() {
        assert_eq!(
            normalize_paragraphs("a\n\n\n\nb\nc"),
            "a\n\nb\nc"
        );
    }

    #[test]
    fn docx_run_extraction() {
        let xml = r#"<w:document><w:body>
            <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world</w:t></w:r></w:p>
            <w:p><w:r><w:tab/><w:t>Second &amp; third</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let text = extract_xml_runs(xml, "<w:p", "</w:p>", "<w:t");
        assert_eq!(text, "Hello world\nSecond & third");
    }

    #[test]
    fn html_tags_are_stripped() {
        let out = strip_html_tags("<html><script>var x=1;</script><p>Hello <b>there</b></p></html>");
        assert_eq!(out, "Hello there");
    }
}
