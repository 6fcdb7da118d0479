//! DOCX to plain text.
//!
//! Only `word/document.xml` is read. Paragraph, table cell/row and explicit break
//! boundaries become newlines, tabs stay tabs, everything else is the run text.

use std::borrow::Cow;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use quick_xml::events::Event;
use regex::Regex;

use crate::ParseError;

const DOCUMENT_PART: &str = "word/document.xml";
/// Maximum decompressed bytes read from the document part.
const MAX_XML_ENTRY_BYTES: u64 = 64 * 1024 * 1024;

/// Read the stored artifact and return its normalized text.
pub fn extract_document_text(path: &Path) -> Result<String, ParseError> {
    let bytes = std::fs::read(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = extract_docx_text(&bytes)?;
    Ok(normalize_text(&raw).into_owned())
}

/// Collapse every newline followed by whitespace into a single newline.
pub fn normalize_text(text: &str) -> Cow<'_, str> {
    static STRIP_INDENT: OnceLock<Regex> = OnceLock::new();
    let re = STRIP_INDENT.get_or_init(|| Regex::new(r"\n\s+").expect("static pattern compiles"));
    re.replace_all(text, "\n")
}

pub fn extract_docx_text(bytes: &[u8]) -> Result<String, ParseError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    let entry = archive
        .by_name(DOCUMENT_PART)
        .map_err(|e| match e {
            zip::result::ZipError::FileNotFound => ParseError::MissingPart(DOCUMENT_PART),
            other => ParseError::Container(other),
        })?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ParseError::Xml(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ParseError::TooLarge {
            part: DOCUMENT_PART,
            limit: MAX_XML_ENTRY_BYTES,
        });
    }

    document_xml_to_text(&xml)
}

fn document_xml_to_text(xml: &[u8]) -> Result<String, ParseError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_text = false;
    // `w:tab` inside `w:tabs` is a tab-stop definition, not a tab character.
    let mut in_tab_stops = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"tabs" => in_tab_stops = true,
                b"tab" if !in_tab_stops => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" if !in_tab_stops => out.push('\t'),
                b"br" | b"cr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"tabs" => in_tab_stops = false,
                b"p" | b"tc" | b"tr" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}
