use std::io::Write;

use armory_adapters::{extract_document_text, ParseError, RecordGrammar};
use armory_core::RecordId;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| {
            format!(
                r#"<w:p><w:pPr><w:ind w:left="720"/></w:pPr><w:r><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
                escape(p)
            )
        })
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
    );

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(xml.as_bytes()).unwrap();
    zip.finish().unwrap().into_inner()
}

#[test]
fn stored_docx_parses_into_registry_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("book.docx");
    std::fs::write(
        &path,
        docx_with_paragraphs(&[
            "The Book of Arms",
            "This document contains all registered arms & devices.",
            "GreiiN:10 - Lady Wren#0010",
            "   Registered at the spring moot",
            "Blazon: Azure, a wren volant Or.",
            "   Motto: Small but fierce",
            "Editorial note: entries below are pending review.",
            "GreiiN:11 - Pending",
            "GreiiN:12 - Office of Arms",
            "Lord Thorne#0012",
            "Device",
            "Blazon: Sable, a thorn branch Argent.",
        ]),
    )
    .unwrap();

    let text = extract_document_text(&path).unwrap();
    assert!(!text.contains("\n "), "indentation should be normalized away");

    let book = RecordGrammar::registry_book().parse(&text).unwrap();
    assert_eq!(
        book.keys().copied().collect::<Vec<_>>(),
        vec![RecordId(10), RecordId(12)]
    );

    let wren = &book[&RecordId(10)];
    assert_eq!(wren.qualified_name, "Lady Wren");
    assert_eq!(wren.qualified_discriminator, "0010");
    assert_eq!(
        wren.blazon,
        "Blazon: Azure, a wren volant Or.\nMotto: Small but fierce\nEditorial note: entries below are pending review."
    );

    let thorne = &book[&RecordId(12)];
    assert_eq!(thorne.qualified(), "Lord Thorne#0012");
    assert_eq!(thorne.blazon, "Blazon: Sable, a thorn branch Argent.");
}

#[test]
fn docx_without_document_part_is_rejected() {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    zip.start_file("word/styles.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(b"<w:styles/>").unwrap();
    let bytes = zip.finish().unwrap().into_inner();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("book.docx");
    std::fs::write(&path, bytes).unwrap();

    let err = extract_document_text(&path).unwrap_err();
    assert!(matches!(err, ParseError::MissingPart("word/document.xml")));
}
