//! Declarative record grammar for the registry book.
//!
//! The book is an anchor phrase followed by entries of the form
//!
//! ```text
//! GreiiN:12 - <optional line without '#'>
//! Qualified Name#1234
//! ...anything...
//! Blazon: ...multi-line description...
//! ```
//!
//! Each entry runs until the next record marker or the end of the text.
//! Anything between markers that does not fit the entry shape is skipped.

use armory_core::{ArmigerEntry, ParsedBook, RecordId};
use regex::Regex;
use tracing::debug;

use crate::ParseError;

pub const DEFAULT_ANCHOR: &str = "This document contains";
pub const DEFAULT_MARKER: &str = "GreiiN";

#[derive(Debug, Clone)]
pub struct RecordGrammar {
    anchor: String,
    marker: String,
    entry: Regex,
}

impl RecordGrammar {
    pub fn new(anchor: impl Into<String>, marker: impl Into<String>) -> Result<Self, ParseError> {
        let anchor = anchor.into();
        let marker = marker.into();
        // Groups: id, name, discriminator, blazon block.
        let entry = Regex::new(&format!(
            r"(?s)\A{marker}:(\d+) - (?:[^\n\r#]+\n)?([^\n]+)#(\d+).+?(Blazon.+)\z",
            marker = regex::escape(&marker)
        ))?;
        Ok(Self {
            anchor,
            marker,
            entry,
        })
    }

    /// Grammar of the published registry book.
    pub fn registry_book() -> Self {
        Self::new(DEFAULT_ANCHOR, DEFAULT_MARKER).expect("default record grammar compiles")
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Parse normalized text into entries keyed by record id. Later duplicates win.
    pub fn parse(&self, text: &str) -> Result<ParsedBook, ParseError> {
        let start = text
            .find(&self.anchor)
            .ok_or_else(|| ParseError::MissingAnchor(self.anchor.clone()))?;
        let body = &text[start..];

        let mut book = ParsedBook::new();
        let mut skipped = 0usize;
        for segment in self.segments(body) {
            match self.parse_entry(segment) {
                Some(entry) => {
                    if let Some(previous) = book.insert(entry.record_id, entry) {
                        debug!(record_id = %previous.record_id, "duplicate record id, keeping later block");
                    }
                }
                None => skipped += 1,
            }
        }

        debug!(records = book.len(), skipped, "parsed registry book");
        Ok(book)
    }

    /// Slices of `body` each starting at a marker and ending before the next one.
    fn segments<'a>(&self, body: &'a str) -> Vec<&'a str> {
        let starts: Vec<usize> = body.match_indices(&self.marker).map(|(i, _)| i).collect();
        starts
            .iter()
            .enumerate()
            .map(|(n, &from)| {
                let to = starts.get(n + 1).copied().unwrap_or(body.len());
                &body[from..to]
            })
            .collect()
    }

    fn parse_entry(&self, segment: &str) -> Option<ArmigerEntry> {
        let caps = self.entry.captures(segment)?;
        let record_id = caps[1].parse::<RecordId>().ok()?;
        let qualified_name = caps[2].trim();
        if qualified_name.is_empty() {
            return None;
        }
        Some(ArmigerEntry {
            record_id,
            qualified_name: qualified_name.to_string(),
            qualified_discriminator: caps[3].to_string(),
            blazon: caps[4].trim_end().to_string(),
        })
    }
}

impl Default for RecordGrammar {
    fn default() -> Self {
        Self::registry_book()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRONT: &str = "Registry of the Heraldry Community\nGreiiN:999 - front matter mention\nThis document contains every registered device.\n";

    fn grammar() -> RecordGrammar {
        RecordGrammar::registry_book()
    }

    #[test]
    fn parses_entries_after_anchor_only() {
        let text = format!(
            "{FRONT}GreiiN:1 - Aldric#0001\nRegistered 2020\nBlazon: Or, a lion rampant Gules.\nGreiiN:2 - Bea#0002\nArms\nBlazon: Vert, a fess Argent.\n"
        );
        let book = grammar().parse(&text).unwrap();

        assert_eq!(book.keys().copied().collect::<Vec<_>>(), vec![RecordId(1), RecordId(2)]);
        let first = &book[&RecordId(1)];
        assert_eq!(first.qualified_name, "Aldric");
        assert_eq!(first.qualified_discriminator, "0001");
        assert_eq!(first.blazon, "Blazon: Or, a lion rampant Gules.");
        assert!(!book.contains_key(&RecordId(999)));
    }

    #[test]
    fn optional_line_before_name_is_ignored() {
        let text = format!(
            "{FRONT}GreiiN:5 - Baron of the Marches\nSer Cedric Vale#1234\nDevice\nBlazon: Azure, three mullets Or.\nSupporters: two stags."
        );
        let book = grammar().parse(&text).unwrap();
        let entry = &book[&RecordId(5)];
        assert_eq!(entry.qualified_name, "Ser Cedric Vale");
        assert_eq!(entry.qualified_discriminator, "1234");
        assert_eq!(entry.blazon, "Blazon: Azure, three mullets Or.\nSupporters: two stags.");
    }

    #[test]
    fn name_runs_to_last_hash_on_its_line() {
        let text = format!("{FRONT}GreiiN:8 - We#re#4242\nx\nBlazon: Sable plain.");
        let book = grammar().parse(&text).unwrap();
        assert_eq!(book[&RecordId(8)].qualified_name, "We#re");
        assert_eq!(book[&RecordId(8)].qualified_discriminator, "4242");
    }

    #[test]
    fn malformed_fragment_is_skipped() {
        let text = format!(
            "{FRONT}GreiiN:1 - Aldric#0001\nArms\nBlazon: Or plain.\nGreiiN:2 - Nameless without discriminator\nBlazon: Gules plain.\n"
        );
        let book = grammar().parse(&text).unwrap();
        assert_eq!(book.len(), 1);
        assert!(book.contains_key(&RecordId(1)));
        assert_eq!(book[&RecordId(1)].blazon, "Blazon: Or plain.");
    }

    #[test]
    fn fragment_missing_blazon_does_not_borrow_the_next_entry() {
        let text = format!(
            "{FRONT}GreiiN:3 - Dara#0003\nno device yet\nGreiiN:4 - Eoin#0004\nArms\nBlazon: Purpure plain."
        );
        let book = grammar().parse(&text).unwrap();
        assert_eq!(book.len(), 1);
        assert_eq!(book[&RecordId(4)].qualified_name, "Eoin");
    }

    #[test]
    fn duplicate_ids_keep_the_later_block() {
        let text = format!(
            "{FRONT}GreiiN:7 - First#0007\nArms\nBlazon: Or plain.\nGreiiN:7 - Second#0070\nArms\nBlazon: Argent plain."
        );
        let book = grammar().parse(&text).unwrap();
        assert_eq!(book.len(), 1);
        let entry = &book[&RecordId(7)];
        assert_eq!(entry.qualified_name, "Second");
        assert_eq!(entry.qualified_discriminator, "0070");
        assert_eq!(entry.blazon, "Blazon: Argent plain.");
    }

    #[test]
    fn prose_only_yields_empty_book() {
        let text = format!("{FRONT}No entries have been registered yet.\n");
        assert!(grammar().parse(&text).unwrap().is_empty());
    }

    #[test]
    fn missing_anchor_is_an_error() {
        let err = grammar()
            .parse("GreiiN:1 - Aldric#0001\nArms\nBlazon: Or plain.")
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingAnchor(_)));
    }

    #[test]
    fn overflowing_ids_are_skipped() {
        let text = format!("{FRONT}GreiiN:99999999999999999999 - Big#0001\nArms\nBlazon: Or plain.");
        assert!(grammar().parse(&text).unwrap().is_empty());
    }

    #[test]
    fn custom_marker_is_escaped() {
        let grammar = RecordGrammar::new("Index", "No.").unwrap();
        let book = grammar
            .parse("Index\nNo.:3 - Fen#0003\nArms\nBlazon: Vert plain.")
            .unwrap();
        assert_eq!(book[&RecordId(3)].qualified_name, "Fen");
        assert_eq!(grammar.marker(), "No.");
    }
}
