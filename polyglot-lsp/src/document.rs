//! The in-memory overlay for opened documents.
//!
//! The overlay is the authoritative text for any document the caller has
//! opened: edits mutate the rope and bump the version, and the session
//! forwards the new content to the server. Nothing here ever writes to disk.

use crate::{lsp, util, Error, OffsetEncoding, Result};
use ropey::Rope;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct OpenDocument {
    pub uri: lsp::Url,
    pub language_id: String,
    pub text: Rope,
    /// Strictly increases with every edit.
    pub version: i32,
    open_count: usize,
}

#[derive(Debug, Default)]
pub struct DocumentStore {
    docs: HashMap<PathBuf, OpenDocument>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the open-count of an already tracked document. Returns
    /// false when the document is not tracked (the caller then loads the
    /// on-disk text and calls [`DocumentStore::insert_new`]).
    pub fn bump_open(&mut self, relative_path: &Path) -> bool {
        match self.docs.get_mut(relative_path) {
            Some(doc) => {
                doc.open_count += 1;
                true
            }
            None => false,
        }
    }

    /// Track a document for the first time. The caller sends `didOpen`.
    pub fn insert_new(
        &mut self,
        relative_path: &Path,
        uri: lsp::Url,
        language_id: &str,
        text: String,
    ) -> &OpenDocument {
        self.docs
            .entry(relative_path.to_path_buf())
            .or_insert(OpenDocument {
                uri,
                language_id: language_id.to_string(),
                text: Rope::from_str(&text),
                version: 0,
                open_count: 1,
            })
    }

    /// Decrement the open-count. Returns the URI when the count reached zero
    /// and the document was dropped (the caller then sends `didClose`).
    pub fn close(&mut self, relative_path: &Path) -> Result<Option<lsp::Url>> {
        let doc = self
            .docs
            .get_mut(relative_path)
            .ok_or_else(|| not_open(relative_path))?;
        doc.open_count -= 1;
        if doc.open_count == 0 {
            let doc = self.docs.remove(relative_path).expect("entry exists");
            Ok(Some(doc.uri))
        } else {
            Ok(None)
        }
    }

    pub fn is_open(&self, relative_path: &Path) -> bool {
        self.docs.contains_key(relative_path)
    }

    pub fn text(&self, relative_path: &Path) -> Result<String> {
        self.docs
            .get(relative_path)
            .map(|doc| doc.text.to_string())
            .ok_or_else(|| not_open(relative_path))
    }

    pub fn identifier(&self, relative_path: &Path) -> Result<(lsp::Url, i32)> {
        self.docs
            .get(relative_path)
            .map(|doc| (doc.uri.clone(), doc.version))
            .ok_or_else(|| not_open(relative_path))
    }

    /// Insert `text` at `position`, bumping the version. Returns the URI,
    /// the new version, the full updated text and the position just past the
    /// inserted text.
    pub fn insert_text(
        &mut self,
        relative_path: &Path,
        position: lsp::Position,
        text: &str,
        encoding: OffsetEncoding,
    ) -> Result<(lsp::Url, i32, String, lsp::Position)> {
        let doc = self
            .docs
            .get_mut(relative_path)
            .ok_or_else(|| not_open(relative_path))?;

        let char_idx = util::lsp_pos_to_pos(&doc.text, position, encoding)
            .ok_or(Error::OutOfBounds(position.line, position.character))?;

        doc.text.insert(char_idx, text);
        doc.version += 1;

        let end = util::pos_to_lsp_pos(&doc.text, char_idx + text.chars().count(), encoding);
        Ok((doc.uri.clone(), doc.version, doc.text.to_string(), end))
    }

    /// Delete the text between `start` and `end`, bumping the version.
    /// Returns the URI, the new version, the full updated text and the
    /// deleted text.
    pub fn delete_text(
        &mut self,
        relative_path: &Path,
        start: lsp::Position,
        end: lsp::Position,
        encoding: OffsetEncoding,
    ) -> Result<(lsp::Url, i32, String, String)> {
        let doc = self
            .docs
            .get_mut(relative_path)
            .ok_or_else(|| not_open(relative_path))?;

        let start_idx = util::lsp_pos_to_pos(&doc.text, start, encoding)
            .ok_or(Error::OutOfBounds(start.line, start.character))?;
        let end_idx = util::lsp_pos_to_pos(&doc.text, end, encoding)
            .ok_or(Error::OutOfBounds(end.line, end.character))?;
        if end_idx < start_idx {
            return Err(Error::OutOfBounds(end.line, end.character));
        }

        let deleted = doc.text.slice(start_idx..end_idx).to_string();
        doc.text.remove(start_idx..end_idx);
        doc.version += 1;

        Ok((doc.uri.clone(), doc.version, doc.text.to_string(), deleted))
    }
}

fn not_open(relative_path: &Path) -> Error {
    Error::Other(anyhow::anyhow!(
        "document {} is not open",
        relative_path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(text: &str) -> (DocumentStore, PathBuf) {
        let mut store = DocumentStore::new();
        let rel = PathBuf::from("src/main.go");
        let uri = lsp::Url::parse("file:///work/src/main.go").unwrap();
        store.insert_new(&rel, uri, "go", text.to_string());
        (store, rel)
    }

    #[test]
    fn open_close_refcounting() {
        let (mut store, rel) = store_with("package main\n");
        assert!(store.is_open(&rel));
        assert!(store.bump_open(&rel));

        // first close only drops the refcount
        assert!(store.close(&rel).unwrap().is_none());
        assert!(store.is_open(&rel));

        // last close drops the document and yields the uri for didClose
        let uri = store.close(&rel).unwrap().unwrap();
        assert_eq!(uri.path(), "/work/src/main.go");
        assert!(!store.is_open(&rel));
        assert!(store.close(&rel).is_err());
    }

    #[test]
    fn versions_strictly_increase_with_edits() {
        let (mut store, rel) = store_with("hello\n");
        let (_, v1, text, end) = store
            .insert_text(
                &rel,
                lsp::Position::new(0, 5),
                " world",
                OffsetEncoding::Utf16,
            )
            .unwrap();
        assert_eq!(v1, 1);
        assert_eq!(text, "hello world\n");
        assert_eq!(end, lsp::Position::new(0, 11));

        let (_, v2, text, deleted) = store
            .delete_text(
                &rel,
                lsp::Position::new(0, 0),
                lsp::Position::new(0, 6),
                OffsetEncoding::Utf16,
            )
            .unwrap();
        assert_eq!(v2, 2);
        assert_eq!(deleted, "hello ");
        assert_eq!(text, "world\n");
    }

    #[test]
    fn multiline_insert_reports_the_end_position() {
        let (mut store, rel) = store_with("ab\n");
        let (_, _, text, end) = store
            .insert_text(
                &rel,
                lsp::Position::new(0, 1),
                "x\ny",
                OffsetEncoding::Utf16,
            )
            .unwrap();
        assert_eq!(text, "ax\nyb\n");
        assert_eq!(end, lsp::Position::new(1, 1));
    }

    #[test]
    fn out_of_bounds_edits_are_rejected() {
        let (mut store, rel) = store_with("short\n");
        let err = store
            .insert_text(
                &rel,
                lsp::Position::new(9, 0),
                "x",
                OffsetEncoding::Utf16,
            )
            .unwrap_err();
        assert!(matches!(err, Error::OutOfBounds(9, 0)));

        // inverted range
        let err = store
            .delete_text(
                &rel,
                lsp::Position::new(0, 4),
                lsp::Position::new(0, 1),
                OffsetEncoding::Utf16,
            )
            .unwrap_err();
        assert!(matches!(err, Error::OutOfBounds(0, 1)));
    }

    #[test]
    fn text_reflects_the_overlay_not_the_disk() {
        let (mut store, rel) = store_with("on disk\n");
        store
            .insert_text(
                &rel,
                lsp::Position::new(0, 0),
                "edited ",
                OffsetEncoding::Utf16,
            )
            .unwrap();
        assert_eq!(store.text(&rel).unwrap(), "edited on disk\n");
    }
}
