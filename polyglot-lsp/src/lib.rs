//! A language-agnostic LSP client runtime.
//!
//! One [`Session`] drives one language server process for one workspace
//! root: it spawns the server, speaks JSON-RPC 2.0 over the child's standard
//! streams, performs the `initialize` handshake, tracks readiness, keeps an
//! in-memory overlay of opened documents and exposes code-navigation queries
//! (definition, references, hover, symbols, completions) in terms of
//! workspace-relative paths. [`SyncSession`] wraps the same surface behind a
//! blocking façade for callers without an async runtime.

pub mod config;
pub mod fsutil;
pub mod install;
pub mod jsonrpc;
pub mod languages;

mod client;
mod document;
mod process;
mod query;
mod session;
mod sync;
mod transport;

pub use futures_executor::block_on;
pub use lsp_types as lsp;

pub use client::Client;
pub use config::{ClientConfig, Language};
pub use process::{ProcessLaunchInfo, ProcessSupervisor};
pub use query::{CompletionEntry, DocumentSymbols, NavigationTarget};
pub use session::{Latch, Session, SessionState};
pub use sync::{ServerGuard, SyncSession};

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Rpc(#[from] jsonrpc::Error),
    #[error("failed to parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request {0:?} timed out")]
    Timeout(jsonrpc::Id),
    #[error("server closed the stream")]
    StreamClosed,
    #[error("session is shutting down")]
    ShuttingDown,
    #[error("session is not ready for queries (state: {0:?})")]
    NotReady(SessionState),
    #[error("method {0} is unsupported by this language server")]
    Unsupported(&'static str),
    #[error("no compiled-in server profile for language {0}")]
    UnsupportedLanguage(Language),
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("language server binary not found: {0}")]
    MissingBinary(String),
    #[error("failed to start '{0}': {1}")]
    Spawn(String, #[source] std::io::Error),
    #[error("position {0}:{1} is out of bounds for the document")]
    OutOfBounds(u32, u32),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How the server counts the `character` field of a position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OffsetEncoding {
    /// UTF-8 code units aka bytes
    #[serde(rename = "utf-8")]
    Utf8,
    /// UTF-16 code units
    #[default]
    #[serde(rename = "utf-16")]
    Utf16,
    /// UTF-32 code units aka chars
    #[serde(rename = "utf-32")]
    Utf32,
}

pub mod util {
    use super::*;
    use ropey::Rope;

    /// Converts an [`lsp::Position`] to a char index in the document.
    ///
    /// Returns `None` when the position lies beyond the document, so callers
    /// can turn out-of-bounds queries into empty results instead of panics.
    pub fn lsp_pos_to_pos(
        doc: &Rope,
        pos: lsp::Position,
        offset_encoding: OffsetEncoding,
    ) -> Option<usize> {
        let line = pos.line as usize;
        if line >= doc.len_lines() {
            return None;
        }
        let line_start = doc.line_to_char(line);
        let line_end = line_start + doc.line(line).len_chars();

        match offset_encoding {
            OffsetEncoding::Utf8 => {
                let line_start_byte = doc.char_to_byte(line_start);
                let target = line_start_byte.checked_add(pos.character as usize)?;
                let char_idx = doc.try_byte_to_char(target).ok()?;
                (char_idx <= line_end).then_some(char_idx)
            }
            OffsetEncoding::Utf16 => {
                let line_start_cu = doc.char_to_utf16_cu(line_start);
                let target = line_start_cu.checked_add(pos.character as usize)?;
                if target > doc.len_utf16_cu() {
                    return None;
                }
                let char_idx = doc.utf16_cu_to_char(target);
                (char_idx <= line_end).then_some(char_idx)
            }
            OffsetEncoding::Utf32 => {
                let char_idx = line_start.checked_add(pos.character as usize)?;
                (char_idx <= line_end).then_some(char_idx)
            }
        }
    }

    /// Converts a char index in the document to an [`lsp::Position`].
    ///
    /// Panics when `pos` is out of `doc` bounds.
    pub fn pos_to_lsp_pos(
        doc: &Rope,
        pos: usize,
        offset_encoding: OffsetEncoding,
    ) -> lsp::Position {
        let line = doc.char_to_line(pos);
        let line_start = doc.line_to_char(line);

        let col = match offset_encoding {
            OffsetEncoding::Utf8 => doc.char_to_byte(pos) - doc.char_to_byte(line_start),
            OffsetEncoding::Utf16 => doc.char_to_utf16_cu(pos) - doc.char_to_utf16_cu(line_start),
            OffsetEncoding::Utf32 => pos - line_start,
        };

        lsp::Position::new(line as u32, col as u32)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn position_roundtrip_ascii() {
            let doc = Rope::from_str("fn main() {\n    println!(\"hi\");\n}\n");
            for encoding in [
                OffsetEncoding::Utf8,
                OffsetEncoding::Utf16,
                OffsetEncoding::Utf32,
            ] {
                let pos = lsp::Position::new(1, 4);
                let char_idx = lsp_pos_to_pos(&doc, pos, encoding).unwrap();
                assert_eq!(doc.char(char_idx), 'p');
                assert_eq!(pos_to_lsp_pos(&doc, char_idx, encoding), pos);
            }
        }

        #[test]
        fn multibyte_columns_differ_by_encoding() {
            // "ß" is 2 bytes / 1 utf-16 unit / 1 char, "𐐀" is 4 bytes / 2 units
            let doc = Rope::from_str("ß𐐀x\n");
            assert_eq!(doc.char(2), 'x');

            assert_eq!(pos_to_lsp_pos(&doc, 2, OffsetEncoding::Utf8).character, 6);
            assert_eq!(pos_to_lsp_pos(&doc, 2, OffsetEncoding::Utf16).character, 3);
            assert_eq!(pos_to_lsp_pos(&doc, 2, OffsetEncoding::Utf32).character, 2);

            for encoding in [
                OffsetEncoding::Utf8,
                OffsetEncoding::Utf16,
                OffsetEncoding::Utf32,
            ] {
                let pos = pos_to_lsp_pos(&doc, 2, encoding);
                assert_eq!(lsp_pos_to_pos(&doc, pos, encoding), Some(2));
            }
        }

        #[test]
        fn out_of_bounds_positions_are_none() {
            let doc = Rope::from_str("short\n");
            assert_eq!(
                lsp_pos_to_pos(&doc, lsp::Position::new(10, 0), OffsetEncoding::Utf16),
                None
            );
            assert_eq!(
                lsp_pos_to_pos(&doc, lsp::Position::new(0, 64), OffsetEncoding::Utf16),
                None
            );
        }
    }
}
