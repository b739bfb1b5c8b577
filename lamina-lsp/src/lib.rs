//! A Language Server Protocol client.
//!
//! The client owns one duplex byte stream to a language server and everything
//! layered on top of it: `Content-Length` framing, JSON-RPC correlation with
//! cancellation, a versioned snapshot of every open document, and a typed
//! request surface over the LSP methods an editor drives.

mod client;
pub mod jsonrpc;
mod snapshot;
mod transport;

pub use client::{Client, ClientConfig, DiagnosticsSink, ServerState};
pub use snapshot::DocumentSnapshot;

pub use lsp_types as lsp;
pub use lsp::{Position, Url};

pub type Result<T> = core::result::Result<T, Error>;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The server answered the request with a JSON-RPC error object.
    #[error("server error: {0}")]
    Rpc(#[from] jsonrpc::Error),
    #[error("failed to parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {method} response: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// Malformed JSON-RPC traffic above the framing layer. Not fatal.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Stream or framing failure. Fatal: the client is `Failed` afterwards.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("language server is not ready")]
    ServerNotReady,
    #[error("request was cancelled")]
    Cancelled,
    #[error("request timed out")]
    Timeout,
    #[error("stream closed")]
    StreamClosed,
    #[error("{0} limit exceeded")]
    ResourceExhausted(&'static str),
    #[error("position {line}:{character} is outside the document")]
    InvalidPosition { line: u32, character: u32 },
    #[error("document is not open: {0}")]
    NotOpen(Url),
}

/// Character unit the server counts `Position.character` in, fixed during
/// `initialize` via `general.positionEncodings`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetEncoding {
    /// UTF-8 code units aka bytes
    #[serde(rename = "utf-8")]
    Utf8,
    /// UTF-16 code units, the protocol default
    #[default]
    #[serde(rename = "utf-16")]
    Utf16,
    /// Unicode scalar values
    #[serde(rename = "utf-32")]
    Utf32,
}

pub mod util {
    use super::{lsp, OffsetEncoding};
    use ropey::Rope;

    /// Resolve an LSP position against `doc`. Returns `None` for positions
    /// past the end of their line or past the last line.
    pub fn lsp_pos_to_char(
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
                let start = doc.char_to_byte(line_start);
                let target = start.checked_add(pos.character as usize)?;
                (target <= doc.char_to_byte(line_end)).then(|| doc.byte_to_char(target))
            }
            OffsetEncoding::Utf16 => {
                let start = doc.char_to_utf16_cu(line_start);
                let target = start.checked_add(pos.character as usize)?;
                (target <= doc.char_to_utf16_cu(line_end)).then(|| doc.utf16_cu_to_char(target))
            }
            OffsetEncoding::Utf32 => {
                let target = line_start.checked_add(pos.character as usize)?;
                (target <= line_end).then_some(target)
            }
        }
    }

    /// Convert a char index in `doc` to an LSP position.
    pub fn char_to_lsp_pos(
        doc: &Rope,
        char_idx: usize,
        offset_encoding: OffsetEncoding,
    ) -> lsp::Position {
        let char_idx = char_idx.min(doc.len_chars());
        let line = doc.char_to_line(char_idx);
        let line_start = doc.line_to_char(line);

        let character = match offset_encoding {
            OffsetEncoding::Utf8 => doc.char_to_byte(char_idx) - doc.char_to_byte(line_start),
            OffsetEncoding::Utf16 => {
                doc.char_to_utf16_cu(char_idx) - doc.char_to_utf16_cu(line_start)
            }
            OffsetEncoding::Utf32 => char_idx - line_start,
        };

        lsp::Position::new(line as u32, character as u32)
    }

    pub fn chars_to_lsp_range(
        doc: &Rope,
        start_char: usize,
        end_char: usize,
        offset_encoding: OffsetEncoding,
    ) -> lsp::Range {
        lsp::Range::new(
            char_to_lsp_pos(doc, start_char, offset_encoding),
            char_to_lsp_pos(doc, end_char, offset_encoding),
        )
    }

}
