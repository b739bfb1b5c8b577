//! The ledger of per-document snapshots the server is synchronized against.

use crate::{lsp, util, Error, OffsetEncoding, Result};
use ropey::Rope;
use std::collections::HashMap;

/// The committed view of one open document: the exact text and version the
/// server holds after the last notification we emitted for it.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub uri: lsp::Url,
    pub version: i32,
    pub text: Rope,
}

/// One snapshot per open uri.
#[derive(Debug)]
pub(crate) struct SnapshotLedger {
    docs: HashMap<lsp::Url, DocumentSnapshot>,
    max_documents: usize,
    max_uri_bytes: usize,
}

impl SnapshotLedger {
    pub fn new(max_documents: usize, max_uri_bytes: usize) -> Self {
        Self {
            docs: HashMap::new(),
            max_documents,
            max_uri_bytes,
        }
    }

    pub fn get(&self, uri: &lsp::Url) -> Option<&DocumentSnapshot> {
        self.docs.get(uri)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Create (or reset) the snapshot for `uri` at version 0.
    pub fn open(&mut self, uri: lsp::Url, text: &str) -> Result<i32> {
        if uri.as_str().len() > self.max_uri_bytes {
            return Err(Error::ResourceExhausted("uri length"));
        }
        if !self.docs.contains_key(&uri) && self.docs.len() >= self.max_documents {
            return Err(Error::ResourceExhausted("open document"));
        }
        let version = 0;
        self.docs.insert(
            uri.clone(),
            DocumentSnapshot {
                uri,
                version,
                text: Rope::from_str(text),
            },
        );
        Ok(version)
    }

    /// Replay `changes` in order against the snapshot text and step the
    /// version. The snapshot is only updated when every change applies.
    pub fn apply(
        &mut self,
        uri: &lsp::Url,
        changes: &[lsp::TextDocumentContentChangeEvent],
        encoding: OffsetEncoding,
    ) -> Result<i32> {
        let doc = self
            .docs
            .get_mut(uri)
            .ok_or_else(|| Error::NotOpen(uri.clone()))?;

        // replay on a scratch rope so a rejected change cannot leave the
        // snapshot half-edited (rope clones share their chunks)
        let mut text = doc.text.clone();
        for change in changes {
            apply_content_change(&mut text, change, encoding)?;
        }
        doc.text = text;
        doc.version += 1;
        Ok(doc.version)
    }

    pub fn close(&mut self, uri: &lsp::Url) -> Result<DocumentSnapshot> {
        self.docs
            .remove(uri)
            .ok_or_else(|| Error::NotOpen(uri.clone()))
    }
}

/// Splice one LSP content change into `text`. A change without a range
/// replaces the whole document.
fn apply_content_change(
    text: &mut Rope,
    change: &lsp::TextDocumentContentChangeEvent,
    encoding: OffsetEncoding,
) -> Result<()> {
    match change.range {
        Some(range) => {
            let start = util::lsp_pos_to_char(text, range.start, encoding).ok_or(
                Error::InvalidPosition {
                    line: range.start.line,
                    character: range.start.character,
                },
            )?;
            let end =
                util::lsp_pos_to_char(text, range.end, encoding).ok_or(Error::InvalidPosition {
                    line: range.end.line,
                    character: range.end.character,
                })?;
            if start > end {
                return Err(Error::InvalidPosition {
                    line: range.end.line,
                    character: range.end.character,
                });
            }
            text.remove(start..end);
            text.insert(start, &change.text);
        }
        None => *text = Rope::from_str(&change.text),
    }
    Ok(())
}
