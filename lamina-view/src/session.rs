//! The editor session: one buffer, one language server client, one cursor.
//!
//! Every edit routes through the session, which is what keeps the buffer and
//! the server's snapshot from diverging: an edit is staged on a copy of the
//! buffer (readonly gating included) and commits only once the change
//! notification to the server is out. A failure on either side leaves both
//! views exactly where they were.

use crate::completion::{lsp_completion_stream, CompletionSource, CompletionStream};
use lamina_core::{Buffer, EditError, Position, Span};
use lamina_lsp::{lsp, util, Client, ClientConfig};
use log::debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error(transparent)]
    Lsp(#[from] lamina_lsp::Error),
}

pub struct EditorSession {
    buffer: Buffer,
    client: Arc<Client>,
    uri: lsp::Url,
    cursor: Position,
    completion: Option<Box<dyn CompletionSource>>,
}

impl EditorSession {
    /// Open a session over a duplex transport to a language server: build
    /// the buffer, run the `initialize` handshake, then announce the
    /// document with `didOpen`.
    pub async fn open<I, O>(
        uri: lsp::Url,
        text: &str,
        language_id: &str,
        input: I,
        output: O,
        config: ClientConfig,
    ) -> Result<Self>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
    {
        let client = Client::start(input, output, config, None);
        client.initialize().await?;
        client.text_document_did_open(uri.clone(), text, language_id)?;
        Ok(Self {
            buffer: Buffer::from_str(text),
            client,
            uri,
            cursor: Position::default(),
            completion: None,
        })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn uri(&self) -> &lsp::Url {
        &self.uri
    }

    pub fn cursor(&self) -> Position {
        self.cursor
    }

    /// Bind a completion provider. With none bound, completion requests go
    /// to the language server.
    pub fn set_completion_source(&mut self, source: Box<dyn CompletionSource>) {
        self.completion = Some(source);
    }

    pub fn mark_readonly(&mut self, start: usize, end: usize) -> Result<()> {
        Ok(self.buffer.mark_readonly(start, end)?)
    }

    pub fn unmark_readonly(&mut self, start: usize, end: usize) -> Result<()> {
        Ok(self.buffer.unmark_readonly(start, end)?)
    }

    pub fn readonly_spans(&self) -> &[Span] {
        self.buffer.readonly_spans()
    }

    /// Insert `text` at the cursor and sync the server with the minimal
    /// ranged change. The cursor advances over the inserted text.
    pub fn insert(&mut self, text: &str) -> Result<()> {
        let offset = self.buffer.byte_at_pos(self.cursor)?;
        // the change range is in pre-edit coordinates
        let range = self.lsp_range(offset, offset);

        let mut staged = self.buffer.clone();
        staged.insert(offset, text)?;
        self.client.text_document_did_change(
            &self.uri,
            vec![lsp::TextDocumentContentChangeEvent {
                range: Some(range),
                range_length: None,
                text: text.to_string(),
            }],
        )?;
        self.buffer = staged;
        self.cursor = self.buffer.pos_at_byte(offset + text.len())?;
        Ok(())
    }

    /// Delete the text between two cursor positions and sync the server.
    /// The cursor lands at the start of the removed range.
    pub fn delete(&mut self, start: Position, end: Position) -> Result<()> {
        let start_byte = self.buffer.byte_at_pos(start)?;
        let end_byte = self.buffer.byte_at_pos(end)?;
        if start_byte > end_byte {
            return Err(EditError::OutOfBounds.into());
        }
        let range = self.lsp_range(start_byte, end_byte);

        let mut staged = self.buffer.clone();
        staged.delete(start_byte, end_byte)?;
        self.client.text_document_did_change(
            &self.uri,
            vec![lsp::TextDocumentContentChangeEvent {
                range: Some(range),
                range_length: None,
                text: String::new(),
            }],
        )?;
        self.buffer = staged;
        self.cursor = start;
        Ok(())
    }

    /// Move the cursor, validating the position against the buffer. A
    /// best-effort hover is issued at the new position; hover failures are
    /// observational and suppressed.
    pub fn move_cursor(&mut self, row: usize, col: usize) -> Result<()> {
        let position = Position::new(row, col);
        let offset = self.buffer.byte_at_pos(position)?;
        self.cursor = position;

        let char_idx = self.buffer.text().byte_to_char(offset);
        let lsp_position =
            util::char_to_lsp_pos(self.buffer.text(), char_idx, self.client.offset_encoding());
        if let Some(hover) = self
            .client
            .text_document_hover(self.text_document(), lsp_position)
        {
            tokio::spawn(async move {
                if let Err(err) = hover.await {
                    debug!("hover at cursor failed: {err}");
                }
            });
        }
        Ok(())
    }

    /// Completion at the cursor, from the bound provider or the language
    /// server.
    pub fn request_completion(&mut self) -> CompletionStream {
        if let Some(source) = self.completion.as_mut() {
            return source.complete(self.buffer.text(), self.cursor);
        }
        lsp_completion_stream(&self.client, &self.uri, self.buffer.text(), self.cursor)
    }

    /// Apply the parts of a workspace edit that target this document.
    ///
    /// Edits are resolved against the pre-edit text and applied in reverse
    /// range order so earlier edits do not shift later ones. A readonly
    /// violation anywhere aborts the batch before any mutation. The final
    /// text is synced with a single full-document change.
    pub fn apply_workspace_edit(&mut self, edit: &lsp::WorkspaceEdit) -> Result<()> {
        let edits = self.collect_edits_for_uri(edit);
        if edits.is_empty() {
            return Ok(());
        }

        let encoding = self.client.offset_encoding();
        let text = self.buffer.text();
        let mut resolved = Vec::with_capacity(edits.len());
        for edit in &edits {
            let start = util::lsp_pos_to_char(text, edit.range.start, encoding).ok_or(
                lamina_lsp::Error::InvalidPosition {
                    line: edit.range.start.line,
                    character: edit.range.start.character,
                },
            )?;
            let end = util::lsp_pos_to_char(text, edit.range.end, encoding).ok_or(
                lamina_lsp::Error::InvalidPosition {
                    line: edit.range.end.line,
                    character: edit.range.end.character,
                },
            )?;
            if start > end {
                return Err(EditError::OutOfBounds.into());
            }
            resolved.push((
                text.char_to_byte(start),
                text.char_to_byte(end),
                edit.new_text.as_str(),
            ));
        }
        resolved.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));

        // stage the whole batch; a violation anywhere aborts before either
        // the buffer or the server sees anything
        let mut staged = self.buffer.clone();
        for (start, end, new_text) in resolved {
            if start < end {
                staged.delete(start, end)?;
            }
            if !new_text.is_empty() {
                staged.insert(start, new_text)?;
            }
        }

        self.client.text_document_did_change(
            &self.uri,
            vec![lsp::TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: staged.text().to_string(),
            }],
        )?;
        self.buffer = staged;
        Ok(())
    }

    /// Announce a save: `willSave` before, `didSave` after.
    pub fn save(&self) -> Result<()> {
        self.client
            .text_document_will_save(&self.uri, lsp::TextDocumentSaveReason::MANUAL)?;
        self.client.text_document_did_save(&self.uri)?;
        Ok(())
    }

    /// Close the document and take the server down.
    pub async fn close(self) -> Result<()> {
        self.client.text_document_did_close(&self.uri)?;
        self.client.shutdown_and_exit().await?;
        Ok(())
    }

    fn text_document(&self) -> lsp::TextDocumentIdentifier {
        lsp::TextDocumentIdentifier {
            uri: self.uri.clone(),
        }
    }

    /// LSP range for `[start, end)` byte offsets over the current text, in
    /// the encoding negotiated with the server.
    fn lsp_range(&self, start: usize, end: usize) -> lsp::Range {
        let text = self.buffer.text();
        util::chars_to_lsp_range(
            text,
            text.byte_to_char(start),
            text.byte_to_char(end),
            self.client.offset_encoding(),
        )
    }

    fn collect_edits_for_uri(&self, edit: &lsp::WorkspaceEdit) -> Vec<lsp::TextEdit> {
        let mut edits = Vec::new();
        if let Some(changes) = &edit.changes {
            if let Some(for_uri) = changes.get(&self.uri) {
                edits.extend(for_uri.iter().cloned());
            }
        }
        if let Some(document_changes) = &edit.document_changes {
            let document_edits: Box<dyn Iterator<Item = &lsp::TextDocumentEdit>> =
                match document_changes {
                    lsp::DocumentChanges::Edits(edits) => Box::new(edits.iter()),
                    lsp::DocumentChanges::Operations(operations) => {
                        Box::new(operations.iter().filter_map(|operation| match operation {
                            lsp::DocumentChangeOperation::Edit(edit) => Some(edit),
                            lsp::DocumentChangeOperation::Op(_) => None,
                        }))
                    }
                };
            for document_edit in document_edits {
                if document_edit.text_document.uri != self.uri {
                    continue;
                }
                edits.extend(document_edit.edits.iter().map(|edit| match edit {
                    lsp::OneOf::Left(edit) => edit.clone(),
                    lsp::OneOf::Right(annotated) => annotated.text_edit.clone(),
                }));
            }
        }
        edits
    }
}

impl std::fmt::Debug for EditorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorSession")
            .field("uri", &self.uri.as_str())
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}
