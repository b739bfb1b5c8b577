//! Pluggable completion sources and the chunk stream they produce.

use futures_util::stream::{self, BoxStream, StreamExt};
use lamina_core::{Position, Rope};
use lamina_lsp::{lsp, util, Client, Result};
use log::debug;
use std::sync::Arc;

/// A pull-based stream of completion text chunks.
///
/// The stream is cold: nothing happens until the caller asks for a chunk.
/// The end of the stream is the end marker. Cancelling abandons the run and
/// cancels the underlying request, if there is one.
pub struct CompletionStream {
    chunks: BoxStream<'static, Result<String>>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl CompletionStream {
    pub fn new(
        chunks: BoxStream<'static, Result<String>>,
        cancel: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self { chunks, cancel }
    }

    pub fn empty() -> Self {
        Self {
            chunks: stream::empty().boxed(),
            cancel: None,
        }
    }

    /// The next chunk of completion text, or `None` once the run is over.
    pub async fn next_chunk(&mut self) -> Option<Result<String>> {
        self.chunks.next().await
    }

    /// Abandon the run. Undelivered chunks are dropped.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.chunks = stream::empty().boxed();
    }
}

impl std::fmt::Debug for CompletionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionStream")
            .field("cancellable", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

/// A provider of completion chunks, pluggable into an editor session.
///
/// Providers see the buffer only through the call arguments; they hold no
/// reference back into the session.
pub trait CompletionSource: Send {
    fn complete(&mut self, text: &Rope, cursor: Position) -> CompletionStream;
}

/// A source that never produces anything.
#[derive(Debug, Default)]
pub struct NoopCompletionSource;

impl CompletionSource for NoopCompletionSource {
    fn complete(&mut self, _text: &Rope, _cursor: Position) -> CompletionStream {
        CompletionStream::empty()
    }
}

/// Completion backed by a language server: one request, one chunk per
/// completion item.
pub struct LspCompletionSource {
    client: Arc<Client>,
    uri: lsp::Url,
}

impl LspCompletionSource {
    pub fn new(client: Arc<Client>, uri: lsp::Url) -> Self {
        Self { client, uri }
    }
}

impl CompletionSource for LspCompletionSource {
    fn complete(&mut self, text: &Rope, cursor: Position) -> CompletionStream {
        lsp_completion_stream(&self.client, &self.uri, text, cursor)
    }
}

/// Build the chunk stream for an LSP completion request at `cursor`.
pub(crate) fn lsp_completion_stream(
    client: &Arc<Client>,
    uri: &lsp::Url,
    text: &Rope,
    cursor: Position,
) -> CompletionStream {
    if cursor.row >= text.len_lines() {
        return CompletionStream::empty();
    }
    let line_start = text.line_to_char(cursor.row);
    let char_idx = (line_start + cursor.col).min(text.len_chars());
    let position = util::char_to_lsp_pos(text, char_idx, client.offset_encoding());

    let text_document = lsp::TextDocumentIdentifier { uri: uri.clone() };
    match client.completion(text_document, position, None) {
        Some((id, request)) => {
            let cancel_client = Arc::clone(client);
            let chunks = stream::once(request)
                .flat_map(|response| match response {
                    Ok(Some(response)) => stream::iter(completion_chunks(response)).boxed(),
                    Ok(None) => stream::empty().boxed(),
                    Err(err) => stream::iter(vec![Err(err)]).boxed(),
                })
                .boxed();
            let cancel = Box::new(move || {
                if let Err(err) = cancel_client.cancel(id) {
                    debug!("failed to cancel completion request {id}: {err}");
                }
            });
            CompletionStream::new(chunks, Some(cancel))
        }
        None => CompletionStream::empty(),
    }
}

fn completion_chunks(response: lsp::CompletionResponse) -> Vec<Result<String>> {
    let items = match response {
        lsp::CompletionResponse::Array(items) => items,
        lsp::CompletionResponse::List(list) => list.items,
    };
    items
        .into_iter()
        .map(|item| Ok(item.insert_text.unwrap_or(item.label)))
        .collect()
}
