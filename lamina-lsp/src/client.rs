//! The language server client: request lifecycle, document synchronization,
//! and the typed surface over the protocol methods the editor drives.

use crate::{
    jsonrpc, lsp,
    snapshot::{DocumentSnapshot, SnapshotLedger},
    transport::{FrameLimits, Payload, PendingRequests, Transport},
    Error, OffsetEncoding, Result,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{channel, Receiver, UnboundedReceiver, UnboundedSender};

/// Callback invoked after a `textDocument/publishDiagnostics` notification
/// has been applied to the store.
pub type DiagnosticsSink = Box<dyn Fn(&lsp::Url, &[lsp::Diagnostic]) + Send + Sync>;

/// Lifecycle of the connection to one language server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// The transport is up but `initialize` has not completed.
    Spawned,
    /// Initialized; the full request surface is available.
    Ready,
    /// `shutdown` was issued; only `exit` may follow.
    ShuttingDown,
    /// `exit` was sent.
    Terminated,
    /// The transport failed. Every call fails with `ServerNotReady` until
    /// the session is reconstructed.
    Failed,
}

/// Client tunables. The defaults are the documented limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientConfig {
    /// Seconds a request may stay unanswered before it is cancelled.
    pub timeout_secs: u64,
    pub max_pending_requests: usize,
    pub max_open_documents: usize,
    pub max_diagnostics_per_document: usize,
    pub max_frame_bytes: usize,
    pub max_header_bytes: usize,
    pub max_uri_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_pending_requests: 100,
            max_open_documents: 1000,
            max_diagnostics_per_document: 1000,
            max_frame_bytes: 10 * 1024 * 1024,
            max_header_bytes: 1024,
            max_uri_bytes: 4096,
        }
    }
}

pub struct Client {
    server_tx: UnboundedSender<Payload>,
    request_counter: AtomicU64,
    state: Arc<Mutex<ServerState>>,
    pending: Arc<PendingRequests>,
    capabilities: OnceLock<lsp::ServerCapabilities>,
    snapshots: Mutex<SnapshotLedger>,
    diagnostics: Mutex<HashMap<lsp::Url, Vec<lsp::Diagnostic>>>,
    diagnostics_sink: Option<DiagnosticsSink>,
    config: ClientConfig,
}

impl Client {
    /// Start a client over the duplex byte stream to a language server,
    /// typically the stdout/stdin pair of a spawned server process. Tests
    /// pass an in-memory loopback.
    pub fn start<I, O>(
        input: I,
        output: O,
        config: ClientConfig,
        diagnostics_sink: Option<DiagnosticsSink>,
    ) -> Arc<Self>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(PendingRequests::new(config.max_pending_requests));
        let state = Arc::new(Mutex::new(ServerState::Spawned));
        let limits = FrameLimits {
            max_frame_bytes: config.max_frame_bytes,
            max_header_bytes: config.max_header_bytes,
        };
        let (server_rx, server_tx) =
            Transport::start(input, output, pending.clone(), state.clone(), limits);

        let client = Arc::new(Self {
            server_tx,
            request_counter: AtomicU64::new(0),
            state,
            pending,
            capabilities: OnceLock::new(),
            snapshots: Mutex::new(SnapshotLedger::new(
                config.max_open_documents,
                config.max_uri_bytes,
            )),
            diagnostics: Mutex::new(HashMap::new()),
            diagnostics_sink,
            config,
        });

        tokio::spawn(Self::dispatch(client.clone(), server_rx));

        client
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.capabilities.get().is_some()
    }

    pub fn capabilities(&self) -> Option<&lsp::ServerCapabilities> {
        self.capabilities.get()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// The snapshot the server currently holds for `uri`, if it is open.
    pub fn snapshot(&self, uri: &lsp::Url) -> Option<DocumentSnapshot> {
        self.snapshots.lock().get(uri).cloned()
    }

    /// The last published diagnostics for `uri`.
    pub fn diagnostics(&self, uri: &lsp::Url) -> Vec<lsp::Diagnostic> {
        self.diagnostics.lock().get(uri).cloned().unwrap_or_default()
    }

    /// Offset encoding negotiated with the server. UTF-16 until the server
    /// picks one of the encodings we advertised.
    pub fn offset_encoding(&self) -> OffsetEncoding {
        self.capabilities
            .get()
            .and_then(|caps| caps.position_encoding.as_ref())
            .and_then(|encoding| match encoding.as_str() {
                "utf-8" => Some(OffsetEncoding::Utf8),
                "utf-16" => Some(OffsetEncoding::Utf16),
                "utf-32" => Some(OffsetEncoding::Utf32),
                other => {
                    warn!("server selected unsupported position encoding {other:?}");
                    None
                }
            })
            .unwrap_or_default()
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ServerState::Ready => Ok(()),
            _ => Err(Error::ServerNotReady),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Capability gate for the typed surface. Before `initialize` completes
    /// there is nothing to consult and the lifecycle gate rejects the call
    /// instead.
    fn supports(&self, supported: impl FnOnce(&lsp::ServerCapabilities) -> bool) -> bool {
        self.capabilities.get().map_or(true, supported)
    }

    // -------------------------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------------------------

    /// Execute an RPC request on the language server.
    fn call<R: lsp::request::Request>(
        &self,
        params: R::Params,
    ) -> impl Future<Output = Result<R::Result>>
    where
        R::Params: serde::Serialize,
    {
        self.call_with_id::<R>(&params, true).1
    }

    fn call_unchecked<R: lsp::request::Request>(
        &self,
        params: R::Params,
    ) -> impl Future<Output = Result<R::Result>>
    where
        R::Params: serde::Serialize,
    {
        self.call_with_id::<R>(&params, false).1
    }

    /// Like [`call`](Self::call), but also hands back the request id so the
    /// caller can cancel the request while it is in flight.
    fn call_with_id<R: lsp::request::Request>(
        &self,
        params: &R::Params,
        gate: bool,
    ) -> (u64, impl Future<Output = Result<R::Result>>)
    where
        R::Params: serde::Serialize,
    {
        let id = self.next_request_id();
        // the synchronous half runs before the future is polled so that
        // request order on the wire matches call order
        let rx = self.issue(id, R::METHOD, params, gate);

        let pending = self.pending.clone();
        let server_tx = self.server_tx.clone();
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let fut = async move {
            let mut rx = rx?;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(result)) => result.and_then(|value| {
                    serde_json::from_value(value).map_err(|err| Error::Decode {
                        method: R::METHOD,
                        source: err,
                    })
                }),
                Ok(None) => Err(Error::StreamClosed),
                Err(_) => {
                    // deadline passed: cancel so a late response is dropped
                    if pending.cancel(id) {
                        let _ = server_tx.send(Payload::Notification(cancel_notification(id)));
                    }
                    Err(Error::Timeout)
                }
            }
        };
        (id, fut)
    }

    fn issue<P: serde::Serialize>(
        &self,
        id: u64,
        method: &'static str,
        params: &P,
        gate: bool,
    ) -> Result<Receiver<Result<Value>>> {
        if gate {
            self.ensure_ready()?;
        }
        let params = value_into_params(serde_json::to_value(params)?);
        let (tx, rx) = channel(1);
        self.pending.insert(id, method, tx)?;

        let request = jsonrpc::MethodCall {
            jsonrpc: Some(jsonrpc::Version::V2),
            method: method.to_string(),
            params,
            id: jsonrpc::Id::Num(id),
        };
        if self.server_tx.send(Payload::Request(request)).is_err() {
            self.pending
                .resolve(id, Err(Error::Transport("writer is gone".into())));
        }
        Ok(rx)
    }

    /// Send an RPC notification to the language server.
    fn notify<N: lsp::notification::Notification>(&self, params: N::Params, gate: bool) -> Result<()>
    where
        N::Params: serde::Serialize,
    {
        if gate {
            self.ensure_ready()?;
        }
        let notification = jsonrpc::Notification {
            jsonrpc: Some(jsonrpc::Version::V2),
            method: N::METHOD.to_string(),
            params: value_into_params(serde_json::to_value(params)?),
        };
        self.server_tx
            .send(Payload::Notification(notification))
            .map_err(|_| Error::StreamClosed)
    }

    /// Reply to a server-initiated RPC call.
    fn reply(
        &self,
        id: jsonrpc::Id,
        result: core::result::Result<Value, jsonrpc::Error>,
    ) -> Result<()> {
        use jsonrpc::{Failure, Output, Success, Version};

        let output = match result {
            Ok(result) => Output::Success(Success {
                jsonrpc: Some(Version::V2),
                result,
                id,
            }),
            Err(error) => Output::Failure(Failure {
                jsonrpc: Some(Version::V2),
                error,
                id,
            }),
        };

        self.server_tx
            .send(Payload::Response(output))
            .map_err(|_| Error::StreamClosed)
    }

    /// Cancel an in-flight request. Idempotent: the first call wins, later
    /// ones (and cancels for unknown ids) do nothing. The waiter observes
    /// `Cancelled`; a response that still arrives is dropped.
    pub fn cancel(&self, id: u64) -> Result<()> {
        if self.pending.cancel(id) {
            self.server_tx
                .send(Payload::Notification(cancel_notification(id)))
                .map_err(|_| Error::StreamClosed)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------------------------

    pub async fn initialize(&self) -> Result<lsp::InitializeResult> {
        if self.state() != ServerState::Spawned {
            return Err(Error::ServerNotReady);
        }

        #[allow(deprecated)]
        let params = lsp::InitializeParams {
            process_id: Some(std::process::id()),
            root_path: None,
            root_uri: None,
            initialization_options: None,
            capabilities: lsp::ClientCapabilities {
                workspace: Some(lsp::WorkspaceClientCapabilities {
                    apply_edit: Some(true),
                    configuration: Some(true),
                    symbol: Some(lsp::WorkspaceSymbolClientCapabilities {
                        dynamic_registration: Some(false),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                text_document: Some(lsp::TextDocumentClientCapabilities {
                    completion: Some(lsp::CompletionClientCapabilities {
                        completion_item: Some(lsp::CompletionItemCapability {
                            insert_replace_support: Some(true),
                            deprecated_support: Some(true),
                            resolve_support: Some(lsp::CompletionItemCapabilityResolveSupport {
                                properties: vec![
                                    String::from("documentation"),
                                    String::from("detail"),
                                    String::from("additionalTextEdits"),
                                ],
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    hover: Some(lsp::HoverClientCapabilities {
                        // if not specified, some servers return plaintext
                        // marked as markdown but badly formatted
                        content_format: Some(vec![lsp::MarkupKind::Markdown]),
                        ..Default::default()
                    }),
                    signature_help: Some(lsp::SignatureHelpClientCapabilities {
                        signature_information: Some(lsp::SignatureInformationSettings {
                            documentation_format: Some(vec![lsp::MarkupKind::Markdown]),
                            parameter_information: Some(lsp::ParameterInformationSettings {
                                label_offset_support: Some(true),
                            }),
                            active_parameter_support: Some(true),
                        }),
                        ..Default::default()
                    }),
                    rename: Some(lsp::RenameClientCapabilities {
                        dynamic_registration: Some(false),
                        ..Default::default()
                    }),
                    code_action: Some(lsp::CodeActionClientCapabilities {
                        code_action_literal_support: Some(lsp::CodeActionLiteralSupport {
                            code_action_kind: lsp::CodeActionKindLiteralSupport {
                                value_set: [
                                    lsp::CodeActionKind::EMPTY,
                                    lsp::CodeActionKind::QUICKFIX,
                                    lsp::CodeActionKind::REFACTOR,
                                    lsp::CodeActionKind::SOURCE,
                                ]
                                .iter()
                                .map(|kind| kind.as_str().to_string())
                                .collect(),
                            },
                        }),
                        is_preferred_support: Some(true),
                        ..Default::default()
                    }),
                    publish_diagnostics: Some(lsp::PublishDiagnosticsClientCapabilities {
                        version_support: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                window: Some(lsp::WindowClientCapabilities {
                    work_done_progress: Some(true),
                    ..Default::default()
                }),
                general: Some(lsp::GeneralClientCapabilities {
                    position_encodings: Some(vec![
                        lsp::PositionEncodingKind::UTF8,
                        lsp::PositionEncodingKind::UTF32,
                        lsp::PositionEncodingKind::UTF16,
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            trace: None,
            workspace_folders: None,
            client_info: Some(lsp::ClientInfo {
                name: String::from("lamina"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
            locale: None,
            ..Default::default()
        };

        let result = self
            .call_unchecked::<lsp::request::Initialize>(params)
            .await?;
        let _ = self.capabilities.set(result.capabilities.clone());
        self.notify::<lsp::notification::Initialized>(lsp::InitializedParams {}, false)?;
        *self.state.lock() = ServerState::Ready;
        info!("language server initialized");
        Ok(result)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.ensure_ready()?;
        *self.state.lock() = ServerState::ShuttingDown;
        self.call_unchecked::<lsp::request::Shutdown>(()).await
    }

    pub fn exit(&self) -> Result<()> {
        *self.state.lock() = ServerState::Terminated;
        self.notify::<lsp::notification::Exit>((), false)
    }

    /// Shut the server down, returning early if it answers with an error.
    pub async fn shutdown_and_exit(&self) -> Result<()> {
        self.shutdown().await?;
        self.exit()
    }

    // -------------------------------------------------------------------------------------------
    // Workspace
    // -------------------------------------------------------------------------------------------

    pub fn did_change_configuration(&self, settings: Value) -> Result<()> {
        self.notify::<lsp::notification::DidChangeConfiguration>(
            lsp::DidChangeConfigurationParams { settings },
            true,
        )
    }

    pub fn workspace_symbols(
        &self,
        query: String,
    ) -> Option<impl Future<Output = Result<Option<lsp::WorkspaceSymbolResponse>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.workspace_symbol_provider,
                Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
            )
        }) {
            return None;
        }

        let params = lsp::WorkspaceSymbolParams {
            query,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        Some(self.call::<lsp::request::WorkspaceSymbolRequest>(params))
    }

    // -------------------------------------------------------------------------------------------
    // Text document sync
    // -------------------------------------------------------------------------------------------

    /// Open `uri` at version 0 and tell the server.
    pub fn text_document_did_open(
        &self,
        uri: lsp::Url,
        text: &str,
        language_id: &str,
    ) -> Result<i32> {
        self.ensure_ready()?;
        // the ledger lock is held across the send so that the wire sees
        // versions in strictly increasing order
        let mut snapshots = self.snapshots.lock();
        let version = snapshots.open(uri.clone(), text)?;
        self.notify::<lsp::notification::DidOpenTextDocument>(
            lsp::DidOpenTextDocumentParams {
                text_document: lsp::TextDocumentItem {
                    uri,
                    language_id: language_id.to_string(),
                    version,
                    text: text.to_string(),
                },
            },
            false,
        )?;
        Ok(version)
    }

    /// Replay `changes` onto the snapshot and emit the next-versioned
    /// `didChange`. Nothing is emitted when a change fails to apply.
    pub fn text_document_did_change(
        &self,
        uri: &lsp::Url,
        changes: Vec<lsp::TextDocumentContentChangeEvent>,
    ) -> Result<i32> {
        self.ensure_ready()?;
        let encoding = self.offset_encoding();
        let mut snapshots = self.snapshots.lock();
        let version = snapshots.apply(uri, &changes, encoding)?;
        self.notify::<lsp::notification::DidChangeTextDocument>(
            lsp::DidChangeTextDocumentParams {
                text_document: lsp::VersionedTextDocumentIdentifier {
                    uri: uri.clone(),
                    version,
                },
                content_changes: changes,
            },
            false,
        )?;
        Ok(version)
    }

    /// Drop the snapshot and cached diagnostics for `uri` and tell the
    /// server. A later `did_open` starts over at version 0.
    pub fn text_document_did_close(&self, uri: &lsp::Url) -> Result<()> {
        self.ensure_ready()?;
        self.snapshots.lock().close(uri)?;
        self.diagnostics.lock().remove(uri);
        self.notify::<lsp::notification::DidCloseTextDocument>(
            lsp::DidCloseTextDocumentParams {
                text_document: lsp::TextDocumentIdentifier { uri: uri.clone() },
            },
            false,
        )
    }

    pub fn text_document_will_save(
        &self,
        uri: &lsp::Url,
        reason: lsp::TextDocumentSaveReason,
    ) -> Result<()> {
        self.notify::<lsp::notification::WillSaveTextDocument>(
            lsp::WillSaveTextDocumentParams {
                text_document: lsp::TextDocumentIdentifier { uri: uri.clone() },
                reason,
            },
            true,
        )
    }

    pub fn text_document_will_save_wait_until(
        &self,
        uri: &lsp::Url,
        reason: lsp::TextDocumentSaveReason,
    ) -> impl Future<Output = Result<Option<Vec<lsp::TextEdit>>>> {
        self.call::<lsp::request::WillSaveWaitUntil>(lsp::WillSaveTextDocumentParams {
            text_document: lsp::TextDocumentIdentifier { uri: uri.clone() },
            reason,
        })
    }

    pub fn text_document_did_save(&self, uri: &lsp::Url) -> Result<()> {
        self.ensure_ready()?;
        let text = self
            .save_include_text()
            .then(|| {
                self.snapshots
                    .lock()
                    .get(uri)
                    .map(|snapshot| snapshot.text.to_string())
            })
            .flatten();
        self.notify::<lsp::notification::DidSaveTextDocument>(
            lsp::DidSaveTextDocumentParams {
                text_document: lsp::TextDocumentIdentifier { uri: uri.clone() },
                text,
            },
            false,
        )
    }

    fn save_include_text(&self) -> bool {
        match self
            .capabilities
            .get()
            .and_then(|caps| caps.text_document_sync.as_ref())
        {
            Some(lsp::TextDocumentSyncCapability::Options(lsp::TextDocumentSyncOptions {
                save: Some(options),
                ..
            })) => match options {
                lsp::TextDocumentSyncSaveOptions::SaveOptions(lsp::SaveOptions {
                    include_text,
                }) => include_text.unwrap_or(false),
                lsp::TextDocumentSyncSaveOptions::Supported(_) => false,
            },
            _ => false,
        }
    }

    // -------------------------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------------------------

    /// Request completions at `position`. The returned id can be passed to
    /// [`cancel`](Self::cancel) while the future is in flight.
    pub fn completion(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        context: Option<lsp::CompletionContext>,
    ) -> Option<(
        u64,
        impl Future<Output = Result<Option<lsp::CompletionResponse>>>,
    )> {
        if !self.supports(|caps| caps.completion_provider.is_some()) {
            return None;
        }

        let params = lsp::CompletionParams {
            text_document_position: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            context,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        Some(self.call_with_id::<lsp::request::Completion>(&params, true))
    }

    pub fn resolve_completion_item(
        &self,
        completion_item: &lsp::CompletionItem,
    ) -> impl Future<Output = Result<lsp::CompletionItem>> {
        self.call_with_id::<lsp::request::ResolveCompletionItem>(completion_item, true)
            .1
    }

    pub fn text_document_hover(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
    ) -> Option<impl Future<Output = Result<Option<lsp::Hover>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.hover_provider,
                Some(
                    lsp::HoverProviderCapability::Simple(true)
                        | lsp::HoverProviderCapability::Options(_)
                )
            )
        }) {
            return None;
        }

        let params = lsp::HoverParams {
            text_document_position_params: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            work_done_progress_params: Default::default(),
        };

        Some(self.call::<lsp::request::HoverRequest>(params))
    }

    fn goto_request<
        T: lsp::request::Request<
            Params = lsp::GotoDefinitionParams,
            Result = Option<lsp::GotoDefinitionResponse>,
        >,
    >(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
    ) -> impl Future<Output = Result<T::Result>> {
        let params = lsp::GotoDefinitionParams {
            text_document_position_params: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        self.call::<T>(params)
    }

    pub fn goto_definition(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
    ) -> Option<impl Future<Output = Result<Option<lsp::GotoDefinitionResponse>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.definition_provider,
                Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
            )
        }) {
            return None;
        }

        Some(self.goto_request::<lsp::request::GotoDefinition>(text_document, position))
    }

    pub fn goto_declaration(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
    ) -> Option<impl Future<Output = Result<Option<lsp::GotoDefinitionResponse>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.declaration_provider,
                Some(
                    lsp::DeclarationCapability::Simple(true)
                        | lsp::DeclarationCapability::RegistrationOptions(_)
                        | lsp::DeclarationCapability::Options(_)
                )
            )
        }) {
            return None;
        }

        Some(self.goto_request::<lsp::request::GotoDeclaration>(text_document, position))
    }

    pub fn goto_type_definition(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
    ) -> Option<impl Future<Output = Result<Option<lsp::GotoDefinitionResponse>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.type_definition_provider,
                Some(
                    lsp::TypeDefinitionProviderCapability::Simple(true)
                        | lsp::TypeDefinitionProviderCapability::Options(_)
                )
            )
        }) {
            return None;
        }

        Some(self.goto_request::<lsp::request::GotoTypeDefinition>(text_document, position))
    }

    pub fn goto_implementation(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
    ) -> Option<impl Future<Output = Result<Option<lsp::GotoDefinitionResponse>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.implementation_provider,
                Some(
                    lsp::ImplementationProviderCapability::Simple(true)
                        | lsp::ImplementationProviderCapability::Options(_)
                )
            )
        }) {
            return None;
        }

        Some(self.goto_request::<lsp::request::GotoImplementation>(text_document, position))
    }

    pub fn goto_reference(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        include_declaration: bool,
    ) -> Option<impl Future<Output = Result<Option<Vec<lsp::Location>>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.references_provider,
                Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
            )
        }) {
            return None;
        }

        let params = lsp::ReferenceParams {
            text_document_position: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            context: lsp::ReferenceContext {
                include_declaration,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        Some(self.call::<lsp::request::References>(params))
    }

    pub fn rename_symbol(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        new_name: String,
    ) -> Option<impl Future<Output = Result<Option<lsp::WorkspaceEdit>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.rename_provider,
                Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
            )
        }) {
            return None;
        }

        let params = lsp::RenameParams {
            text_document_position: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            new_name,
            work_done_progress_params: Default::default(),
        };

        Some(self.call::<lsp::request::Rename>(params))
    }

    pub fn prepare_rename(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
    ) -> Option<impl Future<Output = Result<Option<lsp::PrepareRenameResponse>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.rename_provider,
                Some(lsp::OneOf::Right(lsp::RenameOptions {
                    prepare_provider: Some(true),
                    ..
                }))
            )
        }) {
            return None;
        }

        let params = lsp::TextDocumentPositionParams {
            text_document,
            position,
        };

        Some(self.call::<lsp::request::PrepareRenameRequest>(params))
    }

    pub fn text_document_document_highlight(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
    ) -> Option<impl Future<Output = Result<Option<Vec<lsp::DocumentHighlight>>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.document_highlight_provider,
                Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
            )
        }) {
            return None;
        }

        let params = lsp::DocumentHighlightParams {
            text_document_position_params: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        Some(self.call::<lsp::request::DocumentHighlightRequest>(params))
    }

    pub fn command(
        &self,
        command: lsp::Command,
    ) -> Option<impl Future<Output = Result<Option<Value>>>> {
        if !self.supports(|caps| caps.execute_command_provider.is_some()) {
            return None;
        }

        let params = lsp::ExecuteCommandParams {
            command: command.command,
            arguments: command.arguments.unwrap_or_default(),
            work_done_progress_params: Default::default(),
        };

        Some(self.call::<lsp::request::ExecuteCommand>(params))
    }

    pub fn text_document_formatting(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        options: lsp::FormattingOptions,
    ) -> Option<impl Future<Output = Result<Option<Vec<lsp::TextEdit>>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.document_formatting_provider,
                Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
            )
        }) {
            return None;
        }

        let params = lsp::DocumentFormattingParams {
            text_document,
            options,
            work_done_progress_params: Default::default(),
        };

        Some(self.call::<lsp::request::Formatting>(params))
    }

    pub fn text_document_range_formatting(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        range: lsp::Range,
        options: lsp::FormattingOptions,
    ) -> Option<impl Future<Output = Result<Option<Vec<lsp::TextEdit>>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.document_range_formatting_provider,
                Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
            )
        }) {
            return None;
        }

        let params = lsp::DocumentRangeFormattingParams {
            text_document,
            range,
            options,
            work_done_progress_params: Default::default(),
        };

        Some(self.call::<lsp::request::RangeFormatting>(params))
    }

    pub fn text_document_on_type_formatting(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        ch: String,
        options: lsp::FormattingOptions,
    ) -> Option<impl Future<Output = Result<Option<Vec<lsp::TextEdit>>>>> {
        if !self.supports(|caps| caps.document_on_type_formatting_provider.is_some()) {
            return None;
        }

        let params = lsp::DocumentOnTypeFormattingParams {
            text_document_position: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            ch,
            options,
        };

        Some(self.call::<lsp::request::OnTypeFormatting>(params))
    }

    pub fn text_document_signature_help(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
    ) -> Option<impl Future<Output = Result<Option<lsp::SignatureHelp>>>> {
        if !self.supports(|caps| caps.signature_help_provider.is_some()) {
            return None;
        }

        let params = lsp::SignatureHelpParams {
            text_document_position_params: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            context: None,
            work_done_progress_params: Default::default(),
        };

        Some(self.call::<lsp::request::SignatureHelpRequest>(params))
    }

    pub fn code_actions(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        range: lsp::Range,
        context: lsp::CodeActionContext,
    ) -> Option<impl Future<Output = Result<Option<lsp::CodeActionResponse>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.code_action_provider,
                Some(
                    lsp::CodeActionProviderCapability::Simple(true)
                        | lsp::CodeActionProviderCapability::Options(_)
                )
            )
        }) {
            return None;
        }

        let params = lsp::CodeActionParams {
            text_document,
            range,
            context,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        Some(self.call::<lsp::request::CodeActionRequest>(params))
    }

    pub fn document_symbols(
        &self,
        text_document: lsp::TextDocumentIdentifier,
    ) -> Option<impl Future<Output = Result<Option<lsp::DocumentSymbolResponse>>>> {
        if !self.supports(|caps| {
            matches!(
                caps.document_symbol_provider,
                Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
            )
        }) {
            return None;
        }

        let params = lsp::DocumentSymbolParams {
            text_document,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        Some(self.call::<lsp::request::DocumentSymbolRequest>(params))
    }

    // -------------------------------------------------------------------------------------------
    // Inbound traffic
    // -------------------------------------------------------------------------------------------

    async fn dispatch(client: Arc<Self>, mut server_rx: UnboundedReceiver<jsonrpc::Call>) {
        while let Some(call) = server_rx.recv().await {
            match call {
                jsonrpc::Call::Notification(notification) => {
                    client.handle_notification(notification)
                }
                jsonrpc::Call::MethodCall(request) => client.handle_server_request(request),
                jsonrpc::Call::Invalid { id } => {
                    error!("received malformed call from server (id {id:?})");
                }
            }
        }
    }

    fn handle_notification(&self, notification: jsonrpc::Notification) {
        use lsp::notification::Notification as _;

        match notification.method.as_str() {
            lsp::notification::PublishDiagnostics::METHOD => {
                match notification.params.parse::<lsp::PublishDiagnosticsParams>() {
                    Ok(params) => self.publish_diagnostics(params),
                    Err(err) => error!("malformed publishDiagnostics params: {err}"),
                }
            }
            lsp::notification::ShowMessage::METHOD => {
                match notification.params.parse::<lsp::ShowMessageParams>() {
                    Ok(params) => warn!("window/showMessage: {}", params.message),
                    Err(err) => error!("malformed showMessage params: {err}"),
                }
            }
            lsp::notification::LogMessage::METHOD => {
                match notification.params.parse::<lsp::LogMessageParams>() {
                    Ok(params) => info!("window/logMessage: {}", params.message),
                    Err(err) => error!("malformed logMessage params: {err}"),
                }
            }
            method => debug!("ignoring {method} notification"),
        }
    }

    /// Replace the uri's diagnostics wholesale and notify the sink.
    fn publish_diagnostics(&self, params: lsp::PublishDiagnosticsParams) {
        let lsp::PublishDiagnosticsParams {
            uri,
            mut diagnostics,
            ..
        } = params;
        if diagnostics.len() > self.config.max_diagnostics_per_document {
            warn!(
                "truncating diagnostics for {uri} to {}",
                self.config.max_diagnostics_per_document
            );
            diagnostics.truncate(self.config.max_diagnostics_per_document);
        }
        self.diagnostics.lock().insert(uri.clone(), diagnostics.clone());
        if let Some(sink) = &self.diagnostics_sink {
            sink(&uri, &diagnostics);
        }
    }

    /// Server-initiated requests. Whatever we do not implement is answered
    /// with a null result so the server never blocks on us.
    fn handle_server_request(&self, request: jsonrpc::MethodCall) {
        let jsonrpc::MethodCall {
            method, params, id, ..
        } = request;

        let result = match method.as_str() {
            "window/workDoneProgress/create" => Ok(Value::Null),
            "workspace/configuration" => {
                // every requested item is answered with null: we hold no
                // server-specific settings
                let items = params
                    .parse::<lsp::ConfigurationParams>()
                    .map(|params| params.items.len())
                    .unwrap_or(0);
                Ok(Value::Array(vec![Value::Null; items]))
            }
            "client/registerCapability" | "client/unregisterCapability" => Ok(Value::Null),
            "workspace/applyEdit" => match params.parse::<lsp::ApplyWorkspaceEditParams>() {
                Ok(_) => serde_json::to_value(lsp::ApplyWorkspaceEditResponse {
                    applied: false,
                    failure_reason: Some(String::from(
                        "client does not apply server-initiated edits",
                    )),
                    failed_change: None,
                })
                .map_err(|err| jsonrpc::Error {
                    code: jsonrpc::error_codes::INTERNAL_ERROR,
                    message: err.to_string(),
                    data: None,
                }),
                Err(err) => Err(err),
            },
            method => {
                warn!("unsupported server request {method}");
                Ok(Value::Null)
            }
        };

        if let Err(err) = self.reply(id, result) {
            error!("failed to reply to server request: {err}");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn value_into_params(value: Value) -> jsonrpc::Params {
    use jsonrpc::Params;

    match value {
        Value::Null => Params::None,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => Params::Array(vec![value]),
        Value::Array(vec) => Params::Array(vec),
        Value::Object(map) => Params::Map(map),
    }
}

fn cancel_notification(id: u64) -> jsonrpc::Notification {
    use lsp::notification::Notification as _;

    let mut params = serde_json::Map::new();
    params.insert("id".to_string(), Value::from(id));
    jsonrpc::Notification {
        jsonrpc: Some(jsonrpc::Version::V2),
        method: lsp::notification::Cancel::METHOD.to_string(),
        params: jsonrpc::Params::Map(params),
    }
}
