//! Session tests against a scripted in-memory language server.

use lamina_core::{EditError, Position, Rope, Span};
use lamina_lsp::{lsp, ClientConfig};
use lamina_view::{CompletionSource, CompletionStream, EditorSession, SessionError};
use serde_json::{json, Value};
use tokio::io::{
    duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf,
    WriteHalf,
};

struct FakeServer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    async fn recv(&mut self) -> Value {
        let mut content_length = None;
        let mut line = String::new();
        loop {
            line.clear();
            self.reader.read_line(&mut line).await.unwrap();
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some(value) = header.strip_prefix("Content-Length: ") {
                content_length = Some(value.parse::<usize>().unwrap());
            }
        }
        let mut body = vec![0; content_length.unwrap()];
        self.reader.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn send(&mut self, message: Value) {
        let body = message.to_string();
        self.writer
            .write_all(format!("Content-Length: {}\r\n\r\n{}", body.len(), body).as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn respond(&mut self, id: u64, result: Value) {
        self.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await;
    }
}

/// Open a session against a fake server advertising `capabilities`,
/// consuming the whole handshake (initialize, initialized, didOpen).
async fn open_session(capabilities: Value, text: &str) -> (EditorSession, FakeServer) {
    let (client_io, server_io) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);
    let mut server = FakeServer {
        reader: BufReader::new(server_read),
        writer: server_write,
    };

    let uri = lsp::Url::parse("file:///main.rs").unwrap();
    let (session, _) = tokio::join!(
        EditorSession::open(
            uri,
            text,
            "rust",
            client_read,
            client_write,
            ClientConfig::default(),
        ),
        async {
            let request = server.recv().await;
            assert_eq!(request["method"], "initialize");
            server
                .respond(
                    request["id"].as_u64().unwrap(),
                    json!({ "capabilities": capabilities }),
                )
                .await;
            assert_eq!(server.recv().await["method"], "initialized");
            let open = server.recv().await;
            assert_eq!(open["method"], "textDocument/didOpen");
            assert_eq!(open["params"]["textDocument"]["version"], 0);
        }
    );
    (session.unwrap(), server)
}

/// The session invariant: the buffer and the server-side snapshot never
/// diverge.
fn assert_in_sync(session: &EditorSession) {
    let snapshot = session.client().snapshot(session.uri()).unwrap();
    assert_eq!(snapshot.text.to_string(), session.buffer().text().to_string());
}

#[tokio::test]
async fn insert_at_cursor_syncs_the_server() {
    let (mut session, mut server) = open_session(json!({}), "hello world").await;

    session.move_cursor(0, 5).unwrap();
    session.insert("!").unwrap();

    let frame = server.recv().await;
    assert_eq!(frame["method"], "textDocument/didChange");
    assert_eq!(frame["params"]["textDocument"]["version"], 1);
    let change = &frame["params"]["contentChanges"][0];
    assert_eq!(change["range"]["start"], json!({ "line": 0, "character": 5 }));
    assert_eq!(change["range"]["end"], json!({ "line": 0, "character": 5 }));
    assert_eq!(change["text"], "!");

    assert_eq!(session.buffer().text().to_string(), "hello! world");
    assert_eq!(session.cursor(), Position::new(0, 6));
    assert_in_sync(&session);
}

#[tokio::test]
async fn cursor_advances_over_inserted_newlines() {
    let (mut session, mut server) = open_session(json!({}), "").await;

    session.insert("fn main() {\n    \n}").unwrap();
    server.recv().await;

    assert_eq!(session.cursor(), Position::new(2, 1));
    session.move_cursor(1, 4).unwrap();
    session.insert("todo!();").unwrap();
    server.recv().await;

    assert_eq!(
        session.buffer().text().to_string(),
        "fn main() {\n    todo!();\n}"
    );
    assert_in_sync(&session);
}

#[tokio::test]
async fn readonly_violation_emits_no_change() {
    let (mut session, mut server) = open_session(json!({}), "hello world").await;
    session.mark_readonly(0, 5).unwrap();

    session.move_cursor(0, 2).unwrap();
    match session.insert("X") {
        Err(SessionError::Edit(EditError::ReadOnlyViolation)) => {}
        other => panic!("expected a readonly violation, got {other:?}"),
    }
    assert_eq!(session.buffer().text().to_string(), "hello world");

    // the next frame on the wire is the edit that succeeds, at version 1:
    // nothing was emitted for the rejected insert
    session.move_cursor(0, 5).unwrap();
    session.insert("!").unwrap();
    let frame = server.recv().await;
    assert_eq!(frame["method"], "textDocument/didChange");
    assert_eq!(frame["params"]["textDocument"]["version"], 1);
    assert_eq!(session.readonly_spans(), &[Span::new(0, 5)]);
    assert_in_sync(&session);
}

#[tokio::test]
async fn delete_range_syncs_the_server() {
    let (mut session, mut server) = open_session(json!({}), "hello cruel world").await;

    session
        .delete(Position::new(0, 5), Position::new(0, 11))
        .unwrap();

    let frame = server.recv().await;
    let change = &frame["params"]["contentChanges"][0];
    assert_eq!(change["text"], "");
    assert_eq!(change["range"]["start"]["character"], 5);
    assert_eq!(change["range"]["end"]["character"], 11);

    assert_eq!(session.buffer().text().to_string(), "hello world");
    assert_eq!(session.cursor(), Position::new(0, 5));
    assert_in_sync(&session);
}

#[tokio::test]
async fn move_cursor_rejects_invalid_positions() {
    let (mut session, _server) = open_session(json!({}), "ab\ncd").await;

    assert!(session.move_cursor(0, 3).is_err());
    assert!(session.move_cursor(2, 0).is_err());
    assert_eq!(session.cursor(), Position::new(0, 0));

    session.move_cursor(1, 2).unwrap();
    assert_eq!(session.cursor(), Position::new(1, 2));
}

#[tokio::test]
async fn move_cursor_issues_best_effort_hover() {
    let (mut session, mut server) =
        open_session(json!({ "hoverProvider": true }), "hello").await;

    session.move_cursor(0, 3).unwrap();
    let frame = server.recv().await;
    assert_eq!(frame["method"], "textDocument/hover");
    assert_eq!(frame["params"]["position"]["character"], 3);

    // a hover error must not disturb the session
    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": frame["id"],
            "error": { "code": -32603, "message": "no hover here" }
        }))
        .await;
    session.insert("!").unwrap();
    let frame = server.recv().await;
    assert_eq!(frame["method"], "textDocument/didChange");
}

#[tokio::test]
async fn lsp_completion_streams_items() {
    let (mut session, mut server) =
        open_session(json!({ "completionProvider": {} }), "pri").await;

    session.move_cursor(0, 3).unwrap();
    let mut stream = session.request_completion();

    let request = server.recv().await;
    assert_eq!(request["method"], "textDocument/completion");
    server
        .respond(
            request["id"].as_u64().unwrap(),
            json!([
                { "label": "print!", "insertText": "print!($0)" },
                { "label": "println!" }
            ]),
        )
        .await;

    let first = stream.next_chunk().await.unwrap().unwrap();
    assert_eq!(first, "print!($0)");
    let second = stream.next_chunk().await.unwrap().unwrap();
    assert_eq!(second, "println!");
    assert!(stream.next_chunk().await.is_none(), "stream ends after the last item");
}

#[tokio::test]
async fn cancelling_the_stream_cancels_the_request() {
    let (mut session, mut server) =
        open_session(json!({ "completionProvider": {} }), "pri").await;

    let mut stream = session.request_completion();
    let request = server.recv().await;
    assert_eq!(request["method"], "textDocument/completion");

    stream.cancel();
    let frame = server.recv().await;
    assert_eq!(frame["method"], "$/cancelRequest");
    assert_eq!(frame["params"]["id"], request["id"]);
    assert!(stream.next_chunk().await.is_none());
}

/// Recording provider used to prove the session prefers a bound source.
struct ScriptedSource {
    chunks: Vec<&'static str>,
    calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl CompletionSource for ScriptedSource {
    fn complete(&mut self, text: &Rope, cursor: Position) -> CompletionStream {
        assert_eq!(text.to_string(), "pri");
        assert_eq!(cursor, Position::new(0, 3));
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let chunks = self.chunks.clone();
        CompletionStream::new(
            Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(|chunk| Ok(chunk.to_string())),
            )),
            None,
        )
    }
}

#[tokio::test]
async fn bound_completion_source_bypasses_the_server() {
    let (mut session, _server) =
        open_session(json!({ "completionProvider": {} }), "pri").await;

    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    session.set_completion_source(Box::new(ScriptedSource {
        chunks: vec!["printable", "printer"],
        calls: calls.clone(),
    }));

    session.move_cursor(0, 3).unwrap();
    let mut stream = session.request_completion();
    assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "printable");
    assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "printer");
    assert!(stream.next_chunk().await.is_none());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn workspace_edit_applies_in_reverse_order() {
    let (mut session, mut server) = open_session(json!({}), "let a = 1;\nlet b = 2;").await;

    let uri = session.uri().clone();
    let edit = lsp::WorkspaceEdit {
        changes: Some(
            [(
                uri,
                vec![
                    lsp::TextEdit {
                        range: lsp::Range::new(
                            lsp::Position::new(0, 4),
                            lsp::Position::new(0, 5),
                        ),
                        new_text: "alpha".to_string(),
                    },
                    lsp::TextEdit {
                        range: lsp::Range::new(
                            lsp::Position::new(1, 4),
                            lsp::Position::new(1, 5),
                        ),
                        new_text: "beta".to_string(),
                    },
                ],
            )]
            .into_iter()
            .collect(),
        ),
        ..Default::default()
    };
    session.apply_workspace_edit(&edit).unwrap();

    assert_eq!(
        session.buffer().text().to_string(),
        "let alpha = 1;\nlet beta = 2;"
    );

    // a single full-document change carries the final text
    let frame = server.recv().await;
    assert_eq!(frame["method"], "textDocument/didChange");
    let change = &frame["params"]["contentChanges"][0];
    assert!(change["range"].is_null());
    assert_eq!(change["text"], "let alpha = 1;\nlet beta = 2;");
    assert_in_sync(&session);
}

#[tokio::test]
async fn workspace_edit_respects_readonly_spans() {
    let (mut session, _server) = open_session(json!({}), "keep this safe").await;
    session.mark_readonly(0, 4).unwrap();

    let uri = session.uri().clone();
    let edit = lsp::WorkspaceEdit {
        changes: Some(
            [(
                uri,
                vec![
                    // touches the interior of the readonly span
                    lsp::TextEdit {
                        range: lsp::Range::new(
                            lsp::Position::new(0, 2),
                            lsp::Position::new(0, 6),
                        ),
                        new_text: "nope".to_string(),
                    },
                    lsp::TextEdit {
                        range: lsp::Range::new(
                            lsp::Position::new(0, 10),
                            lsp::Position::new(0, 14),
                        ),
                        new_text: "sound".to_string(),
                    },
                ],
            )]
            .into_iter()
            .collect(),
        ),
        ..Default::default()
    };

    match session.apply_workspace_edit(&edit) {
        Err(SessionError::Edit(EditError::ReadOnlyViolation)) => {}
        other => panic!("expected a readonly violation, got {other:?}"),
    }
    // the batch aborted before any mutation
    assert_eq!(session.buffer().text().to_string(), "keep this safe");
    assert_in_sync(&session);
}

#[tokio::test]
async fn save_emits_will_save_then_did_save() {
    let (session, mut server) = open_session(json!({}), "data").await;

    session.save().unwrap();
    let frame = server.recv().await;
    assert_eq!(frame["method"], "textDocument/willSave");
    assert_eq!(frame["params"]["reason"], 1);
    let frame = server.recv().await;
    assert_eq!(frame["method"], "textDocument/didSave");
}

#[tokio::test]
async fn close_walks_the_shutdown_sequence() {
    let (session, mut server) = open_session(json!({}), "bye").await;

    let (result, _) = tokio::join!(session.close(), async {
        let frame = server.recv().await;
        assert_eq!(frame["method"], "textDocument/didClose");
        let request = server.recv().await;
        assert_eq!(request["method"], "shutdown");
        server
            .respond(request["id"].as_u64().unwrap(), json!(null))
            .await;
        let frame = server.recv().await;
        assert_eq!(frame["method"], "exit");
    });
    result.unwrap();
}
