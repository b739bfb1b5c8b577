//! `Content-Length` framing over the duplex byte stream to the server.
//!
//! One reader task decodes inbound frames and either resolves a pending
//! request or forwards a server-initiated call to the client's dispatcher.
//! One writer task serializes outbound payloads in channel order, which is
//! what makes program order wire order.

use crate::client::ServerState;
use crate::{jsonrpc, Error, Result};
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    BufWriter,
};
use tokio::sync::mpsc::{unbounded_channel, Sender, UnboundedReceiver, UnboundedSender};

/// Outbound wire traffic. The writer task serializes payloads in the order
/// they were enqueued.
#[derive(Debug)]
pub(crate) enum Payload {
    Request(jsonrpc::MethodCall),
    Notification(jsonrpc::Notification),
    Response(jsonrpc::Output),
}

/// A type representing all possible values sent from the server to the client.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
enum ServerMessage {
    /// A response to one of our requests.
    Output(jsonrpc::Output),
    /// A server-initiated request or notification.
    Call(jsonrpc::Call),
}

/// Inbound framing limits. Exceeding either is fatal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameLimits {
    pub max_frame_bytes: usize,
    pub max_header_bytes: usize,
}

#[derive(Debug)]
struct PendingRequest {
    method: &'static str,
    chan: Sender<Result<Value>>,
    cancelled: bool,
    #[allow(dead_code)]
    issued_at: Instant,
}

/// Table of in-flight requests, shared between the client (which files and
/// cancels entries) and the reader task (which resolves them).
#[derive(Debug)]
pub(crate) struct PendingRequests {
    limit: usize,
    entries: Mutex<HashMap<u64, PendingRequest>>,
}

impl PendingRequests {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: u64, method: &'static str, chan: Sender<Result<Value>>) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.limit {
            return Err(Error::ResourceExhausted("pending request"));
        }
        let previous = entries.insert(
            id,
            PendingRequest {
                method,
                chan,
                cancelled: false,
                issued_at: Instant::now(),
            },
        );
        debug_assert!(previous.is_none(), "request ids are unique");
        Ok(())
    }

    /// Mark `id` cancelled and wake its waiter with [`Error::Cancelled`].
    /// Returns `false` when the request is unknown or already cancelled,
    /// which makes double-cancel a no-op.
    pub fn cancel(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if !entry.cancelled => {
                entry.cancelled = true;
                let _ = entry.chan.try_send(Err(Error::Cancelled));
                true
            }
            _ => false,
        }
    }

    /// Deliver a response to the request's waiter. Responses to cancelled
    /// requests are swallowed: their waiter has already observed `Cancelled`.
    pub fn resolve(&self, id: u64, result: Result<Value>) {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) if entry.cancelled => {
                info!("dropping response to cancelled request {id} ({})", entry.method);
            }
            Some(entry) => {
                if entry.chan.try_send(result).is_err() {
                    warn!(
                        "response to request {id} ({}) arrived after the caller went away",
                        entry.method
                    );
                }
            }
            None => warn!("received response to unknown request {id}"),
        }
    }

    /// Resolve every outstanding request with a transport failure.
    pub fn fail_all(&self, reason: &str) {
        for (_, entry) in self.entries.lock().drain() {
            if !entry.cancelled {
                let _ = entry.chan.try_send(Err(Error::Transport(reason.to_string())));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub(crate) struct Transport {
    pending: Arc<PendingRequests>,
    state: Arc<Mutex<ServerState>>,
    limits: FrameLimits,
}

impl Transport {
    pub fn start<I, O>(
        input: I,
        output: O,
        pending: Arc<PendingRequests>,
        state: Arc<Mutex<ServerState>>,
        limits: FrameLimits,
    ) -> (UnboundedReceiver<jsonrpc::Call>, UnboundedSender<Payload>)
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
    {
        let (calls_tx, calls_rx) = unbounded_channel();
        let (payload_tx, payload_rx) = unbounded_channel();

        let transport = Arc::new(Self {
            pending,
            state,
            limits,
        });

        tokio::spawn(Self::recv(
            transport.clone(),
            BufReader::new(input),
            calls_tx,
        ));
        tokio::spawn(Self::send(transport, BufWriter::new(output), payload_rx));

        (calls_rx, payload_tx)
    }

    async fn recv_server_message(
        reader: &mut (impl AsyncBufRead + Unpin + Send),
        buffer: &mut String,
        limits: FrameLimits,
    ) -> Result<ServerMessage> {
        let mut content_length = None;
        loop {
            buffer.clear();
            let read = reader
                .read_line(buffer)
                .await
                .map_err(|err| Error::Transport(err.to_string()))?;
            if read == 0 {
                return Err(Error::Transport("server closed the stream".into()));
            }
            if buffer.len() > limits.max_header_bytes {
                return Err(Error::Transport("oversized frame header".into()));
            }
            let header = buffer.trim_end();

            if header.is_empty() {
                break;
            }

            match header.split_once(": ") {
                Some(("Content-Length", value)) => {
                    content_length = Some(value.parse::<usize>().map_err(|_| {
                        Error::Transport(format!("invalid content length {value:?}"))
                    })?);
                }
                // other headers are tolerated but carry nothing we need
                Some((_, _)) => {}
                None => {
                    return Err(Error::Transport(format!("malformed frame header {header:?}")));
                }
            }
        }

        let content_length = content_length
            .ok_or_else(|| Error::Transport("missing Content-Length header".into()))?;
        if content_length > limits.max_frame_bytes {
            return Err(Error::Transport(format!(
                "frame of {content_length} bytes exceeds the frame limit"
            )));
        }

        let mut content = vec![0; content_length];
        reader
            .read_exact(&mut content)
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;

        // the frame is correctly delimited from here on: a body we cannot
        // make sense of is a protocol fault, not a stream failure
        let msg = std::str::from_utf8(&content)
            .map_err(|_| Error::Protocol("frame body is not valid utf-8".into()))?;

        info!("<- {}", msg);

        serde_json::from_str(msg)
            .map_err(|err| Error::Protocol(format!("malformed json-rpc envelope: {err}")))
    }

    async fn send_payload(
        writer: &mut (impl AsyncWrite + Unpin + Send),
        payload: Payload,
    ) -> Result<()> {
        let json = match payload {
            Payload::Request(request) => serde_json::to_string(&request)?,
            Payload::Notification(notification) => serde_json::to_string(&notification)?,
            Payload::Response(output) => serde_json::to_string(&output)?,
        };

        info!("-> {}", json);

        writer
            .write_all(format!("Content-Length: {}\r\n\r\n", json.len()).as_bytes())
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;
        Ok(())
    }

    fn process_server_message(
        &self,
        calls_tx: &UnboundedSender<jsonrpc::Call>,
        msg: ServerMessage,
    ) {
        match msg {
            ServerMessage::Output(output) => self.process_response(output),
            ServerMessage::Call(call) => {
                if calls_tx.send(call).is_err() {
                    warn!("dropping server call: dispatcher is gone");
                }
            }
        }
    }

    fn process_response(&self, output: jsonrpc::Output) {
        let (id, result) = match output {
            jsonrpc::Output::Success(jsonrpc::Success { id, result, .. }) => (id, Ok(result)),
            jsonrpc::Output::Failure(jsonrpc::Failure { id, error, .. }) => {
                error!("<- {}", error);
                (id, Err(Error::Rpc(error)))
            }
        };
        match id {
            jsonrpc::Id::Num(id) => self.pending.resolve(id, result),
            // we only ever issue numeric ids, so nothing can be waiting
            other => error!("received response with unexpected id {other:?}"),
        }
    }

    async fn recv(
        transport: Arc<Self>,
        mut reader: BufReader<impl AsyncRead + Unpin + Send>,
        calls_tx: UnboundedSender<jsonrpc::Call>,
    ) {
        let mut buffer = String::new();
        loop {
            match Self::recv_server_message(&mut reader, &mut buffer, transport.limits).await {
                Ok(msg) => transport.process_server_message(&calls_tx, msg),
                // a well-framed body we could not decode; drop the frame and
                // keep reading
                Err(err @ Error::Protocol(_)) => error!("<- {err}"),
                Err(err) => {
                    transport.hang_up(err);
                    break;
                }
            }
        }
    }

    async fn send(
        transport: Arc<Self>,
        mut writer: BufWriter<impl AsyncWrite + Unpin + Send>,
        mut payload_rx: UnboundedReceiver<Payload>,
    ) {
        while let Some(payload) = payload_rx.recv().await {
            if let Err(err) = Self::send_payload(&mut writer, payload).await {
                transport.hang_up(err);
                break;
            }
        }
    }

    /// Mark the server dead and fan the failure out to every waiter.
    fn hang_up(&self, err: Error) {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::ShuttingDown | ServerState::Terminated => {
                    // the stream going quiet during teardown is expected
                    info!("transport closed during shutdown: {err}");
                }
                _ => {
                    error!("transport failed: {err}");
                    *state = ServerState::Failed;
                }
            }
        }
        self.pending.fail_all(&err.to_string());
    }
}
