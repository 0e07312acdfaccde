use crate::{jsonrpc, Error, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
        BufWriter,
    },
    process::{ChildStderr, ChildStdin, ChildStdout},
    sync::{
        mpsc::{unbounded_channel, Sender, UnboundedReceiver, UnboundedSender},
        watch, Mutex,
    },
    task::JoinHandle,
};

/// How long [`TransportTasks::shutdown`] waits for the read/write loops to
/// wind down before abandoning them.
const LOOP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Payload {
    Request {
        chan: Sender<Result<Value>>,
        value: jsonrpc::MethodCall,
    },
    Notification(jsonrpc::Notification),
    Response(jsonrpc::Output),
}

/// A type representing all possible values sent from the server to the client.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
enum ServerMessage {
    /// A regular JSON-RPC request output (single response).
    Output(jsonrpc::Output),
    /// A JSON-RPC request or notification.
    Call(jsonrpc::Call),
}

/// Shared state of the wire: the pending-request table plus the identity used
/// in log lines. The read/write/stderr loops all hold an `Arc` of this.
#[derive(Debug)]
pub struct Transport {
    name: String,
    trace: bool,
    pending_requests: Mutex<HashMap<jsonrpc::Id, Sender<Result<Value>>>>,
}

/// Handles to the three spawned loops plus the stop signal that lets the
/// session halt them without racing the child's exit.
pub struct TransportTasks {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    transport: Arc<Transport>,
}

impl TransportTasks {
    /// Signal the loops to stop and wait for them with a bounded timeout;
    /// loops that fail to wind down in time are aborted. Either way the
    /// child's stdin ends up closed (the writer is dropped with its task)
    /// and every outstanding request is failed.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);

        let joined = futures_util::future::join_all(self.handles.iter_mut());
        if tokio::time::timeout(LOOP_SHUTDOWN_TIMEOUT, joined)
            .await
            .is_err()
        {
            warn!(
                "{}: transport loops did not stop within {:?}, abandoning them",
                self.transport.name, LOOP_SHUTDOWN_TIMEOUT
            );
            for handle in &self.handles {
                handle.abort();
            }
        }

        self.transport.fail_pending(|| Error::ShuttingDown).await;
    }
}

impl Transport {
    pub fn start(
        server_stdout: BufReader<ChildStdout>,
        server_stdin: BufWriter<ChildStdin>,
        server_stderr: BufReader<ChildStderr>,
        name: String,
        trace: bool,
    ) -> (
        UnboundedReceiver<jsonrpc::Call>,
        UnboundedSender<Payload>,
        Arc<Transport>,
        TransportTasks,
    ) {
        let (client_tx, rx) = unbounded_channel();
        let (tx, client_rx) = unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let transport = Arc::new(Self {
            name,
            trace,
            pending_requests: Mutex::new(HashMap::default()),
        });

        let handles = vec![
            tokio::spawn(Self::recv(
                transport.clone(),
                server_stdout,
                client_tx,
                stop_rx.clone(),
            )),
            tokio::spawn(Self::err(transport.clone(), server_stderr, stop_rx.clone())),
            tokio::spawn(Self::send(
                transport.clone(),
                server_stdin,
                client_rx,
                stop_rx,
            )),
        ];

        let tasks = TransportTasks {
            stop: stop_tx,
            handles,
            transport: transport.clone(),
        };

        (rx, tx, transport, tasks)
    }

    /// Drop the pending entry for `id`, if any. Used when the caller stops
    /// waiting (timeout) so the table does not accumulate dead slots.
    pub(crate) async fn forget_request(&self, id: &jsonrpc::Id) {
        self.pending_requests.lock().await.remove(id);
    }

    /// Fail every outstanding request with a fresh error from `err`.
    async fn fail_pending(&self, err: impl Fn() -> Error) {
        for (id, tx) in self.pending_requests.lock().await.drain() {
            if tx.send(Err(err())).await.is_err() {
                debug!(
                    "{}: could not fail request on a closed channel (id={:?})",
                    self.name, id
                );
            }
        }
    }

    /// Read one complete frame off `reader`.
    ///
    /// Lines before the `Content-Length` header are discarded silently (some
    /// servers and wrapper scripts write logging onto stdout); an unparseable
    /// `Content-Length` is logged and scanning resumes. `Ok(None)` means a
    /// frame arrived but carries nothing for the RPC layer (empty body or a
    /// body that did not decode).
    async fn recv_server_message(
        reader: &mut (impl AsyncBufRead + Unpin + Send),
        buffer: &mut String,
        content: &mut Vec<u8>,
        name: &str,
        trace: bool,
    ) -> Result<Option<ServerMessage>> {
        let mut content_length = None;
        loop {
            buffer.clear();
            if reader.read_line(buffer).await? == 0 {
                return Err(Error::StreamClosed);
            }

            if buffer == "\r\n" || buffer == "\n" {
                if content_length.is_some() {
                    break;
                }
                // a blank line before any header; keep scanning
                continue;
            }

            let header = buffer.trim_end();
            match header.split_once(": ") {
                Some(("Content-Length", value)) => match value.trim().parse() {
                    Ok(length) => content_length = Some(length),
                    Err(_) => {
                        warn!("{name} sent an invalid Content-Length header: {value:?}");
                    }
                },
                Some((_, _)) => {} // Content-Type and friends
                None => {}         // garbage line, skip
            }
        }

        let content_length = content_length.unwrap_or_default();
        if content_length == 0 {
            return Ok(None);
        }

        content.resize(content_length, 0);
        reader.read_exact(content).await?;

        let msg = match std::str::from_utf8(content) {
            Ok(msg) => msg,
            Err(err) => {
                error!("{name} sent a body that is not valid UTF-8: {err}");
                content.clear();
                return Ok(None);
            }
        };

        if trace {
            info!("{name} <- {msg}");
        } else {
            debug!("{name} <- {msg}");
        }

        // try parsing as output (server response) or call (server request)
        let parsed: serde_json::Result<ServerMessage> = serde_json::from_slice(content);
        content.clear();

        match parsed {
            Ok(msg) => Ok(Some(msg)),
            Err(err) => {
                error!("{name} sent malformed JSON: {err}");
                Ok(None)
            }
        }
    }

    async fn recv_server_error(
        err: &mut (impl AsyncBufRead + Unpin + Send),
        buffer: &mut String,
        name: &str,
    ) -> Result<()> {
        buffer.clear();
        if err.read_line(buffer).await? == 0 {
            return Err(Error::StreamClosed);
        }
        error!("{name} err <- {:?}", buffer.trim_end());

        Ok(())
    }

    async fn send_payload_to_server(
        &self,
        server_stdin: &mut BufWriter<ChildStdin>,
        payload: Payload,
    ) -> Result<()> {
        let json = match payload {
            Payload::Request { chan, value } => {
                self.pending_requests
                    .lock()
                    .await
                    .insert(value.id.clone(), chan);
                serde_json::to_string(&value)?
            }
            Payload::Notification(value) => serde_json::to_string(&value)?,
            Payload::Response(output) => serde_json::to_string(&output)?,
        };

        if self.trace {
            info!("{} -> {}", self.name, json);
        } else {
            debug!("{} -> {}", self.name, json);
        }

        write_frame(server_stdin, &json).await
    }

    async fn process_server_message(
        &self,
        client_tx: &UnboundedSender<jsonrpc::Call>,
        msg: ServerMessage,
    ) -> Result<()> {
        match msg {
            ServerMessage::Output(output) => self.process_request_response(output).await,
            ServerMessage::Call(call) => {
                client_tx.send(call).map_err(|_| Error::ShuttingDown)?;
                Ok(())
            }
        }
    }

    async fn process_request_response(&self, output: jsonrpc::Output) -> Result<()> {
        let (id, result) = match output {
            jsonrpc::Output::Success(jsonrpc::Success { id, result, .. }) => (id, Ok(result)),
            jsonrpc::Output::Failure(jsonrpc::Failure { id, error, .. }) => {
                error!("{} <- {error}", self.name);
                (id, Err(error.into()))
            }
        };

        if let Some(tx) = self.pending_requests.lock().await.remove(&id) {
            if tx.send(result).await.is_err() {
                // The requester stopped waiting, most likely a timeout.
                debug!(
                    "{}: response for request {:?} arrived after the caller gave up",
                    self.name, id
                );
            }
        } else {
            warn!(
                "{}: discarding response without a matching request (id={:?})",
                self.name, id
            );
        }

        Ok(())
    }

    async fn recv(
        transport: Arc<Self>,
        mut server_stdout: BufReader<ChildStdout>,
        client_tx: UnboundedSender<jsonrpc::Call>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut recv_buffer = String::new();
        let mut content_buffer = Vec::new();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                msg = Self::recv_server_message(
                    &mut server_stdout,
                    &mut recv_buffer,
                    &mut content_buffer,
                    &transport.name,
                    transport.trace,
                ) => match msg {
                    Ok(Some(msg)) => {
                        if transport.process_server_message(&client_tx, msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        if !matches!(err, Error::StreamClosed) {
                            error!("{}: stopping reads after error: {err}", transport.name);
                        }

                        // Close any outstanding requests.
                        transport.fail_pending(|| Error::StreamClosed).await;

                        // Inject an exit notification so the session observes
                        // the stream going away even when the server never
                        // said goodbye.
                        let _ = client_tx.send(jsonrpc::Call::Notification(jsonrpc::Notification {
                            jsonrpc: None,
                            method: "exit".to_string(),
                            params: jsonrpc::Params::None,
                        }));
                        break;
                    }
                }
            }
        }
    }

    async fn err(
        transport: Arc<Self>,
        mut server_stderr: BufReader<ChildStderr>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut recv_buffer = String::new();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                res = Self::recv_server_error(&mut server_stderr, &mut recv_buffer, &transport.name) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn send(
        transport: Arc<Self>,
        mut server_stdin: BufWriter<ChildStdin>,
        mut client_rx: UnboundedReceiver<Payload>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    // flush whatever the session queued before stopping,
                    // the exit notification in particular
                    while let Ok(payload) = client_rx.try_recv() {
                        if let Err(err) = transport.send_payload_to_server(&mut server_stdin, payload).await {
                            debug!("{}: dropping queued payload during shutdown: {err}", transport.name);
                            break;
                        }
                    }
                    break;
                }
                msg = client_rx.recv() => match msg {
                    Some(payload) => {
                        if let Err(err) = transport.send_payload_to_server(&mut server_stdin, payload).await {
                            error!("{}: stopping writes after error: {err}", transport.name);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        // Dropping `server_stdin` here closes the child's stdin.
    }
}

/// Write one LSP frame: both headers and the body in a single buffered write
/// sequence, flushed before returning, so concurrent senders can never
/// interleave partial frames (all writes funnel through the one send loop).
async fn write_frame(writer: &mut (impl AsyncWrite + Unpin), body: &str) -> Result<()> {
    writer
        .write_all(format!("Content-Length: {}\r\n", body.len()).as_bytes())
        .await?;
    writer
        .write_all(b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n")
        .await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_one(
        input: &[u8],
    ) -> (Result<Option<ServerMessage>>, String, Vec<u8>) {
        let mut reader = BufReader::new(input);
        let mut buffer = String::new();
        let mut content = Vec::new();
        let res =
            Transport::recv_server_message(&mut reader, &mut buffer, &mut content, "test", false)
                .await;
        (res, buffer, content)
    }

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    #[tokio::test]
    async fn parses_a_response_frame() {
        let input = frame(r#"{"jsonrpc":"2.0","result":{"ok":true},"id":3}"#);
        let (res, _, _) = read_one(&input).await;
        match res.unwrap().unwrap() {
            ServerMessage::Output(jsonrpc::Output::Success(success)) => {
                assert_eq!(success.id, jsonrpc::Id::Num(3));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn skips_garbage_before_the_header_block() {
        let mut input = b"starting up...\nsome more noise\r\n".to_vec();
        input.extend(frame(r#"{"jsonrpc":"2.0","method":"$/progress","params":{}}"#));
        let (res, _, _) = read_one(&input).await;
        assert!(matches!(
            res.unwrap().unwrap(),
            ServerMessage::Call(jsonrpc::Call::Notification(_))
        ));
    }

    #[tokio::test]
    async fn tolerates_unknown_headers() {
        let body = r#"{"jsonrpc":"2.0","result":null,"id":0}"#;
        let input = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let (res, _, _) = read_one(input.as_bytes()).await;
        assert!(matches!(
            res.unwrap().unwrap(),
            ServerMessage::Output(jsonrpc::Output::Success(_))
        ));
    }

    #[tokio::test]
    async fn recovers_from_an_unparseable_content_length() {
        let body = r#"{"jsonrpc":"2.0","result":null,"id":1}"#;
        let input = format!(
            "Content-Length: banana\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let (res, _, _) = read_one(input.as_bytes()).await;
        assert!(matches!(
            res.unwrap().unwrap(),
            ServerMessage::Output(jsonrpc::Output::Success(_))
        ));
    }

    #[tokio::test]
    async fn empty_body_frame_is_skipped() {
        let (res, _, _) = read_one(b"Content-Length: 0\r\n\r\n").await;
        assert!(res.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_skipped_not_fatal() {
        let input = frame("{not json");
        let (res, _, _) = read_one(&input).await;
        assert!(res.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_header_then_eof_terminates_cleanly() {
        let (res, _, _) = read_one(b"Content-Length: 10\r\n").await;
        assert!(matches!(res, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn eof_reports_stream_closed() {
        let (res, _, _) = read_one(b"").await;
        assert!(matches!(res, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn written_frames_carry_both_headers() {
        let mut out = Vec::new();
        write_frame(&mut out, r#"{"jsonrpc":"2.0","method":"exit","params":null}"#)
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Content-Length: 47\r\n"));
        assert!(text.contains("Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n"));
        assert!(text.ends_with(r#"{"jsonrpc":"2.0","method":"exit","params":null}"#));
    }
}
