//! JSON-RPC plumbing over a message channel
//!
//! Two background tasks per connection: the writer drains an ordered queue
//! into the channel, the reader decodes frames, completes pending requests by
//! id and hands everything else to the session as `Inbound` messages.

use crate::lsp::codec::LspCodec;
use crate::lsp::jsonrpc::{Message, Notification, Request, RequestId, Response};
use crate::lsp::transport::{BoxedReader, BoxedWriter, MessageChannel};
use crate::types::ClientError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, ClientError>>>>>;

enum Outbound {
    Frame(String),
    /// Flush and close the writing half
    Close,
}

/// Server-originated traffic the session has to act on
#[derive(Debug)]
pub enum Inbound {
    Request(Request),
    Notification(Notification),
    /// A frame that was not a valid JSON-RPC message, or a broken channel
    Malformed(String),
}

/// Cloneable sending side of a connection.
#[derive(Clone)]
pub struct RpcHandle {
    next_id: Arc<AtomicI64>,
    pending: PendingMap,
    outgoing: mpsc::UnboundedSender<Outbound>,
    request_timeout: Duration,
}

impl RpcHandle {
    /// Send a request and wait for the response with the same id.
    pub async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut request = Request::new(RequestId::Number(id), method, serde_json::to_value(params)?);
        if request.params.as_ref().is_some_and(Value::is_null) {
            request.params = None;
        }
        let message = serde_json::to_string(&request)?;
        debug!("Sending request {}: {}", id, method);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing.send(Outbound::Frame(message)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Protocol("Connection closed".to_string()));
        }

        let result = match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(ClientError::Protocol(
                    "Response channel closed".to_string(),
                ))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(ClientError::Timeout(self.request_timeout.as_secs()));
            }
        };

        serde_json::from_value(result).map_err(|e| {
            ClientError::Protocol(format!("Failed to parse {} response: {}", method, e))
        })
    }

    /// Send a notification (no response expected)
    pub fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), ClientError> {
        let mut notification = Notification::new(method, serde_json::to_value(params)?);
        if notification.params.as_ref().is_some_and(Value::is_null) {
            notification.params = None;
        }
        debug!("Sending notification: {}", method);
        self.send(&Message::Notification(notification))
    }

    /// Answer a server-initiated request
    pub fn reply(&self, response: Response) -> Result<(), ClientError> {
        self.send(&Message::Response(response))
    }

    fn send(&self, message: &Message) -> Result<(), ClientError> {
        let frame = serde_json::to_string(message)?;
        self.outgoing
            .send(Outbound::Frame(frame))
            .map_err(|_| ClientError::Protocol("Connection closed".to_string()))
    }
}

/// Owns the reader and writer tasks of one connection.
pub struct RpcChannel {
    handle: RpcHandle,
    inbound: Option<mpsc::UnboundedReceiver<Inbound>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcChannel {
    pub fn spawn(channel: MessageChannel, request_timeout: Duration) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(write_loop(channel.writer, outgoing_rx));
        let reader = tokio::spawn(read_loop(
            channel.reader,
            Arc::clone(&pending),
            outgoing.clone(),
            inbound_tx,
        ));

        Self {
            handle: RpcHandle {
                next_id: Arc::new(AtomicI64::new(1)),
                pending,
                outgoing,
                request_timeout,
            },
            inbound: Some(inbound),
            reader,
            writer,
        }
    }

    pub fn handle(&self) -> RpcHandle {
        self.handle.clone()
    }

    /// Inbound server traffic. The receiver ends when the channel closes.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inbound.take()
    }

    /// Flush everything queued so far, close the writing half and stop reading.
    pub async fn close(&mut self, grace: Duration) {
        if self.handle.outgoing.send(Outbound::Close).is_ok()
            && timeout(grace, &mut self.writer).await.is_err()
        {
            warn!("Timed out flushing outgoing messages");
        }
        self.writer.abort();
        self.reader.abort();
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

async fn write_loop(writer: BoxedWriter, mut outgoing: mpsc::UnboundedReceiver<Outbound>) {
    let mut framed = FramedWrite::new(writer, LspCodec::new());

    while let Some(message) = outgoing.recv().await {
        match message {
            Outbound::Frame(frame) => {
                if let Err(e) = framed.send(frame).await {
                    error!("Failed to write message: {}", e);
                    return;
                }
            }
            Outbound::Close => break,
        }
    }

    if let Err(e) = framed.close().await {
        debug!("Failed to close writer: {}", e);
    }
}

async fn read_loop(
    reader: BoxedReader,
    pending: PendingMap,
    outgoing: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let mut framed = FramedRead::new(reader, LspCodec::new());

    while let Some(frame) = framed.next().await {
        match frame {
            Ok(frame) => dispatch(frame, &pending, &outgoing, &inbound).await,
            Err(e) => {
                // Framing is lost; nothing after this can be trusted
                error!("Unreadable frame from server: {}", e);
                let _ = inbound.send(Inbound::Malformed(e.to_string()));
                break;
            }
        }
    }

    warn!("Language server closed the connection");
    for (_, sender) in pending.lock().await.drain() {
        let _ = sender.send(Err(ClientError::Protocol(
            "Connection closed before response".to_string(),
        )));
    }
}

async fn dispatch(
    frame: Bytes,
    pending: &PendingMap,
    outgoing: &mpsc::UnboundedSender<Outbound>,
    inbound: &mpsc::UnboundedSender<Inbound>,
) {
    let message = match serde_json::from_slice::<Message>(&frame) {
        Ok(message) => message,
        Err(e) => {
            let text = String::from_utf8_lossy(&frame);
            warn!("Invalid JSON-RPC message: {}: {}", e, text);
            let _ = inbound.send(Inbound::Malformed(format!(
                "Invalid JSON-RPC message: {}",
                e
            )));
            return;
        }
    };

    match message {
        Message::Response(response) => {
            let Some(RequestId::Number(id)) = response.id else {
                warn!("Response without a numeric id: {:?}", response.id);
                return;
            };
            let Some(sender) = pending.lock().await.remove(&id) else {
                debug!("Response for unknown or expired request {}", id);
                return;
            };

            let result = response.into_result().map_err(|error| ClientError::Server {
                code: error.code,
                message: error.message,
            });
            let _ = sender.send(result);
        }
        Message::Request(request) => {
            debug!("Received server request {}: {}", request.id, request.method);
            if let Err(mpsc::error::SendError(Inbound::Request(request))) =
                inbound.send(Inbound::Request(request))
            {
                // Nobody is listening any more; still answer so the server
                // is not left waiting
                let reply = Response::error(
                    request.id,
                    crate::lsp::jsonrpc::METHOD_NOT_FOUND,
                    "client is shutting down",
                );
                if let Ok(frame) = serde_json::to_string(&Message::Response(reply)) {
                    let _ = outgoing.send(Outbound::Frame(frame));
                }
            }
        }
        Message::Notification(notification) => {
            debug!("Received notification: {}", notification.method);
            let _ = inbound.send(Inbound::Notification(notification));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    type ServerSide = (
        FramedRead<tokio::io::ReadHalf<DuplexStream>, LspCodec>,
        FramedWrite<tokio::io::WriteHalf<DuplexStream>, LspCodec>,
    );

    fn connected() -> (RpcChannel, ServerSide) {
        let (client, server) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let rpc = RpcChannel::spawn(
            MessageChannel::new(client_read, client_write),
            Duration::from_secs(5),
        );
        (
            rpc,
            (
                FramedRead::new(server_read, LspCodec::new()),
                FramedWrite::new(server_write, LspCodec::new()),
            ),
        )
    }

    async fn next_json(reader: &mut FramedRead<tokio::io::ReadHalf<DuplexStream>, LspCodec>) -> Value {
        let frame = reader.next().await.unwrap().unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_responses_matched_by_id_out_of_order() {
        let (rpc, (mut server_rx, mut server_tx)) = connected();
        let handle = rpc.handle();

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request::<_, Value>("first", json!({})).await })
        };
        let first_request = next_json(&mut server_rx).await;
        let second = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.request::<_, Value>("second", json!({})).await })
        };
        let second_request = next_json(&mut server_rx).await;

        // Answer the second request before the first
        server_tx
            .send(json!({"jsonrpc": "2.0", "id": second_request["id"], "result": "two"}).to_string())
            .await
            .unwrap();
        server_tx
            .send(json!({"jsonrpc": "2.0", "id": first_request["id"], "result": "one"}).to_string())
            .await
            .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), json!("one"));
        assert_eq!(second.await.unwrap().unwrap(), json!("two"));
    }

    #[tokio::test]
    async fn test_outgoing_order_preserved() {
        let (rpc, (mut server_rx, _server_tx)) = connected();
        let handle = rpc.handle();

        for index in 0..20 {
            handle.notify("test/ordered", json!({ "index": index })).unwrap();
        }

        for index in 0..20 {
            let message = next_json(&mut server_rx).await;
            assert_eq!(message["params"]["index"], index);
        }
    }

    #[tokio::test]
    async fn test_null_params_are_omitted() {
        let (rpc, (mut server_rx, _server_tx)) = connected();
        rpc.handle().notify("exit", Value::Null).unwrap();

        let message = next_json(&mut server_rx).await;
        assert_eq!(message["method"], "exit");
        assert!(message.get("params").is_none());
    }

    #[tokio::test]
    async fn test_error_response_becomes_server_error() {
        let (rpc, (mut server_rx, mut server_tx)) = connected();
        let handle = rpc.handle();

        let call = tokio::spawn(async move { handle.request::<_, Value>("broken", json!({})).await });
        let request = next_json(&mut server_rx).await;
        server_tx
            .send(
                json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32603, "message": "boom"}})
                    .to_string(),
            )
            .await
            .unwrap();

        match call.await.unwrap() {
            Err(ClientError::Server { code, message }) => {
                assert_eq!(code, -32603);
                assert_eq!(message, "boom");
            }
            other => panic!("expected server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_requests_fail_when_server_disconnects() {
        let (rpc, (mut server_rx, server_tx)) = connected();
        let handle = rpc.handle();

        let call = tokio::spawn(async move { handle.request::<_, Value>("hang", json!({})).await });
        let _ = next_json(&mut server_rx).await;
        drop(server_tx);
        drop(server_rx);

        assert!(matches!(
            call.await.unwrap(),
            Err(ClientError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_notifications_and_malformed_frames() {
        let (mut rpc, (_server_rx, mut server_tx)) = connected();
        let mut inbound = rpc.take_inbound().unwrap();

        server_tx.send("not json".to_string()).await.unwrap();
        server_tx
            .send(json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"type": 3, "message": "hi"}}).to_string())
            .await
            .unwrap();

        assert!(matches!(inbound.recv().await, Some(Inbound::Malformed(_))));
        match inbound.recv().await {
            Some(Inbound::Notification(notification)) => {
                assert_eq!(notification.method, "window/logMessage")
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }
}
