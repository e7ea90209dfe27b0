//! In-memory language server for session tests
#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use lsclient::lsp::codec::LspCodec;
use lsclient::lsp::jsonrpc::{Message, Notification, Request, RequestId, Response, METHOD_NOT_FOUND};
use lsclient::lsp::{
    ClientOptions, ClientSession, DocumentSelector, EventSink, MessageChannel, ServerConnection,
    ServerConnector, ServerDescriptor, ServerLauncher, SessionEvent, TransportConfig,
};
use lsclient::{ClientError, ServerLaunchConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

pub const DIAGNOSTIC_MESSAGE: &str = "unbalanced braces";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Normal,
    /// Never answers `initialize`
    HangOnInitialize,
    /// Sends server-to-client requests after `initialized`
    ServerRequests,
}

pub struct MockConnector {
    behaviour: Behaviour,
    connects: AtomicUsize,
    methods: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<Vec<Response>>>,
    crash: Arc<Notify>,
}

impl MockConnector {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            connects: AtomicUsize::new(0),
            methods: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(Vec::new())),
            crash: Arc::new(Notify::new()),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Methods received by the server, in arrival order
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    /// Responses the client sent to server-initiated requests
    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().unwrap().clone()
    }

    /// Drop the server end of the connection
    pub fn crash(&self) {
        self.crash.notify_one();
    }

    /// Answer a client over `stream` until it sends `exit` or disconnects
    pub async fn serve<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        serve(
            stream,
            self.behaviour,
            Arc::clone(&self.methods),
            Arc::clone(&self.responses),
            Arc::clone(&self.crash),
        )
        .await
    }

    pub async fn wait_for_method(&self, method: &str) -> bool {
        for _ in 0..200 {
            if self.methods().iter().any(|m| m == method) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub async fn wait_for_responses(&self, count: usize) -> Vec<Response> {
        for _ in 0..200 {
            let responses = self.responses();
            if responses.len() >= count {
                return responses;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.responses()
    }
}

#[async_trait]
impl ServerConnector for MockConnector {
    async fn connect(
        &self,
        _descriptor: &ServerDescriptor,
        _transport: &TransportConfig,
    ) -> Result<ServerConnection, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(
            server,
            self.behaviour,
            Arc::clone(&self.methods),
            Arc::clone(&self.responses),
            Arc::clone(&self.crash),
        ));

        let (reader, writer) = tokio::io::split(client);
        Ok(ServerConnection {
            channel: MessageChannel::new(reader, writer),
            process: None,
        })
    }
}

async fn serve<S>(
    stream: S,
    behaviour: Behaviour,
    methods: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<Vec<Response>>>,
    crash: Arc<Notify>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FramedRead::new(reader, LspCodec::new());
    let mut writer = FramedWrite::new(writer, LspCodec::new());

    loop {
        let frame = tokio::select! {
            _ = crash.notified() => return,
            frame = reader.next() => frame,
        };
        let Some(Ok(frame)) = frame else {
            return;
        };
        let Ok(message) = serde_json::from_slice::<Message>(&frame) else {
            continue;
        };

        match message {
            Message::Request(request) => {
                methods.lock().unwrap().push(request.method.clone());
                let response = match request.method.as_str() {
                    "initialize" if behaviour == Behaviour::HangOnInitialize => continue,
                    "initialize" => Response::ok(
                        request.id,
                        json!({
                            "capabilities": {"textDocumentSync": 1},
                            "serverInfo": {"name": "mock-hocon", "version": "0.1.0"}
                        }),
                    ),
                    "shutdown" => Response::ok(request.id, Value::Null),
                    other => {
                        Response::error(request.id, METHOD_NOT_FOUND, format!("unknown {}", other))
                    }
                };
                if send(&mut writer, &Message::Response(response)).await.is_err() {
                    return;
                }
            }
            Message::Notification(notification) => {
                methods.lock().unwrap().push(notification.method.clone());
                let replies = match notification.method.as_str() {
                    "initialized" if behaviour == Behaviour::ServerRequests => server_requests(),
                    "textDocument/didOpen" => {
                        let uri = notification
                            .params
                            .as_ref()
                            .and_then(|p| p.pointer("/textDocument/uri"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        vec![Message::Notification(Notification::new(
                            "textDocument/publishDiagnostics",
                            diagnostics_for(uri),
                        ))]
                    }
                    "exit" => return,
                    _ => Vec::new(),
                };
                for reply in &replies {
                    if send(&mut writer, reply).await.is_err() {
                        return;
                    }
                }
            }
            Message::Response(response) => responses.lock().unwrap().push(response),
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &mut FramedWrite<W, LspCodec>,
    message: &Message,
) -> Result<(), ()> {
    let frame = serde_json::to_string(message).map_err(|_| ())?;
    writer.send(frame).await.map_err(|_| ())
}

fn server_requests() -> Vec<Message> {
    vec![
        Message::Request(Request::new(
            RequestId::Number(100),
            "client/registerCapability",
            json!({"registrations": [{"id": "watch", "method": "workspace/didChangeWatchedFiles"}]}),
        )),
        Message::Request(Request::new(
            RequestId::Number(101),
            "workspace/configuration",
            json!({"items": [{"section": "hocon"}, {"section": "files"}]}),
        )),
        Message::Request(Request::new(
            RequestId::String("custom".to_string()),
            "hocon/somethingElse",
            Value::Null,
        )),
    ]
}

pub fn diagnostics_for(uri: Value) -> Value {
    json!({
        "uri": uri,
        "diagnostics": [{
            "range": {
                "start": {"line": 0, "character": 4},
                "end": {"line": 0, "character": 5}
            },
            "severity": 1,
            "message": DIAGNOSTIC_MESSAGE
        }]
    })
}

pub fn options() -> ClientOptions {
    let launcher = ServerLauncher::new(PathBuf::from("/opt/hocon"), ServerLaunchConfig::default());
    let selector = DocumentSelector::new(vec![lsclient::lsp::DocumentFilter::new("file", "hocon")])
        .expect("selector");
    ClientOptions::new("HOCON Language Server", launcher.server_options(), selector)
}

pub fn session(
    connector: &Arc<MockConnector>,
    options: ClientOptions,
) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel::<SessionEvent>();
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let connector: Arc<dyn ServerConnector> = connector.clone();
    (Arc::new(ClientSession::new(options, connector, sink)), rx)
}

/// Next event matching `pred`, skipping others
pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Option<SessionEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
