//! Client session for a single language server
//!
//! The session owns one connection at a time and moves through
//! `Idle -> Starting -> Running -> Stopping -> Stopped`, with `Failed`
//! reachable from `Starting` and `Running`. A crash while running is reported
//! once through the event sink; restarting is left to the caller.

use crate::config::ClientConfig;
use crate::lsp::events::{EventSink, SessionEvent};
use crate::lsp::jsonrpc::{Notification, Request, Response, METHOD_NOT_FOUND};
use crate::lsp::launcher::{ServerConnector, ServerLauncher, ServerMode, ServerOptions};
use crate::lsp::process::{wait_for_exit, ExitInfo, ProcessHandle};
use crate::lsp::rpc::{Inbound, RpcChannel, RpcHandle};
use crate::lsp::selector::{DocumentEvent, DocumentSelector};
use crate::lsp::transport::TransportConfig;
use crate::types::ClientError;
use lsp_types::notification::Notification as _;
use lsp_types::notification::{
    DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, DidSaveTextDocument, Exit,
    Initialized, LogMessage, PublishDiagnostics, ShowMessage,
};
use lsp_types::request::Request as _;
use lsp_types::request::{
    Initialize, RegisterCapability, Shutdown, UnregisterCapability, WorkDoneProgressCreate,
    WorkspaceConfiguration,
};
use lsp_types::{
    ClientCapabilities, ClientInfo, ConfigurationParams, DidChangeTextDocumentParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, DidSaveTextDocumentParams,
    InitializeParams, InitializeResult, InitializedParams, PublishDiagnosticsClientCapabilities,
    ServerCapabilities, TextDocumentClientCapabilities, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentSyncClientCapabilities, Url, VersionedTextDocumentIdentifier, WorkspaceFolder,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// States `stop()` tears down from
const STOPPABLE: [SessionState; 3] = [
    SessionState::Starting,
    SessionState::Running,
    SessionState::Failed,
];

/// How long to wait for a process exit status after its channel closed
const EXIT_STATUS_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Session settings, resolved from a `ClientConfig` or built directly.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub name: String,
    pub mode: ServerMode,
    pub server: ServerOptions,
    pub transport: TransportConfig,
    pub selector: DocumentSelector,
    pub root_uri: Option<Url>,
    pub initialization_options: Option<Value>,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl ClientOptions {
    pub fn new(name: impl Into<String>, server: ServerOptions, selector: DocumentSelector) -> Self {
        let defaults = ClientConfig::default();
        Self {
            name: name.into(),
            mode: ServerMode::Run,
            server,
            transport: TransportConfig::default(),
            selector,
            root_uri: None,
            initialization_options: None,
            handshake_timeout: defaults.handshake_timeout(),
            request_timeout: defaults.request_timeout(),
            shutdown_timeout: defaults.shutdown_timeout(),
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        launcher: &ServerLauncher,
        root_uri: Option<Url>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let selector = DocumentSelector::new(config.document_selector.clone())?;

        Ok(Self {
            name: config.name.clone(),
            mode: config.mode,
            server: launcher.server_options(),
            transport: config.transport.clone(),
            selector,
            root_uri,
            initialization_options: config.initialization_options.clone(),
            handshake_timeout: config.handshake_timeout(),
            request_timeout: config.request_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        })
    }
}

/// Everything that exists only while a server is connected
struct Live {
    rpc: RpcChannel,
    process: Option<ProcessHandle>,
    supervisor: Option<JoinHandle<()>>,
    capabilities: ServerCapabilities,
}

pub struct ClientSession {
    options: ClientOptions,
    connector: Arc<dyn ServerConnector>,
    sink: Arc<dyn EventSink>,
    state: Arc<watch::Sender<SessionState>>,
    /// Cancels an in-flight start; also serializes state changes made by
    /// `start()` and `stop()`
    control: Mutex<Option<oneshot::Sender<()>>>,
    /// Held for the whole of `start()`
    start_lock: Mutex<()>,
    live: Mutex<Option<Live>>,
    open_documents: Mutex<HashSet<Url>>,
}

/// Apply `to` if the current state is one of `from`. Returns the previous
/// state on success and the unchanged current state otherwise.
fn transition(
    state: &watch::Sender<SessionState>,
    from: &[SessionState],
    to: SessionState,
) -> Result<SessionState, SessionState> {
    let mut outcome = Err(*state.borrow());
    state.send_if_modified(|current| {
        if from.contains(current) {
            outcome = Ok(*current);
            *current = to;
            true
        } else {
            outcome = Err(*current);
            false
        }
    });
    if let Ok(previous) = outcome {
        debug!("Session state: {} -> {}", previous, to);
    }
    outcome
}

impl ClientSession {
    pub fn new(
        options: ClientOptions,
        connector: Arc<dyn ServerConnector>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            options,
            connector,
            sink,
            state: Arc::new(state),
            control: Mutex::new(None),
            start_lock: Mutex::new(()),
            live: Mutex::new(None),
            open_documents: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Capabilities announced by the server in its initialize response
    pub async fn capabilities(&self) -> Option<ServerCapabilities> {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| live.capabilities.clone())
    }

    /// Launch the server and complete the initialize handshake.
    ///
    /// Only valid from `Idle`. Launch and handshake failures are returned
    /// here and leave the session `Failed`; a concurrent `stop()` makes this
    /// return `ClientError::Cancelled`.
    pub async fn start(&self) -> Result<(), ClientError> {
        let _starting = self.start_lock.lock().await;

        let cancelled = {
            let mut control = self.control.lock().await;
            transition(&self.state, &[SessionState::Idle], SessionState::Starting).map_err(
                |state| ClientError::InvalidState {
                    operation: "start",
                    state,
                },
            )?;
            let (cancel_tx, cancel_rx) = oneshot::channel();
            *control = Some(cancel_tx);
            cancel_rx
        };

        info!(
            "Starting {} ({} mode, {})",
            self.options.name, self.options.mode, self.options.transport
        );

        let handshake_timeout = self.options.handshake_timeout;
        let outcome = tokio::select! {
            _ = cancelled => Err(ClientError::Cancelled),
            result = timeout(handshake_timeout, self.establish()) => match result {
                Ok(result) => result,
                Err(_) => Err(ClientError::Handshake(format!(
                    "no initialize response within {}s",
                    handshake_timeout.as_secs()
                ))),
            },
        };

        let mut control = self.control.lock().await;
        control.take();

        match outcome {
            Ok(mut live) => {
                if transition(&self.state, &[SessionState::Starting], SessionState::Running)
                    .is_err()
                {
                    // stop() got in after the handshake finished
                    debug!("Discarding connection for {}: stop requested", self.options.name);
                    return Err(ClientError::Cancelled);
                }

                let inbound = live.rpc.take_inbound();
                let exit = live.process.as_ref().map(ProcessHandle::exit_watcher);
                if let Some(inbound) = inbound {
                    live.supervisor = Some(tokio::spawn(supervise(
                        self.options.name.clone(),
                        inbound,
                        exit,
                        live.rpc.handle(),
                        Arc::clone(&self.state),
                        Arc::clone(&self.sink),
                    )));
                }
                *self.live.lock().await = Some(live);

                info!("{} is running", self.options.name);
                Ok(())
            }
            Err(e) => {
                if transition(&self.state, &[SessionState::Starting], SessionState::Failed).is_ok() {
                    error!("Failed to start {}: {}", self.options.name, e);
                }
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<Live, ClientError> {
        let descriptor = self.options.server.get(self.options.mode);
        let connection = self
            .connector
            .connect(descriptor, &self.options.transport)
            .await?;

        let rpc = RpcChannel::spawn(connection.channel, self.options.request_timeout);
        let mut process = connection.process;

        match self.initialize(&rpc.handle()).await {
            Ok(capabilities) => Ok(Live {
                rpc,
                process,
                supervisor: None,
                capabilities,
            }),
            Err(e) => {
                if let Some(process) = process.as_mut() {
                    process.kill().await;
                }
                Err(ClientError::Handshake(e.to_string()))
            }
        }
    }

    async fn initialize(&self, rpc: &RpcHandle) -> Result<ServerCapabilities, ClientError> {
        let workspace_folders = self.options.root_uri.as_ref().map(|uri| {
            vec![WorkspaceFolder {
                uri: uri.clone(),
                name: folder_name(uri),
            }]
        });

        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: self.options.root_uri.clone(),
            workspace_folders,
            capabilities: client_capabilities(),
            initialization_options: self.options.initialization_options.clone(),
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        };

        let result: InitializeResult = rpc.request(Initialize::METHOD, params).await?;
        if let Some(info) = &result.server_info {
            info!(
                "Connected to {} {}",
                info.name,
                info.version.as_deref().unwrap_or("")
            );
        }

        rpc.notify(Initialized::METHOD, InitializedParams {})?;
        Ok(result.capabilities)
    }

    /// Shut the server down and release the connection.
    ///
    /// Valid from every state; `Stopped` is a no-op. Stopping a session that
    /// is still starting cancels the handshake.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let previous = {
            let mut control = self.control.lock().await;
            match self.state() {
                SessionState::Stopped => return Ok(()),
                SessionState::Stopping => None,
                SessionState::Idle => {
                    let stopped =
                        transition(&self.state, &[SessionState::Idle], SessionState::Stopped);
                    debug_assert!(stopped.is_ok(), "idle session changed state: {:?}", stopped);
                    return Ok(());
                }
                current => {
                    // The supervisor may move Running -> Failed without the
                    // control lock, so `current` can already be stale
                    let stopping = transition(&self.state, &STOPPABLE, SessionState::Stopping);
                    debug_assert!(stopping.is_ok(), "cannot stop from {:?}", stopping);
                    if let Some(cancel) = control.take() {
                        let _ = cancel.send(());
                    }
                    Some(stopping.unwrap_or(current))
                }
            }
        };

        let Some(previous) = previous else {
            // Another stop() is already tearing down
            let mut state = self.subscribe_state();
            let _ = state.wait_for(|s| *s == SessionState::Stopped).await;
            return Ok(());
        };

        info!("Stopping {} (was {})", self.options.name, previous);

        // Let a cancelled start() unwind before looking at the connection
        if timeout(self.options.shutdown_timeout, self.start_lock.lock())
            .await
            .is_err()
        {
            warn!("{}: start did not unwind in time", self.options.name);
        }

        let live = self.live.lock().await.take();
        if let Some(live) = live {
            self.shutdown(live, previous).await;
        }
        self.open_documents.lock().await.clear();

        // Nothing else leaves Stopping
        let stopped = transition(&self.state, &[SessionState::Stopping], SessionState::Stopped);
        debug_assert!(stopped.is_ok(), "stop ended in {:?}", stopped);
        info!("{} stopped", self.options.name);
        Ok(())
    }

    async fn shutdown(&self, mut live: Live, previous: SessionState) {
        if let Some(supervisor) = live.supervisor.take() {
            supervisor.abort();
        }

        let process_alive = live
            .process
            .as_ref()
            .map_or(true, |process| process.try_exit().is_none());
        let grace = self.options.shutdown_timeout;

        if previous == SessionState::Running && process_alive {
            let rpc = live.rpc.handle();
            match timeout(grace, rpc.request::<_, Value>(Shutdown::METHOD, Value::Null)).await {
                Ok(Ok(_)) => debug!("{} acknowledged shutdown", self.options.name),
                Ok(Err(e)) => warn!("Shutdown request failed: {}", e),
                Err(_) => warn!("Shutdown request timed out after {}s", grace.as_secs()),
            }
            if let Err(e) = rpc.notify(Exit::METHOD, Value::Null) {
                debug!("Could not send exit: {}", e);
            }
        }

        live.rpc.close(grace).await;

        if let Some(mut process) = live.process.take() {
            match process.wait_timeout(grace).await {
                Some(exit) => debug!("{} exited with {:?}", process.program(), exit),
                None => {
                    warn!("{} did not exit, killing it", process.program());
                    process.kill().await;
                }
            }
        }
    }

    /// Forward a buffer event to the server if it matches the selector.
    ///
    /// Returns whether the event was sent. Changes, saves and closes are only
    /// forwarded for documents opened through this session.
    pub async fn notify_document(&self, event: DocumentEvent) -> Result<bool, ClientError> {
        if !self.options.selector.matches_event(&event) {
            debug!(
                "Ignoring {} of {} ({}): not selected",
                event.kind(),
                event.uri(),
                event.language_id()
            );
            return Ok(false);
        }

        let rpc = self.running_rpc("forward document events").await?;
        let mut open = self.open_documents.lock().await;

        match event {
            DocumentEvent::Opened {
                uri,
                language_id,
                version,
                text,
            } => {
                rpc.notify(
                    DidOpenTextDocument::METHOD,
                    DidOpenTextDocumentParams {
                        text_document: TextDocumentItem {
                            uri: uri.clone(),
                            language_id,
                            version,
                            text,
                        },
                    },
                )?;
                open.insert(uri);
            }
            DocumentEvent::Changed {
                uri,
                version,
                changes,
                ..
            } => {
                if !open.contains(&uri) {
                    warn!("Change for unopened document {}", uri);
                    return Ok(false);
                }
                rpc.notify(
                    DidChangeTextDocument::METHOD,
                    DidChangeTextDocumentParams {
                        text_document: VersionedTextDocumentIdentifier { uri, version },
                        content_changes: changes,
                    },
                )?;
            }
            DocumentEvent::Saved { uri, text, .. } => {
                if !open.contains(&uri) {
                    return Ok(false);
                }
                rpc.notify(
                    DidSaveTextDocument::METHOD,
                    DidSaveTextDocumentParams {
                        text_document: TextDocumentIdentifier { uri },
                        text,
                    },
                )?;
            }
            DocumentEvent::Closed { uri, .. } => {
                if !open.remove(&uri) {
                    return Ok(false);
                }
                rpc.notify(
                    DidCloseTextDocument::METHOD,
                    DidCloseTextDocumentParams {
                        text_document: TextDocumentIdentifier { uri },
                    },
                )?;
            }
        }

        Ok(true)
    }

    /// Send a typed request to the running server
    pub async fn request<R>(&self, params: R::Params) -> Result<R::Result, ClientError>
    where
        R: lsp_types::request::Request,
    {
        let rpc = self.running_rpc("send requests").await?;
        rpc.request(R::METHOD, params).await
    }

    /// Send a typed notification to the running server
    pub async fn notify<N>(&self, params: N::Params) -> Result<(), ClientError>
    where
        N: lsp_types::notification::Notification,
    {
        self.running_rpc("send notifications")
            .await?
            .notify(N::METHOD, params)
    }

    /// Untyped request for methods outside `lsp_types`
    pub async fn request_raw<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, ClientError> {
        let rpc = self.running_rpc("send requests").await?;
        rpc.request(method, params).await
    }

    async fn running_rpc(&self, operation: &'static str) -> Result<RpcHandle, ClientError> {
        let state = self.state();
        if state != SessionState::Running {
            return Err(ClientError::InvalidState { operation, state });
        }
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| live.rpc.handle())
            .ok_or(ClientError::InvalidState { operation, state })
    }

    /// Start and return a guard that stops the session when released.
    /// A failed start is stopped before the error is returned.
    pub async fn start_scoped(self: &Arc<Self>) -> Result<SessionGuard, ClientError> {
        if let Err(e) = self.start().await {
            if let Err(stop_error) = self.stop().await {
                warn!("Cleanup after failed start: {}", stop_error);
            }
            return Err(e);
        }
        Ok(SessionGuard {
            session: Arc::clone(self),
            armed: true,
        })
    }
}

/// Stops its session on `stop()` or, failing that, when dropped.
pub struct SessionGuard {
    session: Arc<ClientSession>,
    armed: bool,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    pub async fn stop(mut self) -> Result<(), ClientError> {
        self.armed = false;
        self.session.stop().await
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let session = Arc::clone(&self.session);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.stop().await {
                        warn!("Failed to stop {}: {}", session.name(), e);
                    }
                });
            }
            // Without a runtime the process is still killed when the
            // session's handle is dropped
            Err(_) => warn!("{} dropped outside a runtime", session.name()),
        }
    }
}

fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                did_save: Some(true),
                ..Default::default()
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                related_information: Some(true),
                version_support: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn folder_name(uri: &Url) -> String {
    uri.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("workspace")
        .to_string()
}

/// Relays server traffic to the sink until the connection ends.
async fn supervise(
    name: String,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    exit: Option<watch::Receiver<Option<ExitInfo>>>,
    rpc: RpcHandle,
    state: Arc<watch::Sender<SessionState>>,
    sink: Arc<dyn EventSink>,
) {
    let has_process = exit.is_some();
    let exited = async move {
        match exit {
            Some(exit) => wait_for_exit(exit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(exited);

    let info = loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(Inbound::Notification(notification)) => {
                    sink.on_event(notification_event(notification));
                }
                Some(Inbound::Request(request)) => answer_server_request(&rpc, sink.as_ref(), request),
                Some(Inbound::Malformed(message)) => {
                    warn!("{}: {}", name, message);
                    sink.on_event(SessionEvent::ProtocolError { message });
                }
                None => {
                    // Channel gone; pick up the exit status if the process is going too
                    let info = if has_process {
                        timeout(EXIT_STATUS_GRACE, &mut exited).await.unwrap_or_default()
                    } else {
                        ExitInfo::default()
                    };
                    break info;
                }
            },
            info = &mut exited => break info,
        }
    };

    if transition(&state, &[SessionState::Running], SessionState::Failed).is_ok() {
        error!("{} terminated unexpectedly: {:?}", name, info);
        sink.on_event(SessionEvent::Crashed(info));
    }
}

fn notification_event(notification: Notification) -> SessionEvent {
    let params = notification.params.unwrap_or(Value::Null);

    fn parse<T: DeserializeOwned>(
        method: &str,
        params: Value,
        wrap: fn(T) -> SessionEvent,
    ) -> SessionEvent {
        match serde_json::from_value(params) {
            Ok(params) => wrap(params),
            Err(e) => SessionEvent::ProtocolError {
                message: format!("Invalid {} params: {}", method, e),
            },
        }
    }

    match notification.method.as_str() {
        PublishDiagnostics::METHOD => {
            parse(PublishDiagnostics::METHOD, params, SessionEvent::Diagnostics)
        }
        LogMessage::METHOD => parse(LogMessage::METHOD, params, SessionEvent::LogMessage),
        ShowMessage::METHOD => parse(ShowMessage::METHOD, params, SessionEvent::ShowMessage),
        _ => SessionEvent::Notification {
            method: notification.method,
            params,
        },
    }
}

fn answer_server_request(rpc: &RpcHandle, sink: &dyn EventSink, request: Request) {
    let id = request.id;
    let params = request.params.unwrap_or(Value::Null);

    let response = match request.method.as_str() {
        RegisterCapability::METHOD => match serde_json::from_value(params) {
            Ok(params) => {
                sink.on_event(SessionEvent::CapabilityRegistered(params));
                Response::ok(id, Value::Null)
            }
            Err(e) => Response::error(id, -32602, format!("Invalid params: {}", e)),
        },
        UnregisterCapability::METHOD => match serde_json::from_value(params) {
            Ok(params) => {
                sink.on_event(SessionEvent::CapabilityUnregistered(params));
                Response::ok(id, Value::Null)
            }
            Err(e) => Response::error(id, -32602, format!("Invalid params: {}", e)),
        },
        WorkspaceConfiguration::METHOD => {
            let items = serde_json::from_value::<ConfigurationParams>(params)
                .map(|params| params.items.len())
                .unwrap_or(0);
            Response::ok(id, Value::Array(vec![Value::Null; items]))
        }
        WorkDoneProgressCreate::METHOD => Response::ok(id, Value::Null),
        other => {
            debug!("Unhandled server request: {}", other);
            Response::error(id, METHOD_NOT_FOUND, format!("Unhandled method {}", other))
        }
    };

    if let Err(e) = rpc.reply(response) {
        warn!("Failed to answer server request: {}", e);
    }
}
