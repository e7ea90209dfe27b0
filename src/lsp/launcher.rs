//! Server launcher
//!
//! Resolves which bundle to run for a mode, spawns it with the transport's
//! arguments and hands back a connected channel plus the process handle.

use crate::config::ServerLaunchConfig;
use crate::lsp::process::ProcessHandle;
use crate::lsp::transport::{connect_remote, MessageChannel, PreparedTransport, TransportConfig};
use crate::types::ClientError;
use async_trait::async_trait;
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Optimized bundle
    #[default]
    Run,
    /// Unoptimized bundle with debugger flags
    Debug,
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMode::Run => write!(f, "run"),
            ServerMode::Debug => write!(f, "debug"),
        }
    }
}

/// What to execute for one mode. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    mode: ServerMode,
    executable_path: PathBuf,
    extra_args: Vec<String>,
    runtime: Option<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl ServerDescriptor {
    pub fn new(mode: ServerMode, executable_path: PathBuf, extra_args: Vec<String>) -> Self {
        Self {
            mode,
            executable_path,
            extra_args,
            runtime: None,
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Run the bundle through an interpreter instead of executing it
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn mode(&self) -> ServerMode {
        self.mode
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    pub fn runtime(&self) -> Option<&str> {
        self.runtime.as_deref()
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Program and argument list. Extra arguments belong to the runtime when
    /// there is one (`node --nolazy bundle.js --pipe=...`), otherwise they go
    /// to the bundle itself. Transport arguments always come last.
    pub fn command_line(&self, transport_args: &[String]) -> (String, Vec<String>) {
        let bundle = self.executable_path.to_string_lossy().into_owned();
        let mut args = self.extra_args.clone();

        let program = match &self.runtime {
            Some(runtime) => {
                args.push(bundle);
                runtime.clone()
            }
            None => bundle,
        };

        args.extend(transport_args.iter().cloned());
        (program, args)
    }
}

/// Run and debug descriptors side by side, so a session can start in
/// either mode without resolving paths again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub run: ServerDescriptor,
    pub debug: ServerDescriptor,
}

impl ServerOptions {
    pub fn get(&self, mode: ServerMode) -> &ServerDescriptor {
        match mode {
            ServerMode::Run => &self.run,
            ServerMode::Debug => &self.debug,
        }
    }
}

/// A connected server: the message channel and, for spawned servers, the
/// process behind it.
pub struct ServerConnection {
    pub channel: MessageChannel,
    pub process: Option<ProcessHandle>,
}

/// Produces a live connection for a descriptor. `ServerLauncher` spawns real
/// processes; tests plug in in-memory servers.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        transport: &TransportConfig,
    ) -> Result<ServerConnection, ClientError>;
}

pub struct ServerLauncher {
    install_root: PathBuf,
    config: ServerLaunchConfig,
    connect_timeout: Duration,
}

impl ServerLauncher {
    pub fn new(install_root: PathBuf, config: ServerLaunchConfig) -> Self {
        Self {
            install_root,
            config,
            connect_timeout: Duration::from_secs(crate::config::defaults::DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// How long a listening transport waits for the server to connect back
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ServerLaunchConfig {
        &self.config
    }

    /// `<install_root>/<bundle_dir>/<bundle name for mode>`
    pub fn bundle_path(&self, mode: ServerMode) -> PathBuf {
        self.install_root
            .join(&self.config.bundle_dir)
            .join(self.config.bundle_name(mode))
            .clean()
    }

    pub fn resolve(&self, mode: ServerMode) -> ServerDescriptor {
        let mut descriptor = ServerDescriptor::new(
            mode,
            self.bundle_path(mode),
            self.config.extra_args(mode),
        )
        .with_env(self.config.env.clone());

        if let Some(runtime) = self.config.runtime() {
            descriptor = descriptor.with_runtime(runtime);
        }
        if let Some(cwd) = &self.config.cwd {
            descriptor = descriptor.with_cwd(self.install_root.join(cwd).clean());
        }

        descriptor
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            run: self.resolve(ServerMode::Run),
            debug: self.resolve(ServerMode::Debug),
        }
    }

    /// Spawn the server described by `descriptor` and attach `transport`.
    /// A `Remote` transport dials the running server instead; the bundle is
    /// not needed then.
    pub async fn launch(
        &self,
        descriptor: &ServerDescriptor,
        transport: &TransportConfig,
    ) -> Result<ServerConnection, ClientError> {
        if let TransportConfig::Remote { host, port } = transport {
            info!("Attaching to running language server at {}:{}", host, port);
            let channel = connect_remote(host, *port, self.connect_timeout).await?;
            return Ok(ServerConnection {
                channel,
                process: None,
            });
        }

        if !descriptor.executable_path().is_file() {
            return Err(ClientError::Resolution {
                mode: descriptor.mode(),
                path: descriptor.executable_path().to_path_buf(),
            });
        }

        let prepared = PreparedTransport::prepare(transport).await?;
        let (program, args) = descriptor.command_line(&prepared.server_args());

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(descriptor.env())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = descriptor.cwd() {
            command.current_dir(cwd);
        }
        prepared.configure(&mut command);

        info!(
            "Launching language server ({} mode, {}): {} {:?}",
            descriptor.mode(),
            transport,
            program,
            args
        );

        let mut child = command.spawn().map_err(|source| ClientError::Spawn {
            program: program.clone(),
            source,
        })?;
        debug!("Spawned {} with pid {:?}", program, child.id());

        // On failure the child is dropped here and killed by kill_on_drop
        let channel = prepared.connect(&mut child, self.connect_timeout).await?;

        Ok(ServerConnection {
            channel,
            process: Some(ProcessHandle::supervise(child, program)),
        })
    }
}

#[async_trait]
impl ServerConnector for ServerLauncher {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        transport: &TransportConfig,
    ) -> Result<ServerConnection, ClientError> {
        self.launch(descriptor, transport).await
    }
}
