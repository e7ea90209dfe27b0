//! Host lifecycle binding
//!
//! Editors activate a language client once per extension load and tear it
//! down on deactivation. `ExtensionContext` models what the host hands over
//! (installation root and a disposal list); `LifecycleAdapter` is the
//! narrow interface a host calls into.

use crate::config::ClientConfig;
use crate::lsp::{ClientOptions, ClientSession, EventSink, ServerConnector, ServerLauncher};
use crate::types::ClientError;
use async_trait::async_trait;
use lsp_types::Url;
use path_clean::PathClean;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Something to release when the extension deactivates
#[async_trait]
pub trait Disposable: Send + Sync {
    async fn dispose(&self);
}

#[async_trait]
impl Disposable for Arc<ClientSession> {
    async fn dispose(&self) {
        if let Err(e) = self.stop().await {
            warn!("Failed to stop {}: {}", self.name(), e);
        }
    }
}

/// What the host provides on activation
pub struct ExtensionContext {
    install_root: PathBuf,
    subscriptions: Vec<Box<dyn Disposable>>,
}

impl ExtensionContext {
    pub fn new(install_root: PathBuf) -> Self {
        Self {
            install_root,
            subscriptions: Vec::new(),
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Resolve a path relative to the installation root
    pub fn as_absolute_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.install_root.join(relative).clean()
    }

    pub fn push_subscription(&mut self, disposable: Box<dyn Disposable>) {
        self.subscriptions.push(disposable);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Dispose everything, most recently registered first
    pub async fn dispose_all(&mut self) {
        debug!("Disposing {} subscriptions", self.subscriptions.len());
        while let Some(disposable) = self.subscriptions.pop() {
            disposable.dispose().await;
        }
    }
}

#[async_trait]
pub trait LifecycleAdapter: Send {
    async fn on_activate(
        &mut self,
        ctx: &mut ExtensionContext,
    ) -> Result<Arc<ClientSession>, ClientError>;

    async fn on_deactivate(&mut self, ctx: &mut ExtensionContext) -> Result<(), ClientError>;
}

/// Builds one session from a `ClientConfig`, starts it on activation and
/// registers its stop with the context.
pub struct LanguageClientAdapter {
    config: ClientConfig,
    sink: Arc<dyn EventSink>,
    root_uri: Option<Url>,
    connector: Option<Arc<dyn ServerConnector>>,
    session: Option<Arc<ClientSession>>,
}

impl LanguageClientAdapter {
    pub fn new(config: ClientConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            root_uri: None,
            connector: None,
            session: None,
        }
    }

    /// Workspace folder announced to the server
    pub fn with_root_uri(mut self, root_uri: Url) -> Self {
        self.root_uri = Some(root_uri);
        self
    }

    /// Connect through `connector` instead of spawning the configured bundle
    pub fn with_connector(mut self, connector: Arc<dyn ServerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn session(&self) -> Option<&Arc<ClientSession>> {
        self.session.as_ref()
    }
}

#[async_trait]
impl LifecycleAdapter for LanguageClientAdapter {
    async fn on_activate(
        &mut self,
        ctx: &mut ExtensionContext,
    ) -> Result<Arc<ClientSession>, ClientError> {
        if self.session.is_some() {
            return Err(ClientError::Config(format!(
                "{} is already active",
                self.config.name
            )));
        }

        let launcher = ServerLauncher::new(ctx.install_root().to_path_buf(), self.config.server.clone())
            .with_connect_timeout(self.config.connect_timeout());
        let options = ClientOptions::from_config(&self.config, &launcher, self.root_uri.clone())?;
        let connector: Arc<dyn ServerConnector> = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(launcher),
        };

        let session = Arc::new(ClientSession::new(options, connector, Arc::clone(&self.sink)));

        // Registered before starting so a failed start is still cleaned up
        ctx.push_subscription(Box::new(Arc::clone(&session)));
        self.session = Some(Arc::clone(&session));

        info!("Activating {}", self.config.name);
        session.start().await?;
        Ok(session)
    }

    async fn on_deactivate(&mut self, ctx: &mut ExtensionContext) -> Result<(), ClientError> {
        info!("Deactivating {}", self.config.name);
        ctx.dispose_all().await;
        self.session = None;
        Ok(())
    }
}
