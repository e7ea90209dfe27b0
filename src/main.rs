use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use lsclient::adapter::{ExtensionContext, LanguageClientAdapter, LifecycleAdapter};
use lsclient::lsp::{DocumentEvent, ServerMode, SessionEvent, TransportConfig};
use lsclient::{ClientConfig, ConfigLoader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;

/// Language client launcher
///
/// Launches the configured language server bundle, opens the given files
/// and prints every event the server sends back as one JSON object per line.
#[derive(Parser, Debug)]
#[command(name = "lsclient")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files to open once the server is running
    files: Vec<PathBuf>,

    /// Config file (defaults to .lsclient.toml, $LSCLIENT_CONFIG, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Installation root the bundle directory is resolved against
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Workspace folder announced to the server
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Server mode
    #[arg(short, long, value_enum)]
    mode: Option<ServerMode>,

    /// Transport between client and server
    #[arg(short, long, value_enum)]
    transport: Option<TransportKind>,

    /// Host for the socket and remote transports
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the socket (0 picks a free one) and remote transports
    #[arg(long)]
    port: Option<u16>,

    /// Language id for opened files (defaults to the first selector language)
    #[arg(long)]
    language: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Ipc,
    Stdio,
    Socket,
    /// Attach to a server already listening on --host/--port
    Remote,
}

fn setup_logging(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    // stdout carries events
    if let Some(log_path) = log_file {
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;
        subscriber.with_ansi(false).with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    Ok(())
}

fn apply_overrides(config: &mut ClientConfig, args: &Args) -> Result<()> {
    if let Some(mode) = args.mode {
        config.mode = mode;
    }

    let configured_port = match &config.transport {
        TransportConfig::Socket { port, .. } | TransportConfig::Remote { port, .. } => Some(*port),
        _ => None,
    };
    let port = args.port.or(configured_port);

    match args.transport {
        Some(TransportKind::Ipc) => config.transport = TransportConfig::Ipc,
        Some(TransportKind::Stdio) => config.transport = TransportConfig::Stdio,
        Some(TransportKind::Socket) => {
            config.transport = TransportConfig::Socket {
                host: args.host.clone(),
                port: port.unwrap_or(0),
            }
        }
        Some(TransportKind::Remote) => {
            let Some(port) = port else {
                bail!("--transport remote needs --port");
            };
            config.transport = TransportConfig::Remote {
                host: args.host.clone(),
                port,
            }
        }
        None => match &mut config.transport {
            TransportConfig::Socket { port: current, .. }
            | TransportConfig::Remote { port: current, .. } => {
                if let Some(port) = args.port {
                    *current = port;
                }
            }
            _ => {}
        },
    }

    Ok(())
}

fn open_event(path: &Path, language_id: &str) -> Result<DocumentEvent> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Cannot open {}", path.display()))?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let uri = Url::from_file_path(&path)
        .map_err(|_| anyhow::anyhow!("Not a valid file path: {}", path.display()))?;

    Ok(DocumentEvent::Opened {
        uri,
        language_id: language_id.to_string(),
        version: 1,
        text,
    })
}

fn print_event(event: &SessionEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to serialize event: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.log_file.clone())?;

    info!("Starting lsclient v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ConfigLoader::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args)?;

    let install_root = match &args.root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    info!("Installation root: {}", install_root.display());

    let language_id = match &args.language {
        Some(language) => language.clone(),
        None => config
            .document_selector
            .first()
            .map(|filter| filter.language.clone())
            .context("Document selector is empty")?,
    };

    let (tx, mut events) = mpsc::unbounded_channel::<SessionEvent>();
    let mut adapter = LanguageClientAdapter::new(config, Arc::new(tx));

    if let Some(workspace) = &args.workspace {
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("Cannot open workspace {}", workspace.display()))?;
        let uri = Url::from_directory_path(&workspace)
            .map_err(|_| anyhow::anyhow!("Not a valid directory: {}", workspace.display()))?;
        adapter = adapter.with_root_uri(uri);
    }

    let mut ctx = ExtensionContext::new(install_root);
    let session = match adapter.on_activate(&mut ctx).await {
        Ok(session) => session,
        Err(e) => {
            adapter.on_deactivate(&mut ctx).await?;
            return Err(e.into());
        }
    };

    for file in &args.files {
        match open_event(file, &language_id) {
            Ok(event) => {
                if !session.notify_document(event).await? {
                    warn!("{} is not handled by {}", file.display(), session.name());
                }
            }
            Err(e) => error!("{:#}", e),
        }
    }

    info!("{} ready, press Ctrl-C to stop", session.name());

    let mut crashed = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    print_event(&event);
                    if let SessionEvent::Crashed(exit) = event {
                        crashed = Some(exit);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    adapter.on_deactivate(&mut ctx).await?;

    if let Some(exit) = crashed {
        bail!("Language server exited unexpectedly ({})", exit);
    }

    info!("lsclient shut down successfully");
    Ok(())
}
