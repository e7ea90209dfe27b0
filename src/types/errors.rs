use crate::lsp::{ServerMode, SessionState};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Server bundle not found for {mode} mode: {}", .path.display())]
    Resolution { mode: ServerMode, path: PathBuf },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Initialize handshake failed: {0}")]
    Handshake(String),

    #[error("LSP protocol error: {0}")]
    Protocol(String),

    #[error("Language server exited unexpectedly ({})", describe_exit(.code, .signal))]
    Crash {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("Server returned error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("Request timeout after {0}s")]
    Timeout(u64),

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Session start cancelled by stop()")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while setting up or using a message channel.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server did not connect within {0}s")]
    AcceptTimeout(u64),

    #[error("transport not supported: {0}")]
    Unsupported(&'static str),
}

pub(crate) fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*code, *signal) {
        (Some(code), _) => format!("exit code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "connection closed".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
