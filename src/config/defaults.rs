//! Built-in defaults
//!
//! These reproduce the HOCON language client setup: a Scala.js server bundle
//! run under node, talking over IPC, attached to `file` buffers of language
//! `hocon`.

use crate::lsp::DocumentFilter;
use std::path::PathBuf;

pub const DEFAULT_CLIENT_NAME: &str = "HOCON Language Server";
pub const DEFAULT_RUN_BUNDLE: &str = "hoconcolorizer-opt.js";
pub const DEFAULT_DEBUG_BUNDLE: &str = "hoconcolorizer-fastopt.js";
pub const DEFAULT_RUNTIME: &str = "node";
pub const DEFAULT_DEBUG_PORT: u16 = 6009;

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

pub fn default_bundle_dir() -> PathBuf {
    PathBuf::from("target").join("scala-2.11")
}

pub fn default_document_selector() -> Vec<DocumentFilter> {
    vec![DocumentFilter::new("file", "hocon")]
}

/// Debugger flags for node: eager compilation and a fixed inspector port
pub fn default_debug_args(port: u16) -> Vec<String> {
    vec!["--nolazy".to_string(), format!("--debug={}", port)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_debug_args() {
        assert_eq!(
            default_debug_args(DEFAULT_DEBUG_PORT),
            vec!["--nolazy".to_string(), "--debug=6009".to_string()]
        );
    }

    #[test]
    fn test_default_selector_targets_hocon_files() {
        let selector = default_document_selector();
        assert_eq!(selector.len(), 1);
        assert_eq!(selector[0].scheme, "file");
        assert_eq!(selector[0].language, "hocon");
    }
}
