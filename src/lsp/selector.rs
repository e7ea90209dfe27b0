//! Document selection
//!
//! A session only forwards events for buffers whose `{scheme, language}`
//! matches one of its filters.

use crate::types::ClientError;
use lsp_types::{TextDocumentContentChangeEvent, Url};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentFilter {
    pub scheme: String,
    pub language: String,
}

impl DocumentFilter {
    pub fn new(scheme: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            language: language.into(),
        }
    }

    pub fn matches(&self, scheme: &str, language: &str) -> bool {
        self.scheme == scheme && self.language == language
    }
}

/// Non-empty set of document filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSelector {
    filters: Vec<DocumentFilter>,
}

impl DocumentSelector {
    pub fn new(filters: Vec<DocumentFilter>) -> Result<Self, ClientError> {
        let mut unique: Vec<DocumentFilter> = Vec::with_capacity(filters.len());
        for filter in filters {
            if !unique.contains(&filter) {
                unique.push(filter);
            }
        }

        if unique.is_empty() {
            return Err(ClientError::Config(
                "document selector is empty; the session would never activate".to_string(),
            ));
        }

        Ok(Self { filters: unique })
    }

    pub fn filters(&self) -> &[DocumentFilter] {
        &self.filters
    }

    pub fn matches(&self, scheme: &str, language: &str) -> bool {
        self.filters.iter().any(|f| f.matches(scheme, language))
    }

    pub fn matches_event(&self, event: &DocumentEvent) -> bool {
        self.matches(event.scheme(), event.language_id())
    }
}

/// An editor buffer event, tagged with the buffer's language.
/// The scheme is taken from the document URI.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    Opened {
        uri: Url,
        language_id: String,
        version: i32,
        text: String,
    },
    Changed {
        uri: Url,
        language_id: String,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
    },
    Saved {
        uri: Url,
        language_id: String,
        text: Option<String>,
    },
    Closed {
        uri: Url,
        language_id: String,
    },
}

impl DocumentEvent {
    pub fn uri(&self) -> &Url {
        match self {
            DocumentEvent::Opened { uri, .. }
            | DocumentEvent::Changed { uri, .. }
            | DocumentEvent::Saved { uri, .. }
            | DocumentEvent::Closed { uri, .. } => uri,
        }
    }

    pub fn language_id(&self) -> &str {
        match self {
            DocumentEvent::Opened { language_id, .. }
            | DocumentEvent::Changed { language_id, .. }
            | DocumentEvent::Saved { language_id, .. }
            | DocumentEvent::Closed { language_id, .. } => language_id,
        }
    }

    pub fn scheme(&self) -> &str {
        self.uri().scheme()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DocumentEvent::Opened { .. } => "open",
            DocumentEvent::Changed { .. } => "change",
            DocumentEvent::Saved { .. } => "save",
            DocumentEvent::Closed { .. } => "close",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened(uri: &str, language: &str) -> DocumentEvent {
        DocumentEvent::Opened {
            uri: Url::parse(uri).unwrap(),
            language_id: language.to_string(),
            version: 1,
            text: String::new(),
        }
    }

    #[test]
    fn test_empty_selector_is_invalid() {
        assert!(matches!(
            DocumentSelector::new(vec![]),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_filters_collapse() {
        let selector = DocumentSelector::new(vec![
            DocumentFilter::new("file", "hocon"),
            DocumentFilter::new("file", "hocon"),
        ])
        .unwrap();
        assert_eq!(selector.filters().len(), 1);
    }

    #[test]
    fn test_matches_scheme_and_language() {
        let selector = DocumentSelector::new(vec![DocumentFilter::new("file", "hocon")]).unwrap();

        assert!(selector.matches_event(&opened("file:///app/application.conf", "hocon")));
        assert!(!selector.matches_event(&opened("file:///app/package.json", "json")));
        assert!(!selector.matches_event(&opened("untitled:Untitled-1", "hocon")));
    }

    #[test]
    fn test_event_accessors() {
        let event = DocumentEvent::Closed {
            uri: Url::parse("file:///tmp/a.conf").unwrap(),
            language_id: "hocon".to_string(),
        };
        assert_eq!(event.scheme(), "file");
        assert_eq!(event.language_id(), "hocon");
        assert_eq!(event.kind(), "close");
    }
}
