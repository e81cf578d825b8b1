//! Failure classification
//!
//! Transport failures blame the proxy and cost the task a small slice of its
//! budget. Everything else is a logic failure: the proxy is not blamed and the task
//! pays a full attempt.

use std::collections::HashSet;

use crate::error::{CrawlError, TransportKind};

/// Class of a task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transport(TransportKind),
    Logic,
}

impl FailureClass {
    pub fn is_transport(&self) -> bool {
        matches!(self, FailureClass::Transport(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transport(kind) => kind.as_str(),
            FailureClass::Logic => "logic",
        }
    }
}

/// Decides how a task failure is charged
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &CrawlError) -> FailureClass;
}

/// Classifies by the error's transport kind against a configurable set
#[derive(Debug, Clone)]
pub struct DefaultClassifier {
    transport_kinds: HashSet<TransportKind>,
}

impl DefaultClassifier {
    /// Every transport kind counts as a transport failure
    pub fn new() -> Self {
        Self {
            transport_kinds: TransportKind::ALL.iter().copied().collect(),
        }
    }

    /// Treat `kind` as a logic failure instead
    pub fn without(mut self, kind: TransportKind) -> Self {
        self.transport_kinds.remove(&kind);
        self
    }

    pub fn with(mut self, kind: TransportKind) -> Self {
        self.transport_kinds.insert(kind);
        self
    }

    pub fn is_transport_kind(&self, kind: TransportKind) -> bool {
        self.transport_kinds.contains(&kind)
    }
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &CrawlError) -> FailureClass {
        match error.transport_kind() {
            Some(kind) if self.transport_kinds.contains(&kind) => FailureClass::Transport(kind),
            _ => FailureClass::Logic,
        }
    }
}
