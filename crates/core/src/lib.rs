//! Vigil core types: declarations, resource metadata, errors, clock.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};

/// A served resource kind as reported by discovery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceMeta {
    pub kind: String,
    /// Plural resource name, e.g. "configmaps".
    pub plural: String,
    pub namespaced: bool,
}

/// One requested reference to a remote object.
///
/// The alias is the caller-chosen unique key; templates may be literals or
/// backtick expressions referencing earlier declarations. Resolved identity
/// and the observed object are filled in by the poll loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Declaration {
    pub alias: String,
    pub kind: String,
    pub api_version: String,
    pub name_template: String,
    pub namespace_template: Option<String>,
    /// Resolved name, present only after successful template evaluation.
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub meta: Option<ResourceMeta>,
    /// Latest observed object, absent when the read reported not-found.
    pub obj: Option<serde_json::Value>,
    /// Templates are evaluated exactly once; this latches on success.
    pub evaluated: bool,
    /// Set when the object was created through the store rather than merely
    /// observed; such objects are deleted on teardown.
    pub created: bool,
}

impl Declaration {
    pub fn new(
        alias: &str,
        kind: &str,
        api_version: &str,
        name_template: &str,
        namespace_template: Option<&str>,
    ) -> Self {
        Self {
            alias: alias.to_string(),
            kind: kind.to_string(),
            api_version: api_version.to_string(),
            name_template: name_template.to_string(),
            namespace_template: namespace_template.map(|s| s.to_string()),
            name: None,
            namespace: None,
            meta: None,
            obj: None,
            evaluated: false,
            created: false,
        }
    }

    /// Introspection view exposed to expressions via `decl("alias")`.
    pub fn info(&self) -> DeclInfo {
        DeclInfo {
            kind: self.kind.clone(),
            api_version: self.api_version.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            evaluated: self.evaluated,
        }
    }
}

/// Resolved identity of a declaration, without the observed object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclInfo {
    pub kind: String,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub evaluated: bool,
}

/// Errors surfaced by the verification engine.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    #[error("resource {0} already declared")]
    AlreadyDeclared(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("discovery unavailable for {api_version}: {message}")]
    DiscoveryUnavailable { api_version: String, message: String },
    #[error("template unresolved for {alias}: {message}")]
    TemplateUnresolved { alias: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient api failure (status {code}): {message}")]
    Transient { code: u16, message: String },
    #[error("wait timeout: {0}")]
    WaitTimeout(String),
    #[error("wait failed: unless expression {0:?} held")]
    UnlessHeld(String),
    #[error("expression: {0}")]
    Expr(String),
    #[error("{0}")]
    Internal(String),
}

pub type VigilResult<T> = Result<T, VigilError>;
