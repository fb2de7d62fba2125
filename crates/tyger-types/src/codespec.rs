//! Codespecs (spec §3): immutable, versioned-by-name container specifications.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TygerError};
use crate::quantity::Quantity;

/// `kind` discriminator on the wire (spec §9's tagged-variant note).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodespecKind {
    Job,
    Worker,
}

/// Resource requests/limits, all optional — an absent field means
/// "unbounded" or "scheduler default", never zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Resources {
    pub cpu_request: Option<Quantity>,
    pub cpu_limit: Option<Quantity>,
    pub memory_request: Option<Quantity>,
    pub memory_limit: Option<Quantity>,
    pub gpu: Option<Quantity>,
}

/// Job-only buffer parameter declarations: unique, case-insensitive names,
/// no `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferParameters {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl BufferParameters {
    pub fn validate(&self) -> Result<(), TygerError> {
        let mut seen = std::collections::HashSet::new();
        for name in self.inputs.iter().chain(self.outputs.iter()) {
            if name.contains('/') {
                return Err(TygerError::invalid(format!(
                    "buffer parameter name `{name}` may not contain `/`"
                )));
            }
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(TygerError::invalid(format!(
                    "buffer parameter name `{name}` is not unique (case-insensitive)"
                )));
            }
        }
        Ok(())
    }

    pub fn contains(&self, param: &str) -> bool {
        let lower = param.to_ascii_lowercase();
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .any(|n| n.to_ascii_lowercase() == lower)
    }

    /// All declared parameter names, inputs then outputs, for iteration in
    /// Run Creator (spec §4.3 step 3).
    pub fn all(&self) -> impl Iterator<Item = (&str, bool)> {
        self.inputs
            .iter()
            .map(|n| (n.as_str(), false))
            .chain(self.outputs.iter().map(|n| (n.as_str(), true)))
    }
}

/// Worker-only: binds a TCP port to an optional input/output buffer
/// direction (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Socket {
    pub port: u16,
    #[serde(default)]
    pub input_buffer: Option<String>,
    #[serde(default)]
    pub output_buffer: Option<String>,
}

/// Named ports exposed by a worker codespec, published via a headless
/// service in the cluster backend.
pub type Endpoints = HashMap<String, u16>;

/// The immutable body of a codespec (everything that participates in the
/// content-addressed `Upsert` comparison).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Codespec {
    pub kind: CodespecKind,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    /// Job-only.
    #[serde(default)]
    pub buffers: BufferParameters,
    /// Worker-only.
    #[serde(default)]
    pub endpoints: Endpoints,
    /// Worker-only.
    #[serde(default)]
    pub sockets: Vec<Socket>,
}

fn default_max_replicas() -> u32 {
    1
}

impl Codespec {
    pub fn validate(&self) -> Result<(), TygerError> {
        if self.image.trim().is_empty() {
            return Err(TygerError::invalid("codespec image must not be empty"));
        }
        if self.max_replicas < 1 {
            return Err(TygerError::invalid("maxReplicas must be >= 1"));
        }
        match self.kind {
            CodespecKind::Job => {
                self.buffers.validate()?;
                if !self.endpoints.is_empty() || !self.sockets.is_empty() {
                    return Err(TygerError::invalid(
                        "job codespecs may not declare endpoints or sockets",
                    ));
                }
            }
            CodespecKind::Worker => {
                if !self.buffers.inputs.is_empty() || !self.buffers.outputs.is_empty() {
                    return Err(TygerError::invalid(
                        "worker codespecs may not declare buffer parameters",
                    ));
                }
                self.validate_sockets()?;
            }
        }
        Ok(())
    }

    /// Every buffer referenced by a socket is bound to exactly that socket
    /// and, per the unconditional-restriction open question (spec §9c),
    /// never substitutable into command/args/env regardless of direction.
    fn validate_sockets(&self) -> Result<(), TygerError> {
        let mut bound = std::collections::HashSet::new();
        for socket in &self.sockets {
            for buffer in socket.input_buffer.iter().chain(socket.output_buffer.iter()) {
                if !bound.insert(buffer.clone()) {
                    return Err(TygerError::invalid(format!(
                        "buffer `{buffer}` is bound to more than one socket"
                    )));
                }
            }
        }
        let placeholder_used = |name: &str| {
            let placeholder = format!("$({name})");
            self.command.iter().any(|s| s.contains(&placeholder))
                || self.args.iter().any(|s| s.contains(&placeholder))
                || self.env.values().any(|v| v.contains(&placeholder))
        };
        for buffer in &bound {
            if placeholder_used(buffer) {
                return Err(TygerError::invalid(format!(
                    "socket-bound buffer `{buffer}` may not be referenced in command/args/env"
                )));
            }
        }
        Ok(())
    }
}

/// A reference to a codespec: either committed-by-name or inline (spec §9's
/// `CodespecRef = NamedRef | InlineCodespec`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CodespecRef {
    Named {
        name: String,
        version: Option<u32>,
    },
    Inline { body: Codespec },
}

/// A committed, versioned codespec row as stored by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodespecRecord {
    pub name: String,
    pub version: u32,
    pub body: Codespec,
    pub created_at: DateTime<Utc>,
}

impl CodespecRecord {
    /// `NotFound` error naming the latest available version, per spec
    /// §4.3's "missing version yields an error message that names the
    /// latest available version".
    pub fn missing_version_error(name: &str, requested: u32, latest: u32) -> TygerError {
        TygerError::new(
            ErrorKind::NotFound,
            format!(
                "codespec `{name}` has no version {requested}; latest is {latest}"
            ),
        )
    }
}
