//! Core types for declarative resource management

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{Error, Result};

static KIND_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(::[A-Za-z][A-Za-z0-9_]*)+$").expect("Invalid kind regex")
});

/// Check that a resource kind has the `provider::Type` shape
pub fn validate_kind(kind: &str) -> Result<()> {
    if KIND_PATTERN.is_match(kind) {
        Ok(())
    } else {
        Err(Error::InvalidKind(kind.to_string()))
    }
}

/// Check that a name can be used as a single FQN segment
pub fn validate_segment(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name == "." || name == ".." {
        "relative path components are not allowed"
    } else if name.contains(['/', '\\']) {
        "name contains a path separator"
    } else if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        "name contains whitespace or control characters"
    } else {
        return Ok(());
    };
    Err(Error::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Deployment partition; every FQN of a run starts with `app/stage`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stage {
    /// Application name
    pub app: String,
    /// Stage name (e.g. `dev`, `prod`, a user name)
    pub name: String,
}

impl Stage {
    /// Create a stage, validating both names as FQN segments
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let app = app.into();
        let name = name.into();
        validate_segment(&app)?;
        validate_segment(&name)?;
        Ok(Self { app, name })
    }

    /// FQN of the stage's root scope
    pub fn root_fqn(&self) -> Fqn {
        Fqn(format!("{}/{}", self.app, self.name))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.name)
    }
}

/// Fully-qualified name: `app/stage/<scope chain>/<resource id>`
///
/// Deterministic across runs for the same program structure, which is what
/// lets a run find the state a previous run recorded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fqn(String);

impl Fqn {
    /// Build an FQN from validated segments
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parts = Vec::new();
        for segment in segments {
            let segment = segment.as_ref();
            validate_segment(segment)?;
            parts.push(segment.to_string());
        }
        if parts.is_empty() {
            return Err(Error::InvalidName {
                name: String::new(),
                reason: "an FQN needs at least one segment",
            });
        }
        Ok(Self(parts.join("/")))
    }

    /// FQN of a direct child
    pub fn child(&self, name: &str) -> Result<Self> {
        validate_segment(name)?;
        Ok(Self(format!("{}/{}", self.0, name)))
    }

    /// FQN of the enclosing scope or resource
    pub fn parent(&self) -> Option<Self> {
        self.0.rsplit_once('/').map(|(parent, _)| Self(parent.to_string()))
    }

    /// Last segment
    pub fn name(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }

    /// All segments, outermost first
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Number of segments
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Whether this FQN belongs to `stage`
    pub fn is_within(&self, stage: &Stage) -> bool {
        self.is_descendant_of(&stage.root_fqn())
    }

    /// Whether `ancestor` is a strict prefix of this FQN
    pub fn is_descendant_of(&self, ancestor: &Fqn) -> bool {
        self.0
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// The FQN as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unchecked conversion, for FQNs read back from a state store
impl From<&str> for Fqn {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Fqn {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Fqn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of one declared resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// Resource kind, e.g. `cloudflare::Bucket`
    pub kind: String,
    /// Logical id, unique within the declaring scope
    pub id: String,
    /// Fully-qualified name
    pub fqn: Fqn,
    /// Position in the run's declaration order
    pub seq: u64,
}

/// Lifecycle phase a handler is invoked in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// How the children of one owner are torn down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestroyStrategy {
    /// One at a time, newest first
    #[default]
    Sequential,
    /// All at once
    Parallel,
}

/// Ordering of the two halves of a replacement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    /// Create the new instance; delete the old one at the end of the run
    #[default]
    CreateBeforeDelete,
    /// Delete the old instance first, then create the new one
    DeleteBeforeCreate,
}

/// Per-resource private key-value data persisted across runs
pub type PrivateData = BTreeMap<String, Value>;

/// A superseded instance awaiting deletion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplacedInstance {
    pub kind: String,
    pub seq: u64,
    pub props: Value,
    pub output: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: PrivateData,
    /// Declared in a local scope; deleted against local emulation too
    #[serde(default)]
    pub local: bool,
}

/// Persisted state of one FQN
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub kind: String,
    pub id: String,
    pub fqn: Fqn,
    pub seq: u64,
    pub props: Value,
    pub output: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: PrivateData,
    /// FQNs this resource was declared to depend on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Fqn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaced: Vec<ReplacedInstance>,
    /// Declared in a local scope
    #[serde(default)]
    pub local: bool,
}

impl StateRecord {
    /// Identity of the live instance
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            kind: self.kind.clone(),
            id: self.id.clone(),
            fqn: self.fqn.clone(),
            seq: self.seq,
        }
    }

    /// Move the live instance into the replaced list
    pub fn retire(&mut self) {
        self.replaced.push(ReplacedInstance {
            kind: self.kind.clone(),
            seq: self.seq,
            props: self.props.take(),
            output: self.output.take(),
            data: std::mem::take(&mut self.data),
            local: self.local,
        });
    }
}

/// What a run does with declared resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Reconcile: create, update, replace, delete orphans
    #[default]
    Up,
    /// Return stored outputs without invoking handlers or deleting anything
    Read,
}

/// Options for a single run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Run against local emulation instead of real services
    pub local: bool,
    /// Allow handlers to take over pre-existing remote objects
    pub adopt: bool,
    /// Strategy for children of plain scopes and unknown owners
    pub default_strategy: DestroyStrategy,
}

/// Result of reconciling one FQN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    Created,
    Updated,
    Replaced,
    Deleted,
    /// Stored output returned in read mode
    Read,
    Failed { error: String },
    Skipped { reason: String },
}

impl ApplyResult {
    /// Check if the result represents success (no failure)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Check if the result represents a change
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Deleted
        )
    }
}

/// Counts of results in a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub read: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    /// Check if the run was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of results
    pub fn total(&self) -> usize {
        self.total_changes() + self.read + self.failed + self.skipped
    }

    /// Add a result to the summary
    pub fn add_result(&mut self, result: &ApplyResult) {
        match result {
            ApplyResult::Created => self.created += 1,
            ApplyResult::Updated => self.updated += 1,
            ApplyResult::Replaced => self.replaced += 1,
            ApplyResult::Deleted => self.deleted += 1,
            ApplyResult::Read => self.read += 1,
            ApplyResult::Failed { .. } => self.failed += 1,
            ApplyResult::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Outcome of a finished run, attributed per FQN
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub stage: Stage,
    pub summary: RunSummary,
    /// Results in completion order
    pub results: Vec<(Fqn, ApplyResult)>,
}

impl RunReport {
    /// Build a report from results
    pub fn new(stage: Stage, results: Vec<(Fqn, ApplyResult)>) -> Self {
        let mut summary = RunSummary::default();
        for (_, result) in &results {
            summary.add_result(result);
        }
        Self {
            stage,
            summary,
            results,
        }
    }

    /// Last result recorded for `fqn`
    pub fn result_for(&self, fqn: &Fqn) -> Option<&ApplyResult> {
        self.results
            .iter()
            .rev()
            .find(|(f, _)| f == fqn)
            .map(|(_, r)| r)
    }

    /// FQNs and messages of failed results
    pub fn failures(&self) -> impl Iterator<Item = (&Fqn, &str)> {
        self.results.iter().filter_map(|(fqn, result)| match result {
            ApplyResult::Failed { error } => Some((fqn, error.as_str())),
            _ => None,
        })
    }

    /// Check if the run was fully successful
    pub fn is_success(&self) -> bool {
        self.summary.is_success()
    }
}
