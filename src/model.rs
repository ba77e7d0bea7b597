use chrono::{DateTime, Local};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

pub const MIN_REFRESH_INTERVAL_SECS: u64 = 1;
pub const MAX_REFRESH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;

const SYSTEM_NAMESPACE_PREFIXES: [&str; 3] = ["admin.", "config.", "local."];
const SYSTEM_USER: &str = "__system";

/// Server-assigned operation identifier.
///
/// Plain servers report integers, sharded clusters report `shard:1234`; both are
/// kept in their display form and only converted when a kill is issued.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    Numeric(i64),
    Named(String),
}

impl OpId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn kill_target(&self) -> KillTarget {
        if !self.0.contains(':')
            && let Ok(numeric) = self.0.parse::<i64>()
        {
            return KillTarget::Numeric(numeric);
        }
        KillTarget::Named(self.0.clone())
    }

    /// Numeric part of a `shard:1234` id, used when the router rejects the full form.
    pub fn shard_local_part(&self) -> Option<i64> {
        let (_, local) = self.0.split_once(':')?;
        local.parse::<i64>().ok()
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum OperationType {
    Query,
    Insert,
    Update,
    Remove,
    GetMore,
    Command,
    KillCursors,
    None,
    Other(String),
}

impl OperationType {
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "query" => Self::Query,
            "insert" => Self::Insert,
            "update" => Self::Update,
            "remove" | "delete" => Self::Remove,
            "getmore" => Self::GetMore,
            "command" => Self::Command,
            "killcursors" => Self::KillCursors,
            "" | "none" => Self::None,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Query => "query",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::GetMore => "getmore",
            Self::Command => "command",
            Self::KillCursors => "killcursors",
            Self::None => "none",
            Self::Other(token) => token,
        }
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.title())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: OpId,
    pub namespace: String,
    pub op_type: OperationType,
    pub elapsed_secs: u64,
    pub client: Option<String>,
    pub description: String,
    pub effective_users: Vec<String>,
    pub is_system: bool,
    pub extra: BTreeMap<String, Value>,
}

impl Operation {
    pub fn new(id: impl Into<String>, op_type: OperationType, elapsed_secs: u64) -> Self {
        Self {
            id: OpId::new(id),
            namespace: String::new(),
            op_type,
            elapsed_secs,
            client: None,
            description: String::new(),
            effective_users: Vec::new(),
            is_system: false,
            extra: BTreeMap::new(),
        }
    }

    pub fn users_label(&self) -> String {
        if self.effective_users.is_empty() {
            "N/A".to_string()
        } else {
            self.effective_users.join(", ")
        }
    }

    pub fn detail_text(&self) -> String {
        let mut lines = vec![
            format!("Operation ID: {}", self.id),
            format!("Type: {}", self.op_type),
            format!(
                "Namespace: {}",
                if self.namespace.is_empty() {
                    "N/A"
                } else {
                    &self.namespace
                }
            ),
            format!("Running Time: {}s", self.elapsed_secs),
            format!("Client: {}", self.client.as_deref().unwrap_or("N/A")),
            format!("Effective Users: {}", self.users_label()),
            format!(
                "Description: {}",
                if self.description.is_empty() {
                    "N/A"
                } else {
                    &self.description
                }
            ),
            format!("System Operation: {}", if self.is_system { "yes" } else { "no" }),
        ];

        if let Some(plan) = self.extra.get("planSummary").and_then(Value::as_str) {
            lines.push(format!("Plan Summary: {plan}"));
        }

        if !self.extra.is_empty() {
            lines.push(String::new());
            lines.push("Raw Fields:".to_string());
            let rendered = serde_json::to_string_pretty(&self.extra)
                .unwrap_or_else(|error| format!("<unprintable: {error}>"));
            lines.extend(rendered.lines().map(str::to_string));
        }

        lines.join("\n")
    }
}

pub fn is_system_operation(
    namespace: &str,
    op_type: &OperationType,
    effective_users: &[String],
    has_cursor_command: bool,
) -> bool {
    let namespace = namespace.to_ascii_lowercase();
    if SYSTEM_NAMESPACE_PREFIXES
        .iter()
        .any(|prefix| namespace.starts_with(prefix))
    {
        return true;
    }

    if *op_type == OperationType::None {
        return true;
    }

    if effective_users.iter().any(|user| user == SYSTEM_USER) {
        return true;
    }

    *op_type == OperationType::Command && has_cursor_command
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    operations: Vec<Operation>,
    fetched_at: Option<DateTime<Local>>,
    generation: u64,
}

impl Snapshot {
    pub fn new(
        operations: Vec<Operation>,
        fetched_at: Option<DateTime<Local>>,
        generation: u64,
    ) -> Self {
        Self {
            operations,
            fetched_at,
            generation,
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Operation> {
        self.operations.get(index)
    }

    pub fn position(&self, id: &OpId) -> Option<usize> {
        self.operations.iter().position(|op| &op.id == id)
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.position(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &OpId> {
        self.operations.iter().map(|op| &op.id)
    }

    pub fn fetched_at(&self) -> Option<DateTime<Local>> {
        self.fetched_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

impl SortDirection {
    pub fn toggled(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Ascending => "ascending",
            Self::Descending => "descending",
        }
    }

    pub fn arrow(self) -> &'static str {
        match self {
            Self::Ascending => "↑",
            Self::Descending => "↓",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorSource {
    Connect,
    Fetch,
    Terminate,
    FilterConfig,
}

impl ErrorSource {
    pub fn label(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Fetch => "fetch",
            Self::Terminate => "kill",
            Self::FilterConfig => "filter",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub source: ErrorSource,
    pub message: String,
    pub at: DateTime<Local>,
}

impl ErrorRecord {
    pub fn now(source: ErrorSource, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
            at: Local::now(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "[{}] {} error: {}",
            self.at.format("%H:%M:%S"),
            self.source.label(),
            self.message
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshState {
    pub(crate) paused: bool,
    pub(crate) interval_secs: u64,
    pub(crate) fetch_in_flight: bool,
    pub(crate) last_error: Option<ErrorRecord>,
    pub(crate) last_refreshed: Option<DateTime<Local>>,
    pub(crate) consecutive_failures: u32,
}

impl RefreshState {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            paused: false,
            interval_secs: clamp_interval(interval_secs),
            fetch_in_flight: false,
            last_error: None,
            last_refreshed: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    pub fn is_fetch_in_flight(&self) -> bool {
        self.fetch_in_flight
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error.as_ref()
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Local>> {
        self.last_refreshed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

pub fn clamp_interval(secs: u64) -> u64 {
    secs.clamp(MIN_REFRESH_INTERVAL_SECS, MAX_REFRESH_INTERVAL_SECS)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected(String),
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected(_) => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum KillOutcome {
    Terminated,
    NotFound,
    Failed(String),
}

impl KillOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Terminated | Self::NotFound)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BatchKillResult {
    pub entries: Vec<(OpId, KillOutcome)>,
}

impl BatchKillResult {
    pub fn push(&mut self, id: OpId, outcome: KillOutcome) {
        self.entries.push((id, outcome));
    }

    #[cfg(test)]
    pub fn outcome(&self, id: &OpId) -> Option<&KillOutcome> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == id)
            .map(|(_, outcome)| outcome)
    }

    pub fn succeeded(&self) -> Vec<&OpId> {
        self.entries
            .iter()
            .filter(|(_, outcome)| outcome.is_success())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn failed(&self) -> Vec<(&OpId, &str)> {
        self.entries
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                KillOutcome::Failed(reason) => Some((id, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        let succeeded = self.succeeded();
        let failed = self.failed();
        let noun = |count: usize| if count == 1 { "operation" } else { "operations" };

        let mut parts = Vec::new();
        if !succeeded.is_empty() {
            parts.push(format!(
                "Killed {} {}: {}",
                succeeded.len(),
                noun(succeeded.len()),
                join_ids(succeeded.iter().copied())
            ));
        }
        if !failed.is_empty() {
            parts.push(format!(
                "Failed to kill {} {}: {}",
                failed.len(),
                noun(failed.len()),
                join_ids(failed.iter().map(|(id, _)| *id))
            ));
        }
        if parts.is_empty() {
            return "No operations were killed".to_string();
        }
        parts.join("; ")
    }
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a OpId>) -> String {
    ids.map(OpId::as_str).collect::<Vec<_>>().join(", ")
}
