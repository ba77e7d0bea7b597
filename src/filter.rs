use crate::error::FilterConfigError;
use crate::model::Operation;
use std::fmt::{Display, Formatter};

const MAX_FILTER_LEN: usize = 256;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FilterField {
    OpId,
    Operation,
    Namespace,
    RunningTime,
    Client,
    Description,
    EffectiveUsers,
}

impl FilterField {
    pub const ALL: [Self; 7] = [
        Self::OpId,
        Self::Operation,
        Self::Namespace,
        Self::RunningTime,
        Self::Client,
        Self::Description,
        Self::EffectiveUsers,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Self::OpId => "OpId",
            Self::Operation => "Operation",
            Self::Namespace => "Namespace",
            Self::RunningTime => "Running ≥ s",
            Self::Client => "Client",
            Self::Description => "Description",
            Self::EffectiveUsers => "Users",
        }
    }

    pub fn next(self) -> Self {
        let index = Self::ALL.iter().position(|field| *field == self).unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }

    pub fn prev(self) -> Self {
        let index = Self::ALL.iter().position(|field| *field == self).unwrap_or(0);
        Self::ALL[(index + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl Display for FilterField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.title())
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FilterCriteria {
    opid: Option<String>,
    operation: Option<String>,
    namespace: Option<String>,
    client: Option<String>,
    description: Option<String>,
    effective_users: Option<String>,
    min_running_secs: Option<u64>,
    show_system_ops: bool,
}

impl FilterCriteria {
    pub fn with_system_ops(show_system_ops: bool) -> Self {
        Self {
            show_system_ops,
            ..Self::default()
        }
    }

    pub fn set(&mut self, field: FilterField, raw: &str) -> Result<(), FilterConfigError> {
        let value = raw.trim();
        if value.chars().count() > MAX_FILTER_LEN {
            return Err(FilterConfigError::InvalidText {
                field,
                value: value.chars().take(24).collect(),
                reason: format!("longer than {MAX_FILTER_LEN} characters"),
            });
        }
        if value.chars().any(char::is_control) {
            return Err(FilterConfigError::InvalidText {
                field,
                value: value.escape_debug().to_string(),
                reason: "contains control characters".to_string(),
            });
        }

        if field == FilterField::RunningTime {
            self.min_running_secs = if value.is_empty() {
                None
            } else {
                Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| FilterConfigError::InvalidNumber {
                            field,
                            value: value.to_string(),
                        })?,
                )
            };
            return Ok(());
        }

        let stored = (!value.is_empty()).then(|| value.to_lowercase());
        match field {
            FilterField::OpId => self.opid = stored,
            FilterField::Operation => self.operation = stored,
            FilterField::Namespace => self.namespace = stored,
            FilterField::Client => self.client = stored,
            FilterField::Description => self.description = stored,
            FilterField::EffectiveUsers => self.effective_users = stored,
            FilterField::RunningTime => {}
        }
        Ok(())
    }

    pub fn value(&self, field: FilterField) -> String {
        match field {
            FilterField::OpId => self.opid.clone().unwrap_or_default(),
            FilterField::Operation => self.operation.clone().unwrap_or_default(),
            FilterField::Namespace => self.namespace.clone().unwrap_or_default(),
            FilterField::RunningTime => self
                .min_running_secs
                .map(|secs| secs.to_string())
                .unwrap_or_default(),
            FilterField::Client => self.client.clone().unwrap_or_default(),
            FilterField::Description => self.description.clone().unwrap_or_default(),
            FilterField::EffectiveUsers => self.effective_users.clone().unwrap_or_default(),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::with_system_ops(self.show_system_ops);
    }

    pub fn show_system_ops(&self) -> bool {
        self.show_system_ops
    }

    pub fn set_show_system_ops(&mut self, show: bool) {
        self.show_system_ops = show;
    }

    pub fn active_count(&self) -> usize {
        FilterField::ALL
            .iter()
            .filter(|field| !self.value(**field).is_empty())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.active_count() == 0
    }
}

pub fn matches(op: &Operation, criteria: &FilterCriteria) -> bool {
    if op.is_system && !criteria.show_system_ops {
        return false;
    }

    if let Some(min) = criteria.min_running_secs
        && op.elapsed_secs < min
    {
        return false;
    }

    contains(criteria.opid.as_deref(), op.id.as_str())
        && contains(criteria.operation.as_deref(), op.op_type.title())
        && contains(criteria.namespace.as_deref(), &op.namespace)
        && contains(
            criteria.client.as_deref(),
            op.client.as_deref().unwrap_or(""),
        )
        && contains(criteria.description.as_deref(), &op.description)
        && criteria.effective_users.as_deref().is_none_or(|needle| {
            op.effective_users
                .iter()
                .any(|user| user.to_lowercase().contains(needle))
        })
}

pub fn apply(operations: &[Operation], criteria: &FilterCriteria) -> Vec<Operation> {
    operations
        .iter()
        .filter(|op| matches(op, criteria))
        .cloned()
        .collect()
}

fn contains(needle: Option<&str>, haystack: &str) -> bool {
    match needle {
        Some(needle) => haystack.to_lowercase().contains(needle),
        None => true,
    }
}
