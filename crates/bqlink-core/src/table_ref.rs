//! Warehouse table references.

use std::fmt;

use crate::error::{ConnectorError, Result};

/// A `{project, dataset, table}` triple identifying any warehouse relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableReference {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableReference {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Parse a user supplied table name.
    ///
    /// Accepted forms are `project.dataset.table`, `project:dataset.table`,
    /// `dataset.table` and `table`. A dataset missing from `raw` falls back to
    /// `default_dataset`; a missing project falls back to `default_project`.
    pub fn parse(
        raw: &str,
        default_dataset: Option<&str>,
        default_project: Option<&str>,
    ) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConnectorError::Configuration(
                "table name must not be empty".to_string(),
            ));
        }

        let parts: Vec<&str> = raw.rsplitn(3, '.').collect();
        let (project, dataset, table) = match parts.as_slice() {
            [table] => (None, None, *table),
            [table, qualifier] => match qualifier.rsplit_once(':') {
                Some((project, dataset)) => (Some(project), Some(dataset), *table),
                None => (None, Some(*qualifier), *table),
            },
            [table, dataset, project] => (Some(*project), Some(*dataset), *table),
            _ => unreachable!("rsplitn(3) yields between one and three parts"),
        };

        let dataset = dataset.or(default_dataset).ok_or_else(|| {
            ConnectorError::Configuration(format!(
                "no dataset specified for table '{}'; use 'dataset.table' or set the 'dataset' option",
                raw
            ))
        })?;
        let project = project.or(default_project).ok_or_else(|| {
            ConnectorError::Configuration(format!(
                "no project specified for table '{}' and no default project available",
                raw
            ))
        })?;

        validate_component("project", project, raw, |c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
        })?;
        validate_component("dataset", dataset, raw, |c| {
            c.is_ascii_alphanumeric() || c == '_'
        })?;
        validate_component("table", table, raw, |c| c != '.' && c != ':' && c != '`')?;

        Ok(Self::new(project, dataset, table))
    }

    /// Backtick quoted form usable in standard SQL.
    pub fn sql(&self) -> String {
        format!("`{}.{}.{}`", self.project, self.dataset, self.table)
    }
}

fn validate_component(
    kind: &str,
    value: &str,
    raw: &str,
    allowed: impl Fn(char) -> bool,
) -> Result<()> {
    if value.is_empty() || !value.chars().all(allowed) {
        return Err(ConnectorError::Configuration(format!(
            "invalid {} '{}' in table name '{}'",
            kind, value, raw
        )));
    }
    Ok(())
}

impl fmt::Display for TableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}
