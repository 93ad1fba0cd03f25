//! Read and write configuration parsed from string options.
//!
//! Options arrive as string maps, e.g. from `CREATE EXTERNAL TABLE ... OPTIONS
//! (...)` or `--option key=value` on the command line. Keys are matched case
//! insensitively; per-read options shadow global ones.

use std::collections::HashMap;
use std::str::FromStr;

use tracing::debug;

use crate::error::{ConnectorError, Result};
use crate::model::DataFormat;
use crate::table_ref::TableReference;

pub const DEFAULT_VIEW_EXPIRATION_HOURS: u32 = 24;
pub const DEFAULT_MAX_READ_ROWS_RETRIES: u32 = 3;

// ===========================================================================
// Option lookup
// ===========================================================================

/// Two-level, case-insensitive option map.
#[derive(Debug, Clone, Default)]
pub struct OptionMap {
    local: HashMap<String, String>,
    global: HashMap<String, String>,
}

impl OptionMap {
    pub fn new(local: &HashMap<String, String>, global: &HashMap<String, String>) -> Self {
        Self {
            local: lowercase_keys(local),
            global: lowercase_keys(global),
        }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            local: pairs
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            global: HashMap::new(),
        }
    }

    /// First non-empty value among `names`, local options before global ones.
    pub fn get(&self, names: &[&str]) -> Option<&str> {
        for scope in [&self.local, &self.global] {
            for name in names {
                if let Some(v) = scope.get(&name.to_ascii_lowercase()) {
                    let v = v.trim();
                    if !v.is_empty() {
                        return Some(v);
                    }
                }
            }
        }
        None
    }

    fn get_bool(&self, names: &[&str], default: bool) -> Result<bool> {
        match self.get(names) {
            None => Ok(default),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
            Some(v) => Err(invalid(names[0], v, "expected 'true' or 'false'")),
        }
    }

    fn get_parsed<T: FromStr>(&self, names: &[&str]) -> Result<Option<T>> {
        self.get(names)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|_| invalid(names[0], v, "not a valid number"))
            })
            .transpose()
    }

    fn get_positive<T: FromStr + PartialOrd + Default>(&self, names: &[&str]) -> Result<Option<T>> {
        match self.get_parsed::<T>(names)? {
            Some(v) if v <= T::default() => Err(invalid(
                names[0],
                self.get(names).unwrap_or_default(),
                "must be positive",
            )),
            other => Ok(other),
        }
    }
}

fn lowercase_keys(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}

fn invalid(option: &str, value: &str, why: &str) -> ConnectorError {
    ConnectorError::Configuration(format!(
        "invalid value '{}' for option '{}': {}",
        value, option, why
    ))
}

/// Resolve the target table and the project that is billed for the work.
fn resolve_table(
    options: &OptionMap,
    default_parent_project: Option<&str>,
) -> Result<(TableReference, String)> {
    let raw = options
        .get(&["table", "path"])
        .ok_or_else(|| ConnectorError::Configuration("option 'table' is required".to_string()))?;
    let parent = options
        .get(&["parentProject"])
        .or(default_parent_project)
        .map(str::to_string);
    let default_project = options.get(&["project"]).or(parent.as_deref());
    let table = TableReference::parse(raw, options.get(&["dataset"]), default_project)?;
    let parent = parent.unwrap_or_else(|| table.project.clone());
    Ok((table, parent))
}

// ===========================================================================
// Read configuration
// ===========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadConfig {
    pub table: TableReference,
    /// Project billed for sessions and materialization jobs.
    pub parent_project: String,
    pub filter: Option<String>,
    /// Upper bound on the number of streams; the engine's target partition
    /// count is used when unset.
    pub max_parallelism: Option<usize>,
    pub read_format: DataFormat,
    pub views_enabled: bool,
    pub materialization_project: Option<String>,
    pub materialization_dataset: Option<String>,
    pub optimized_empty_projection: bool,
    pub combine_pushed_down_filters: bool,
    pub view_expiration_hours: u32,
    pub max_read_rows_retries: u32,
}

impl ReadConfig {
    /// Defaults for `table`, usable without any options.
    pub fn new(table: TableReference) -> Self {
        Self {
            parent_project: table.project.clone(),
            table,
            filter: None,
            max_parallelism: None,
            read_format: DataFormat::Avro,
            views_enabled: false,
            materialization_project: None,
            materialization_dataset: None,
            optimized_empty_projection: true,
            combine_pushed_down_filters: true,
            view_expiration_hours: DEFAULT_VIEW_EXPIRATION_HOURS,
            max_read_rows_retries: DEFAULT_MAX_READ_ROWS_RETRIES,
        }
    }

    pub fn from_options(options: &OptionMap, default_parent_project: Option<&str>) -> Result<Self> {
        let (table, parent_project) = resolve_table(options, default_parent_project)?;

        let read_format = match options.get(&["readDataFormat"]) {
            Some(v) => v.parse()?,
            None => DataFormat::default(),
        };

        let config = Self {
            table,
            parent_project,
            filter: options.get(&["filter"]).map(str::to_string),
            max_parallelism: options.get_positive(&["maxParallelism", "parallelism"])?,
            read_format,
            views_enabled: options.get_bool(&["viewsEnabled"], false)?,
            materialization_project: options
                .get(&["materializationProject", "viewMaterializationProject"])
                .map(str::to_string),
            materialization_dataset: options
                .get(&["materializationDataset", "viewMaterializationDataset"])
                .map(str::to_string),
            optimized_empty_projection: options.get_bool(&["optimizedEmptyProjection"], true)?,
            combine_pushed_down_filters: options.get_bool(&["combinePushedDownFilters"], true)?,
            view_expiration_hours: options
                .get_positive(&["viewExpirationTimeInHours"])?
                .unwrap_or(DEFAULT_VIEW_EXPIRATION_HOURS),
            max_read_rows_retries: options
                .get_positive(&["maxReadRowsRetries"])?
                .unwrap_or(DEFAULT_MAX_READ_ROWS_RETRIES),
        };
        debug!(
            "Read config: table='{}', format={}, views_enabled={}",
            config.table, config.read_format, config.views_enabled
        );
        Ok(config)
    }
}

// ===========================================================================
// Write configuration
// ===========================================================================

/// File format the write path stages data in before loading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntermediateFormat {
    #[default]
    Parquet,
    Orc,
}

impl IntermediateFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntermediateFormat::Parquet => "PARQUET",
            IntermediateFormat::Orc => "ORC",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            IntermediateFormat::Parquet => "parquet",
            IntermediateFormat::Orc => "orc",
        }
    }
}

impl FromStr for IntermediateFormat {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PARQUET" => Ok(IntermediateFormat::Parquet),
            "ORC" => Ok(IntermediateFormat::Orc),
            other => Err(ConnectorError::Configuration(format!(
                "Intermediate format '{}' is not supported. Supported formats are 'ORC,PARQUET'",
                other
            ))),
        }
    }
}

/// What to do when the destination table already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    Append,
    Overwrite,
    #[default]
    ErrorIfExists,
    Ignore,
}

impl FromStr for SaveMode {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(SaveMode::Append),
            "overwrite" => Ok(SaveMode::Overwrite),
            "errorifexists" | "error" | "default" => Ok(SaveMode::ErrorIfExists),
            "ignore" => Ok(SaveMode::Ignore),
            other => Err(invalid(
                "saveMode",
                other,
                "expected one of append, overwrite, errorifexists, ignore",
            )),
        }
    }
}

/// Outcome of applying a [`SaveMode`] to the current table state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Skip,
    Append,
    Truncate,
    Fail,
}

impl SaveMode {
    pub fn plan(self, table_exists: bool) -> WriteAction {
        match (self, table_exists) {
            (_, false) => WriteAction::Append,
            (SaveMode::Append, true) => WriteAction::Append,
            (SaveMode::Overwrite, true) => WriteAction::Truncate,
            (SaveMode::ErrorIfExists, true) => WriteAction::Fail,
            (SaveMode::Ignore, true) => WriteAction::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    CreateIfNeeded,
    CreateNever,
}

impl CreateDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreateDisposition::CreateIfNeeded => "CREATE_IF_NEEDED",
            CreateDisposition::CreateNever => "CREATE_NEVER",
        }
    }
}

impl FromStr for CreateDisposition {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE_IF_NEEDED" => Ok(CreateDisposition::CreateIfNeeded),
            "CREATE_NEVER" => Ok(CreateDisposition::CreateNever),
            other => Err(invalid(
                "createDisposition",
                other,
                "expected CREATE_IF_NEEDED or CREATE_NEVER",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaUpdateOption {
    AllowFieldAddition,
    AllowFieldRelaxation,
}

impl SchemaUpdateOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaUpdateOption::AllowFieldAddition => "ALLOW_FIELD_ADDITION",
            SchemaUpdateOption::AllowFieldRelaxation => "ALLOW_FIELD_RELAXATION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimePartitioning {
    /// Column to partition by; ingestion time when unset.
    pub field: Option<String>,
    pub expiration_ms: Option<u64>,
    /// `DAY`, `HOUR`, `MONTH` or `YEAR`.
    pub partition_type: String,
    pub require_filter: bool,
}

const PARTITION_TYPES: [&str; 4] = ["DAY", "HOUR", "MONTH", "YEAR"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConfig {
    pub table: TableReference,
    pub parent_project: String,
    pub temporary_gcs_bucket: String,
    pub intermediate_format: IntermediateFormat,
    pub save_mode: SaveMode,
    pub time_partitioning: Option<TimePartitioning>,
    pub clustered_fields: Vec<String>,
    pub create_disposition: Option<CreateDisposition>,
    pub schema_update_options: Vec<SchemaUpdateOption>,
}

impl WriteConfig {
    pub fn from_options(options: &OptionMap, default_parent_project: Option<&str>) -> Result<Self> {
        let (table, parent_project) = resolve_table(options, default_parent_project)?;

        let temporary_gcs_bucket = options
            .get(&["temporaryGcsBucket"])
            .map(|b| b.trim_start_matches("gs://").trim_end_matches('/').to_string())
            .ok_or_else(|| {
                ConnectorError::Configuration(
                    "Temporary GCS bucket has not been set. Use the 'temporaryGcsBucket' option"
                        .to_string(),
                )
            })?;

        let intermediate_format = match options.get(&["intermediateFormat"]) {
            Some(v) => v.parse()?,
            None => IntermediateFormat::default(),
        };
        let save_mode = match options.get(&["saveMode", "mode"]) {
            Some(v) => v.parse()?,
            None => SaveMode::default(),
        };

        let partition_field = options.get(&["partitionField"]).map(str::to_string);
        let partition_expiration: Option<u64> = options.get_positive(&["partitionExpirationMs"])?;
        let partition_type = options.get(&["partitionType"]).map(str::to_ascii_uppercase);
        if let Some(t) = &partition_type {
            if !PARTITION_TYPES.contains(&t.as_str()) {
                return Err(invalid("partitionType", t, "expected DAY, HOUR, MONTH or YEAR"));
            }
        }
        let require_filter = options.get_bool(&["partitionRequireFilter"], false)?;
        let time_partitioning = if partition_field.is_some()
            || partition_expiration.is_some()
            || partition_type.is_some()
        {
            Some(TimePartitioning {
                field: partition_field,
                expiration_ms: partition_expiration,
                partition_type: partition_type.unwrap_or_else(|| "DAY".to_string()),
                require_filter,
            })
        } else {
            None
        };

        let clustered_fields = options
            .get(&["clusteredFields"])
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let create_disposition = options
            .get(&["createDisposition"])
            .map(str::parse)
            .transpose()?;

        let mut schema_update_options = vec![];
        if options.get_bool(&["allowFieldAddition"], false)? {
            schema_update_options.push(SchemaUpdateOption::AllowFieldAddition);
        }
        if options.get_bool(&["allowFieldRelaxation"], false)? {
            schema_update_options.push(SchemaUpdateOption::AllowFieldRelaxation);
        }

        Ok(Self {
            table,
            parent_project,
            temporary_gcs_bucket,
            intermediate_format,
            save_mode,
            time_partitioning,
            clustered_fields,
            create_disposition,
            schema_update_options,
        })
    }
}
