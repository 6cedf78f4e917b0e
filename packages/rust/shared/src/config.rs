//! Application configuration for the enricher.
//!
//! User config lives at `~/.enricher/enricher.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EnricherError, Result};
use crate::types::{SchemaId, SelectionCriteria};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "enricher.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".enricher";

// ---------------------------------------------------------------------------
// Config structs (matching enricher.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// External classification service.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Host invocation window and claim lease.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Recheck cache policy.
    #[serde(default)]
    pub recheck: RecheckConfig,

    /// Named consumable budgets.
    #[serde(default)]
    pub budgets: Vec<BudgetConfig>,

    /// Candidate selection criteria.
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Subjects that are never sent to the service.
    #[serde(default)]
    pub exclusions: ExclusionsConfig,

    /// Fields that yield subjects, per schema.
    #[serde(default)]
    pub subject_fields: Vec<SubjectFieldConfig>,

    /// Mapping Rule Engine source.
    #[serde(default)]
    pub mapping: MappingConfig,

    /// Known result categories.
    #[serde(default)]
    pub categories: Vec<CategoryConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Database file; a leading `~` expands to the home directory.
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

fn default_database() -> String {
    "~/.enricher/enricher.db".into()
}

/// `[service]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Classification endpoint (POST).
    #[serde(default)]
    pub endpoint: String,

    /// Optional endpoint reporting authoritative remaining quota (GET).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_endpoint: Option<String>,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Minimum ms between two calls sharing the same key.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Shared throttle cell name; processes using one API key must agree on it.
    #[serde(default = "default_throttle_key")]
    pub throttle_key: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            status_endpoint: None,
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            min_interval_ms: default_min_interval_ms(),
            throttle_key: default_throttle_key(),
        }
    }
}

fn default_api_key_env() -> String {
    "ENRICHER_API_KEY".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_min_interval_ms() -> u64 {
    10_000
}
fn default_throttle_key() -> String {
    "service".into()
}

/// `[schedule]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Execution window granted to one `run` when the CLI acts as host.
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,

    /// Time kept in reserve before the deadline.
    #[serde(default = "default_safety_margin_ms")]
    pub safety_margin_ms: u64,

    /// How long a queue claim stays valid if its run never finishes.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            time_budget_secs: default_time_budget_secs(),
            safety_margin_ms: default_safety_margin_ms(),
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

fn default_time_budget_secs() -> u64 {
    55
}
fn default_safety_margin_ms() -> u64 {
    2_000
}
fn default_claim_lease_secs() -> u64 {
    600
}

/// `[recheck]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecheckConfig {
    /// Minimum hours before a checked subject becomes due again.
    #[serde(default = "default_recheck_hours")]
    pub interval_hours: u64,

    /// Successful checks after which a subject is never checked again.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Entries older than `prune_multiplier × interval` are deleted.
    #[serde(default = "default_prune_multiplier")]
    pub prune_multiplier: u32,
}

impl Default for RecheckConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_recheck_hours(),
            max_retries: default_max_retries(),
            prune_multiplier: default_prune_multiplier(),
        }
    }
}

fn default_recheck_hours() -> u64 {
    24 * 14
}
fn default_max_retries() -> u32 {
    3
}
fn default_prune_multiplier() -> u32 {
    4
}

/// `[[budgets]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub name: String,
    /// Units per period; 0 means unlimited.
    #[serde(default)]
    pub capacity: u64,
    #[serde(default = "default_period_hours")]
    pub period_hours: u64,
    /// How often to pull the authoritative count from the status endpoint.
    #[serde(default = "default_refresh_mins")]
    pub refresh_interval_mins: u64,
}

fn default_period_hours() -> u64 {
    24 * 30
}
fn default_refresh_mins() -> u64 {
    60
}

/// `[selection]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Minimum minutes between two selection passes.
    #[serde(default = "default_selection_interval_mins")]
    pub interval_mins: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            schemas: Vec::new(),
            missing_fields: Vec::new(),
            limit: None,
            interval_mins: default_selection_interval_mins(),
        }
    }
}

fn default_selection_interval_mins() -> u64 {
    60
}

/// `[exclusions]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExclusionsConfig {
    /// Hosts or domains; `*` acts as a glob (e.g. `*.internal`).
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// How a subject field's value becomes subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectSource {
    Url,
    Document,
}

/// `[[subject_fields]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectFieldConfig {
    pub schema: String,
    pub field: String,
    pub kind: SubjectSource,
    /// Questions asked about each document (document kind only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
}

/// `[mapping]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl MappingConfig {
    /// Resolve the mapping source text; `base` anchors a relative `path`.
    pub fn load_text(&self, base: Option<&Path>) -> Result<String> {
        match (&self.text, &self.path) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(path)) => {
                let path = match base {
                    Some(dir) if Path::new(path).is_relative() => dir.join(path),
                    _ => expand_home(path),
                };
                std::fs::read_to_string(&path).map_err(|e| EnricherError::io(&path, e))
            }
            (None, None) => Err(EnricherError::config(
                "no mapping configured: set [mapping] text or path",
            )),
        }
    }
}

/// `[[categories]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    /// Whether one response may carry several results for this category.
    #[serde(default)]
    pub multiple: bool,
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime orchestration settings derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub min_interval: Duration,
    pub throttle_key: String,
    pub time_budget: Duration,
    pub safety_margin: Duration,
    pub claim_lease: Duration,
    /// Longest a single service call may take.
    pub request_timeout: Duration,
    pub recheck_interval: Duration,
    pub max_retries: u32,
    pub prune_multiplier: u32,
    pub budgets: Vec<BudgetConfig>,
    pub selection: SelectionCriteria,
    pub selection_interval: Duration,
    pub excluded_hosts: Vec<String>,
    pub subject_fields: Vec<SubjectFieldConfig>,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.service.min_interval_ms),
            throttle_key: config.service.throttle_key.clone(),
            time_budget: Duration::from_secs(config.schedule.time_budget_secs),
            safety_margin: Duration::from_millis(config.schedule.safety_margin_ms),
            claim_lease: Duration::from_secs(config.schedule.claim_lease_secs),
            request_timeout: Duration::from_secs(config.service.timeout_secs),
            recheck_interval: Duration::from_secs(config.recheck.interval_hours * 3600),
            max_retries: config.recheck.max_retries,
            prune_multiplier: config.recheck.prune_multiplier,
            budgets: config.budgets.clone(),
            selection: SelectionCriteria {
                schemas: config
                    .selection
                    .schemas
                    .iter()
                    .map(|s| SchemaId::from(s.as_str()))
                    .collect(),
                missing_fields: config.selection.missing_fields.clone(),
                limit: config.selection.limit,
            },
            selection_interval: Duration::from_secs(config.selection.interval_mins * 60),
            excluded_hosts: config.exclusions.hosts.clone(),
            subject_fields: config.subject_fields.clone(),
        }
    }
}

impl RunConfig {
    /// A queue claim must outlive the run holding it, including a call
    /// still in flight at the deadline.
    pub fn check_claim_lease(&self) -> Result<()> {
        let held_for = self.time_budget.saturating_add(self.request_timeout);
        if self.claim_lease <= held_for {
            return Err(EnricherError::config(format!(
                "[schedule] claim_lease_secs ({}s) must exceed the time budget plus the request timeout ({}s)",
                self.claim_lease.as_secs(),
                held_for.as_secs()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.enricher/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| EnricherError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.enricher/enricher.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| EnricherError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| EnricherError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| EnricherError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| EnricherError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| EnricherError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Check the settings the orchestrator cannot start without.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.service.endpoint.is_empty() {
        return Err(EnricherError::config("[service] endpoint is not set"));
    }
    url::Url::parse(&config.service.endpoint).map_err(|e| {
        EnricherError::config(format!(
            "invalid [service] endpoint '{}': {e}",
            config.service.endpoint
        ))
    })?;
    if let Some(status) = &config.service.status_endpoint {
        url::Url::parse(status).map_err(|e| {
            EnricherError::config(format!("invalid [service] status_endpoint '{status}': {e}"))
        })?;
    }

    let mut seen = std::collections::HashSet::new();
    for budget in &config.budgets {
        if budget.name.trim().is_empty() {
            return Err(EnricherError::config("budget with an empty name"));
        }
        if !seen.insert(budget.name.as_str()) {
            return Err(EnricherError::config(format!(
                "budget '{}' is declared twice",
                budget.name
            )));
        }
        if budget.period_hours == 0 {
            return Err(EnricherError::config(format!(
                "budget '{}' has a zero-length period",
                budget.name
            )));
        }
    }

    for field in &config.subject_fields {
        if field.kind == SubjectSource::Document && field.questions.is_empty() {
            return Err(EnricherError::config(format!(
                "document subject field '{}' lists no questions",
                field.field
            )));
        }
    }

    if config.recheck.max_retries == 0 {
        return Err(EnricherError::config("[recheck] max_retries must be at least 1"));
    }
    RunConfig::from(config).check_claim_lease()
}

/// Read the API key from the env var named in the config.
pub fn api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.service.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(EnricherError::config(format!(
            "service API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[service]
endpoint = "https://classify.example.com/v1/detect"
min_interval_ms = 10000

[recheck]
interval_hours = 336
max_retries = 3

[[budgets]]
name = "detections"
capacity = 5
period_hours = 720

[selection]
schemas = ["site"]
missing_fields = ["Detected CMS"]

[exclusions]
hosts = ["localhost", "*.internal"]

[[subject_fields]]
schema = "site"
field = "Homepage"
kind = "url"

[[subject_fields]]
schema = "report"
field = "Attachment"
kind = "document"
questions = ["summary", "language"]

[mapping]
text = """
SourceField: Homepage
Result: CMS
Field: Detected CMS
"""

[[categories]]
name = "CMS"
"#;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("database"));
        assert!(toml_str.contains("ENRICHER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.recheck.max_retries, 3);
        assert_eq!(parsed.service.api_key_env, "ENRICHER_API_KEY");
    }

    #[test]
    fn full_config_parses() {
        let config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        assert_eq!(config.budgets.len(), 1);
        assert_eq!(config.budgets[0].capacity, 5);
        assert_eq!(config.subject_fields[1].kind, SubjectSource::Document);
        assert_eq!(config.subject_fields[1].questions.len(), 2);
        assert!(config.mapping.load_text(None).unwrap().contains("Detected CMS"));
        validate_config(&config).expect("valid");
    }

    #[test]
    fn run_config_from_app_config() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        let run = RunConfig::from(&config);
        assert_eq!(run.min_interval, Duration::from_secs(10));
        assert_eq!(run.recheck_interval, Duration::from_secs(14 * 24 * 3600));
        assert_eq!(run.selection.schemas, vec![SchemaId::from("site")]);
        assert_eq!(run.excluded_hosts.len(), 2);
    }

    #[test]
    fn validation_rejects_missing_endpoint_and_duplicate_budgets() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_err());

        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.budgets.push(config.budgets[0].clone());
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn claim_lease_must_outlast_a_run() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.schedule.time_budget_secs = 600;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("claim_lease_secs"));

        // Budget plus one in-flight call exactly reaching the lease is not enough.
        config.schedule.time_budget_secs = 570;
        config.service.timeout_secs = 30;
        config.schedule.claim_lease_secs = 600;
        assert!(validate_config(&config).is_err());

        config.schedule.claim_lease_secs = 601;
        validate_config(&config).expect("valid");

        // A longer window chosen at run time is checked the same way.
        let mut run = RunConfig::from(&config);
        run.time_budget = Duration::from_secs(900);
        assert!(run.check_claim_lease().unwrap_err().is_configuration());
    }

    #[test]
    fn missing_mapping_is_a_config_error() {
        let config = AppConfig::default();
        let err = config.mapping.load_text(None).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn api_key_lookup() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.service.api_key_env = "ENRICHER_TEST_NONEXISTENT_KEY_12345".into();
        let result = api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
