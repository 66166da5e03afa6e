//! Engine Configuration - TOML file with defaults for every field

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compliance::{RuleCatalog, RuleSet};
use crate::error::{DocforgeError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "docforge.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Stores in priority order.
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_rule_set_name")]
    pub default_rule_set: String,
    #[serde(default)]
    pub category_rule_sets: BTreeMap<String, String>,
    #[serde(default)]
    pub rule_sets: Vec<RuleSet>,
}

fn default_rule_set_name() -> String {
    crate::compliance::STANDARD_RULE_SET.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 { 5000 }

impl Default for StoreSettings {
    fn default() -> Self {
        Self { busy_timeout_ms: default_busy_timeout_ms() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Candidates strictly below this confidence are ignored.
    #[serde(default)]
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 50 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl SyncConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stores: vec![],
            store: StoreSettings::default(),
            aggregation: AggregationConfig::default(),
            sync: SyncConfig::default(),
            default_rule_set: default_rule_set_name(),
            category_rule_sets: BTreeMap::new(),
            rule_sets: vec![],
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| DocforgeError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DocforgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let min = self.aggregation.min_confidence;
        if !(0.0..=1.0).contains(&min) {
            return Err(DocforgeError::Config(format!(
                "aggregation.min_confidence must be within 0.0..=1.0, got {}",
                min
            )));
        }
        if self.sync.max_attempts == 0 {
            return Err(DocforgeError::Config("sync.max_attempts must be at least 1".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for store in &self.stores {
            if !seen.insert(store.id.as_str()) {
                return Err(DocforgeError::Config(format!("duplicate store id: {}", store.id)));
            }
        }
        // Surfaces unknown rule-set references and bad rules at load time.
        self.rule_catalog().map(|_| ())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    pub fn rule_catalog(&self) -> Result<RuleCatalog> {
        RuleCatalog::new(
            self.rule_sets.clone(),
            &self.default_rule_set,
            self.category_rule_sets.clone(),
        )
    }
}
