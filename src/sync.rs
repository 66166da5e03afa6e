//! Cross-Store Synchronization - replicate template heads between stores
//!
//! One [`PairSynchronizer`] exists per ordered (source, target) pair, and
//! attempts for the same template id on a pair run one at a time. Each
//! attempt moves through
//!
//! ```text
//! Pending -> Applied | Skipped | ConflictResolved
//! ```
//!
//! and commits the template copy and its [`SyncRecord`] in a single target
//! transaction, so a failed attempt leaves the target untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::{DocforgeError, Result};
use crate::store::{Collection, DataStore, Filter, Record};
use crate::templates::{load_definitions, Template, TemplateRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResolution {
    Applied,
    SkippedEqual,
    ConflictResolvedSourceWins,
    ConflictResolvedTargetWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Applied,
    Skipped,
    ConflictResolved,
}

impl SyncResolution {
    pub fn state(self) -> SyncState {
        match self {
            SyncResolution::Applied => SyncState::Applied,
            SyncResolution::SkippedEqual => SyncState::Skipped,
            SyncResolution::ConflictResolvedSourceWins
            | SyncResolution::ConflictResolvedTargetWins => SyncState::ConflictResolved,
        }
    }

    /// Whether the source copy is written into the target.
    pub fn writes_target(self) -> bool {
        matches!(
            self,
            SyncResolution::Applied | SyncResolution::ConflictResolvedSourceWins
        )
    }
}

/// Audit row appended to the target's sync log for every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: String,
    pub template_id: String,
    pub source_store: String,
    pub target_store: String,
    pub source_version: u32,
    /// 0 when the target had no copy.
    pub target_version_before: u32,
    pub resolution: SyncResolution,
    pub synced_at: DateTime<Utc>,
}

impl SyncRecord {
    /// Row id, unique per (template, source, target, source version).
    pub fn record_id(template_id: &str, source: &str, target: &str, source_version: u32) -> String {
        format!("{}:{}->{}@v{}", template_id, source, target, source_version)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub record: SyncRecord,
    /// False when an earlier attempt already covered this source version.
    pub newly_recorded: bool,
}

/// Last-write-wins comparison of two template heads.
///
/// Higher version wins. On equal versions the later `authored_at` wins, and
/// the body hash breaks an exact timestamp tie so both directions agree.
pub fn decide(source: &Template, target: Option<&Template>) -> SyncResolution {
    let target = match target {
        None => return SyncResolution::Applied,
        Some(t) => t,
    };
    match source.version.cmp(&target.version) {
        Ordering::Greater => SyncResolution::Applied,
        Ordering::Less => SyncResolution::ConflictResolvedTargetWins,
        Ordering::Equal => {
            let source_key = (source.authored_at, source.body_hash());
            let target_key = (target.authored_at, target.body_hash());
            match source_key.cmp(&target_key) {
                Ordering::Equal => SyncResolution::SkippedEqual,
                Ordering::Greater => SyncResolution::ConflictResolvedSourceWins,
                Ordering::Less => SyncResolution::ConflictResolvedTargetWins,
            }
        }
    }
}

pub struct PairSynchronizer {
    source: Arc<dyn DataStore>,
    target: Arc<dyn DataStore>,
    policy: SyncConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PairSynchronizer {
    pub fn new(source: Arc<dyn DataStore>, target: Arc<dyn DataStore>, policy: SyncConfig) -> Result<Self> {
        if source.id() == target.id() {
            return Err(DocforgeError::Config(format!(
                "cannot synchronize store {} with itself",
                source.id()
            )));
        }
        Ok(Self {
            source,
            target,
            policy,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }

    pub fn target_id(&self) -> &str {
        self.target.id()
    }

    fn template_lock(&self, template_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(template_id.to_string()).or_default().clone()
    }

    /// Synchronizes the source's active head of `template_id` into the target.
    ///
    /// `StoreUnavailable` failures retry the whole attempt up to
    /// `max_attempts` times. Anything else returns immediately.
    pub fn synchronize(&self, template_id: &str) -> Result<SyncOutcome> {
        let lock = self.template_lock(template_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut attempt = 1;
        loop {
            match self.attempt(template_id) {
                Err(err @ DocforgeError::StoreUnavailable { .. }) if attempt < self.policy.max_attempts => {
                    warn!(
                        template_id,
                        source = %self.source.id(),
                        target = %self.target.id(),
                        attempt,
                        error = %err,
                        "sync attempt failed, retrying"
                    );
                    std::thread::sleep(self.policy.retry_backoff() * attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn attempt(&self, template_id: &str) -> Result<SyncOutcome> {
        let source_head = TemplateRepository::new(self.source.clone()).get_active(template_id)?;
        let definitions = load_definitions(self.source.as_ref(), template_id)?;
        let source_id = self.source.id().to_string();
        let target_id = self.target.id().to_string();
        let log_id = SyncRecord::record_id(template_id, &source_id, &target_id, source_head.version);

        let mut outcome = None;
        self.target.scoped_transaction(&mut |tx| {
            if let Some(existing) = tx
                .read(Collection::SyncLog, &Filter::all().eq("id", log_id.as_str()))?
                .first()
            {
                outcome = Some(SyncOutcome {
                    record: existing.decode()?,
                    newly_recorded: false,
                });
                return Ok(());
            }

            let target_head = tx
                .read(Collection::Templates, &Filter::all().eq("id", template_id))?
                .iter()
                .map(Record::decode::<Template>)
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .max_by_key(|t| t.version);

            let resolution = decide(&source_head, target_head.as_ref());
            if resolution.writes_target() {
                let mut copy = source_head.clone();
                // Replacing a version the target deactivated keeps it inactive.
                if let Some(existing) = target_head.as_ref().filter(|t| t.version == copy.version) {
                    copy.active &= existing.active;
                }
                tx.write(Collection::Templates, copy.to_record()?)?;
                for def in &definitions {
                    tx.write(Collection::PlaceholderDefinitions, def.to_record()?)?;
                }
            }

            let record = SyncRecord {
                id: log_id.clone(),
                template_id: template_id.to_string(),
                source_store: source_id.clone(),
                target_store: target_id.clone(),
                source_version: source_head.version,
                target_version_before: target_head.map(|t| t.version).unwrap_or(0),
                resolution,
                synced_at: Utc::now(),
            };
            tx.write(Collection::SyncLog, Record::new(record.id.clone(), &record)?)?;
            outcome = Some(SyncOutcome {
                record,
                newly_recorded: true,
            });
            Ok(())
        })?;

        let outcome = outcome.ok_or_else(|| DocforgeError::Storage {
            store: target_id.clone(),
            reason: "sync transaction produced no record".to_string(),
        })?;
        if outcome.newly_recorded {
            info!(
                template_id,
                source = %source_id,
                target = %target_id,
                source_version = outcome.record.source_version,
                target_version_before = outcome.record.target_version_before,
                resolution = ?outcome.record.resolution,
                "template synchronized"
            );
        }
        Ok(outcome)
    }
}

/// Hands out the single synchronizer for each ordered store pair.
pub struct SyncCoordinator {
    policy: SyncConfig,
    pairs: Mutex<HashMap<(String, String), Arc<PairSynchronizer>>>,
}

impl SyncCoordinator {
    pub fn new(policy: SyncConfig) -> Self {
        Self {
            policy,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    pub fn pair(&self, source: &Arc<dyn DataStore>, target: &Arc<dyn DataStore>) -> Result<Arc<PairSynchronizer>> {
        let key = (source.id().to_string(), target.id().to_string());
        let mut pairs = self.pairs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = pairs.get(&key) {
            return Ok(existing.clone());
        }
        let pair = Arc::new(PairSynchronizer::new(source.clone(), target.clone(), self.policy.clone())?);
        pairs.insert(key, pair.clone());
        Ok(pair)
    }

    pub fn synchronize(
        &self,
        template_id: &str,
        source: &Arc<dyn DataStore>,
        target: &Arc<dyn DataStore>,
    ) -> Result<SyncOutcome> {
        self.pair(source, target)?.synchronize(template_id)
    }
}

/// Sync history recorded in `store`, newest first.
pub fn sync_log(store: &dyn DataStore, template_id: Option<&str>, limit: usize) -> Result<Vec<SyncRecord>> {
    let filter = match template_id {
        Some(id) => Filter::all().eq("template_id", id),
        None => Filter::all(),
    };
    let mut records = store
        .read(Collection::SyncLog, &filter)?
        .iter()
        .map(Record::decode::<SyncRecord>)
        .collect::<Result<Vec<_>>>()?;
    // Rows come back in insertion order.
    records.reverse();
    records.truncate(limit);
    Ok(records)
}
