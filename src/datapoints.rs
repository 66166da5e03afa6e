//! Datapoint Aggregator - harvest keyed values from every configured store
//!
//! Stores hold datapoints in slightly different shapes. Each record is
//! normalized into a [`Datapoint`]; records that cannot be normalized are
//! skipped with a warning instead of failing the request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{DocforgeError, Result};
use crate::placeholders::{ContextPattern, KeyMatcher};
use crate::store::{Collection, DataStore, Filter, Record};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub key: String,
    pub value: Value,
    pub source_store: String,
    pub confidence: f64,
    pub observed_at: DateTime<Utc>,
}

impl Datapoint {
    pub fn new(key: impl Into<String>, value: impl Into<Value>, confidence: f64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source_store: String::new(),
            confidence,
            observed_at: Utc::now(),
        }
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }
}

/// Normalizes one stored record, or explains why it cannot be used.
///
/// `confidence` defaults to 1.0 when absent. `observed_at` may be an
/// RFC 3339 string or integer unix seconds. `source_store` is always the
/// store the record was read from.
pub fn normalize(store_id: &str, record: &Record) -> std::result::Result<Datapoint, String> {
    let doc = &record.doc;
    let key = match doc.get("key") {
        Some(Value::String(k)) if !k.is_empty() => k.clone(),
        _ => return Err("missing key".to_string()),
    };
    let value = match doc.get("value") {
        Some(v @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => v.clone(),
        _ => return Err(format!("{}: value is not a scalar", key)),
    };
    let confidence = match doc.get("confidence") {
        None | Some(Value::Null) => 1.0,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(_) => f64::NAN,
    };
    if !(0.0..=1.0).contains(&confidence) {
        return Err(format!("{}: confidence out of range", key));
    }
    let observed_at = match doc.get("observed_at") {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| format!("{}: observed_at: {}", key, e))?,
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| format!("{}: observed_at out of range", key))?,
        _ => return Err(format!("{}: missing observed_at", key)),
    };
    Ok(Datapoint {
        key,
        value,
        source_store: store_id.to_string(),
        confidence,
        observed_at,
    })
}

/// Candidate ordering: higher confidence, then more recent, then the store
/// listed earlier. `Greater` means `a` wins.
pub fn compare_candidates(a: &Datapoint, a_rank: usize, b: &Datapoint, b_rank: usize) -> Ordering {
    a.confidence
        .total_cmp(&b.confidence)
        .then(a.observed_at.cmp(&b.observed_at))
        .then(b_rank.cmp(&a_rank))
}

/// Best datapoint per key, remembering the priority of each source store.
#[derive(Debug, Clone, Default)]
pub struct DatapointSet {
    points: BTreeMap<String, (Datapoint, usize)>,
}

impl DatapointSet {
    /// Builds a set from loose points. Store rank follows first appearance.
    pub fn from_points(points: Vec<Datapoint>) -> Self {
        let mut stores: Vec<String> = vec![];
        let mut set = Self::default();
        for dp in points {
            let rank = match stores.iter().position(|s| *s == dp.source_store) {
                Some(rank) => rank,
                None => {
                    stores.push(dp.source_store.clone());
                    stores.len() - 1
                }
            };
            set.offer(dp, rank);
        }
        set
    }

    /// Keeps `dp` if it beats the current candidate for its key.
    pub fn offer(&mut self, dp: Datapoint, rank: usize) {
        let keep_current = matches!(
            self.points.get(&dp.key),
            Some((current, current_rank))
                if compare_candidates(&dp, rank, current, *current_rank) != Ordering::Greater
        );
        if !keep_current {
            self.points.insert(dp.key.clone(), (dp, rank));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Datapoint> {
        self.points.get(key).map(|(dp, _)| dp)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.points.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Datapoint> {
        self.points.values().map(|(dp, _)| dp)
    }

    /// Best datapoint among keys accepted by `pred`. Ties across keys go to
    /// the lexicographically smaller key.
    pub fn best_matching(&self, pred: impl Fn(&str) -> bool) -> Option<&Datapoint> {
        let mut best: Option<&(Datapoint, usize)> = None;
        // Ascending key order, so only a strict win replaces the current pick.
        for (key, entry) in &self.points {
            if !pred(key) {
                continue;
            }
            match best {
                Some((dp, rank)) if compare_candidates(&entry.0, entry.1, dp, *rank) != Ordering::Greater => {}
                _ => best = Some(entry),
            }
        }
        best.map(|(dp, _)| dp)
    }

    pub fn into_map(self) -> BTreeMap<String, Datapoint> {
        self.points.into_iter().map(|(k, (dp, _))| (k, dp)).collect()
    }
}

pub struct DatapointAggregator {
    min_confidence: f64,
}

impl Default for DatapointAggregator {
    fn default() -> Self {
        Self { min_confidence: 0.0 }
    }
}

impl DatapointAggregator {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Gathers the best datapoint for every key matching `keys_of_interest`.
    ///
    /// Stores are given in priority order. Keys with no candidate are simply
    /// absent. Read-only.
    pub fn collect(
        &self,
        keys_of_interest: &[ContextPattern],
        stores: &[Arc<dyn DataStore>],
    ) -> Result<DatapointSet> {
        let mut set = DatapointSet::default();
        if keys_of_interest.is_empty() {
            return Ok(set);
        }
        let matchers = keys_of_interest
            .iter()
            .map(ContextPattern::matcher)
            .collect::<Result<Vec<KeyMatcher>>>()?;
        let exact_only: Option<Vec<&str>> = keys_of_interest.iter().map(ContextPattern::as_exact).collect();

        for (rank, store) in stores.iter().enumerate() {
            let records = match &exact_only {
                Some(keys) => {
                    let mut records = vec![];
                    for key in keys {
                        records.extend(store.read(Collection::Datapoints, &Filter::all().eq("key", *key))?);
                    }
                    records
                }
                None => store.read(Collection::Datapoints, &Filter::all())?,
            };

            for record in &records {
                let dp = match normalize(store.id(), record) {
                    Ok(dp) => dp,
                    Err(reason) => {
                        warn!(store = %store.id(), record = %record.id, %reason, "skipping malformed datapoint");
                        continue;
                    }
                };
                if dp.confidence < self.min_confidence {
                    continue;
                }
                if matchers.iter().any(|m| m.matches(&dp.key)) {
                    set.offer(dp, rank);
                }
            }
        }

        debug!(keys = set.len(), stores = stores.len(), "datapoints collected");
        Ok(set)
    }
}

/// Writes a datapoint into `store`, stamped with that store's id.
pub fn publish(store: &dyn DataStore, datapoint: &Datapoint) -> Result<String> {
    if datapoint.key.is_empty() {
        return Err(DocforgeError::InvalidDefinition(
            "datapoint".to_string(),
            "key must not be empty".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&datapoint.confidence) {
        return Err(DocforgeError::InvalidDefinition(
            datapoint.key.clone(),
            format!("confidence {} is outside 0.0..=1.0", datapoint.confidence),
        ));
    }
    let mut stamped = datapoint.clone();
    stamped.source_store = store.id().to_string();
    store.write(Collection::Datapoints, Record::generated(&stamped)?)
}
