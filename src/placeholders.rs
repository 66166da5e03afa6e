//! Placeholder Definitions and Resolution
//!
//! A definition binds one declared placeholder to a datapoint key pattern,
//! an expected type, and an optional default. Resolution picks a value for
//! every declared placeholder or fails the whole request.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::datapoints::DatapointSet;
use crate::error::{DocforgeError, Result};
use crate::store::Record;
use crate::templates::{is_valid_placeholder_name, Template};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedType {
    #[default]
    Text,
    Number,
    /// `YYYY-MM-DD` or RFC 3339 timestamp.
    Date,
    Enumerated { allowed: Vec<String> },
}

impl std::fmt::Display for ExpectedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectedType::Text => write!(f, "text"),
            ExpectedType::Number => write!(f, "number"),
            ExpectedType::Date => write!(f, "date"),
            ExpectedType::Enumerated { allowed } => write!(f, "one of [{}]", allowed.join(", ")),
        }
    }
}

impl ExpectedType {
    /// Renders `value` as text if it satisfies this type.
    pub fn coerce(&self, value: &Value) -> Option<String> {
        let text = scalar_text(value)?;
        let ok = match self {
            ExpectedType::Text => true,
            ExpectedType::Number => match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false),
                _ => false,
            },
            ExpectedType::Date => matches!(value, Value::String(s) if is_date(s)),
            ExpectedType::Enumerated { allowed } => allowed.iter().any(|a| *a == text),
        };
        ok.then_some(text)
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_date(s: &str) -> bool {
    let s = s.trim();
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || chrono::DateTime::parse_from_rfc3339(s).is_ok()
}

/// Which datapoint keys feed a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContextPattern {
    Exact(String),
    Prefix(String),
    Regex(String),
}

impl ContextPattern {
    pub fn exact(key: impl Into<String>) -> Self {
        ContextPattern::Exact(key.into())
    }

    pub fn matcher(&self) -> Result<KeyMatcher> {
        Ok(match self {
            ContextPattern::Exact(k) => KeyMatcher::Exact(k.clone()),
            ContextPattern::Prefix(p) => KeyMatcher::Prefix(p.clone()),
            ContextPattern::Regex(r) => {
                // Anchored so the whole key has to match.
                let re = Regex::new(&format!("^(?:{})$", r)).map_err(|e| {
                    DocforgeError::InvalidDefinition(format!("regex {:?}", r), e.to_string())
                })?;
                KeyMatcher::Regex(re)
            }
        })
    }

    pub fn as_exact(&self) -> Option<&str> {
        match self {
            ContextPattern::Exact(k) => Some(k),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum KeyMatcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl KeyMatcher {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::Exact(k) => k == key,
            KeyMatcher::Prefix(p) => key.starts_with(p.as_str()),
            KeyMatcher::Regex(re) => re.is_match(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderDefinition {
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub expected_type: ExpectedType,
    pub context_pattern: ContextPattern,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool { true }

impl PlaceholderDefinition {
    /// Definition used for a declared placeholder nobody configured:
    /// required text fed by the datapoint with the same key.
    pub fn implicit(template_id: &str, name: &str) -> Self {
        Self {
            template_id: template_id.to_string(),
            name: name.to_string(),
            expected_type: ExpectedType::Text,
            context_pattern: ContextPattern::exact(name),
            default_value: None,
            required: true,
        }
    }

    pub fn record_id(&self) -> String {
        format!("{}/{}", self.template_id, self.name)
    }

    pub fn to_record(&self) -> Result<Record> {
        Record::new(self.record_id(), self)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_placeholder_name(&self.name) {
            return Err(DocforgeError::InvalidDefinition(
                self.record_id(),
                "invalid placeholder name".to_string(),
            ));
        }
        self.context_pattern.matcher()?;
        if let ExpectedType::Enumerated { allowed } = &self.expected_type {
            if allowed.is_empty() {
                return Err(DocforgeError::InvalidDefinition(
                    self.record_id(),
                    "enumerated type needs at least one allowed value".to_string(),
                ));
            }
        }
        if let Some(default) = &self.default_value {
            if self.expected_type.coerce(&Value::String(default.clone())).is_none() {
                return Err(DocforgeError::InvalidDefinition(
                    self.record_id(),
                    format!("default {:?} is not a valid {}", default, self.expected_type),
                ));
            }
        }
        Ok(())
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueSource {
    Datapoint {
        key: String,
        store: String,
        confidence: f64,
    },
    Default,
    /// Optional placeholder with nothing to fill it.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedValue {
    pub value: String,
    pub source: ValueSource,
}

/// Placeholder name to rendered value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedValues {
    values: BTreeMap<String, ResolvedValue>,
}

impl ResolvedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ResolvedValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.value.as_str())
    }

    pub fn provenance(&self, name: &str) -> Option<&ValueSource> {
        self.values.get(name).map(|v| &v.source)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Flat name to value map, as hashed into the job id.
    pub fn plain(&self) -> BTreeMap<&str, &str> {
        self.iter().map(|(k, v)| (k, v.value.as_str())).collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResolvedValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut values = Self::new();
        for (k, v) in iter {
            values.insert(
                k,
                ResolvedValue {
                    value: v.into(),
                    source: ValueSource::Default,
                },
            );
        }
        values
    }
}

/// Effective definitions for every declared placeholder, in name order.
pub fn effective_definitions(
    template: &Template,
    definitions: &[PlaceholderDefinition],
) -> Vec<PlaceholderDefinition> {
    template
        .declared_placeholders
        .iter()
        .map(|name| {
            definitions
                .iter()
                .find(|d| d.name == *name)
                .cloned()
                .unwrap_or_else(|| PlaceholderDefinition::implicit(&template.id, name))
        })
        .collect()
}

/// Key patterns the aggregator has to collect for `template`.
pub fn keys_of_interest(definitions: &[PlaceholderDefinition]) -> Vec<ContextPattern> {
    let mut patterns: Vec<ContextPattern> = Vec::new();
    for def in definitions {
        if !patterns.contains(&def.context_pattern) {
            patterns.push(def.context_pattern.clone());
        }
    }
    patterns
}

/// Resolves every declared placeholder of `template`.
///
/// The best matching datapoint always decides: its value must satisfy the
/// expected type or the request fails with `PlaceholderType`. Only when no
/// datapoint matches does the default apply, then the empty string for
/// optional placeholders. A required placeholder with neither fails with
/// `MissingDatapoint`.
pub fn resolve(
    template: &Template,
    definitions: &[PlaceholderDefinition],
    datapoints: &DatapointSet,
) -> Result<ResolvedValues> {
    let mut resolved = ResolvedValues::new();

    for def in effective_definitions(template, definitions) {
        let matcher = def.context_pattern.matcher()?;
        let value = match datapoints.best_matching(|key| matcher.matches(key)) {
            Some(dp) => {
                let value = def.expected_type.coerce(&dp.value).ok_or_else(|| {
                    DocforgeError::PlaceholderType {
                        placeholder: def.name.clone(),
                        expected: def.expected_type.to_string(),
                        value: dp.value.to_string(),
                    }
                })?;
                ResolvedValue {
                    value,
                    source: ValueSource::Datapoint {
                        key: dp.key.clone(),
                        store: dp.source_store.clone(),
                        confidence: dp.confidence,
                    },
                }
            }
            None => match &def.default_value {
                Some(default) => ResolvedValue {
                    value: default.clone(),
                    source: ValueSource::Default,
                },
                None if def.required => {
                    return Err(DocforgeError::MissingDatapoint(def.name.clone()));
                }
                None => ResolvedValue {
                    value: String::new(),
                    source: ValueSource::Empty,
                },
            },
        };
        resolved.insert(def.name.clone(), value);
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoints::Datapoint;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn template(body: &str, names: &[&str]) -> Template {
        Template {
            id: "status-report".into(),
            name: "Status".into(),
            category: "status-report".into(),
            body: body.into(),
            version: 1,
            originating_store: "a".into(),
            declared_placeholders: names.iter().map(|s| s.to_string()).collect(),
            active: true,
            authored_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn point(key: &str, value: Value, confidence: f64) -> Datapoint {
        Datapoint {
            key: key.into(),
            value,
            source_store: "a".into(),
            confidence,
            observed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_expected_type_coercion() {
        assert_eq!(ExpectedType::Number.coerce(&json!(3)), Some("3".into()));
        assert_eq!(ExpectedType::Number.coerce(&json!("2.5")), Some("2.5".into()));
        assert_eq!(ExpectedType::Number.coerce(&json!("many")), None);
        assert_eq!(ExpectedType::Number.coerce(&json!(true)), None);
        assert_eq!(ExpectedType::Date.coerce(&json!("2024-03-01")), Some("2024-03-01".into()));
        assert!(ExpectedType::Date.coerce(&json!("2024-03-01T10:00:00Z")).is_some());
        assert_eq!(ExpectedType::Date.coerce(&json!("March 1st")), None);
        assert_eq!(ExpectedType::Text.coerce(&json!(false)), Some("false".into()));
        assert_eq!(ExpectedType::Text.coerce(&json!(null)), None);

        let level = ExpectedType::Enumerated {
            allowed: vec!["green".into(), "red".into()],
        };
        assert!(level.coerce(&json!("green")).is_some());
        assert!(level.coerce(&json!("blue")).is_none());
    }

    #[test]
    fn test_expected_type_defaults_to_text() {
        assert_eq!(ExpectedType::default(), ExpectedType::Text);
        let def: PlaceholderDefinition = serde_json::from_value(json!({
            "template_id": "t",
            "name": "owner",
            "context_pattern": { "kind": "exact", "value": "owner" },
        }))
        .unwrap();
        assert_eq!(def.expected_type, ExpectedType::Text);
        assert!(def.required);
    }

    #[test]
    fn test_context_patterns() {
        let prefix = ContextPattern::Prefix("build.".into()).matcher().unwrap();
        assert!(prefix.matches("build.count"));
        assert!(!prefix.matches("deploy.count"));

        let re = ContextPattern::Regex("build\\.[a-z]+".into()).matcher().unwrap();
        assert!(re.matches("build.count"));
        assert!(!re.matches("xbuild.count"));

        assert!(ContextPattern::Regex("(".into()).matcher().is_err());
    }

    #[test]
    fn test_definition_default_must_match_type() {
        let mut def = PlaceholderDefinition::implicit("t", "build_count");
        def.expected_type = ExpectedType::Number;
        def.default_value = Some("0".into());
        assert!(def.validate().is_ok());

        def.default_value = Some("none".into());
        assert!(matches!(def.validate(), Err(DocforgeError::InvalidDefinition(..))));
    }

    #[test]
    fn test_resolve_prefers_datapoint_then_default() {
        let t = template("{{owner}} {{build_count}}", &["owner", "build_count"]);
        let mut count = PlaceholderDefinition::implicit("status-report", "build_count");
        count.expected_type = ExpectedType::Number;
        count.default_value = Some("0".into());

        let set = DatapointSet::from_points(vec![point("owner", json!("ops"), 0.9)]);
        let resolved = resolve(&t, &[count], &set).unwrap();

        assert_eq!(resolved.get("owner"), Some("ops"));
        assert_eq!(resolved.get("build_count"), Some("0"));
        assert_eq!(resolved.provenance("build_count"), Some(&ValueSource::Default));
        assert!(matches!(
            resolved.provenance("owner"),
            Some(ValueSource::Datapoint { .. })
        ));
    }

    #[test]
    fn test_resolve_required_missing_fails() {
        let t = template("{{build_count}}", &["build_count"]);
        let err = resolve(&t, &[], &DatapointSet::default()).unwrap_err();
        assert!(matches!(err, DocforgeError::MissingDatapoint(name) if name == "build_count"));
    }

    #[test]
    fn test_optional_placeholder_resolves_empty() {
        let t = template("{{note}}", &["note"]);
        let mut note = PlaceholderDefinition::implicit("status-report", "note");
        note.required = false;
        let resolved = resolve(&t, &[note], &DatapointSet::default()).unwrap();
        assert_eq!(resolved.get("note"), Some(""));
    }

    #[test]
    fn test_wrong_type_without_default_fails() {
        let t = template("{{build_count}}", &["build_count"]);
        let mut count = PlaceholderDefinition::implicit("status-report", "build_count");
        count.expected_type = ExpectedType::Number;
        let set = DatapointSet::from_points(vec![point("build_count", json!("lots"), 1.0)]);
        let err = resolve(&t, &[count], &set).unwrap_err();
        assert!(matches!(err, DocforgeError::PlaceholderType { .. }));
    }

    #[test]
    fn test_wrong_type_is_not_masked_by_default() {
        let t = template("{{build_count}}", &["build_count"]);
        let mut count = PlaceholderDefinition::implicit("status-report", "build_count");
        count.expected_type = ExpectedType::Number;
        count.default_value = Some("0".into());
        let set = DatapointSet::from_points(vec![point("build_count", json!("lots"), 1.0)]);
        match resolve(&t, &[count], &set).unwrap_err() {
            DocforgeError::PlaceholderType { placeholder, value, .. } => {
                assert_eq!(placeholder, "build_count");
                assert_eq!(value, "\"lots\"");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pattern_picks_highest_confidence_key() {
        let t = template("{{latest_build}}", &["latest_build"]);
        let mut def = PlaceholderDefinition::implicit("status-report", "latest_build");
        def.context_pattern = ContextPattern::Prefix("build.".into());
        let set = DatapointSet::from_points(vec![
            point("build.nightly", json!("n-42"), 0.4),
            point("build.release", json!("r-7"), 0.8),
        ]);
        let resolved = resolve(&t, &[def], &set).unwrap();
        assert_eq!(resolved.get("latest_build"), Some("r-7"));
    }

    #[test]
    fn test_keys_of_interest_deduplicates() {
        let t = template("{{a}} {{b}}", &["a", "b"]);
        let mut b = PlaceholderDefinition::implicit("status-report", "b");
        b.context_pattern = ContextPattern::exact("a");
        let defs = effective_definitions(&t, &[b]);
        assert_eq!(keys_of_interest(&defs), vec![ContextPattern::exact("a")]);
    }
}
