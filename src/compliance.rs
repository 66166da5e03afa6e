//! Compliance Scoring - Rules produce violations, the scorer counts them.
//!
//! Rule sets are plain data (loaded from config). They are compiled into
//! boxed [`ComplianceRule`]s and evaluated against rendered text only, so
//! `score(text, rules)` is a pure function.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{DocforgeError, Result};
use crate::ENGINE_VERSION;

pub const STANDARD_RULE_SET: &str = "standard";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    pub name: String,
    #[serde(default)]
    pub engine_min_version: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub check: RuleCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCheck {
    TitleSection,
    NoUnresolvedPlaceholders,
    MinSectionCount { min: usize },
    MaxLineLength { max: usize },
    MinLength { chars: usize },
    RequiredPhrases { phrases: Vec<String> },
    ForbiddenPattern { pattern: String },
}

impl RuleSet {
    /// Built-in rule set used when nothing else is configured.
    pub fn standard() -> Self {
        let rule = |name: &str, description: &str, check| RuleSpec {
            name: name.to_string(),
            description: description.to_string(),
            check,
        };
        Self {
            name: STANDARD_RULE_SET.to_string(),
            engine_min_version: None,
            rules: vec![
                rule("title_section", "Document must open with a title section", RuleCheck::TitleSection),
                rule(
                    "no_unresolved_placeholders",
                    "No unresolved placeholder tokens remain",
                    RuleCheck::NoUnresolvedPlaceholders,
                ),
                rule(
                    "min_section_count",
                    "Document has at least one section",
                    RuleCheck::MinSectionCount { min: 1 },
                ),
                rule(
                    "max_line_length",
                    "No line exceeds 200 characters",
                    RuleCheck::MaxLineLength { max: 200 },
                ),
            ],
        }
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DocforgeError::Config(format!("Failed to read rule set {}: {}", path.display(), e))
        })?;
        let set: RuleSet = serde_json::from_str(&content)?;
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| DocforgeError::InvalidRuleSet(self.name.clone(), reason);

        if self.name.trim().is_empty() {
            return Err(invalid("rule set name is empty".into()));
        }
        if let Some(min) = &self.engine_min_version {
            check_engine_version(&self.name, min)?;
        }
        let mut names = BTreeSet::new();
        for spec in &self.rules {
            if spec.name.trim().is_empty() {
                return Err(invalid("rule with empty name".into()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(invalid(format!("duplicate rule name {}", spec.name)));
            }
            build_rule(spec).map_err(|e| invalid(format!("rule {}: {}", spec.name, e)))?;
        }
        Ok(())
    }
}

fn check_engine_version(rule_set: &str, min: &str) -> Result<()> {
    let engine = semver::Version::parse(ENGINE_VERSION)
        .map_err(|_| DocforgeError::Config("Invalid engine version".into()))?;
    let required = semver::Version::parse(min).map_err(|e| {
        DocforgeError::InvalidRuleSet(rule_set.to_string(), format!("engine_min_version: {}", e))
    })?;
    if engine < required {
        return Err(DocforgeError::EngineVersionMismatch(
            rule_set.to_string(),
            min.to_string(),
            ENGINE_VERSION.to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceViolation {
    pub rule: String,
    pub description: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub rule_set: String,
    pub score: f64,
    pub passed: usize,
    pub total: usize,
    pub violations: Vec<ComplianceViolation>,
}

impl ComplianceReport {
    pub fn is_compliant(&self) -> bool {
        self.violations.is_empty()
    }
}

/// A section heading found in rendered text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeading {
    pub level: u8,
    pub title: String,
    pub line: usize,
}

/// Rendered text split once so every rule sees the same structure.
pub struct DocumentView<'a> {
    pub text: &'a str,
    pub lines: Vec<&'a str>,
    pub sections: Vec<SectionHeading>,
}

impl<'a> DocumentView<'a> {
    pub fn new(text: &'a str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let sections = lines
            .iter()
            .enumerate()
            .filter_map(|(i, line)| parse_heading(line).map(|(level, title)| SectionHeading {
                level,
                title,
                line: i + 1,
            }))
            .collect();
        Self { text, lines, sections }
    }
}

fn tagged_section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^<section level="([1-6])" title="([^"]*)">$"#).expect("static regex")
    })
}

fn unresolved_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*[A-Za-z_][A-Za-z0-9_.\-]*\s*\}\}").expect("static regex")
    })
}

/// Recognizes markdown (`## Title`) and tagged (`<section ...>`) headings.
fn parse_heading(line: &str) -> Option<(u8, String)> {
    let trimmed = line.trim_end();
    if let Some(caps) = tagged_section_re().captures(trimmed) {
        let level = caps[1].parse().ok()?;
        return Some((level, caps[2].to_string()));
    }
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) {
        let rest = &trimmed[hashes..];
        if rest.starts_with(' ') && !rest.trim().is_empty() {
            return Some((hashes as u8, rest.trim().to_string()));
        }
    }
    None
}

/// Compliance rule trait - returns the failure reason, `None` when satisfied.
pub trait ComplianceRule {
    fn name(&self) -> &str;
    fn check(&self, doc: &DocumentView<'_>) -> Option<String>;
}

// --- Concrete Rules ---

pub struct TitleSectionRule {
    name: String,
}

impl ComplianceRule for TitleSectionRule {
    fn name(&self) -> &str { &self.name }

    fn check(&self, doc: &DocumentView<'_>) -> Option<String> {
        match doc.sections.first() {
            None => Some("no section headings found".to_string()),
            Some(first) if first.level != 1 => Some(format!(
                "first section {:?} is level {}, expected a level 1 title",
                first.title, first.level
            )),
            Some(_) => None,
        }
    }
}

pub struct NoUnresolvedPlaceholdersRule {
    name: String,
}

impl ComplianceRule for NoUnresolvedPlaceholdersRule {
    fn name(&self) -> &str { &self.name }

    fn check(&self, doc: &DocumentView<'_>) -> Option<String> {
        let found: Vec<&str> = unresolved_token_re()
            .find_iter(doc.text)
            .map(|m| m.as_str())
            .collect();
        if found.is_empty() {
            None
        } else {
            Some(format!("unresolved placeholder tokens remain: {}", found.join(", ")))
        }
    }
}

pub struct MinSectionCountRule {
    name: String,
    min: usize,
}

impl ComplianceRule for MinSectionCountRule {
    fn name(&self) -> &str { &self.name }

    fn check(&self, doc: &DocumentView<'_>) -> Option<String> {
        let count = doc.sections.len();
        (count < self.min).then(|| format!("found {} sections, expected at least {}", count, self.min))
    }
}

pub struct MaxLineLengthRule {
    name: String,
    max: usize,
}

impl ComplianceRule for MaxLineLengthRule {
    fn name(&self) -> &str { &self.name }

    fn check(&self, doc: &DocumentView<'_>) -> Option<String> {
        doc.lines.iter().enumerate().find_map(|(i, line)| {
            let len = line.chars().count();
            (len > self.max).then(|| {
                format!("line {} has {} characters (max {})", i + 1, len, self.max)
            })
        })
    }
}

pub struct MinLengthRule {
    name: String,
    chars: usize,
}

impl ComplianceRule for MinLengthRule {
    fn name(&self) -> &str { &self.name }

    fn check(&self, doc: &DocumentView<'_>) -> Option<String> {
        let len = doc.text.chars().count();
        (len < self.chars).then(|| {
            format!("document has {} characters, expected at least {}", len, self.chars)
        })
    }
}

pub struct RequiredPhrasesRule {
    name: String,
    phrases: Vec<String>,
}

impl ComplianceRule for RequiredPhrasesRule {
    fn name(&self) -> &str { &self.name }

    fn check(&self, doc: &DocumentView<'_>) -> Option<String> {
        let missing: Vec<&str> = self
            .phrases
            .iter()
            .filter(|p| !doc.text.contains(p.as_str()))
            .map(String::as_str)
            .collect();
        (!missing.is_empty()).then(|| format!("missing required phrases: {}", missing.join(", ")))
    }
}

pub struct ForbiddenPatternRule {
    name: String,
    pattern: Regex,
}

impl ComplianceRule for ForbiddenPatternRule {
    fn name(&self) -> &str { &self.name }

    fn check(&self, doc: &DocumentView<'_>) -> Option<String> {
        self.pattern.find(doc.text).map(|m| {
            format!("forbidden pattern /{}/ matched {:?}", self.pattern.as_str(), m.as_str())
        })
    }
}

/// Stands in for a rule whose definition does not compile, and always fails.
struct BrokenRule {
    name: String,
    error: String,
}

impl ComplianceRule for BrokenRule {
    fn name(&self) -> &str { &self.name }

    fn check(&self, _doc: &DocumentView<'_>) -> Option<String> {
        Some(format!("rule could not be evaluated: {}", self.error))
    }
}

fn build_rule(spec: &RuleSpec) -> std::result::Result<Box<dyn ComplianceRule>, String> {
    let name = spec.name.clone();
    let rule: Box<dyn ComplianceRule> = match &spec.check {
        RuleCheck::TitleSection => Box::new(TitleSectionRule { name }),
        RuleCheck::NoUnresolvedPlaceholders => Box::new(NoUnresolvedPlaceholdersRule { name }),
        RuleCheck::MinSectionCount { min } => Box::new(MinSectionCountRule { name, min: *min }),
        RuleCheck::MaxLineLength { max } => Box::new(MaxLineLengthRule { name, max: *max }),
        RuleCheck::MinLength { chars } => Box::new(MinLengthRule { name, chars: *chars }),
        RuleCheck::RequiredPhrases { phrases } => Box::new(RequiredPhrasesRule {
            name,
            phrases: phrases.clone(),
        }),
        RuleCheck::ForbiddenPattern { pattern } => Box::new(ForbiddenPatternRule {
            name,
            pattern: Regex::new(pattern).map_err(|e| e.to_string())?,
        }),
    };
    Ok(rule)
}

/// Scorer orchestrates compiled rules in rule-set order
pub struct Scorer {
    rule_set: String,
    rules: Vec<(Box<dyn ComplianceRule>, String)>,
}

impl Scorer {
    /// Compiles a validated rule set; fails on the first broken rule.
    pub fn new(rule_set: &RuleSet) -> Result<Self> {
        rule_set.validate()?;
        Ok(Self::compile(rule_set))
    }

    fn compile(rule_set: &RuleSet) -> Self {
        let rules = rule_set
            .rules
            .iter()
            .map(|spec| {
                let rule: Box<dyn ComplianceRule> = match build_rule(spec) {
                    Ok(rule) => rule,
                    Err(error) => Box::new(BrokenRule {
                        name: spec.name.clone(),
                        error,
                    }),
                };
                (rule, spec.description.clone())
            })
            .collect();
        Self {
            rule_set: rule_set.name.clone(),
            rules,
        }
    }

    pub fn score(&self, document_text: &str) -> ComplianceReport {
        let view = DocumentView::new(document_text);
        let mut violations = vec![];

        for (rule, description) in &self.rules {
            if let Some(reason) = rule.check(&view) {
                violations.push(ComplianceViolation {
                    rule: rule.name().to_string(),
                    description: description.clone(),
                    reason,
                });
            }
        }

        let total = self.rules.len();
        let passed = total - violations.len();
        let score = if total == 0 {
            100.0
        } else {
            100.0 * passed as f64 / total as f64
        };

        ComplianceReport {
            rule_set: self.rule_set.clone(),
            score,
            passed,
            total,
            violations,
        }
    }
}

/// Scores `document_text` against `rule_set`.
///
/// Pure and deterministic: identical inputs give identical reports. A rule
/// that cannot be compiled counts as failed rather than aborting scoring.
pub fn score(document_text: &str, rule_set: &RuleSet) -> ComplianceReport {
    Scorer::compile(rule_set).score(document_text)
}

/// Named rule sets plus the category mapping used to pick one per document.
#[derive(Debug, Clone)]
pub struct RuleCatalog {
    sets: BTreeMap<String, RuleSet>,
    default: String,
    by_category: BTreeMap<String, String>,
}

impl RuleCatalog {
    pub fn new(
        rule_sets: Vec<RuleSet>,
        default: &str,
        by_category: BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut sets = BTreeMap::new();
        for set in rule_sets {
            set.validate()?;
            if sets.contains_key(&set.name) {
                return Err(DocforgeError::InvalidRuleSet(
                    set.name.clone(),
                    "defined more than once".into(),
                ));
            }
            sets.insert(set.name.clone(), set);
        }
        sets.entry(STANDARD_RULE_SET.to_string())
            .or_insert_with(RuleSet::standard);

        if !sets.contains_key(default) {
            return Err(DocforgeError::RuleSetNotFound(default.to_string()));
        }
        for target in by_category.values() {
            if !sets.contains_key(target) {
                return Err(DocforgeError::RuleSetNotFound(target.clone()));
            }
        }
        Ok(Self {
            sets,
            default: default.to_string(),
            by_category,
        })
    }

    /// Adds or replaces a rule set.
    pub fn insert(&mut self, set: RuleSet) -> Result<()> {
        set.validate()?;
        self.sets.insert(set.name.clone(), set);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&RuleSet> {
        self.sets
            .get(name)
            .ok_or_else(|| DocforgeError::RuleSetNotFound(name.to_string()))
    }

    /// Explicit name first, then the category mapping, then the default.
    pub fn select(&self, explicit: Option<&str>, category: &str) -> Result<&RuleSet> {
        match explicit {
            Some(name) => self.get(name),
            None => {
                let name = self.by_category.get(category).unwrap_or(&self.default);
                self.get(name)
            }
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.sets.keys().map(String::as_str).collect()
    }
}

impl Default for RuleCatalog {
    fn default() -> Self {
        let mut sets = BTreeMap::new();
        sets.insert(STANDARD_RULE_SET.to_string(), RuleSet::standard());
        Self {
            sets,
            default: STANDARD_RULE_SET.to_string(),
            by_category: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rules(checks: Vec<(&str, RuleCheck)>) -> RuleSet {
        RuleSet {
            name: "test".into(),
            engine_min_version: None,
            rules: checks
                .into_iter()
                .map(|(name, check)| RuleSpec {
                    name: name.into(),
                    description: format!("{} rule", name),
                    check,
                })
                .collect(),
        }
    }

    #[test]
    fn test_compliant_document_scores_100() {
        let doc = "# Status\n\nAll builds green.\n\n## Details\n\nNothing to report.\n";
        let report = score(doc, &RuleSet::standard());
        assert_eq!(report.score, 100.0);
        assert!(report.is_compliant());
        assert_eq!(report.passed, 4);
    }

    #[test]
    fn test_score_is_fraction_of_rules_passed() {
        let set = rules(vec![
            ("title", RuleCheck::TitleSection),
            ("tokens", RuleCheck::NoUnresolvedPlaceholders),
            ("sections", RuleCheck::MinSectionCount { min: 3 }),
            ("lines", RuleCheck::MaxLineLength { max: 10 }),
        ]);
        let report = score("# Title\nhas {{leftover}} token\n", &set);
        assert_eq!(report.total, 4);
        assert_eq!(report.passed, 1);
        assert_eq!(report.score, 25.0);
        let failed: Vec<_> = report.violations.iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(failed, vec!["tokens", "sections", "lines"]);
    }

    #[test]
    fn test_title_rule_reasons() {
        let set = rules(vec![("title", RuleCheck::TitleSection)]);
        let none = score("just prose\n", &set);
        assert!(none.violations[0].reason.contains("no section headings"));

        let sub = score("## Sub first\n# Title\n", &set);
        assert!(sub.violations[0].reason.contains("level 2"));
    }

    #[test]
    fn test_tagged_sections_are_recognized() {
        let doc = "<section level=\"1\" title=\"Report\">\nbody\n</section>\n<section level=\"2\" title=\"More\">\nx\n</section>\n";
        let view = DocumentView::new(doc);
        assert_eq!(view.sections.len(), 2);
        assert_eq!(view.sections[0].title, "Report");
        assert_eq!(view.sections[1].level, 2);
        assert!(score(doc, &RuleSet::standard()).is_compliant());
    }

    #[test]
    fn test_hash_without_space_is_not_heading() {
        assert_eq!(parse_heading("#hashtag"), None);
        assert_eq!(parse_heading("####### seven"), None);
        assert_eq!(parse_heading("### Three"), Some((3, "Three".to_string())));
    }

    #[test]
    fn test_required_phrases_and_forbidden_pattern() {
        let set = rules(vec![
            ("phrases", RuleCheck::RequiredPhrases {
                phrases: vec!["Owner:".into(), "Revision:".into()],
            }),
            ("no-todo", RuleCheck::ForbiddenPattern { pattern: r"(?i)\btodo\b".into() }),
        ]);
        let report = score("# Doc\nOwner: ops\nTODO fill in\n", &set);
        assert_eq!(report.violations.len(), 2);
        assert!(report.violations[0].reason.contains("Revision:"));
        assert!(report.violations[1].reason.contains("TODO"));
    }

    #[test]
    fn test_max_line_length_counts_chars_not_bytes() {
        let set = rules(vec![("lines", RuleCheck::MaxLineLength { max: 3 })]);
        assert!(score("äöü\n", &set).is_compliant());
        assert!(!score("äöüß\n", &set).is_compliant());
    }

    #[test]
    fn test_empty_rule_set_scores_100() {
        let report = score("anything", &rules(vec![]));
        assert_eq!(report.score, 100.0);
        assert_eq!(report.total, 0);
    }

    #[test]
    fn test_invalid_pattern_fails_validation_but_scores_as_failed() {
        let set = rules(vec![("bad", RuleCheck::ForbiddenPattern { pattern: "(".into() })]);
        assert!(matches!(set.validate(), Err(DocforgeError::InvalidRuleSet(_, _))));
        assert!(Scorer::new(&set).is_err());
        let report = score("text", &set);
        assert_eq!(report.score, 0.0);
        assert!(report.violations[0].reason.contains("could not be evaluated"));
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let set = rules(vec![
            ("same", RuleCheck::TitleSection),
            ("same", RuleCheck::MinLength { chars: 1 }),
        ]);
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_engine_min_version_enforced() {
        let mut set = rules(vec![]);
        set.engine_min_version = Some("99.0.0".into());
        assert!(matches!(set.validate(), Err(DocforgeError::EngineVersionMismatch(..))));
        set.engine_min_version = Some("1.0.0".into());
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_catalog_selection_order() {
        let mut by_category = BTreeMap::new();
        by_category.insert("status-report".to_string(), "test".to_string());
        let catalog = RuleCatalog::new(vec![rules(vec![])], STANDARD_RULE_SET, by_category).unwrap();
        assert_eq!(catalog.select(None, "status-report").unwrap().name, "test");
        assert_eq!(catalog.select(None, "schema-doc").unwrap().name, "standard");
        assert_eq!(catalog.select(Some("standard"), "status-report").unwrap().name, "standard");
        assert!(catalog.select(Some("nope"), "x").is_err());
    }

    #[test]
    fn test_rule_set_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(
            &path,
            r#"{"name": "docs", "rules": [
                {"name": "title", "description": "needs title", "check": {"kind": "title_section"}},
                {"name": "len", "check": {"kind": "min_length", "chars": 10}}
            ]}"#,
        )
        .unwrap();
        let set = RuleSet::load_json(&path).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[1].check, RuleCheck::MinLength { chars: 10 });
    }

    mod proptests {
        use crate::compliance::{score, RuleSet};
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn score_is_deterministic(text in "\\PC*") {
                let set = RuleSet::standard();
                let first = score(&text, &set);
                let second = score(&text, &set);
                prop_assert_eq!(first, second);
            }

            #[test]
            fn score_stays_in_range(text in "(# [a-z]{1,8}\n|[a-z {}]{0,40}\n){0,12}") {
                let report = score(&text, &RuleSet::standard());
                prop_assert!(report.score >= 0.0 && report.score <= 100.0);
                prop_assert_eq!(report.passed + report.violations.len(), report.total);
            }
        }
    }
}
