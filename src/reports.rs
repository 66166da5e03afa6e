//! Suite and Analytics Reports
//!
//! Summaries over what a store already holds. Building a report never
//! writes anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::pipeline::GeneratedDocument;
use crate::templates::Template;

/// One document produced during a suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteEntry {
    pub template_id: String,
    pub template_version: u32,
    pub document_id: String,
    pub compliance_score: f64,
    pub violations: usize,
}

impl From<&GeneratedDocument> for SuiteEntry {
    fn from(doc: &GeneratedDocument) -> Self {
        Self {
            template_id: doc.template_id.clone(),
            template_version: doc.template_version,
            document_id: doc.id.clone(),
            compliance_score: doc.compliance_score,
            violations: doc.violations.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteFailure {
    pub template_id: String,
    pub error: String,
}

/// Outcome of generating every active template in one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite_id: String,
    pub generated_at: DateTime<Utc>,
    pub documents: Vec<SuiteEntry>,
    pub failures: Vec<SuiteFailure>,
    /// Mean compliance score of the generated documents, 0 when none were.
    pub average_score: f64,
}

impl SuiteReport {
    pub fn new(suite_id: String, documents: Vec<SuiteEntry>, failures: Vec<SuiteFailure>) -> Self {
        let average_score = mean(documents.iter().map(|d| d.compliance_score));
        Self {
            suite_id,
            generated_at: Utc::now(),
            documents,
            failures,
            average_score,
        }
    }

    pub fn total_generated(&self) -> usize {
        self.documents.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    /// Templates with at least one active version.
    pub templates: usize,
    pub documents: usize,
    pub compliant_documents: usize,
    pub average_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub documents: usize,
    pub compliant_documents: usize,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub store: String,
    pub datapoints: usize,
}

/// Template, generation and datapoint-source figures for one home store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub store: String,
    pub generated_at: DateTime<Utc>,
    pub by_category: BTreeMap<String, CategoryStats>,
    pub generation: GenerationStats,
    /// Busiest store first.
    pub sources: Vec<SourceStats>,
}

/// Documents whose template is no longer stored are grouped here.
pub const UNKNOWN_CATEGORY: &str = "uncategorized";

impl AnalyticsReport {
    /// `templates` is every stored version; `documents` every generated
    /// document of the same store.
    pub fn build(
        store: &str,
        templates: &[Template],
        documents: &[GeneratedDocument],
        mut sources: Vec<SourceStats>,
    ) -> Self {
        let mut by_category: BTreeMap<String, CategoryStats> = BTreeMap::new();
        let mut category_of: BTreeMap<&str, &str> = BTreeMap::new();
        let mut active: BTreeSet<(&str, &str)> = BTreeSet::new();

        for template in templates {
            category_of.insert(template.id.as_str(), template.category.as_str());
            by_category.entry(template.category.clone()).or_default();
            if template.active {
                active.insert((template.category.as_str(), template.id.as_str()));
            }
        }
        for (category, _) in &active {
            if let Some(stats) = by_category.get_mut(*category) {
                stats.templates += 1;
            }
        }

        let mut scores: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for doc in documents {
            let category = category_of
                .get(doc.template_id.as_str())
                .copied()
                .unwrap_or(UNKNOWN_CATEGORY);
            let stats = by_category.entry(category.to_string()).or_default();
            stats.documents += 1;
            if doc.violations.is_empty() {
                stats.compliant_documents += 1;
            }
            scores
                .entry(category.to_string())
                .or_default()
                .push(doc.compliance_score);
        }
        for (category, values) in &scores {
            if let Some(stats) = by_category.get_mut(category) {
                stats.average_score = mean(values.iter().copied());
            }
        }

        let generation = GenerationStats {
            documents: documents.len(),
            compliant_documents: documents.iter().filter(|d| d.violations.is_empty()).count(),
            average_score: mean(documents.iter().map(|d| d.compliance_score)),
        };

        sources.sort_by(|a, b| b.datapoints.cmp(&a.datapoints).then_with(|| a.store.cmp(&b.store)));

        Self {
            store: store.to_string(),
            generated_at: Utc::now(),
            by_category,
            generation,
            sources,
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            format!("# Template Analytics: {}", self.store),
            String::new(),
            format!("Generated {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")),
            String::new(),
            "## Templates by category".to_string(),
            String::new(),
        ];
        for (category, stats) in &self.by_category {
            lines.push(format!(
                "- **{}**: {} templates, {} documents ({} compliant), average score {:.1}",
                category, stats.templates, stats.documents, stats.compliant_documents, stats.average_score
            ));
        }

        lines.extend([
            String::new(),
            "## Generation".to_string(),
            String::new(),
            format!("- Documents: {}", self.generation.documents),
            format!("- Fully compliant: {}", self.generation.compliant_documents),
            format!("- Average compliance score: {:.1}", self.generation.average_score),
            String::new(),
            "## Datapoint sources".to_string(),
            String::new(),
        ]);
        for source in &self.sources {
            lines.push(format!("- **{}**: {} datapoints", source.store, source.datapoints));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
