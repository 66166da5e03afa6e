//! Generation Pipeline - Single Entry Point
//!
//! CRITICAL: generate MUST score every rendered document. No bypass.
//!
//! Request -> active template (home store) -> datapoints (all target stores)
//! -> resolved values -> rendered text -> compliance report -> persisted
//! document -> optional template sync to peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assembler::{render, OutputFormat};
use crate::compliance::{ComplianceReport, ComplianceViolation, RuleCatalog, RuleSet, Scorer};
use crate::config::EngineConfig;
use crate::datapoints::DatapointAggregator;
use crate::error::{DocforgeError, Result};
use crate::hashing::{compute_content_hash, compute_job_hash};
use crate::placeholders::{effective_definitions, keys_of_interest, resolve};
use crate::reports::{AnalyticsReport, SourceStats, SuiteEntry, SuiteFailure, SuiteReport};
use crate::store::{Collection, Filter, Record, StoreSet};
use crate::sync::{SyncCoordinator, SyncOutcome, SyncRecord};
use crate::templates::{Template, TemplateRepository};
use crate::ENGINE_VERSION;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static SCORE_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_score_call_count() -> u32 {
    SCORE_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_score_call_count() {
    SCORE_CALL_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub template_id: String,
    /// Priority-ordered. The first store is the home store.
    pub target_stores: Vec<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub rule_set: Option<String>,
    #[serde(default)]
    pub sync_peers: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub id: String,
    pub template_id: String,
    pub template_version: u32,
    pub output_format: OutputFormat,
    pub rendered_body: String,
    pub compliance_score: f64,
    pub violations: Vec<ComplianceViolation>,
    pub rule_set: String,
    pub content_hash: String,
    pub job_hash: String,
    pub engine_version: String,
    pub generated_at: DateTime<Utc>,
}

/// A peer the template could not be synchronized to. The document itself
/// is stored regardless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSyncFailure {
    pub target_store: String,
    pub error: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub document: GeneratedDocument,
    pub sync: Vec<SyncRecord>,
    #[serde(default)]
    pub sync_failures: Vec<PeerSyncFailure>,
}

impl GenerationOutcome {
    pub fn fully_synced(&self) -> bool {
        self.sync_failures.is_empty()
    }
}

/// The generation pipeline - single entry point for document production
pub struct GenerationPipeline {
    stores: StoreSet,
    aggregator: DatapointAggregator,
    rules: RuleCatalog,
    sync: SyncCoordinator,
}

impl GenerationPipeline {
    pub fn new(stores: StoreSet, config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            stores,
            aggregator: DatapointAggregator::new(config.aggregation.min_confidence),
            rules: config.rule_catalog()?,
            sync: SyncCoordinator::new(config.sync.clone()),
        })
    }

    /// Opens every configured store.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let stores = StoreSet::open(&config.stores, config.busy_timeout())?;
        Self::new(stores, config)
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub fn rules(&self) -> &RuleCatalog {
        &self.rules
    }

    /// Registers an extra rule set, e.g. one loaded from a JSON file.
    pub fn add_rule_set(&mut self, rule_set: RuleSet) -> Result<()> {
        self.rules.insert(rule_set)
    }

    pub fn repository(&self, store_id: &str) -> Result<TemplateRepository> {
        Ok(TemplateRepository::new(self.stores.get(store_id)?))
    }

    /// Scores text against a rule set. Every document the pipeline renders
    /// is scored through here.
    pub fn score(&self, document_text: &str, rule_set: &RuleSet) -> Result<ComplianceReport> {
        #[cfg(feature = "test-hooks")]
        SCORE_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        Ok(Scorer::new(rule_set)?.score(document_text))
    }

    /// Renders and scores a document without persisting it.
    pub fn preview(&self, request: &GenerationRequest) -> Result<GeneratedDocument> {
        let stores = self.stores.select(&request.target_stores)?;
        let home = stores.first().cloned().ok_or_else(|| {
            DocforgeError::Config("generation request names no target stores".to_string())
        })?;

        let repo = TemplateRepository::new(home);
        let template = repo.get_active(&request.template_id)?;
        let definitions = effective_definitions(&template, &repo.definitions(&template.id)?);
        debug!(template_id = %template.id, version = template.version, "template resolved");

        let datapoints = self
            .aggregator
            .collect(&keys_of_interest(&definitions), &stores)?;
        let values = resolve(&template, &definitions, &datapoints)?;
        let rendered = render(&template, &values, request.output_format)?;
        debug!(template_id = %template.id, bytes = rendered.len(), "document rendered");

        // MANDATORY: every rendered document is scored.
        let rule_set = self
            .rules
            .select(request.rule_set.as_deref(), &template.category)?;
        let report = self.score(&rendered, rule_set)?;

        let job_hash = compute_job_hash(
            &template.id,
            template.version,
            request.output_format.as_str(),
            &values.plain(),
            ENGINE_VERSION,
        )?;

        Ok(GeneratedDocument {
            id: Uuid::new_v4().to_string(),
            template_id: template.id.clone(),
            template_version: template.version,
            output_format: request.output_format,
            content_hash: compute_content_hash(&rendered),
            rendered_body: rendered,
            compliance_score: report.score,
            violations: report.violations,
            rule_set: report.rule_set,
            job_hash,
            engine_version: ENGINE_VERSION.to_string(),
            generated_at: Utc::now(),
        })
    }

    /// Generates, scores and persists one document.
    ///
    /// Nothing is written unless rendering and scoring both succeed. With
    /// `sync_peers`, the template is then synchronized from the home store
    /// to every other target store. Once the document is stored the call
    /// succeeds; peers that could not be synchronized are listed in
    /// `sync_failures`.
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutcome> {
        let document = self.preview(request)?;
        let home = self.stores.get(&request.target_stores[0])?;
        home.write(
            Collection::GeneratedDocuments,
            Record::new(document.id.clone(), &document)?,
        )?;
        info!(
            template_id = %document.template_id,
            version = document.template_version,
            store = %home.id(),
            document_id = %document.id,
            score = document.compliance_score,
            violations = document.violations.len(),
            "document generated"
        );

        let mut sync = vec![];
        let mut sync_failures = vec![];
        if request.sync_peers {
            for peer in &request.target_stores[1..] {
                if peer == home.id() {
                    continue;
                }
                match self.synchronize(&document.template_id, home.id(), peer) {
                    Ok(outcome) => sync.push(outcome.record),
                    Err(err) => {
                        warn!(
                            template_id = %document.template_id,
                            document_id = %document.id,
                            target = %peer,
                            error = %err,
                            "peer sync failed after generation"
                        );
                        sync_failures.push(PeerSyncFailure {
                            target_store: peer.clone(),
                            retryable: err.is_retryable(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        Ok(GenerationOutcome {
            document,
            sync,
            sync_failures,
        })
    }

    /// Generates every active template of the home store (the first of
    /// `target_stores`). A template that fails is recorded and the run
    /// moves on to the next one.
    pub fn generate_suite(
        &self,
        target_stores: &[String],
        output_format: OutputFormat,
        rule_set: Option<&str>,
    ) -> Result<SuiteReport> {
        let home = target_stores.first().ok_or_else(|| {
            DocforgeError::Config("suite request names no target stores".to_string())
        })?;
        let templates = self.repository(home)?.catalog()?;

        let mut documents = vec![];
        let mut failures = vec![];
        for template in templates {
            let request = GenerationRequest {
                template_id: template.id.clone(),
                target_stores: target_stores.to_vec(),
                output_format,
                rule_set: rule_set.map(str::to_string),
                sync_peers: false,
            };
            match self.generate(&request) {
                Ok(outcome) => documents.push(SuiteEntry::from(&outcome.document)),
                Err(err) => {
                    warn!(template_id = %template.id, error = %err, "suite generation failed");
                    failures.push(SuiteFailure {
                        template_id: template.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        let report = SuiteReport::new(Uuid::new_v4().to_string(), documents, failures);
        info!(
            suite_id = %report.suite_id,
            store = %home,
            generated = report.total_generated(),
            failed = report.failures.len(),
            average_score = report.average_score,
            "documentation suite generated"
        );
        Ok(report)
    }

    /// Template, generation and datapoint-source figures. Templates and
    /// documents come from the first store; datapoints are counted in each.
    pub fn analytics(&self, store_ids: &[String]) -> Result<AnalyticsReport> {
        let home = store_ids.first().ok_or_else(|| {
            DocforgeError::Config("analytics request names no stores".to_string())
        })?;
        let store = self.stores.get(home)?;

        let templates = store
            .read(Collection::Templates, &Filter::all())?
            .iter()
            .map(Record::decode::<Template>)
            .collect::<Result<Vec<_>>>()?;
        let documents = store
            .read(Collection::GeneratedDocuments, &Filter::all())?
            .iter()
            .map(Record::decode::<GeneratedDocument>)
            .collect::<Result<Vec<_>>>()?;

        let mut sources = vec![];
        for source in self.stores.select(store_ids)? {
            sources.push(SourceStats {
                store: source.id().to_string(),
                datapoints: source.read(Collection::Datapoints, &Filter::all())?.len(),
            });
        }

        Ok(AnalyticsReport::build(home, &templates, &documents, sources))
    }

    pub fn synchronize(&self, template_id: &str, source: &str, target: &str) -> Result<SyncOutcome> {
        let source = self.stores.get(source)?;
        let target = self.stores.get(target)?;
        self.sync.synchronize(template_id, &source, &target)
    }

    /// Generated documents for `template_id` held in `store_id`, oldest first.
    pub fn documents(&self, store_id: &str, template_id: &str) -> Result<Vec<GeneratedDocument>> {
        self.stores
            .get(store_id)?
            .read(
                Collection::GeneratedDocuments,
                &Filter::all().eq("template_id", template_id),
            )?
            .iter()
            .map(Record::decode::<GeneratedDocument>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::sync::Arc;

    fn pipeline() -> GenerationPipeline {
        let mut stores = StoreSet::new();
        stores.register(Arc::new(SqliteStore::open_in_memory("primary").unwrap()));
        GenerationPipeline::new(stores, &EngineConfig::default()).unwrap()
    }

    fn request(template_id: &str) -> GenerationRequest {
        GenerationRequest {
            template_id: template_id.into(),
            target_stores: vec!["primary".into()],
            output_format: OutputFormat::Markdown,
            rule_set: None,
            sync_peers: false,
        }
    }

    #[test]
    fn test_unknown_template_rejected() {
        let err = pipeline().generate(&request("missing")).unwrap_err();
        assert!(matches!(err, DocforgeError::TemplateNotFound(_)));
    }

    #[test]
    fn test_empty_store_list_rejected() {
        let mut req = request("t");
        req.target_stores.clear();
        assert!(matches!(pipeline().generate(&req), Err(DocforgeError::Config(_))));
    }

    #[test]
    fn test_unknown_store_rejected() {
        let mut req = request("t");
        req.target_stores = vec!["nowhere".into()];
        assert!(matches!(pipeline().generate(&req), Err(DocforgeError::UnknownStore(_))));
    }

    #[test]
    fn test_preview_does_not_persist() {
        let p = pipeline();
        p.repository("primary")
            .unwrap()
            .create_template("t", "T", "c", "# Title\n\nstatic body", Default::default())
            .unwrap();
        let doc = p.preview(&request("t")).unwrap();
        assert_eq!(doc.compliance_score, 100.0);
        assert!(p.documents("primary", "t").unwrap().is_empty());

        let outcome = p.generate(&request("t")).unwrap();
        assert_eq!(outcome.document.job_hash, doc.job_hash);
        assert_eq!(outcome.document.content_hash, doc.content_hash);
        assert_ne!(outcome.document.id, doc.id);
        assert_eq!(p.documents("primary", "t").unwrap().len(), 1);
    }

    #[test]
    fn test_generated_document_json_shape() {
        let p = pipeline();
        p.repository("primary")
            .unwrap()
            .create_template("t", "T", "c", "# Title\nbody", Default::default())
            .unwrap();
        let doc = p.generate(&request("t")).unwrap().document;
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["output_format"], "markdown");
        assert_eq!(json["engine_version"], ENGINE_VERSION);
        assert_eq!(json["rule_set"], "standard");
        assert_eq!(json["content_hash"].as_str().unwrap().len(), 64);
    }
}
