//! Template System - Versioned, Enforceable Contracts
//!
//! A template body is literal text with `{{name}}` tokens. `\{{` writes a
//! literal `{{`. The set of tokens in the body must equal the declared
//! placeholder set, and that is checked before anything is persisted.
//!
//! Versions are immutable: changing a template means writing version N+1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DocforgeError, Result};
use crate::hashing::sha256_hex;
use crate::placeholders::PlaceholderDefinition;
use crate::store::{Collection, DataStore, Filter, Record};

pub type TemplateId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub category: String,
    pub body: String,
    pub version: u32,
    pub originating_store: String,
    pub declared_placeholders: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub authored_at: DateTime<Utc>,
}

fn default_true() -> bool { true }

impl Template {
    pub fn record_id(&self) -> String {
        version_record_id(&self.id, self.version)
    }

    pub fn body_hash(&self) -> String {
        sha256_hex(self.body.as_bytes())
    }

    pub fn to_record(&self) -> Result<Record> {
        Record::new(self.record_id(), self)
    }
}

pub fn version_record_id(template_id: &str, version: u32) -> String {
    format!("{}@v{}", template_id, version)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder(String),
}

pub fn is_valid_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Splits a body into literal text and placeholder tokens in one pass.
pub fn parse_segments(body: &str) -> Result<Vec<Segment>> {
    let mut segments = vec![];
    let mut literal = String::new();
    let mut i = 0;

    while i < body.len() {
        let rest = &body[i..];
        if rest.starts_with("\\{{") {
            literal.push_str("{{");
            i += 3;
        } else if rest.starts_with("{{") {
            // A token ends on the line it starts on.
            let line = rest[2..].split('\n').next().unwrap_or_default();
            let close = line.find("}}").ok_or_else(|| DocforgeError::MalformedTemplate {
                offset: i,
                reason: "unterminated placeholder token".to_string(),
            })?;
            let name = rest[2..2 + close].trim();
            if !is_valid_placeholder_name(name) {
                return Err(DocforgeError::MalformedTemplate {
                    offset: i,
                    reason: format!("invalid placeholder name {:?}", name),
                });
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(name.to_string()));
            i += 2 + close + 2;
        } else {
            // Safe: `i` always sits on a char boundary.
            let c = rest.chars().next().unwrap_or_default();
            literal.push(c);
            i += c.len_utf8();
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Placeholder names referenced by `body`.
pub fn placeholder_names(body: &str) -> Result<BTreeSet<String>> {
    Ok(parse_segments(body)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Body tokens and declarations must match in both directions.
pub fn check_declarations(body: &str, declared: &BTreeSet<String>) -> Result<()> {
    let used = placeholder_names(body)?;
    let missing: Vec<String> = used.difference(declared).cloned().collect();
    let undeclared: Vec<String> = declared.difference(&used).cloned().collect();
    if missing.is_empty() && undeclared.is_empty() {
        Ok(())
    } else {
        // `missing`: used in the body but not declared.
        // `undeclared`: declared but absent from the body.
        Err(DocforgeError::PlaceholderDeclarationMismatch { missing, undeclared })
    }
}

/// Template repository - CRUD and versioning over one store
pub struct TemplateRepository {
    store: Arc<dyn DataStore>,
}

impl TemplateRepository {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub fn store_id(&self) -> &str {
        self.store.id()
    }

    /// Every stored version, ascending.
    pub fn history(&self, template_id: &str) -> Result<Vec<Template>> {
        let records = self
            .store
            .read(Collection::Templates, &Filter::all().eq("id", template_id))?;
        let mut versions = records
            .iter()
            .map(Record::decode::<Template>)
            .collect::<Result<Vec<_>>>()?;
        versions.sort_by_key(|t| t.version);
        Ok(versions)
    }

    /// Highest version regardless of active state.
    pub fn latest(&self, template_id: &str) -> Result<Option<Template>> {
        Ok(self.history(template_id)?.pop())
    }

    /// Highest-version active template.
    pub fn get_active(&self, template_id: &str) -> Result<Template> {
        self.history(template_id)?
            .into_iter()
            .filter(|t| t.active)
            .last()
            .ok_or_else(|| DocforgeError::TemplateNotFound(template_id.to_string()))
    }

    pub fn get_version(&self, template_id: &str, version: u32) -> Result<Template> {
        let records = self.store.read(
            Collection::Templates,
            &Filter::all().eq("id", template_id).eq("version", version),
        )?;
        match records.first() {
            Some(record) => record.decode(),
            None => Err(DocforgeError::TemplateNotFound(version_record_id(template_id, version))),
        }
    }

    /// Active head of every template in the store, sorted by id.
    pub fn catalog(&self) -> Result<Vec<Template>> {
        let mut heads: BTreeMap<String, Template> = BTreeMap::new();
        for record in self.store.read(Collection::Templates, &Filter::all().eq("active", true))? {
            let template: Template = record.decode()?;
            let newer = heads
                .get(&template.id)
                .map_or(true, |existing| template.version > existing.version);
            if newer {
                heads.insert(template.id.clone(), template);
            }
        }
        Ok(heads.into_values().collect())
    }

    /// Authors version 1 of a new template.
    pub fn create_template(
        &self,
        template_id: &str,
        name: &str,
        category: &str,
        body: &str,
        declared: BTreeSet<String>,
    ) -> Result<Template> {
        check_declarations(body, &declared)?;
        let template = Template {
            id: template_id.to_string(),
            name: name.to_string(),
            category: category.to_string(),
            body: body.to_string(),
            version: 1,
            originating_store: self.store.id().to_string(),
            declared_placeholders: declared,
            active: true,
            authored_at: Utc::now(),
        };
        let record = template.to_record()?;

        self.store.scoped_transaction(&mut |tx| {
            let existing = tx.read(Collection::Templates, &Filter::all().eq("id", template_id))?;
            if !existing.is_empty() {
                return Err(DocforgeError::TemplateAlreadyExists(template_id.to_string()));
            }
            tx.write(Collection::Templates, record.clone())?;
            Ok(())
        })?;

        info!(template_id, store = %self.store.id(), version = 1, "template created");
        Ok(template)
    }

    /// Writes the next version on top of whatever the latest version is now.
    pub fn create_version(
        &self,
        template_id: &str,
        body: &str,
        declared: BTreeSet<String>,
    ) -> Result<Template> {
        check_declarations(body, &declared)?;
        let base = self
            .latest(template_id)?
            .ok_or_else(|| DocforgeError::TemplateNotFound(template_id.to_string()))?;
        self.create_version_from(base.version, template_id, body, declared)
    }

    /// Writes version `base_version + 1`.
    ///
    /// The latest version is re-read inside the write transaction. If it is
    /// no longer `base_version`, another writer got there first and the call
    /// fails with `ConcurrentVersionConflict` without writing anything.
    pub fn create_version_from(
        &self,
        base_version: u32,
        template_id: &str,
        body: &str,
        declared: BTreeSet<String>,
    ) -> Result<Template> {
        check_declarations(body, &declared)?;
        let base = self.get_version(template_id, base_version)?;
        let template = Template {
            id: template_id.to_string(),
            name: base.name,
            category: base.category,
            body: body.to_string(),
            version: base_version + 1,
            originating_store: self.store.id().to_string(),
            declared_placeholders: declared,
            active: true,
            authored_at: Utc::now(),
        };
        let record = template.to_record()?;

        self.store.scoped_transaction(&mut |tx| {
            let current = tx
                .read(Collection::Templates, &Filter::all().eq("id", template_id))?
                .iter()
                .map(Record::decode::<Template>)
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .map(|t| t.version)
                .max()
                .unwrap_or(0);
            if current != base_version {
                return Err(DocforgeError::ConcurrentVersionConflict {
                    template_id: template_id.to_string(),
                    expected: base_version,
                    found: current,
                });
            }
            tx.write(Collection::Templates, record.clone())?;
            Ok(())
        })?;

        info!(template_id, store = %self.store.id(), version = template.version, "template version created");
        Ok(template)
    }

    /// Marks one version inactive. The version stays stored for audit.
    ///
    /// Read and write share one transaction, so a replicated copy of the
    /// same version landing concurrently is either deactivated here or
    /// keeps this deactivation itself.
    pub fn deactivate(&self, template_id: &str, version: u32) -> Result<Template> {
        let mut deactivated = None;
        self.store.scoped_transaction(&mut |tx| {
            let mut template: Template = tx
                .read(
                    Collection::Templates,
                    &Filter::all().eq("id", template_id).eq("version", version),
                )?
                .first()
                .ok_or_else(|| DocforgeError::TemplateNotFound(version_record_id(template_id, version)))?
                .decode()?;
            if template.active {
                template.active = false;
                tx.write(Collection::Templates, template.to_record()?)?;
            }
            deactivated = Some(template);
            Ok(())
        })?;

        let template = deactivated.ok_or_else(|| DocforgeError::Storage {
            store: self.store.id().to_string(),
            reason: "deactivation produced no template".to_string(),
        })?;
        debug!(template_id, version, "template version deactivated");
        Ok(template)
    }

    /// Stores a version exactly as given (replication and seeding path).
    pub fn put_version(&self, template: &Template) -> Result<()> {
        check_declarations(&template.body, &template.declared_placeholders)?;
        self.store.write(Collection::Templates, template.to_record()?)?;
        Ok(())
    }

    /// Stores a placeholder definition after checking its default value.
    pub fn put_definition(&self, definition: &PlaceholderDefinition) -> Result<()> {
        definition.validate()?;
        self.store
            .write(Collection::PlaceholderDefinitions, definition.to_record()?)?;
        Ok(())
    }

    pub fn definitions(&self, template_id: &str) -> Result<Vec<PlaceholderDefinition>> {
        load_definitions(self.store.as_ref(), template_id)
    }
}

pub(crate) fn load_definitions(
    store: &dyn DataStore,
    template_id: &str,
) -> Result<Vec<PlaceholderDefinition>> {
    store
        .read(
            Collection::PlaceholderDefinitions,
            &Filter::all().eq("template_id", template_id),
        )?
        .iter()
        .map(Record::decode::<PlaceholderDefinition>)
        .collect()
}
