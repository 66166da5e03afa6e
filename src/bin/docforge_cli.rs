//! DocForge CLI - JSON bridge to the generation engine
//!
//! Outputs JSON to stdout, logs to stderr.
//! Exit codes: 0 ok, 1 usage or store error, 2 generation or compliance failure
//! (including a suite run with failed templates).

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use docforge_core::{
    config::DEFAULT_CONFIG_FILE,
    datapoints::publish,
    sync::sync_log,
    Datapoint, DocforgeError, EngineConfig, GenerationPipeline, GenerationRequest, OutputFormat,
    PlaceholderDefinition, RuleSet,
};

#[derive(Parser)]
#[command(name = "docforge-cli")]
#[command(about = "DocForge CLI - Template-Driven Document Generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the engine configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Debug logging (overridden by DOCFORGE_LOG)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List active templates in a store
    Templates {
        #[arg(short, long)]
        store: Option<String>,
    },

    /// Author version 1 of a template
    CreateTemplate {
        #[arg(short, long)]
        store: Option<String>,
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        category: String,
        /// File holding the template body
        #[arg(long)]
        body_file: PathBuf,
        /// Declared placeholder (repeatable)
        #[arg(short, long = "placeholder")]
        placeholders: Vec<String>,
    },

    /// Author the next version of a template
    CreateVersion {
        #[arg(short, long)]
        store: Option<String>,
        #[arg(long)]
        id: String,
        #[arg(long)]
        body_file: PathBuf,
        #[arg(short, long = "placeholder")]
        placeholders: Vec<String>,
        /// Expected current version; fails on a concurrent write
        #[arg(long)]
        base: Option<u32>,
    },

    /// Deactivate one template version
    Deactivate {
        #[arg(short, long)]
        store: Option<String>,
        #[arg(long)]
        id: String,
        #[arg(long)]
        version: u32,
    },

    /// Store a placeholder definition
    DefinePlaceholder {
        #[arg(short, long)]
        store: Option<String>,
        /// JSON payload (PlaceholderDefinition)
        #[arg(short, long)]
        payload: String,
    },

    /// Write a datapoint into a store
    PublishDatapoint {
        #[arg(short, long)]
        store: Option<String>,
        #[arg(long)]
        key: String,
        /// JSON scalar; anything that is not JSON is stored as text
        #[arg(long)]
        value: String,
        #[arg(long, default_value_t = 1.0)]
        confidence: f64,
    },

    /// Generate a document
    Generate {
        #[arg(short, long)]
        template: String,
        /// Target store (repeatable, priority order; defaults to all configured)
        #[arg(short, long = "store")]
        stores: Vec<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Markdown)]
        format: OutputFormat,
        #[arg(long)]
        rule_set: Option<String>,
        /// Synchronize the template to the other target stores afterwards
        #[arg(long)]
        sync_peers: bool,
        /// Render and score without persisting
        #[arg(long)]
        dry_run: bool,
    },

    /// Generate every active template of the home store
    Suite {
        /// Target store (repeatable, priority order; defaults to all configured)
        #[arg(short, long = "store")]
        stores: Vec<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Markdown)]
        format: OutputFormat,
        #[arg(long)]
        rule_set: Option<String>,
    },

    /// Summarize templates, generated documents and datapoint sources
    Analytics {
        /// Store to report on first, then stores whose datapoints are counted
        #[arg(short, long = "store")]
        stores: Vec<String>,
        /// Print a markdown report instead of JSON
        #[arg(long)]
        markdown: bool,
    },

    /// Score a text file against a rule set
    Score {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        rule_set: Option<String>,
        /// Extra rule set in JSON form
        #[arg(long)]
        rules_file: Option<PathBuf>,
    },

    /// Synchronize a template from one store to another
    Sync {
        #[arg(short, long)]
        template: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },

    /// Show recorded synchronization events
    SyncLog {
        #[arg(short, long)]
        store: Option<String>,
        #[arg(short, long)]
        template: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("DOCFORGE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Authoring and resolution failures are the caller's content problem.
fn exit_code_for(err: &DocforgeError) -> ExitCode {
    match err {
        DocforgeError::MissingDatapoint(_)
        | DocforgeError::PlaceholderType { .. }
        | DocforgeError::MalformedTemplate { .. }
        | DocforgeError::PlaceholderDeclarationMismatch { .. } => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

enum Output {
    Json(Value),
    Text(String),
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Output::Json(value)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok((Output::Json(output), code)) => {
            print_json(&output);
            code
        }
        Ok((Output::Text(text), code)) => {
            print!("{text}");
            code
        }
        Err(e) => {
            print_json(&json!({ "success": false, "error": e.to_string() }));
            exit_code_for(&e)
        }
    }
}

fn run(cli: Cli) -> docforge_core::Result<(Output, ExitCode)> {
    let config = EngineConfig::load_or_default(&cli.config)?;
    let mut pipeline = GenerationPipeline::from_config(&config)?;

    let store_or_default = |store: Option<String>| -> docforge_core::Result<String> {
        store
            .or_else(|| config.stores.first().map(|s| s.id.clone()))
            .ok_or_else(|| DocforgeError::Config("no stores configured".to_string()))
    };

    match cli.command {
        Commands::Templates { store } => {
            let repo = pipeline.repository(&store_or_default(store)?)?;
            let templates: Vec<_> = repo
                .catalog()?
                .iter()
                .map(|t| json!({
                    "id": t.id,
                    "name": t.name,
                    "category": t.category,
                    "version": t.version,
                    "placeholders": t.declared_placeholders,
                    "originating_store": t.originating_store,
                }))
                .collect();
            Ok((json!(templates).into(), ExitCode::SUCCESS))
        }

        Commands::CreateTemplate { store, id, name, category, body_file, placeholders } => {
            let repo = pipeline.repository(&store_or_default(store)?)?;
            let body = read_file(&body_file)?;
            let template = repo.create_template(&id, &name, &category, &body, placeholders.into_iter().collect())?;
            Ok((json!({ "success": true, "template": template }).into(), ExitCode::SUCCESS))
        }

        Commands::CreateVersion { store, id, body_file, placeholders, base } => {
            let repo = pipeline.repository(&store_or_default(store)?)?;
            let body = read_file(&body_file)?;
            let declared = placeholders.into_iter().collect();
            let template = match base {
                Some(base) => repo.create_version_from(base, &id, &body, declared)?,
                None => repo.create_version(&id, &body, declared)?,
            };
            Ok((json!({ "success": true, "template": template }).into(), ExitCode::SUCCESS))
        }

        Commands::Deactivate { store, id, version } => {
            let repo = pipeline.repository(&store_or_default(store)?)?;
            let template = repo.deactivate(&id, version)?;
            Ok((json!({ "success": true, "template": template }).into(), ExitCode::SUCCESS))
        }

        Commands::DefinePlaceholder { store, payload } => {
            let definition: PlaceholderDefinition = serde_json::from_str(&payload)?;
            let repo = pipeline.repository(&store_or_default(store)?)?;
            repo.put_definition(&definition)?;
            Ok((json!({ "success": true, "definition": definition }).into(), ExitCode::SUCCESS))
        }

        Commands::PublishDatapoint { store, key, value, confidence } => {
            let store = pipeline.stores().get(&store_or_default(store)?)?;
            let value = match serde_json::from_str::<Value>(&value) {
                Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::String(_))) => v,
                _ => Value::String(value),
            };
            let id = publish(store.as_ref(), &Datapoint::new(key, value, confidence))?;
            Ok((json!({ "success": true, "id": id }).into(), ExitCode::SUCCESS))
        }

        Commands::Generate { template, stores, format, rule_set, sync_peers, dry_run } => {
            let request = GenerationRequest {
                template_id: template,
                target_stores: if stores.is_empty() { pipeline.stores().ids() } else { stores },
                output_format: format,
                rule_set,
                sync_peers,
            };
            if dry_run {
                let document = pipeline.preview(&request)?;
                return Ok((json!({ "success": true, "document": document }).into(), ExitCode::SUCCESS));
            }
            // The document is stored even when a peer sync failed.
            let outcome = pipeline.generate(&request)?;
            Ok((
                json!({
                    "success": true,
                    "document": outcome.document,
                    "sync": outcome.sync,
                    "sync_failures": outcome.sync_failures,
                })
                .into(),
                ExitCode::SUCCESS,
            ))
        }

        Commands::Suite { stores, format, rule_set } => {
            let stores = if stores.is_empty() { pipeline.stores().ids() } else { stores };
            let report = pipeline.generate_suite(&stores, format, rule_set.as_deref())?;
            let code = if report.is_complete() { ExitCode::SUCCESS } else { ExitCode::from(2) };
            Ok((json!(report).into(), code))
        }

        Commands::Analytics { stores, markdown } => {
            let stores = if stores.is_empty() { pipeline.stores().ids() } else { stores };
            let report = pipeline.analytics(&stores)?;
            let output = if markdown { Output::Text(report.to_markdown()) } else { json!(report).into() };
            Ok((output, ExitCode::SUCCESS))
        }

        Commands::Score { file, rule_set, rules_file } => {
            let text = read_file(&file)?;
            let mut selected = rule_set;
            if let Some(path) = rules_file {
                let extra = RuleSet::load_json(&path)?;
                selected.get_or_insert_with(|| extra.name.clone());
                pipeline.add_rule_set(extra)?;
            }
            let set = match &selected {
                Some(name) => pipeline.rules().get(name)?,
                None => pipeline.rules().get(&config.default_rule_set)?,
            };
            let report = pipeline.score(&text, set)?;
            let code = if report.is_compliant() { ExitCode::SUCCESS } else { ExitCode::from(2) };
            Ok((json!(report).into(), code))
        }

        Commands::Sync { template, from, to } => {
            let outcome = pipeline.synchronize(&template, &from, &to)?;
            Ok((
                json!({
                    "success": true,
                    "newly_recorded": outcome.newly_recorded,
                    "record": outcome.record,
                })
                .into(),
                ExitCode::SUCCESS,
            ))
        }

        Commands::SyncLog { store, template, limit } => {
            let store = pipeline.stores().get(&store_or_default(store)?)?;
            let records = sync_log(store.as_ref(), template.as_deref(), limit)?;
            Ok((json!(records).into(), ExitCode::SUCCESS))
        }
    }
}

fn read_file(path: &PathBuf) -> docforge_core::Result<String> {
    fs::read_to_string(path)
        .map_err(|e| DocforgeError::Config(format!("Failed to read {}: {}", path.display(), e)))
}
