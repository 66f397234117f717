//! `workflow-enginectl`: thin CLI front-end over the engine library for
//! local testing — register a version, trigger a run, inspect or resume it.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use workflow_engine::config::EngineConfig;
use workflow_engine::handlers::default_registry;
use workflow_engine::model::{OrgId, RunId, TriggerType, VersionStatus, WorkflowId, WorkflowVersion};
use workflow_engine::orchestrator::{ActionSubmission, Orchestrator, TriggerRequest};
use workflow_engine::sandbox::Sandbox;
use workflow_engine::{EventBroadcaster, Interpreter, StateStore};

#[derive(Parser)]
#[command(name = "workflow-enginectl")]
#[command(about = "Local control surface for the workflow execution engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State store path
    #[arg(long, default_value = "./workflow_db")]
    state_store: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a workflow version from a JSON file (a serialized `WorkflowVersion`)
    RegisterVersion {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Trigger a run of a published version
    Trigger {
        workflow_id: String,
        version: u32,
        org_id: String,
        /// JSON event payload, defaults to `{}`
        #[arg(short, long)]
        event: Option<String>,
    },

    /// Print the current status of a run
    Status { run_id: String },

    /// Submit an action to a paused run
    Resume {
        run_id: String,
        action_type: String,
        /// JSON payload merged into run state
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// Cooperatively cancel a running run
    Cancel { run_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let store = Arc::new(StateStore::new(&cli.state_store).map_err(|e| format!("failed to open state store: {e}"))?);

    let http = reqwest::Client::new();
    let config = EngineConfig::default();
    let sandbox = Arc::new(Sandbox::new(http.clone()));
    let registry = default_registry(sandbox, http);
    let interpreter = Arc::new(Interpreter::new(registry, config.interpreter));
    let broadcaster = EventBroadcaster::new(config.broadcaster.subscriber_buffer);
    let orchestrator = Orchestrator::new(store.clone(), interpreter, broadcaster);

    match cli.command {
        Commands::RegisterVersion { file } => {
            let contents = std::fs::read_to_string(&file).map_err(|e| format!("failed to read file: {e}"))?;
            let version: WorkflowVersion = serde_json::from_str(&contents).map_err(|e| format!("invalid version JSON: {e}"))?;
            if version.status != VersionStatus::Published {
                println!("warning: registering a version with status {:?}", version.status);
            }
            store.save_version(&version).map_err(|e| format!("failed to save version: {e}"))?;
            println!("registered {}@{}", version.workflow_id, version.version);
        }

        Commands::Trigger { workflow_id, version, org_id, event } => {
            let workflow_id = WorkflowId::parse_str(&workflow_id).map_err(|e| format!("invalid workflow id: {e}"))?;
            let org_id = OrgId::parse_str(&org_id).map_err(|e| format!("invalid org id: {e}"))?;
            let event_data = match event {
                Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("invalid event JSON: {e}"))?,
                None => serde_json::Map::new(),
            };
            let run_id = orchestrator
                .trigger(TriggerRequest {
                    workflow_id,
                    version,
                    trigger_type: TriggerType::Api,
                    event_data,
                    org_id,
                    run_id: None,
                    device_id: None,
                })
                .await
                .map_err(|e| format!("failed to trigger run: {e}"))?;
            println!("triggered run {run_id}");
        }

        Commands::Status { run_id } => {
            let run_id = RunId::parse_str(&run_id).map_err(|e| format!("invalid run id: {e}"))?;
            let run = store.load_run(run_id).map_err(|e| format!("failed to load run: {e}"))?;
            match run {
                Some(run) => println!("{}", serde_json::to_string_pretty(&run)?),
                None => println!("no such run"),
            }
        }

        Commands::Resume { run_id, action_type, payload } => {
            let run_id = RunId::parse_str(&run_id).map_err(|e| format!("invalid run id: {e}"))?;
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("invalid payload JSON: {e}"))?,
                None => serde_json::Value::Object(serde_json::Map::new()),
            };
            orchestrator.resume(run_id, ActionSubmission { action_type, payload }).await.map_err(|e| format!("failed to resume run: {e}"))?;
            println!("resumed run {run_id}");
        }

        Commands::Cancel { run_id } => {
            let run_id = RunId::parse_str(&run_id).map_err(|e| format!("invalid run id: {e}"))?;
            orchestrator.cancel(run_id);
            println!("cancellation requested for run {run_id}");
        }
    }

    Ok(())
}
