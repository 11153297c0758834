use anyhow::{anyhow, Context as _, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use flowcore::{
    Config, DeleteFilter, ExecutionFilter, ExecutionId, ExecutionMode, ExecutionStatus, NodeSpec,
    PushBus, PushMessage, RunResult, SubmitRequest, Value, Workflow,
};
use flowruntime::{
    open_store, ExecutionRuntime, ExecutionStore, NodeRegistry, ResumeScheduler, StopOutcome,
    WorkflowExecutor,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults plus FLOW_* variables otherwise)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file and wait for it
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Only run the steps needed for this step
        #[arg(long)]
        destination: Option<String>,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List stored executions, newest first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Only executions with this status
        #[arg(long)]
        status: Option<ExecutionStatus>,

        /// Only executions of this workflow
        #[arg(long)]
        workflow: Option<String>,
    },

    /// Delete finished executions
    Prune {
        /// Delete executions that stopped more than this many days ago
        #[arg(long, conflicts_with = "id")]
        older_than_days: Option<i64>,

        /// Delete these executions
        #[arg(long)]
        id: Vec<ExecutionId>,
    },

    /// Retry a failed execution and wait for the attempt
    Retry {
        id: ExecutionId,
    },

    /// Stop a waiting execution
    Stop {
        id: ExecutionId,
    },

    /// Resume waiting executions as they fall due
    Worker,

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

/// Everything the commands that touch executions need.
struct Env {
    config: Config,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn ExecutionStore>,
    push: PushBus,
    runtime: ExecutionRuntime,
}

impl Env {
    async fn open(config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::from_env()?,
        };
        let store = open_store(&config).await?;
        tracing::debug!("opened {:?} execution store", config.database.kind);
        let registry = Arc::new(registry());
        let push = PushBus::new(config.push.subscriber_capacity, config.push.overflow);
        let engine = WorkflowExecutor::new(registry.clone(), config.engine.max_parallel_nodes);
        let runtime = ExecutionRuntime::new(&config, store.clone(), Arc::new(engine), push.clone());
        Ok(Self {
            config,
            registry,
            store,
            push,
            runtime,
        })
    }
}

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);
    registry
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    Ok(serde_json::from_str(&workflow_json)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            file,
            input,
            destination,
        } => run_workflow(config, &file, input, destination).await,
        Commands::Validate { file } => validate_workflow(&file),
        Commands::List {
            limit,
            status,
            workflow,
        } => list_executions(config, limit, status, workflow).await,
        Commands::Prune {
            older_than_days,
            id,
        } => prune(config, older_than_days, id).await,
        Commands::Retry { id } => retry(config, id).await,
        Commands::Stop { id } => stop(config, id).await,
        Commands::Worker => worker(config).await,
        Commands::Nodes => {
            list_nodes();
            Ok(())
        }
        Commands::Init { output } => create_example_workflow(&output),
    }
}

/// Prints step progress until the execution reports back.
fn print_progress(push: &PushBus) -> tokio::task::JoinHandle<()> {
    let mut events = push.subscribe();
    tokio::spawn(async move {
        while let Some(message) = events.recv().await {
            match message {
                PushMessage::ExecutionStarted(m) => {
                    println!("▶️  Execution {} started", m.execution_id);
                }
                PushMessage::NodeExecuteBefore(m) => {
                    println!("  ⚡ Starting node: {}", m.node_name);
                }
                PushMessage::NodeExecuteAfter(m) => match &m.data.error {
                    None => println!(
                        "  ✅ Node {} completed in {}ms",
                        m.node_name, m.data.execution_time_ms
                    ),
                    Some(error) => println!("  ❌ Node {} failed: {}", m.node_name, error.message),
                },
                PushMessage::SendConsoleMessage(m) => {
                    println!("     ℹ️  [{}] {}", m.source, m.message);
                }
                PushMessage::ExecutionFinished(_) => break,
                _ => {}
            }
        }
    })
}

fn print_result(result: &RunResult) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!("   Status: {}", result.status);
    if let Some(retry_of) = result.retry_of {
        println!("   Retry of: {}", retry_of);
    }
    if let Some(wait_till) = result.wait_till {
        println!("   Waiting until {} (run `flow worker` to resume)", wait_till);
    }
    if let Some(error) = result.error() {
        match &error.node {
            Some(node) => println!("   Error in {}: {}", node, error.message),
            None => println!("   Error: {}", error.message),
        }
    }

    let run_data = &result.data.result_data.run_data;
    let mut steps: Vec<_> = run_data.keys().collect();
    steps.sort();
    if steps.iter().any(|step| result.data.completed_outputs(step).is_some()) {
        println!();
        println!("📤 Outputs:");
    }
    for step in steps {
        let Some(outputs) = result.data.completed_outputs(step) else {
            continue;
        };
        if outputs.is_empty() {
            continue;
        }
        println!("   {}:", step);
        let mut ports: Vec<_> = outputs.iter().collect();
        ports.sort_by(|a, b| a.0.cmp(b.0));
        for (port, value) in ports {
            println!("     {}: {}", port, value.to_plain_json());
        }
    }
}

async fn finish(env: &Env, id: ExecutionId, printer: tokio::task::JoinHandle<()>) -> Result<()> {
    let result = env.runtime.wait_for_completion(id, None).await?;
    // The finished event trails the waiters slightly.
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    print_result(&result);
    if result.status == ExecutionStatus::Error {
        return Err(anyhow!("execution {} failed", id));
    }
    Ok(())
}

async fn run_workflow(
    config: Option<&Path>,
    file: &Path,
    input: Option<String>,
    destination: Option<String>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(file)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let inputs: HashMap<String, Value> = match input {
        Some(input_str) => match serde_json::from_str(&input_str)? {
            serde_json::Value::Object(obj) => obj
                .into_iter()
                .map(|(k, v)| (k, Value::from_plain_json(v)))
                .collect(),
            _ => return Err(anyhow!("Input must be a JSON object")),
        },
        None => HashMap::new(),
    };

    let env = Env::open(config).await?;
    env.registry.validate_workflow(&workflow)?;

    let mut request = SubmitRequest::new(ExecutionMode::Cli, Arc::new(workflow), "cli");
    request.destination_node = destination;
    let mut data = request.initial_data();
    data.start_data.inputs = inputs;
    request.execution_data = Some(data);

    let printer = print_progress(&env.push);
    let submitted = env.runtime.submit(request).await?;
    finish(&env, submitted.execution_id, printer).await
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(file)?;
    registry().validate_workflow(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    Ok(())
}

async fn list_executions(
    config: Option<&Path>,
    limit: usize,
    status: Option<ExecutionStatus>,
    workflow: Option<String>,
) -> Result<()> {
    let env = Env::open(config).await?;
    let mut filter = ExecutionFilter {
        limit: Some(limit),
        ..Default::default()
    };
    if let Some(status) = status {
        filter
            .filters
            .insert("status".to_string(), serde_json::json!(status.as_str()));
    }
    if let Some(workflow) = workflow {
        filter
            .filters
            .insert("workflowId".to_string(), serde_json::json!(workflow));
    }

    let page = env.runtime.list(&filter).await?;
    let approx = if page.estimated { "~" } else { "" };
    println!("{}{} executions", approx, page.count);
    for summary in page.results {
        let retry = summary
            .retry_of
            .map(|id| format!(" retry of {}", id))
            .unwrap_or_default();
        println!(
            "  {}  {:<9} {:<10} {}  {}{}",
            summary.id,
            summary.status.as_str(),
            summary.mode.as_str(),
            summary.started_at.format("%Y-%m-%d %H:%M:%S"),
            summary.workflow_name.unwrap_or_default(),
            retry
        );
    }
    Ok(())
}

async fn prune(config: Option<&Path>, older_than_days: Option<i64>, ids: Vec<ExecutionId>) -> Result<()> {
    let filter = match older_than_days {
        Some(days) => DeleteFilter::before(Utc::now() - ChronoDuration::days(days)),
        None if !ids.is_empty() => DeleteFilter::ids(ids),
        None => return Err(anyhow!("pass --older-than-days or at least one --id")),
    };
    let env = Env::open(config).await?;
    let deleted = env.runtime.delete(&filter).await?;
    println!("🧹 Deleted {} executions", deleted);
    Ok(())
}

async fn retry(config: Option<&Path>, id: ExecutionId) -> Result<()> {
    let env = Env::open(config).await?;
    let printer = print_progress(&env.push);
    let submitted = env.runtime.retry(id, "cli").await?;
    println!("🔁 Retrying {} as {}", id, submitted.execution_id);
    finish(&env, submitted.execution_id, printer).await
}

async fn stop(config: Option<&Path>, id: ExecutionId) -> Result<()> {
    let env = Env::open(config).await?;
    match env.runtime.stop(id).await? {
        StopOutcome::Stopped(result) => println!("⏹️  Execution {} {}", id, result.status),
        StopOutcome::AlreadyFinished(result) => {
            println!("Execution {} already finished ({})", id, result.status)
        }
        StopOutcome::Cancelling | StopOutcome::Finishing => {
            println!("Execution {} is being stopped", id)
        }
        StopOutcome::RunningElsewhere => {
            println!("Execution {} is running in another process, stop it there", id)
        }
    }
    Ok(())
}

async fn worker(config: Option<&Path>) -> Result<()> {
    let env = Env::open(config).await?;
    let scheduler = ResumeScheduler::new(
        env.store.clone(),
        Arc::new(env.runtime.clone()),
        &env.config.scheduler,
    );

    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };
    println!(
        "⏰ Resuming waiting executions every {}ms, Ctrl-C to stop",
        env.config.scheduler.poll_interval().as_millis()
    );

    tokio::signal::ctrl_c().await?;
    shutdown.cancel();
    task.await?;

    let running = env.runtime.current();
    if !running.is_empty() {
        println!("Stopping {} running executions", running.len());
        for execution in &running {
            env.runtime.stop(execution.id).await?;
        }
        for execution in running {
            let _ = env
                .runtime
                .wait_for_completion(execution.id, Some(Duration::from_secs(10)))
                .await;
        }
    }
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({}, v{})", node_type, metadata.category, metadata.version);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = Workflow::new("Example JSON Workflow");
    workflow.description = Some("Parses a JSON document, waits briefly and logs it".to_string());

    let parse = workflow.add_node(
        NodeSpec::new("transform.json_parse")
            .with_name("Parse")
            .with_position(100.0, 100.0),
    );
    let delay = workflow.add_node(
        NodeSpec::new("time.delay")
            .with_name("Pause")
            .with_config("delay_ms", 250.0)
            .with_position(300.0, 100.0),
    );
    let render = workflow.add_node(
        NodeSpec::new("transform.json_stringify")
            .with_name("Render")
            .with_config("pretty", true)
            .with_position(500.0, 100.0),
    );
    let log = workflow.add_node(
        NodeSpec::new("debug.log")
            .with_name("Log")
            .with_position(700.0, 100.0),
    );

    workflow.connect(parse, "parsed", delay, "parsed");
    workflow.connect(delay, "parsed", render, "value");
    workflow.connect(render, "json", log, "message");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '{{\"json\": \"{{\\\"hello\\\": \\\"world\\\"}}\"}}'",
        output.display()
    );

    Ok(())
}
