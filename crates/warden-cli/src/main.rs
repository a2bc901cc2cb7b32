use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_orchestrator::{plan_workflow, ExecutionPlan, WardenConfig, WorkflowStep};

#[derive(Parser)]
#[command(name = "warden", about = "Warden: resilient multi-worker orchestration runtime")]
struct Cli {
    /// Path to config file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,
    /// Validate a workflow file and print its dispatch order without running it
    Plan {
        /// JSON array of workflow steps
        workflow: PathBuf,
        /// Print the plan as JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<WardenConfig> {
    match path {
        Some(path) => {
            let config = WardenConfig::load(path)?;
            info!(path = %path.display(), "Loaded configuration");
            Ok(config)
        }
        None => Ok(WardenConfig::default()),
    }
}

async fn load_workflow(path: &Path) -> anyhow::Result<Vec<WorkflowStep>> {
    let source = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read workflow file '{}': {e}", path.display())
    })?;
    let steps: Vec<WorkflowStep> = serde_json::from_str(&source)?;
    Ok(steps)
}

/// Human-readable dispatch order, one step per line.
fn render_plan(steps: &[WorkflowStep], plan: &ExecutionPlan) -> String {
    let mut out = String::new();
    for (position, id) in plan.order.iter().enumerate() {
        let Some(step) = steps.iter().find(|s| &s.id == id) else {
            continue;
        };
        let _ = write!(
            out,
            "{:>3}. {id}  {}.{}  priority={}",
            position + 1,
            step.worker,
            step.action,
            step.priority
        );
        if !step.depends_on.is_empty() {
            let _ = write!(out, "  after={}", step.depends_on.join(","));
        }
        if let Some(task) = &step.task {
            let _ = write!(out, "  task={task}");
        }
        out.push('\n');
    }
    if plan.has_cycle() {
        let _ = writeln!(
            out,
            "warning: dependency cycle among [{}], ordered by name",
            plan.cycle_fallback.join(", ")
        );
    }
    out
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
        Commands::Plan { workflow, json } => {
            let steps = load_workflow(&workflow).await?;
            let plan = plan_workflow(&steps)?;
            if plan.has_cycle() {
                warn!(steps = ?plan.cycle_fallback, "Workflow contains a dependency cycle");
            }
            info!(steps = steps.len(), "Workflow plan computed");
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{}", render_plan(&steps, &plan));
            }
        }
    }

    Ok(())
}
