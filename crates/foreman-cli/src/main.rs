//! Foreman CLI
//!
//! The `foreman` command runs tasks against a plan of worker contracts,
//! worker commands and compositions.
//!
//! ## Commands
//!
//! - `validate`: Check a plan and list the skills it serves
//! - `run`: Execute one task envelope and print the result envelope
//! - `classify`: Show the risk level an action would be assigned
//! - `audit`: Print a saved approval audit log and verify its digests

mod command_worker;
mod plan;
mod prompt_approver;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use foreman_core::{
    read_audit_log, write_audit_log, Approver, AttemptStore, AuditLog, ChannelApprover,
    FsAttemptStore, ResultEnvelope, StaticApprover, TaskEnvelope,
};

use plan::{Plan, Wiring};

#[derive(Parser)]
#[command(name = "foreman")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Delegate tasks to worker programs through validated compositions", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "FOREMAN_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a plan and list the skills it serves
    Validate {
        /// Plan file (JSON)
        #[arg(short, long, env = "FOREMAN_PLAN")]
        plan: PathBuf,
    },

    /// Run one task envelope
    Run {
        /// Plan file (JSON)
        #[arg(short, long, env = "FOREMAN_PLAN")]
        plan: PathBuf,

        /// Task envelope file (JSON)
        #[arg(short, long)]
        task: PathBuf,

        /// Result envelope of an earlier attempt to resume from
        #[arg(long)]
        previous: Option<PathBuf>,

        /// Directory for saved attempts; enables automatic resumption
        #[arg(long, env = "FOREMAN_STATE_DIR")]
        state_dir: Option<PathBuf>,

        /// Override the plan's per-worker timeout
        #[arg(long, env = "FOREMAN_WORKER_TIMEOUT_SECS")]
        worker_timeout_secs: Option<u64>,

        /// Override the plan's approval timeout
        #[arg(long, env = "FOREMAN_APPROVAL_TIMEOUT_SECS")]
        approval_timeout_secs: Option<u64>,

        /// Approve every gated action without prompting
        #[arg(long)]
        auto_approve: bool,

        /// Name recorded as approver for interactive decisions
        #[arg(long, env = "USER", default_value = "operator")]
        approver: String,

        /// Append approval decisions to this audit log file
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Write the result envelope here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Classify an action against the plan's risk policy
    Classify {
        /// Plan file (JSON); the standard policy is used without one
        #[arg(short, long, env = "FOREMAN_PLAN")]
        plan: Option<PathBuf>,

        /// Action descriptor, e.g. "drop table users"
        action: String,

        /// Resources the action touches
        #[arg(short, long = "resource")]
        resources: Vec<String>,
    },

    /// Print a saved audit log and verify its digests
    Audit {
        /// Audit log file (JSON)
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    foreman_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Validate { plan } => cmd_validate(&plan),
        Commands::Run {
            plan,
            task,
            previous,
            state_dir,
            worker_timeout_secs,
            approval_timeout_secs,
            auto_approve,
            approver,
            audit_log,
            output,
        } => {
            let overrides = Overrides {
                worker_timeout_secs,
                approval_timeout_secs,
            };
            let approval = if auto_approve {
                ApprovalMode::Auto
            } else {
                ApprovalMode::Interactive(approver)
            };
            let envelope = cmd_run(
                &plan,
                &task,
                previous.as_deref(),
                state_dir.as_deref(),
                overrides,
                approval,
                audit_log.as_deref(),
            )
            .await?;
            emit_envelope(&envelope, output.as_deref())?;
            if envelope.is_success() {
                Ok(())
            } else {
                anyhow::bail!(
                    "task did not succeed ({}): {}",
                    envelope.completion_promise,
                    envelope.reason.as_deref().unwrap_or("no reason given")
                )
            }
        }
        Commands::Classify {
            plan,
            action,
            resources,
        } => cmd_classify(plan.as_deref(), &action, &resources),
        Commands::Audit { path } => cmd_audit(&path),
    }
}

struct Overrides {
    worker_timeout_secs: Option<u64>,
    approval_timeout_secs: Option<u64>,
}

enum ApprovalMode {
    Auto,
    Interactive(String),
}

fn load_plan(path: &Path, overrides: &Overrides) -> Result<Plan> {
    let mut plan = Plan::load(path)?;
    if let Some(secs) = overrides.worker_timeout_secs {
        plan.config.worker_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = overrides.approval_timeout_secs {
        plan.config.approval_timeout = Duration::from_secs(secs);
    }
    Ok(plan)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn cmd_validate(path: &Path) -> Result<()> {
    let plan = Plan::load(path)?;
    let workers = plan.workers.len();
    let foreman = plan.into_foreman(Wiring {
        approver: Arc::new(StaticApprover::rejecting("validate", "validation only")),
        attempts: None,
        audit: AuditLog::new(),
    })?;

    println!("Plan OK: {}", path.display());
    println!("Workers: {workers}");
    println!("Skills:");
    for skill in foreman.skills() {
        let kind = foreman
            .composition(&skill)
            .map(|c| c.kind())
            .unwrap_or("unknown");
        println!("  {skill} ({kind})");
    }
    Ok(())
}

async fn cmd_run(
    plan_path: &Path,
    task_path: &Path,
    previous: Option<&Path>,
    state_dir: Option<&Path>,
    overrides: Overrides,
    approval: ApprovalMode,
    audit_path: Option<&Path>,
) -> Result<ResultEnvelope> {
    let plan = load_plan(plan_path, &overrides)?;
    let mut task: TaskEnvelope = read_json(task_path)?;
    if let Some(path) = previous {
        let attempt: ResultEnvelope = read_json(path)?;
        task = task.with_previous_attempt(attempt);
    }

    let attempts = match state_dir {
        Some(dir) => {
            let store = FsAttemptStore::new(dir)
                .with_context(|| format!("failed to open state directory {}", dir.display()))?;
            Some(Arc::new(store) as Arc<dyn AttemptStore>)
        }
        None => None,
    };

    let (approver, prompter): (Arc<dyn Approver>, _) = match approval {
        ApprovalMode::Auto => (
            Arc::new(StaticApprover::approving("auto-approve")) as Arc<dyn Approver>,
            None,
        ),
        ApprovalMode::Interactive(name) => {
            let (approver, pending) = ChannelApprover::new(1);
            let prompter = tokio::spawn(async move {
                let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                prompt_approver::serve(pending, stdin, tokio::io::stderr(), &name).await
            });
            (Arc::new(approver) as Arc<dyn Approver>, Some(prompter))
        }
    };

    let audit = AuditLog::new();
    let foreman = plan.into_foreman(Wiring {
        approver,
        attempts,
        audit: audit.clone(),
    })?;

    info!(task_id = %task.task_id, skill_id = %task.skill_id, "running task");
    let envelope = foreman.run(&task).await;

    // The prompt task may still be waiting on stdin.
    drop(foreman);
    if let Some(prompter) = prompter {
        prompter.abort();
    }

    if let Some(path) = audit_path {
        let mut records = if path.exists() {
            read_audit_log(path)?
        } else {
            Vec::new()
        };
        records.extend(audit.records());
        write_audit_log(&records, path)
            .with_context(|| format!("failed to write audit log {}", path.display()))?;
    }

    Ok(envelope)
}

fn emit_envelope(envelope: &ResultEnvelope, output: Option<&Path>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(envelope)?;
    match output {
        Some(path) => std::fs::write(path, rendered + "\n")
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{rendered}"),
    }
    Ok(())
}

fn cmd_classify(plan: Option<&Path>, action: &str, resources: &[String]) -> Result<()> {
    let policy = match plan {
        Some(path) => Plan::load(path)?.risk_policy(),
        None => foreman_core::RiskPolicy::standard(),
    };
    let assessment = policy.classify(action, resources);
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    Ok(())
}

fn cmd_audit(path: &Path) -> Result<()> {
    let records = read_audit_log(path)
        .with_context(|| format!("failed to read audit log {}", path.display()))?;
    let mut tampered = 0;
    for record in &records {
        let ok = record.verify_integrity();
        if !ok {
            tampered += 1;
        }
        println!(
            "{} {} [{}] {} -> {} by {}{}",
            if ok { "✓" } else { "✗" },
            record.recorded_at.to_rfc3339(),
            record.request.risk_level,
            record.request.action,
            record.decision.outcome,
            record.decision.approver,
            record
                .decision
                .reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default(),
        );
    }
    println!("\n{} record(s), {} failed verification", records.len(), tampered);
    if tampered > 0 {
        anyhow::bail!("audit log {} failed integrity checks", path.display());
    }
    Ok(())
}
