//! # ReachClaw: Outreach Pipeline Scheduler
//!
//! Drives contacts through discovery → request → connection → message → reply,
//! inside fixed daily quotas, with every step persisted so restarts resume.
//!
//! Usage:
//!   reachclaw run                        # Orchestrator loop + operator API
//!   reachclaw serve                      # Operator API only
//!   reachclaw status                     # Metrics snapshot as JSON
//!   reachclaw contacts --state requested # List contacts
//!   reachclaw override <id> connected    # Manual forward override
//!   reachclaw opt-out <id>               # Stop all outreach to a contact
//!   reachclaw release <id>               # Return a quarantined contact to the pipeline
//!   reachclaw posts list                 # Review generated content
//!   reachclaw init-config                # Write a default config file

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use reachclaw_core::config::ReachClawConfig;
use reachclaw_core::lifecycle::ContactState;
use reachclaw_core::types::{ContactFilter, PostStatus};
use reachclaw_providers::{HttpBridge, OllamaGenerator};
use reachclaw_scheduler::persistence::AuditRecord;
use reachclaw_scheduler::{Orchestrator, OutreachDb, OverrideRequest, Pipeline, PipelineMetrics};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "reachclaw",
    version,
    about = "📇 ReachClaw: rate-limited outreach pipeline scheduler"
)]
struct Cli {
    /// Config file (default: ~/.reachclaw/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator loop (and the operator API unless --no-gateway)
    Run {
        #[arg(long)]
        no_gateway: bool,
    },
    /// Serve the operator API without running the pipeline
    Serve,
    /// Print the metrics feed
    Status,
    /// List contacts
    Contacts {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        organization: Option<String>,
        #[arg(long)]
        quarantined: bool,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Force a contact forward to a later state
    Override {
        contact_id: String,
        target: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, default_value = "cli")]
        actor: String,
        /// Do not consume the daily quota for skipped sends
        #[arg(long)]
        bypass_quota: bool,
    },
    /// Mark a contact opted-out and cancel its pending work
    OptOut {
        contact_id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Return a quarantined contact to automated processing
    Release {
        contact_id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Review generated content posts
    Posts {
        #[command(subcommand)]
        action: PostsAction,
    },
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum PostsAction {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Approve {
        id: i64,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    Reject {
        id: i64,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    Edit {
        id: i64,
        text: String,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&str>) -> Result<(ReachClawConfig, PathBuf)> {
    match path {
        Some(p) => {
            let path = expand_path(p);
            let config = ReachClawConfig::load_from(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            Ok((config, path))
        }
        None => Ok((ReachClawConfig::load()?, ReachClawConfig::default_path())),
    }
}

fn open_db(config: &ReachClawConfig) -> Result<Arc<OutreachDb>> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = OutreachDb::open(&db_path, config.pipeline.duplicate_policy)
        .with_context(|| format!("opening {}", db_path.display()))?;
    tracing::debug!("📂 Database: {}", db_path.display());
    Ok(Arc::new(db))
}

/// The pipeline and the concrete collaborators wired into it.
struct Wiring {
    pipeline: Arc<Pipeline>,
    bridge: Arc<HttpBridge>,
    generator: Arc<OllamaGenerator>,
}

fn build_pipeline(config: &ReachClawConfig, db: Arc<OutreachDb>) -> Result<Wiring> {
    let bridge = Arc::new(HttpBridge::new(&config.bridge)?);
    let generator = Arc::new(OllamaGenerator::new(&config.generation)?);
    let pipeline = Arc::new(Pipeline::new(db, config, bridge.clone(), generator.clone()));
    Ok(Wiring {
        pipeline,
        bridge,
        generator,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "reachclaw=debug,reachclaw_scheduler=debug,reachclaw_gateway=debug,tower_http=debug"
    } else {
        "reachclaw=info,reachclaw_scheduler=info,reachclaw_gateway=info,reachclaw_providers=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Command::InitConfig { force } = cli.command {
        let path = cli
            .config
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(ReachClawConfig::default_path);
        return init_config(&path, force);
    }

    let (config, config_path) = load_config(cli.config.as_deref())?;
    tracing::debug!("⚙️ Config: {}", config_path.display());
    let db = open_db(&config)?;

    match cli.command {
        Command::Run { no_gateway } => run(config, db, !no_gateway).await,
        Command::Serve => serve(config, db).await,
        Command::Status => {
            let pipeline = build_pipeline(&config, db)?.pipeline;
            let metrics = PipelineMetrics::collect(pipeline.db(), pipeline.quota(), Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(())
        }
        Command::Contacts {
            state,
            organization,
            quarantined,
            limit,
        } => {
            let state = state
                .as_deref()
                .map(|s| ContactState::parse(s).with_context(|| format!("unknown state '{s}'")))
                .transpose()?;
            let filter = ContactFilter {
                state,
                organization,
                quarantined: quarantined.then_some(true),
                limit: Some(limit),
                ..Default::default()
            };
            let contacts = db.list(&filter)?;
            for c in &contacts {
                println!(
                    "{:<24} {:<12} {:<28} {:.2}{}",
                    c.id,
                    c.state.as_str(),
                    c.organization,
                    c.ai_relevance_score,
                    if c.quarantined { "  [quarantined]" } else { "" }
                );
            }
            println!("{} contact(s)", contacts.len());
            Ok(())
        }
        Command::Override {
            contact_id,
            target,
            reason,
            actor,
            bypass_quota,
        } => {
            let target = ContactState::parse(&target).with_context(|| format!("unknown state '{target}'"))?;
            let pipeline = build_pipeline(&config, db)?.pipeline;
            let request = OverrideRequest {
                target,
                actor,
                reason,
                bypass_quota,
            };
            let contact = pipeline.override_state(&contact_id, &request, Utc::now())?;
            println!("✅ {} is now {}", contact.id, contact.state);
            Ok(())
        }
        Command::OptOut {
            contact_id,
            reason,
            actor,
        } => {
            let pipeline = build_pipeline(&config, db)?.pipeline;
            let contact = pipeline.opt_out(&contact_id, &actor, reason, Utc::now())?;
            println!("🚫 {} is {}", contact.id, contact.state);
            Ok(())
        }
        Command::Release { contact_id, actor } => {
            let pipeline = build_pipeline(&config, db)?.pipeline;
            let contact = pipeline.release_quarantine(&contact_id, &actor, Utc::now())?;
            println!("🔓 {} released ({})", contact.id, contact.state);
            Ok(())
        }
        Command::Posts { action } => posts(&db, action),
        Command::InitConfig { .. } => Ok(()),
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("⚠️  {} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }
    ReachClawConfig::default().save_to(path)?;
    println!("✅ Wrote default config to {}", path.display());
    Ok(())
}

fn posts(db: &OutreachDb, action: PostsAction) -> Result<()> {
    let now = Utc::now();
    match action {
        PostsAction::List { status } => {
            let status = status
                .as_deref()
                .map(|s| PostStatus::parse(s).with_context(|| format!("unknown post status '{s}'")))
                .transpose()?;
            for post in db.list_posts(status)? {
                println!(
                    "#{:<5} {:<17} publish {}",
                    post.id,
                    post.status.as_str(),
                    post.scheduled_publish_at.format("%Y-%m-%d %H:%M UTC")
                );
                println!("       {}", post.text.replace('\n', "\n       "));
            }
        }
        PostsAction::Approve { id, actor } => {
            let to = PostStatus::Approved;
            let audit = post_audit(id, &actor, to);
            let post = db.review_post(id, &[PostStatus::PendingApproval], to, &audit, now)?;
            println!("✅ Post #{id} approved (publishes after {})", post.scheduled_publish_at);
        }
        PostsAction::Reject { id, actor } => {
            let to = PostStatus::Rejected;
            db.review_post(
                id,
                &[PostStatus::PendingApproval, PostStatus::Approved],
                to,
                &post_audit(id, &actor, to),
                now,
            )?;
            println!("🗑️ Post #{id} rejected");
        }
        PostsAction::Edit { id, text } => {
            db.update_post_text(id, &text)?;
            println!("✏️ Post #{id} updated");
        }
    }
    Ok(())
}

fn post_audit(id: i64, actor: &str, to: PostStatus) -> AuditRecord {
    AuditRecord {
        actor: actor.to_string(),
        action: format!("post_{to}"),
        detail: Some(format!("post {id}")),
    }
}

/// Orchestrator loop plus (optionally) the operator API, until Ctrl-C.
async fn run(config: ReachClawConfig, db: Arc<OutreachDb>, with_gateway: bool) -> Result<()> {
    let Wiring {
        pipeline,
        bridge,
        generator,
    } = build_pipeline(&config, db)?;

    if generator.check_health().await {
        tracing::info!("🧠 Ollama ready ({})", config.generation.model);
    } else {
        tracing::warn!(
            "⚠️ Ollama at {} is unreachable or missing model '{}'; content and follow-ups will retry",
            config.generation.base_url,
            config.generation.model
        );
    }

    let orchestrator = Arc::new(Orchestrator::new(pipeline.clone(), bridge, &config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_handle = orchestrator.spawn(shutdown_rx.clone());
    let gateway_handle = with_gateway.then(|| {
        let gateway_config = config.gateway.clone();
        let pipeline = pipeline.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { reachclaw_gateway::start(&gateway_config, pipeline, rx).await })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested, finishing current tick...");
    let _ = shutdown_tx.send(true);

    loop_handle.await?;
    if let Some(handle) = gateway_handle {
        handle.await??;
    }
    Ok(())
}

/// Operator API only, until Ctrl-C.
async fn serve(config: ReachClawConfig, db: Arc<OutreachDb>) -> Result<()> {
    let pipeline = build_pipeline(&config, db)?.pipeline;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn({
        let gateway_config = config.gateway.clone();
        async move { reachclaw_gateway::start(&gateway_config, pipeline, shutdown_rx).await }
    });
    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(true);
    server.await??;
    Ok(())
}
