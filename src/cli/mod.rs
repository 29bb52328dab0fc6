//! CLI Module
//!
//! Command-line interface for wa-gateway-sync using Clap v4.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::services::ServiceContext;
use crate::store::{Instance, Page, PageRequest, StoredMessage};

/// WhatsApp gateway synchronization engine
#[derive(Parser, Debug)]
#[command(name = "wa-gateway-sync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug mode (creates log files in ./logs/)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Output format for command results
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Subcommand to execute (default: serve)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the webhook + operations HTTP server (default)
    Serve,

    /// Write a default configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show effective configuration
    Config {
        /// Show secrets instead of masking them
        #[arg(short, long)]
        show_secrets: bool,
    },

    /// Manage instance records
    Instance {
        #[command(subcommand)]
        operation: InstanceCommands,
    },

    /// Request a pairing session (prints the QR payload)
    Reconnect {
        /// Instance name
        name: String,
    },

    /// Pull the full message history of an instance
    Sync {
        /// Instance name
        name: String,
    },

    /// Check gateway reachability and API key
    Probe,

    /// List conversations of an instance, most recent first
    Conversations {
        /// Instance name
        name: String,

        #[arg(short, long)]
        limit: Option<i64>,

        /// Only conversations active before this unix timestamp
        #[arg(short, long)]
        before: Option<i64>,

        /// Continue after this conversation id within the `--before` second
        #[arg(long, requires = "before")]
        before_id: Option<String>,
    },

    /// Show messages of one conversation, newest first
    Messages {
        /// Instance name
        name: String,

        /// Remote JID of the conversation
        jid: String,

        /// Page size (default: 20, max: 100)
        #[arg(short, long)]
        limit: Option<i64>,

        /// Only messages strictly older than this unix timestamp
        #[arg(short, long)]
        before: Option<i64>,

        /// Continue after this message id within the `--before` second
        #[arg(long, requires = "before")]
        before_id: Option<String>,
    },

    /// Database operations
    Db {
        #[command(subcommand)]
        operation: DbCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum InstanceCommands {
    /// Create an instance record (no-op if it exists)
    Add {
        /// Instance name
        name: String,
    },
    /// Show status, QR and recent log entries
    Show {
        /// Instance name
        name: String,

        /// Ask the gateway for the live state first
        #[arg(short, long)]
        refresh: bool,

        /// Number of log entries to show
        #[arg(short, long, default_value = "20")]
        logs: u32,
    },
    /// List all instances
    List,
}

#[derive(Subcommand, Debug)]
pub enum DbCommands {
    /// Create the database and run migrations
    Init,
    /// Show row counts
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Load configuration from file or defaults
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        tracing::info!("Loading configuration from custom path: {}", path);
        Config::load_from_path(path)
    } else {
        Config::load()
    }
}

/// Main CLI entry point
pub async fn run(cli: Cli, config: Config) -> Result<()> {
    if cli.debug {
        tracing::info!("Debug mode enabled");
    }
    let format = cli.format;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Init { force } => cmd_init(cli.config.as_deref(), force),
        Commands::Config { show_secrets } => cmd_config(&config, show_secrets, format),
        Commands::Serve => {
            config.validate_for_serve()?;
            let ctx = ServiceContext::from_config(config).await?;
            crate::server::serve(Arc::new(ctx)).await
        }
        command => {
            config.validate()?;
            let ctx = ServiceContext::from_config(config).await?;
            run_with_services(&ctx, command, format).await
        }
    }
}

async fn run_with_services(ctx: &ServiceContext, command: Commands, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Instance { operation } => cmd_instance(ctx, operation, format).await,
        Commands::Reconnect { name } => {
            let outcome = ctx.lifecycle.reconnect(&name).await?;
            print_instance(&outcome.instance, format)
        }
        Commands::Sync { name } => {
            let report = ctx.sync.full_sync(&name).await?;
            emit(&report, format, || {
                println!("Full sync of {} completed", name);
                println!("  Conversations: {}", report.conversations);
                println!("  Pages:         {}", report.pages);
                println!("  Fetched:       {}", report.fetched);
                println!("  Inserted:      {}", report.inserted);
                println!("  Updated:       {}", report.updated);
                println!("  Unchanged:     {}", report.unchanged);
                println!("  Stale:         {}", report.stale);
                println!("  Skipped:       {}", report.skipped);
                println!("  Failed:        {}", report.failed);
            })
        }
        Commands::Probe => {
            let report = ctx.gateway.probe().await;
            emit(&report, format, || {
                println!("Gateway: {}", ctx.config.gateway.base_url);
                println!("  Reachable:     {}", report.reachable);
                println!("  Authenticated: {}", report.authenticated);
                if let Some(status) = report.status {
                    println!("  HTTP status:   {}", status);
                }
                println!("  Latency:       {} ms", report.latency_ms);
                println!("  Detail:        {}", report.detail);
            })?;
            if !report.is_healthy() {
                anyhow::bail!("gateway probe failed: {}", report.detail);
            }
            Ok(())
        }
        Commands::Conversations {
            name,
            limit,
            before,
            before_id,
        } => {
            let page = PageRequest::new(limit, before)?.with_before_id(before_id)?;
            ctx.store.require_instance(&name).await?;
            let conversations = ctx.store.list_conversations(&name, page).await?;
            emit(&conversations, format, || {
                for c in &conversations.items {
                    println!(
                        "{:>6}  {:<19}  {}  {}",
                        c.id,
                        c.last_message_at.map(format_ts).unwrap_or_default(),
                        c.remote_jid,
                        c.display_name.as_deref().unwrap_or("")
                    );
                }
                print_more(&conversations);
            })
        }
        Commands::Messages {
            name,
            jid,
            limit,
            before,
            before_id,
        } => {
            let page = PageRequest::new(limit, before)?.with_before_id(before_id)?;
            ctx.store.require_instance(&name).await?;
            let conversation = ctx.store.find_conversation(&name, &jid).await?;
            let messages = ctx.store.list_messages(conversation.id, page).await?;
            emit(&messages, format, || {
                for m in &messages.items {
                    print_message(m);
                }
                print_more(&messages);
            })
        }
        Commands::Db { operation } => match operation {
            DbCommands::Init => {
                // Opening the store already ran migrations
                println!(
                    "Database initialized at: {}",
                    ctx.config.database.path.display()
                );
                Ok(())
            }
            DbCommands::Stats => {
                let stats = ctx.store.stats().await?;
                emit(&stats, format, || {
                    println!("Instances:     {}", stats.instances);
                    println!("Conversations: {}", stats.conversations);
                    println!("Messages:      {}", stats.messages);
                })
            }
        },
        Commands::Serve | Commands::Init { .. } | Commands::Config { .. } => Ok(()),
    }
}

async fn cmd_instance(
    ctx: &ServiceContext,
    operation: InstanceCommands,
    format: OutputFormat,
) -> Result<()> {
    match operation {
        InstanceCommands::Add { name } => {
            let (instance, created) = ctx.store.create_instance(&name).await?;
            if format == OutputFormat::Text {
                if created {
                    println!("Created instance {}", instance.instance_name);
                } else {
                    println!("Instance {} already exists", instance.instance_name);
                }
            }
            print_instance(&instance, format)
        }
        InstanceCommands::Show {
            name,
            refresh,
            logs,
        } => {
            let instance = if refresh {
                ctx.lifecycle.refresh_status(&name).await?
            } else {
                ctx.store.require_instance(&name).await?
            };
            let entries = ctx.store.recent_logs(&name, logs).await?;
            if format == OutputFormat::Json {
                let view = serde_json::json!({ "instance": instance, "logs": entries });
                println!("{}", serde_json::to_string_pretty(&view)?);
                return Ok(());
            }
            print_instance(&instance, format)?;
            if !entries.is_empty() {
                println!("\nRecent log:");
                for entry in &entries {
                    println!(
                        "  {}  {:<22} {}",
                        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.event,
                        entry.detail.as_deref().unwrap_or("")
                    );
                }
            }
            Ok(())
        }
        InstanceCommands::List => {
            let instances = ctx.store.list_instances().await?;
            emit(&instances, format, || {
                if instances.is_empty() {
                    println!("No instances. Add one with: wa-gateway-sync instance add <name>");
                }
                for i in &instances {
                    println!("{:<24} {}", i.instance_name, i.status);
                }
            })
        }
    }
}

fn cmd_init(config_path: Option<&str>, force: bool) -> Result<()> {
    let path = match config_path {
        Some(p) => PathBuf::from(p),
        None => Config::system_config_path().context("Could not determine config directory")?,
    };

    if path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at: {}\nUse --force to overwrite",
            path.display()
        );
    }

    Config::default().save(&path)?;

    println!("Configuration initialized at: {}", path.display());
    println!("\nNext steps:");
    println!("   1. Set gateway.base_url and gateway.api_key (or WA_GATEWAY_URL / WA_GATEWAY_API_KEY)");
    println!("   2. Set server.webhook_secret (or WA_WEBHOOK_SECRET)");
    println!("   3. Run 'wa-gateway-sync serve'");
    Ok(())
}

fn cmd_config(config: &Config, show_secrets: bool, format: OutputFormat) -> Result<()> {
    let shown = if show_secrets {
        config.clone()
    } else {
        config.redacted()
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&shown)?),
        OutputFormat::Text => {
            print!("{}", toml::to_string_pretty(&shown).context("Failed to render config")?);
            if !show_secrets {
                println!("\n# Use --show-secrets to display secrets");
            }
        }
    }
    Ok(())
}

/// Print `value` as JSON, or run the text renderer.
fn emit<T: Serialize>(value: &T, format: OutputFormat, text: impl FnOnce()) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => text(),
    }
    Ok(())
}

fn print_instance(instance: &Instance, format: OutputFormat) -> Result<()> {
    emit(instance, format, || {
        println!("Instance: {}", instance.instance_name);
        println!("Status:   {}", instance.status);
        if let Some(err) = &instance.last_error {
            println!("Error:    {}", err);
        }
        if let Some(qr) = &instance.qr_code {
            println!("QR code:  {}", qr);
        }
        println!(
            "Updated:  {}",
            instance.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    })
}

fn print_message(m: &StoredMessage) {
    let arrow = match m.direction {
        crate::store::Direction::Inbound => "<-",
        crate::store::Direction::Outbound => "->",
    };
    println!(
        "{}  {} {:<12} {}",
        format_ts(m.timestamp),
        arrow,
        m.delivery_status.as_deref().unwrap_or(""),
        m.content.as_deref().unwrap_or("")
    );
}

fn print_more<T>(page: &Page<T>) {
    match (page.next_before, page.next_before_id.as_deref()) {
        (Some(before), Some(id)) => println!("\nMore: --before {} --before-id {}", before, id),
        (Some(before), None) => println!("\nMore: --before {}", before),
        _ => {}
    }
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
