use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use tg_forward::filter::{parse_filter_string, FilterConfig};
use tg_forward::model::ForwardMode;
use tg_forward::watch::SETTING_GLOBAL_FILTERS;
use tg_forward::{config, db};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write an example config file and exit
    InitConfig {
        #[arg(long, default_value = "config.yaml")]
        output: PathBuf,
    },
    /// List forwarding rules
    Rules,
    /// Add a forwarding rule
    Add {
        name: String,
        source: String,
        target: String,
        #[arg(long, default_value = "clone")]
        mode: String,
        /// Sync interval in minutes
        #[arg(long)]
        interval: Option<i64>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Enable a rule
    Enable { name: String },
    /// Disable a rule
    Disable { name: String },
    /// Delete a rule and its sync state
    Remove { name: String },
    /// Show or set a rule's filters. The spec is `;`-separated patterns,
    /// `!` prefix whitelists: "ad;spam;!important"
    Filter {
        name: String,
        spec: Option<String>,
    },
    /// Show or set the global filters applied to every rule
    GlobalFilter { spec: Option<String> },
    /// Set or clear a rule's note
    Note {
        name: String,
        note: Option<String>,
    },
    /// Show sync state for every rule
    Status,
    /// List background tasks
    Tasks,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    if let Command::InitConfig { output } = &args.command {
        std::fs::write(output, config::example())?;
        info!(path = %output.display(), "wrote example config");
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/tgforward.db?mode=rwc", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::InitConfig { .. } => unreachable!("handled above"),
        Command::Rules => {
            let rules = db::get_all_rules(&pool, false).await?;
            if rules.is_empty() {
                println!("no rules configured");
            }
            for rule in rules {
                println!(
                    "{} {} -> {} [{}] every {}m{}",
                    rule.name,
                    rule.source_chat,
                    rule.target_chat,
                    rule.mode.as_str(),
                    rule.interval_minutes,
                    if rule.enabled { "" } else { " (disabled)" },
                );
            }
        }
        Command::Add {
            name,
            source,
            target,
            mode,
            interval,
            note,
        } => {
            let mode = ForwardMode::parse(&mode)
                .ok_or_else(|| anyhow::anyhow!("mode must be 'clone' or 'direct'"))?;
            let interval = interval.unwrap_or(cfg.watch.default_interval_minutes as i64);
            let id = db::create_rule(
                &pool,
                &name,
                &source,
                &target,
                mode,
                interval,
                None,
                note.as_deref(),
            )
            .await?;
            println!("created rule {name} (id {id})");
        }
        Command::Enable { name } => {
            if db::set_rule_enabled(&pool, &name, true).await? {
                println!("enabled {name}");
            } else {
                anyhow::bail!("no such rule: {name}");
            }
        }
        Command::Disable { name } => {
            if db::set_rule_enabled(&pool, &name, false).await? {
                println!("disabled {name}");
            } else {
                anyhow::bail!("no such rule: {name}");
            }
        }
        Command::Remove { name } => {
            if db::delete_rule(&pool, &name).await? {
                println!("removed {name}");
            } else {
                anyhow::bail!("no such rule: {name}");
            }
        }
        Command::Filter { name, spec } => match spec {
            Some(spec) => {
                let config = parse_filter_string(&spec);
                let json = config.to_json();
                if !db::set_rule_filter(&pool, &name, Some(&json)).await? {
                    anyhow::bail!("no such rule: {name}");
                }
                println!("set {} filter rule(s) on {name}", config.rules.len());
            }
            None => {
                let rule = db::get_rule(&pool, &name)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no such rule: {name}"))?;
                match rule.filter_spec.as_deref() {
                    Some(json) => print_filters(&FilterConfig::from_json(json)),
                    None => println!("no filters on {name}"),
                }
            }
        },
        Command::GlobalFilter { spec } => match spec {
            Some(spec) => {
                let config = parse_filter_string(&spec);
                db::set_setting(&pool, SETTING_GLOBAL_FILTERS, &config.to_json()).await?;
                println!("set {} global filter rule(s)", config.rules.len());
            }
            None => match db::get_setting(&pool, SETTING_GLOBAL_FILTERS).await? {
                Some(json) => print_filters(&FilterConfig::from_json(&json)),
                None => println!("no global filters"),
            },
        },
        Command::Note { name, note } => {
            if db::set_rule_note(&pool, &name, note.as_deref()).await? {
                println!("updated note on {name}");
            } else {
                anyhow::bail!("no such rule: {name}");
            }
        }
        Command::Status => {
            let rules = db::get_all_rules(&pool, false).await?;
            for rule in rules {
                let state = db::get_state(&pool, rule.id, &cfg.app.namespace).await?;
                let (cursor, total, last) = state
                    .map(|s| {
                        (
                            s.last_msg_id,
                            s.total_forwarded,
                            s.last_sync_at
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "never".into()),
                        )
                    })
                    .unwrap_or((0, 0, "never".into()));
                println!(
                    "{}: cursor={cursor} forwarded={total} last_sync={last}",
                    rule.name
                );
            }
        }
        Command::Tasks => {
            let tasks = db::list_tasks(&pool).await?;
            if tasks.is_empty() {
                println!("no tasks");
            }
            for task in tasks {
                println!(
                    "#{} {} {} {:.0}% [{}]{}",
                    task.id,
                    task.kind,
                    task.status.as_str(),
                    task.progress,
                    task.stage,
                    task.error.map(|e| format!(" error: {e}")).unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}

fn print_filters(config: &FilterConfig) {
    for rule in &config.rules {
        println!(
            "{:?} {:?} {:?}{}",
            rule.action,
            rule.kind,
            rule.pattern,
            if rule.enabled { "" } else { " (disabled)" },
        );
    }
}
