//! Dicebot CLI
//!
//! Console session, template rendering and configuration helpers

mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dicebot_config::Config;
use dicebot_core::dispatch::split_segments;
use dicebot_core::format::{render_template, render_text};
use dicebot_core::session::private_group_id;
use dicebot_core::{
    format_dice_id, BusTransport, CommandHandler, Dice, DiceRuntime, EndPoint, ExtInfo,
    ExtRegistry, MsgContext, NoopVarLoader, Reply, Session, StorageVarLoader,
};
use dicebot_ipc::{EventBus, Message, OutboundMessage, OutboundTarget};
use dicebot_storage::Storage;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, Mutex};
use tracing::info;

const DB_FILE: &str = "dicebot.db";
const CONSOLE_USER_ID: &str = "console";
/// Time left for in-flight replies after stdin closes.
const CONSOLE_DRAIN: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "dicebot")]
#[command(about = "Chat dice bot engagement and reply pipeline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides core.log_level)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session: each stdin line is an inbound message.
    /// Prefix a line with `g:<group_id> ` to send it from a group.
    Console {
        /// Platform name reported by the console endpoint
        #[arg(short, long, default_value = "QQ")]
        platform: String,
        /// Bot account id on the platform
        #[arg(short, long, default_value = "10000")]
        bot_id: String,
        /// Nickname of the console user
        #[arg(short, long, default_value = "player")]
        nickname: String,
    },

    /// Render a template key or raw text through the reply formatter
    Render {
        /// Template key
        #[arg(short, long, conflicts_with = "text", required_unless_present = "text")]
        key: Option<String>,
        /// Raw text
        #[arg(short, long)]
        text: Option<String>,
        /// Nickname bound to `{$tName}`
        #[arg(short, long, default_value = "player")]
        nickname: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Load and validate the configuration
    Check,
    /// Write the example configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Console {
            platform,
            bot_id,
            nickname,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let data_dir = config
                .data_dir()
                .ok_or_else(|| anyhow!("Cannot determine data directory"))?;
            fs::create_dir_all(&data_dir)?;
            let log_level = log_level(&config, cli.log_level.as_deref());
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;
            let storage = Storage::new(data_dir.join(DB_FILE))?;
            run_console(config, storage, &platform, &bot_id, &nickname).await?;
        }

        Commands::Render {
            key,
            text,
            nickname,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let ctx = render_context(&config, &nickname)?;
            let rendered = match (key, text) {
                (Some(key), _) => render_template(&ctx, &key),
                (None, Some(text)) => render_text(&ctx, &text),
                (None, None) => anyhow::bail!("Either --key or --text is required"),
            };
            for (i, segment) in split_segments(&rendered).into_iter().enumerate() {
                if i > 0 {
                    println!("---");
                }
                println!("{}", segment);
            }
        }

        Commands::Config { action } => match action {
            ConfigCommands::Check => match load_config(cli.config.as_deref()) {
                Ok(config) => {
                    println!("Configuration is valid.");
                    println!("  templates:  {}", config.templates.entries.len());
                    println!("  extensions: {}", config.extensions.len());
                    println!("  paced on:   {}", config.pacing.platforms.join(", "));
                }
                Err(e) => eprintln!("Configuration is invalid: {}", e),
            },
            ConfigCommands::Init { force } => {
                let path = config_path(cli.config.as_deref())?;
                create_default_config(&path, force)?;
            }
            ConfigCommands::Path => {
                println!("{}", config_path(cli.config.as_deref())?.display());
            }
        },
    }

    Ok(())
}

fn config_path(config_path: Option<&str>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().ok_or_else(|| anyhow!("Cannot determine config directory")),
    }
}

/// Built-in defaults apply when no config file exists at the default path.
fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        return Config::load(path).with_context(|| format!("Failed to load {}", path));
    }
    match Config::default_path() {
        Some(path) if path.exists() => {
            Config::load(&path).with_context(|| format!("Failed to load {}", path.display()))
        }
        _ => Ok(Config::default()),
    }
}

fn log_level(config: &Config, cli_level: Option<&str>) -> String {
    cli_level
        .or(config.core.log_level.as_deref())
        .unwrap_or("info")
        .to_string()
}

fn create_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, include_str!("../../../config/config.example.toml"))?;
    println!("Configuration created at: {}", path.display());
    Ok(())
}

fn extension_registry(config: &Config) -> ExtRegistry {
    let mut registry = ExtRegistry::new();
    for ext in &config.extensions {
        registry.register(ExtInfo::new(&ext.name, env!("CARGO_PKG_VERSION"), "dicebot"));
    }
    registry
}

fn render_context(config: &Config, nickname: &str) -> Result<MsgContext> {
    let dice = Dice::from_config(config, Arc::new(NoopVarLoader))?;
    let session = Session::from_config(config, &extension_registry(config));
    let bot_id = format_dice_id("Console", 0, false);
    let transport = BusTransport::new(EventBus::new().outbound_sender());
    let endpoint = EndPoint::new(&bot_id, "Console", Arc::new(transport));

    let mut ctx = MsgContext::new(Arc::new(dice), Arc::new(session), Arc::new(endpoint));
    let group = ctx
        .session
        .activate(&private_group_id(CONSOLE_USER_ID), &bot_id);
    ctx.player = Some(group.get_or_insert_player(CONSOLE_USER_ID, nickname));
    ctx.group = Some(group);
    ctx.engaged = true;
    Ok(ctx)
}

/// `g:<group_id> text` is a group message, anything else a private one.
fn parse_console_line(line: &str, nickname: &str) -> Option<Message> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(rest) = line.strip_prefix("g:") {
        let (group_id, text) = rest.split_once(char::is_whitespace)?;
        return Some(Message::group(group_id, CONSOLE_USER_ID, nickname, text.trim()));
    }
    Some(Message::private(CONSOLE_USER_ID, nickname, line))
}

fn format_outbound(msg: &OutboundMessage) -> String {
    match msg.target {
        OutboundTarget::Group => format!("[group {}] {}", msg.recipient, msg.text),
        OutboundTarget::Person => format!("[to {}] {}", msg.recipient, msg.text),
    }
}

async fn run_console(
    config: Config,
    storage: Storage,
    platform: &str,
    bot_id: &str,
    nickname: &str,
) -> Result<()> {
    let bus = EventBus::new();
    let transport = BusTransport::new(bus.outbound_sender());
    let endpoint = EndPoint::new(
        &format_dice_id(platform, bot_id, false),
        platform,
        Arc::new(transport),
    );
    let var_loader = Arc::new(StorageVarLoader::new(Arc::new(Mutex::new(storage))));
    let runtime = Arc::new(
        DiceRuntime::new(
            &config,
            &extension_registry(&config),
            endpoint,
            Arc::new(ConsoleHandler),
            var_loader,
        )?
        .with_event_bus(bus.clone()),
    );

    let mut outbound_rx = bus.outbound_subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match outbound_rx.recv().await {
                Ok(msg) => println!("{}", format_outbound(&msg)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    let runner = tokio::spawn(Arc::clone(&runtime).run());
    while bus.receiver_count() == 0 {
        tokio::task::yield_now().await;
    }

    info!("Console ready on {} as {}", platform, bot_id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(msg) = parse_console_line(&line, nickname) {
            bus.publish(msg.with_platform(platform))?;
        }
    }

    tokio::time::sleep(CONSOLE_DRAIN).await;
    runner.abort();
    printer.abort();
    Ok(())
}

/// Minimal command set for exercising the reply pipeline by hand.
struct ConsoleHandler;

impl ConsoleHandler {
    fn template_or(ctx: &MsgContext, key: &str, fallback: &str) -> Reply {
        if ctx.dice.templates.lookup(key).is_some() {
            Reply::Template(key.to_string())
        } else {
            Reply::Text(fallback.to_string())
        }
    }
}

#[async_trait::async_trait]
impl CommandHandler for ConsoleHandler {
    async fn handle(&self, ctx: &MsgContext, msg: &Message) -> Result<Option<Reply>> {
        let text = msg.text.trim();
        let (command, args) = text
            .split_once(char::is_whitespace)
            .map(|(c, a)| (c, a.trim()))
            .unwrap_or((text, ""));

        if command == ".bot" && msg.is_group() {
            return Ok(match args {
                "on" => {
                    ctx.session.activate(&msg.group_id, &ctx.endpoint.user_id);
                    Some(Self::template_or(ctx, "bot_on", "Bot on"))
                }
                "off" => {
                    ctx.session.deactivate(&msg.group_id, &ctx.endpoint.user_id);
                    Some(Self::template_or(ctx, "bot_off", "Bot off"))
                }
                _ => None,
            });
        }
        if !ctx.engaged {
            return Ok(None);
        }

        let reply = match command {
            ".say" => Some(Reply::Text(args.to_string())),
            ".tmpl" if !args.is_empty() => Some(Reply::Template(args.to_string())),
            ".set" => {
                let (Some(player), Some((key, value))) =
                    (&ctx.player, args.split_once(char::is_whitespace))
                else {
                    return Ok(Some(Reply::Text("Usage: .set <name> <value>".to_string())));
                };
                player.value_map_temp().insert(
                    key.to_string(),
                    serde_json::Value::String(value.trim().to_string()),
                );
                Some(Reply::Text(format!("{} = {{{}}}", key, key)))
            }
            ".ext" => ctx.group.as_ref().map(|group| {
                let names: Vec<String> = group
                    .activated_extensions()
                    .iter()
                    .map(|ext| ext.name.clone())
                    .collect();
                Reply::Text(format!("Extensions: {}", names.join(", ")))
            }),
            _ => None,
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicebot_config::PacingConfig;

    fn console_runtime() -> (EventBus, DiceRuntime) {
        let mut config = Config::default();
        config.pacing = PacingConfig {
            platforms: Vec::new(),
            ..PacingConfig::default()
        };
        let bus = EventBus::new();
        let endpoint = EndPoint::new(
            "QQ:10000",
            "QQ",
            Arc::new(BusTransport::new(bus.outbound_sender())),
        );
        let runtime = DiceRuntime::new(
            &config,
            &ExtRegistry::new(),
            endpoint,
            Arc::new(ConsoleHandler),
            Arc::new(NoopVarLoader),
        )
        .expect("runtime")
        .with_event_bus(bus.clone());
        (bus, runtime)
    }

    #[test]
    fn console_line_prefix_selects_group() {
        let msg = parse_console_line("g:1001 .bot on", "alice").expect("message");
        assert!(msg.is_group());
        assert_eq!(msg.group_id, "1001");
        assert_eq!(msg.text, ".bot on");

        let msg = parse_console_line("  hello  ", "alice").expect("message");
        assert!(!msg.is_group());
        assert_eq!(msg.sender.user_id, CONSOLE_USER_ID);
        assert_eq!(msg.text, "hello");

        assert!(parse_console_line("   ", "alice").is_none());
        assert!(parse_console_line("g:1001", "alice").is_none());
    }

    #[tokio::test]
    async fn console_handler_sets_and_expands_player_vars() {
        let (bus, runtime) = console_runtime();
        let mut rx = bus.outbound_subscribe();

        runtime
            .handle_message(Message::private(CONSOLE_USER_ID, "alice", ".set hp 12"))
            .await
            .expect("handle");
        let out = rx.recv().await.expect("reply");
        assert_eq!(format_outbound(&out), "[to console] hp = 12");
    }

    #[tokio::test]
    async fn console_handler_ignores_inactive_groups() {
        let (bus, runtime) = console_runtime();
        let mut rx = bus.outbound_subscribe();

        runtime
            .handle_message(Message::group("1001", CONSOLE_USER_ID, "alice", ".say hi"))
            .await
            .expect("handle");
        runtime
            .handle_message(Message::group("1001", CONSOLE_USER_ID, "alice", ".bot on"))
            .await
            .expect("handle");
        runtime
            .handle_message(Message::group("1001", CONSOLE_USER_ID, "alice", ".say hi"))
            .await
            .expect("handle");

        assert_eq!(format_outbound(&rx.recv().await.expect("reply")), "[group 1001] Bot on");
        assert_eq!(format_outbound(&rx.recv().await.expect("reply")), "[group 1001] hi");
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        create_default_config(&path, false).expect("create");
        assert!(create_default_config(&path, false).is_err());
        create_default_config(&path, true).expect("overwrite");

        let config = Config::load(&path).expect("example config loads");
        assert!(config.templates.entries.contains_key("greet"));
    }
}
