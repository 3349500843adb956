use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;

use artineo::config::{DEFAULT_HOST, DEFAULT_PORT};
use artineo::{
    ApplyReport, BufferFeed, BufferReconciler, BufferSource, ClientError, ClientRegistry, ClientSettings,
    ModuleClient,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Parser, Debug)]
#[command(name = "artineo", about = "Artineo module client: config, buffers, live feed")]
struct Cli {
    #[arg(long, env = "ARTINEO_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, env = "ARTINEO_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Module id to talk to.
    #[arg(long, short, env = "ARTINEO_MODULE")]
    module: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Config(ConfigCommand),
    Buffer(BufferCommand),
    /// Stream buffers until interrupted.
    Watch(WatchArgs),
    Media,
    Asset {
        /// Path relative to the module's asset folder.
        #[arg(long)]
        path: String,
        #[arg(long)]
        out: PathBuf,
    },
    Health,
}

#[derive(Args, Debug)]
struct ConfigCommand {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand, Debug)]
enum ConfigSubcommand {
    Get,
    Set {
        /// Partial config as JSON.
        #[arg(long)]
        data: String,
    },
}

#[derive(Args, Debug)]
struct BufferCommand {
    #[command(subcommand)]
    command: BufferSubcommand,
}

#[derive(Subcommand, Debug)]
enum BufferSubcommand {
    Get {
        /// Read over HTTP instead of the websocket.
        #[arg(long)]
        http: bool,
    },
    Set {
        #[arg(long)]
        data: String,
    },
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Also poll the buffer every this many milliseconds.
    #[arg(long)]
    poll_ms: Option<NonZeroU64>,

    /// Treat buffers as drawing diffs and print the merged snapshot size.
    #[arg(long)]
    drawing: bool,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let mut settings = ClientSettings::from_env();
    let base = ClientSettings::for_host(&cli.host, cli.port);
    settings.http_base = base.http_base;
    settings.ws_base = base.ws_base;

    let registry = ClientRegistry::new(settings);
    let client = registry.get_or_create(cli.module)?;
    let result = run(&client, cli.command).await;
    registry.close_all();
    result
}

async fn run(client: &ModuleClient, command: Command) -> Result<(), CliError> {
    match command {
        Command::Config(config) => match config.command {
            ConfigSubcommand::Get => print_json(&client.fetch_config().await?),
            ConfigSubcommand::Set { data } => {
                let patch = serde_json::from_str::<Value>(&data)?;
                print_json(&client.set_config(&patch).await?)
            }
        },
        Command::Buffer(buffer) => match buffer.command {
            BufferSubcommand::Get { http: true } => print_json(&client.fetch_buffer().await?),
            BufferSubcommand::Get { http: false } => print_json(&client.get_buffer().await?),
            BufferSubcommand::Set { data } => {
                let data = serde_json::from_str::<Value>(&data)?;
                print_json(&client.set_buffer(&data).await?)
            }
        },
        Command::Watch(args) => run_watch(client, args).await,
        Command::Media => {
            let media = client.fetch_media().await?;
            print_json(&serde_json::to_value(media)?)
        }
        Command::Asset { path, out } => {
            let bytes = client.fetch_asset(&path).await?;
            std::fs::write(&out, &bytes).map_err(|source| CliError::Write { path: out.clone(), source })?;
            eprintln!("wrote {} bytes to {}", bytes.len(), out.display());
            Ok(())
        }
        Command::Health => {
            let report = client.fetch_health().await?;
            print_json(&serde_json::to_value(report)?)
        }
    }
}

async fn run_watch(client: &ModuleClient, args: WatchArgs) -> Result<(), CliError> {
    let mut feed = BufferFeed::start(client, args.poll_ms.map(|ms| Duration::from_millis(ms.get())));
    let mut reconciler = args.drawing.then(BufferReconciler::new);

    loop {
        let item = tokio::select! {
            item = feed.next() => item,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(item) = item else {
            break;
        };

        let source = match item.source {
            BufferSource::Push => "push",
            BufferSource::Poll => "poll",
        };
        let Some(reconciler) = reconciler.as_mut() else {
            print_json(&json!({"source": source, "buffer": item.buffer}))?;
            continue;
        };
        match reconciler.apply_value(&item.buffer) {
            Ok(report) if is_interesting(&report) => print_json(&json!({
                "source": source,
                "strokes": reconciler.snapshot().strokes().len(),
                "objects": reconciler.snapshot().objects().len(),
                "backgrounds": reconciler.snapshot().backgrounds().len(),
                "button": reconciler.button(),
                "timerControl": report.timer_control,
            }))?,
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "buffer is not a drawing diff"),
        }
    }

    feed.stop();
    Ok(())
}

fn is_interesting(report: &ApplyReport) -> bool {
    !report.is_noop() || report.button.is_some() || report.timer_control.is_some()
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_rejects_zero_poll_interval() {
        let parsed = Cli::try_parse_from(["artineo", "--module", "1", "watch", "--poll-ms", "0"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn watch_accepts_positive_poll_interval() {
        let cli = Cli::try_parse_from(["artineo", "--module", "1", "watch", "--poll-ms", "250"]).expect("parse");
        let Command::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(args.poll_ms.map(NonZeroU64::get), Some(250));
    }
}
