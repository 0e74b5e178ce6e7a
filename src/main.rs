use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use stemrelay::cli::{Cli, Commands, ConfigAction};
use stemrelay::client::{self, ClientOptions, WavAudio};
use stemrelay::config::Config;
use stemrelay::engine::EngineOptions;
use stemrelay::engine::catalog::{aliases_for, list_models};
use stemrelay::server::RelayServer;
use std::io::IsTerminal;
use std::path::Path;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match cli.command {
        None => {
            let config = load_config(cli.config.as_deref())?;
            run_server(config).await?;
        }
        Some(Commands::Serve {
            host,
            port,
            model,
            window,
        }) => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(model) = model {
                config.engine.default_model = model;
            }
            if let Some(window) = window {
                config.window.duration_ms = u32::try_from(window.as_millis()).unwrap_or(u32::MAX);
            }
            run_server(config).await?;
        }
        Some(Commands::Separate {
            input,
            output_dir,
            url,
            model,
            chunk,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            run_separate(&config, &input, &output_dir, url, model, chunk).await?;
        }
        Some(Commands::Models) => {
            let config = load_config(cli.config.as_deref())?;
            print_models(&config.engine.default_model);
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Dump => {
                let config = load_config(cli.config.as_deref())?;
                print!("{}", config.to_toml()?);
            }
            ConfigAction::Path => {
                println!("{}", Config::default_path().display());
            }
        },
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "stemrelay", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Route `log` output through env_logger; `RUST_LOG` overrides the flags.
fn init_logging(quiet: bool, verbose: u8) {
    let level = if quiet {
        log::LevelFilter::Error
    } else {
        match verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

/// Load configuration from a custom path or the default location.
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path).with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        let path = Config::default_path();
        Config::load_or_default(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
    };

    // Apply environment variable overrides
    Ok(config.with_env_overrides())
}

async fn run_server(config: Config) -> Result<()> {
    config.validate()?;
    log::info!(
        "stemrelay {} (default model: {}, window: {}ms, workers: {})",
        stemrelay::version_string(),
        config.engine.default_model,
        config.window.duration_ms,
        config.engine.workers
    );
    RelayServer::new(&config).run().await?;
    Ok(())
}

async fn run_separate(
    config: &Config,
    input: &Path,
    output_dir: &Path,
    url: Option<String>,
    model: Option<String>,
    chunk: Duration,
) -> Result<()> {
    let audio = WavAudio::open(input).with_context(|| format!("Failed to read {}", input.display()))?;
    log::info!(
        "Read {} ({} Hz, {} channel(s), {:.1}s)",
        input.display(),
        audio.sample_rate,
        audio.channels,
        audio.frame_count() as f64 / audio.sample_rate.max(1) as f64
    );

    let options = ClientOptions {
        url: url.unwrap_or_else(|| format!("ws://{}:{}", config.server.host, config.server.port)),
        engine: EngineOptions {
            model,
            ..Default::default()
        },
        chunk,
        ..Default::default()
    };

    let output = client::separate(&audio, &options)
        .await
        .with_context(|| format!("Separation via {} failed", options.url))?;
    if let Some(first) = output.errors.first() {
        anyhow::bail!(
            "Server reported {} error(s) while streaming, stems would have gaps: {}",
            output.errors.len(),
            first
        );
    }

    let written = output.write_to(output_dir)?;
    if written.is_empty() {
        anyhow::bail!("Server returned no stems (input shorter than one window?)");
    }
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

fn print_models(default_model: &str) {
    let color = std::io::stdout().is_terminal();
    println!("Available models:");
    for model in list_models() {
        let is_default = model.name == default_model;
        let marker = if is_default { "*" } else { " " };
        let name = format!("{:<16}", model.name);
        if color && is_default {
            println!("{} {} {}", marker, name.green().bold(), model.description);
        } else {
            println!("{} {} {}", marker, name, model.description);
        }
        println!("    buses:   {}", model.buses.join(", "));
        let aliases = aliases_for(model.name);
        if !aliases.is_empty() {
            println!("    aliases: {}", aliases.join(", "));
        }
    }
}
