//! Response Modifier - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use response_modifier::server;
use response_modifier::{banner, ResponseHook, ResponseModifier, RuleSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "response-modifier",
    about = "Rule-driven response modifier for intercepting proxies - error, latency and payload simulation",
    version
)]
struct Args {
    /// Path to the rule file (JSON, or YAML with a .yaml/.yml extension)
    #[arg(short, long, default_value = "modifications_config.json")]
    config: PathBuf,

    /// Serve flows on this Unix socket instead of stdin/stdout
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print an example rule file and exit
    #[arg(long)]
    print_config: bool,

    /// Validate the rule file and exit
    #[arg(long)]
    validate: bool,

    /// Skip the startup banner
    #[arg(long)]
    no_banner: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries flows in stdio mode, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let example = include_str!("../config/modifications_config.example.json");
        println!("{}", example);
        return Ok(());
    }

    if args.validate {
        let rules = RuleSet::from_file(&args.config)?;
        let problems = rules.problems();
        if !problems.is_empty() {
            for problem in &problems {
                eprintln!("  {}", problem);
            }
            anyhow::bail!(
                "{} invalid rule(s) in {}",
                problems.len(),
                args.config.display()
            );
        }
        println!(
            "Configuration is valid ({} rules defined, {} enabled)",
            rules.len(),
            rules.enabled_count()
        );
        return Ok(());
    }

    let rules = RuleSet::load_or_empty(&args.config);

    if !args.no_banner {
        let listen = match &args.socket {
            Some(path) => path.display().to_string(),
            None => "stdin/stdout".to_string(),
        };
        eprint!(
            "{}",
            banner::render(&rules, &args.config, &listen, chrono::Local::now())
        );
    }

    let modifier = Arc::new(ResponseModifier::new(rules));
    let hook: Arc<dyn ResponseHook> = modifier.clone();

    let mut interrupted = false;
    match &args.socket {
        Some(path) => {
            #[cfg(unix)]
            server::serve_unix(hook, path, shutdown_signal()).await?;
            #[cfg(not(unix))]
            anyhow::bail!("Unix sockets are not supported on this platform: {}", path.display());
        }
        None => {
            tokio::select! {
                served = server::serve_stdio(hook) => served?,
                _ = shutdown_signal() => {
                    info!("Interrupted, stopping");
                    interrupted = true;
                }
            }
        }
    }

    info!(
        flows = modifier.total_flows(),
        matched = modifier.total_matched(),
        failures = modifier.total_failures(),
        "Response modifier stopped"
    );

    // A pending stdin read cannot be cancelled and would hold runtime shutdown
    if interrupted {
        std::process::exit(0);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
