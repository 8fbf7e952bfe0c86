use std::path::PathBuf;
use std::process;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(unix)]
#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let (executable, flags) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: devpipe <executable> [--] [flag...]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <executable>    Browser binary to launch");
            eprintln!("  [flag...]       Extra browser flags, passed through unchanged");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  DEVPIPE_LOG     Log level: debug, info, warn, error [default: info]");
            eprintln!("  LOG_FORMAT      Set to 'json' for JSON log lines");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(executable, flags).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("error: devpipe requires a unix platform");
    process::exit(1);
}

fn parse_args(args: &[String]) -> Result<(PathBuf, Vec<String>), String> {
    let mut executable: Option<PathBuf> = None;
    let mut flags = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let arg = args[i].as_str();
        match (arg, executable.is_some()) {
            ("--help" | "-h", false) => return Err(String::new()),
            ("--", true) => {
                flags.extend(args[i + 1..].iter().cloned());
                break;
            }
            (_, true) => flags.push(arg.to_string()),
            (arg, false) if arg.starts_with('-') => {
                return Err(format!("unknown flag before <executable>: {arg}"));
            }
            (arg, false) => executable = Some(PathBuf::from(arg)),
        }
        i += 1;
    }

    let executable = executable.ok_or("missing required argument: <executable>")?;
    Ok((executable, flags))
}

#[cfg(unix)]
async fn run(executable: PathBuf, flags: Vec<String>) -> anyhow::Result<()> {
    use anyhow::Context;
    use devpipe::SessionEvent;
    use serde_json::json;

    let mut browser = devpipe::launch(&executable, flags)
        .await
        .with_context(|| format!("launching {}", executable.display()))?;

    println!("{}", browser.endpoint_url());

    browser
        .send("Target.setDiscoverTargets", Some(json!({ "discover": true })))
        .await
        .context("enabling target discovery")?;

    let connection = browser.connection().clone();
    let interrupted = tokio::select! {
        _ = shutdown_signal() => true,
        _ = connection.closed() => false,
        _ = async {
            while let Some(event) = browser.events().recv().await {
                match event {
                    SessionEvent::Event { method, params } => {
                        tracing::info!(%method, %params, "Event");
                    }
                    SessionEvent::UncaughtError(error) => {
                        tracing::warn!(%error, "Uncaught protocol error");
                    }
                }
            }
        } => false,
    };

    // The root event stream only ends on teardown.
    let fatal = if interrupted {
        None
    } else {
        let fatal = connection.closed().await;
        tracing::info!("Connection closed");
        fatal
    };

    let status = browser.close().await.context("shutting down browser")?;
    tracing::info!(?status, "Done");

    match fatal {
        Some(e) => Err(anyhow::Error::new(e).context("connection desynchronized")),
        None => Ok(()),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("DEVPIPE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("devpipe={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
