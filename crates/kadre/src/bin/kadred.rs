use std::path::PathBuf;
use std::sync::Arc;

use kadre::{DaemonConfig, ServeError, ServerBuilder};

#[derive(Debug)]
struct CliConfig {
    socket: PathBuf,
    scheme: PathBuf,
    start_entry: Option<String>,
    log: Option<PathBuf>,
    dry_run: bool,
}

const USAGE: &str = "usage: kadred --scheme FILE [--socket PATH] [--start-entry NAME] \
[--log FILE] [--dry-run]";

fn main() {
    let cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    if let Err(message) = init_logging(cfg.log.as_deref()) {
        eprintln!("{message}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(3);
        }
    };

    let code = runtime.block_on(run(cfg));
    std::process::exit(code);
}

async fn run(cfg: CliConfig) -> i32 {
    let mut daemon_config = DaemonConfig::new()
        .with_socket_path(&cfg.socket)
        .with_dry_run(cfg.dry_run);
    if let Some(entry) = &cfg.start_entry {
        daemon_config = daemon_config.with_start_entry(entry);
    }

    let daemon = match ServerBuilder::new()
        .with_config(daemon_config)
        .serve_deploy_file(&cfg.scheme)
        .await
    {
        Ok(daemon) => daemon,
        Err(err @ (ServeError::Scheme(_) | ServeError::SchemeFile { .. })) => {
            eprintln!("{err}");
            return 2;
        }
        Err(err) => {
            eprintln!("{err}");
            return 3;
        }
    };
    tracing::info!(socket = ?daemon.socket_path(), scheme = ?cfg.scheme, "kadred serving");

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "signal wait failed");
    }
    tracing::info!("shutting down");
    daemon.shutdown().await;
    0
}

fn init_logging(log: Option<&std::path::Path>) -> Result<(), String> {
    match log {
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .init();
        }
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| format!("failed to open log {path:?}: {err}"))?;
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
    }
    Ok(())
}

fn parse_args() -> Result<CliConfig, String> {
    let mut socket = PathBuf::from(kadre::DEFAULT_SOCKET_PATH);
    let mut scheme: Option<PathBuf> = None;
    let mut start_entry = None;
    let mut log = None;
    let mut dry_run = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket" => {
                let Some(value) = args.next() else {
                    return Err("--socket requires a path".to_owned());
                };
                socket = PathBuf::from(value);
            }
            "--scheme" => {
                let Some(value) = args.next() else {
                    return Err("--scheme requires a path".to_owned());
                };
                scheme = Some(PathBuf::from(value));
            }
            "--start-entry" => {
                let Some(value) = args.next() else {
                    return Err("--start-entry requires a name".to_owned());
                };
                start_entry = Some(value);
            }
            "--log" => {
                let Some(value) = args.next() else {
                    return Err("--log requires a path".to_owned());
                };
                log = Some(PathBuf::from(value));
            }
            "--dry-run" => dry_run = true,
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }

    let Some(scheme) = scheme else {
        return Err("--scheme is required".to_owned());
    };
    Ok(CliConfig {
        socket,
        scheme,
        start_entry,
        log,
        dry_run,
    })
}
