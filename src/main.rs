//! The `kodiak-dns` server binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tokio::runtime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kodiak_dns::{Config, ModuleEnv, RuntimeConfig, ServerWorker, TrustAnchorStore};

/// A recursive, caching, validating DNS resolver.
#[derive(Debug, Parser)]
#[clap(name = "kodiak-dns", version, about)]
struct Cli {
    /// Path to the configuration file
    #[clap(
        short = 'c',
        long = "config",
        default_value = "/etc/kodiak.toml",
        value_name = "FILE",
        value_hint = clap::ValueHint::FilePath
    )]
    config: PathBuf,

    /// Check the configuration and exit
    #[clap(long = "validate")]
    validate: bool,

    /// Listening port, overrides the configuration file
    #[clap(short = 'p', long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Number of worker threads, overrides the configuration file
    #[clap(long = "workers", value_name = "N")]
    workers: Option<usize>,

    /// Disable INFO messages; WARN and ERROR remain
    #[clap(short = 'q', long = "quiet", conflicts_with = "debug")]
    quiet: bool,

    /// Turn on DEBUG messages
    #[clap(short = 'd', long = "debug", conflicts_with = "quiet")]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("kodiak_dns={default_level}"))),
        )
        .init();

    let mut config = if cli.config.exists() {
        match Config::read_config(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        }
    } else {
        info!(
            "configuration file {} not found, using defaults",
            cli.config.display()
        );
        Config::default()
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(workers) = cli.workers {
        config.num_threads = workers.max(1);
    }

    let cfg = match RuntimeConfig::from_config(config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let anchors = match TrustAnchorStore::from_runtime_config(&cfg) {
        Ok(anchors) => Arc::new(anchors),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    if cli.validate {
        info!("configuration OK");
        return;
    }

    let env = Arc::new(ModuleEnv::new(Arc::clone(&cfg), anchors));
    let threads = cfg.cfg.num_threads;
    info!(
        "starting on port {} with {threads} worker thread(s)",
        cfg.cfg.port
    );

    let mut handles = Vec::with_capacity(threads);
    for thread_id in 0..threads {
        let cfg = Arc::clone(&cfg);
        let env = Arc::clone(&env);
        let handle = thread::Builder::new()
            .name(format!("worker-{thread_id}"))
            .spawn(move || {
                let rt = runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime construction cannot fail");
                if let Err(e) = rt.block_on(ServerWorker::new(cfg, env, thread_id).run()) {
                    error!("worker {thread_id} exited: {e}");
                }
            })
            .expect("thread spawn cannot fail");
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }
}
