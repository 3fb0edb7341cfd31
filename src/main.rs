#[cfg(any(target_os = "linux", target_os = "macos"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod bookmarks;
mod channels;
mod config;
mod core;
mod daemon;
mod intake;
mod ipc;
mod pool;
mod reminders;
mod router;
mod scheduler;
mod snapshots;
mod store;
mod types;
mod voice;
mod worker;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load environment file.
    // - Default: .env discovered from current working directory and parents.
    // - Override: COURIERD_ENV_FILE=/absolute/path/to/envfile
    if let Ok(path) = std::env::var("COURIERD_ENV_FILE") {
        if !path.trim().is_empty() {
            if let Err(e) = dotenvy::from_path(&path) {
                eprintln!("Warning: failed to load COURIERD_ENV_FILE '{}': {}", path, e);
            }
        } else {
            let _ = dotenvy::dotenv();
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = PathBuf::from("config.toml");

    // Handle CLI arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("courierd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("courierd {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: courierd [COMMAND]\n");
                println!("Commands:");
                println!("  install-service    Install as a system service (launchd/systemd)");
                println!("\nOptions:");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                return Ok(());
            }
            "install-service" => {
                return daemon::install_service();
            }
            other => {
                eprintln!("Unknown command: '{}'. See --help.", other);
                std::process::exit(1);
            }
        }
    }

    if !config_path.exists() {
        anyhow::bail!(
            "No config.toml found in the working directory. \
             Minimal config needs [main] folder, [worker] command, and at \
             least one channel section ([signal] or [[slack]])."
        );
    }
    let config = config::AppConfig::load(&config_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(core::run(config))
}
