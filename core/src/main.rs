//! Worktree Sandbox CLI
//!
//! Starts one sandbox running the given worker command, prints its details,
//! and deletes it on Ctrl-C.

use std::path::PathBuf;

use worktree_sandbox::{RuntimeConfig, SandboxService, SandboxSpec, Validate};

/// Environment variable naming the TOML config file.
const CONFIG_ENV: &str = "SANDBOX_CONFIG";

const CLI_SPEC_ID: &str = "cli";

fn load_config() -> worktree_sandbox::Result<RuntimeConfig> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => RuntimeConfig::load(&PathBuf::from(path)),
        _ => Ok(RuntimeConfig::new(std::env::current_dir()?)),
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <worker command...>", args[0]);
        eprintln!("\nStarts a worktree sandbox running the worker command.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  {}=<path>  TOML runtime config (default: current dir as base repo)", CONFIG_ENV);
        eprintln!("  SANDBOX_WORKTREE_BASE_DIR=<dir>  Where worktrees are created");
        std::process::exit(1);
    }

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    match config.validate().into_result() {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(warning = %warning, "config warning");
            }
        }
        Err(e) => {
            eprintln!("Invalid config: {}", e);
            std::process::exit(1);
        }
    }

    let service = SandboxService::new(config);
    service
        .register_spec(SandboxSpec::new(CLI_SPEC_ID).with_command(args[1..].iter().cloned()))
        .await;

    let session_api_key = uuid::Uuid::new_v4().simple().to_string();
    tracing::info!(command = %args[1..].join(" "), "starting sandbox");

    let info = match service.create(CLI_SPEC_ID, &session_api_key).await {
        Ok(info) => info,
        Err(e) => {
            eprintln!("Sandbox failed to start: {}", e);
            std::process::exit(1);
        }
    };

    match serde_json::to_string_pretty(&info) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to render sandbox info: {}", e),
    }
    println!("Session API key: {}", session_api_key);
    println!("\nPress Ctrl-C to stop and delete the sandbox.");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
    }

    tracing::info!(sandbox_id = %info.id, "deleting sandbox");
    service.delete(&info.id).await;
}
