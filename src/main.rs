//! Operator CLI for the isolation layer
//!
//! Every invocation restores the persisted environments first, so commands
//! issued from separate processes see the same agents.

use std::env;
use std::path::PathBuf;

use agentvisor::metrics::gather_text;
use agentvisor::tracing::{init_tracing, shutdown_tracing, OTLP_ENDPOINT_ENV};
use agentvisor::{IsolationManager, Settings};

const USAGE: &str = "\
usage: agentvisor <command> [args]

  types                                   backends available on this host
  configs [repo]                          isolation configs for a repository
  create <config> <workspace> <agent> [repo]
  run <config> <workspace> <agent> [repo] create, wait for Ctrl+C, destroy
  exec <agent> <command...>
  destroy <agent>
  list
  stats <agent>
  shell <agent>                           print the shell attach command
  orphans                                 untracked environments on the host
  cleanup-orphans
  cleanup-workspace <path>
  metrics";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let otlp = env::var(OTLP_ENDPOINT_ENV).ok();
    if let Err(e) = init_tracing("agentvisor", otlp.as_deref()) {
        eprintln!("[WARN] tracing init failed: {}", e);
    }

    let args: Vec<String> = env::args().skip(1).collect();
    let code = match run(&args).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };

    shutdown_tracing();
    std::process::exit(code);
}

fn arg(args: &[String], index: usize, name: &str) -> Result<String, BoxError> {
    args.get(index)
        .cloned()
        .ok_or_else(|| format!("missing <{}>\n\n{}", name, USAGE).into())
}

fn repo_arg(args: &[String], index: usize) -> Result<PathBuf, BoxError> {
    match args.get(index) {
        Some(repo) => Ok(PathBuf::from(repo)),
        None => Ok(env::current_dir()?),
    }
}

async fn run(args: &[String]) -> Result<(), BoxError> {
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let settings = Settings::load()?;
    let manager = IsolationManager::from_settings(&settings);
    manager.restore().await?;

    match command.as_str() {
        "types" => {
            for backend in manager.available_types().await {
                println!("{}", backend);
            }
        }
        "configs" => {
            let repo = repo_arg(args, 1)?;
            for config in manager.configs(&repo)? {
                match manager.display_info(&config.name, &repo).await {
                    Ok(info) => println!(
                        "{:<24} {:<11} {} [{}]",
                        config.name,
                        config.backend_type,
                        info.name,
                        info.limits.join("; ")
                    ),
                    Err(e) => println!("{:<24} {:<11} ({})", config.name, config.backend_type, e),
                }
            }
        }
        "create" | "run" => {
            let config = arg(args, 1, "config")?;
            let workspace = PathBuf::from(arg(args, 2, "workspace")?);
            let agent = arg(args, 3, "agent")?;
            let repo = repo_arg(args, 4)?;

            let info = manager
                .create(&config, &workspace, &agent, &repo, None)
                .await?;
            println!("{}", serde_json::to_string_pretty(&info)?);

            if command == "run" {
                println!("[INFO] environment running, Ctrl+C to destroy");
                tokio::signal::ctrl_c().await?;
                manager.destroy(&agent).await;
            }
        }
        "exec" => {
            let agent = arg(args, 1, "agent")?;
            let line = args.get(2..).unwrap_or_default().join(" ");
            if line.is_empty() {
                return Err(format!("missing <command>\n\n{}", USAGE).into());
            }
            print!("{}", manager.exec(&agent, &line).await?);
        }
        "destroy" => {
            let agent = arg(args, 1, "agent")?;
            manager.destroy(&agent).await;
        }
        "list" => {
            for info in manager.list().await {
                println!(
                    "{:<20} {:<10} {:<9} {:<24} {}",
                    info.agent_id,
                    info.backend_type,
                    info.state,
                    info.config_name,
                    info.workspace_path.display()
                );
            }
        }
        "stats" => {
            let agent = arg(args, 1, "agent")?;
            match manager.stats(&agent).await? {
                Some(stats) => println!(
                    "memory {:.1} MB, cpu {:.1}%",
                    stats.memory_mb, stats.cpu_percent
                ),
                None => println!("stats not available for this backend"),
            }
        }
        "shell" => {
            let agent = arg(args, 1, "agent")?;
            match manager.shell_attach_command(&agent).await? {
                Some(spec) => println!("{} {}", spec.program, spec.args.join(" ")),
                None => println!("no shell attach for this backend"),
            }
        }
        "orphans" => {
            for orphan in manager.find_orphaned().await {
                println!(
                    "{:<10} {} {}",
                    orphan.backend_type,
                    orphan.handle,
                    orphan.agent_id.as_deref().unwrap_or("-")
                );
            }
        }
        "cleanup-orphans" => {
            let removed = manager.cleanup_orphaned().await;
            println!("removed {} orphaned environment(s)", removed.len());
        }
        "cleanup-workspace" => {
            let path = PathBuf::from(arg(args, 1, "path")?);
            manager.cleanup_workspace(&path).await;
        }
        "metrics" => print!("{}", gather_text()),
        other => return Err(format!("unknown command '{}'\n\n{}", other, USAGE).into()),
    }
    Ok(())
}
