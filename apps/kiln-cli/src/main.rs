use clap::{Parser, Subcommand};
use colored::Colorize;
use kiln_box::{ContainerRuntime, DockerCli, Engine, RunOptions};
use kiln_core::{ExecutionResult, KilnConfig, NoopRegistry, ServiceMetadata};
use kiln_deps::DependencyResolver;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln Sandboxed Code Execution CLI")]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Python file once in a sandbox
    Run {
        /// Path to file
        file: PathBuf,
        /// Wall-clock limit in seconds (default: from config)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Add imports a Python file forgot
    Fix {
        /// Path to file
        file: PathBuf,
        /// Rewrite the file in place instead of printing
        #[arg(short, long)]
        write: bool,
    },
    /// Build and serve a Python file as an HTTP service until Ctrl-C
    Serve {
        /// Path to file
        file: PathBuf,
        #[arg(short, long, default_value = "Generated Service")]
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long, default_value = "1.0.0")]
        version: String,
    },
    /// Check the container runtime and configuration
    Doctor,
    /// Remove leftover sandbox directories
    Clean,
    /// Run a file on a remote Kiln server
    Submit {
        /// Path to file
        file: PathBuf,
        /// Server URL
        #[arg(long, default_value = "http://localhost:3000")]
        server: String,
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = KilnConfig::new()?;

    match cli.command {
        Commands::Run { file, timeout } => {
            let code = read_source(&file)?;
            let engine = Engine::detect(config, Arc::new(NoopRegistry))?;
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("{}", "Interrupted, stopping the sandbox...".yellow());
                    on_interrupt.cancel();
                }
            });

            let options = RunOptions {
                timeout: timeout.map(Duration::from_secs),
                cancel: Some(cancel),
            };
            let result = engine.execution().run_with(&code, options).await;
            print_result(&result);
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Fix { file, write } => {
            let code = read_source(&file)?;
            let fix = DependencyResolver::new().fix(&code);

            if fix.is_unchanged() {
                println!("{}", "No missing imports.".green());
            } else if write {
                std::fs::write(&file, &fix.fixed_code)
                    .map_err(|e| anyhow::anyhow!("Failed to write file {:?}: {}", file, e))?;
                let added: Vec<_> = fix.added_imports.iter().cloned().collect();
                println!("{} {}", "Added imports:".green().bold(), added.join(", "));
            } else {
                print!("{}", fix.fixed_code);
            }
        }
        Commands::Serve {
            file,
            name,
            description,
            version,
        } => {
            let code = read_source(&file)?;
            let engine = Engine::detect(config, Arc::new(NoopRegistry))?;
            let mut service = engine.service().await?;

            info!("Building service {}...", name);
            let metadata = ServiceMetadata {
                name,
                description,
                version,
            };
            let handle = service.build_and_run(&code, metadata).await;

            if !handle.is_live() {
                println!("{} {:?}", "Service failed:".red().bold(), handle.status);
                if let Some(error) = &handle.error {
                    println!("{}", error);
                }
                if let Some(log) = &handle.build_log {
                    println!("{}\n{}", "--- build log ---".dimmed(), log);
                }
                service.cleanup().await;
                std::process::exit(1);
            }

            println!("{} {} ({:?})", "Serving at".green().bold(), handle.base_url, handle.status);
            println!("Docs: {}{}", handle.base_url, kiln_core::DOCS_PATH);
            println!("Press Ctrl-C to stop.");

            tokio::signal::ctrl_c().await?;
            println!("Stopping...");
            service.cleanup().await;
            if let Ok(logs) = service.get_logs().await {
                if !logs.is_empty() {
                    println!("{}\n{}", "--- service log ---".dimmed(), logs.trim_end());
                }
            }
        }
        Commands::Doctor => {
            println!("{} {}", "Base image:".bold(), config.sandbox.base_image);
            println!("{} {:?}", "Sandbox dir:".bold(), config.sandbox.base_dir);
            println!(
                "{} {} MB, {} CPUs, {}s",
                "Limits:".bold(),
                config.sandbox.memory_limit_mb,
                config.sandbox.cpu_limit,
                config.sandbox.timeout_seconds
            );

            match DockerCli::detect(config.sandbox.runtime_binary.as_deref()) {
                Ok(cli) => {
                    println!("{} {:?}", "Runtime binary:".bold(), cli.binary());
                    let (available, message) = cli.available().await;
                    let icon = if available { "●".green() } else { "●".red() };
                    println!("{} {} {}", "Daemon:".bold(), icon, message);
                    if !available {
                        std::process::exit(1);
                    }
                }
                Err(e) => {
                    println!("{} {} {}", "Runtime binary:".bold(), "●".red(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Clean => {
            let base_dir = &config.sandbox.base_dir;
            if base_dir.exists() {
                let mut removed = 0;
                for entry in std::fs::read_dir(base_dir)? {
                    let path = entry?.path();
                    if path.is_dir() {
                        match std::fs::remove_dir_all(&path) {
                            Ok(_) => removed += 1,
                            Err(e) => eprintln!("{} {:?}: {}", "Failed to remove".red().bold(), path, e),
                        }
                    }
                }
                println!("{}", format!("Removed {} sandbox directories.", removed).green().bold());
            } else {
                println!("Sandbox directory not found. Nothing to clean.");
            }
        }
        Commands::Submit {
            file,
            server,
            timeout,
        } => {
            let code = read_source(&file)?;
            let client = reqwest::Client::new();
            let url = format!("{}/api/v1/execute", server.trim_end_matches('/'));
            let body = serde_json::json!({ "code": code, "timeout_seconds": timeout });

            let res = client.post(&url).json(&body).send().await?;
            if !res.status().is_success() {
                let err_text = res.text().await?;
                eprintln!("Execution failed: {}", err_text);
                std::process::exit(1);
            }

            let result: ExecutionResult = res.json().await?;
            print_result(&result);
            if !result.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn read_source(file: &PathBuf) -> anyhow::Result<String> {
    std::fs::read_to_string(file).map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", file, e))
}

fn print_result(result: &ExecutionResult) {
    if result.success {
        println!("{}", "Execution Result".green().bold());
    } else {
        println!("{}", "Execution Failed".red().bold());
    }
    println!("{}", result);
}
