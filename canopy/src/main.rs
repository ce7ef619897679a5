mod cli;
mod client;
mod output;

use canopy_core::{Command, HealthResponse, ListResponse, LogsResponse, Response, ServerInfo, server_id};
use clap::Parser;
use cli::{Cli, Commands, ProxyAction};
use client::DaemonClient;
use console::style;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {e}", style("error:").red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let socket = match cli.socket {
        Some(path) => path,
        None => client::default_socket_path()?,
    };

    match cli.command {
        Commands::Start {
            path,
            run,
            args,
            ready_sentinel,
        } => {
            let path = resolve_worktree(&path)?;
            let mut daemon = DaemonClient::ensure(&socket).await?;
            let resp = daemon
                .request(&Command::Start {
                    path: path.to_string_lossy().to_string(),
                    run,
                    args,
                    ready_sentinel,
                })
                .await?;
            let info: ServerInfo = expect_data(resp)?;
            output::print_server(&info);
        }

        Commands::Stop { path } => {
            let path = resolve_worktree(&path)?;
            let mut daemon = DaemonClient::ensure(&socket).await?;
            let resp = daemon
                .request(&Command::Stop {
                    id: server_id(&path),
                })
                .await?;
            expect_ok(resp)?;
            println!("stopped {}", path.display());
        }

        Commands::Status { path } => {
            let path = resolve_worktree(&path)?;
            let mut daemon = DaemonClient::ensure(&socket).await?;
            let resp = daemon
                .request(&Command::Get {
                    id: server_id(&path),
                })
                .await?;
            let info: ServerInfo = expect_data(resp)?;
            output::print_server(&info);
        }

        Commands::List => {
            let mut daemon = DaemonClient::ensure(&socket).await?;
            let resp = daemon.request(&Command::List).await?;
            let list: ListResponse = expect_data(resp)?;
            output::print_servers(&list.servers);
        }

        Commands::Logs { path, tail, follow } => {
            let path = resolve_worktree(&path)?;
            let mut daemon = DaemonClient::ensure(&socket).await?;
            let command = Command::Logs {
                id: server_id(&path),
                tail,
                follow,
            };
            if follow {
                daemon
                    .stream(&command, |resp| match resp {
                        Response::Ok { data } => {
                            // First response carries the backlog, the rest
                            // are single streamed lines.
                            if data.get("logs").is_some() {
                                if let Ok(backlog) =
                                    serde_json::from_value::<LogsResponse>(data)
                                {
                                    for line in &backlog.logs {
                                        output::print_log_line(line);
                                    }
                                }
                            } else if let Ok(line) = serde_json::from_value(data) {
                                output::print_log_line(&line);
                            }
                        }
                        Response::Error { message } => {
                            eprintln!("{} {message}", style("error:").red().bold());
                        }
                    })
                    .await?;
            } else {
                let resp = daemon.request(&command).await?;
                let logs: LogsResponse = expect_data(resp)?;
                for line in &logs.logs {
                    output::print_log_line(line);
                }
            }
        }

        Commands::Proxy { action } => match action {
            ProxyAction::Enable { path } => {
                let path = resolve_worktree(&path)?;
                let mut daemon = DaemonClient::ensure(&socket).await?;
                let resp = daemon
                    .request(&Command::ProxyEnable {
                        id: server_id(&path),
                    })
                    .await?;
                expect_ok(resp)?;
                println!("proxy enabled for {}", path.display());
            }
            ProxyAction::Disable { path } => {
                let path = resolve_worktree(&path)?;
                let mut daemon = DaemonClient::ensure(&socket).await?;
                let resp = daemon
                    .request(&Command::ProxyDisable {
                        id: server_id(&path),
                    })
                    .await?;
                expect_ok(resp)?;
                println!("proxy disabled for {}", path.display());
            }
        },

        Commands::Health => {
            let mut daemon = DaemonClient::ensure(&socket).await?;
            let resp = daemon.request(&Command::Health).await?;
            let health: HealthResponse = expect_data(resp)?;
            println!(
                "daemon {} ({} managed server{})",
                style(&health.status).green(),
                health.server_count,
                if health.server_count == 1 { "" } else { "s" }
            );
        }

        Commands::Shutdown => {
            // Do not spawn a daemon just to shut it down.
            match DaemonClient::connect(&socket).await {
                Ok(mut daemon) => {
                    let resp = daemon.request(&Command::Shutdown).await?;
                    expect_ok(resp)?;
                    println!("daemon shutting down (managed servers keep running)");
                }
                Err(_) => println!("daemon is not running"),
            }
        }
    }

    Ok(())
}

fn resolve_worktree(path: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    std::fs::canonicalize(path)
        .map_err(|e| format!("cannot resolve worktree path {}: {e}", path.display()).into())
}

fn expect_data<T: DeserializeOwned>(resp: Response) -> Result<T, Box<dyn std::error::Error>> {
    match resp {
        Response::Ok { data } => Ok(serde_json::from_value(data)?),
        Response::Error { message } => Err(message.into()),
    }
}

fn expect_ok(resp: Response) -> Result<(), Box<dyn std::error::Error>> {
    match resp {
        Response::Ok { .. } => Ok(()),
        Response::Error { message } => Err(message.into()),
    }
}
