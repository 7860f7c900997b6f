//! CLI command handling
//!
//! Dispatches CLI commands and formats their output. Every handler returns
//! the process exit code.

use std::time::Duration;

use colored::Colorize;

use crate::auth::{AdminSecret, CredentialBroker};
use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::pipeline::{Pipeline, RunOptions};
use crate::process::{procfs, ProcessSupervisor};
use crate::synth::{ConfigDocument, DocumentFormat, KeyPath, Mutation, Node};
use crate::watch::{wait_for_marker, FileFollower, MarkerPattern};

/// Grace period for processes stopped by `reclaim-port`
const RECLAIM_GRACE: Duration = Duration::from_secs(5);

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            config,
            secondary,
            skip_install,
            report,
        } => {
            let config = Config::load(config.as_deref())?;
            let pipeline = Pipeline::new(
                config,
                RunOptions {
                    secondary,
                    skip_install,
                },
            )?;
            let outcome = pipeline.run_until(shutdown_signal()).await;

            outcome.print_summary();
            outcome.print_failure_log();
            if let Some(path) = report {
                match outcome.write_json(&path) {
                    Ok(()) => println!("Report written to {}", path.display()),
                    Err(e) => eprintln!("Warning: could not write report: {e}"),
                }
            }
            Ok(outcome.exit_code())
        }

        Commands::ReclaimPort { ports } => {
            let mut supervisor = ProcessSupervisor::new(RECLAIM_GRACE);
            for port in ports {
                let killed = supervisor.reclaim_port(port).await?;
                if killed.is_empty() {
                    println!("{} port {} is free", "✓".green(), port);
                } else {
                    println!("{} port {} freed (killed {:?})", "✓".green(), port, killed);
                }
            }
            Ok(0)
        }

        Commands::PortOwners { port } => {
            let owners = procfs::port_owners(port)?;
            if owners.is_empty() {
                println!("No process is bound to port {port}");
            }
            for pid in owners {
                println!("{pid}");
            }
            Ok(0)
        }

        Commands::Extract {
            file,
            label,
            regex,
            timeout,
        } => {
            let pattern = match (regex, label) {
                (Some(re), _) => MarkerPattern::regex(&re)?,
                (None, Some(label)) => MarkerPattern::label(label),
                (None, None) => {
                    return Err(Error::Config("one of --label or --regex is required".to_string()))
                }
            };
            let budget = Duration::from_secs(timeout);
            let mut follower = FileFollower::new(&file);
            let result = wait_for_marker(&mut follower, &pattern, budget).await?;
            println!("{}", result.into_value(&pattern.describe(), budget)?);
            Ok(0)
        }

        Commands::Login {
            url,
            username,
            password,
            timeout,
        } => {
            let broker = CredentialBroker::new(Duration::from_secs(timeout))?;
            let token = broker
                .login(&url, &username, &AdminSecret::new(password))
                .await?;
            println!("{}", token.expose());
            Ok(0)
        }

        Commands::Synthesize {
            template,
            output,
            set,
            merge,
            ensure,
        } => {
            let mutations = cli_mutations(&ensure, &merge, &set)?;
            let mut document = ConfigDocument::load(&template)?;
            document.apply(&mutations)?;
            document.set_format(DocumentFormat::from_path(&output)?);
            document.write(&output)?;
            println!(
                "{} wrote {} ({} mutation(s))",
                "✓".green(),
                output.display(),
                mutations.len()
            );
            Ok(0)
        }
    }
}

/// Build mutations from `--ensure`, `--merge` and `--set` arguments
fn cli_mutations(ensure: &[String], merge: &[String], set: &[String]) -> Result<Vec<Mutation>> {
    let mut mutations: Vec<Mutation> = ensure
        .iter()
        .map(|path| Mutation::ensure_path(path.as_str()))
        .collect();

    for arg in merge {
        let (path, json) = split_assignment(arg)?;
        let entries = match parse_value(json) {
            Node::Map(entries) => entries,
            other => {
                return Err(Error::Config(format!(
                    "--merge {arg}: expected a JSON object, got a {}",
                    other.kind()
                )))
            }
        };
        mutations.push(Mutation::MergeMap {
            path: KeyPath::parse(path),
            entries,
        });
    }

    for arg in set {
        let (path, value) = split_assignment(arg)?;
        mutations.push(Mutation::set_scalar(path, parse_value(value)));
    }
    Ok(mutations)
}

fn split_assignment(arg: &str) -> Result<(&str, &str)> {
    arg.split_once('=')
        .ok_or_else(|| Error::Config(format!("expected PATH=VALUE, got '{arg}'")))
}

/// JSON if it parses, otherwise the raw text as a string
fn parse_value(text: &str) -> Node {
    serde_json::from_str::<serde_json::Value>(text)
        .map(Node::from)
        .unwrap_or_else(|_| Node::from(text))
}

/// Resolves with the signal name on SIGINT or SIGTERM
#[cfg(unix)]
async fn shutdown_signal() -> String {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(mut sigint), Ok(mut sigterm)) => tokio::select! {
            _ = sigint.recv() => "SIGINT".to_string(),
            _ = sigterm.recv() => "SIGTERM".to_string(),
        },
        _ => {
            tracing::warn!("could not install signal handlers; interrupts will not trigger teardown");
            std::future::pending().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> String {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    "Ctrl-C".to_string()
}
