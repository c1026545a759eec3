use crate::cli::{Cli, Command};
use crate::config::{AccountConfig, AppConfig};
use crate::message::ParsedMessage;
use crate::provider;
use crate::registry::ConnectionRegistry;
use crate::session::{self, SessionHandler};
use crate::types::{ConnectionState, StatusEvent};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How long `sync` waits for the first connect before giving up.
const SYNC_CONNECT_WAIT: Duration = Duration::from_secs(60);

pub async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;

    let command = cli.command.unwrap_or(Command::Watch {
        accounts: Vec::new(),
    });
    match command {
        Command::Watch { accounts } => watch(&config, &accounts).await,
        Command::Test { account } => test(&config, &account).await,
        Command::Sync { account, days } => sync(&config, &account, days).await,
        Command::Providers => {
            providers(&config);
            Ok(())
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Line<'a> {
    Message {
        account: &'a str,
        #[serde(flatten)]
        message: &'a ParsedMessage,
    },
    Status {
        account: &'a str,
        #[serde(flatten)]
        status: &'a StatusEvent,
    },
}

/// Writes every callback as one JSON object per line on stdout.
struct JsonLines;

impl JsonLines {
    fn emit(&self, line: &Line<'_>) {
        match serde_json::to_string(line) {
            Ok(json) => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{json}");
            }
            Err(e) => warn!(error = %e, "Could not serialize event"),
        }
    }
}

impl SessionHandler for JsonLines {
    fn on_new_message(&self, account_id: &str, message: ParsedMessage) {
        self.emit(&Line::Message {
            account: account_id,
            message: &message,
        });
    }

    fn on_status_changed(&self, account_id: &str, status: &StatusEvent) {
        self.emit(&Line::Status {
            account: account_id,
            status,
        });
    }
}

fn select<'a>(config: &'a AppConfig, ids: &[String]) -> Result<Vec<&'a AccountConfig>> {
    if ids.is_empty() {
        return Ok(config.accounts.iter().filter(|a| a.enabled).collect());
    }
    ids.iter()
        .map(|id| {
            config
                .account(id)
                .with_context(|| format!("unknown account {id}"))
        })
        .collect()
}

async fn watch(config: &AppConfig, ids: &[String]) -> Result<()> {
    let accounts: Vec<AccountConfig> = select(config, ids)?.into_iter().cloned().collect();
    if accounts.is_empty() {
        warn!("No enabled accounts configured");
        return Ok(());
    }

    let registry = ConnectionRegistry::new(config.options.clone(), Arc::new(JsonLines));
    let failed = registry.start_all(&accounts).await;
    info!(
        accounts = accounts.len(),
        failed = failed.len(),
        "Watching; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down");
    registry.stop_all().await;
    Ok(())
}

async fn test(config: &AppConfig, id: &str) -> Result<()> {
    let account = config
        .account(id)
        .with_context(|| format!("unknown account {id}"))?;
    let profile = provider::profile_for(&account.credentials);
    match session::test_connection(&account.credentials, &config.options).await {
        Ok(()) => {
            println!("{id}: ok ({})", profile.name);
            Ok(())
        }
        Err(e) => {
            let class = profile.classify(&e);
            bail!("{id}: {}", class.message)
        }
    }
}

async fn sync(config: &AppConfig, id: &str, days: Option<u32>) -> Result<()> {
    let account = config
        .account(id)
        .with_context(|| format!("unknown account {id}"))?
        .clone();

    let mut options = config.options.clone();
    options.auto_reconnect = false;
    let registry = ConnectionRegistry::new(options, Arc::new(JsonLines));
    registry.start_account(&account).await?;

    let started = tokio::time::timeout(SYNC_CONNECT_WAIT, async {
        while registry.state(id) != Some(ConnectionState::Connected) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if started.is_err() {
        registry.stop_all().await;
        bail!("{id}: not connected after {SYNC_CONNECT_WAIT:?}");
    }

    let sink = JsonLines;
    let report = registry
        .sync_history(id, days, |batch| {
            info!(account = id, messages = batch.len(), "History batch");
            for message in &batch {
                sink.emit(&Line::Message {
                    account: id,
                    message,
                });
            }
        })
        .await;
    registry.stop_all().await;

    let report = report?;
    eprintln!(
        "{id}: found {}, synced {}, oversized {}, failed {}",
        report.total_found,
        report.total_synced,
        report.oversized.len(),
        report.failed.len()
    );
    Ok(())
}

fn providers(config: &AppConfig) {
    for account in &config.accounts {
        let p = provider::profile_for(&account.credentials);
        println!(
            "{:<16} {:<28} {:<8} {:?} (push reliability {}%)",
            account.id, account.credentials.address, p.name, p.features.strategy, p.features.push_reliability
        );
    }
}
