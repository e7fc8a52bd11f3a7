//! mailcached - background mailbox sync daemon
//!
//! Keeps the local cache of every registered account up to date, sends
//! scheduled emails and fires reminders until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use mailcache::{
    Engine, EngineConfig, GmailClient, MailEvent, OAuthClientCredentials, SqliteMailStore,
    TokenCipher,
};

const DATABASE_FILE: &str = "mail.db";
const KEY_FILE: &str = "token.key";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run().await {
        error!("mailcached failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let engine_config = EngineConfig::load()?;
    let credentials = match OAuthClientCredentials::load() {
        Ok(creds) => creds,
        Err(e) => {
            if let Some(path) = OAuthClientCredentials::default_credentials_path() {
                warn!(
                    "To configure Gmail access, either:\n\
                     1. Place your Google OAuth credentials at: {}\n\
                     2. Or set environment variables: GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                    path.display()
                );
            }
            return Err(e.context("Gmail credentials not found"));
        }
    };

    let data_dir = config::ensure_data_dir()?;
    let store = SqliteMailStore::open(data_dir.join(DATABASE_FILE))
        .context("Failed to open mail database")?;
    let cipher = TokenCipher::load_or_create(&data_dir.join(KEY_FILE))
        .context("Failed to load token key")?;
    info!("[BOOT] Data directory: {}", data_dir.display());

    let engine = Engine::new(
        engine_config,
        Arc::new(store),
        cipher,
        Arc::new(GmailClient::new(credentials)),
        tokio::runtime::Handle::current(),
    );
    engine.subscribe(|event: &MailEvent| match event {
        MailEvent::AccountStatusChanged {
            account_id,
            state,
            last_error: Some(message),
        } => warn!("Account {} is {:?}: {}", account_id, state, message),
        MailEvent::ReminderDue(reminder) => info!("Reminder: {}", reminder.note),
        _ => {}
    });

    let accounts = engine.list_accounts()?;
    if accounts.is_empty() {
        warn!("No accounts registered; nothing to sync");
    }
    engine.start()?;
    info!("[BOOT] Syncing {} accounts", accounts.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    engine.shutdown();
    Ok(())
}
