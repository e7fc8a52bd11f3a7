//! Lazily fetched email bodies

use anyhow::{Result, anyhow};

use crate::credentials::CredentialStore;
use crate::models::{EmailBody, EmailId};
use crate::provider::{MailProvider, MessageFormat, normalize_message};
use crate::storage::SqliteMailStore;

/// Body of an email, fetched from the provider on first access
///
/// The fetched body is stored compressed; later calls never hit the
/// provider. A message without any text part caches an empty body.
pub fn fetch_body(
    store: &SqliteMailStore,
    credentials: &CredentialStore,
    provider: &dyn MailProvider,
    email_id: EmailId,
) -> Result<EmailBody> {
    if let Some(body) = store.get_body(email_id)? {
        return Ok(body);
    }

    let (account_id, remote_id) = store
        .email_remote_ref(email_id)?
        .ok_or_else(|| anyhow!("Email {} not found", email_id.0))?;
    let token = credentials.get_valid_token(account_id)?;
    let message = provider.get_message(&token, &remote_id, MessageFormat::Full)?;
    let body = normalize_message(message)?.body.unwrap_or_default();

    store.store_body(email_id, &body)?;
    log::debug!("[QUERY] Cached body of email {}", email_id.0);
    Ok(body)
}
