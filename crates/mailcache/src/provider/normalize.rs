//! Gmail API response normalization
//!
//! Converts Gmail API messages to provider-neutral `RemoteEmail` values.

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::{TimeZone, Utc};

use super::api::{GmailMessage, Header, MessagePart, MessagePayload};
use crate::models::{AttachmentMeta, EmailAddress, EmailBody, RemoteEmail, parse_address_list};

/// Normalize a Gmail API message
///
/// Bodies are only present when the message was fetched with
/// `MessageFormat::Full`; metadata fetches yield `body: None`.
pub fn normalize_message(gmail_msg: GmailMessage) -> Result<RemoteEmail> {
    let payload = gmail_msg
        .payload
        .as_ref()
        .with_context(|| format!("Message {} has no payload", gmail_msg.id))?;
    let headers = payload.headers.as_deref().unwrap_or_default();

    let from = extract_header(headers, "From")
        .map(|s| EmailAddress::parse(&s))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com"));
    let to = extract_header(headers, "To")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();
    let cc = extract_header(headers, "Cc")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();
    let subject = extract_header(headers, "Subject").unwrap_or_default();

    // internalDate is milliseconds since epoch
    let internal_date: i64 = gmail_msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);
    let received_at = Utc
        .timestamp_millis_opt(internal_date)
        .single()
        .unwrap_or_else(Utc::now);

    let has_list_unsubscribe = extract_header(headers, "List-Unsubscribe").is_some();
    let is_bulk = is_bulk_mail(headers);

    let body = EmailBody {
        text: extract_body(payload, "text/plain"),
        html: extract_body(payload, "text/html"),
    };
    let body = if body.is_empty() { None } else { Some(body) };

    let mut attachments = Vec::new();
    if let Some(parts) = &payload.parts {
        collect_attachments(parts, &mut attachments);
    }

    Ok(RemoteEmail::builder(gmail_msg.id.clone(), gmail_msg.thread_id.clone())
        .from(from)
        .to(to)
        .cc(cc)
        .subject(subject)
        .snippet(decode_html_entities(&gmail_msg.snippet))
        .received_at(received_at)
        .label_ids(gmail_msg.label_ids.unwrap_or_default())
        .attachments(attachments)
        .list_unsubscribe(has_list_unsubscribe)
        .bulk(is_bulk)
        .body(body)
        .build())
}

/// Extract a header value by name
fn extract_header(headers: &[Header], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// `Precedence: bulk|list|junk` or any `List-Id` marks mailing-list traffic
fn is_bulk_mail(headers: &[Header]) -> bool {
    if extract_header(headers, "List-Id").is_some() {
        return true;
    }
    extract_header(headers, "Precedence").is_some_and(|p| {
        matches!(
            p.trim().to_ascii_lowercase().as_str(),
            "bulk" | "list" | "junk"
        )
    })
}

/// Find the first body of the given MIME type, top level first
fn extract_body(payload: &MessagePayload, mime: &str) -> Option<String> {
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && payload
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with(mime))
    {
        return decode_base64_body(data);
    }

    payload
        .parts
        .as_deref()
        .and_then(|parts| find_body_in_parts(parts, mime))
}

/// Recursively search message parts for inline content of a MIME type
fn find_body_in_parts(parts: &[MessagePart], mime: &str) -> Option<String> {
    for part in parts {
        let is_attachment = part.filename.as_deref().is_some_and(|f| !f.is_empty());
        if !is_attachment
            && part.mime_type.as_ref().is_some_and(|m| m.starts_with(mime))
            && let Some(body) = &part.body
            && let Some(data) = &body.data
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        if let Some(nested) = &part.parts
            && let Some(text) = find_body_in_parts(nested, mime)
        {
            return Some(text);
        }
    }

    None
}

/// Collect attachment metadata from every part that carries a filename
fn collect_attachments(parts: &[MessagePart], out: &mut Vec<AttachmentMeta>) {
    for part in parts {
        if let Some(filename) = part.filename.as_deref()
            && !filename.is_empty()
        {
            let body = part.body.as_ref();
            out.push(AttachmentMeta {
                filename: filename.to_string(),
                mime_type: part
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: body.and_then(|b| b.size).unwrap_or(0),
                remote_attachment_id: body
                    .and_then(|b| b.attachment_id.clone())
                    .unwrap_or_default(),
            });
        }

        if let Some(nested) = &part.parts {
            collect_attachments(nested, out);
        }
    }
}

/// Decode base64-encoded body data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
fn decode_base64_body(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders
        .iter()
        .find_map(|decoder| decoder.decode(data).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
}

/// Decode HTML entities in snippet text
fn decode_html_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}
