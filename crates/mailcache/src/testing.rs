//! In-memory provider used by unit tests

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::provider::api::{
    GmailMessage, Header, HistoryLabelChange, HistoryMessage, HistoryRecord, HistoryResponse,
    ListLabelsResponse, ListMessagesResponse, MessageBody, MessagePayload, MessageRef,
    ProfileResponse, TokenGrant,
};
use crate::provider::{MailProvider, MessageFormat, OutboundSender, ProviderError};

#[derive(Default)]
struct FakeState {
    messages: BTreeMap<String, GmailMessage>,
    history: Vec<HistoryRecord>,
    history_id: u64,
    /// Records up to this id have been expired by the provider
    history_floor: u64,
    /// Errors returned by the next calls, in order
    injected: VecDeque<ProviderError>,
    /// Ids whose next `get_message` fails transiently
    flaky: Vec<String>,
    refresh_calls: usize,
    deny_refresh: bool,
    modify_calls: Vec<(String, Vec<String>, Vec<String>)>,
    trashed: Vec<String>,
    sent: Vec<Vec<u8>>,
    get_message_calls: usize,
}

/// A mailbox that records history like Gmail does
#[derive(Default)]
pub(crate) struct FakeProvider {
    state: Mutex<FakeState>,
}

pub(crate) fn gmail_message(id: &str, from: &str, subject: &str, labels: &[&str]) -> GmailMessage {
    GmailMessage {
        id: id.to_string(),
        thread_id: format!("t-{}", id),
        label_ids: Some(labels.iter().map(|l| l.to_string()).collect()),
        snippet: format!("snippet {}", id),
        history_id: None,
        internal_date: Some("1714564800000".to_string()),
        payload: Some(MessagePayload {
            headers: Some(vec![
                Header {
                    name: "From".into(),
                    value: from.into(),
                },
                Header {
                    name: "To".into(),
                    value: "me@example.com".into(),
                },
                Header {
                    name: "Subject".into(),
                    value: subject.into(),
                },
            ]),
            body: Some(MessageBody {
                size: Some(0),
                data: None,
                attachment_id: None,
            }),
            parts: None,
            mime_type: Some("text/plain".into()),
            filename: None,
        }),
    }
}

fn message_ref(id: &str) -> MessageRef {
    MessageRef {
        id: id.to_string(),
        thread_id: None,
    }
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        let provider = Self::default();
        provider.with_state(|s| s.history_id = 100);
        provider
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn take_injected(&self) -> Result<(), ProviderError> {
        match self.with_state(|s| s.injected.pop_front()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record(state: &mut FakeState, mut record: HistoryRecord) {
        state.history_id += 1;
        record.id = state.history_id.to_string();
        state.history.push(record);
    }

    pub(crate) fn add_message(&self, id: &str, from: &str, subject: &str, labels: &[&str]) {
        self.with_state(|s| {
            s.messages
                .insert(id.to_string(), gmail_message(id, from, subject, labels));
            Self::record(
                s,
                HistoryRecord {
                    messages_added: Some(vec![HistoryMessage {
                        message: message_ref(id),
                    }]),
                    ..Default::default()
                },
            );
        });
    }

    pub(crate) fn set_labels(&self, id: &str, labels: &[&str]) {
        self.with_state(|s| {
            if let Some(message) = s.messages.get_mut(id) {
                message.label_ids = Some(labels.iter().map(|l| l.to_string()).collect());
            }
            Self::record(
                s,
                HistoryRecord {
                    labels_added: Some(vec![HistoryLabelChange {
                        message: message_ref(id),
                        label_ids: Some(labels.iter().map(|l| l.to_string()).collect()),
                    }]),
                    ..Default::default()
                },
            );
        });
    }

    pub(crate) fn delete_message(&self, id: &str) {
        self.with_state(|s| {
            s.messages.remove(id);
            Self::record(
                s,
                HistoryRecord {
                    messages_deleted: Some(vec![HistoryMessage {
                        message: message_ref(id),
                    }]),
                    ..Default::default()
                },
            );
        });
    }

    /// Swap the stored copy of a message without recording history
    pub(crate) fn replace_message(&self, message: GmailMessage) {
        self.with_state(|s| {
            s.messages.insert(message.id.clone(), message);
        });
    }

    /// Forget all history so stored cursors become invalid
    pub(crate) fn expire_history(&self) {
        self.with_state(|s| s.history_floor = s.history_id);
    }

    pub(crate) fn inject_error(&self, error: ProviderError) {
        self.with_state(|s| s.injected.push_back(error));
    }

    pub(crate) fn fail_once(&self, id: &str) {
        self.with_state(|s| s.flaky.push(id.to_string()));
    }

    pub(crate) fn deny_refresh(&self) {
        self.with_state(|s| s.deny_refresh = true);
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.with_state(|s| s.refresh_calls)
    }

    pub(crate) fn get_message_calls(&self) -> usize {
        self.with_state(|s| s.get_message_calls)
    }

    pub(crate) fn modify_calls(&self) -> Vec<(String, Vec<String>, Vec<String>)> {
        self.with_state(|s| s.modify_calls.clone())
    }

    pub(crate) fn trashed(&self) -> Vec<String> {
        self.with_state(|s| s.trashed.clone())
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.with_state(|s| s.sent.clone())
    }

    pub(crate) fn labels_of(&self, id: &str) -> Vec<String> {
        self.with_state(|s| {
            s.messages
                .get(id)
                .and_then(|m| m.label_ids.clone())
                .unwrap_or_default()
        })
    }
}

impl MailProvider for FakeProvider {
    fn get_profile(&self, _token: &str) -> Result<ProfileResponse, ProviderError> {
        self.take_injected()?;
        Ok(self.with_state(|s| ProfileResponse {
            email_address: "me@example.com".to_string(),
            messages_total: Some(s.messages.len() as u64),
            history_id: s.history_id.to_string(),
        }))
    }

    fn list_messages(
        &self,
        _token: &str,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse, ProviderError> {
        self.take_injected()?;
        let offset: usize = page_token.and_then(|p| p.parse().ok()).unwrap_or(0);
        Ok(self.with_state(|s| {
            // Newest first
            let ids: Vec<&String> = s.messages.keys().rev().collect();
            let page: Vec<MessageRef> = ids
                .iter()
                .skip(offset)
                .take(max_results)
                .map(|id| message_ref(id))
                .collect();
            let next = offset + page.len();
            ListMessagesResponse {
                next_page_token: (next < ids.len()).then(|| next.to_string()),
                result_size_estimate: Some(ids.len() as u32),
                messages: Some(page),
            }
        }))
    }

    fn get_message(
        &self,
        _token: &str,
        remote_id: &str,
        _format: MessageFormat,
    ) -> Result<GmailMessage, ProviderError> {
        self.take_injected()?;
        self.with_state(|s| {
            s.get_message_calls += 1;
            if let Some(pos) = s.flaky.iter().position(|id| id == remote_id) {
                s.flaky.remove(pos);
                return Err(ProviderError::Transient("flaky".to_string()));
            }
            s.messages.get(remote_id).cloned().ok_or(ProviderError::NotFound)
        })
    }

    fn list_history(
        &self,
        _token: &str,
        start_history_id: &str,
        _page_token: Option<&str>,
    ) -> Result<HistoryResponse, ProviderError> {
        self.take_injected()?;
        let start: u64 = start_history_id
            .parse()
            .map_err(|_| ProviderError::CursorInvalid)?;
        self.with_state(|s| {
            if start < s.history_floor {
                return Err(ProviderError::CursorInvalid);
            }
            let records: Vec<HistoryRecord> = s
                .history
                .iter()
                .filter(|r| r.id.parse::<u64>().is_ok_and(|id| id > start))
                .cloned()
                .collect();
            Ok(HistoryResponse {
                history: Some(records),
                next_page_token: None,
                history_id: Some(s.history_id.to_string()),
            })
        })
    }

    fn list_labels(&self, _token: &str) -> Result<ListLabelsResponse, ProviderError> {
        Ok(ListLabelsResponse::default())
    }

    fn modify_labels(
        &self,
        _token: &str,
        remote_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ProviderError> {
        self.take_injected()?;
        let labels = self.with_state(|s| {
            s.modify_calls
                .push((remote_id.to_string(), add.to_vec(), remove.to_vec()));
            let message = s.messages.get_mut(remote_id).ok_or(ProviderError::NotFound)?;
            let mut labels = message.label_ids.clone().unwrap_or_default();
            labels.retain(|l| !remove.contains(l));
            for label in add {
                if !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
            message.label_ids = Some(labels.clone());
            Ok(labels)
        })?;
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        self.set_labels(remote_id, &labels);
        Ok(())
    }

    fn trash_message(&self, token: &str, remote_id: &str) -> Result<(), ProviderError> {
        self.with_state(|s| s.trashed.push(remote_id.to_string()));
        self.modify_labels(token, remote_id, &["TRASH".to_string()], &["INBOX".to_string()])
    }

    fn refresh_token(&self, _refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        // Widen the window for concurrent callers
        std::thread::sleep(Duration::from_millis(20));
        self.with_state(|s| {
            s.refresh_calls += 1;
            if s.deny_refresh {
                return Err(ProviderError::RefreshDenied("invalid_grant".to_string()));
            }
            Ok(TokenGrant {
                access_token: format!("access-{}", s.refresh_calls),
                refresh_token: None,
                expires_in: Some(3600),
            })
        })
    }
}

impl OutboundSender for FakeProvider {
    fn send_raw(&self, _token: &str, raw_message: &[u8]) -> Result<(), ProviderError> {
        self.take_injected()?;
        self.with_state(|s| s.sent.push(raw_message.to_vec()));
        Ok(())
    }
}
