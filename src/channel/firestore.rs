//! Hosted backend: Cloud Firestore over its REST API.
//!
//! The REST surface has no push listeners, so subscriptions poll and only
//! deliver when the result differs from the previous delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::{MessageChannel, MessageSnapshot, PresenceChannel, Subscription};
use crate::common::{
    ChatMessage, MessageStatus, NewMessage, Participant, PresenceRecord, StatusUpdate,
};
use crate::error::ChannelError;

const FIRESTORE_API_BASE: &str = "https://firestore.googleapis.com/v1";
const MESSAGES: &str = "messages";
const PRESENCE: &str = "presence";
const PRESENCE_PAGE_SIZE: &str = "300";

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub api_key: Option<String>,
    pub database: String,
    pub poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
    create_time: Option<DateTime<Utc>>,
    /// Kept verbatim so it can be echoed back as a write precondition.
    update_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<Document>,
    next_page_token: Option<String>,
}

#[derive(Clone)]
pub struct FirestoreChannel {
    client: reqwest::Client,
    config: Arc<FirestoreConfig>,
}

impl FirestoreChannel {
    pub fn new(config: FirestoreConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    fn database_path(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.config.project_id, self.config.database
        )
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!("{}/{collection}/{id}", self.database_path())
    }

    fn url(&self, suffix: &str) -> String {
        format!("{FIRESTORE_API_BASE}/{}{suffix}", self.database_path())
    }

    fn with_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.query(&[("key", key.as_str())]),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ChannelError> {
        let response = self.with_key(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ChannelError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    /// Single write that also stamps `timestamp_field` with the server clock.
    async fn commit_with_server_time(
        &self,
        name: String,
        fields: Value,
        timestamp_field: &str,
        must_not_exist: bool,
    ) -> Result<(), ChannelError> {
        let mut write = json!({
            "update": { "name": name, "fields": fields },
            "updateTransforms": [
                { "fieldPath": timestamp_field, "setToServerValue": "REQUEST_TIME" }
            ],
        });
        if must_not_exist {
            write["currentDocument"] = json!({ "exists": false });
        }

        self.send(
            self.client
                .post(self.url(":commit"))
                .json(&json!({ "writes": [write] })),
        )
        .await?;
        Ok(())
    }

    async fn list_presence(&self) -> Result<Vec<PresenceRecord>, ChannelError> {
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(self.url(&format!("/{PRESENCE}")))
                .query(&[("pageSize", PRESENCE_PAGE_SIZE)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: ListDocumentsResponse = self.send(request).await?.json().await?;
            records.extend(page.documents.iter().filter_map(|doc| {
                decode_presence(doc)
                    .map_err(|err| log::warn!("Skipping presence document {}: {err}", doc.name))
                    .ok()
            }));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        records.sort_by(|a, b| a.contact_id.cmp(&b.contact_id));
        Ok(records)
    }

    /// Polls `read` and forwards changed results until the handle is dropped.
    fn poll<T, F, Fut>(&self, read: F) -> Subscription<T>
    where
        T: Clone + PartialEq + Send + 'static,
        F: Fn(FirestoreChannel) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, ChannelError>> + Send + 'static,
    {
        let channel = self.clone();
        let period = self.config.poll_interval;

        Subscription::spawn(move |sender| async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last: Option<T> = None;

            loop {
                interval.tick().await;
                let delivery = match read(channel.clone()).await {
                    Ok(current) if last.as_ref() == Some(&current) => continue,
                    Ok(current) => {
                        last = Some(current.clone());
                        Ok(current)
                    }
                    Err(err) => Err(err),
                };
                if sender.send(delivery).await.is_err() {
                    return;
                }
            }
        })
    }
}

#[async_trait]
impl MessageChannel for FirestoreChannel {
    async fn create(&self, message: NewMessage) -> Result<String, ChannelError> {
        let id = Uuid::new_v4().simple().to_string();
        self.commit_with_server_time(
            self.document_name(MESSAGES, &id),
            encode_message(&message),
            "timestamp",
            true,
        )
        .await?;
        log::debug!("Created message {id} in {}", message.conversation_id);
        Ok(id)
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<bool, ChannelError> {
        let not_found = || ChannelError::NotFound(update.message_id.clone());
        let url = self.url(&format!("/{MESSAGES}/{}", update.message_id));
        let doc: Document = match self.send(self.client.get(url)).await {
            Ok(response) => response.json().await?,
            Err(ChannelError::Rejected { status: 404, .. }) => return Err(not_found()),
            Err(err) => return Err(err),
        };

        let Some(write) = status_write(&doc, update) else {
            log::debug!(
                "Message {} already moved past {}; skipping write",
                update.message_id,
                update.from
            );
            return Ok(false);
        };

        let request = self
            .client
            .post(self.url(":commit"))
            .json(&json!({ "writes": [write] }));
        match self.send(request).await {
            Ok(_) => Ok(true),
            Err(ChannelError::Rejected { status, message })
                if is_precondition_failure(status, &message) =>
            {
                log::debug!("Message {} changed concurrently; skipping write", update.message_id);
                Ok(false)
            }
            Err(ChannelError::Rejected { status: 404, .. }) => Err(not_found()),
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, message_id: &str) -> Result<(), ChannelError> {
        self.send(
            self.client
                .delete(self.url(&format!("/{MESSAGES}/{message_id}"))),
        )
        .await?;
        Ok(())
    }

    async fn query(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ChannelError> {
        let body = json!({
            "structuredQuery": {
                "from": [{ "collectionId": MESSAGES }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": "chatId" },
                        "op": "EQUAL",
                        "value": string_value(conversation_id),
                    }
                },
                "orderBy": [{
                    "field": { "fieldPath": "timestamp" },
                    "direction": "DESCENDING",
                }],
            }
        });

        let items: Vec<RunQueryItem> = self
            .send(self.client.post(self.url(":runQuery")).json(&body))
            .await?
            .json()
            .await?;

        Ok(items
            .iter()
            .filter_map(|item| item.document.as_ref())
            .filter_map(|doc| {
                decode_message(doc)
                    .map_err(|err| log::warn!("Skipping message document {}: {err}", doc.name))
                    .ok()
            })
            .collect())
    }

    fn subscribe_conversation(&self, conversation_id: &str) -> Subscription<MessageSnapshot> {
        let conversation_id = conversation_id.to_string();
        self.poll(move |channel| {
            let conversation_id = conversation_id.clone();
            async move {
                let messages = channel.query(&conversation_id).await?;
                Ok(MessageSnapshot {
                    conversation_id,
                    messages,
                })
            }
        })
    }
}

#[async_trait]
impl PresenceChannel for FirestoreChannel {
    async fn upsert(&self, participant: &Participant) -> Result<(), ChannelError> {
        let fields = json!({
            "name": string_value(&participant.display_name),
            "phone": string_value(&participant.contact_id),
        });
        self.commit_with_server_time(
            self.document_name(PRESENCE, &participant.contact_id),
            fields,
            "lastActive",
            false,
        )
        .await
    }

    fn subscribe_presence(&self) -> Subscription<Vec<PresenceRecord>> {
        self.poll(|channel| async move { channel.list_presence().await })
    }
}

fn string_value(value: &str) -> Value {
    json!({ "stringValue": value })
}

fn encode_message(message: &NewMessage) -> Value {
    json!({
        "content": string_value(&message.content),
        "senderName": string_value(&message.sender_display_name),
        "senderPhone": string_value(&message.sender_contact_id),
        "chatId": string_value(&message.conversation_id),
        "status": string_value(MessageStatus::Sent.as_str()),
    })
}

/// Commit write moving `status` from `update.from` to `update.to`, guarded
/// by the document's update time. `None` if the stored status differs.
fn status_write(doc: &Document, update: &StatusUpdate) -> Option<Value> {
    let stored = string_field(doc, "status")
        .and_then(MessageStatus::parse)
        .unwrap_or(MessageStatus::Sent);
    if stored != update.from {
        return None;
    }

    let mut write = json!({
        "update": {
            "name": doc.name,
            "fields": { "status": string_value(update.to.as_str()) },
        },
        "updateMask": { "fieldPaths": ["status"] },
    });
    write["currentDocument"] = match &doc.update_time {
        Some(update_time) => json!({ "updateTime": update_time }),
        None => json!({ "exists": true }),
    };
    Some(write)
}

fn is_precondition_failure(status: u16, message: &str) -> bool {
    status == 409 || (status == 400 && message.contains("FAILED_PRECONDITION"))
}

fn document_id(doc: &Document) -> &str {
    doc.name.rsplit('/').next().unwrap_or(&doc.name)
}

fn string_field<'a>(doc: &'a Document, field: &str) -> Option<&'a str> {
    doc.fields
        .get(field)
        .and_then(|value| value.get("stringValue"))
        .and_then(Value::as_str)
}

fn timestamp_field(doc: &Document, field: &str) -> Option<DateTime<Utc>> {
    doc.fields
        .get(field)
        .and_then(|value| value.get("timestampValue"))
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
}

fn required<'a>(doc: &'a Document, field: &str) -> Result<&'a str, ChannelError> {
    string_field(doc, field).ok_or_else(|| ChannelError::Malformed(format!("missing `{field}`")))
}

fn decode_message(doc: &Document) -> Result<ChatMessage, ChannelError> {
    let status = match string_field(doc, "status").and_then(MessageStatus::parse) {
        Some(status) => status,
        None => {
            log::debug!("Message {} has no known status; treating as sent", doc.name);
            MessageStatus::Sent
        }
    };
    let created_at = timestamp_field(doc, "timestamp")
        .or(doc.create_time)
        .ok_or_else(|| ChannelError::Malformed("missing `timestamp`".into()))?;

    Ok(ChatMessage {
        id: document_id(doc).to_string(),
        conversation_id: required(doc, "chatId")?.to_string(),
        sender_contact_id: required(doc, "senderPhone")?.to_string(),
        sender_display_name: string_field(doc, "senderName").unwrap_or_default().to_string(),
        content: string_field(doc, "content").unwrap_or_default().to_string(),
        created_at,
        status,
    })
}

fn decode_presence(doc: &Document) -> Result<PresenceRecord, ChannelError> {
    let contact_id = string_field(doc, "phone").unwrap_or_else(|| document_id(doc));
    if contact_id.is_empty() {
        return Err(ChannelError::Malformed("empty contact id".into()));
    }
    Ok(PresenceRecord {
        contact_id: contact_id.to_string(),
        display_name: string_field(doc, "name").unwrap_or_default().to_string(),
        last_active_at: timestamp_field(doc, "lastActive"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn document(raw: Value) -> Document {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn decodes_message_document() {
        let doc = document(json!({
            "name": "projects/p/databases/(default)/documents/messages/abc123",
            "fields": {
                "content": { "stringValue": "hello" },
                "senderName": { "stringValue": "Amina" },
                "senderPhone": { "stringValue": "111" },
                "chatId": { "stringValue": "111_222" },
                "status": { "stringValue": "delivered" },
                "timestamp": { "timestampValue": "2024-03-01T10:15:30.123456Z" }
            },
            "createTime": "2024-03-01T10:15:30.200000Z"
        }));

        let message = decode_message(&doc).unwrap();
        assert_eq!(message.id, "abc123");
        assert_eq!(message.conversation_id, "111_222");
        assert_eq!(message.sender_contact_id, "111");
        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(
            message.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap()
                + chrono::Duration::microseconds(123_456)
        );
    }

    #[test]
    fn message_without_status_is_sent_and_falls_back_to_create_time() {
        let doc = document(json!({
            "name": "projects/p/databases/(default)/documents/messages/m1",
            "fields": {
                "senderPhone": { "stringValue": "222" },
                "chatId": { "stringValue": "111_222" }
            },
            "createTime": "2024-03-01T10:00:00Z"
        }));

        let message = decode_message(&doc).unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.content, "");
        assert_eq!(
            message.created_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn message_without_chat_id_is_rejected() {
        let doc = document(json!({
            "name": "projects/p/databases/(default)/documents/messages/m1",
            "fields": { "senderPhone": { "stringValue": "222" } },
            "createTime": "2024-03-01T10:00:00Z"
        }));

        assert!(matches!(decode_message(&doc), Err(ChannelError::Malformed(_))));
    }

    #[test]
    fn presence_with_pending_timestamp_decodes() {
        let doc = document(json!({
            "name": "projects/p/databases/(default)/documents/presence/0712",
            "fields": { "name": { "stringValue": "Bashir" } }
        }));

        let record = decode_presence(&doc).unwrap();
        assert_eq!(
            record,
            PresenceRecord {
                contact_id: "0712".into(),
                display_name: "Bashir".into(),
                last_active_at: None,
            }
        );
    }

    fn delivered_document() -> Document {
        document(json!({
            "name": "projects/p/databases/(default)/documents/messages/m7",
            "fields": {
                "senderPhone": { "stringValue": "111" },
                "chatId": { "stringValue": "111_222" },
                "status": { "stringValue": "delivered" }
            },
            "createTime": "2024-03-01T10:00:00Z",
            "updateTime": "2024-03-01T10:05:00.123456789Z"
        }))
    }

    #[test]
    fn status_write_is_guarded_by_update_time() {
        let update = StatusUpdate {
            message_id: "m7".into(),
            from: MessageStatus::Delivered,
            to: MessageStatus::Read,
        };

        let write = status_write(&delivered_document(), &update).unwrap();
        assert_eq!(write["update"]["fields"]["status"]["stringValue"], "read");
        assert_eq!(write["updateMask"]["fieldPaths"], json!(["status"]));
        assert_eq!(
            write["currentDocument"]["updateTime"],
            "2024-03-01T10:05:00.123456789Z"
        );
    }

    #[test]
    fn status_write_from_stale_status_is_skipped() {
        let stale = StatusUpdate {
            message_id: "m7".into(),
            from: MessageStatus::Sent,
            to: MessageStatus::Delivered,
        };

        assert_eq!(status_write(&delivered_document(), &stale), None);
        assert!(is_precondition_failure(400, "FAILED_PRECONDITION: stale"));
        assert!(!is_precondition_failure(400, "INVALID_ARGUMENT"));
    }

    #[test]
    fn new_message_is_encoded_with_wire_field_names() {
        let encoded = encode_message(&NewMessage {
            conversation_id: "111_222".into(),
            sender_contact_id: "111".into(),
            sender_display_name: "Amina".into(),
            content: "hello".into(),
        });

        assert_eq!(encoded["chatId"]["stringValue"], "111_222");
        assert_eq!(encoded["senderPhone"]["stringValue"], "111");
        assert_eq!(encoded["senderName"]["stringValue"], "Amina");
        assert_eq!(encoded["status"]["stringValue"], "sent");
        assert!(encoded.get("timestamp").is_none());
    }

    #[test]
    fn urls_point_at_configured_database() {
        let channel = FirestoreChannel::new(FirestoreConfig {
            project_id: "machakos-community-chat".into(),
            api_key: None,
            database: "(default)".into(),
            poll_interval: Duration::from_secs(2),
        });

        assert_eq!(
            channel.url(":runQuery"),
            "https://firestore.googleapis.com/v1/projects/machakos-community-chat/databases/(default)/documents:runQuery"
        );
        assert_eq!(
            channel.document_name(PRESENCE, "111"),
            "projects/machakos-community-chat/databases/(default)/documents/presence/111"
        );
    }
}
