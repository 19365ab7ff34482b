//! Firebase Realtime Database relay
//!
//! Uses the database REST API:
//!
//! - `POST {db}/sessions/{sid}/peers/{pid}/inbox.json` appends a message
//! - `GET` with `Accept: text/event-stream` streams inbox changes (SSE)
//! - consumed inbox children are deleted with `DELETE`
//! - member records live under `sessions/{sid}/members/{pid}` and are
//!   written with `PUT`, refreshed by heartbeats and removed with `DELETE`
//!
//! SSE `put`/`patch` events carry `{"path": ..., "data": ...}` relative to
//! the watched node; both are flattened into per-child changes.

use super::channel::{
    inbox_path, member_path, members_path, presence_stream, MemberActivity, PresenceStream,
    SignalStream, SignalingChannel,
};
use super::SignalingMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, trace, warn};
use url::Url;

/// Realtime Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeDbConfig {
    /// Database root, e.g. `https://cloudcounter-default-rtdb.firebaseio.com`
    pub database_url: String,

    /// ID token or database secret appended as `?auth=`
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Timeout for unary requests (publish, presence writes, deletes)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Connect timeout, also applied to streaming subscriptions
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl RealtimeDbConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            auth_token: None,
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.database_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid database_url: {}", e)))?;

        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(Error::InvalidConfig(format!(
                "database_url must be http(s), got: {}",
                url.scheme()
            )));
        }

        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "Realtime Database timeouts must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed a chunk and return every event it completes
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim_end_matches(&['\n', '\r'][..]);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        if event.is_none() && data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
        })
    }
}

/// Change to one direct child of a watched node (`None` means removed)
pub(crate) type ChildChange = (String, Option<Value>);

/// Flatten a `put`/`patch` event into direct child changes.
/// Returns `Ok(None)` for events that carry no data (keep-alive).
pub(crate) fn child_changes(event: &SseEvent) -> Result<Option<Vec<ChildChange>>> {
    match event.event.as_str() {
        "put" | "patch" => {}
        "keep-alive" => return Ok(None),
        "cancel" => {
            return Err(Error::TransportError(format!(
                "Realtime Database cancelled the subscription: {}",
                event.data
            )))
        }
        "auth_revoked" => {
            return Err(Error::TransportError(
                "Realtime Database credential expired".to_string(),
            ))
        }
        other => {
            trace!("ignoring SSE event '{}'", other);
            return Ok(None);
        }
    }

    #[derive(Deserialize)]
    struct Update {
        path: String,
        data: Value,
    }

    let update: Update = serde_json::from_str(&event.data)
        .map_err(|e| Error::ProtocolViolation(format!("Malformed SSE update: {}", e)))?;

    let segments: Vec<&str> = update.path.split('/').filter(|s| !s.is_empty()).collect();
    let patch = event.event == "patch";

    let changes = match segments.as_slice() {
        [] => match update.data {
            Value::Object(children) => children
                .into_iter()
                .map(|(key, value)| (key, (!value.is_null()).then_some(value)))
                .collect(),
            // root replaced with null: every child is gone, callers track what existed
            Value::Null if !patch => vec![(String::new(), None)],
            _ => Vec::new(),
        },
        [child] => vec![(child.to_string(), (!update.data.is_null()).then_some(update.data))],
        // deeper writes only touch fields of an existing child
        [child, ..] => vec![(child.to_string(), Some(Value::Null))],
    };

    Ok(Some(changes))
}

/// New inbox messages in `changes`, tracking keys already handed out
///
/// A key stays in `consumed` until the delete of its child is echoed back.
pub(crate) fn fresh_messages(
    consumed: &mut HashSet<String>,
    changes: Vec<ChildChange>,
) -> Vec<(String, Value)> {
    let mut fresh = Vec::new();
    for (key, value) in changes {
        match value {
            None if key.is_empty() => consumed.clear(),
            None => {
                consumed.remove(&key);
            }
            Some(value) if value.is_null() => {}
            Some(value) => {
                if consumed.insert(key.clone()) {
                    fresh.push((key, value));
                }
            }
        }
    }
    fresh
}

/// Member record changes as presence activity
pub(crate) fn member_activity(changes: Vec<ChildChange>) -> Vec<MemberActivity> {
    changes
        .into_iter()
        .map(|(key, value)| match value {
            Some(_) => MemberActivity::Seen(key),
            None if key.is_empty() => MemberActivity::Cleared,
            None => MemberActivity::Removed(key),
        })
        .collect()
}

/// [`SignalingChannel`] backed by the Firebase Realtime Database REST API
#[derive(Clone)]
pub struct RealtimeDbChannel {
    config: RealtimeDbConfig,
    client: reqwest::Client,
}

impl RealtimeDbChannel {
    pub fn new(config: RealtimeDbConfig) -> Result<Self> {
        config.validate()?;

        // no overall timeout on the client: it would cut SSE streams
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| Error::TransportError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn node_url(&self, path: &str) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{}/{}.json",
            self.config.database_url.trim_end_matches('/'),
            path
        ))
        .map_err(|e| Error::InvalidConfig(format!("Invalid relay path '{}': {}", path, e)))?;

        if let Some(token) = &self.config.auth_token {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    async fn write(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<()> {
        let url = self.node_url(path)?;
        let mut request = self
            .client
            .request(method.clone(), url)
            .timeout(self.request_timeout());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::TransportError(format!(
                "{} {} failed: {} {}",
                method, path, status, text
            )));
        }
        Ok(())
    }

    async fn open_stream(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.node_url(path)?;
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::TransportError(format!(
                "Subscribing to {} failed: {}",
                path,
                response.status()
            )));
        }
        Ok(response)
    }

    /// Drive an SSE response, handing each decoded event to `on_event`.
    /// Stops when `on_event` returns `false`, the receiver side is gone or
    /// the body ends.
    async fn drive_sse<T, F>(
        response: reqwest::Response,
        tx: mpsc::UnboundedSender<Result<T>>,
        mut on_event: F,
    ) where
        F: FnMut(&SseEvent, &mpsc::UnboundedSender<Result<T>>) -> bool,
    {
        let mut body = response.bytes_stream();
        let mut parser = SseParser::default();
        let mut pending = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = tx.closed() => return,
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    // keep partial UTF-8 sequences until the next chunk
                    pending.extend_from_slice(&bytes);
                    let valid = match std::str::from_utf8(&pending) {
                        Ok(text) => text.len(),
                        Err(e) => e.valid_up_to(),
                    };
                    let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
                    pending.drain(..valid);

                    for event in parser.feed(&text) {
                        if !on_event(&event, &tx) {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(Error::TransportError(format!("SSE stream error: {}", e))));
                    return;
                }
                None => {
                    debug!("SSE stream ended");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for RealtimeDbChannel {
    async fn publish(&self, session_id: &str, message: &SignalingMessage) -> Result<()> {
        let path = inbox_path(session_id, &message.to);
        self.write(reqwest::Method::POST, &path, Some(message.to_value()?))
            .await
    }

    async fn subscribe(&self, session_id: &str, peer_id: &str) -> Result<SignalStream> {
        let path = inbox_path(session_id, peer_id);
        let response = self.open_stream(&path).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.clone();

        tokio::spawn(async move {
            let mut consumed: HashSet<String> = HashSet::new();

            Self::drive_sse(response, tx, |event, tx| {
                let changes = match child_changes(event) {
                    Ok(Some(changes)) => changes,
                    Ok(None) => return true,
                    Err(e) => {
                        let fatal = !matches!(e, Error::ProtocolViolation(_));
                        let _ = tx.send(Err(e));
                        return !fatal;
                    }
                };

                for (key, value) in fresh_messages(&mut consumed, changes) {
                    if tx.send(SignalingMessage::from_value(value)).is_err() {
                        return false;
                    }

                    let channel = channel.clone();
                    let child = format!("{}/{}", path, key);
                    tokio::spawn(async move {
                        if let Err(e) = channel.write(reqwest::Method::DELETE, &child, None).await {
                            warn!("Failed to delete consumed message {}: {}", child, e);
                        }
                    });
                }
                true
            })
            .await;
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn announce(&self, session_id: &str, peer_id: &str) -> Result<()> {
        let record = json!({
            "peer_id": peer_id,
            "joined_at": {".sv": "timestamp"},
            "last_seen": {".sv": "timestamp"},
        });
        self.write(reqwest::Method::PUT, &member_path(session_id, peer_id), Some(record))
            .await
    }

    async fn heartbeat(&self, session_id: &str, peer_id: &str) -> Result<()> {
        let record = json!({
            "peer_id": peer_id,
            "last_seen": {".sv": "timestamp"},
        });
        self.write(reqwest::Method::PATCH, &member_path(session_id, peer_id), Some(record))
            .await
    }

    async fn withdraw(&self, session_id: &str, peer_id: &str) -> Result<()> {
        self.write(reqwest::Method::DELETE, &member_path(session_id, peer_id), None)
            .await
    }

    async fn watch_members(&self, session_id: &str, stale_after: Duration) -> Result<PresenceStream> {
        let response = self.open_stream(&members_path(session_id)).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::drive_sse(response, tx, |event, tx| {
            let changes = match child_changes(event) {
                Ok(Some(changes)) => changes,
                Ok(None) => return true,
                Err(e) => {
                    error!("Member watch failed: {}", e);
                    let fatal = !matches!(e, Error::ProtocolViolation(_));
                    let _ = tx.send(Err(e));
                    return !fatal;
                }
            };

            member_activity(changes)
                .into_iter()
                .all(|activity| tx.send(Ok(activity)).is_ok())
        }));

        Ok(presence_stream(rx, stale_after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(event: &str, data: &str) -> SseEvent {
        SseEvent {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed("event: put\ndata: {\"path\":").is_empty());

        let events = parser.feed("\"/\",\"data\":null}\n\nevent: keep-alive\r\ndata: null\r\n\r\n");
        assert_eq!(
            events,
            vec![
                sse("put", "{\"path\":\"/\",\"data\":null}"),
                sse("keep-alive", "null"),
            ]
        );
    }

    #[test]
    fn test_parser_ignores_comments() {
        let mut parser = SseParser::default();
        let events = parser.feed(": ping\n\nevent: put\ndata: {}\n\n");
        assert_eq!(events, vec![sse("put", "{}")]);
    }

    #[test]
    fn test_initial_snapshot_lists_children() {
        let event = sse(
            "put",
            r#"{"path":"/","data":{"-Nabc":{"type":"bye"},"-Nabd":{"type":"offer"}}}"#,
        );
        let changes = child_changes(&event).unwrap().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].0, "-Nabc");
        assert!(changes[0].1.is_some());
    }

    #[test]
    fn test_child_put_and_delete() {
        let added = child_changes(&sse("put", r#"{"path":"/-Nxyz","data":{"type":"bye"}}"#))
            .unwrap()
            .unwrap();
        assert_eq!(added[0].0, "-Nxyz");
        assert!(added[0].1.is_some());

        let removed = child_changes(&sse("put", r#"{"path":"/-Nxyz","data":null}"#))
            .unwrap()
            .unwrap();
        assert_eq!(removed, vec![("-Nxyz".to_string(), None)]);
    }

    #[test]
    fn test_nested_write_touches_child() {
        let changes = child_changes(&sse("put", r#"{"path":"/b/last_seen","data":1700}"#))
            .unwrap()
            .unwrap();
        assert_eq!(changes, vec![("b".to_string(), Some(Value::Null))]);
    }

    #[test]
    fn test_consumed_keys_are_released_on_delete() {
        let mut consumed = HashSet::new();
        let offer = json!({"type": "offer"});

        let fresh = fresh_messages(&mut consumed, vec![("-N1".into(), Some(offer.clone()))]);
        assert_eq!(fresh.len(), 1);

        // redelivery before the delete is echoed
        assert!(fresh_messages(&mut consumed, vec![("-N1".into(), Some(offer))]).is_empty());

        assert!(fresh_messages(&mut consumed, vec![("-N1".into(), None)]).is_empty());
        assert!(consumed.is_empty());

        // field writes and root deletes
        fresh_messages(&mut consumed, vec![("-N2".into(), Some(json!({"type": "bye"})))]);
        assert!(fresh_messages(&mut consumed, vec![("-N2".into(), Some(Value::Null))]).is_empty());
        fresh_messages(&mut consumed, vec![(String::new(), None)]);
        assert!(consumed.is_empty());
    }

    #[test]
    fn test_member_activity() {
        let heartbeat = child_changes(&sse("patch", r#"{"path":"/b","data":{"last_seen":1700}}"#))
            .unwrap()
            .unwrap();
        assert_eq!(member_activity(heartbeat), vec![MemberActivity::Seen("b".into())]);

        let removed = child_changes(&sse("put", r#"{"path":"/b","data":null}"#))
            .unwrap()
            .unwrap();
        assert_eq!(member_activity(removed), vec![MemberActivity::Removed("b".into())]);

        let cleared = child_changes(&sse("put", r#"{"path":"/","data":null}"#))
            .unwrap()
            .unwrap();
        assert_eq!(member_activity(cleared), vec![MemberActivity::Cleared]);
    }

    #[test]
    fn test_keep_alive_and_cancel() {
        assert!(child_changes(&sse("keep-alive", "null")).unwrap().is_none());
        assert!(matches!(
            child_changes(&sse("cancel", "permission denied")),
            Err(Error::TransportError(_))
        ));
        assert!(matches!(
            child_changes(&sse("put", "garbage")),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(RealtimeDbConfig::new("https://example.firebaseio.com").validate().is_ok());
        assert!(RealtimeDbConfig::new("not a url").validate().is_err());
        assert!(RealtimeDbConfig::new("ftp://example.com").validate().is_err());
    }

    #[test]
    fn test_node_url_carries_auth() {
        let channel = RealtimeDbChannel::new(
            RealtimeDbConfig::new("https://example.firebaseio.com/").with_auth_token("secret"),
        )
        .unwrap();
        let url = channel.node_url(&inbox_path("S1", "a")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.firebaseio.com/sessions/S1/peers/a/inbox.json?auth=secret"
        );
    }
}
