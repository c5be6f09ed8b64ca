//! Append-only event streams, one pair per project: a project-wide updates
//! stream and a per-deployment status stream. Entry ids are Redis stream
//! ids (`<unix_ms>-<seq>`) and are opaque to consumers; readers resume by
//! passing the last id they saw.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use strum::Display;

use crate::error::Result;

/// Streams are trimmed approximately; this keeps far more than the 15
/// minutes of history reconnecting clients need.
const STREAM_MAXLEN: usize = 4096;

/// Id that reads a stream from its beginning.
pub const STREAM_START: &str = "0-0";

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    DeploymentCreation,
    DeploymentStatusUpdate,
    DeploymentRollback,
}

/// One bus event. Serialized as flat string fields so any stream consumer
/// can read it without a schema.
#[derive(Clone, Debug)]
pub struct Event {
    pub event_type: EventType,
    pub project_id: String,
    pub deployment_id: String,
    pub deployment_status: Option<String>,
    pub environment_id: Option<String>,
    pub previous_deployment_id: Option<String>,
}

impl Event {
    pub fn creation(project_id: &str, deployment_id: &str) -> Self {
        Self {
            event_type: EventType::DeploymentCreation,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
            deployment_status: None,
            environment_id: None,
            previous_deployment_id: None,
        }
    }

    pub fn status_update(
        project_id: &str,
        deployment_id: &str,
        status: impl ToString,
    ) -> Self {
        Self {
            event_type: EventType::DeploymentStatusUpdate,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
            deployment_status: Some(status.to_string()),
            environment_id: None,
            previous_deployment_id: None,
        }
    }

    pub fn rollback(
        project_id: &str,
        environment_id: &str,
        deployment_id: &str,
        previous_deployment_id: Option<&str>,
    ) -> Self {
        Self {
            event_type: EventType::DeploymentRollback,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.to_string(),
            deployment_status: None,
            environment_id: Some(environment_id.to_string()),
            previous_deployment_id: previous_deployment_id.map(str::to_string),
        }
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("event_type", self.event_type.to_string()),
            ("project_id", self.project_id.clone()),
            ("deployment_id", self.deployment_id.clone()),
            (
                "timestamp",
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
        ];
        if let Some(status) = &self.deployment_status {
            fields.push(("deployment_status", status.clone()));
        }
        if let Some(environment_id) = &self.environment_id {
            fields.push(("environment_id", environment_id.clone()));
        }
        if let Some(previous) = &self.previous_deployment_id {
            fields.push(("previous_deployment_id", previous.clone()));
        }

        fields
    }
}

/// One stream entry as read back from Redis.
#[derive(Clone, Debug)]
pub struct Entry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl Entry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

pub fn updates_key(project_id: &str) -> String {
    format!("stream:project:{project_id}:updates")
}

pub fn status_key(project_id: &str, deployment_id: &str) -> String {
    format!("stream:project:{project_id}:deployment:{deployment_id}:status")
}

#[derive(Clone)]
pub struct EventBus {
    redis: ConnectionManager,
}

impl EventBus {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Append to the project updates stream.
    pub async fn publish_update(&self, event: &Event) -> Result<String> {
        self.append(&updates_key(&event.project_id), event).await
    }

    /// Append a status transition to both the per-deployment stream and the
    /// project updates stream, in that order.
    pub async fn publish_status(&self, event: &Event) -> Result<()> {
        self.append(
            &status_key(&event.project_id, &event.deployment_id),
            event,
        )
        .await?;
        self.append(&updates_key(&event.project_id), event).await?;

        Ok(())
    }

    async fn append(&self, key: &str, event: &Event) -> Result<String> {
        let mut redis = self.redis.clone();
        let id: String = redis
            .xadd_maxlen(key, StreamMaxlen::Approx(STREAM_MAXLEN), "*", &event.fields())
            .await?;

        Ok(id)
    }

    /// Read entries after `from`, blocking up to `block_ms` for new ones.
    pub async fn read_blocking(
        &self,
        key: &str,
        from: &str,
        block_ms: usize,
    ) -> Result<Vec<Entry>> {
        let options = StreamReadOptions::default().block(block_ms).count(100);
        self.read(key, from, options).await
    }

    /// Read whatever is buffered after `from` without waiting.
    pub async fn read_available(&self, key: &str, from: &str) -> Result<Vec<Entry>> {
        let options = StreamReadOptions::default().count(100);
        self.read(key, from, options).await
    }

    async fn read(&self, key: &str, from: &str, options: StreamReadOptions) -> Result<Vec<Entry>> {
        let mut redis = self.redis.clone();
        let reply: StreamReadReply = redis.xread_options(&[key], &[from], &options).await?;

        let mut entries = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let fields = entry
                    .map
                    .iter()
                    .filter_map(|(name, value)| {
                        redis::from_redis_value::<String>(value)
                            .ok()
                            .map(|value| (name.clone(), value))
                    })
                    .collect();
                entries.push(Entry {
                    id: entry.id,
                    fields,
                });
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keys_are_scoped_per_project_and_deployment() {
        assert_eq!(updates_key("p1"), "stream:project:p1:updates");
        assert_eq!(
            status_key("p1", "d1"),
            "stream:project:p1:deployment:d1:status"
        );
    }

    #[test]
    fn events_serialize_their_optional_fields() {
        let event = Event::status_update("p1", "d1", "in_progress");
        let fields: HashMap<_, _> = event.fields().into_iter().collect();

        assert_eq!(fields["event_type"], "deployment_status_update");
        assert_eq!(fields["deployment_status"], "in_progress");
        assert!(!fields.contains_key("previous_deployment_id"));

        let event = Event::rollback("p1", "prod", "d1", Some("d2"));
        let fields: HashMap<_, _> = event.fields().into_iter().collect();
        assert_eq!(fields["event_type"], "deployment_rollback");
        assert_eq!(fields["previous_deployment_id"], "d2");
        assert_eq!(fields["environment_id"], "prod");
    }

    #[test]
    fn timestamps_are_rfc3339_utc() {
        let event = Event::creation("p1", "d1");
        let fields: HashMap<_, _> = event.fields().into_iter().collect();
        assert!(fields["timestamp"].ends_with('Z'));
    }
}
