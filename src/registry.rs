//! Schema registry client
//!
//! Submits generated schemas to a Confluent-compatible registry and records
//! the integer ids the registry assigns. Registration is at-least-once:
//! submitting identical schema text for a subject again returns the same id,
//! so re-registering after a restart is harmless.

use crate::errors::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Maps schema text to a stable integer id, keyed by subject.
pub trait SchemaRegistry {
    fn register(&mut self, subject: &str, schema: &str) -> BridgeResult<i32>;
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    schema: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: i32,
}

/// HTTP client for the registry's `POST /subjects/{subject}/versions`
/// endpoint.
pub struct HttpSchemaRegistry {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpSchemaRegistry {
    pub fn new(url: &str) -> BridgeResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BridgeError::config(format!("failed to build registry client: {e}")))?;

        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl SchemaRegistry for HttpSchemaRegistry {
    fn register(&mut self, subject: &str, schema: &str) -> BridgeResult<i32> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        debug!("registering schema for subject {}", subject);

        let registry_error = |message: String| BridgeError::SchemaRegistry {
            subject: subject.to_string(),
            message,
        };

        let response = self
            .client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/vnd.schemaregistry.v1+json",
            )
            .json(&RegisterRequest { schema })
            .send()
            .map_err(|e| registry_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(registry_error(format!(
                "registry returned HTTP {status}: {body}"
            )));
        }

        let parsed: RegisterResponse = response
            .json()
            .map_err(|e| registry_error(format!("unparseable registry response: {e}")))?;

        debug!("subject {} registered with schema id {}", subject, parsed.id);
        Ok(parsed.id)
    }
}

/// In-memory registry used by tests. Mirrors the real registry's
/// idempotence: the same (subject, schema text) pair always yields the same
/// id, while changed text yields a fresh one.
#[cfg(test)]
pub struct MemoryRegistry {
    assigned: std::collections::HashMap<(String, String), i32>,
    next_id: i32,
    pub register_calls: usize,
}

#[cfg(test)]
impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            assigned: std::collections::HashMap::new(),
            next_id: 1,
            register_calls: 0,
        }
    }
}

#[cfg(test)]
impl SchemaRegistry for MemoryRegistry {
    fn register(&mut self, subject: &str, schema: &str) -> BridgeResult<i32> {
        self.register_calls += 1;
        let key = (subject.to_string(), schema.to_string());
        if let Some(id) = self.assigned.get(&key) {
            return Ok(*id);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.assigned.insert(key, id);
        Ok(id)
    }
}
