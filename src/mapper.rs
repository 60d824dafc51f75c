//! Table-to-topic mapper
//!
//! Remembers topics and schemas for the tables seen on the replication
//! stream. The first schema event for a relation derives the topic name,
//! registers key and value schemas with the registry, and caches the
//! resulting ids; later schema events re-register only when the schema text
//! actually changed. Entries are never evicted during a run.

use crate::errors::{BridgeError, BridgeResult};
use crate::registry::SchemaRegistry;
use crate::types::Oid;
use std::collections::HashMap;
use tracing::{debug, info};

/// Namespace prefix of the record schemas this bridge generates. A schema's
/// namespace has the form `<prefix>.<pg_schema>`, which is how the mapper
/// recovers the originating PostgreSQL schema for topic naming.
pub const GENERATED_SCHEMA_NAMESPACE: &str = "wal2kafka.dbschema";

/// Topic names are clamped to this many bytes, terminator included, to stay
/// within what every broker-side tool accepts.
pub const TOPIC_NAME_BUFFER_LENGTH: usize = 128;

/// Cached per-relation metadata.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    pub relid: Oid,
    /// Topic the relation's changes are produced to.
    pub topic: String,
    /// Registry id of the key schema, when one was registered.
    pub key_schema_id: Option<i32>,
    /// Registry id of the value schema, when one was registered.
    pub value_schema_id: Option<i32>,
    /// Last-registered key schema text (absent for unkeyed tables).
    pub key_schema: Option<String>,
    /// Last-registered value schema text.
    pub value_schema: String,
}

/// Cache from relation id to topic handle and schema ids.
pub struct TableMapper {
    tables: HashMap<Oid, TableMetadata>,
    /// Present only for the binary output format.
    registry: Option<Box<dyn SchemaRegistry>>,
    topic_prefix: Option<String>,
}

impl TableMapper {
    pub fn new(registry: Option<Box<dyn SchemaRegistry>>, topic_prefix: Option<String>) -> Self {
        Self {
            tables: HashMap::new(),
            registry,
            topic_prefix,
        }
    }

    /// Returns the cached metadata for a relation.
    pub fn lookup(&self, relid: Oid) -> BridgeResult<&TableMetadata> {
        self.tables
            .get(&relid)
            .ok_or(BridgeError::UnknownRelation { relid })
    }

    /// Inserts or refreshes the metadata for a relation from its generated
    /// schema texts.
    ///
    /// Unknown relation: derive the topic name from the value schema's
    /// name/namespace, register both schemas, insert. Known relation: compare
    /// the stored schema texts and re-register whichever changed, replacing
    /// its id; an unchanged schema is a no-op. Registration failures surface
    /// to the caller, which applies the configured error policy.
    pub fn update(
        &mut self,
        relid: Oid,
        key_schema: Option<&str>,
        value_schema: &str,
    ) -> BridgeResult<&TableMetadata> {
        if !self.tables.contains_key(&relid) {
            let topic = self.topic_name_from_schema(value_schema)?;
            info!("relation {} will be written to topic \"{}\"", relid, topic);

            let key_schema_id = self.register_key(&topic, key_schema)?;
            let value_schema_id = self.register_value(&topic, value_schema)?;

            self.tables.insert(
                relid,
                TableMetadata {
                    relid,
                    topic,
                    key_schema_id,
                    value_schema_id,
                    key_schema: key_schema.map(str::to_string),
                    value_schema: value_schema.to_string(),
                },
            );
            return self.lookup(relid);
        }

        let (topic, key_changed, value_changed) = {
            let table = &self.tables[&relid];
            (
                table.topic.clone(),
                table.key_schema.as_deref() != key_schema,
                table.value_schema != value_schema,
            )
        };

        if !key_changed && !value_changed {
            debug!("schema for relation {} is unchanged", relid);
            return self.lookup(relid);
        }

        let key_schema_id = if key_changed {
            self.register_key(&topic, key_schema)?
        } else {
            self.tables[&relid].key_schema_id
        };
        let value_schema_id = if value_changed {
            self.register_value(&topic, value_schema)?
        } else {
            self.tables[&relid].value_schema_id
        };

        if let Some(table) = self.tables.get_mut(&relid) {
            if key_changed {
                info!("key schema for topic \"{}\" changed, re-registered", topic);
                table.key_schema = key_schema.map(str::to_string);
                table.key_schema_id = key_schema_id;
            }
            if value_changed {
                info!("value schema for topic \"{}\" changed, re-registered", topic);
                table.value_schema = value_schema.to_string();
                table.value_schema_id = value_schema_id;
            }
        }
        self.lookup(relid)
    }

    fn register_key(&mut self, topic: &str, key_schema: Option<&str>) -> BridgeResult<Option<i32>> {
        match (key_schema, self.registry.as_mut()) {
            (Some(schema), Some(registry)) => {
                Ok(Some(registry.register(&format!("{topic}-key"), schema)?))
            }
            // json format carries no ids; unkeyed tables have no key schema
            _ => Ok(None),
        }
    }

    fn register_value(&mut self, topic: &str, schema: &str) -> BridgeResult<Option<i32>> {
        match self.registry.as_mut() {
            Some(registry) => Ok(Some(registry.register(&format!("{topic}-value"), schema)?)),
            None => Ok(None),
        }
    }

    /// Derives the topic name from a generated record schema's `name` and
    /// `namespace` fields.
    fn topic_name_from_schema(&self, value_schema: &str) -> BridgeResult<String> {
        let parsed: serde_json::Value = serde_json::from_str(value_schema)
            .map_err(|e| BridgeError::protocol(format!("unparseable value schema: {e}")))?;
        let table_name = parsed
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BridgeError::protocol("value schema has no record name"))?;
        let namespace = parsed
            .get("namespace")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        Ok(self.topic_name(namespace, table_name))
    }

    /// The topic naming rule: a table in the `public` schema (or a schema the
    /// generated namespace does not reveal) maps to `<table>`, any other to
    /// `<pg_schema>.<table>`; a configured prefix is prepended with a dot.
    pub fn topic_name(&self, namespace: &str, table_name: &str) -> String {
        let pg_schema = namespace
            .strip_prefix(GENERATED_SCHEMA_NAMESPACE)
            .and_then(|rest| rest.strip_prefix('.'));

        let mut topic = match pg_schema {
            None | Some("public") => table_name.to_string(),
            Some(pg_schema) => format!("{pg_schema}.{table_name}"),
        };

        if let Some(prefix) = &self.topic_prefix {
            topic = format!("{prefix}.{topic}");
        }

        while topic.len() > TOPIC_NAME_BUFFER_LENGTH - 1 {
            topic.pop();
        }
        topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn mapper(prefix: Option<&str>) -> TableMapper {
        TableMapper::new(
            Some(Box::new(MemoryRegistry::new())),
            prefix.map(str::to_string),
        )
    }

    fn schema(namespace: &str, name: &str, marker: &str) -> String {
        format!(
            "{{\"type\":\"record\",\"name\":\"{name}\",\"namespace\":\"{GENERATED_SCHEMA_NAMESPACE}.{namespace}\",\"fields\":[{marker}]}}"
        )
    }

    #[test]
    fn test_topic_name_rule() {
        let mapper = mapper(None);
        assert_eq!(
            mapper.topic_name("wal2kafka.dbschema.public", "users"),
            "users"
        );
        assert_eq!(
            mapper.topic_name("wal2kafka.dbschema.billing", "invoices"),
            "billing.invoices"
        );
        // a namespace that doesn't match the generated prefix contributes
        // nothing
        assert_eq!(mapper.topic_name("something.else", "users"), "users");
        assert_eq!(mapper.topic_name("", "users"), "users");
    }

    #[test]
    fn test_topic_name_with_prefix() {
        let mapper = mapper(Some("pg"));
        assert_eq!(
            mapper.topic_name("wal2kafka.dbschema.public", "users"),
            "pg.users"
        );
        assert_eq!(
            mapper.topic_name("wal2kafka.dbschema.billing", "invoices"),
            "pg.billing.invoices"
        );
    }

    #[test]
    fn test_topic_name_is_clamped() {
        let mapper = mapper(None);
        let long_name = "t".repeat(400);
        let topic = mapper.topic_name("wal2kafka.dbschema.public", &long_name);
        assert_eq!(topic.len(), TOPIC_NAME_BUFFER_LENGTH - 1);
    }

    #[test]
    fn test_update_registers_and_caches() {
        let mut mapper = mapper(None);
        let value = schema("public", "users", "1");
        let key = schema("public", "users", "0");

        let table = mapper.update(1, Some(&key), &value).unwrap();
        assert_eq!(table.topic, "users");
        let key_id = table.key_schema_id.unwrap();
        let value_id = table.value_schema_id.unwrap();
        assert_ne!(key_id, value_id);

        let table = mapper.lookup(1).unwrap();
        assert_eq!(table.value_schema, value);
    }

    #[test]
    fn test_update_with_unchanged_schema_is_a_noop() {
        let mut mapper = mapper(None);
        let value = schema("public", "users", "1");

        let first_id = mapper.update(1, None, &value).unwrap().value_schema_id;
        let second_id = mapper.update(1, None, &value).unwrap().value_schema_id;
        assert_eq!(first_id, second_id);
    }

    #[test]
    fn test_changed_value_schema_gets_new_id() {
        let mut mapper = mapper(None);
        let key = schema("public", "users", "0");
        let before = schema("public", "users", "1");
        let after = schema("public", "users", "2");

        let first = mapper.update(1, Some(&key), &before).unwrap();
        let (first_key, first_value) = (first.key_schema_id, first.value_schema_id);

        let second = mapper.update(1, Some(&key), &after).unwrap();
        // the key schema did not change, so its id is stable
        assert_eq!(second.key_schema_id, first_key);
        assert_ne!(second.value_schema_id, first_value);
    }

    #[test]
    fn test_lookup_unknown_relation() {
        let mapper = mapper(None);
        assert!(matches!(
            mapper.lookup(42),
            Err(BridgeError::UnknownRelation { relid: 42 })
        ));
    }

    #[test]
    fn test_json_mode_has_no_ids() {
        let mut mapper = TableMapper::new(None, None);
        let key = schema("public", "users", "0");
        let value = schema("public", "users", "1");
        let table = mapper.update(1, Some(&key), &value).unwrap();
        assert_eq!(table.key_schema_id, None);
        assert_eq!(table.value_schema_id, None);
    }
}
