//! Bridge configuration
//!
//! Collects the validated runtime configuration from the command line:
//! upstream connection, replication slot and publication, broker list,
//! schema registry, output format, error policy, and pass-through producer
//! and topic configuration pairs.

use crate::errors::{BridgeError, BridgeResult};
use std::str::FromStr;

/// Replication slot created (or reused) on the upstream server.
pub const DEFAULT_REPLICATION_SLOT: &str = "bottledwater";
/// Publication the pgoutput stream is filtered by.
pub const DEFAULT_PUBLICATION: &str = "wal2kafka";
/// Comma-separated Kafka bootstrap brokers.
pub const DEFAULT_BROKER_LIST: &str = "localhost:9092";
/// Confluent-compatible schema registry, used only for the binary format.
pub const DEFAULT_SCHEMA_REGISTRY: &str = "http://localhost:8081";

/// How messages are encoded for writing to Kafka.
///
/// `Binary` frames each payload with a registry schema id (see
/// `encoder::encode_framed`); `Json` writes the self-describing textual
/// representation as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Binary,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Binary => "binary",
            OutputFormat::Json => "json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = BridgeError;

    fn from_str(s: &str) -> BridgeResult<Self> {
        match s {
            "binary" => Ok(OutputFormat::Binary),
            "json" => Ok(OutputFormat::Json),
            other => Err(BridgeError::config(format!(
                "invalid output format (expected binary or json): {other}"
            ))),
        }
    }
}

/// What to do in case of a transient error, such as failure to publish to
/// Kafka.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log the error and keep going. A failed delivery is treated as
    /// acknowledged so the checkpointer does not stall.
    Log,
    /// Treat the error as fatal.
    Exit,
}

impl ErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPolicy::Log => "log",
            ErrorPolicy::Exit => "exit",
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> BridgeResult<Self> {
        match s {
            "log" => Ok(ErrorPolicy::Log),
            "exit" => Ok(ErrorPolicy::Exit),
            other => Err(BridgeError::config(format!(
                "invalid error policy (expected log or exit): {other}"
            ))),
        }
    }
}

/// Validated runtime configuration for the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// PostgreSQL connection string or URI.
    pub conninfo: String,
    /// Name of the logical replication slot.
    pub slot_name: String,
    /// Name of the publication streamed through the slot.
    pub publication: String,
    /// Comma-separated list of Kafka broker host:port pairs.
    pub brokers: String,
    /// Schema registry base URL; present only for the binary format.
    pub registry_url: Option<String>,
    pub output_format: OutputFormat,
    /// Allow export of tables that don't have a primary key.
    pub allow_unkeyed: bool,
    /// String prepended (with a dot) to all topic names.
    pub topic_prefix: Option<String>,
    pub error_policy: ErrorPolicy,
    /// Skip the consistent snapshot even if the slot was newly created.
    pub skip_snapshot: bool,
    /// Pass-through global producer configuration properties.
    pub kafka_config: Vec<(String, String)>,
    /// Pass-through topic configuration properties.
    pub topic_config: Vec<(String, String)>,
}

impl BridgeConfig {
    /// Builds and validates the configuration from raw option values.
    ///
    /// The registry URL defaults for the binary format; specifying one
    /// together with the json format is rejected, since json messages never
    /// reference registered schema ids.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conninfo: String,
        slot_name: String,
        publication: String,
        brokers: String,
        registry_url: Option<String>,
        output_format: &str,
        allow_unkeyed: bool,
        topic_prefix: Option<String>,
        error_policy: &str,
        skip_snapshot: bool,
        kafka_config: &[String],
        topic_config: &[String],
    ) -> BridgeResult<Self> {
        let output_format = OutputFormat::from_str(output_format)?;
        let error_policy = ErrorPolicy::from_str(error_policy)?;

        let registry_url = match (output_format, registry_url) {
            (OutputFormat::Binary, Some(url)) => Some(url),
            (OutputFormat::Binary, None) => Some(DEFAULT_SCHEMA_REGISTRY.to_string()),
            (OutputFormat::Json, Some(_)) => {
                return Err(BridgeError::config(
                    "specifying --schema-registry doesn't make sense for --output-format=json",
                ));
            }
            (OutputFormat::Json, None) => None,
        };

        if conninfo.is_empty() {
            return Err(BridgeError::config(
                "missing PostgreSQL connection string (--postgres)",
            ));
        }

        Ok(Self {
            conninfo,
            slot_name,
            publication,
            brokers,
            registry_url,
            output_format,
            allow_unkeyed,
            topic_prefix,
            error_policy,
            skip_snapshot,
            kafka_config: parse_config_pairs(kafka_config)?,
            topic_config: parse_config_pairs(topic_config)?,
        })
    }
}

/// Splits an option string of the form `property=value`.
pub fn parse_config_pair(option: &str) -> BridgeResult<(String, String)> {
    match option.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(BridgeError::config(format!(
            "expected configuration in the form property=value, not \"{option}\""
        ))),
    }
}

fn parse_config_pairs(options: &[String]) -> BridgeResult<Vec<(String, String)>> {
    options.iter().map(|o| parse_config_pair(o)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(format: &str, registry: Option<String>) -> BridgeResult<BridgeConfig> {
        BridgeConfig::new(
            "postgres://localhost/test".to_string(),
            DEFAULT_REPLICATION_SLOT.to_string(),
            DEFAULT_PUBLICATION.to_string(),
            DEFAULT_BROKER_LIST.to_string(),
            registry,
            format,
            false,
            None,
            "exit",
            false,
            &[],
            &[],
        )
    }

    #[test]
    fn test_parse_config_pair() {
        assert_eq!(
            parse_config_pair("compression.codec=snappy").unwrap(),
            ("compression.codec".to_string(), "snappy".to_string())
        );
        // values may contain an equals sign
        assert_eq!(
            parse_config_pair("sasl.jaas=a=b").unwrap(),
            ("sasl.jaas".to_string(), "a=b".to_string())
        );
        assert!(parse_config_pair("no-equals-sign").is_err());
        assert!(parse_config_pair("=value").is_err());
    }

    #[test]
    fn test_binary_format_defaults_registry() {
        let config = base_config("binary", None).unwrap();
        assert_eq!(config.registry_url.as_deref(), Some(DEFAULT_SCHEMA_REGISTRY));
    }

    #[test]
    fn test_json_format_rejects_registry() {
        assert!(base_config("json", Some("http://example:8081".to_string())).is_err());
        let config = base_config("json", None).unwrap();
        assert_eq!(config.registry_url, None);
    }

    #[test]
    fn test_invalid_enums_rejected() {
        assert!(base_config("avro2", None).is_err());
        assert!(ErrorPolicy::from_str("panic").is_err());
        assert_eq!(ErrorPolicy::from_str("log").unwrap(), ErrorPolicy::Log);
        assert_eq!(OutputFormat::from_str("json").unwrap(), OutputFormat::Json);
    }
}
