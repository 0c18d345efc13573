//! Connection and topology configuration.
//!
//! Every type here deserializes from JSON with camelCase keys (serde), so a
//! whole topology can be described in a config file and applied with
//! [`Bus::configure`](crate::Bus::configure). The legacy option names
//! `queueLimit` and `alternateExchange` are accepted as aliases.
//!
//! Transport layers are responsible for interpreting [`ConnectionConfig`]
//! into concrete connection settings; this module only builds the
//! [`Endpoint`] list they are handed.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::domain::{Endpoint, ExchangeDef, ExchangeKind, QueueDef};
use crate::retry::{millis, BackoffConfig};
use crate::{BusError, Result};

fn default_name() -> String {
    "default".to_string()
}

fn default_servers() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_ports() -> Vec<u16> {
    vec![5672]
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "%2f".to_string()
}

fn default_ack_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_true() -> bool {
    true
}

/// Broker connection parameters.
///
/// Hosts and ports are combined into a round-robin endpoint list: every
/// server is tried on every port before the list wraps around.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    // ---
    /// Logical connection name, used in logs and errors.
    #[serde(default = "default_name")]
    pub name: String,

    /// Broker host names, tried in order.
    #[serde(default = "default_servers", alias = "server")]
    pub servers: Vec<String>,

    /// Broker ports, tried in order for each host.
    #[serde(default = "default_ports", alias = "port")]
    pub ports: Vec<u16>,

    #[serde(default = "default_guest")]
    pub user: String,

    #[serde(default = "default_guest")]
    pub pass: String,

    /// Virtual host, already URI encoded (`%2f` for `/`).
    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Explicit connection URI. When set, servers/ports/credentials are
    /// ignored and this is the only endpoint.
    #[serde(default)]
    pub uri: Option<String>,

    /// Heartbeat interval in seconds.
    #[serde(default)]
    pub heartbeat: Option<u16>,

    /// Failed attempts tolerated during the initial connect. The effective
    /// limit is never lower than the number of endpoints.
    #[serde(default)]
    pub retry_limit: Option<u32>,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// How often queues resolve their pending acknowledgements.
    #[serde(default = "default_ack_interval", with = "millis")]
    pub ack_interval: Duration,

    /// Open publishing channels in confirm mode.
    #[serde(default = "default_true")]
    pub publish_confirms: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        // ---
        Self {
            name: default_name(),
            servers: default_servers(),
            ports: default_ports(),
            user: default_guest(),
            pass: default_guest(),
            vhost: default_vhost(),
            uri: None,
            heartbeat: None,
            retry_limit: None,
            backoff: BackoffConfig::default(),
            ack_interval: default_ack_interval(),
            publish_confirms: true,
        }
    }
}

impl ConnectionConfig {
    /// Create a config for a single broker URI.
    pub fn with_uri(name: impl Into<String>, uri: impl Into<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            uri: Some(uri.into()),
            ..Self::default()
        }
    }

    /// Create a config for a set of hosts on the default port.
    pub fn with_servers<I, S>(name: impl Into<String>, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // ---
        Self {
            name: name.into(),
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the ports each server is tried on.
    pub fn with_ports(mut self, ports: impl Into<Vec<u16>>) -> Self {
        self.ports = ports.into();
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = user.into();
        self.pass = pass.into();
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_heartbeat(mut self, secs: u16) -> Self {
        self.heartbeat = Some(secs);
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the acknowledgement batching interval.
    ///
    /// Default: 500ms
    pub fn with_ack_interval(mut self, interval: Duration) -> Self {
        self.ack_interval = interval;
        self
    }

    pub fn with_publish_confirms(mut self, enabled: bool) -> Self {
        self.publish_confirms = enabled;
        self
    }

    /// Parse a connection config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        // ---
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // ---
        if self.uri.is_none() && (self.servers.is_empty() || self.ports.is_empty()) {
            return Err(BusError::Config(format!(
                "connection '{}' needs a uri or at least one server and port",
                self.name
            )));
        }
        Ok(())
    }

    /// Round-robin endpoint list: each server on each port.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        // ---
        if let Some(uri) = &self.uri {
            return vec![Endpoint {
                host: uri.clone(),
                port: 0,
                uri: uri.clone(),
            }];
        }

        let query = match self.heartbeat {
            Some(secs) => format!("?heartbeat={secs}"),
            None => String::new(),
        };

        self.servers
            .iter()
            .flat_map(|host| {
                self.ports.iter().map(move |port| (host, *port))
            })
            .map(|(host, port)| Endpoint {
                host: host.clone(),
                port,
                uri: format!(
                    "amqp://{}:{}@{}:{}/{}{}",
                    self.user, self.pass, host, port, self.vhost, query
                ),
            })
            .collect()
    }

    /// Number of failed initial attempts tolerated before giving up.
    pub fn attempt_limit(&self) -> u32 {
        // ---
        let endpoints = self.endpoints().len() as u32;
        self.retry_limit.unwrap_or(endpoints).max(endpoints).max(1)
    }
}

/// Exchange declaration options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOptions {
    pub name: String,

    #[serde(default, rename = "type")]
    pub kind: ExchangeKind,

    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default)]
    pub auto_delete: bool,

    #[serde(default, alias = "alternateExchange")]
    pub alternate: Option<String>,

    /// Default timeout for publishes on this exchange.
    #[serde(default, with = "millis::option")]
    pub publish_timeout: Option<Duration>,

    /// Verify the exchange exists instead of declaring it.
    #[serde(default)]
    pub check: bool,
}

impl ExchangeOptions {
    pub fn new(name: impl Into<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
            alternate: None,
            publish_timeout: None,
            check: false,
        }
    }

    pub fn with_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_alternate(mut self, exchange: impl Into<String>) -> Self {
        self.alternate = Some(exchange.into());
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = Some(timeout);
        self
    }

    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub(crate) fn definition(&self) -> ExchangeDef {
        // ---
        ExchangeDef {
            name: self.name.clone(),
            kind: self.kind,
            durable: self.durable,
            auto_delete: self.auto_delete,
            alternate: self.alternate.clone(),
        }
    }
}

/// Queue declaration and consumption options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    pub name: String,

    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default)]
    pub auto_delete: bool,

    #[serde(default)]
    pub exclusive: bool,

    /// Dead-letter exchange.
    #[serde(default, alias = "deadLetterExchange")]
    pub dead_letter: Option<String>,

    #[serde(default, alias = "queueLimit")]
    pub max_length: Option<u32>,

    /// Consumer prefetch.
    #[serde(default)]
    pub limit: Option<u16>,

    /// Consume without acknowledgements.
    #[serde(default)]
    pub no_ack: bool,

    /// Acknowledge each message individually instead of batching.
    #[serde(default)]
    pub no_batch: bool,

    /// Verify the queue exists instead of declaring it.
    #[serde(default)]
    pub check: bool,
}

impl QueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            dead_letter: None,
            max_length: None,
            limit: None,
            no_ack: false,
            no_batch: false,
            check: false,
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_dead_letter(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter = Some(exchange.into());
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_limit(mut self, prefetch: u16) -> Self {
        self.limit = Some(prefetch);
        self
    }

    pub fn with_no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn with_no_batch(mut self, no_batch: bool) -> Self {
        self.no_batch = no_batch;
        self
    }

    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub(crate) fn definition(&self) -> QueueDef {
        // ---
        QueueDef {
            name: self.name.clone(),
            durable: self.durable,
            auto_delete: self.auto_delete,
            exclusive: self.exclusive,
            dead_letter: self.dead_letter.clone(),
            max_length: self.max_length,
        }
    }
}

/// Binding between an exchange and a queue or another exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingOptions {
    /// Source exchange.
    #[serde(alias = "exchange")]
    pub source: String,

    /// Target queue or exchange.
    pub target: String,

    /// Routing keys; one bind call per key.
    #[serde(default, alias = "pattern", deserialize_with = "one_or_many")]
    pub keys: Vec<String>,

    /// Whether `target` is a queue (otherwise an exchange).
    #[serde(default = "default_true")]
    pub queue: bool,
}

impl BindingOptions {
    /// Bind exchange `source` to queue `target`.
    pub fn queue(source: impl Into<String>, target: impl Into<String>) -> Self {
        // ---
        Self {
            source: source.into(),
            target: target.into(),
            keys: Vec::new(),
            queue: true,
        }
    }

    /// Bind exchange `source` to exchange `target`.
    pub fn exchange(source: impl Into<String>, target: impl Into<String>) -> Self {
        // ---
        Self {
            source: source.into(),
            target: target.into(),
            keys: Vec::new(),
            queue: false,
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Registry id: `source->target`.
    pub fn id(&self) -> String {
        format!("{}->{}", self.source, self.target)
    }

    /// Keys to bind with; an empty list binds once with `""`.
    pub(crate) fn effective_keys(&self) -> Vec<String> {
        // ---
        if self.keys.is_empty() {
            vec![String::new()]
        } else {
            self.keys.clone()
        }
    }
}

/// A complete topology description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyConfig {
    #[serde(default)]
    pub exchanges: Vec<ExchangeOptions>,
    #[serde(default)]
    pub queues: Vec<QueueOptions>,
    #[serde(default)]
    pub bindings: Vec<BindingOptions>,
}

impl TopologyConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        // ---
        Ok(serde_json::from_str(json)?)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    // ---
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(key) => vec![key],
        OneOrMany::Many(keys) => keys,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_endpoints_cover_every_server_port_pair() {
        // ---
        let config = ConnectionConfig::with_servers("c", ["a", "b"]).with_ports(vec![5672, 5673]);
        let endpoints: Vec<(String, u16)> = config
            .endpoints()
            .into_iter()
            .map(|e| (e.host, e.port))
            .collect();

        assert_eq!(
            endpoints,
            vec![
                ("a".to_string(), 5672),
                ("a".to_string(), 5673),
                ("b".to_string(), 5672),
                ("b".to_string(), 5673),
            ]
        );
        assert_eq!(config.attempt_limit(), 4);
    }

    #[test]
    fn test_endpoint_uri() {
        // ---
        let config = ConnectionConfig::with_servers("c", ["rabbit"])
            .with_credentials("u", "p")
            .with_heartbeat(30);
        let endpoint = &config.endpoints()[0];
        assert_eq!(endpoint.uri, "amqp://u:p@rabbit:5672/%2f?heartbeat=30");
    }

    #[test]
    fn test_explicit_uri_is_single_endpoint() {
        // ---
        let config = ConnectionConfig::with_uri("c", "amqp://localhost:5672/%2f").with_retry_limit(5);
        assert_eq!(config.endpoints().len(), 1);
        assert_eq!(config.attempt_limit(), 5);
    }

    #[test]
    fn test_missing_servers_is_rejected() {
        // ---
        let result = ConnectionConfig::from_json(r#"{"name": "x", "servers": []}"#);
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[test]
    fn test_option_aliases() {
        // ---
        let queue: QueueOptions =
            serde_json::from_str(r#"{"name": "q", "queueLimit": 10, "noBatch": true, "limit": 5}"#)
                .unwrap();
        assert_eq!(queue.max_length, Some(10));
        assert!(queue.no_batch);
        assert_eq!(queue.limit, Some(5));
        assert!(queue.durable);

        let exchange: ExchangeOptions = serde_json::from_str(
            r#"{"name": "x", "type": "topic", "alternateExchange": "alt", "publishTimeout": 250}"#,
        )
        .unwrap();
        assert_eq!(exchange.kind, ExchangeKind::Topic);
        assert_eq!(exchange.alternate.as_deref(), Some("alt"));
        assert_eq!(exchange.publish_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_binding_keys_accept_string_or_list() {
        // ---
        let one: BindingOptions =
            serde_json::from_str(r#"{"exchange": "x", "target": "q", "keys": "a.b"}"#).unwrap();
        assert_eq!(one.keys, vec!["a.b"]);
        assert_eq!(one.id(), "x->q");

        let none: BindingOptions = serde_json::from_str(r#"{"source": "x", "target": "q"}"#).unwrap();
        assert_eq!(none.effective_keys(), vec![String::new()]);
    }

    #[test]
    fn test_topology_config_from_json() {
        // ---
        let config = TopologyConfig::from_json(
            r#"{
                "exchanges": [{"name": "events", "type": "fanout"}],
                "queues": [{"name": "audit", "autoDelete": true}],
                "bindings": [{"exchange": "events", "target": "audit"}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.exchanges.len(), 1);
        assert!(config.queues[0].auto_delete);
        assert!(config.bindings[0].queue);
    }
}
