//! Declarative intermediate representation.
//!
//! The IR says *what* an automation should achieve: a goal, where the data
//! comes from and where results go. It never names steps or loops; the
//! compiler decides those.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A declarative automation description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclarativeIr {
    /// Natural-language goal
    pub goal: String,
    /// Data inputs
    #[serde(default)]
    pub data_sources: Vec<DataSource>,
    /// Result deliveries
    #[serde(default)]
    pub delivery_rules: Vec<DeliveryRule>,
}

impl DeclarativeIr {
    /// Create an IR with a goal and nothing else
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            data_sources: Vec::new(),
            delivery_rules: Vec::new(),
        }
    }

    /// Add a data source
    #[must_use]
    pub fn with_source(mut self, source: DataSource) -> Self {
        self.data_sources.push(source);
        self
    }

    /// Add a delivery rule
    #[must_use]
    pub fn with_delivery(mut self, rule: DeliveryRule) -> Self {
        self.delivery_rules.push(rule);
        self
    }
}

/// Where the automation reads from.
///
/// Accepts either a bare name (`"gmail-inbox"`) or a detailed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawDataSource")]
pub struct DataSource {
    /// Source name, e.g. `gmail-inbox`
    pub source: String,
    /// Explicit plugin, overriding name-based inference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Free-form filter forwarded to the read action as `query`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Extra parameters for the read action
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
}

impl DataSource {
    /// Source identified only by name
    pub fn named(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            plugin: None,
            filter: None,
            config: Map::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDataSource {
    Name(String),
    Detailed {
        #[serde(alias = "name")]
        source: String,
        #[serde(default)]
        plugin: Option<String>,
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        config: Map<String, Value>,
    },
}

impl From<RawDataSource> for DataSource {
    fn from(raw: RawDataSource) -> Self {
        match raw {
            RawDataSource::Name(source) => Self::named(source),
            RawDataSource::Detailed {
                source,
                plugin,
                filter,
                config,
            } => Self {
                source,
                plugin,
                filter,
                config,
            },
        }
    }
}

/// Where results go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRule {
    /// Recipient: an address, a role (`manager`) or a `#channel`
    #[serde(default)]
    pub to: String,
    /// Explicit channel (`email`, `slack`, `log`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Subject line for email deliveries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Deliver once per collected item instead of once overall
    #[serde(default)]
    pub per_item: bool,
}

impl DeliveryRule {
    /// Deliver to a single recipient
    pub fn to(recipient: impl Into<String>) -> Self {
        Self {
            to: recipient.into(),
            channel: None,
            subject: None,
            per_item: false,
        }
    }

    /// Set the channel
    #[must_use]
    pub fn via(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Deliver per item
    #[must_use]
    pub fn per_item(mut self) -> Self {
        self.per_item = true;
        self
    }
}
