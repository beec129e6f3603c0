// ── Wire-level identity and value types ──
//
// DeviceAddress and ParamRef are the two keys everything else hangs off:
// the registry keys clients by address, the dispatch table keys listeners
// by parameter. Both are strictly zero-based, wire-form values.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Well-known TCP control port on the device.
pub const DEFAULT_COMMAND_PORT: u16 = 5321;

/// Well-known local UDP port the device pushes telemetry to.
pub const DEFAULT_TELEMETRY_PORT: u16 = 3131;

// ── DeviceAddress ───────────────────────────────────────────────────

/// Immutable network identity of one device.
///
/// Rendered and parsed as `host:command_port/:telemetry_port`, e.g.
/// `192.0.2.10:5321/:3131`. Both ports are optional when parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    host: String,
    command_port: u16,
    telemetry_port: u16,
}

impl DeviceAddress {
    /// Address on the default command and telemetry ports.
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_ports(host, DEFAULT_COMMAND_PORT, DEFAULT_TELEMETRY_PORT)
    }

    pub fn with_ports(host: impl Into<String>, command_port: u16, telemetry_port: u16) -> Self {
        Self {
            host: host.into(),
            command_port,
            telemetry_port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn command_port(&self) -> u16 {
        self.command_port
    }

    pub fn telemetry_port(&self) -> u16 {
        self.telemetry_port
    }

    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn command_endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.command_port)
        } else {
            format!("{}:{}", self.host, self.command_port)
        }
    }

    /// The host as an IP literal, if it is one.
    pub fn host_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/:{}", self.command_endpoint(), self.telemetry_port)
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| Error::InvalidAddress {
            input: s.to_owned(),
            reason: reason.to_owned(),
        };
        let parse_port = |raw: &str| raw.parse::<u16>().map_err(|_| invalid("port is not a number"));

        let (endpoint, telemetry_port) = match s.split_once("/:") {
            Some((endpoint, port)) => (endpoint, parse_port(port)?),
            None => (s, DEFAULT_TELEMETRY_PORT),
        };

        let (host, command_port) = if let Some(rest) = endpoint.strip_prefix('[') {
            // Bracketed IPv6 literal, optionally followed by `:port`.
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '[' in IPv6 host"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, parse_port(port)?),
                None if tail.is_empty() => (host, DEFAULT_COMMAND_PORT),
                None => return Err(invalid("unexpected text after IPv6 host")),
            }
        } else if endpoint.matches(':').count() == 1 {
            let (host, port) = endpoint
                .split_once(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, parse_port(port)?)
        } else {
            (endpoint, DEFAULT_COMMAND_PORT)
        };

        if host.is_empty() {
            return Err(invalid("host is empty"));
        }

        Ok(Self::with_ports(host, command_port, telemetry_port))
    }
}

// ── ParamRef ────────────────────────────────────────────────────────

/// Zero-based reference to one controllable or observable value.
///
/// Wire form is `<category>_<index>`, e.g. `SourceGain_2` for the gain of
/// the third logical input. Only the last underscore separates the index,
/// so categories may themselves contain underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamRef {
    category: String,
    index: u32,
}

impl ParamRef {
    pub fn new(category: impl Into<String>, index: u32) -> Result<Self, Error> {
        let category = category.into();
        if category.is_empty() || category.chars().any(char::is_whitespace) {
            return Err(Error::InvalidParam {
                name: format!("{category}_{index}"),
                reason: "category must be a non-empty token without whitespace".into(),
            });
        }
        Ok(Self { category, index })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Zero-based wire index.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn wire_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ParamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.category, self.index)
    }
}

impl FromStr for ParamRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (category, index) = s.rsplit_once('_').ok_or_else(|| Error::InvalidParam {
            name: s.to_owned(),
            reason: "expected <category>_<index>".into(),
        })?;
        let index = index.parse::<u32>().map_err(|_| Error::InvalidParam {
            name: s.to_owned(),
            reason: "index is not a non-negative integer".into(),
        })?;
        Self::new(category, index)
    }
}

impl Serialize for ParamRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ParamRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── ParamValue ──────────────────────────────────────────────────────

/// A parameter value exactly as carried on the wire.
///
/// Kept as a JSON value so the decimal representation the device sends
/// is what callers see; no clamping or unit conversion happens here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamValue(serde_json::Value);

impl ParamValue {
    pub fn null() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.0.as_f64()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.as_i64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.0.as_bool()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// Interpret free-form user input: JSON literals (`-12.5`, `true`,
    /// `"text"`) parse as such, anything else is taken as a bare string.
    pub fn parse_lenient(input: &str) -> Self {
        serde_json::from_str(input)
            .map(Self)
            .unwrap_or_else(|_| Self(serde_json::Value::String(input.to_owned())))
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(v: serde_json::Value) -> Self {
        Self(v)
    }
}

/// Non-finite floats become `null`; the protocol has no encoding for them.
impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self(serde_json::Value::from(v))
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self(serde_json::Value::from(v))
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self(serde_json::Value::Bool(v))
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self(serde_json::Value::String(v.to_owned()))
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self(serde_json::Value::String(v))
    }
}

// ── ValueFormat / Method ────────────────────────────────────────────

/// Representation the device reports a parameter in.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ValueFormat {
    /// Native engineering value (dB for gains, raw level for meters).
    #[default]
    #[serde(rename = "val")]
    #[strum(serialize = "val")]
    Value,
    /// Normalised 0-100 position.
    #[serde(rename = "pct")]
    #[strum(serialize = "pct")]
    Percent,
    /// Human-readable text.
    #[serde(rename = "str")]
    #[strum(serialize = "str")]
    Text,
}

/// Request verbs understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Method {
    Get,
    Set,
    Subscribe,
    Unsubscribe,
    Auth,
}

// ── Sample ──────────────────────────────────────────────────────────

/// Where a [`Sample`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SampleSource {
    /// Datagram on the telemetry channel.
    Telemetry,
    /// Unsolicited record on the command connection.
    Notification,
    /// Value confirmed by a successful `set`.
    Acknowledged,
}

/// One observed parameter value, as delivered to listeners and sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub param: ParamRef,
    pub value: ParamValue,
    /// Format the device labelled the record with, if any.
    pub format: Option<ValueFormat>,
    /// Peak level for meter-category parameters.
    pub peak: Option<f64>,
    /// Clip indicator for meter-category parameters.
    pub clip: Option<bool>,
    pub source: SampleSource,
    pub received_at: DateTime<Utc>,
}
