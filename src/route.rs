//! Route records and the metadata line codec
//!
//! A route binds one fully-qualified name (`student.[subdomain.]lab.domain`) to a
//! backend address. Each route is persisted as a single comment line at the top of
//! its server block:
//!
//! ```text
//! # METADATA:<student>|<subdomain>|<lab>|<domain>|<target_ip>|<target_port>|<listen_ports>|<features>
//! ```
//!
//! Lines written before feature flags existed carry only seven fields and decode
//! with an empty feature set.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Marker that identifies a metadata line inside the proxy configuration
pub const METADATA_MARKER: &str = "# METADATA:";

/// Subdomain sentinel meaning "no subdomain segment"
pub const MAIN_SUBDOMAIN: &str = "main";

const FIELD_SEPARATOR: char = '|';
const LIST_SEPARATOR: char = ',';

/// Errors raised while decoding or constructing a route
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("line does not start with the metadata marker")]
    MissingMarker,

    #[error("expected 7 or 8 metadata fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("invalid port in {field}: {value:?}")]
    InvalidPort { field: &'static str, value: String },

    #[error("route has no listen ports")]
    NoListenPorts,
}

/// Layout of a decoded metadata line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    /// Seven fields, written before feature flags were introduced
    Legacy,
    /// Eight fields, the layout written by this crate
    Current,
}

impl MetadataFormat {
    fn from_field_count(count: usize) -> Result<Self, MetadataError> {
        match count {
            7 => Ok(MetadataFormat::Legacy),
            8 => Ok(MetadataFormat::Current),
            n => Err(MetadataError::FieldCount(n)),
        }
    }
}

/// Optional per-route behavior
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub enum Feature {
    /// Keep upgraded (WebSocket) connections alive through the proxy
    WebSocket,
    /// A flag this version does not understand; kept so it survives a rewrite
    Other(String),
}

impl Feature {
    pub fn as_str(&self) -> &str {
        match self {
            Feature::WebSocket => "ws",
            Feature::Other(name) => name,
        }
    }
}

impl FromStr for Feature {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ws" => Ok(Feature::WebSocket),
            other => {
                validate_token("feature", other)?;
                Ok(Feature::Other(other.to_string()))
            }
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Feature> for String {
    fn from(feature: Feature) -> Self {
        feature.as_str().to_string()
    }
}

/// One published subdomain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteRecord {
    student_id: String,
    subdomain: String,
    lab_id: String,
    domain: String,
    target_address: String,
    target_port: u16,
    listen_ports: Vec<u16>,
    features: BTreeSet<Feature>,
}

impl RouteRecord {
    /// Build a route, validating every identifier against the codec's delimiters.
    ///
    /// Duplicate listen ports are collapsed, keeping first occurrence order.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        student_id: impl Into<String>,
        subdomain: impl Into<String>,
        lab_id: impl Into<String>,
        domain: impl Into<String>,
        target_address: impl Into<String>,
        target_port: u16,
        listen_ports: impl IntoIterator<Item = u16>,
        features: impl IntoIterator<Item = Feature>,
    ) -> Result<Self, MetadataError> {
        let record = Self {
            student_id: student_id.into(),
            subdomain: subdomain.into(),
            lab_id: lab_id.into(),
            domain: domain.into(),
            target_address: target_address.into(),
            target_port,
            listen_ports: dedup_ports(listen_ports),
            features: features.into_iter().collect(),
        };
        record.validate()?;
        Ok(record)
    }

    fn validate(&self) -> Result<(), MetadataError> {
        validate_token("student_id", &self.student_id)?;
        validate_token("subdomain", &self.subdomain)?;
        validate_token("lab_id", &self.lab_id)?;
        validate_token("domain", &self.domain)?;
        validate_token("target_address", &self.target_address)?;
        if self.target_port == 0 {
            return Err(MetadataError::InvalidPort {
                field: "target_port",
                value: "0".to_string(),
            });
        }
        if self.listen_ports.is_empty() {
            return Err(MetadataError::NoListenPorts);
        }
        if self.listen_ports.contains(&0) {
            return Err(MetadataError::InvalidPort {
                field: "listen_ports",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn lab_id(&self) -> &str {
        &self.lab_id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn target_address(&self) -> &str {
        &self.target_address
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn listen_ports(&self) -> &[u16] {
        &self.listen_ports
    }

    pub fn features(&self) -> &BTreeSet<Feature> {
        &self.features
    }

    pub fn has_feature(&self, feature: &Feature) -> bool {
        self.features.contains(feature)
    }

    /// The routing key, unique within a store
    pub fn name(&self) -> String {
        if self.subdomain == MAIN_SUBDOMAIN {
            format!("{}.{}.{}", self.student_id, self.lab_id, self.domain)
        } else {
            format!(
                "{}.{}.{}.{}",
                self.student_id, self.subdomain, self.lab_id, self.domain
            )
        }
    }

    /// Name of the compose project backing this route
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.student_id, self.lab_id)
    }

    /// Human-readable `name -> address:port` line
    pub fn route_map(&self) -> String {
        format!(
            "{} -> {}:{}",
            self.name(),
            self.target_address,
            self.target_port
        )
    }

    /// Encode this route as a metadata comment line (no trailing newline)
    pub fn to_metadata_line(&self) -> String {
        let listen = join(self.listen_ports.iter());
        let features = join(self.features.iter());
        format!(
            "{METADATA_MARKER}{}|{}|{}|{}|{}|{}|{}|{}",
            self.student_id,
            self.subdomain,
            self.lab_id,
            self.domain,
            self.target_address,
            self.target_port,
            listen,
            features
        )
    }

    /// Decode a metadata comment line. Surrounding whitespace is ignored.
    pub fn from_metadata_line(line: &str) -> Result<Self, MetadataError> {
        Self::decode(line).map(|(record, _)| record)
    }

    /// Decode a metadata line and report which layout it used
    pub fn decode(line: &str) -> Result<(Self, MetadataFormat), MetadataError> {
        let body = line
            .trim()
            .strip_prefix(METADATA_MARKER)
            .ok_or(MetadataError::MissingMarker)?;

        let fields: Vec<&str> = body.split(FIELD_SEPARATOR).collect();
        let format = MetadataFormat::from_field_count(fields.len())?;

        let target_port = parse_port("target_port", fields[5])?;
        let listen_ports = split_list(fields[6])
            .map(|p| parse_port("listen_ports", p))
            .collect::<Result<Vec<_>, _>>()?;

        let features = match format {
            MetadataFormat::Legacy => Vec::new(),
            MetadataFormat::Current => split_list(fields[7])
                .map(Feature::from_str)
                .collect::<Result<Vec<_>, _>>()?,
        };

        let record = Self::new(
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            fields[4],
            target_port,
            listen_ports,
            features,
        )?;
        Ok((record, format))
    }
}

fn dedup_ports(ports: impl IntoIterator<Item = u16>) -> Vec<u16> {
    let mut seen = BTreeSet::new();
    ports.into_iter().filter(|p| seen.insert(*p)).collect()
}

fn join<T: fmt::Display>(items: impl Iterator<Item = T>) -> String {
    items
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(&LIST_SEPARATOR.to_string())
}

fn split_list(field: &str) -> impl Iterator<Item = &str> {
    field
        .split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, MetadataError> {
    // tolerate a TLS annotation that older writers left in the numeric field
    let numeric = value.trim().trim_end_matches("ssl").trim();
    numeric
        .parse::<u16>()
        .map_err(|_| MetadataError::InvalidPort {
            field,
            value: value.to_string(),
        })
}

/// Identifiers end up in metadata fields, server names and file names
pub(crate) fn validate_token(field: &'static str, value: &str) -> Result<(), MetadataError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.chars().any(|c| {
            c == FIELD_SEPARATOR
                || c == LIST_SEPARATOR
                || c == '/'
                || c == '\\'
                || c.is_whitespace()
                || c.is_control()
        });
    if bad {
        return Err(MetadataError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> RouteRecord {
        RouteRecord::new(
            "alice",
            MAIN_SUBDOMAIN,
            "xss101",
            "example.com",
            "127.0.0.1",
            8001,
            [443, 80],
            [Feature::WebSocket],
        )
        .unwrap()
    }

    #[test]
    fn test_name_without_subdomain() {
        assert_eq!(alice().name(), "alice.xss101.example.com");
    }

    #[test]
    fn test_name_with_subdomain() {
        let record = RouteRecord::new(
            "bob", "api", "xss101", "example.com", "127.0.0.1", 8002, [80], [],
        )
        .unwrap();
        assert_eq!(record.name(), "bob.api.xss101.example.com");
        assert_eq!(record.container_name(), "bob-xss101");
    }

    #[test]
    fn test_metadata_line_layout() {
        assert_eq!(
            alice().to_metadata_line(),
            "# METADATA:alice|main|xss101|example.com|127.0.0.1|8001|443,80|ws"
        );
    }

    #[test]
    fn test_round_trip_with_features() {
        let record = alice();
        let (decoded, format) = RouteRecord::decode(&record.to_metadata_line()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(format, MetadataFormat::Current);
    }

    #[test]
    fn test_round_trip_without_features() {
        let record = RouteRecord::new(
            "carol", "main", "sqli", "labs.local", "10.0.0.5", 8100, [80], [],
        )
        .unwrap();
        let line = record.to_metadata_line();
        assert!(line.ends_with("|80|"));
        assert_eq!(RouteRecord::from_metadata_line(&line).unwrap(), record);
    }

    #[test]
    fn test_legacy_seven_field_line() {
        let line = "# METADATA:alice|main|xss101|example.com|127.0.0.1|8001|80";
        let (record, format) = RouteRecord::decode(line).unwrap();
        assert_eq!(format, MetadataFormat::Legacy);
        assert!(record.features().is_empty());
        assert_eq!(record.listen_ports(), &[80]);
    }

    #[test]
    fn test_tls_annotation_is_stripped() {
        let line = "# METADATA:alice|main|xss101|example.com|127.0.0.1|8001|443ssl,80|";
        let record = RouteRecord::from_metadata_line(line).unwrap();
        assert_eq!(record.listen_ports(), &[443, 80]);
        assert!(record.to_metadata_line().contains("|443,80|"));
    }

    #[test]
    fn test_unknown_feature_survives() {
        let line = "# METADATA:alice|main|xss101|example.com|127.0.0.1|8001|80|ws,grpc";
        let record = RouteRecord::from_metadata_line(line).unwrap();
        assert!(record.has_feature(&Feature::WebSocket));
        assert!(record.has_feature(&Feature::Other("grpc".to_string())));
        assert_eq!(
            RouteRecord::from_metadata_line(&record.to_metadata_line()).unwrap(),
            record
        );
    }

    #[test]
    fn test_rejects_malformed_lines() {
        assert_eq!(
            RouteRecord::from_metadata_line("server {"),
            Err(MetadataError::MissingMarker)
        );
        assert_eq!(
            RouteRecord::from_metadata_line("# METADATA:a|b|c"),
            Err(MetadataError::FieldCount(3))
        );
        assert!(matches!(
            RouteRecord::from_metadata_line("# METADATA:a|main|lab|d.com|127.0.0.1|http|80|"),
            Err(MetadataError::InvalidPort { field: "target_port", .. })
        ));
        assert_eq!(
            RouteRecord::from_metadata_line("# METADATA:a|main|lab|d.com|127.0.0.1|8000||"),
            Err(MetadataError::NoListenPorts)
        );
    }

    #[test]
    fn test_rejects_delimiters_in_identifiers() {
        let result = RouteRecord::new(
            "al|ice", "main", "xss101", "example.com", "127.0.0.1", 8001, [80], [],
        );
        assert!(matches!(
            result,
            Err(MetadataError::InvalidField { field: "student_id", .. })
        ));

        let result = RouteRecord::new(
            "alice", "main", "../etc", "example.com", "127.0.0.1", 8001, [80], [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_listen_ports_collapse() {
        let record = RouteRecord::new(
            "alice", "main", "xss101", "example.com", "127.0.0.1", 8001, [80, 443, 80], [],
        )
        .unwrap();
        assert_eq!(record.listen_ports(), &[80, 443]);
    }

    #[test]
    fn test_route_map() {
        assert_eq!(
            alice().route_map(),
            "alice.xss101.example.com -> 127.0.0.1:8001"
        );
    }
}
