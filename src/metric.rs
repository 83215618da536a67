//! Metric kinds and the transport-level metric record.
//!
//! A series is identified by its kind (`gauge` or `counter`) and name.
//! Gauges hold the last written `f64`, counters accumulate `i64` deltas.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Name of the counter series carrying the number of agent polls.
pub const POLL_COUNT: &str = "PollCount";

/// Kind of a metric series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [MetricKind::Gauge, MetricKind::Counter];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(MetricError::UnknownType(other.to_string())),
        }
    }
}

/// Validation failures for a single metric.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("id missing")]
    IdMissing,

    #[error("value missing for {0}")]
    ValueMissing(String),

    #[error("invalid {kind} value {raw:?}")]
    InvalidValue { kind: MetricKind, raw: String },
}

/// A typed metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    /// Parses a raw string according to the series kind.
    ///
    /// Gauges must be finite so they survive a JSON round trip.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, MetricError> {
        let invalid = || MetricError::InvalidValue {
            kind,
            raw: raw.to_string(),
        };
        match kind {
            MetricKind::Gauge => {
                let v = raw.trim().parse::<f64>().map_err(|_| invalid())?;
                if !v.is_finite() {
                    return Err(invalid());
                }
                Ok(MetricValue::Gauge(v))
            }
            MetricKind::Counter => raw
                .trim()
                .parse::<i64>()
                .map(MetricValue::Counter)
                .map_err(|_| invalid()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => f.write_str(&format_gauge(*v)),
            MetricValue::Counter(v) => write!(f, "{v}"),
        }
    }
}

/// Renders a gauge as the shortest decimal that parses back to the same
/// value, never in exponent form (`9.0` renders as `9`).
pub fn format_gauge(v: f64) -> String {
    format!("{v}")
}

/// Transport-level metric record shared by the agent and the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Metrics {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub mtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metrics {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            mtype: MetricKind::Gauge.to_string(),
            delta: None,
            value: Some(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            mtype: MetricKind::Counter.to_string(),
            delta: Some(delta),
            value: None,
        }
    }

    /// Builds a record from a snapshot triple, parsing the string value.
    pub fn from_raw(kind: MetricKind, name: &str, raw: &str) -> Result<Self, MetricError> {
        Ok(match MetricValue::parse(kind, raw)? {
            MetricValue::Gauge(v) => Metrics::gauge(name, v),
            MetricValue::Counter(d) => Metrics::counter(name, d),
        })
    }

    /// Validates the record and extracts its typed value.
    ///
    /// Checks run in the order id, type, value.
    pub fn typed_value(&self) -> Result<MetricValue, MetricError> {
        if self.id.is_empty() {
            return Err(MetricError::IdMissing);
        }
        match self.mtype.parse::<MetricKind>()? {
            MetricKind::Gauge => match self.value {
                Some(v) if v.is_finite() => Ok(MetricValue::Gauge(v)),
                Some(v) => Err(MetricError::InvalidValue {
                    kind: MetricKind::Gauge,
                    raw: v.to_string(),
                }),
                None => Err(MetricError::ValueMissing(self.id.clone())),
            },
            MetricKind::Counter => self
                .delta
                .map(MetricValue::Counter)
                .ok_or_else(|| MetricError::ValueMissing(self.id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_formatting_is_shortest_round_trip() {
        assert_eq!(format_gauge(9.0), "9");
        assert_eq!(format_gauge(12.5), "12.5");
        assert_eq!(format_gauge(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_gauge(1e21), "1000000000000000000000");
        let v = 123456.789e-3;
        assert_eq!(format_gauge(v).parse::<f64>().unwrap(), v);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(MetricValue::parse(MetricKind::Counter, "1.5").is_err());
        assert!(MetricValue::parse(MetricKind::Gauge, "abc").is_err());
        assert!(MetricValue::parse(MetricKind::Gauge, "NaN").is_err());
        assert!(MetricValue::parse(MetricKind::Gauge, "inf").is_err());
        assert_eq!(
            MetricValue::parse(MetricKind::Counter, "-7").unwrap(),
            MetricValue::Counter(-7)
        );
    }

    #[test]
    fn test_wire_json_shape() {
        let json = serde_json::to_string(&Metrics::counter("hits", 5)).unwrap();
        assert_eq!(json, r#"{"id":"hits","type":"counter","delta":5}"#);

        let m: Metrics = serde_json::from_str(r#"{"id":"temp","type":"gauge","value":9}"#).unwrap();
        assert_eq!(m.typed_value().unwrap(), MetricValue::Gauge(9.0));
    }

    #[test]
    fn test_typed_value_validation_order() {
        let m = Metrics {
            id: String::new(),
            mtype: "histogram".into(),
            ..Default::default()
        };
        assert_eq!(m.typed_value(), Err(MetricError::IdMissing));

        let m = Metrics {
            id: "a".into(),
            mtype: "histogram".into(),
            value: Some(1.0),
            ..Default::default()
        };
        assert!(matches!(m.typed_value(), Err(MetricError::UnknownType(_))));

        let m = Metrics {
            id: "a".into(),
            mtype: "counter".into(),
            value: Some(1.0),
            ..Default::default()
        };
        assert_eq!(m.typed_value(), Err(MetricError::ValueMissing("a".into())));
    }
}
