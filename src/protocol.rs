//! Wire formats for the venue feeds
//!
//! Handles the line-oriented streaming protocol (`TCP_USDTRY|B:..|A:..|T:..`)
//! and the JSON payloads of the polled REST venues.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::error::{CollectorError, Result};
use crate::model::Rate;

const LOCAL_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// A quote frame pushed by a streaming venue
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteFrame {
    /// Platform prefix of the feed name (`TCP` in `TCP_USDTRY`)
    pub platform: String,
    pub instrument: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl QuoteFrame {
    pub fn into_rate(self) -> Rate {
        Rate {
            instrument: self.instrument,
            bid: self.bid,
            ask: self.ask,
            observed_at: self.timestamp,
        }
    }
}

/// Parsed line received from a streaming venue
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Quote(QuoteFrame),
    Success(String),
    Info(String),
    Error(String),
    Unknown(String),
}

impl ServerMessage {
    /// Parse a single line (without its terminator)
    pub fn parse(raw: &str) -> Result<Self> {
        let line = raw.trim_end_matches(['\r', '\n']);

        if let Some(rest) = line.strip_prefix("SUCCESS") {
            return Ok(ServerMessage::Success(status_text(rest)));
        }
        if let Some(rest) = line.strip_prefix("INFO") {
            return Ok(ServerMessage::Info(status_text(rest)));
        }
        if let Some(rest) = line.strip_prefix("ERROR") {
            return Ok(ServerMessage::Error(status_text(rest)));
        }

        match line.split_once('|') {
            Some((name, _)) if name.contains('_') => parse_quote(line).map(ServerMessage::Quote),
            _ => Ok(ServerMessage::Unknown(line.to_string())),
        }
    }
}

fn status_text(rest: &str) -> String {
    rest.trim_start_matches('|').to_string()
}

fn parse_quote(line: &str) -> Result<QuoteFrame> {
    let mut parts = line.split('|');
    let name = parts.next().unwrap_or_default();
    let (platform, instrument) = name
        .split_once('_')
        .filter(|(p, i)| !p.is_empty() && !i.is_empty())
        .ok_or_else(|| CollectorError::Protocol(format!("Invalid feed name: {}", name)))?;

    let bid = field(parts.next(), "B:", line)?;
    let ask = field(parts.next(), "A:", line)?;
    let timestamp = parts
        .next()
        .and_then(|p| p.strip_prefix("T:"))
        .ok_or_else(|| CollectorError::Protocol(format!("Missing timestamp: {}", line)))?;

    Ok(QuoteFrame {
        platform: platform.to_string(),
        instrument: instrument.to_string(),
        bid: parse_decimal(bid)?,
        ask: parse_decimal(ask)?,
        timestamp: parse_timestamp(timestamp)?,
    })
}

fn field<'a>(part: Option<&'a str>, prefix: &str, line: &str) -> Result<&'a str> {
    part.and_then(|p| p.strip_prefix(prefix))
        .ok_or_else(|| CollectorError::Protocol(format!("Missing {} field: {}", prefix, line)))
}

/// Parse a decimal in plain or scientific notation
pub fn parse_decimal(s: &str) -> Result<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|e| CollectorError::Protocol(format!("Invalid decimal '{}': {}", s, e)))
}

/// Parse an ISO-8601 timestamp
///
/// Accepts RFC 3339 (with offset or `Z`) and offset-less local timestamps,
/// which are interpreted in the process's local zone.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in LOCAL_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|ts| ts.with_timezone(&Utc))
                .ok_or_else(|| CollectorError::Protocol(format!("Nonexistent local time: {}", s)));
        }
    }
    Err(CollectorError::Protocol(format!("Invalid timestamp: {}", s)))
}

/// Streaming client commands
pub fn connect_command(username: &str, password: &str) -> String {
    format!("connect|{}|{}\r\n", username, password)
}

pub fn disconnect_command(username: &str, password: &str) -> String {
    format!("disconnect|{}|{}\r\n", username, password)
}

pub fn subscribe_command(platform: &str, instrument: &str) -> String {
    format!("subscribe|{}_{}\r\n", platform, instrument)
}

pub fn unsubscribe_command(platform: &str, instrument: &str) -> String {
    format!("unsubscribe|{}_{}\r\n", platform, instrument)
}

/// Login request body for REST venues
#[derive(Debug, Clone, serde::Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Login response carrying the bearer token
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(rename = "apiKey")]
    pub api_key: String,
}

/// Rate payload returned by REST venues
#[derive(Debug, Clone, Deserialize)]
pub struct RestRate {
    pub name: String,

    #[serde(deserialize_with = "deserialize_decimal")]
    pub bid: Decimal,

    #[serde(deserialize_with = "deserialize_decimal")]
    pub ask: Decimal,

    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl RestRate {
    pub fn into_rate(self, instrument: &str) -> Rate {
        Rate::new(instrument, self.bid, self.ask, self.timestamp)
    }
}

/// Custom deserializer for Decimal from a JSON number or string
fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let text = match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "Expected decimal, got {}",
                other
            )))
        }
    };
    parse_decimal(&text).map_err(serde::de::Error::custom)
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_timestamp(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_quote_frame() {
        let raw = "TCP_USDTRY|B:34.4012345678901234|A:34.5012|T:2024-05-01T12:30:45.123Z\r\n";

        let msg = ServerMessage::parse(raw).unwrap();
        if let ServerMessage::Quote(frame) = msg {
            assert_eq!(frame.platform, "TCP");
            assert_eq!(frame.instrument, "USDTRY");
            assert_eq!(frame.bid, dec!(34.4012345678901234));
            assert_eq!(frame.ask, dec!(34.5012));
            assert_eq!(frame.timestamp.to_rfc3339(), "2024-05-01T12:30:45.123+00:00");
        } else {
            panic!("Expected Quote");
        }
    }

    #[test]
    fn test_parse_local_timestamps() {
        assert!(parse_timestamp("2024-05-01T12:30:45.123456789").is_ok());
        assert!(parse_timestamp("2024-05-01T12:30").is_ok());
        assert!(parse_timestamp("01/05/2024 12:30").is_err());
    }

    #[test]
    fn test_parse_status_lines() {
        assert_eq!(
            ServerMessage::parse("SUCCESS|CONNECTED").unwrap(),
            ServerMessage::Success("CONNECTED".to_string())
        );
        assert_eq!(
            ServerMessage::parse("INFO|Already subscribed to currency pair: TCP_USDTRY").unwrap(),
            ServerMessage::Info("Already subscribed to currency pair: TCP_USDTRY".to_string())
        );
        assert!(matches!(
            ServerMessage::parse("ERROR|Invalid credentials").unwrap(),
            ServerMessage::Error(_)
        ));
        assert!(matches!(
            ServerMessage::parse("hello").unwrap(),
            ServerMessage::Unknown(_)
        ));
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        for raw in [
            "TCP_USDTRY|B:abc|A:1.0|T:2024-05-01T12:30:45Z",
            "TCP_USDTRY|B:1.0|T:2024-05-01T12:30:45Z",
            "TCP_USDTRY|B:1.0|A:1.1",
            "TCP_|B:1.0|A:1.1|T:2024-05-01T12:30:45Z",
        ] {
            assert!(
                matches!(ServerMessage::parse(raw), Err(CollectorError::Protocol(_))),
                "{} should fail",
                raw
            );
        }
    }

    #[test]
    fn test_parse_rest_rate_numbers_and_strings() {
        let raw = r#"{
            "name": "REST_EURUSD",
            "bid": 1.0812345678901234,
            "ask": "1.0823",
            "timestamp": "2024-05-01T12:30:45.123Z"
        }"#;

        let rate: RestRate = serde_json::from_str(raw).unwrap();
        assert_eq!(rate.name, "REST_EURUSD");
        assert_eq!(rate.bid, dec!(1.0812345678901234));
        assert_eq!(rate.ask, dec!(1.0823));

        let rate = rate.into_rate("EURUSD");
        assert_eq!(rate.instrument, "EURUSD");
    }

    #[test]
    fn test_commands() {
        assert_eq!(connect_command("user", "pw"), "connect|user|pw\r\n");
        assert_eq!(subscribe_command("TCP", "USDTRY"), "subscribe|TCP_USDTRY\r\n");
        assert_eq!(unsubscribe_command("TCP", "USDTRY"), "unsubscribe|TCP_USDTRY\r\n");
        assert_eq!(disconnect_command("user", "pw"), "disconnect|user|pw\r\n");
    }
}
