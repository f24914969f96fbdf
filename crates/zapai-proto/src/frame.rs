// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire frames exchanged with a relay.
//!
//! Both directions are positional JSON arrays with a leading string tag:
//!
//! ```text
//! client → relay   ["REQ", <sub-id>, <filter>…] | ["EVENT", <event>] | ["CLOSE", <sub-id>]
//! relay  → client  ["EVENT", <sub-id>, <event>] | ["EOSE", <sub-id>]
//!                  | ["OK", <event-id>, <bool>, <msg>] | ["CLOSED", <sub-id>, <msg>]
//!                  | ["NOTICE", <msg>]
//! ```

use serde_json::{json, Value};

use crate::{event::ProtoError, Event, Filter};

/// Frame sent by this client to a relay.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Subscribe { sub_id: String, filters: Vec<Filter> },
    Publish { event: Event },
    Close { sub_id: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        let value = match self {
            ClientFrame::Subscribe { sub_id, filters } => {
                let mut arr = vec![json!("REQ"), json!(sub_id)];
                arr.extend(filters.iter().map(|f| json!(f)));
                Value::Array(arr)
            }
            ClientFrame::Publish { event } => json!(["EVENT", event]),
            ClientFrame::Close { sub_id } => json!(["CLOSE", sub_id]),
        };
        value.to_string()
    }
}

/// Frame received from a relay.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    Event { sub_id: String, event: Event },
    EndOfStored { sub_id: String },
    Ok { event_id: String, accepted: bool, message: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
    /// Frame types this client does not consume (e.g. AUTH challenges).
    Unknown,
}

impl RelayFrame {
    pub fn parse(raw: &str) -> Result<Self, ProtoError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ProtoError::InvalidFrame(e.to_string()))?;
        let arr = value
            .as_array()
            .ok_or_else(|| ProtoError::InvalidFrame("frame is not an array".into()))?;
        let tag = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtoError::InvalidFrame("missing frame tag".into()))?;

        match tag {
            "EVENT" => {
                let sub_id = str_at(arr, 1)?;
                let event: Event = serde_json::from_value(
                    arr.get(2)
                        .cloned()
                        .ok_or_else(|| ProtoError::InvalidFrame("EVENT missing payload".into()))?,
                )
                .map_err(|e| ProtoError::InvalidFrame(e.to_string()))?;
                Ok(RelayFrame::Event { sub_id, event })
            }
            "EOSE" => Ok(RelayFrame::EndOfStored { sub_id: str_at(arr, 1)? }),
            "OK" => Ok(RelayFrame::Ok {
                event_id: str_at(arr, 1)?,
                accepted: arr.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: arr.get(3).and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            "CLOSED" => Ok(RelayFrame::Closed {
                sub_id: str_at(arr, 1)?,
                message: arr.get(2).and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            "NOTICE" => Ok(RelayFrame::Notice {
                message: arr.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            _ => Ok(RelayFrame::Unknown),
        }
    }
}

fn str_at(arr: &[Value], idx: usize) -> Result<String, ProtoError> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtoError::InvalidFrame(format!("missing string at index {idx}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, Principal};

    #[test]
    fn subscribe_frame_serializes_filters_positionally() {
        let f = Filter::new().kind(EventKind::PrivateMessage);
        let frame = ClientFrame::Subscribe { sub_id: "sub1".into(), filters: vec![f.clone(), f] };
        let v: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v[0], "REQ");
        assert_eq!(v[1], "sub1");
        assert_eq!(v[2]["kinds"][0], 4);
        assert_eq!(v[3]["kinds"][0], 4);
    }

    #[test]
    fn event_frame_parses() {
        let p = Principal::from_bytes([5; 32]);
        let raw = json!([
            "EVENT",
            "sub1",
            {
                "id": "ab".repeat(32),
                "pubkey": p.to_hex(),
                "created_at": 1700000000u64,
                "kind": 1,
                "tags": [["p", p.to_hex()]],
                "content": "hi",
                "sig": ""
            }
        ])
        .to_string();
        match RelayFrame::parse(&raw).unwrap() {
            RelayFrame::Event { sub_id, event } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(event.kind, EventKind::PublicPost);
                assert_eq!(event.pubkey, p);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ok_frame_parses_rejection() {
        let raw = r#"["OK", "abcd", false, "pow: difficulty too low"]"#;
        match RelayFrame::parse(raw).unwrap() {
            RelayFrame::Ok { event_id, accepted, message } => {
                assert_eq!(event_id, "abcd");
                assert!(!accepted);
                assert!(message.starts_with("pow:"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn eose_and_closed_parse() {
        assert!(matches!(
            RelayFrame::parse(r#"["EOSE", "s"]"#).unwrap(),
            RelayFrame::EndOfStored { .. }
        ));
        assert!(matches!(
            RelayFrame::parse(r#"["CLOSED", "s", "shutting down"]"#).unwrap(),
            RelayFrame::Closed { .. }
        ));
    }

    #[test]
    fn unknown_tag_is_tolerated() {
        assert!(matches!(
            RelayFrame::parse(r#"["AUTH", "challenge"]"#).unwrap(),
            RelayFrame::Unknown
        ));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(RelayFrame::parse("not json").is_err());
        assert!(RelayFrame::parse(r#"{"not":"array"}"#).is_err());
    }
}
