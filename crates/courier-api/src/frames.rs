use crate::types::{Filter, SignedEvent};
use serde_json::{json, Value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Req { sub_id: String, filters: Vec<Filter> },
    Close(String),
    Event(SignedEvent),
    Auth(SignedEvent),
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        let value = match self {
            ClientFrame::Req { sub_id, filters } => {
                let mut parts = vec![json!("REQ"), json!(sub_id)];
                for filter in filters {
                    parts.push(serde_json::to_value(filter).unwrap_or(Value::Null));
                }
                Value::Array(parts)
            }
            ClientFrame::Close(sub_id) => json!(["CLOSE", sub_id]),
            ClientFrame::Event(event) => json!(["EVENT", event]),
            ClientFrame::Auth(event) => json!(["AUTH", event]),
        };
        value.to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayFrame {
    Event { sub_id: String, event: SignedEvent },
    Eose(String),
    Ok {
        event_id: String,
        accepted: bool,
        message: Option<String>,
    },
    Notice(String),
    Auth(String),
    Closed { sub_id: String, message: Option<String> },
}

impl RelayFrame {
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let parts = value.as_array()?;
        let kind = parts.first()?.as_str()?;
        match kind {
            "EVENT" => {
                let sub_id = parts.get(1)?.as_str()?.to_string();
                let event = serde_json::from_value(parts.get(2)?.clone()).ok()?;
                Some(RelayFrame::Event { sub_id, event })
            }
            "EOSE" => Some(RelayFrame::Eose(parts.get(1)?.as_str()?.to_string())),
            "OK" => {
                let event_id = parts.get(1)?.as_str()?.trim().to_lowercase();
                let accepted = parts.get(2).map(ok_flag).unwrap_or(false);
                let message = non_empty(parts.get(3));
                Some(RelayFrame::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "NOTICE" => Some(RelayFrame::Notice(
                non_empty(parts.get(1)).unwrap_or_default(),
            )),
            "AUTH" => Some(RelayFrame::Auth(parts.get(1)?.as_str()?.to_string())),
            "CLOSED" => Some(RelayFrame::Closed {
                sub_id: parts.get(1)?.as_str()?.to_string(),
                message: non_empty(parts.get(2)),
            }),
            _ => None,
        }
    }
}

fn ok_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(s) => s == "true",
        Value::Number(n) => n.as_u64() == Some(1),
        _ => false,
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// First 64-hex token in a NOTICE, lowercased. Relays often name the event they refused.
pub fn event_id_in_notice(message: &str) -> Option<String> {
    let bytes = message.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_hexdigit() {
            start += 1;
            continue;
        }
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
            end += 1;
        }
        if end - start >= 64 {
            return Some(message[start..start + 64].to_lowercase());
        }
        start = end;
    }
    None
}
