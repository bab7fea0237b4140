use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured payloads carried inside direct-message plaintext, one JSON object per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessagePayload {
    #[serde(rename = "cashu_subscription_payment")]
    SubscriptionPayment(SubscriptionPayment),
    #[serde(rename = "cashu_subscription_claimed")]
    SubscriptionClaimed(SubscriptionClaimed),
    #[serde(rename = "token")]
    Token(TokenPayload),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPayment {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub htlc_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub htlc_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_months: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionClaimed {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_index: Option<u32>,
}

/// Plain token payload. On the wire it has no `type` field, only `token`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(
        rename = "unlockTime",
        alias = "unlock_time",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub unlock_time: Option<u64>,
    #[serde(rename = "referenceId", default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime: String,
    pub size: usize,
    #[serde(default)]
    pub name: String,
}

/// Scans every non-empty line that looks like a JSON object. Unknown or
/// malformed entries are skipped.
pub fn decode_payloads(plaintext: &str) -> Vec<MessagePayload> {
    plaintext
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(decode_value)
        .collect()
}

fn decode_value(value: Value) -> Option<MessagePayload> {
    let object = value.as_object()?;
    match object.get("type").and_then(|t| t.as_str()) {
        Some("cashu_subscription_payment") => {
            let has_token = object
                .get("token")
                .and_then(|t| t.as_str())
                .map(|t| !t.is_empty())
                .unwrap_or(false);
            if !has_token {
                return None;
            }
            serde_json::from_value(value).ok()
        }
        Some("cashu_subscription_claimed") => serde_json::from_value(value).ok(),
        Some(_) => None,
        None => {
            let token: TokenPayload = serde_json::from_value(value).ok()?;
            if token.token.is_empty() {
                return None;
            }
            Some(MessagePayload::Token(token))
        }
    }
}

/// Detects `data:<mime>;base64,<body>` content and reports the decoded size.
pub fn detect_attachment(content: &str) -> Option<Attachment> {
    let rest = content.trim().strip_prefix("data:")?;
    let (mime, body) = rest.split_once(";base64,")?;
    if mime.is_empty() || mime.contains(',') {
        return None;
    }
    let bytes = STANDARD.decode(body.trim()).ok()?;
    Some(Attachment {
        mime: mime.to_string(),
        size: bytes.len(),
        name: String::new(),
    })
}
