use serde::{Deserialize, Serialize};

/// Encrypted direct message (NIP-04 style).
pub const KIND_ENCRYPTED_DM: u32 = 4;
/// Client authentication (NIP-42).
pub const KIND_CLIENT_AUTH: u32 = 22242;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl SignedEvent {
    pub fn is_well_formed(&self) -> bool {
        is_hex_of_len(&self.id, 64) && is_hex_of_len(&self.pubkey, 64) && is_hex_of_len(&self.sig, 128)
    }

    /// Values of every tag named `name`, in tag order.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|tag| tag.first().map(|t| t == name).unwrap_or(false))
            .filter_map(|tag| tag.get(1).map(|v| v.as_str()))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub created_at: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    pub fn by_id(id: &str) -> Self {
        Self {
            ids: Some(vec![id.to_string()]),
            limit: Some(1),
            ..Self::default()
        }
    }

    /// Direct messages addressed to `pubkey`, optionally newer than `since`.
    pub fn inbox(pubkey: &str, kind: u32, since: Option<u64>) -> Self {
        Self {
            kinds: Some(vec![kind]),
            p_tags: Some(vec![pubkey.to_string()]),
            since,
            ..Self::default()
        }
    }
}

/// Outcome of one publish attempt against one relay or fallback endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RelayAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

pub(crate) fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}
