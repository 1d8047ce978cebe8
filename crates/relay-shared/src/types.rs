use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Conversation identity = base64 hash of the conversation's replication cell
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace used for every locally persisted record of this conversation.
    pub fn storage_prefix(&self) -> String {
        format!("conversation.{}", self.0)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a message.
///
/// Confirmed messages carry the content-addressed hash assigned by the
/// backend. Pending messages carry a client-generated placeholder until the
/// backend confirms them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageHash(pub String);

impl MessageHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Fresh placeholder identifier for a message that has not been confirmed yet.
    pub fn placeholder() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for MessageHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// Participant identity = base64 agent public key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AgentKey(pub String);

impl AgentKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Content-addressed handle of an attachment held in backend storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EntryHandle(pub String);

impl EntryHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated id threaded through a submit and echoed back by the
/// backend, so a pending message can be matched to its confirmation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_unique() {
        let a = MessageHash::placeholder();
        let b = MessageHash::placeholder();
        assert_ne!(a, b);
    }

    #[test]
    fn short_hash_handles_short_input() {
        assert_eq!(MessageHash::from("abc").short(), "abc");
        assert_eq!(MessageHash::from("uhCkkabcdefghijk").short(), "uhCkkabcdefg");
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&ConversationId::new("uhC0kDna")).unwrap();
        assert_eq!(json, "\"uhC0kDna\"");
        let hash: MessageHash = serde_json::from_str("\"uhCkkX\"").unwrap();
        assert_eq!(hash, MessageHash::from("uhCkkX"));
    }
}
