use serde::{Deserialize, Serialize};
use std::fmt;

/// Database id of a local profile.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub i64);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profile-{}", self.0)
    }
}

/// Database id of a contact, unique within its owning profile.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contact-{}", self.0)
    }
}

/// Opaque identity material for a profile (interpreted only by the transport).
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(material: impl Into<String>) -> Self {
        Self(material.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Never print key material.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity(..)")
    }
}

/// Opaque dial target for a contact.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteAddress(String);

impl RemoteAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the remote end of a stream, as reported by the transport.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a peer connection's stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Dialing; no stream installed yet
    Pending,
    /// Stream installed and usable
    Open,
    /// Stream ended or the connection was removed
    Closed,
}

/// A chat message. Immutable once built; this is also the wire document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub creation_timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub file: Option<String>,
    pub text: String,
    pub markdown: bool,
}

/// Sender/receiver ids for a message.
///
/// Direction-sensitive: on send, sender is the local profile and receiver is
/// the contact; on notify, sender is the contact and receiver is the profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    pub sender_db_id: i64,
    pub receiver_db_id: i64,
}

impl Addressing {
    /// Addressing for an outbound message from `profile` to `contact`.
    pub fn outbound(profile: ProfileId, contact: ContactId) -> Self {
        Self {
            sender_db_id: profile.0,
            receiver_db_id: contact.0,
        }
    }

    /// Addressing for an inbound message from `contact` delivered to `profile`.
    pub fn inbound(contact: ContactId, profile: ProfileId) -> Self {
        Self {
            sender_db_id: contact.0,
            receiver_db_id: profile.0,
        }
    }

    pub fn sender_profile(&self) -> ProfileId {
        ProfileId(self.sender_db_id)
    }

    pub fn receiver_contact(&self) -> ContactId {
        ContactId(self.receiver_db_id)
    }
}

/// The `{message, addressing}` pair handed to the frontend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
    pub addressing: Addressing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_uses_wire_field_names() {
        let msg = Message {
            creation_timestamp: 1700000000,
            kind: "text".into(),
            file: None,
            text: "hi".into(),
            markdown: true,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["creation_timestamp"], 1700000000);
        assert!(value["file"].is_null());
        assert_eq!(value["markdown"], true);
    }

    #[test]
    fn message_file_may_be_omitted() {
        let json = r#"{"creation_timestamp":1,"type":"text","text":"x","markdown":false}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(msg.file.is_none());
    }

    #[test]
    fn addressing_mirrors_between_directions() {
        let out = Addressing::outbound(ProfileId(1), ContactId(9));
        assert_eq!(out.sender_profile(), ProfileId(1));
        assert_eq!(out.receiver_contact(), ContactId(9));

        let back = Addressing::inbound(out.receiver_contact(), out.sender_profile());
        assert_eq!(back.sender_db_id, 9);
        assert_eq!(back.receiver_db_id, 1);
    }

    #[test]
    fn identity_debug_hides_material() {
        let id = Identity::new("super-secret");
        assert!(!format!("{id:?}").contains("super-secret"));
    }
}
