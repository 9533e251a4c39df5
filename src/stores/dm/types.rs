//! Data model for the direct-message engine.
//!
//! Everything here is a plain value type so the reducer and cache logic can
//! be exercised natively without a reactive runtime; the stores in
//! `dm::mod` wrap these in signals.

use nostr_sdk::{Event, Kind, PublicKey, Tags, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind 15: NIP-17 private message carrying file attachments
pub const FILE_MESSAGE_KIND: u16 = 15;

/// Wire protocol a DM travelled over
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmProtocol {
    Nip04,
    Nip17,
}

/// Which protocols the engine actively uses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMode {
    /// NIP-17 with NIP-04 kept readable and sendable (default)
    Both,
    /// Legacy-only operation; gift-wrap backfill/subscription/send disabled
    Nip04Only,
}

/// Engine settings surfaced to the host app
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DmSettings {
    pub protocol_mode: ProtocolMode,
    /// Whether a gift wrap that failed to decode still marks the
    /// conversation as NIP-17-capable. Defaults to true, preserving the
    /// historical behavior of bucketing undecodable wraps.
    pub errored_nip17_sets_flag: bool,
}

impl Default for DmSettings {
    fn default() -> Self {
        Self {
            protocol_mode: ProtocolMode::Both,
            errored_nip17_sets_flag: true,
        }
    }
}

impl DmSettings {
    pub fn nip17_enabled(&self) -> bool {
        self.protocol_mode == ProtocolMode::Both
    }
}

/// Loader phase of the DM engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadingPhase {
    Idle,
    Cache,
    Relays,
    Subscriptions,
    Ready,
}

/// A single decrypted direct message as the UI sees it.
///
/// For NIP-04 this mirrors the kind-4 event with `decrypted_content` filled
/// in; for NIP-17 the identity fields come from the inner rumor (the outer
/// gift wrap's fuzzed `created_at` is never used for ordering) while
/// `content` keeps the original wire blob for audit.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedMessage {
    /// Canonical message id: the event id hex for real messages, an
    /// `optimistic-…` token for not-yet-confirmed sends.
    pub id: String,
    /// Author of the message (the true sender for NIP-17)
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Tags,
    /// Original wire content (ciphertext); empty for optimistic messages
    pub content: String,
    /// Signature hex; `None` for optimistic messages and NIP-17 rumors
    pub sig: Option<String>,
    /// Plaintext, when decryption succeeded
    pub decrypted_content: Option<String>,
    /// Why decryption failed, when it did
    pub error: Option<String>,
    /// True while an optimistic send awaits its published counterpart
    pub is_sending: bool,
    /// Wall-clock stamp for just-arrived messages (UI animation hint only,
    /// never persisted, never used for ordering)
    pub client_first_seen: Option<u64>,
    /// The kind-13 seal this message arrived in, kept for future re-use
    pub seal: Option<Box<Event>>,
}

impl DecryptedMessage {
    /// Whether the message carries usable plaintext
    pub fn is_decrypted(&self) -> bool {
        self.decrypted_content.is_some() && self.error.is_none()
    }
}

/// One peer conversation bucket
#[derive(Clone, Debug, PartialEq)]
pub struct Participant {
    /// Peer pubkey hex (also the map key)
    pub pubkey: String,
    /// Messages sorted ascending by `created_at`
    pub messages: Vec<DecryptedMessage>,
    /// `created_at` of the newest message
    pub last_activity: Timestamp,
    pub has_nip04: bool,
    pub has_nip17: bool,
}

impl Participant {
    pub fn new(pubkey: String) -> Self {
        Self {
            pubkey,
            messages: Vec::new(),
            last_activity: Timestamp::from(0),
            has_nip04: false,
            has_nip17: false,
        }
    }

    /// The newest message, if any
    pub fn last_message(&self) -> Option<&DecryptedMessage> {
        self.messages.last()
    }
}

/// Conversation map: peer pubkey hex -> bucket
pub type ConversationMap = HashMap<String, Participant>;

/// Per-protocol high-water timestamps (seconds)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSync {
    pub nip4: Option<u64>,
    pub nip17: Option<u64>,
}

impl LastSync {
    pub fn get(&self, protocol: DmProtocol) -> Option<u64> {
        match protocol {
            DmProtocol::Nip04 => self.nip4,
            DmProtocol::Nip17 => self.nip17,
        }
    }

    pub fn set(&mut self, protocol: DmProtocol, value: u64) {
        match protocol {
            DmProtocol::Nip04 => self.nip4 = Some(value),
            DmProtocol::Nip17 => self.nip17 = Some(value),
        }
    }
}

/// Live subscription status per protocol
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub nip04_connected: bool,
    pub nip17_connected: bool,
}

/// Backfill progress surfaced to the UI while scanning relays
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanProgress {
    pub protocol: DmProtocol,
    pub scanned: usize,
    pub cap: usize,
}

/// Derived list item for the conversation sidebar
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationSummary {
    pub pubkey: String,
    pub last_message: Option<DecryptedMessage>,
    pub last_activity: Timestamp,
    pub has_nip04: bool,
    pub has_nip17: bool,
    /// The user has sent at least one message to this peer
    pub is_known: bool,
    /// Inverse of `is_known`: an unsolicited conversation
    pub is_request: bool,
    pub last_message_from_user: bool,
}

/// Prevalidated upload metadata handed over by the file-upload path.
/// `tags` carries integrity hash entries such as `["x", "<sha256>"]`.
#[derive(Clone, Debug, PartialEq)]
pub struct DmAttachment {
    pub url: String,
    pub mime_type: String,
    pub size: u64,
    pub name: String,
    pub tags: Vec<Vec<String>>,
}

/// Parameters for `send_message`
#[derive(Clone, Debug)]
pub struct SendMessageParams {
    pub recipient: String,
    pub content: String,
    pub protocol: DmProtocol,
    pub attachments: Vec<DmAttachment>,
}

// --- Persisted cache document -------------------------------------------
//
// Messages are stored with *plaintext* content: the whole document is
// sealed as one NIP-44 blob, so loading the cache costs one decryption
// instead of one per message, and the at-rest format never carries
// plaintext outside the envelope when a signer is present.

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedMessage {
    pub id: String,
    pub pubkey: PublicKey,
    pub content: String,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Tags,
    pub sig: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedParticipant {
    pub messages: Vec<CachedMessage>,
    #[serde(rename = "lastActivity")]
    pub last_activity: u64,
    #[serde(rename = "hasNIP4")]
    pub has_nip4: bool,
    #[serde(rename = "hasNIP17")]
    pub has_nip17: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheDocument {
    pub participants: HashMap<String, CachedParticipant>,
    #[serde(rename = "lastSync")]
    pub last_sync: LastSync,
}

impl DecryptedMessage {
    /// Cached form of this message, or `None` for optimistic placeholders
    /// (an unconfirmed send must not come back from disk looking real).
    pub fn to_cached(&self) -> Option<CachedMessage> {
        if self.is_sending {
            return None;
        }
        Some(CachedMessage {
            id: self.id.clone(),
            pubkey: self.pubkey,
            content: self.decrypted_content.clone().unwrap_or_default(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            sig: self.sig.clone().unwrap_or_default(),
        })
    }

    /// Rebuild a message from its cached form. Content inside the envelope
    /// is plaintext, so it is copied straight into `decrypted_content`;
    /// an empty content marks a message that never decrypted.
    pub fn from_cached(cached: CachedMessage) -> Self {
        let (decrypted_content, error) = if cached.content.is_empty() {
            (None, Some("Unable to decrypt message".to_string()))
        } else {
            (Some(cached.content.clone()), None)
        };
        Self {
            id: cached.id,
            pubkey: cached.pubkey,
            created_at: cached.created_at,
            kind: cached.kind,
            tags: cached.tags,
            content: cached.content,
            sig: if cached.sig.is_empty() {
                None
            } else {
                Some(cached.sig)
            },
            decrypted_content,
            error,
            is_sending: false,
            client_first_seen: None,
            seal: None,
        }
    }
}

impl Participant {
    pub fn to_cached(&self) -> CachedParticipant {
        CachedParticipant {
            messages: self.messages.iter().filter_map(|m| m.to_cached()).collect(),
            last_activity: self.last_activity.as_secs(),
            has_nip4: self.has_nip04,
            has_nip17: self.has_nip17,
        }
    }

    pub fn from_cached(pubkey: String, cached: CachedParticipant) -> Self {
        let messages: Vec<DecryptedMessage> = cached
            .messages
            .into_iter()
            .map(DecryptedMessage::from_cached)
            .collect();
        let last_activity = messages
            .last()
            .map(|m| m.created_at)
            .unwrap_or_else(|| Timestamp::from(cached.last_activity));
        Self {
            pubkey,
            messages,
            last_activity,
            has_nip04: cached.has_nip4,
            has_nip17: cached.has_nip17,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::Keys;

    fn message(id: &str, created_at: u64, text: &str) -> DecryptedMessage {
        DecryptedMessage {
            id: id.to_string(),
            pubkey: Keys::generate().public_key(),
            created_at: Timestamp::from(created_at),
            kind: Kind::PrivateDirectMessage,
            tags: Tags::new(),
            content: String::new(),
            sig: None,
            decrypted_content: Some(text.to_string()),
            error: None,
            is_sending: false,
            client_first_seen: Some(123),
            seal: None,
        }
    }

    #[test]
    fn test_cached_roundtrip_copies_plaintext() {
        let msg = message("a1", 1_700_000_000, "hello");
        let cached = msg.to_cached().expect("not optimistic");
        assert_eq!(cached.content, "hello");

        let restored = DecryptedMessage::from_cached(cached);
        assert_eq!(restored.decrypted_content.as_deref(), Some("hello"));
        assert!(restored.error.is_none());
        // UI hint must not survive persistence
        assert_eq!(restored.client_first_seen, None);
    }

    #[test]
    fn test_optimistic_messages_are_not_persisted() {
        let mut msg = message("optimistic-1", 1_700_000_000, "pending");
        msg.is_sending = true;
        assert!(msg.to_cached().is_none());
    }

    #[test]
    fn test_empty_cached_content_restores_as_errored() {
        let mut msg = message("a2", 1_700_000_000, "x");
        msg.decrypted_content = None;
        let cached = msg.to_cached().unwrap();
        let restored = DecryptedMessage::from_cached(cached);
        assert!(restored.decrypted_content.is_none());
        assert!(restored.error.is_some());
    }

    #[test]
    fn test_cache_document_wire_format() {
        let mut doc = CacheDocument::default();
        doc.last_sync.nip4 = Some(1_700_000_000);
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"lastSync\""));
        assert!(json.contains("\"nip4\":1700000000"));
        assert!(json.contains("\"nip17\":null"));

        let participant = Participant {
            pubkey: "ab".into(),
            messages: vec![message("m1", 10, "hi")],
            last_activity: Timestamp::from(10),
            has_nip04: true,
            has_nip17: false,
        };
        let cached = participant.to_cached();
        let json = serde_json::to_string(&cached).unwrap();
        assert!(json.contains("\"lastActivity\":10"));
        assert!(json.contains("\"hasNIP4\":true"));
        assert!(json.contains("\"hasNIP17\":false"));
    }

    #[test]
    fn test_last_sync_accessors() {
        let mut sync = LastSync::default();
        assert_eq!(sync.get(DmProtocol::Nip04), None);
        sync.set(DmProtocol::Nip04, 100);
        sync.set(DmProtocol::Nip17, 200);
        assert_eq!(sync.get(DmProtocol::Nip04), Some(100));
        assert_eq!(sync.get(DmProtocol::Nip17), Some(200));
    }
}
