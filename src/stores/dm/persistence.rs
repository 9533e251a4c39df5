//! Persistence scheduling for the conversation cache.
//!
//! Every map mutation requests a write; the debouncer collapses bursts
//! (live subscription traffic, batched backfill merges) into one flush
//! per window. The orchestrator forces an immediate flush after a
//! backfill that produced new messages so a mid-sync tab close loses at
//! most the debounce window.

use dioxus::prelude::*;
use dioxus::signals::ReadableExt;
use nostr_sdk::PublicKey;

use crate::stores::{auth_store, nostr_client};
use crate::utils::debounce::Debouncer;
use crate::utils::time::sleep_ms;

use super::types::{CacheDocument, ConversationMap, LastSync};
use super::{cache, ConversationMapStoreStoreExt, DM_CONVERSATIONS, LAST_SYNC};

/// Debounce window for cache writes
pub const SAVE_DEBOUNCE_MS: u64 = 15_000;

static SAVE_DEBOUNCER: Debouncer = Debouncer::new();

/// Serialize the current conversation map and watermarks into the
/// persisted document shape. Optimistic placeholders are dropped by
/// `Participant::to_cached`.
pub fn build_cache_document(map: &ConversationMap, last_sync: LastSync) -> CacheDocument {
    CacheDocument {
        participants: map
            .iter()
            .map(|(pubkey, participant)| (pubkey.clone(), participant.to_cached()))
            .collect(),
        last_sync,
    }
}

/// Arm (or re-arm) the 15-second save timer
pub fn schedule_debounced() {
    let token = SAVE_DEBOUNCER.arm();
    spawn(async move {
        sleep_ms(SAVE_DEBOUNCE_MS).await;
        if SAVE_DEBOUNCER.is_current(token) {
            flush().await;
        }
    });
}

/// Flush now, cancelling any pending debounced save
pub async fn flush_immediate() {
    SAVE_DEBOUNCER.cancel();
    flush().await;
}

/// Drop any pending save without writing (account teardown)
pub fn cancel_pending() {
    SAVE_DEBOUNCER.cancel();
}

async fn flush() {
    let user = match auth_store::get_pubkey().and_then(|pk| PublicKey::parse(&pk).ok()) {
        Some(user) => user,
        None => return,
    };

    let document = {
        let store = DM_CONVERSATIONS.read();
        let data = store.data();
        let map = data.read();
        build_cache_document(&map, *LAST_SYNC.read())
    };

    let signer = match nostr_client::get_client() {
        Some(client) => client.signer().await.ok(),
        None => None,
    };

    if let Err(e) = cache::write(&user, &document, signer.as_ref()).await {
        log::warn!("Failed to persist DM cache: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::dm::types::{DecryptedMessage, Participant};
    use nostr_sdk::{Keys, Kind, Tags, Timestamp};
    use std::collections::HashMap;

    fn message(id: &str, text: &str, is_sending: bool) -> DecryptedMessage {
        DecryptedMessage {
            id: id.to_string(),
            pubkey: Keys::generate().public_key(),
            created_at: Timestamp::from(1_700_000_000),
            kind: Kind::PrivateDirectMessage,
            tags: Tags::new(),
            content: String::new(),
            sig: None,
            decrypted_content: Some(text.to_string()),
            error: None,
            is_sending,
            client_first_seen: None,
            seal: None,
        }
    }

    #[test]
    fn test_document_carries_plaintext_and_watermarks() {
        let mut map: ConversationMap = HashMap::new();
        map.insert(
            "peer".into(),
            Participant {
                pubkey: "peer".into(),
                messages: vec![message("a", "hello", false)],
                last_activity: Timestamp::from(1_700_000_000),
                has_nip04: true,
                has_nip17: false,
            },
        );
        let last_sync = LastSync {
            nip4: Some(42),
            nip17: None,
        };

        let doc = build_cache_document(&map, last_sync);
        assert_eq!(doc.last_sync, last_sync);
        let cached = doc.participants.get("peer").unwrap();
        assert_eq!(cached.messages.len(), 1);
        assert_eq!(cached.messages[0].content, "hello");
        assert!(cached.has_nip4);
    }

    #[test]
    fn test_pending_sends_are_not_written_to_disk() {
        let mut map: ConversationMap = HashMap::new();
        map.insert(
            "peer".into(),
            Participant {
                pubkey: "peer".into(),
                messages: vec![message("a", "sent", false), message("optimistic-1", "pending", true)],
                last_activity: Timestamp::from(1_700_000_000),
                has_nip04: true,
                has_nip17: false,
            },
        );

        let doc = build_cache_document(&map, LastSync::default());
        let cached = doc.participants.get("peer").unwrap();
        assert_eq!(cached.messages.len(), 1);
        assert_eq!(cached.messages[0].id, "a");
    }
}
