//! Wire-format decoders for the two DM protocols.
//!
//! Both decoders degrade instead of failing: a message that cannot be
//! decrypted still reaches the reducer as an errored placeholder so the UI
//! can mark the conversation. Only events that cannot be attributed to any
//! peer at all (NIP-04 addressed to ourselves, missing p-tag on a sent
//! message) are rejected outright.

use nostr_sdk::prelude::JsonUtil;
use nostr_sdk::signer::NostrSigner;
use nostr_sdk::{Event, Kind, PublicKey, TagKind, Tags, UnsignedEvent};
use std::sync::Arc;

use super::types::{DecryptedMessage, DmProtocol, FILE_MESSAGE_KIND};

/// A decoded message attributed to its conversation partner
#[derive(Clone, Debug)]
pub struct DecodedDm {
    pub message: DecryptedMessage,
    /// Peer pubkey hex the message buckets under
    pub partner: String,
    pub protocol: DmProtocol,
}

/// First p-tag value of an event, if any
fn p_tag_value(tags: &Tags) -> Option<String> {
    tags.iter()
        .find(|tag| tag.kind() == TagKind::p())
        .and_then(|tag| tag.content())
        .map(|s| s.to_string())
}

/// Resolve the conversation partner of a kind-4 event: the p-tag when the
/// user authored it, the author otherwise. `None` when the partner is
/// missing or resolves to the user themself.
pub fn nip04_partner(event: &Event, user: &PublicKey) -> Option<PublicKey> {
    let partner = if event.pubkey == *user {
        PublicKey::parse(&p_tag_value(&event.tags)?).ok()?
    } else {
        event.pubkey
    };

    if partner == *user {
        return None;
    }

    Some(partner)
}

/// Decode a kind-4 NIP-04 message. Returns `None` for events that cannot
/// be attributed to a peer; decrypt failures come back as errored messages.
pub async fn decode_nip04(
    event: &Event,
    user: &PublicKey,
    signer: Option<&Arc<dyn NostrSigner>>,
) -> Option<DecodedDm> {
    let partner = nip04_partner(event, user)?;

    let (decrypted_content, error) = match signer {
        Some(signer) => match signer.nip04_decrypt(&partner, &event.content).await {
            Ok(plaintext) => (Some(plaintext), None),
            Err(e) => {
                log::debug!("Failed to decrypt NIP-04 message {}: {}", event.id, e);
                (None, Some(format!("Failed to decrypt: {}", e)))
            }
        },
        None => (None, Some("No signer available".to_string())),
    };

    Some(DecodedDm {
        message: DecryptedMessage {
            id: event.id.to_hex(),
            pubkey: event.pubkey,
            created_at: event.created_at,
            kind: event.kind,
            tags: event.tags.clone(),
            content: event.content.clone(),
            sig: Some(event.sig.to_string()),
            decrypted_content,
            error,
            is_sending: false,
            client_first_seen: None,
            seal: None,
        },
        partner: partner.to_hex(),
        protocol: DmProtocol::Nip04,
    })
}

/// Unwrap a kind-1059 gift wrap down to its rumor:
/// outer NIP-44 decrypt -> kind-13 seal -> inner NIP-44 decrypt ->
/// kind-14/15 rumor, with the partner resolved from the seal author (or
/// the rumor's p-tag for our own sent copies).
async fn unwrap_gift_wrap(
    event: &Event,
    user: &PublicKey,
    signer: &Arc<dyn NostrSigner>,
) -> Result<(UnsignedEvent, Event, PublicKey), String> {
    let seal_json = signer
        .nip44_decrypt(&event.pubkey, &event.content)
        .await
        .map_err(|e| format!("Failed to decrypt gift wrap: {}", e))?;

    let seal = Event::from_json(&seal_json).map_err(|e| format!("Invalid seal JSON: {}", e))?;

    if seal.kind != Kind::Seal {
        return Err(format!("Expected kind 13 seal, got {}", seal.kind));
    }

    let rumor_json = signer
        .nip44_decrypt(&seal.pubkey, &seal.content)
        .await
        .map_err(|e| format!("Failed to decrypt seal: {}", e))?;

    let mut rumor =
        UnsignedEvent::from_json(&rumor_json).map_err(|e| format!("Invalid rumor JSON: {}", e))?;

    if rumor.kind != Kind::PrivateDirectMessage && rumor.kind != Kind::from(FILE_MESSAGE_KIND) {
        return Err(format!("Unsupported inner kind {}", rumor.kind));
    }

    let partner = if seal.pubkey == *user {
        // Our own sent copy: the partner is the rumor's recipient
        let recipient = p_tag_value(&rumor.tags).ok_or("Sent message has no recipient p-tag")?;
        PublicKey::parse(&recipient).map_err(|e| format!("Invalid recipient pubkey: {}", e))?
    } else {
        seal.pubkey
    };

    if partner == *user {
        return Err("Conversation partner resolves to ourselves".to_string());
    }

    // The rumor id is the canonical message id used for deduplication
    rumor.ensure_id();

    Ok((rumor, seal, partner))
}

/// Decode a kind-1059 gift wrap. Never rejects: undecodable wraps come
/// back as errored messages bucketed under the outer (ephemeral) author so
/// the UI can surface the failure.
pub async fn decode_nip17(
    event: &Event,
    user: &PublicKey,
    signer: Option<&Arc<dyn NostrSigner>>,
) -> DecodedDm {
    let result = match signer {
        Some(signer) => unwrap_gift_wrap(event, user, signer).await,
        None => Err("No signer available".to_string()),
    };

    match result {
        Ok((rumor, seal, partner)) => DecodedDm {
            message: DecryptedMessage {
                id: rumor.id.map(|id| id.to_hex()).unwrap_or_default(),
                pubkey: rumor.pubkey,
                // The rumor carries the real send time; the outer wrap's
                // created_at is fuzzed and must never order messages.
                created_at: rumor.created_at,
                kind: rumor.kind,
                tags: rumor.tags.clone(),
                content: event.content.clone(),
                sig: None,
                decrypted_content: Some(rumor.content),
                error: None,
                is_sending: false,
                client_first_seen: None,
                seal: Some(Box::new(seal)),
            },
            partner: partner.to_hex(),
            protocol: DmProtocol::Nip17,
        },
        Err(e) => {
            log::debug!("Failed to unwrap gift wrap {}: {}", event.id, e);
            DecodedDm {
                // Best-effort bucketing under the outer author
                message: DecryptedMessage {
                    id: event.id.to_hex(),
                    pubkey: event.pubkey,
                    created_at: event.created_at,
                    kind: event.kind,
                    tags: event.tags.clone(),
                    content: event.content.clone(),
                    sig: Some(event.sig.to_string()),
                    decrypted_content: None,
                    error: Some(e),
                    is_sending: false,
                    client_first_seen: None,
                    seal: None,
                },
                partner: event.pubkey.to_hex(),
                protocol: DmProtocol::Nip17,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::nips::nip44;
    use nostr_sdk::{EventBuilder, Keys, Tag, Timestamp};

    fn as_signer(keys: &Keys) -> Arc<dyn NostrSigner> {
        Arc::new(keys.clone())
    }

    async fn kind4_event(sender: &Keys, recipient: &PublicKey, text: &str) -> Event {
        let ciphertext = sender.nip04_encrypt(recipient, text).await.unwrap();
        EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
            .tags(vec![Tag::public_key(*recipient)])
            .build(sender.public_key())
            .sign(sender)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_nip04_received_message() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let event = kind4_event(&alice, &bob.public_key(), "hello bob").await;

        let signer = as_signer(&bob);
        let decoded = decode_nip04(&event, &bob.public_key(), Some(&signer))
            .await
            .expect("attributable");

        assert_eq!(decoded.partner, alice.public_key().to_hex());
        assert_eq!(decoded.message.decrypted_content.as_deref(), Some("hello bob"));
        assert!(decoded.message.error.is_none());
        assert_eq!(decoded.protocol, DmProtocol::Nip04);
    }

    #[tokio::test]
    async fn test_nip04_sent_message_buckets_under_recipient() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let event = kind4_event(&alice, &bob.public_key(), "hi").await;

        let signer = as_signer(&alice);
        let decoded = decode_nip04(&event, &alice.public_key(), Some(&signer))
            .await
            .expect("attributable");

        assert_eq!(decoded.partner, bob.public_key().to_hex());
        assert_eq!(decoded.message.decrypted_content.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_nip04_self_addressed_is_rejected() {
        let alice = Keys::generate();
        let event = kind4_event(&alice, &alice.public_key(), "note to self").await;

        let signer = as_signer(&alice);
        assert!(decode_nip04(&event, &alice.public_key(), Some(&signer))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_nip04_without_signer_is_errored_not_dropped() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let event = kind4_event(&alice, &bob.public_key(), "hello").await;

        let decoded = decode_nip04(&event, &bob.public_key(), None)
            .await
            .expect("attributable");
        assert!(decoded.message.decrypted_content.is_none());
        assert!(decoded.message.error.is_some());
    }

    #[tokio::test]
    async fn test_nip17_roundtrip_for_recipient() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let rumor = EventBuilder::private_msg_rumor(bob.public_key(), "wrapped hello")
            .build(alice.public_key());
        let alice_signer = as_signer(&alice);
        let wrap = EventBuilder::gift_wrap(&alice_signer, &bob.public_key(), rumor, [])
            .await
            .unwrap();

        let bob_signer = as_signer(&bob);
        let decoded = decode_nip17(&wrap, &bob.public_key(), Some(&bob_signer)).await;

        assert_eq!(decoded.partner, alice.public_key().to_hex());
        assert_eq!(
            decoded.message.decrypted_content.as_deref(),
            Some("wrapped hello")
        );
        assert_eq!(decoded.message.pubkey, alice.public_key());
        assert_eq!(decoded.message.kind, Kind::PrivateDirectMessage);
        assert!(decoded.message.seal.is_some());
        assert!(decoded.message.error.is_none());
        // The ephemeral wrap author never leaks into the message identity
        assert_ne!(decoded.message.pubkey, wrap.pubkey);
    }

    #[tokio::test]
    async fn test_nip17_own_copy_buckets_under_recipient() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let rumor = EventBuilder::private_msg_rumor(bob.public_key(), "my own copy")
            .build(alice.public_key());
        let alice_signer = as_signer(&alice);
        // The self-addressed wrap a sender publishes for their own history
        let wrap = EventBuilder::gift_wrap(&alice_signer, &alice.public_key(), rumor, [])
            .await
            .unwrap();

        let decoded = decode_nip17(&wrap, &alice.public_key(), Some(&alice_signer)).await;

        assert_eq!(decoded.partner, bob.public_key().to_hex());
        assert_eq!(decoded.message.decrypted_content.as_deref(), Some("my own copy"));
    }

    #[tokio::test]
    async fn test_nip17_uses_rumor_timestamp_not_fuzzed_outer() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let rumor = EventBuilder::private_msg_rumor(bob.public_key(), "timing")
            .custom_created_at(Timestamp::from(1_700_000_000))
            .build(alice.public_key());
        let alice_signer = as_signer(&alice);
        let wrap = EventBuilder::gift_wrap(&alice_signer, &bob.public_key(), rumor, [])
            .await
            .unwrap();

        let bob_signer = as_signer(&bob);
        let decoded = decode_nip17(&wrap, &bob.public_key(), Some(&bob_signer)).await;

        assert_eq!(decoded.message.created_at, Timestamp::from(1_700_000_000));
    }

    #[tokio::test]
    async fn test_nip17_invalid_inner_kind_is_errored() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        // Hand-roll a wrap whose rumor is a plain kind-1 note
        let mut rumor = EventBuilder::new(Kind::TextNote, "not a DM").build(alice.public_key());
        rumor.ensure_id();
        let seal_content = nip44::encrypt(
            alice.secret_key(),
            &bob.public_key(),
            rumor.as_json(),
            nip44::Version::V2,
        )
        .unwrap();
        let seal = EventBuilder::new(Kind::Seal, seal_content)
            .build(alice.public_key())
            .sign(&alice)
            .await
            .unwrap();

        let ephemeral = Keys::generate();
        let wrap_content = nip44::encrypt(
            ephemeral.secret_key(),
            &bob.public_key(),
            seal.as_json(),
            nip44::Version::V2,
        )
        .unwrap();
        let wrap = EventBuilder::new(Kind::GiftWrap, wrap_content)
            .tags(vec![Tag::public_key(bob.public_key())])
            .build(ephemeral.public_key())
            .sign(&ephemeral)
            .await
            .unwrap();

        let bob_signer = as_signer(&bob);
        let decoded = decode_nip17(&wrap, &bob.public_key(), Some(&bob_signer)).await;

        assert!(decoded.message.error.is_some());
        assert!(decoded.message.decrypted_content.is_none());
        // Errored wraps bucket under the outer (ephemeral) author
        assert_eq!(decoded.partner, ephemeral.public_key().to_hex());
    }

    #[tokio::test]
    async fn test_fresh_user_with_two_gift_wraps_builds_one_conversation() {
        use crate::stores::dm::reducer;
        use crate::stores::dm::types::DmSettings;
        use std::collections::HashMap;

        let alice = Keys::generate();
        let bob = Keys::generate();
        let alice_signer = as_signer(&alice);
        let bob_signer = as_signer(&bob);

        // Alice writes to Bob; Bob replies, and only his self-addressed
        // copy is on the relay (the copy path every sender produces).
        let inbound = EventBuilder::private_msg_rumor(bob.public_key(), "hi")
            .custom_created_at(Timestamp::from(1_700_000_000))
            .build(alice.public_key());
        let wrap_in = EventBuilder::gift_wrap(&alice_signer, &bob.public_key(), inbound, [])
            .await
            .unwrap();

        let outbound = EventBuilder::private_msg_rumor(alice.public_key(), "yo")
            .custom_created_at(Timestamp::from(1_700_000_100))
            .build(bob.public_key());
        let wrap_out = EventBuilder::gift_wrap(&bob_signer, &bob.public_key(), outbound, [])
            .await
            .unwrap();

        let decoded = vec![
            decode_nip17(&wrap_in, &bob.public_key(), Some(&bob_signer)).await,
            decode_nip17(&wrap_out, &bob.public_key(), Some(&bob_signer)).await,
        ];

        let mut map = HashMap::new();
        let inserted = reducer::merge_batch(
            &mut map,
            decoded,
            &bob.public_key().to_hex(),
            &DmSettings::default(),
            1_700_010_000,
        );

        assert_eq!(inserted, 2);
        assert_eq!(map.len(), 1);
        let bucket = map.get(&alice.public_key().to_hex()).unwrap();
        assert_eq!(bucket.messages.len(), 2);
        assert_eq!(bucket.messages[0].decrypted_content.as_deref(), Some("hi"));
        assert_eq!(bucket.messages[1].decrypted_content.as_deref(), Some("yo"));
        assert!(bucket.has_nip17);
        assert!(!bucket.has_nip04);

        let summaries = reducer::conversation_summaries(&map, &bob.public_key().to_hex());
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].is_known);
        assert!(summaries[0].last_message_from_user);
    }

    #[tokio::test]
    async fn test_nip17_without_signer_is_errored() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let rumor = EventBuilder::private_msg_rumor(bob.public_key(), "sealed")
            .build(alice.public_key());
        let alice_signer = as_signer(&alice);
        let wrap = EventBuilder::gift_wrap(&alice_signer, &bob.public_key(), rumor, [])
            .await
            .unwrap();

        let decoded = decode_nip17(&wrap, &bob.public_key(), None).await;
        assert!(decoded.message.error.is_some());
        assert_eq!(decoded.partner, wrap.pubkey.to_hex());
    }
}
