//! State reducer for the conversation map.
//!
//! All ingestion paths (cache load, relay backfill, live subscriptions,
//! optimistic sends) funnel through these functions, which are written as
//! atomic transformations over the current map so interleaved awaits in
//! the callers can never act on stale captures. Deduplication is by
//! message id, so delivering the same event any number of times is a
//! no-op after the first.

use nostr_sdk::Timestamp;

use super::decoder::DecodedDm;
use super::types::{
    ConversationMap, ConversationSummary, DecryptedMessage, DmProtocol, DmSettings, Participant,
};

/// Matching window for reconciling an optimistic send with its published
/// counterpart (seconds either side of the optimistic timestamp).
pub const OPTIMISTIC_MATCH_WINDOW_SECS: u64 = 30;

/// Messages younger than this get a `client_first_seen` stamp so the UI
/// can animate their arrival.
const JUST_ARRIVED_WINDOW_SECS: u64 = 5;

fn timestamp_diff(a: Timestamp, b: Timestamp) -> u64 {
    a.as_secs().abs_diff(b.as_secs())
}

fn recompute(bucket: &mut Participant) {
    bucket
        .messages
        .sort_by(|a, b| a.created_at.cmp(&b.created_at));
    bucket.last_activity = bucket
        .messages
        .last()
        .map(|m| m.created_at)
        .unwrap_or_else(|| Timestamp::from(0));
}

fn mark_protocol(bucket: &mut Participant, message: &DecryptedMessage, protocol: DmProtocol, settings: &DmSettings) {
    match protocol {
        DmProtocol::Nip04 => bucket.has_nip04 = true,
        DmProtocol::Nip17 => {
            if message.error.is_none() || settings.errored_nip17_sets_flag {
                bucket.has_nip17 = true;
            }
        }
    }
}

fn stamp_just_arrived(message: &mut DecryptedMessage, now_secs: u64) {
    if message.client_first_seen.is_none()
        && now_secs.saturating_sub(message.created_at.as_secs()) < JUST_ARRIVED_WINDOW_SECS
    {
        message.client_first_seen = Some(now_secs);
    }
}

/// Insert a single decoded message into its partner bucket.
///
/// Order of precedence: an already-present id is a no-op; a pending
/// optimistic twin (same author, same plaintext, within the match window)
/// is replaced in place, keeping the optimistic `created_at` and
/// `client_first_seen` so the message does not jump position; anything
/// else is appended. Returns whether the map changed.
pub fn add_single(
    map: &mut ConversationMap,
    decoded: DecodedDm,
    user_hex: &str,
    settings: &DmSettings,
    now_secs: u64,
) -> bool {
    let DecodedDm {
        mut message,
        partner,
        protocol,
    } = decoded;

    // A conversation keyed by ourselves can never exist
    if partner == user_hex {
        log::warn!("Dropping message {} attributed to the user themself", message.id);
        return false;
    }

    let bucket = map
        .entry(partner.clone())
        .or_insert_with(|| Participant::new(partner));

    if bucket.messages.iter().any(|m| m.id == message.id) {
        return false;
    }

    if !message.is_sending {
        let twin = bucket.messages.iter().position(|m| {
            m.is_sending
                && m.pubkey == message.pubkey
                && m.decrypted_content.is_some()
                && m.decrypted_content == message.decrypted_content
                && timestamp_diff(m.created_at, message.created_at) <= OPTIMISTIC_MATCH_WINDOW_SECS
        });

        if let Some(pos) = twin {
            let optimistic = &bucket.messages[pos];
            message.created_at = optimistic.created_at;
            message.client_first_seen = optimistic.client_first_seen;
            message.is_sending = false;
            bucket.messages[pos] = message.clone();
            mark_protocol(bucket, &message, protocol, settings);
            recompute(bucket);
            return true;
        }
    }

    stamp_just_arrived(&mut message, now_secs);
    mark_protocol(bucket, &message, protocol, settings);
    bucket.messages.push(message);
    recompute(bucket);
    true
}

/// Merge a backfill batch. Deduplicates by id (first write wins), then
/// re-sorts every touched bucket and recomputes its derived fields.
/// Returns the number of newly inserted messages.
pub fn merge_batch(
    map: &mut ConversationMap,
    batch: Vec<DecodedDm>,
    user_hex: &str,
    settings: &DmSettings,
    now_secs: u64,
) -> usize {
    let mut inserted = 0;

    for decoded in batch {
        let DecodedDm {
            mut message,
            partner,
            protocol,
        } = decoded;

        if partner == user_hex {
            continue;
        }

        let bucket = map
            .entry(partner.clone())
            .or_insert_with(|| Participant::new(partner));

        if bucket.messages.iter().any(|m| m.id == message.id) {
            continue;
        }

        stamp_just_arrived(&mut message, now_secs);
        mark_protocol(bucket, &message, protocol, settings);
        bucket.messages.push(message);
        inserted += 1;
    }

    for bucket in map.values_mut() {
        recompute(bucket);
    }

    inserted
}

/// Insert an optimistic placeholder, using the same path as `add_single`
pub fn apply_optimistic(
    map: &mut ConversationMap,
    message: DecryptedMessage,
    partner: String,
    protocol: DmProtocol,
    user_hex: &str,
    settings: &DmSettings,
    now_secs: u64,
) {
    add_single(
        map,
        DecodedDm {
            message,
            partner,
            protocol,
        },
        user_hex,
        settings,
        now_secs,
    );
}

/// Derive the conversation list, newest activity first
pub fn conversation_summaries(map: &ConversationMap, user_hex: &str) -> Vec<ConversationSummary> {
    let mut summaries: Vec<ConversationSummary> = map
        .values()
        .map(|participant| {
            let is_known = participant
                .messages
                .iter()
                .any(|m| m.pubkey.to_hex() == user_hex);
            let last_message = participant.last_message().cloned();
            let last_message_from_user = last_message
                .as_ref()
                .map(|m| m.pubkey.to_hex() == user_hex)
                .unwrap_or(false);
            ConversationSummary {
                pubkey: participant.pubkey.clone(),
                last_activity: participant.last_activity,
                last_message,
                has_nip04: participant.has_nip04,
                has_nip17: participant.has_nip17,
                is_known,
                is_request: !is_known,
                last_message_from_user,
            }
        })
        .collect();

    summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::{Keys, Kind, PublicKey, Tags, Timestamp};
    use std::collections::HashMap;

    const NOW: u64 = 1_700_010_000;

    fn settings() -> DmSettings {
        DmSettings::default()
    }

    fn message(id: &str, author: PublicKey, created_at: u64, text: &str) -> DecryptedMessage {
        DecryptedMessage {
            id: id.to_string(),
            pubkey: author,
            created_at: Timestamp::from(created_at),
            kind: Kind::PrivateDirectMessage,
            tags: Tags::new(),
            content: String::new(),
            sig: Some("sig".into()),
            decrypted_content: Some(text.to_string()),
            error: None,
            is_sending: false,
            client_first_seen: None,
            seal: None,
        }
    }

    fn decoded(
        id: &str,
        author: PublicKey,
        partner: &PublicKey,
        created_at: u64,
        text: &str,
        protocol: DmProtocol,
    ) -> DecodedDm {
        DecodedDm {
            message: message(id, author, created_at, text),
            partner: partner.to_hex(),
            protocol,
        }
    }

    fn assert_invariants(map: &ConversationMap) {
        for participant in map.values() {
            for pair in participant.messages.windows(2) {
                assert!(pair[0].created_at <= pair[1].created_at);
            }
            if let Some(last) = participant.messages.last() {
                assert_eq!(participant.last_activity, last.created_at);
            }
        }
    }

    #[test]
    fn test_merge_groups_and_sorts() {
        let user = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut map = HashMap::new();

        let batch = vec![
            decoded("b", peer, &peer, 200, "second", DmProtocol::Nip17),
            decoded("a", peer, &peer, 100, "first", DmProtocol::Nip17),
            decoded("c", user, &peer, 300, "reply", DmProtocol::Nip17),
        ];
        let inserted = merge_batch(&mut map, batch, &user.to_hex(), &settings(), NOW);

        assert_eq!(inserted, 3);
        assert_eq!(map.len(), 1);
        let bucket = map.get(&peer.to_hex()).unwrap();
        let ids: Vec<&str> = bucket.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(bucket.has_nip17);
        assert!(!bucket.has_nip04);
        assert_invariants(&map);
    }

    #[test]
    fn test_ingesting_twice_is_idempotent() {
        let user = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut map = HashMap::new();

        let batch = vec![decoded("a", peer, &peer, 100, "hi", DmProtocol::Nip04)];
        assert_eq!(
            merge_batch(&mut map, batch.clone(), &user.to_hex(), &settings(), NOW),
            1
        );
        let snapshot = map.clone();
        assert_eq!(
            merge_batch(&mut map, batch, &user.to_hex(), &settings(), NOW),
            0
        );
        assert_eq!(map, snapshot);

        // Same event via the single-message path is also a no-op
        assert!(!add_single(
            &mut map,
            decoded("a", peer, &peer, 100, "hi", DmProtocol::Nip04),
            &user.to_hex(),
            &settings(),
            NOW
        ));
        assert_eq!(map, snapshot);
    }

    #[test]
    fn test_user_keyed_bucket_is_never_created() {
        let user = Keys::generate().public_key();
        let mut map = HashMap::new();

        let batch = vec![decoded("a", user, &user, 100, "echo", DmProtocol::Nip04)];
        assert_eq!(
            merge_batch(&mut map, batch, &user.to_hex(), &settings(), NOW),
            0
        );
        assert!(map.is_empty());
    }

    #[test]
    fn test_optimistic_reconciliation_preserves_ordering_fields() {
        let user = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut map = HashMap::new();

        let mut optimistic = message("optimistic-1", user, 1_700_001_000, "ping");
        optimistic.kind = Kind::EncryptedDirectMessage;
        optimistic.sig = None;
        optimistic.is_sending = true;
        optimistic.client_first_seen = Some(1_700_001_000);
        apply_optimistic(
            &mut map,
            optimistic,
            peer.to_hex(),
            DmProtocol::Nip04,
            &user.to_hex(),
            &settings(),
            NOW,
        );
        assert!(map.get(&peer.to_hex()).unwrap().messages[0].is_sending);

        // The published counterpart arrives five seconds later
        let mut real = message("X", user, 1_700_001_005, "ping");
        real.kind = Kind::EncryptedDirectMessage;
        let changed = add_single(
            &mut map,
            DecodedDm {
                message: real,
                partner: peer.to_hex(),
                protocol: DmProtocol::Nip04,
            },
            &user.to_hex(),
            &settings(),
            NOW,
        );

        assert!(changed);
        let bucket = map.get(&peer.to_hex()).unwrap();
        assert_eq!(bucket.messages.len(), 1);
        let reconciled = &bucket.messages[0];
        // Real identity, optimistic position
        assert_eq!(reconciled.id, "X");
        assert!(!reconciled.is_sending);
        assert_eq!(reconciled.sig.as_deref(), Some("sig"));
        assert_eq!(reconciled.created_at, Timestamp::from(1_700_001_000));
        assert_eq!(reconciled.client_first_seen, Some(1_700_001_000));
        assert_invariants(&map);
    }

    #[test]
    fn test_reconciliation_requires_same_author_text_and_window() {
        let user = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut map = HashMap::new();

        let mut optimistic = message("optimistic-1", user, 1_700_001_000, "ping");
        optimistic.is_sending = true;
        apply_optimistic(
            &mut map,
            optimistic,
            peer.to_hex(),
            DmProtocol::Nip04,
            &user.to_hex(),
            &settings(),
            NOW,
        );

        // Different plaintext: appended, not reconciled
        add_single(
            &mut map,
            decoded("Y", user, &peer, 1_700_001_001, "pong", DmProtocol::Nip04),
            &user.to_hex(),
            &settings(),
            NOW,
        );
        // Outside the 30s window: appended, not reconciled
        add_single(
            &mut map,
            decoded("Z", user, &peer, 1_700_001_031, "ping", DmProtocol::Nip04),
            &user.to_hex(),
            &settings(),
            NOW,
        );

        let bucket = map.get(&peer.to_hex()).unwrap();
        assert_eq!(bucket.messages.len(), 3);
        assert!(bucket.messages.iter().any(|m| m.is_sending));

        // Exactly on the boundary still matches
        add_single(
            &mut map,
            decoded("W", user, &peer, 1_700_001_030, "ping", DmProtocol::Nip04),
            &user.to_hex(),
            &settings(),
            NOW,
        );
        let bucket = map.get(&peer.to_hex()).unwrap();
        assert_eq!(bucket.messages.len(), 3);
        assert!(!bucket.messages.iter().any(|m| m.is_sending));
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let user = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut map = HashMap::new();

        for id in ["a", "b", "c"] {
            add_single(
                &mut map,
                decoded(id, peer, &peer, 100, id, DmProtocol::Nip04),
                &user.to_hex(),
                &settings(),
                NOW,
            );
        }

        let ids: Vec<&str> = map
            .get(&peer.to_hex())
            .unwrap()
            .messages
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_just_arrived_stamping() {
        let user = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut map = HashMap::new();

        add_single(
            &mut map,
            decoded("fresh", peer, &peer, NOW - 2, "new", DmProtocol::Nip04),
            &user.to_hex(),
            &settings(),
            NOW,
        );
        add_single(
            &mut map,
            decoded("stale", peer, &peer, NOW - 600, "old", DmProtocol::Nip04),
            &user.to_hex(),
            &settings(),
            NOW,
        );

        let bucket = map.get(&peer.to_hex()).unwrap();
        let fresh = bucket.messages.iter().find(|m| m.id == "fresh").unwrap();
        let stale = bucket.messages.iter().find(|m| m.id == "stale").unwrap();
        assert_eq!(fresh.client_first_seen, Some(NOW));
        assert_eq!(stale.client_first_seen, None);
    }

    #[test]
    fn test_errored_nip17_flag_knob() {
        let user = Keys::generate().public_key();
        let peer = Keys::generate().public_key();

        let mut errored = decoded("bad", peer, &peer, 100, "", DmProtocol::Nip17);
        errored.message.decrypted_content = None;
        errored.message.error = Some("Unsupported inner kind 1".into());

        // Default: errored wraps still mark the conversation
        let mut map = HashMap::new();
        add_single(&mut map, errored.clone(), &user.to_hex(), &settings(), NOW);
        assert!(map.get(&peer.to_hex()).unwrap().has_nip17);

        // Knob off: the flag stays clear
        let strict = DmSettings {
            errored_nip17_sets_flag: false,
            ..DmSettings::default()
        };
        let mut map = HashMap::new();
        add_single(&mut map, errored, &user.to_hex(), &strict, NOW);
        let bucket = map.get(&peer.to_hex()).unwrap();
        assert!(!bucket.has_nip17);
        assert_eq!(bucket.messages.len(), 1);
    }

    #[test]
    fn test_summaries_known_vs_request() {
        let user = Keys::generate().public_key();
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();
        let mut map = HashMap::new();

        // Conversation with alice: the user replied
        merge_batch(
            &mut map,
            vec![
                decoded("a1", alice, &alice, 100, "hi", DmProtocol::Nip17),
                decoded("a2", user, &alice, 200, "yo", DmProtocol::Nip17),
            ],
            &user.to_hex(),
            &settings(),
            NOW,
        );
        // Conversation with bob: inbound only
        merge_batch(
            &mut map,
            vec![decoded("b1", bob, &bob, 300, "hello?", DmProtocol::Nip04)],
            &user.to_hex(),
            &settings(),
            NOW,
        );

        let summaries = conversation_summaries(&map, &user.to_hex());
        assert_eq!(summaries.len(), 2);
        // Newest activity first
        assert_eq!(summaries[0].pubkey, bob.to_hex());

        let alice_summary = summaries.iter().find(|s| s.pubkey == alice.to_hex()).unwrap();
        assert!(alice_summary.is_known);
        assert!(!alice_summary.is_request);
        assert!(alice_summary.last_message_from_user);
        assert!(alice_summary.has_nip17);

        let bob_summary = summaries.iter().find(|s| s.pubkey == bob.to_hex()).unwrap();
        assert!(!bob_summary.is_known);
        assert!(bob_summary.is_request);
        assert!(!bob_summary.last_message_from_user);
        assert!(bob_summary.has_nip04);
    }
}
