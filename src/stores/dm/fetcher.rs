//! Batched relay backfill for both DM protocols.
//!
//! Issues repeated bounded `since` queries until a batch comes back short,
//! empty, or the global scan cap is hit. NIP-17 queries compensate for
//! NIP-59 timestamp fuzzing by reaching two days behind the requested
//! `since`; the duplicates that overlap produces are dropped by the
//! reducer's id dedup. Failures never propagate: the loop breaks and
//! reports what it managed, so the orchestrator can still advance
//! `lastSync` after a partial sweep.

use dioxus::prelude::*;
use dioxus::signals::ReadableExt;
use nostr_sdk::{Event, Filter, Kind, PublicKey, TagKind, Timestamp};
use std::time::Duration;

use crate::stores::nostr_client;
use crate::utils::time::now_secs;

use super::decoder::{decode_nip04, decode_nip17, DecodedDm};
use super::reducer;
use super::types::{DmProtocol, ScanProgress};
use super::{ConversationMapStoreStoreExt, DM_CONVERSATIONS, DM_SETTINGS, SCAN_PROGRESS};

/// Events requested per filter per iteration
pub const BATCH_SIZE: usize = 1000;

/// Hard cap on events scanned per protocol per backfill
pub const MAX_SCAN: usize = 20_000;

/// NIP-59 fuzzes gift-wrap timestamps within +/- 2 days of the real send
/// time, so every NIP-17 `since` reaches that far back.
pub const NIP17_FUZZ_WINDOW_SECS: u64 = 2 * 24 * 60 * 60;

const NIP04_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const NIP17_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one protocol's backfill sweep
#[derive(Clone, Copy, Debug, Default)]
pub struct FetchOutcome {
    /// Newest real message timestamp observed (seconds)
    pub newest_timestamp: Option<u64>,
    /// Messages newly inserted into the conversation map
    pub count: usize,
    /// Raw events scanned, including duplicates and invalid ones
    pub scanned: usize,
    /// At least one query round-trip succeeded
    pub had_successful_batch: bool,
    /// The sweep ended on a transport error or timeout
    pub failed: bool,
}

impl FetchOutcome {
    /// Whether `lastSync` may advance to now: the sweep either finished
    /// cleanly or failed only after a successful partial batch.
    pub fn should_update_last_sync(&self) -> bool {
        !self.failed || self.had_successful_batch
    }
}

/// Effective lower bound for a NIP-17 query starting at `since`
pub fn nip17_effective_since(since: Option<u64>) -> Option<u64> {
    since.map(|s| s.saturating_sub(NIP17_FUZZ_WINDOW_SECS))
}

/// Whether the pagination loop stops after a batch of `batch_len` raw
/// events (`requested` per filter) with `total` scanned so far
pub fn is_final_batch(batch_len: usize, requested: usize, total: usize) -> bool {
    batch_len == 0 || batch_len < requested || total >= MAX_SCAN
}

/// Termination check for the two OR'd NIP-04 filter halves. Each half is
/// judged against its own limit: a full half means more history exists
/// behind it even when the other half is exhausted, so the sweep only
/// stops once both halves come back short (or the cap is hit).
pub fn is_final_nip04_batch(to_me_len: usize, from_me_len: usize, total: usize) -> bool {
    (to_me_len < BATCH_SIZE && from_me_len < BATCH_SIZE) || total >= MAX_SCAN
}

/// A usable kind-4 event: correct kind, addressed to someone, non-empty
pub fn is_valid_nip04(event: &Event) -> bool {
    event.kind == Kind::EncryptedDirectMessage
        && event.tags.iter().any(|tag| tag.kind() == TagKind::p())
        && !event.content.is_empty()
}

fn oldest_secs(events: &[Event]) -> Option<u64> {
    events.iter().map(|e| e.created_at.as_secs()).min()
}

fn publish_progress(protocol: DmProtocol, scanned: usize) {
    *SCAN_PROGRESS.write() = Some(ScanProgress {
        protocol,
        scanned,
        cap: MAX_SCAN,
    });
}

/// Merge decoded messages into the conversation map, returning how many
/// were new and the newest real timestamp seen in the batch
fn merge_decoded(batch: Vec<DecodedDm>, user_hex: &str) -> (usize, Option<u64>) {
    let newest = batch
        .iter()
        .map(|d| d.message.created_at.as_secs())
        .max();
    let settings = *DM_SETTINGS.read();
    let store = DM_CONVERSATIONS.read();
    let mut data = store.data();
    let mut map = data.write();
    let inserted = reducer::merge_batch(&mut map, batch, user_hex, &settings, now_secs());
    (inserted, newest)
}

/// Backfill one protocol from `since` (seconds). Non-throwing: transport
/// errors end the sweep and are reported in the outcome.
pub async fn backfill(protocol: DmProtocol, user: PublicKey, since: Option<u64>) -> FetchOutcome {
    match protocol {
        DmProtocol::Nip04 => backfill_nip04(user, since).await,
        DmProtocol::Nip17 => backfill_nip17(user, since).await,
    }
}

async fn backfill_nip04(user: PublicKey, since: Option<u64>) -> FetchOutcome {
    let user_hex = user.to_hex();
    let mut outcome = FetchOutcome::default();
    let mut cursor = since;

    loop {
        let mut inbound = Filter::new()
            .kind(Kind::EncryptedDirectMessage)
            .pubkey(user)
            .limit(BATCH_SIZE);
        let mut outbound = Filter::new()
            .kind(Kind::EncryptedDirectMessage)
            .author(user)
            .limit(BATCH_SIZE);
        if let Some(s) = cursor {
            let ts = Timestamp::from(s);
            inbound = inbound.since(ts);
            outbound = outbound.since(ts);
        }

        let (to_me, from_me) = tokio::join!(
            nostr_client::fetch_events(inbound, NIP04_FETCH_TIMEOUT),
            nostr_client::fetch_events(outbound, NIP04_FETCH_TIMEOUT)
        );

        let (to_me, from_me) = match (to_me, from_me) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("NIP-04 backfill batch failed: {}", e);
                outcome.failed = true;
                break;
            }
        };

        outcome.had_successful_batch = true;
        let to_me_len = to_me.len();
        let from_me_len = from_me.len();
        outcome.scanned += to_me_len + from_me_len;
        publish_progress(DmProtocol::Nip04, outcome.scanned);

        // Advance to the oldest timestamp seen across both filter halves
        let oldest = match (oldest_secs(&to_me), oldest_secs(&from_me)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut decoded = Vec::new();
        let signer = super::current_signer().await;
        for event in to_me.iter().chain(from_me.iter()) {
            if !is_valid_nip04(event) {
                continue;
            }
            if let Some(d) = decode_nip04(event, &user, signer.as_ref()).await {
                decoded.push(d);
            }
        }

        let (inserted, newest) = merge_decoded(decoded, &user_hex);
        outcome.count += inserted;
        outcome.newest_timestamp = outcome.newest_timestamp.max(newest);

        if is_final_nip04_batch(to_me_len, from_me_len, outcome.scanned) {
            break;
        }
        cursor = oldest.or(cursor);
    }

    *SCAN_PROGRESS.write() = None;
    log::info!(
        "NIP-04 backfill: {} scanned, {} new messages",
        outcome.scanned,
        outcome.count
    );
    outcome
}

async fn backfill_nip17(user: PublicKey, since: Option<u64>) -> FetchOutcome {
    let user_hex = user.to_hex();
    let mut outcome = FetchOutcome::default();
    let mut cursor = nip17_effective_since(since);

    loop {
        let mut filter = Filter::new()
            .kind(Kind::GiftWrap)
            .pubkey(user)
            .limit(BATCH_SIZE);
        if let Some(s) = cursor {
            filter = filter.since(Timestamp::from(s));
        }

        let events = match nostr_client::fetch_events(filter, NIP17_FETCH_TIMEOUT).await {
            Ok(events) => events,
            Err(e) => {
                log::warn!("NIP-17 backfill batch failed: {}", e);
                outcome.failed = true;
                break;
            }
        };

        outcome.had_successful_batch = true;
        let batch_len = events.len();
        outcome.scanned += batch_len;
        publish_progress(DmProtocol::Nip17, outcome.scanned);

        let oldest = oldest_secs(&events);

        let mut decoded = Vec::new();
        let signer = super::current_signer().await;
        for event in &events {
            decoded.push(decode_nip17(event, &user, signer.as_ref()).await);
        }

        let (inserted, newest) = merge_decoded(decoded, &user_hex);
        outcome.count += inserted;
        outcome.newest_timestamp = outcome.newest_timestamp.max(newest);

        if is_final_batch(batch_len, BATCH_SIZE, outcome.scanned) {
            break;
        }
        cursor = oldest.or(cursor);
    }

    *SCAN_PROGRESS.write() = None;
    log::info!(
        "NIP-17 backfill: {} scanned, {} new messages",
        outcome.scanned,
        outcome.count
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::{EventBuilder, Keys, Tag};

    #[test]
    fn test_nip17_since_reaches_back_two_days() {
        assert_eq!(
            nip17_effective_since(Some(1_700_100_000)),
            Some(1_700_100_000 - 172_800)
        );
        assert_eq!(nip17_effective_since(Some(1000)), Some(0));
        assert_eq!(nip17_effective_since(None), None);
    }

    #[test]
    fn test_final_batch_conditions() {
        // Empty batch ends the sweep
        assert!(is_final_batch(0, BATCH_SIZE, 0));
        // Short batch ends the sweep
        assert!(is_final_batch(BATCH_SIZE - 1, BATCH_SIZE, BATCH_SIZE - 1));
        // Full batch under the cap continues
        assert!(!is_final_batch(BATCH_SIZE, BATCH_SIZE, BATCH_SIZE));
        // Cap reached ends the sweep even on a full batch
        assert!(is_final_batch(BATCH_SIZE, BATCH_SIZE, MAX_SCAN));
    }

    #[test]
    fn test_nip04_halves_terminate_independently() {
        // Inbound half still full while the outbound half is exhausted:
        // more inbound history exists, the sweep must continue
        assert!(!is_final_nip04_batch(BATCH_SIZE, 10, BATCH_SIZE + 10));
        // And the mirror case
        assert!(!is_final_nip04_batch(10, BATCH_SIZE, BATCH_SIZE + 10));
        // Both halves short ends the sweep
        assert!(is_final_nip04_batch(10, 10, 20));
        // Both halves empty ends the sweep
        assert!(is_final_nip04_batch(0, 0, 0));
        // Cap reached ends the sweep even with a full half
        assert!(is_final_nip04_batch(BATCH_SIZE, 10, MAX_SCAN));
    }

    #[tokio::test]
    async fn test_nip04_validation() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let valid = EventBuilder::new(Kind::EncryptedDirectMessage, "abc?iv=def")
            .tags(vec![Tag::public_key(bob.public_key())])
            .build(alice.public_key())
            .sign(&alice)
            .await
            .unwrap();
        assert!(is_valid_nip04(&valid));

        let no_recipient = EventBuilder::new(Kind::EncryptedDirectMessage, "abc?iv=def")
            .build(alice.public_key())
            .sign(&alice)
            .await
            .unwrap();
        assert!(!is_valid_nip04(&no_recipient));

        let empty = EventBuilder::new(Kind::EncryptedDirectMessage, "")
            .tags(vec![Tag::public_key(bob.public_key())])
            .build(alice.public_key())
            .sign(&alice)
            .await
            .unwrap();
        assert!(!is_valid_nip04(&empty));

        let wrong_kind = EventBuilder::new(Kind::TextNote, "hello")
            .tags(vec![Tag::public_key(bob.public_key())])
            .build(alice.public_key())
            .sign(&alice)
            .await
            .unwrap();
        assert!(!is_valid_nip04(&wrong_kind));
    }
}
