//! Encrypted direct-message engine.
//!
//! Session-scoped: active while a user is authenticated. Loads the sealed
//! conversation cache first so the UI renders history immediately, then
//! backfills both protocols from relays in the background, then keeps the
//! view live through long-lived subscriptions. All state flows through
//! the reducer, all persistence through the scheduler, and no entry point
//! here throws past its `Result` - failures degrade into errored messages
//! or a relay-only reload.

use dioxus::prelude::*;
use dioxus::signals::ReadableExt;
use dioxus_stores::Store;
use nostr_sdk::signer::NostrSigner;
use nostr_sdk::PublicKey;
use std::sync::Arc;

use crate::stores::{auth_store, nostr_client, relay_metadata};
use crate::utils::time::now_secs;

pub mod cache;
pub mod decoder;
pub mod fetcher;
pub mod persistence;
pub mod reducer;
pub mod send;
pub mod subscriptions;
pub mod types;

pub use send::send_message;
pub use types::{
    ConversationMap, ConversationSummary, DecryptedMessage, DmAttachment, DmProtocol, DmSettings,
    LastSync, LoadingPhase, Participant, ProtocolMode, ScanProgress, SendMessageParams,
    SubscriptionStatus,
};

/// Store for the conversation map with fine-grained reactivity
#[derive(Clone, Debug, PartialEq, Default, Store)]
pub struct ConversationMapStore {
    pub data: ConversationMap,
}

/// Global store of all DM conversations, keyed by peer pubkey hex
pub static DM_CONVERSATIONS: GlobalSignal<Store<ConversationMapStore>> =
    Signal::global(|| Store::new(ConversationMapStore::default()));

/// Current loader phase
pub static LOADING_PHASE: GlobalSignal<LoadingPhase> = Signal::global(|| LoadingPhase::Idle);

/// True only while the initial cache load is executing
pub static IS_LOADING: GlobalSignal<bool> = Signal::global(|| false);

/// Flips true as soon as cached history is visible; re-entry guard
pub static HAS_INITIAL_LOAD_COMPLETED: GlobalSignal<bool> = Signal::global(|| false);

/// True from first entry until the live subscriptions are open
pub static IS_DOING_INITIAL_LOAD: GlobalSignal<bool> = Signal::global(|| false);

/// Per-protocol high-water timestamps
pub static LAST_SYNC: GlobalSignal<LastSync> = Signal::global(LastSync::default);

/// Relay scan progress during backfill
pub static SCAN_PROGRESS: GlobalSignal<Option<ScanProgress>> = Signal::global(|| None);

/// Engine settings
pub static DM_SETTINGS: GlobalSignal<DmSettings> = Signal::global(DmSettings::default);

/// Effective DM relay URL at the time the engine last (re)started
static RELAY_SNAPSHOT: GlobalSignal<Option<String>> = Signal::global(|| None);

/// Pubkey hex the engine is currently running for
static CURRENT_DM_USER: GlobalSignal<Option<String>> = Signal::global(|| None);

#[cfg(target_arch = "wasm32")]
const HARD_REFRESH_FLAG: &str = "sealchat_dm_hard_refresh";

/// Signer of the attached client, if any
pub(crate) async fn current_signer() -> Option<Arc<dyn NostrSigner>> {
    match nostr_client::get_client() {
        Some(client) => client.signer().await.ok(),
        None => None,
    }
}

/// Record the hard-refresh gesture (Ctrl/Cmd+Shift+R). One-shot: the next
/// engine start clears the cache before loading it.
pub fn mark_hard_refresh() {
    #[cfg(target_arch = "wasm32")]
    {
        use gloo_storage::{SessionStorage, Storage};
        SessionStorage::set(HARD_REFRESH_FLAG, true).ok();
    }
}

fn take_hard_refresh_flag() -> bool {
    #[cfg(target_arch = "wasm32")]
    {
        use gloo_storage::{SessionStorage, Storage};
        let flagged = SessionStorage::get::<bool>(HARD_REFRESH_FLAG).unwrap_or(false);
        if flagged {
            SessionStorage::delete(HARD_REFRESH_FLAG);
        }
        flagged
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        false
    }
}

/// Drive the engine for the authenticated user: cache, then relays, then
/// live subscriptions. Returns as soon as cached history is visible; the
/// relay phases continue in the background.
pub async fn init_direct_messages() -> Result<(), String> {
    if *HAS_INITIAL_LOAD_COMPLETED.read() || *IS_LOADING.read() {
        return Ok(());
    }

    let pubkey_str = auth_store::get_pubkey().ok_or("Not authenticated")?;
    let user = match PublicKey::parse(&pubkey_str) {
        Ok(user) => user,
        Err(e) => {
            // Land in degraded READY so nothing re-triggers a doomed load
            *HAS_INITIAL_LOAD_COMPLETED.write() = true;
            *LOADING_PHASE.write() = LoadingPhase::Ready;
            return Err(format!("Invalid user pubkey: {}", e));
        }
    };

    *IS_LOADING.write() = true;
    *IS_DOING_INITIAL_LOAD.write() = true;
    *CURRENT_DM_USER.write() = Some(user.to_hex());
    *LOADING_PHASE.write() = LoadingPhase::Cache;

    log::info!("Loading DMs for {}", user.to_hex());

    if take_hard_refresh_flag() {
        log::info!("Hard refresh requested, clearing DM cache");
        if let Err(e) = cache::delete(&user).await {
            log::warn!("Failed to clear DM cache: {}", e);
        }
    }

    let signer = current_signer().await;
    let cached = match cache::read(&user, signer.as_ref()).await {
        Ok(document) => document,
        Err(e) => {
            log::warn!("DM cache storage failed, continuing in-memory only: {}", e);
            None
        }
    };
    if let Some(document) = cached {
        let map: ConversationMap = document
            .participants
            .into_iter()
            .map(|(pubkey, cached)| {
                let participant = Participant::from_cached(pubkey.clone(), cached);
                (pubkey, participant)
            })
            .collect();
        log::info!("Loaded {} cached conversations", map.len());
        *DM_CONVERSATIONS.read().data().write() = map;
        *LAST_SYNC.write() = document.last_sync;
    } else {
        log::info!("No usable DM cache, relying on relay backfill");
    }

    // Cache-first: the UI renders now. The completed flag is set before
    // the loading gate drops so dependency-change re-entry cannot retrigger.
    *HAS_INITIAL_LOAD_COMPLETED.write() = true;
    *IS_LOADING.write() = false;

    *RELAY_SNAPSHOT.write() = relay_metadata::effective_dm_relay_url();

    spawn(async move {
        sync_and_subscribe(user).await;
    });

    Ok(())
}

/// Background half of the initial load: parallel backfills, watermark
/// updates, then live subscriptions.
async fn sync_and_subscribe(user: PublicKey) {
    *LOADING_PHASE.write() = LoadingPhase::Relays;

    let settings = *DM_SETTINGS.read();
    let last_sync = *LAST_SYNC.read();

    let (nip04_outcome, nip17_outcome) = if settings.nip17_enabled() {
        let (nip04, nip17) = tokio::join!(
            fetcher::backfill(DmProtocol::Nip04, user, last_sync.nip4),
            fetcher::backfill(DmProtocol::Nip17, user, last_sync.nip17)
        );
        (nip04, Some(nip17))
    } else {
        (
            fetcher::backfill(DmProtocol::Nip04, user, last_sync.nip4).await,
            None,
        )
    };

    // Record that the relays have been asked, even when they had nothing,
    // so the next session does not re-request the same empty range.
    let now = now_secs();
    {
        let mut watermarks = LAST_SYNC.write();
        if nip04_outcome.should_update_last_sync() {
            watermarks.set(DmProtocol::Nip04, now);
        }
        if let Some(outcome) = &nip17_outcome {
            if outcome.should_update_last_sync() {
                watermarks.set(DmProtocol::Nip17, now);
            }
        }
    }

    let new_messages = nip04_outcome.count + nip17_outcome.map(|o| o.count).unwrap_or(0);
    if new_messages > 0 {
        log::info!("Backfill produced {} new messages, flushing cache", new_messages);
        persistence::flush_immediate().await;
    } else {
        persistence::schedule_debounced();
    }

    *LOADING_PHASE.write() = LoadingPhase::Subscriptions;

    subscriptions::start(DmProtocol::Nip04, user, nip04_outcome.newest_timestamp).await;
    if settings.nip17_enabled() {
        let newest = nip17_outcome.and_then(|o| o.newest_timestamp);
        subscriptions::start(DmProtocol::Nip17, user, newest).await;
    }

    *LOADING_PHASE.write() = LoadingPhase::Ready;
    *IS_DOING_INITIAL_LOAD.write() = false;
}

/// Start the engine for `pubkey`, tearing down a previous user's state
/// first when the account changed.
pub async fn ensure_started_for(pubkey: &str) {
    let user_hex = match PublicKey::parse(pubkey) {
        Ok(user) => user.to_hex(),
        Err(e) => {
            log::error!("Invalid pubkey for DM engine: {}", e);
            return;
        }
    };

    let previous = CURRENT_DM_USER.read().clone();
    if let Some(previous) = previous {
        if previous != user_hex {
            log::info!("Account changed, restarting DM engine");
            teardown_direct_messages().await;
        }
    }

    if !*HAS_INITIAL_LOAD_COMPLETED.read() && !*IS_LOADING.read() {
        if let Err(e) = init_direct_messages().await {
            log::error!("Failed to initialize DMs: {}", e);
        }
    }
}

/// Delete the cache, reset all state and run the full load again.
/// Invoked on relay changes and exposed to the UI as a manual refresh.
pub async fn clear_cache_and_refetch() -> Result<(), String> {
    let pubkey_str = auth_store::get_pubkey().ok_or("Not authenticated")?;
    let user =
        PublicKey::parse(&pubkey_str).map_err(|e| format!("Invalid user pubkey: {}", e))?;

    log::info!("Clearing DM cache and refetching");

    subscriptions::stop_all().await;
    persistence::cancel_pending();

    if let Err(e) = cache::delete(&user).await {
        log::warn!("Failed to delete DM cache: {}", e);
    }

    DM_CONVERSATIONS.read().data().write().clear();
    *LAST_SYNC.write() = LastSync::default();
    *SCAN_PROGRESS.write() = None;
    *HAS_INITIAL_LOAD_COMPLETED.write() = false;
    *IS_DOING_INITIAL_LOAD.write() = false;
    *IS_LOADING.write() = false;
    *LOADING_PHASE.write() = LoadingPhase::Idle;

    init_direct_messages().await
}

/// Tear the engine down (logout or account switch). In-memory state only;
/// the on-disk cache stays for the user's next session.
pub async fn teardown_direct_messages() {
    subscriptions::stop_all().await;
    persistence::cancel_pending();

    DM_CONVERSATIONS.read().data().write().clear();
    *LAST_SYNC.write() = LastSync::default();
    *SCAN_PROGRESS.write() = None;
    *HAS_INITIAL_LOAD_COMPLETED.write() = false;
    *IS_DOING_INITIAL_LOAD.write() = false;
    *IS_LOADING.write() = false;
    *LOADING_PHASE.write() = LoadingPhase::Idle;
    *RELAY_SNAPSHOT.write() = None;
    *CURRENT_DM_USER.write() = None;
}

/// Compare the retained relay snapshot against the currently effective DM
/// relays; a change clears the cache and refetches from the new relays.
pub fn check_relay_change() {
    let current = relay_metadata::effective_dm_relay_url();
    let previous = RELAY_SNAPSHOT.read().clone();

    match (previous, current) {
        (Some(previous), Some(current)) if previous != current => {
            *RELAY_SNAPSHOT.write() = Some(current);
            log::info!("Effective DM relays changed, refetching");
            spawn(async move {
                if let Err(e) = clear_cache_and_refetch().await {
                    log::error!("Relay-change refetch failed: {}", e);
                }
            });
        }
        (None, Some(current)) => {
            *RELAY_SNAPSHOT.write() = Some(current);
        }
        _ => {}
    }
}

/// Derived conversation list, newest activity first
pub fn conversation_summaries() -> Vec<ConversationSummary> {
    let user_hex = auth_store::get_pubkey()
        .and_then(|pk| PublicKey::parse(&pk).ok())
        .map(|pk| pk.to_hex())
        .unwrap_or_default();

    let store = DM_CONVERSATIONS.read();
    let data = store.data();
    let map = data.read();
    reducer::conversation_summaries(&map, &user_hex)
}

/// One peer's bucket, cloned for rendering
pub fn conversation_with(pubkey: &str) -> Option<Participant> {
    let normalized = PublicKey::parse(pubkey).map(|pk| pk.to_hex()).ok()?;
    DM_CONVERSATIONS.read().data().read().get(&normalized).cloned()
}

/// Live subscription status for both protocols
pub fn subscription_status() -> SubscriptionStatus {
    subscriptions::status()
}
