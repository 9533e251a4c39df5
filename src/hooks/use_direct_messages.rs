use dioxus::prelude::*;
use dioxus::signals::ReadableExt;

use crate::stores::dm::{
    self, ConversationMapStoreStoreExt, ConversationSummary, DmSettings, LastSync, LoadingPhase,
    Participant, ProtocolMode, ScanProgress, SendMessageParams, SubscriptionStatus,
};
use crate::stores::{auth_store, relay_metadata};

/// Handle over the DM engine's reactive state surface.
/// Component-friendly accessors; the heavy lifting lives in the stores.
#[derive(Clone, Copy)]
pub struct UseDirectMessages;

/// Hook wiring a component tree to the DM engine.
///
/// Starts (or restarts) the engine whenever the authenticated user
/// changes, tears it down on logout, and watches the user's relay lists
/// so a relay switch triggers a clean refetch.
pub fn use_direct_messages() -> UseDirectMessages {
    use_effect(move || {
        let auth = auth_store::AUTH_STATE.read();
        match auth.pubkey.clone() {
            Some(pubkey) => {
                spawn(async move {
                    dm::ensure_started_for(&pubkey).await;
                });
            }
            None => {
                spawn(async move {
                    dm::teardown_direct_messages().await;
                });
            }
        }
    });

    use_effect(move || {
        // Subscribes this effect to relay-list updates
        let _ = relay_metadata::USER_RELAY_METADATA.read();
        dm::check_relay_change();
    });

    UseDirectMessages
}

impl UseDirectMessages {
    /// Conversation list, newest activity first
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        dm::conversation_summaries()
    }

    /// Full message map snapshot (peer pubkey hex -> bucket)
    pub fn messages(&self) -> dm::ConversationMap {
        dm::DM_CONVERSATIONS.read().data().read().clone()
    }

    /// One peer's conversation
    pub fn conversation_with(&self, pubkey: &str) -> Option<Participant> {
        dm::conversation_with(pubkey)
    }

    pub fn is_loading(&self) -> bool {
        *dm::IS_LOADING.read()
    }

    pub fn loading_phase(&self) -> LoadingPhase {
        *dm::LOADING_PHASE.read()
    }

    pub fn is_doing_initial_load(&self) -> bool {
        *dm::IS_DOING_INITIAL_LOAD.read()
    }

    pub fn last_sync(&self) -> LastSync {
        *dm::LAST_SYNC.read()
    }

    pub fn subscriptions(&self) -> SubscriptionStatus {
        dm::subscription_status()
    }

    pub fn protocol_mode(&self) -> ProtocolMode {
        dm::DM_SETTINGS.read().protocol_mode
    }

    pub fn settings(&self) -> DmSettings {
        *dm::DM_SETTINGS.read()
    }

    pub fn scan_progress(&self) -> Option<ScanProgress> {
        *dm::SCAN_PROGRESS.read()
    }

    /// Optimistically send a message; errors surface as toasts in the host
    pub async fn send_message(&self, params: SendMessageParams) -> Result<(), String> {
        dm::send_message(params).await
    }

    /// Manual full refresh: drop the cache and re-sync from relays
    pub async fn clear_cache_and_refetch(&self) -> Result<(), String> {
        dm::clear_cache_and_refetch().await
    }
}
