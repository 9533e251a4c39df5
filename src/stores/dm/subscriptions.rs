//! Live DM subscriptions, at most one handle per protocol.
//!
//! The NIP-04 handle covers both filter halves (messages to the user and
//! the user's own published copies) so that optimistic sends reconcile
//! against their echo; the NIP-17 handle watches gift wraps addressed to
//! the user, which includes the self-addressed wrap produced on send.
//! Starting a protocol closes any previous handle first, so account and
//! relay switches can never leave two feeds racing each other.

use dioxus::prelude::*;
use dioxus::signals::ReadableExt;
use nostr_sdk::{Filter, Kind, PublicKey, RelayPoolNotification, SubscriptionId, Timestamp};

use crate::stores::nostr_client;
use crate::utils::time::now_secs;

use super::decoder::{decode_nip04, decode_nip17};
use super::fetcher::{is_valid_nip04, NIP17_FUZZ_WINDOW_SECS};
use super::reducer;
use super::types::{DmProtocol, LastSync, SubscriptionStatus};
use super::{persistence, ConversationMapStoreStoreExt, DM_CONVERSATIONS, DM_SETTINGS, LAST_SYNC};

/// Overlap applied when resuming from `lastSync`, absorbing clock drift
/// between relays
pub const SUBSCRIPTION_OVERLAP_SECS: u64 = 10;

/// Live feed token: closing it tears down every underlying relay
/// subscription the handle covers
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionHandle {
    ids: Vec<SubscriptionId>,
}

impl SubscriptionHandle {
    fn contains(&self, id: &SubscriptionId) -> bool {
        self.ids.iter().any(|i| i == id)
    }

    pub async fn close(&self) {
        for id in &self.ids {
            nostr_client::unsubscribe(id).await;
        }
    }
}

static ACTIVE_NIP04: GlobalSignal<Option<SubscriptionHandle>> = Signal::global(|| None);
static ACTIVE_NIP17: GlobalSignal<Option<SubscriptionHandle>> = Signal::global(|| None);

pub static NIP04_CONNECTED: GlobalSignal<bool> = Signal::global(|| false);
pub static NIP17_CONNECTED: GlobalSignal<bool> = Signal::global(|| false);

fn active_signal(protocol: DmProtocol) -> &'static GlobalSignal<Option<SubscriptionHandle>> {
    match protocol {
        DmProtocol::Nip04 => &ACTIVE_NIP04,
        DmProtocol::Nip17 => &ACTIVE_NIP17,
    }
}

fn connected_signal(protocol: DmProtocol) -> &'static GlobalSignal<bool> {
    match protocol {
        DmProtocol::Nip04 => &NIP04_CONNECTED,
        DmProtocol::Nip17 => &NIP17_CONNECTED,
    }
}

/// Current connection status of both protocols
pub fn status() -> SubscriptionStatus {
    SubscriptionStatus {
        nip04_connected: *NIP04_CONNECTED.read(),
        nip17_connected: *NIP17_CONNECTED.read(),
    }
}

/// Lower bound for a live subscription: the explicit timestamp when given,
/// otherwise `lastSync` minus the overlap, otherwise now. NIP-17
/// additionally reaches back the fuzz window.
pub fn subscription_since(
    protocol: DmProtocol,
    explicit: Option<u64>,
    last_sync: &LastSync,
    now: u64,
) -> u64 {
    let base = explicit
        .or_else(|| {
            last_sync
                .get(protocol)
                .map(|s| s.saturating_sub(SUBSCRIPTION_OVERLAP_SECS))
        })
        .unwrap_or(now);

    match protocol {
        DmProtocol::Nip04 => base,
        DmProtocol::Nip17 => base.saturating_sub(NIP17_FUZZ_WINDOW_SECS),
    }
}

/// Open (or replace) the live subscription for `protocol`
pub async fn start(protocol: DmProtocol, user: PublicKey, since: Option<u64>) {
    // Replace-on-start: never two live handles for one protocol.
    // The guard must drop before awaiting the close.
    let previous = active_signal(protocol).write().take();
    if let Some(previous) = previous {
        previous.close().await;
    }

    let since_secs = subscription_since(protocol, since, &LAST_SYNC.read(), now_secs());
    let since_ts = Timestamp::from(since_secs);

    let filters = match protocol {
        DmProtocol::Nip04 => vec![
            Filter::new()
                .kind(Kind::EncryptedDirectMessage)
                .pubkey(user)
                .since(since_ts),
            Filter::new()
                .kind(Kind::EncryptedDirectMessage)
                .author(user)
                .since(since_ts),
        ],
        DmProtocol::Nip17 => vec![Filter::new().kind(Kind::GiftWrap).pubkey(user).since(since_ts)],
    };

    let mut ids = Vec::new();
    for filter in filters {
        match nostr_client::subscribe(filter).await {
            Ok(id) => ids.push(id),
            Err(e) => {
                log::error!("Failed to open {:?} subscription: {}", protocol, e);
            }
        }
    }

    if ids.is_empty() {
        *connected_signal(protocol).write() = false;
        return;
    }

    let handle = SubscriptionHandle { ids };
    *active_signal(protocol).write() = Some(handle.clone());
    *connected_signal(protocol).write() = true;
    log::info!("{:?} subscription open since {}", protocol, since_secs);

    let client = match nostr_client::get_client() {
        Some(client) => client,
        None => return,
    };

    spawn(async move {
        let mut notifications = client.notifications();
        while let Ok(notification) = notifications.recv().await {
            // Stop once this handle has been replaced or torn down
            if active_signal(protocol).read().as_ref() != Some(&handle) {
                break;
            }

            match notification {
                RelayPoolNotification::Event {
                    subscription_id,
                    event,
                    ..
                } => {
                    if !handle.contains(&subscription_id) {
                        continue;
                    }
                    handle_incoming(protocol, user, *event).await;
                }
                RelayPoolNotification::Shutdown => {
                    *connected_signal(protocol).write() = false;
                    break;
                }
                _ => {}
            }
        }
    });
}

/// Route one live event through the matching decoder into the reducer.
/// This is the path that reconciles optimistic sends with their echo.
async fn handle_incoming(protocol: DmProtocol, user: PublicKey, event: nostr_sdk::Event) {
    let signer = super::current_signer().await;

    let decoded = match protocol {
        DmProtocol::Nip04 => {
            if !is_valid_nip04(&event) {
                return;
            }
            match decode_nip04(&event, &user, signer.as_ref()).await {
                Some(decoded) => decoded,
                None => return,
            }
        }
        DmProtocol::Nip17 => decode_nip17(&event, &user, signer.as_ref()).await,
    };

    let settings = *DM_SETTINGS.read();
    let changed = {
        let store = DM_CONVERSATIONS.read();
        let mut data = store.data();
        let mut map = data.write();
        reducer::add_single(&mut map, decoded, &user.to_hex(), &settings, now_secs())
    };

    if changed {
        persistence::schedule_debounced();
    }
}

/// Close both protocol subscriptions
pub async fn stop_all() {
    for protocol in [DmProtocol::Nip04, DmProtocol::Nip17] {
        let handle = active_signal(protocol).write().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
        *connected_signal(protocol).write() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_since_prefers_explicit_argument() {
        let last_sync = LastSync {
            nip4: Some(500),
            nip17: Some(500),
        };
        assert_eq!(
            subscription_since(DmProtocol::Nip04, Some(1000), &last_sync, 2000),
            1000
        );
    }

    #[test]
    fn test_since_falls_back_to_last_sync_with_overlap() {
        let last_sync = LastSync {
            nip4: Some(1_700_000_000),
            nip17: None,
        };
        assert_eq!(
            subscription_since(DmProtocol::Nip04, None, &last_sync, 1_700_999_999),
            1_700_000_000 - 10
        );
    }

    #[test]
    fn test_since_falls_back_to_now() {
        let last_sync = LastSync::default();
        assert_eq!(
            subscription_since(DmProtocol::Nip04, None, &last_sync, 1_700_000_000),
            1_700_000_000
        );
    }

    #[test]
    fn test_nip17_reaches_back_the_fuzz_window() {
        let last_sync = LastSync {
            nip4: None,
            nip17: Some(1_700_100_000),
        };
        // lastSync - overlap - 2 days
        assert_eq!(
            subscription_since(DmProtocol::Nip17, None, &last_sync, 1_700_999_999),
            1_700_100_000 - 10 - 172_800
        );
        // Explicit argument still gets the fuzz compensation
        assert_eq!(
            subscription_since(DmProtocol::Nip17, Some(1_700_100_000), &last_sync, 0),
            1_700_100_000 - 172_800
        );
    }
}
