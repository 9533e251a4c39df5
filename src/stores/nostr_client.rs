use dioxus::prelude::*;
use dioxus::signals::ReadableExt;
use nostr::Url;
use std::result::Result;
use nostr_sdk::prelude::*;
use nostr_sdk::Client;
use std::sync::Arc;
use std::time::Duration;

#[cfg(target_arch = "wasm32")]
use nostr_indexeddb::WebDatabase;

use crate::stores::relay_metadata;
use crate::stores::signer::SignerType;

/// Global Nostr client instance
pub static NOSTR_CLIENT: GlobalSignal<Option<Arc<Client>>> = Signal::global(|| None);

/// Whether the client has finished initializing
pub static CLIENT_INITIALIZED: GlobalSignal<bool> = Signal::global(|| false);

/// Whether the client has a signer attached (can publish events)
pub static HAS_SIGNER: GlobalSignal<bool> = Signal::global(|| false);

/// The current signer type (if any)
pub static CURRENT_SIGNER: GlobalSignal<Option<SignerType>> = Signal::global(|| None);

/// Relay connection status
#[derive(Clone, Debug, PartialEq)]
pub enum RelayStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Relay information
#[derive(Clone, Debug)]
pub struct RelayInfo {
    pub url: String,
    pub status: RelayStatus,
}

/// Store for relay pool with fine-grained reactivity
#[derive(Clone, Debug, Default, Store)]
pub struct RelayPoolStore {
    pub data: Vec<RelayInfo>,
}

pub static RELAY_POOL: GlobalSignal<Store<RelayPoolStore>> =
    Signal::global(|| Store::new(RelayPoolStore::default()));

/// Default relays to connect to
const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.snort.social",
    "wss://relay.nostr.band",
];

/// Initialize the Nostr client and connect to relays
pub async fn initialize_client() -> Result<Arc<Client>, String> {
    log::info!("Initializing Nostr client...");

    // Relay options: verify subscription matches and reconnect automatically.
    // The DM engine relies on the pool's reconnect for mid-stream drops.
    let relay_opts = RelayOptions::new()
        .max_avg_latency(Some(Duration::from_secs(2)))
        .verify_subscriptions(true)
        .adjust_retry_interval(true)
        .retry_interval(Duration::from_secs(10))
        .reconnect(true);

    #[cfg(target_arch = "wasm32")]
    let client = {
        let database = WebDatabase::open("sealchat-events").await.map_err(|e| {
            log::error!("Failed to open IndexedDB: {}", e);
            format!("Failed to open IndexedDB: {}", e)
        })?;

        log::info!("IndexedDB event database opened");

        Client::builder().database(database).build()
    };

    #[cfg(not(target_arch = "wasm32"))]
    let client = Client::builder().build();

    let client = Arc::new(client);

    let mut relay_infos = Vec::new();
    for relay_url in DEFAULT_RELAYS {
        if let Ok(url) = Url::parse(relay_url) {
            match client.pool().add_relay(url.clone(), relay_opts.clone()).await {
                Ok(_) => {
                    relay_infos.push(RelayInfo {
                        url: relay_url.to_string(),
                        status: RelayStatus::Connecting,
                    });
                }
                Err(e) => {
                    log::error!("Failed to add relay {}: {}", relay_url, e);
                    relay_infos.push(RelayInfo {
                        url: relay_url.to_string(),
                        status: RelayStatus::Disconnected,
                    });
                }
            }
        }
    }

    RELAY_POOL.read().data().write().clone_from(&relay_infos);

    // Store client and mark initialized BEFORE connecting so the UI can
    // start rendering while relays connect in background.
    *NOSTR_CLIENT.write() = Some(client.clone());
    *CLIENT_INITIALIZED.write() = true;

    // Connect in background - in WASM, dropping the future won't run it.
    #[cfg(target_arch = "wasm32")]
    {
        let client_for_connect = client.clone();
        wasm_bindgen_futures::spawn_local(async move {
            client_for_connect.connect().await;
            log::info!("Background relay connections completed");
        });
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        let client_for_connect = client.clone();
        tokio::spawn(async move {
            client_for_connect.connect().await;
            log::info!("Background relay connections completed");
        });
    }

    log::info!("Nostr client initialized (relays connecting in background)");
    Ok(client)
}

/// Get the current client instance
pub fn get_client() -> Option<Arc<Client>> {
    NOSTR_CLIENT.read().clone()
}

/// Check if the client has a signer attached
pub fn has_signer() -> bool {
    *HAS_SIGNER.read()
}

/// Get the current signer
pub fn get_signer() -> Option<SignerType> {
    CURRENT_SIGNER.read().clone()
}

/// Ensure at least one relay is connected before fetching.
/// `connect()` is non-blocking and spawns background tasks, so the first
/// fetch after startup may race the sockets; in WASM, polling never yields
/// to those tasks, but `connect().await` drives them to completion.
pub async fn ensure_relays_ready(client: &Client) {
    use nostr_relay_pool::RelayStatus as PoolRelayStatus;

    let relays = client.relays().await;
    let any_connected = relays
        .values()
        .any(|r| r.status() == PoolRelayStatus::Connected);

    if any_connected {
        return;
    }

    log::info!("No relays connected, calling connect().await...");
    client.connect().await;

    let relays_after = client.relays().await;
    let connected_count = relays_after
        .values()
        .filter(|r| r.status() == PoolRelayStatus::Connected)
        .count();
    if connected_count == 0 {
        log::warn!("connect().await completed but no relays are connected - fetches may fail");
    }
}

/// Attach a signer to the existing client (enables publishing)
pub async fn set_signer(signer: SignerType) -> Result<(), String> {
    log::info!("Setting signer: {}", signer.backend_name());

    let client = get_client().ok_or("Client not initialized")?;

    let nostr_signer = signer.as_nostr_signer();
    client.set_signer(nostr_signer).await;

    *HAS_SIGNER.write() = true;
    *CURRENT_SIGNER.write() = Some(signer.clone());

    // Load the user's relay lists (kind 10002/10050) in background; the DM
    // engine watches the resulting snapshot for relay changes.
    let client_clone = client.clone();
    spawn(async move {
        if let Err(e) = relay_metadata::init_user_relay_lists(client_clone).await {
            log::warn!("Failed to load user relay lists: {}", e);
        }
    });

    log::info!("Signer updated successfully");
    Ok(())
}

/// Switch to read-only mode (removes signer)
pub async fn set_read_only() -> Result<(), String> {
    log::info!("Switching to read-only mode");

    let client = get_client().ok_or("Client not initialized")?;

    client.unset_signer().await;

    *HAS_SIGNER.write() = false;
    *CURRENT_SIGNER.write() = None;

    Ok(())
}

/// Add a custom relay
pub async fn add_relay(relay_url: &str) -> Result<(), String> {
    let client = get_client().ok_or("Client not initialized")?;

    let url = Url::parse(relay_url).map_err(|e| format!("Invalid URL: {}", e))?;

    client.add_relay(url).await.map_err(|e| e.to_string())?;

    let store = RELAY_POOL.read();
    let mut data = store.data();
    let mut relays = data.write();
    relays.push(RelayInfo {
        url: relay_url.to_string(),
        status: RelayStatus::Connecting,
    });

    log::info!("Added relay: {}", relay_url);
    Ok(())
}

/// Remove a relay
pub async fn remove_relay(relay_url: &str) -> Result<(), String> {
    let client = get_client().ok_or("Client not initialized")?;

    let url = Url::parse(relay_url).map_err(|e| format!("Invalid URL: {}", e))?;

    client.remove_relay(url).await.map_err(|e| e.to_string())?;

    let store = RELAY_POOL.read();
    let mut data = store.data();
    let mut relays = data.write();
    relays.retain(|r| r.url != relay_url);

    log::info!("Removed relay: {}", relay_url);
    Ok(())
}

/// One-shot filtered fetch from relays with a timeout
pub async fn fetch_events(filter: Filter, timeout: Duration) -> Result<Vec<nostr::Event>, String> {
    let client = get_client().ok_or("Client not initialized")?;

    ensure_relays_ready(&client).await;

    client
        .fetch_events(filter, timeout)
        .await
        .map(|events| events.into_iter().collect())
        .map_err(|e| format!("Failed to fetch events: {}", e))
}

/// Open a long-lived subscription; caller routes matching notifications
pub async fn subscribe(filter: Filter) -> Result<SubscriptionId, String> {
    let client = get_client().ok_or("Client not initialized")?;

    ensure_relays_ready(&client).await;

    client
        .subscribe(filter, None)
        .await
        .map(|output| output.val)
        .map_err(|e| format!("Failed to subscribe: {}", e))
}

/// Close a subscription previously opened with `subscribe`
pub async fn unsubscribe(id: &SubscriptionId) {
    if let Some(client) = get_client() {
        client.unsubscribe(id).await;
    }
}

/// Publish a signed event to the write relays
pub async fn publish_event(event: &nostr::Event) -> Result<EventId, String> {
    let client = get_client().ok_or("Client not initialized")?;

    let output = client
        .send_event(event)
        .await
        .map_err(|e| format!("Failed to publish event: {}", e))?;

    Ok(output.val)
}

/// Sign and publish an event builder with the attached signer
pub async fn publish_builder(builder: EventBuilder) -> Result<EventId, String> {
    let client = get_client().ok_or("Client not initialized")?;

    if !*HAS_SIGNER.read() {
        return Err("No signer attached".to_string());
    }

    let output = client
        .send_event_builder(builder)
        .await
        .map_err(|e| format!("Failed to publish event: {}", e))?;

    Ok(output.val)
}
