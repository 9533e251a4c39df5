/// NIP-65: Relay List Metadata (kind 10002)
/// NIP-17: Private Direct Message Relay Lists (kind 10050)
///
/// Read-only input to the DM engine: the lists decide which relays carry a
/// user's DMs, and the engine compares a retained snapshot of the effective
/// DM relay URL against the current one to detect relay changes.

use dioxus::prelude::*;
use dioxus::signals::ReadableExt;
use dioxus_stores::Store;
use nostr_sdk::{Client, Filter, Kind, PublicKey, TagKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::time::now_secs;

/// Configuration for a single relay with read/write permissions
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    pub url: String,
    pub read: bool,
    pub write: bool,
}

/// Complete relay metadata for a user (both kind 10002 and 10050)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayListMetadata {
    pub relays: Vec<RelayConfig>, // kind 10002 - general relays
    pub dm_relays: Vec<String>,   // kind 10050 - DM inbox relays
    pub updated_at: u64,          // timestamp of last update
}

/// Store for relay list cache with fine-grained reactivity
#[derive(Clone, Debug, Default, Store)]
pub struct RelayListCacheStore {
    pub data: HashMap<String, RelayListMetadata>,
}

/// Cache for relay lists by pubkey
pub static RELAY_LIST_CACHE: GlobalSignal<Store<RelayListCacheStore>> =
    Signal::global(|| Store::new(RelayListCacheStore::default()));

/// Current user's relay metadata
pub static USER_RELAY_METADATA: GlobalSignal<Option<RelayListMetadata>> = Signal::global(|| None);

/// Default relays to use when no kind 10002 is found
pub fn default_relays() -> Vec<RelayConfig> {
    vec![
        RelayConfig {
            url: "wss://relay.damus.io".to_string(),
            read: true,
            write: true,
        },
        RelayConfig {
            url: "wss://relay.nostr.band".to_string(),
            read: true,
            write: true,
        },
        RelayConfig {
            url: "wss://nos.lol".to_string(),
            read: true,
            write: true,
        },
    ]
}

/// Parse relay list from kind 10002 event
/// NIP-65 tag format:
/// - ["r", "wss://relay.url"] = both read and write
/// - ["r", "wss://relay.url", "read"] = read only
/// - ["r", "wss://relay.url", "write"] = write only
pub fn parse_relay_list_event(event: &nostr_sdk::Event) -> Vec<RelayConfig> {
    let mut relays = Vec::new();

    for tag in event.tags.iter() {
        if let Some(standardized) = tag.as_standardized() {
            if let nostr_sdk::TagStandard::Relay(relay_url) = standardized {
                relays.push(RelayConfig {
                    url: relay_url.to_string(),
                    read: true,
                    write: true,
                });
                continue;
            }
        }

        // Fallback: custom 'r' tag with an optional read/write marker
        if tag.kind() == TagKind::Custom("r".into()) {
            let values = tag.clone().to_vec();
            if let Some(url) = values.get(1) {
                let marker = values.get(2).map(|s| s.as_str());
                relays.push(RelayConfig {
                    url: url.to_string(),
                    read: marker != Some("write"),
                    write: marker != Some("read"),
                });
            }
        }
    }

    relays
}

/// Parse DM relay list from kind 10050 event
/// NIP-17 tag format: ["relay", "wss://relay.url"]
pub fn parse_dm_relay_list(event: &nostr_sdk::Event) -> Vec<String> {
    let mut dm_relays = Vec::new();

    for tag in event.tags.iter() {
        if tag.kind() == TagKind::Custom("relay".into()) {
            if let Some(content) = tag.content() {
                dm_relays.push(content.to_string());
            }
        }
    }

    dm_relays
}

/// Fetch relay list (kind 10002) and DM relay list (kind 10050) for a user
pub async fn fetch_relay_list(
    pubkey: PublicKey,
    client: Arc<Client>,
) -> Result<RelayListMetadata, String> {
    log::info!("Fetching relay lists for {}", pubkey.to_hex());

    let filter_10002 = Filter::new().author(pubkey).kind(Kind::RelayList).limit(1);

    let filter_10050 = Filter::new()
        .author(pubkey)
        .kind(Kind::from(10050))
        .limit(1);

    let client_10002 = client.clone();
    let client_10050 = client.clone();
    let (result_10002, result_10050) = tokio::join!(
        client_10002.fetch_events(filter_10002, Duration::from_secs(5)),
        client_10050.fetch_events(filter_10050, Duration::from_secs(5))
    );

    let mut relays = Vec::new();
    let mut dm_relays = Vec::new();
    let mut updated_at = 0u64;

    match result_10002 {
        Ok(events) => {
            if let Some(event) = events.into_iter().next() {
                relays = parse_relay_list_event(&event);
                updated_at = event.created_at.as_secs();
                log::info!("Parsed {} general relays from kind 10002", relays.len());
            }
        }
        Err(e) => {
            log::error!("Failed to fetch kind 10002: {}", e);
        }
    }

    match result_10050 {
        Ok(events) => {
            if let Some(event) = events.into_iter().next() {
                dm_relays = parse_dm_relay_list(&event);
                log::info!("Parsed {} DM relays from kind 10050", dm_relays.len());
            }
        }
        Err(e) => {
            log::error!("Failed to fetch kind 10050: {}", e);
        }
    }

    if relays.is_empty() && dm_relays.is_empty() {
        return Err("No relay lists found".to_string());
    }

    Ok(RelayListMetadata {
        relays,
        dm_relays,
        updated_at,
    })
}

/// Initialize relay lists for current user on startup
pub async fn init_user_relay_lists(client: Arc<Client>) -> Result<(), String> {
    let signer = client.signer().await.map_err(|_| "No signer attached")?;
    let user_pubkey = signer
        .get_public_key()
        .await
        .map_err(|e| format!("Failed to get pubkey: {}", e))?;

    match fetch_relay_list(user_pubkey, client).await {
        Ok(remote) => {
            RELAY_LIST_CACHE
                .read()
                .data()
                .write()
                .insert(user_pubkey.to_hex(), remote.clone());
            *USER_RELAY_METADATA.write() = Some(remote);
            log::info!("Relay lists loaded");
            Ok(())
        }
        Err(e) => {
            log::warn!("Relay list fetch failed: {}, using defaults for this session", e);

            let default = RelayListMetadata {
                relays: default_relays(),
                dm_relays: vec!["wss://relay.damus.io".to_string()],
                updated_at: now_secs(),
            };

            *USER_RELAY_METADATA.write() = Some(default);
            Ok(())
        }
    }
}

/// Effective DM relay URL for the current user, used by the DM engine to
/// detect relay changes. Falls back to the general write relays when no
/// kind 10050 list exists.
pub fn effective_dm_relay_url() -> Option<String> {
    let metadata = USER_RELAY_METADATA.read().clone()?;

    if !metadata.dm_relays.is_empty() {
        return Some(metadata.dm_relays.join(","));
    }

    let writable: Vec<String> = metadata
        .relays
        .iter()
        .filter(|r| r.write)
        .map(|r| r.url.clone())
        .collect();

    if writable.is_empty() {
        None
    } else {
        Some(writable.join(","))
    }
}
