use dioxus::prelude::*;
use nostr::{Keys, PublicKey, ToBech32};
use serde::{Deserialize, Serialize};
#[cfg(target_arch = "wasm32")]
use std::sync::Arc;

#[cfg(target_arch = "wasm32")]
use gloo_storage::{LocalStorage, Storage};

use crate::stores::nostr_client;
use crate::stores::signer::{set_signer as store_signer, SignerType};

#[cfg(target_arch = "wasm32")]
use nostr_browser_signer::BrowserSigner;

/// Authentication state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    pub pubkey: Option<String>,
    pub is_authenticated: bool,
    pub login_method: Option<LoginMethod>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LoginMethod {
    BrowserExtension, // NIP-07
    PrivateKey,       // nsec stored locally
    ReadOnly,         // npub only
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            pubkey: None,
            is_authenticated: false,
            login_method: None,
        }
    }
}

/// Global authentication state
pub static AUTH_STATE: GlobalSignal<AuthState> = Signal::global(AuthState::default);

/// Global keys (if using private key login)
static KEYS: GlobalSignal<Option<Keys>> = Signal::global(|| None);

#[cfg(target_arch = "wasm32")]
const STORAGE_KEY_NSEC: &str = "nostr_nsec";
#[cfg(target_arch = "wasm32")]
const STORAGE_KEY_NPUB: &str = "nostr_npub";
#[cfg(target_arch = "wasm32")]
const STORAGE_KEY_METHOD: &str = "nostr_login_method";

/// Initialize authentication from stored credentials.
/// Only loads the auth state; actual signer restoration happens in
/// `restore_session_async()` once the client is up.
pub fn init_auth() {
    #[cfg(target_arch = "wasm32")]
    {
        log::info!("Initializing authentication...");

        if let Ok(method_str) = LocalStorage::get::<String>(STORAGE_KEY_METHOD) {
            match method_str.as_str() {
                "extension" => {
                    if let Ok(npub) = LocalStorage::get::<String>(STORAGE_KEY_NPUB) {
                        *AUTH_STATE.write() = AuthState {
                            pubkey: Some(npub),
                            is_authenticated: true,
                            login_method: Some(LoginMethod::BrowserExtension),
                        };
                    }
                }
                "private_key" => {
                    if let Ok(npub) = LocalStorage::get::<String>(STORAGE_KEY_NPUB) {
                        *AUTH_STATE.write() = AuthState {
                            pubkey: Some(npub),
                            is_authenticated: true,
                            login_method: Some(LoginMethod::PrivateKey),
                        };
                    }
                }
                "read_only" => {
                    if let Ok(npub) = LocalStorage::get::<String>(STORAGE_KEY_NPUB) {
                        *AUTH_STATE.write() = AuthState {
                            pubkey: Some(npub),
                            is_authenticated: false,
                            login_method: Some(LoginMethod::ReadOnly),
                        };
                    }
                }
                _ => {}
            }
        }
    }
}

/// Restore session asynchronously (call after client initialization)
pub async fn restore_session_async() {
    #[cfg(target_arch = "wasm32")]
    {
        log::info!("Restoring session...");

        if let Ok(method_str) = LocalStorage::get::<String>(STORAGE_KEY_METHOD) {
            match method_str.as_str() {
                "extension" => {
                    if let Err(e) = login_with_browser_extension().await {
                        log::error!("Failed to restore browser extension session: {}", e);
                        clear_auth();
                    }
                }
                "private_key" => {
                    if let Ok(nsec) = LocalStorage::get::<String>(STORAGE_KEY_NSEC) {
                        if let Err(e) = login_with_nsec(&nsec).await {
                            log::error!("Failed to restore private key session: {}", e);
                            clear_auth();
                        }
                    }
                }
                "read_only" => {
                    if let Ok(npub) = LocalStorage::get::<String>(STORAGE_KEY_NPUB) {
                        if let Err(e) = login_with_npub(&npub).await {
                            log::error!("Failed to restore read-only session: {}", e);
                            clear_auth();
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Login with private key (nsec)
pub async fn login_with_nsec(nsec: &str) -> Result<(), String> {
    log::info!("Logging in with private key...");

    let keys = Keys::parse(nsec).map_err(|e| format!("Invalid private key: {}", e))?;

    let pubkey = keys.public_key().to_string();

    *KEYS.write() = Some(keys.clone());

    let signer = SignerType::Keys(keys);
    store_signer(signer.clone()).await?;
    nostr_client::set_signer(signer).await?;

    *AUTH_STATE.write() = AuthState {
        pubkey: Some(pubkey.clone()),
        is_authenticated: true,
        login_method: Some(LoginMethod::PrivateKey),
    };

    #[cfg(target_arch = "wasm32")]
    {
        LocalStorage::set(STORAGE_KEY_NSEC, nsec).ok();
        LocalStorage::set(STORAGE_KEY_NPUB, &pubkey).ok();
        LocalStorage::set(STORAGE_KEY_METHOD, "private_key").ok();
    }

    log::info!("Successfully logged in with pubkey: {}", pubkey);

    Ok(())
}

/// Login with public key only (read-only mode).
/// The DM engine still loads in this mode; every encrypted event degrades
/// into an errored placeholder because there is no signer to decrypt with.
pub async fn login_with_npub(npub: &str) -> Result<(), String> {
    log::info!("Logging in with public key (read-only)...");

    let pubkey = PublicKey::parse(npub).map_err(|e| format!("Invalid public key: {}", e))?;

    let pubkey_str = pubkey.to_string();

    nostr_client::set_read_only().await?;

    *AUTH_STATE.write() = AuthState {
        pubkey: Some(pubkey_str.clone()),
        is_authenticated: false,
        login_method: Some(LoginMethod::ReadOnly),
    };

    #[cfg(target_arch = "wasm32")]
    {
        LocalStorage::set(STORAGE_KEY_NPUB, npub).ok();
        LocalStorage::set(STORAGE_KEY_METHOD, "read_only").ok();
    }

    log::info!("Loaded read-only mode with pubkey: {}", pubkey_str);
    Ok(())
}

/// Login with NIP-07 browser extension
pub async fn login_with_browser_extension() -> Result<(), String> {
    #[cfg(target_arch = "wasm32")]
    {
        log::info!("Attempting browser extension login...");

        let browser_signer = BrowserSigner::new()
            .map_err(|e| format!("Failed to initialize browser signer: {}", e))?;

        use nostr::signer::NostrSigner;
        let pubkey = browser_signer
            .get_public_key()
            .await
            .map_err(|e| format!("Failed to get public key from extension: {}", e))?;

        let pubkey_str = pubkey.to_string();

        let signer = SignerType::BrowserExtension(Arc::new(browser_signer));
        store_signer(signer.clone()).await?;
        nostr_client::set_signer(signer).await?;

        *AUTH_STATE.write() = AuthState {
            pubkey: Some(pubkey_str.clone()),
            is_authenticated: true,
            login_method: Some(LoginMethod::BrowserExtension),
        };

        LocalStorage::set(STORAGE_KEY_METHOD, "extension").ok();
        LocalStorage::set(STORAGE_KEY_NPUB, &pubkey_str).ok();

        log::info!(
            "Successfully logged in via browser extension with pubkey: {}",
            pubkey_str
        );

        Ok(())
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        Err("Browser extension login is only available in browser".to_string())
    }
}

/// Check if browser extension (NIP-07) is available
pub fn is_browser_extension_available() -> bool {
    #[cfg(target_arch = "wasm32")]
    {
        BrowserSigner::new().is_ok()
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        false
    }
}

/// Generate new keypair
pub fn generate_keys() -> Keys {
    let keys = Keys::generate();
    log::info!("Generated new keypair: {}", keys.public_key());
    keys
}

/// Get current keys (if logged in with private key)
pub fn get_keys() -> Option<Keys> {
    KEYS.read().clone()
}

/// Get current public key
pub fn get_pubkey() -> Option<String> {
    AUTH_STATE.read().pubkey.clone()
}

/// Check if user is authenticated (can sign events)
pub fn is_authenticated() -> bool {
    AUTH_STATE.read().is_authenticated
}

/// Get login method
pub fn get_login_method() -> Option<LoginMethod> {
    AUTH_STATE.read().login_method.clone()
}

/// Logout and clear credentials
pub async fn logout() {
    log::info!("Logging out...");

    crate::stores::dm::teardown_direct_messages().await;

    clear_auth();

    #[cfg(target_arch = "wasm32")]
    {
        LocalStorage::delete(STORAGE_KEY_NSEC);
        LocalStorage::delete(STORAGE_KEY_NPUB);
        LocalStorage::delete(STORAGE_KEY_METHOD);
    }
}

/// Clear authentication state
fn clear_auth() {
    *AUTH_STATE.write() = AuthState::default();
    *KEYS.write() = None;
    crate::stores::signer::clear_signer();
}

/// Export private key as nsec
pub fn export_nsec() -> Result<String, String> {
    let keys = get_keys().ok_or("Not logged in with private key")?;
    keys.secret_key().to_bech32().map_err(|e| e.to_string())
}
