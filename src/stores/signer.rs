//! Unified signer management for all authentication methods.
//!
//! The DM engine only ever talks to `Arc<dyn NostrSigner>`; which backend
//! sits behind it decides what the engine can decrypt. A NIP-07 extension
//! without NIP-44 support, or a remote signer that rejects NIP-04, simply
//! produces errored messages for the affected protocol.

use dioxus::prelude::*;
use dioxus::signals::ReadableExt;
use nostr::{Keys, PublicKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[cfg(target_arch = "wasm32")]
use gloo_storage::{LocalStorage, Storage};
#[cfg(target_arch = "wasm32")]
use nostr_browser_signer::BrowserSigner;

use nostr_connect::client::NostrConnect;

/// Types of signers the engine can drive
#[derive(Debug, Clone)]
pub enum SignerType {
    /// Private key signer (nsec)
    Keys(Keys),
    /// Browser extension signer (NIP-07)
    #[cfg(target_arch = "wasm32")]
    BrowserExtension(Arc<BrowserSigner>),
    /// Remote signer (NIP-46)
    NostrConnect(Arc<NostrConnect>),
}

impl SignerType {
    /// Get the public key for this signer
    pub async fn public_key(&self) -> Result<PublicKey, String> {
        match self {
            SignerType::Keys(keys) => Ok(keys.public_key()),
            #[cfg(target_arch = "wasm32")]
            SignerType::BrowserExtension(signer) => {
                use nostr::signer::NostrSigner;
                signer
                    .get_public_key()
                    .await
                    .map_err(|e| format!("Failed to get public key from browser extension: {}", e))
            }
            SignerType::NostrConnect(nostr_connect) => {
                use nostr::signer::NostrSigner;
                nostr_connect
                    .get_public_key()
                    .await
                    .map_err(|e| format!("Failed to get public key from remote signer: {}", e))
            }
        }
    }

    /// Get the signer backend type as a string
    pub fn backend_name(&self) -> &'static str {
        match self {
            SignerType::Keys(_) => "Keys",
            #[cfg(target_arch = "wasm32")]
            SignerType::BrowserExtension(_) => "Browser Extension",
            SignerType::NostrConnect(_) => "Remote Signer",
        }
    }

    /// Get a reference as Arc<dyn NostrSigner>
    pub fn as_nostr_signer(&self) -> Arc<dyn nostr::signer::NostrSigner> {
        match self {
            SignerType::Keys(keys) => Arc::new(keys.clone()),
            #[cfg(target_arch = "wasm32")]
            SignerType::BrowserExtension(signer) => signer.clone(),
            SignerType::NostrConnect(nostr_connect) => nostr_connect.clone(),
        }
    }
}

/// Persisted signer information for session restoration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerInfo {
    pub public_key: String,
    pub backend: SignerBackend,
}

/// Signer backend types for persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignerBackend {
    Keys,
    #[cfg(target_arch = "wasm32")]
    BrowserExtension,
    RemoteSigner,
}

/// Global signal for the current signer
pub static CURRENT_SIGNER: GlobalSignal<Option<SignerType>> = Signal::global(|| None);

/// Global signal for signer info (persisted)
pub static SIGNER_INFO: GlobalSignal<Option<SignerInfo>> = Signal::global(|| {
    #[cfg(target_arch = "wasm32")]
    {
        LocalStorage::get("signer_info").ok()
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        None
    }
});

/// Set the current signer and persist session info
pub async fn set_signer(signer: SignerType) -> Result<(), String> {
    let public_key = signer.public_key().await?;

    let backend = match &signer {
        SignerType::Keys(_) => SignerBackend::Keys,
        #[cfg(target_arch = "wasm32")]
        SignerType::BrowserExtension(_) => SignerBackend::BrowserExtension,
        SignerType::NostrConnect(_) => SignerBackend::RemoteSigner,
    };

    let info = SignerInfo {
        public_key: public_key.to_string(),
        backend,
    };

    #[cfg(target_arch = "wasm32")]
    LocalStorage::set("signer_info", &info)
        .map_err(|e| format!("Failed to persist signer info: {}", e))?;

    *SIGNER_INFO.write() = Some(info);
    *CURRENT_SIGNER.write() = Some(signer);

    Ok(())
}

/// Clear the current signer and remove persisted session
pub fn clear_signer() {
    #[cfg(target_arch = "wasm32")]
    LocalStorage::delete("signer_info");
    *SIGNER_INFO.write() = None;
    *CURRENT_SIGNER.write() = None;
}

/// Get the current signer
pub fn get_signer() -> Option<SignerType> {
    CURRENT_SIGNER.read().clone()
}

/// Check if a signer is currently set
pub fn has_signer() -> bool {
    CURRENT_SIGNER.read().is_some()
}
