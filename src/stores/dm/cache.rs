//! Encrypted conversation cache, one sealed document per user.
//!
//! The on-disk value for a user is either the cache document itself
//! (compatibility path for signers without NIP-44) or an
//! `{"encrypted": true, "data": "<ciphertext>"}` envelope produced by
//! NIP-44-encrypting the serialized document against the user's own key.
//!
//! In the browser the documents live in an IndexedDB database whose name
//! includes the hosting origin's hostname, so two apps sharing a browser
//! profile never collide. Native builds (and unit tests) use an in-memory
//! table behind the same API.

use nostr_sdk::signer::NostrSigner;
use nostr_sdk::PublicKey;
use serde_json::Value;
use std::sync::Arc;

use super::types::CacheDocument;

// --- Envelope ------------------------------------------------------------

/// Serialize `doc`, sealing it against the user's own key when the signer
/// can NIP-44. Falls back to the plaintext document when it cannot.
pub async fn seal_document(
    doc: &CacheDocument,
    user: &PublicKey,
    signer: Option<&Arc<dyn NostrSigner>>,
) -> Result<String, String> {
    let json = serde_json::to_string(doc)
        .map_err(|e| format!("Failed to serialize cache document: {}", e))?;

    if let Some(signer) = signer {
        match signer.nip44_encrypt(user, &json).await {
            Ok(ciphertext) => {
                let envelope = serde_json::json!({
                    "encrypted": true,
                    "data": ciphertext,
                });
                return serde_json::to_string(&envelope)
                    .map_err(|e| format!("Failed to serialize cache envelope: {}", e));
            }
            Err(e) => {
                log::warn!("Signer cannot NIP-44 encrypt cache, storing plaintext: {}", e);
            }
        }
    }

    Ok(json)
}

/// Parse a stored value back into a cache document. Returns `None` on an
/// unreadable document or a sealed envelope that cannot be opened - the
/// engine then falls through to a full relay backfill.
pub async fn open_document(
    raw: &str,
    user: &PublicKey,
    signer: Option<&Arc<dyn NostrSigner>>,
) -> Option<CacheDocument> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Discarding unparseable DM cache: {}", e);
            return None;
        }
    };

    let is_envelope = value.get("encrypted").and_then(Value::as_bool) == Some(true);

    if is_envelope {
        let ciphertext = value.get("data").and_then(Value::as_str)?;
        let signer = match signer {
            Some(s) => s,
            None => {
                log::warn!("DM cache is encrypted but no signer is available, treating as miss");
                return None;
            }
        };
        match signer.nip44_decrypt(user, ciphertext).await {
            Ok(plaintext) => match serde_json::from_str(&plaintext) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    log::warn!("Discarding corrupt decrypted DM cache: {}", e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to decrypt DM cache, treating as miss: {}", e);
                None
            }
        }
    } else {
        // Compatibility path: document stored in the clear
        match serde_json::from_value(value) {
            Ok(doc) => Some(doc),
            Err(e) => {
                log::warn!("Discarding malformed plaintext DM cache: {}", e);
                None
            }
        }
    }
}

// --- Storage backend -----------------------------------------------------

#[cfg(target_arch = "wasm32")]
mod backend {
    use indexed_db_futures::prelude::*;
    use std::future::IntoFuture;
    use wasm_bindgen::JsValue;
    use web_sys::IdbTransactionMode;

    const DB_VERSION: u32 = 1;
    const STORE_CONVERSATIONS: &str = "conversations";

    /// Database name scoped to the hosting origin so two apps sharing a
    /// browser profile never collide
    fn db_name() -> String {
        let hostname = web_sys::window()
            .and_then(|w| w.location().hostname().ok())
            .unwrap_or_else(|| "localhost".to_string());
        format!("sealchat-dm-{}", hostname)
    }

    async fn open_db() -> Result<IdbDatabase, String> {
        let mut db_req: OpenDbRequest = IdbDatabase::open_u32(&db_name(), DB_VERSION)
            .map_err(|e| format!("Failed to open database: {:?}", e))?;

        db_req.set_on_upgrade_needed(Some(|evt: &IdbVersionChangeEvent| {
            let db = evt.db();
            if !db.object_store_names().any(|n| n == STORE_CONVERSATIONS) {
                db.create_object_store(STORE_CONVERSATIONS)?;
            }
            Ok(())
        }));

        db_req
            .into_future()
            .await
            .map_err(|e| format!("Failed to open database: {:?}", e))
    }

    pub async fn get(key: &str) -> Result<Option<String>, String> {
        let db = open_db().await?;

        let tx = db
            .transaction_on_one_with_mode(STORE_CONVERSATIONS, IdbTransactionMode::Readonly)
            .map_err(|e| format!("Transaction error: {:?}", e))?;

        let store = tx
            .object_store(STORE_CONVERSATIONS)
            .map_err(|e| format!("Store error: {:?}", e))?;

        let js_key = JsValue::from_str(key);
        let value_opt = store
            .get(&js_key)
            .map_err(|e| format!("Get error: {:?}", e))?
            .await
            .map_err(|e| format!("Get await error: {:?}", e))?;

        Ok(value_opt.and_then(|v| v.as_string()))
    }

    pub async fn put(key: &str, value: &str) -> Result<(), String> {
        let db = open_db().await?;

        let tx = db
            .transaction_on_one_with_mode(STORE_CONVERSATIONS, IdbTransactionMode::Readwrite)
            .map_err(|e| format!("Transaction error: {:?}", e))?;

        let store = tx
            .object_store(STORE_CONVERSATIONS)
            .map_err(|e| format!("Store error: {:?}", e))?;

        let js_key = JsValue::from_str(key);
        let js_value = JsValue::from_str(value);

        store
            .put_key_val(&js_key, &js_value)
            .map_err(|e| format!("Put error: {:?}", e))?;

        tx.await
            .into_result()
            .map_err(|e| format!("Transaction commit error: {:?}", e))?;

        Ok(())
    }

    pub async fn delete(key: &str) -> Result<(), String> {
        let db = open_db().await?;

        let tx = db
            .transaction_on_one_with_mode(STORE_CONVERSATIONS, IdbTransactionMode::Readwrite)
            .map_err(|e| format!("Transaction error: {:?}", e))?;

        let store = tx
            .object_store(STORE_CONVERSATIONS)
            .map_err(|e| format!("Store error: {:?}", e))?;

        let js_key = JsValue::from_str(key);
        store
            .delete(&js_key)
            .map_err(|e| format!("Delete error: {:?}", e))?;

        tx.await
            .into_result()
            .map_err(|e| format!("Transaction commit error: {:?}", e))?;

        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod backend {
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    static TABLE: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();

    fn table() -> &'static Mutex<HashMap<String, String>> {
        TABLE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub async fn get(key: &str) -> Result<Option<String>, String> {
        let guard = table()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.get(key).cloned())
    }

    pub async fn put(key: &str, value: &str) -> Result<(), String> {
        let mut guard = table()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub async fn delete(key: &str) -> Result<(), String> {
        let mut guard = table()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(key);
        Ok(())
    }
}

// --- Public API ----------------------------------------------------------

/// Persist the cache document for `user`, sealed when possible
pub async fn write(
    user: &PublicKey,
    doc: &CacheDocument,
    signer: Option<&Arc<dyn NostrSigner>>,
) -> Result<(), String> {
    let serialized = seal_document(doc, user, signer).await?;
    backend::put(&user.to_hex(), &serialized).await?;
    log::debug!(
        "Persisted DM cache for {} ({} participants)",
        user.to_hex(),
        doc.participants.len()
    );
    Ok(())
}

/// Load the cache document for `user`. Backend I/O errors bubble up;
/// `Ok(None)` covers both a plain miss and a decrypt / parse failure, and
/// the caller falls back to relay backfill in every `None` case.
pub async fn read(
    user: &PublicKey,
    signer: Option<&Arc<dyn NostrSigner>>,
) -> Result<Option<CacheDocument>, String> {
    let raw = match backend::get(&user.to_hex()).await? {
        Some(raw) => raw,
        None => return Ok(None),
    };

    Ok(open_document(&raw, user, signer).await)
}

/// Remove the cache document for `user`
pub async fn delete(user: &PublicKey) -> Result<(), String> {
    backend::delete(&user.to_hex()).await
}
