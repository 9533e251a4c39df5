//! sealchat - a client-side encrypted direct-messaging engine for Nostr.
//!
//! Maintains a consistent decrypted view of every one-to-one conversation
//! across both DM wire protocols: legacy NIP-04 kind-4 messages and
//! NIP-17 gift wraps (NIP-59 wrapping over NIP-44 encryption). The engine
//! loads instantly from a NIP-44-sealed local cache, catches up from
//! relays without duplication, stays live through relay subscriptions,
//! sends optimistically, and persists everything back with debounced
//! writes.
//!
//! Embed it in a Dioxus app through [`use_direct_messages`]; everything
//! the chrome needs (conversation list, per-peer buckets, loader phases,
//! subscription status, send and refresh actions) hangs off the returned
//! handle.

pub mod hooks;
pub mod stores;
pub mod utils;

pub use hooks::{use_direct_messages, UseDirectMessages};
pub use stores::dm::{
    ConversationSummary, DecryptedMessage, DmAttachment, DmProtocol, DmSettings, LastSync,
    LoadingPhase, Participant, ProtocolMode, ScanProgress, SendMessageParams, SubscriptionStatus,
};
