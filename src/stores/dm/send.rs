//! Outbound message pipeline.
//!
//! The optimistic placeholder lands in the reducer before any signer or
//! relay work, so the UI shows the message instantly; the live
//! subscription echo later replaces it in place. Publish failures leave
//! the placeholder flagged `is_sending` for the host UI to toast - no
//! rollback, no retry.

use dioxus::prelude::*;
use dioxus::signals::ReadableExt;
use nostr_sdk::{EventBuilder, Kind, PublicKey, Tag, TagKind, Tags, Timestamp};
use uuid::Uuid;

use crate::stores::nostr_client;
use crate::utils::time::now_secs;

use super::reducer;
use super::types::{
    DecryptedMessage, DmAttachment, DmProtocol, SendMessageParams, FILE_MESSAGE_KIND,
};
use super::{ConversationMapStoreStoreExt, DM_CONVERSATIONS, DM_SETTINGS};

/// Message text with attachment URLs appended, blank-line separated
pub fn compose_text(content: &str, attachments: &[DmAttachment]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if !content.is_empty() {
        parts.push(content);
    }
    for attachment in attachments {
        parts.push(&attachment.url);
    }
    parts.join("\n\n")
}

/// NIP-92 `imeta` tag for one attachment: url, MIME type, size, display
/// name, plus any integrity hashes (`x`, `ox`) from the upload metadata
pub fn imeta_tag(attachment: &DmAttachment) -> Tag {
    let mut values = vec![
        format!("url {}", attachment.url),
        format!("m {}", attachment.mime_type),
        format!("size {}", attachment.size),
    ];
    if !attachment.name.is_empty() {
        values.push(format!("alt {}", attachment.name));
    }
    for entry in &attachment.tags {
        if entry.len() >= 2 && (entry[0] == "x" || entry[0] == "ox") {
            values.push(format!("{} {}", entry[0], entry[1]));
        }
    }
    Tag::custom(TagKind::Custom("imeta".into()), values)
}

/// Send an encrypted DM over the requested protocol
pub async fn send_message(params: SendMessageParams) -> Result<(), String> {
    let client = nostr_client::get_client().ok_or("Client not initialized")?;

    if !nostr_client::has_signer() {
        return Err("No signer attached".to_string());
    }

    let recipient = PublicKey::parse(&params.recipient)
        .map_err(|e| format!("Invalid recipient pubkey: {}", e))?;

    let signer = client
        .signer()
        .await
        .map_err(|e| format!("Failed to get signer: {}", e))?;

    let sender = signer
        .get_public_key()
        .await
        .map_err(|e| format!("Failed to get sender pubkey: {}", e))?;

    if recipient == sender {
        return Err("Cannot send a message to yourself".to_string());
    }

    let text = compose_text(&params.content, &params.attachments);
    let imeta: Vec<Tag> = params.attachments.iter().map(imeta_tag).collect();

    // Optimistic placeholder goes in before any network work. Its kind
    // mirrors the real counterpart so reconciliation lines up.
    let now = now_secs();
    let optimistic = DecryptedMessage {
        id: format!("optimistic-{}-{}", now, Uuid::new_v4()),
        pubkey: sender,
        created_at: Timestamp::from(now),
        kind: match params.protocol {
            DmProtocol::Nip04 => Kind::EncryptedDirectMessage,
            DmProtocol::Nip17 => Kind::PrivateDirectMessage,
        },
        tags: Tags::new(),
        content: String::new(),
        sig: None,
        decrypted_content: Some(text.clone()),
        error: None,
        is_sending: true,
        client_first_seen: Some(now),
        seal: None,
    };

    {
        let settings = *DM_SETTINGS.read();
        let store = DM_CONVERSATIONS.read();
        let mut data = store.data();
        let mut map = data.write();
        reducer::apply_optimistic(
            &mut map,
            optimistic,
            recipient.to_hex(),
            params.protocol,
            &sender.to_hex(),
            &settings,
            now,
        );
    }

    log::info!(
        "Sending {:?} DM from {} to {}",
        params.protocol,
        sender.to_hex(),
        params.recipient
    );

    match params.protocol {
        DmProtocol::Nip04 => send_nip04(&signer, recipient, &text, imeta).await,
        DmProtocol::Nip17 => send_nip17(&signer, sender, recipient, &text, imeta).await,
    }
}

async fn send_nip04(
    signer: &std::sync::Arc<dyn nostr_sdk::signer::NostrSigner>,
    recipient: PublicKey,
    text: &str,
    imeta: Vec<Tag>,
) -> Result<(), String> {
    let ciphertext = signer
        .nip04_encrypt(&recipient, text)
        .await
        .map_err(|e| format!("NIP-04 encryption failed: {}", e))?;

    let mut tags = vec![Tag::public_key(recipient)];
    tags.extend(imeta);

    let builder = EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext).tags(tags);

    let event_id = nostr_client::publish_builder(builder).await?;
    log::info!("Sent NIP-04 DM: {}", event_id.to_hex());
    Ok(())
}

async fn send_nip17(
    signer: &std::sync::Arc<dyn nostr_sdk::signer::NostrSigner>,
    sender: PublicKey,
    recipient: PublicKey,
    text: &str,
    imeta: Vec<Tag>,
) -> Result<(), String> {
    // Kind 15 when attachments ride along, kind 14 otherwise. The rumor is
    // never signed and never published on its own.
    let rumor = if imeta.is_empty() {
        EventBuilder::private_msg_rumor(recipient, text).build(sender)
    } else {
        let mut tags = vec![Tag::public_key(recipient)];
        tags.extend(imeta);
        EventBuilder::new(Kind::from(FILE_MESSAGE_KIND), text)
            .tags(tags)
            .build(sender)
    };

    // Two wraps per message: one readable by the recipient, one by the
    // sender so their own devices can rebuild sent history. Each gets a
    // fresh ephemeral key and a fuzzed timestamp (NIP-59).
    let (receiver_wrap, sender_wrap) = tokio::join!(
        EventBuilder::gift_wrap(signer, &recipient, rumor.clone(), []),
        EventBuilder::gift_wrap(signer, &sender, rumor.clone(), [])
    );

    let receiver_wrap =
        receiver_wrap.map_err(|e| format!("Failed to create receiver gift wrap: {}", e))?;
    let sender_wrap =
        sender_wrap.map_err(|e| format!("Failed to create sender gift wrap: {}", e))?;

    let (receiver_result, sender_result) = tokio::join!(
        nostr_client::publish_event(&receiver_wrap),
        nostr_client::publish_event(&sender_wrap)
    );

    let receiver_id =
        receiver_result.map_err(|e| format!("Failed to send to receiver: {}", e))?;
    log::info!("Sent gift wrap to receiver: {}", receiver_id.to_hex());

    let sender_id = sender_result.map_err(|e| format!("Failed to send sender copy: {}", e))?;
    log::info!("Sent gift wrap to sender (copy): {}", sender_id.to_hex());

    Ok(())
}
