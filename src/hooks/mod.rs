pub mod use_direct_messages;

pub use use_direct_messages::{use_direct_messages, UseDirectMessages};
