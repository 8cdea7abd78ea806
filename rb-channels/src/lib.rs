//! Channel adapters for Relaybot.
//!
//! Adapters are pure I/O: they convert platform messages to/from Relaybot
//! `InboundMessage` / `OutboundMessage`. Inbound WhatsApp events arrive via
//! webhook; `webhook` holds the payload types and signature checks.

mod traits;
mod types;
pub mod webhook;
mod whatsapp;

pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, InboundMessage, InboundMessageKind, MediaId, MediaPayload, MessageId,
    OutboundKind, OutboundMessage, SenderId, ThreadId,
};
pub use whatsapp::{GRAPH_API_BASE, WhatsAppCloudAdapter};
