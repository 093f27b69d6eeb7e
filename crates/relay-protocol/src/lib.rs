//! # ccrelay-protocol
//!
//! Wire formats shared by the ccrelay server and its producers.
//!
//! Producers (game clients) talk to the relay over a WebSocket carrying JSON
//! objects tagged by a `type` field:
//!
//! - `CHAT_MESSAGE` - a clan chat line to forward to subscribers
//! - `CC_CHANGE` - the producer joined (or left) a clan chat
//!
//! The chat platform talks to the relay over its interactions webhook; those
//! payloads live in [`interaction`].
//!
//! ## Example
//!
//! ```rust
//! use ccrelay_protocol::{codec, InboundEvent};
//!
//! let event = codec::decode_str(r#"{"type":"CC_CHANGE","cc":"The Irons","guest":false}"#).unwrap();
//! assert!(matches!(event, InboundEvent::TopicDeclaration(_)));
//! ```

pub mod codec;
pub mod event;
pub mod interaction;

pub use codec::{decode_slice, decode_str, EventDecoder, ProtocolError};
pub use event::{ChatMessage, ForwardPayload, InboundEvent, MessageKind, Timestamp, TopicDeclaration};
