//! # gateway-protocol
//!
//! Protocol-neutral message model for the Tenvis IoT gateway.
//!
//! Protocol adapters (HTTP, CoAP, MQTT, ...) translate their wire messages
//! into the types of this crate, and the routing core never looks past them.
//!
//! ## Message Types
//!
//! - `Request` - Mutable until the gateway sequences it
//! - `Reply` - Immutable answer correlated to a request sequence
//! - `ErrorReply` - Failure carrying a `Reason`, delivered like a reply
//!
//! ## Example
//!
//! ```rust
//! use gateway_protocol::{GatewayUri, Operation, Request};
//!
//! let request = Request::new(Operation::Read, "/coap/10.0.0.2:5683/temp?unit=c");
//! let uri = GatewayUri::parse(request.headers().path()).unwrap();
//! assert_eq!(uri.to_string(), "coap://10.0.0.2:5683/temp?unit=c");
//! ```

pub mod error;
pub mod headers;
pub mod message;
pub mod payload;
pub mod uri;

pub use error::ProtocolError;
pub use headers::{Headers, Operation, QualityOfService};
pub use message::{ErrorReply, Message, MessageKind, Reason, Reply, ReplyBuilder, Request, Sequence};
pub use payload::{Charset, Payload, CONTENT_TYPE_JSON, CONTENT_TYPE_MSGPACK};
pub use uri::GatewayUri;
