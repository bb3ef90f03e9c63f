//! # gateway-plugin
//!
//! Plugin contract for the Tenvis IoT gateway.
//!
//! Every protocol adapter implements [`Plugin`] and exposes a client side,
//! a server side, or both:
//!
//! - **Client side** - receives requests routed to its protocol and answers
//!   through a [`ReplyLink`]
//! - **Server side** - submits requests from external clients through a
//!   [`RequestLink`] and receives pushed observe notifications
//!
//! ## Plugin Contract
//!
//! ```rust,ignore
//! use tenvis_gateway_plugin::{PendingReply, RequestLink};
//!
//! async fn forward(link: &dyn RequestLink, request: Request) {
//!     let pending = link.send(request).await?;
//!     let reply = pending.wait(Duration::from_secs(5)).await?;
//! }
//! ```

pub mod memory;
pub mod settings;
pub mod traits;

pub use memory::{MemoryOrigin, MemoryTarget};
pub use settings::{SettingKind, SettingSpec, SettingValue, Settings, SettingsError};
pub use traits::{
    ClientSide, LinkError, PendingReply, Plugin, PluginError, ProtocolName, ReplyLink,
    ReplyOutcome, RequestLink, ServerSide,
};
