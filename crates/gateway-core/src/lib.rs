//! # tenvis-gateway-core
//!
//! Protocol-agnostic routing core of the gateway.
//!
//! - **Sequencer** - Correlation numbers in disjoint normal/observe ranges
//! - **Token / Envelope** - Capability-gated routing metadata
//! - **Sink** - Serialized two-way event bus between plugins and the manager
//! - **Subscriptions** - URI to subscriber fan-out registry
//! - **Controllers** - The pipeline stages
//! - **Manager** - Plugin registry, dispatch and reply correlation
//!
//! ## Architecture
//!
//! ```text
//!               request path                      reply path
//!  ┌─────────────────────────┐          ┌─────────────────────────┐
//!  │ Communication Manager   │          │ Communication Manager   │
//!  └───────────┬─────────────┘          └───────────┬─────────────┘
//!              ▼                                    ▼
//!  ┌─────────────────────────┐          ┌─────────────────────────┐
//!  │ Input Controller        │          │ Interconnection         │
//!  └───────────┬─────────────┘          └───────────┬─────────────┘
//!              ▼                                    ▼
//!  ┌─────────────────────────┐          ┌─────────────────────────┐
//!  │ Interconnection         │          │ Output Controller       │
//!  └───────────┬─────────────┘          └───────────┬─────────────┘
//!              ▼                                    ▼
//!       target plugin                        subscribed plugins
//! ```

pub mod block;
pub mod cache;
pub mod controllers;
pub mod envelope;
pub mod interconnection;
pub mod manager;
pub mod sequence;
pub mod sink;
pub mod subscription;
pub mod token;

pub use block::{Block, BlockId, Forward, PipelineGraph, RoutingError};
pub use cache::{MemoryCache, NoCache, ReplyCache};
pub use controllers::{InputController, OutputController};
pub use envelope::{Envelope, EnvelopeError, ExtraInfo, Field};
pub use interconnection::InterconnectionController;
pub use manager::{CommunicationManager, ManagerConfig, ManagerError, ManagerStats};
pub use sequence::Sequencer;
pub use sink::{sink, Link, ListenerResult, SinkError};
pub use subscription::{ReplyTo, Subscriber, SubscriptionRegistry, SubscriptionStats};
pub use token::Token;
