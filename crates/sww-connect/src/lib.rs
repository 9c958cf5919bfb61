//! Pairing and messaging over an untrusted relay.
//!
//! This crate provides:
//! - [`SessionManager`]: session lifecycle and key material for one device
//! - [`MailboxTransport`]: the relay contract, plus [`MemoryMailbox`]
//! - [`ConnectionCoordinator`]: advertising, joining, sending, receiving and
//!   teardown on top of both
//!
//! # Example
//!
//! ```no_run
//! use sww_common::{DeviceId, Payload, ProtocolConfig};
//! use sww_connect::{ConnectionCoordinator, MemoryMailbox};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = MemoryMailbox::new();
//! let host = ConnectionCoordinator::new(relay.clone(), DeviceId::generate()?, ProtocolConfig::default());
//! let guest = ConnectionCoordinator::new(relay, DeviceId::generate()?, ProtocolConfig::default());
//!
//! let offer = host.create_session().await?;
//! guest.connect_with_qr(&offer.payload).await?;
//! host.send_payload(Payload::text("hello")).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod coordinator;
pub mod env;
pub mod events;
pub mod inbound;
pub mod mailbox;
pub mod session;

pub use coordinator::{
    Connection, ConnectionCoordinator, ConnectionStatus, CoordinatorError, ErrorKind,
    SessionOffer,
};
pub use env::{Clock, ManualClock, SystemClock};
pub use events::{DisconnectReason, EventHub, InboundMessage, ListenerHandle};
pub use inbound::{InboundFilter, Verdict};
pub use mailbox::{
    EnvelopeCallback, MailboxTransport, MemoryMailbox, RecordCallback, Subscription,
    TransportError,
};
pub use session::{
    ExchangeFailure, ExchangeOutcome, Role, SessionError, SessionManager, SessionState,
};
