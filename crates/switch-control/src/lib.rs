//! # Switch Control Client
//!
//! Client side of the telephony switch's line-oriented event socket.
//!
//! ## Roles
//!
//! - [`InboundClient`]: we dial the switch, authenticate and issue `api` and
//!   `bgapi` commands. Used by the dialer for capacity queries and originates.
//! - [`OutboundListener`]: the switch dials us once per answered call (via the
//!   `socket` dialplan application) and hands over control of that leg as an
//!   [`OutboundSession`].
//!
//! Call logic depends only on the [`SwitchApi`] and [`CallLeg`] traits.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rdial_switch_control::{InboundClient, InboundConfig, SwitchApi};
//!
//! # tokio_test::block_on(async {
//! let client = InboundClient::connect(&InboundConfig::default()).await?;
//! let calls = client.api("show calls count").await?;
//! println!("{}", calls);
//! # Ok::<(), rdial_switch_control::SwitchError>(())
//! # });
//! ```

pub mod api;
pub mod commands;
mod connection;
pub mod error;
pub mod event;
pub mod inbound;
pub mod message;
pub mod outbound;

pub use api::{CallLeg, SwitchApi, SwitchConnector};
pub use commands::{correlation_var, parse_calls_count, Originate, CORRELATION_PREFIX};
pub use error::{Result, SwitchError};
pub use event::SwitchEvent;
pub use inbound::{InboundClient, InboundConfig, InboundConnector};
pub use message::EslMessage;
pub use outbound::{OutboundConfig, OutboundListener, OutboundSession, PendingLeg};
