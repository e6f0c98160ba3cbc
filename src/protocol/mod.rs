//! Wire protocol between the UI client and the bridge process
//!
//! Two directions, both line-framed JSON over the bridge's stdio:
//! - commands ([`command::Request`]) flow UI → bridge, each answered by
//!   exactly one [`command::Response`] with the same id;
//! - events ([`event::BridgeEvent`]) flow bridge → UI unsolicited.

pub mod command;
pub mod event;

pub use command::{Request, Response};
pub use event::{BridgeEvent, CloseReason};
