//! Minimal structured SIP message model
//!
//! dialog-ha does not parse or frame SIP. The SIP engine hands it already
//! structured requests and responses; this module defines the small slice of
//! the message model the HA layer and the load-balancer forwarder need:
//!
//! - [`Method`]: request methods
//! - [`SipUri`]: addresses used in Request-URI, Route, Record-Route and Contact
//! - [`NameAddr`]: From/To header values with their tags
//! - [`Via`]: one Via hop
//! - [`SipRequest`] / [`SipResponse`]: the messages themselves

pub mod method;
pub mod uri;
pub mod request;

pub use method::Method;
pub use uri::SipUri;
pub use request::{NameAddr, Via, SipRequest, SipResponse, reason_phrase};
