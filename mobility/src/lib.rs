//! C9: the mobility sub-protocol. Ground stations run [`groundstation`],
//! users run [`user`]; both share the wire [`messages`] and the
//! [`srv6`]/[`htb`] kernel helpers.

pub mod fsm;
pub mod groundstation;
pub mod htb;
pub mod messages;
pub mod srv6;
pub mod user;

pub use fsm::{UserEvent, UserState};
pub use messages::{HandoverCommand, HandoverRequest, RegistrationAccept, RegistrationRequest};

pub const MOBILITY_PORT: u16 = 5005;
pub const MAX_DATAGRAM_BYTES: usize = 4096;

/// Default eligibility predicate (§4.9): handover is worth it only if the
/// new link beats the current one by more than 5ms.
pub fn default_eligible(current_delay_ms: f64, new_delay_ms: f64) -> bool {
    new_delay_ms - current_delay_ms < -5.0
}

/// Always-eligible alternative predicate, named in §4.9 as the other
/// pluggable option.
pub fn always_eligible(_current_delay_ms: f64, _new_delay_ms: f64) -> bool {
    true
}
