//! Room registry for live issue collaboration
//!
//! Membership lives only in process memory and is rebuilt as clients
//! rejoin after a restart.

pub mod participant;
pub mod registry;

pub use participant::{Identity, Participant, Role};
pub use registry::{ConnectionId, Outbox, RoomRegistry, Scope};
