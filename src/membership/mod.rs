//! Membership & Discovery Module
//!
//! The registry collaborator of the engine: it answers "who is alive" and
//! reports joins, orderly departures and deaths. The engine never decides
//! membership itself.
//!
//! ## Implementations
//! - **`StaticRegistry`**: an in-process table shared by the workers of a simulated
//!   cluster. Deaths are injected with `MembershipTable::kill`.
//! - **`MembershipService`**: a Gossip-based protocol (inspired by SWIM) over UDP.
//!   Uses a "Suspect" -> "Dead" transition model with timeouts, and incarnation
//!   numbers to refute false suspicion.

pub mod registry;
pub mod service;
pub mod types;
