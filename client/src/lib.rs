//! # Reference Peer Library
//!
//! A protocol exerciser for the group relay. The peer connects, sends its join
//! request, waits for the assigned identifier, greets the group and then
//! periodically announces a slowly drifting position. It answers what its
//! groupmates send it the way any correct participant would:
//!
//! - a Position from another peer is acknowledged back to its origin, and an
//!   origin whose name is unknown is asked for it with a NameRequest
//! - a NameRequest is answered with a NameReply carrying this peer's name
//! - NameReply and Disconnect update the neighbour roster
//!
//! ## Module Organization
//!
//! - `network`: connection, handshake and the send/answer loop
//! - `roster`: names and sequence numbers of known neighbours
//!
//! There is no reconnection: when the server closes the stream
//! the peer's run loop ends.

pub mod network;
pub mod roster;
