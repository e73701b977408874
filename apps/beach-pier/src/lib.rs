//! Beach Pier: pairs anonymous clients two at a time and relays the WebRTC
//! signaling they need to connect to each other directly.
//!
//! Clients connect over a websocket at `/ws`, send `find-match`, and are
//! paired first-come first-served. Both members of a pair receive
//! `match-found` with the room id and the initiator's connection id. From then
//! on `offer`, `answer` and `ice-candidate` frames addressed to the room are
//! forwarded to the other member only, payload untouched.

pub mod cli;
pub mod config;
pub mod matchmaker;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod switchboard;
pub mod telemetry;
mod websocket;
