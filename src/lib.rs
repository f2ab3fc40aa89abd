//! Assist bridge — transport and dispatch core for a split-process assistant.
//!
//! UI surfaces never hold credentials. They call the server through the
//! privileged [`background`] process over a [`bridge`], falling back to direct
//! HTTP only when no bridge is reachable, and feed outbound chat through a
//! per-conversation [`queue`].

pub mod abort;
pub mod auth;
pub mod background;
pub mod bridge;
pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod http;
pub mod protocol;
pub mod queue;
