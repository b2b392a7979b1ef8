//! Relay client components
//!
//! This module provides the origin side of a relay tunnel: the [`RelayAgent`]
//! keeps a tunnel open to the broker and serves relayed requests from a local API.

pub mod agent;

pub use agent::*;
