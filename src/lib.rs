//! switchyard gateway library
//!
//! Local API gateway exposing a stable REST/WebSocket surface and routing
//! it onto pluggable capability providers: plugin registry and discovery,
//! request routing with correlation, a local authorization server, event
//! brokering with keep-alive, and the origin/HMAC trust layer.

pub mod cli;
pub mod config;
pub mod events;
pub mod logging;
pub mod oauth;
pub mod plugins;
pub mod protocol;
pub mod router;
pub mod server;
pub mod trust;
