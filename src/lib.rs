//! chat-relay: a forwarding proxy between an untrusted client population and
//! a paid upstream chat-completion API, enforcing per-user admission control
//! so a single client cannot exhaust the shared upstream quota.

pub mod config_parser;
pub mod endpoints;
pub mod error;
pub mod gateway_util;
pub mod identity;
pub mod observability;
pub mod providers;
pub mod rate_limiting;
pub mod reaper;
