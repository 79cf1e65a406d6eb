//! Shroud - Stealth Reverse Proxy
//!
//! A reverse proxy that exposes upstream websites under local path prefixes,
//! rewriting HTML so same-origin links keep resolving through the proxy.
//!
//! ## Features
//!
//! - Multiple upstream targets mounted under distinct path prefixes
//! - HTML link rewriting for `a`, `link`, `img` and `script` elements
//! - Anti-fingerprinting transport: randomized user agents, request pacing,
//!   lazy SOCKS5 egress, transparent content-encoding negotiation
//! - Optional HTTPS serving with generated self-signed certificates
//! - Per-target statistics with a JSON API

pub mod agents;
pub mod codec;
pub mod config;
pub mod error;
pub mod proxy;
pub mod stats;
pub mod tls;

pub use config::Config;
pub use error::{Result, ShroudError};
pub use proxy::{Proxy, ProxyOptions, StealthConfig, StealthTransport, Target};
