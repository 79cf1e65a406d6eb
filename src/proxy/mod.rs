//! Reverse proxy core: target registry, forwarding pipeline, transports
//! and the serving loop.

mod handler;
mod rewrite;
mod server;
mod stealth;
mod target;
mod transport;

pub use rewrite::join_url;
pub use server::{Proxy, ProxyOptions, TlsIdentity};
pub use stealth::{Socks5Config, StealthConfig, StealthTransport};
pub use target::{Hooks, RegisteredTarget, Target, TargetRegistry};
pub use transport::{Dialer, HttpTransport, Socks5Auth, Transport};
