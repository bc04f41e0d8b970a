// ── Keystone Gateway: Core Library ──────────────────────────────────────────
// Credential/quota store, token manager, proxy translator, and quota
// monitor — everything the `keystone-gateway` binary wires together. No
// logger is initialized here; that's the binary's job (`env_logger::init`),
// so this crate stays embeddable.

pub mod cache_embed;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod monitor;
pub mod providers;
pub mod proxy;
pub mod server;
pub mod store;
pub mod stream;
pub mod token_manager;
pub mod translate;
pub mod types;
