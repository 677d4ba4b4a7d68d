mod client;
mod connection;
mod identity;
mod instance;
mod token;

pub use client::{Capability, Client};
pub use connection::Connection;
pub use identity::{AuthenticationRecord, Identity, IdentityView};
pub use instance::{RuntimeInfo, ServerInstance};
pub use token::TokenRecord;

/// Core collection names. Component-scoped collections are prefixed with the
/// component name instead and never appear here.
pub mod collections {
    pub const IDENTITIES: &str = "identities";
    pub const AUTHENTICATIONS: &str = "authentications";
    pub const CLIENTS: &str = "clients";
    pub const CLIENT_TOKENS: &str = "clientTokens";
    pub const CONNECTIONS: &str = "connections";
    pub const INSTANCES: &str = "instances";
}
