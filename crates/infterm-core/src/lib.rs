//! infterm-core: shared library for the infinity terminal bridge.
//!
//! Provides the JSON wire messages, the error taxonomy, auth token issuance,
//! the Origin allow-list, and the command deny-list filter.

pub mod error;
pub mod filter;
pub mod messages;
pub mod origin;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{BridgeError, BridgeResult};
pub use filter::{CommandFilter, FilterVerdict};
pub use messages::{ClientMessage, ServerMessage};
pub use origin::OriginPolicy;
pub use token::{generate_hex_id, is_hex_id, TokenManager, TOKEN_TTL};
