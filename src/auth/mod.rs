//! Handshake credential validation

pub mod provider;
pub mod token;

pub use provider::{AnonymousAuthProvider, AuthGrant, AuthProvider, JwtAuthProvider};
pub use token::{Claims, TokenManager};
