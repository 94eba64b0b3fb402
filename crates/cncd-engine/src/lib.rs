//! # cncd-engine
//!
//! The multiplexer over all controllers: session authentication (bearer
//! token, IP rules, user list), the global `ident → controller` registry,
//! per-session dispatch, and the shell-task runner behind `system` event
//! hooks.

pub mod auth;
pub mod engine;
pub mod session;

pub use auth::{authenticate, check_ip, check_user, verify_token, AuthClaims};
pub use engine::{Engine, PortRecord};
pub use session::Session;
