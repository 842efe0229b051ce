//! # yeelo_auth_core
//!
//! Core domain logic for the Yeelo auth service: signing keys, access
//! tokens, rotating refresh tokens, permission resolution and storage.

pub mod auth;
pub mod migrate;
pub mod models;
pub mod store;
