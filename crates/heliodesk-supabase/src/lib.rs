//! Supabase GoTrue implementation of [`heliodesk_auth::AuthBackend`].
//!
//! Sessions and PKCE verifiers are persisted through
//! [`heliodesk_auth::AuthStorage`], so the remember-me choice decides whether
//! they survive a restart.

pub mod client;
pub mod opener;
pub mod pkce;
pub mod token;

pub use client::SupabaseBackend;
pub use opener::{SystemBrowser, UrlOpener};
