//! Credential verification and channel authorization.
//!
//! Two concerns live here because they share the identity model and nothing
//! else pulls them apart:
//! - [`CredentialVerifier`] resolves a presented bearer credential to a
//!   [`pulse_common::UserIdentity`], either locally (signed HMAC token) or by
//!   asking the upstream application server (opaque token), with a short-TTL
//!   fingerprint-keyed cache.
//! - [`authorize`] decides whether an identity may subscribe to a channel,
//!   by classifying the channel name.

mod authorizer;
mod cache;
mod error;
mod verifier;

pub use {
    authorizer::{ChannelClass, authorize},
    cache::IdentityCache,
    error::AuthError,
    verifier::{CredentialKind, CredentialVerifier, VerifierConfig, fingerprint},
};
