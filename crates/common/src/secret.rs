//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use these types
//! for every value that grants access to something: webhook shared keys,
//! registry passwords, and the encoded registry login blob.
//!
//! `SecretString` implements `Debug` with redaction, so structs that derive
//! `Debug` and hold secrets stay safe to log with `{:?}` or tracing fields.
//! Secrets are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct WebhookKey {
//!     name: String,
//!     value: SecretString,
//! }
//!
//! let key = WebhookKey {
//!     name: "ecr-webhook".to_string(),
//!     value: SecretString::from("k3y"),
//! };
//!
//! // Debug output redacts the value
//! assert!(!format!("{key:?}").contains("k3y"));
//!
//! // Access requires an explicit call
//! assert_eq!(key.value.expose_secret(), "k3y");
//! ```

use ring::digest;

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretString};

/// Compare a presented token against a stored secret.
///
/// Both sides are hashed with SHA-256 before comparison so the time taken
/// does not depend on how many leading bytes of the raw values agree.
/// An empty presented token never matches.
#[must_use]
pub fn tokens_match(presented: &str, stored: &SecretString) -> bool {
    if presented.is_empty() {
        return false;
    }
    let lhs = digest::digest(&digest::SHA256, presented.as_bytes());
    let rhs = digest::digest(&digest::SHA256, stored.expose_secret().as_bytes());
    lhs.as_ref() == rhs.as_ref()
}
