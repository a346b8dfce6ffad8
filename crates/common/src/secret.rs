//! Secret types for protecting sensitive values from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Use these types
//! for all sensitive values such as service tokens and API keys.
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so
//! any struct that derives `Debug` while holding a secret automatically
//! gets safe logging behavior; reaching the actual value requires an
//! explicit `expose_secret()` call. Secrets are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct DirectoryCredentials {
//!     service_url: String,
//!     service_token: SecretString,
//! }
//!
//! let creds = DirectoryCredentials {
//!     service_url: "https://directory.internal".to_string(),
//!     service_token: SecretString::from("svc-token-123"),
//! };
//!
//! // Safe: the token is redacted
//! println!("{:?}", creds);
//!
//! // Explicit access only
//! let token: &str = creds.service_token.expose_secret();
//! # let _ = token;
//! ```

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("svc-token-123");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("svc-token-123"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("hunter2");
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct Credentials {
            client_id: String,
            client_secret: SecretString,
        }

        let creds = Credentials {
            client_id: "directory".to_string(),
            client_secret: SecretString::from("super-secret"),
        };

        let debug_str = format!("{creds:?}");

        assert!(debug_str.contains("directory"));
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("super-secret"));
    }

    #[test]
    fn test_deserialize_from_json() {
        use serde::Deserialize;

        #[derive(Debug, Deserialize)]
        struct ServiceCredentials {
            client_id: String,
            client_secret: SecretString,
        }

        let json = r#"{"client_id": "svc-123", "client_secret": "secret-key"}"#;
        let creds: ServiceCredentials =
            serde_json::from_str(json).expect("credentials should deserialize");

        assert_eq!(creds.client_id, "svc-123");
        assert_eq!(creds.client_secret.expose_secret(), "secret-key");
    }
}
