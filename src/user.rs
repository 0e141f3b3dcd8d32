#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};

/// A simulated lobby user. Everything is derived from the numeric id, so a
/// rerun with the same population produces the same credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedUser {
    pub id: u32,
}

impl SimulatedUser {
    pub fn new(id: u32) -> Self {
        Self { id }
    }

    pub fn username(&self) -> String {
        format!("User {}", self.id)
    }

    pub fn password(&self) -> String {
        format!("password{}", self.id)
    }

    pub fn email(&self) -> String {
        format!("user{}@example.com", self.id)
    }

    /// Hex-encoded SHA-256 of the plaintext password — the credential the
    /// lobby server expects at login.
    pub fn password_hash(&self) -> String {
        hex::encode(Sha256::digest(self.password().as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_derived_from_id() {
        let user = SimulatedUser::new(42);
        assert_eq!(user.username(), "User 42");
        assert_eq!(user.password(), "password42");
        assert_eq!(user.email(), "user42@example.com");
    }

    #[test]
    fn password_hash_is_sha256_of_password() {
        let user = SimulatedUser::new(0);
        assert_eq!(
            user.password_hash(),
            hex::encode(Sha256::digest(b"password0"))
        );
        // deterministic across calls
        assert_eq!(user.password_hash(), user.password_hash());
    }

    #[test]
    fn different_ids_hash_differently() {
        assert_ne!(
            SimulatedUser::new(1).password_hash(),
            SimulatedUser::new(2).password_hash()
        );
    }
}
