//! User accounts and privilege checks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cost used when hashing passwords. Raising it slows brute-force
/// attempts and every create-user apply equally.
pub const BCRYPT_COST: u32 = 10;

/// Access level a user holds on a database. Ordered: a higher privilege
/// implies every lower one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    #[default]
    None,
    Read,
    Write,
    All,
}

/// A user account with read/write permissions per database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub hash: String,
    #[serde(default)]
    pub privileges: HashMap<String, Privilege>,
    #[serde(default)]
    pub admin: bool,
}

impl User {
    /// Verifies a plaintext password against the stored bcrypt hash.
    pub fn authenticate(&self, password: &str) -> Result<()> {
        match bcrypt::verify(password, &self.hash) {
            Ok(true) => Ok(()),
            _ => Err(Error::InvalidCredentials),
        }
    }

    /// Returns true if the user holds at least `privilege` on `database`.
    /// Admins are authorized for everything.
    pub fn authorize(&self, privilege: Privilege, database: &str) -> bool {
        if self.admin {
            return true;
        }
        self.privileges
            .get(database)
            .map(|held| *held >= privilege)
            .unwrap_or(false)
    }
}

/// Hashes a plaintext password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    Ok(bcrypt::hash(password, BCRYPT_COST)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(admin: bool) -> User {
        // Cost 4 keeps the test suite fast.
        let hash = bcrypt::hash("secret", 4).unwrap();
        User {
            name: "ada".into(),
            hash,
            privileges: HashMap::new(),
            admin,
        }
    }

    #[test]
    fn authenticates_matching_password() {
        let u = user(false);
        assert!(u.authenticate("secret").is_ok());
        assert!(matches!(
            u.authenticate("wrong"),
            Err(Error::InvalidCredentials)
        ));
    }

    #[test]
    fn privilege_order_implies_lower_levels() {
        let mut u = user(false);
        u.privileges.insert("db".into(), Privilege::Write);

        assert!(u.authorize(Privilege::Read, "db"));
        assert!(u.authorize(Privilege::Write, "db"));
        assert!(!u.authorize(Privilege::All, "db"));
        assert!(!u.authorize(Privilege::Read, "other"));
    }

    #[test]
    fn admin_bypasses_grants() {
        let u = user(true);
        assert!(u.authorize(Privilege::All, "anything"));
    }
}
