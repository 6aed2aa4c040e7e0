//! Boundary to the authentication collaborator.

use std::sync::RwLock;

use courier_shared::UserId;

/// Synchronous source of the signed-in user's id.
pub trait CredentialProvider: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;
}

/// Credentials held in memory, set by whatever performed the sign-in.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    user: RwLock<Option<UserId>>,
}

impl StaticCredentials {
    pub fn new(user: Option<UserId>) -> Self {
        Self {
            user: RwLock::new(user),
        }
    }

    pub fn signed_in(user: impl Into<UserId>) -> Self {
        Self::new(Some(user.into()))
    }

    pub fn set(&self, user: Option<UserId>) {
        match self.user.write() {
            Ok(mut guard) => *guard = user,
            Err(poisoned) => *poisoned.into_inner() = user,
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn current_user_id(&self) -> Option<UserId> {
        match self.user.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
