/// Provides the bearer credential of the signed-in user.
///
/// The cache never reads ambient storage; whoever owns the session injects
/// a provider. Absence of a credential is the sole signal that nobody is
/// signed in.
pub trait CredentialStore: Send + Sync {
    fn credential(&self) -> Option<String>;
}

/// In-memory credential holder, set on login and cleared on logout.
#[derive(Default)]
pub struct StoredCredential {
    token: parking_lot::RwLock<Option<String>>,
}

impl StoredCredential {
    pub fn set(&self, token: String) {
        *self.token.write() = Some(token);
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl CredentialStore for StoredCredential {
    fn credential(&self) -> Option<String> {
        self.token.read().clone()
    }
}
