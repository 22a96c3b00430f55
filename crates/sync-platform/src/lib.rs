//! Where the session token comes from.
//!
//! The sync runtime only needs [`CredentialSource::session_token`]. Tokens
//! can be fixed at startup ([`StaticCredential`]) or kept in a
//! [`CredentialStore`] under a service/account pair ([`StoredCredential`]).

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential not found")]
    NotFound,
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential store backend failure: {0}")]
    Backend(String),
}

/// Supplies the opaque token used to authenticate the push connection and API calls.
///
/// `Ok(None)` means there is no session; live sync then stays off.
pub trait CredentialSource: Send + Sync {
    fn session_token(&self) -> Result<Option<String>, CredentialError>;
}

/// Persistent token storage keyed by service and account.
pub trait CredentialStore: Send + Sync {
    fn set_token(&self, service: &str, account: &str, token: &str) -> Result<(), CredentialError>;

    fn get_token(&self, service: &str, account: &str) -> Result<String, CredentialError>;

    fn delete_token(&self, service: &str, account: &str) -> Result<(), CredentialError>;
}

/// Token known up front, for example from the environment.
#[derive(Clone, Default)]
pub struct StaticCredential {
    token: Option<String>,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn none() -> Self {
        Self { token: None }
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredential")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl CredentialSource for StaticCredential {
    fn session_token(&self) -> Result<Option<String>, CredentialError> {
        Ok(self
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_owned))
    }
}

impl<T: CredentialSource + ?Sized> CredentialSource for Arc<T> {
    fn session_token(&self) -> Result<Option<String>, CredentialError> {
        (**self).session_token()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn set_token(&self, service: &str, account: &str, token: &str) -> Result<(), CredentialError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialError::Backend("poisoned lock".to_owned()))?;
        data.insert((service.to_owned(), account.to_owned()), token.to_owned());
        Ok(())
    }

    fn get_token(&self, service: &str, account: &str) -> Result<String, CredentialError> {
        let data = self
            .data
            .read()
            .map_err(|_| CredentialError::Backend("poisoned lock".to_owned()))?;
        data.get(&(service.to_owned(), account.to_owned()))
            .cloned()
            .ok_or(CredentialError::NotFound)
    }

    fn delete_token(&self, service: &str, account: &str) -> Result<(), CredentialError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| CredentialError::Backend("poisoned lock".to_owned()))?;
        if data
            .remove(&(service.to_owned(), account.to_owned()))
            .is_none()
        {
            return Err(CredentialError::NotFound);
        }
        Ok(())
    }
}

#[cfg(feature = "os-keyring")]
#[derive(Default, Clone, Copy)]
pub struct OsKeyringCredentialStore;

#[cfg(feature = "os-keyring")]
impl CredentialStore for OsKeyringCredentialStore {
    fn set_token(&self, service: &str, account: &str, token: &str) -> Result<(), CredentialError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| CredentialError::Backend(err.to_string()))?;
        entry
            .set_password(token)
            .map_err(|err| CredentialError::Backend(err.to_string()))
    }

    fn get_token(&self, service: &str, account: &str) -> Result<String, CredentialError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| CredentialError::Backend(err.to_string()))?;
        entry.get_password().map_err(|err| match err {
            keyring::Error::NoEntry => CredentialError::NotFound,
            keyring::Error::PlatformFailure(inner) => CredentialError::Unavailable(inner.to_string()),
            other => CredentialError::Backend(other.to_string()),
        })
    }

    fn delete_token(&self, service: &str, account: &str) -> Result<(), CredentialError> {
        let entry = keyring::Entry::new(service, account)
            .map_err(|err| CredentialError::Backend(err.to_string()))?;
        entry.delete_credential().map_err(|err| match err {
            keyring::Error::NoEntry => CredentialError::NotFound,
            other => CredentialError::Backend(other.to_string()),
        })
    }
}

/// One account's token inside a [`CredentialStore`].
#[derive(Clone)]
pub struct StoredCredential<S: CredentialStore> {
    inner: S,
    service: String,
    account: String,
}

impl<S: CredentialStore> StoredCredential<S> {
    pub fn new(inner: S, service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
            account: account.into(),
        }
    }

    pub fn store(&self, token: &str) -> Result<(), CredentialError> {
        self.inner.set_token(&self.service, &self.account, token)
    }

    /// Forget the token. Clearing an absent token is not an error.
    pub fn clear(&self) -> Result<(), CredentialError> {
        match self.inner.delete_token(&self.service, &self.account) {
            Ok(()) | Err(CredentialError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl<S: CredentialStore> CredentialSource for StoredCredential<S> {
    fn session_token(&self) -> Result<Option<String>, CredentialError> {
        match self.inner.get_token(&self.service, &self.account) {
            Ok(token) if token.trim().is_empty() => Ok(None),
            Ok(token) => Ok(Some(token)),
            Err(CredentialError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
