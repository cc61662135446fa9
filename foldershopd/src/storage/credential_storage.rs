use keyring::Entry;
use thiserror::Error;

const SERVICE_NAME: &str = "foldershop";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("password not found")]
    NotFound,
}

/// Transport password kept in the system keyring, one entry per
/// `user@host` account.
pub struct CredentialStorage {
    entry: Entry,
}

impl CredentialStorage {
    pub fn new(account: &str) -> Result<Self, CredentialError> {
        Ok(Self {
            entry: Entry::new(SERVICE_NAME, account)?,
        })
    }

    pub fn save_password(&self, password: &str) -> Result<(), CredentialError> {
        self.entry.set_password(password)?;
        Ok(())
    }

    pub fn get_password(&self) -> Result<String, CredentialError> {
        match self.entry.get_password() {
            Ok(password) => Ok(password),
            Err(keyring::Error::NoEntry) => Err(CredentialError::NotFound),
            Err(err) => Err(CredentialError::Keyring(err)),
        }
    }

    /// Succeeds when nothing was stored.
    pub fn delete_password(&self) -> Result<(), CredentialError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(CredentialError::Keyring(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_forgets_password() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let storage = CredentialStorage::new("deploy@files.example").unwrap();

        assert!(matches!(storage.get_password(), Err(CredentialError::NotFound)));
        storage.save_password("hunter2").unwrap();
        assert_eq!(storage.get_password().unwrap(), "hunter2");
        storage.delete_password().unwrap();
        assert!(matches!(storage.get_password(), Err(CredentialError::NotFound)));
        storage.delete_password().unwrap();
    }
}
