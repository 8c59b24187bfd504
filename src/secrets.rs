#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

pub const VAULT_SERVICE_NAME: &str = "place-curator";
pub const MODEL_API_KEY_ACCOUNT: &str = "model-api-key";
pub const CATALOG_TOKEN_ACCOUNT: &str = "catalog-token";

/// Where a credential in the effective configuration came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    Environment,
    Keychain,
    Missing,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Environment => "environment",
            CredentialSource::Keychain => "keychain",
            CredentialSource::Missing => "missing",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CredentialStatus {
    pub model_api_key: CredentialSource,
    pub catalog_token: CredentialSource,
}

#[derive(Clone)]
pub struct CredentialVault {
    service_name: String,
    backend: VaultBackend,
}

#[derive(Clone)]
enum VaultBackend {
    Keyring,
    #[cfg(test)]
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl CredentialVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: VaultBackend::Keyring,
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: VaultBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn get(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.backend {
            VaultBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Ok(Some(SecretString::from(value))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            #[cfg(test)]
            VaultBackend::Memory(store) => Ok(store.lock().get(account).cloned()),
        }
    }

    pub fn set(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        if secret.expose_secret().trim().is_empty() {
            return Err(AppError::Config(format!("refusing to store an empty {account}")));
        }
        match &self.backend {
            VaultBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
            }
            #[cfg(test)]
            VaultBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
            }
        }
        info!(
            target: "credential_vault",
            service = %self.service_name,
            account,
            "stored credential"
        );
        Ok(())
    }

    /// Removing an absent credential is not an error.
    pub fn clear(&self, account: &str) -> AppResult<()> {
        match &self.backend {
            VaultBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(err) => return Err(AppError::from(err)),
                }
            }
            #[cfg(test)]
            VaultBackend::Memory(store) => {
                store.lock().remove(account);
            }
        }
        info!(
            target: "credential_vault",
            service = %self.service_name,
            account,
            "cleared credential"
        );
        Ok(())
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        self.get(account).map(|secret| secret.is_some())
    }

    /// Fills credentials the environment left unset. Environment values always
    /// win; the vault is never read for a credential that is already present.
    pub fn resolve(&self, config: &mut AppConfig) -> AppResult<CredentialStatus> {
        let model_api_key = self.fill(&mut config.model_api_key, MODEL_API_KEY_ACCOUNT)?;
        let catalog_token = self.fill(&mut config.catalog_api_token, CATALOG_TOKEN_ACCOUNT)?;
        Ok(CredentialStatus {
            model_api_key,
            catalog_token,
        })
    }

    fn fill(&self, slot: &mut Option<SecretString>, account: &str) -> AppResult<CredentialSource> {
        if slot.is_some() {
            return Ok(CredentialSource::Environment);
        }
        match self.get(account)? {
            Some(secret) => {
                debug!(
                    target: "credential_vault",
                    service = %self.service_name,
                    account,
                    "loaded credential from keychain"
                );
                *slot = Some(secret);
                Ok(CredentialSource::Keychain)
            }
            None => Ok(CredentialSource::Missing),
        }
    }
}
