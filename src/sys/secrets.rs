// src/sys/secrets.rs

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::error::{Result, VerifyError};
use crate::sys::traits::SecretStore;

pub const INSPEC_BUNDLE: &str = "inspec";
pub const SSH_USER_FIELD: &str = "ssh-user";
pub const EC2_BUNDLE: &str = "ec2";
pub const PRIVATE_KEY_FIELD: &str = "private_key";

/// ProviderCredential is an ephemeral, memory-safe wrapper for a single secret
/// value such as an RSA private key.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. When the struct goes out of scope, the memory is zeroized.
pub struct ProviderCredential {
    token: Secret<Vec<u8>>,
}

impl ProviderCredential {
    /// Takes ownership of `raw_token` so the plaintext is never copied to a
    /// second allocation.
    pub fn new(raw_token: Vec<u8>) -> Self {
        Self {
            token: Secret::new(raw_token),
        }
    }

    /// Exposes the secret to `action` only. The borrowed slice cannot outlive
    /// the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        action(self.token.expose_secret())
    }

    pub fn is_empty(&self) -> bool {
        self.use_secret(|bytes| bytes.iter().all(u8::is_ascii_whitespace))
    }
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderCredential([REDACTED])")
    }
}

impl From<String> for ProviderCredential {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

// ==============================================================================
// 1. Secret Bundles
// ==============================================================================

/// A named group of confidential fields for one project.
#[derive(Debug, Default)]
pub struct SecretBundle {
    fields: HashMap<String, ProviderCredential>,
}

impl SecretBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.fields
            .insert(field.into(), ProviderCredential::new(value.into()));
    }

    pub fn get(&self, field: &str) -> Option<&ProviderCredential> {
        self.fields.get(field)
    }

    pub fn take(&mut self, field: &str) -> Option<ProviderCredential> {
        self.fields.remove(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The two values the remote run needs, pulled from the `inspec` and `ec2`
/// bundles.
#[derive(Debug)]
pub struct InspecSecrets {
    pub ssh_user: String,
    pub private_key: ProviderCredential,
}

// ==============================================================================
// 2. Resolver
// ==============================================================================

pub struct SecretResolver<'a> {
    store: &'a dyn SecretStore,
}

impl<'a> SecretResolver<'a> {
    pub fn new(store: &'a dyn SecretStore) -> Self {
        Self { store }
    }

    /// Looks up `bundle` and checks every `required` field is present and
    /// non-blank. There is no default credential: absence is fatal.
    pub async fn resolve(&self, bundle: &str, required: &[&str]) -> Result<SecretBundle> {
        let found = self
            .store
            .lookup(bundle)
            .await?
            .ok_or_else(|| VerifyError::missing_bundle(bundle))?;

        for field in required {
            match found.get(field) {
                Some(value) if !value.is_empty() => {}
                _ => return Err(VerifyError::missing_field(bundle, *field)),
            }
        }

        tracing::debug!(bundle, fields = found.len(), "Resolved secret bundle");
        Ok(found)
    }

    /// Resolves both bundles before anything touches the filesystem.
    pub async fn resolve_inspec(&self) -> Result<InspecSecrets> {
        let mut inspec = self.resolve(INSPEC_BUNDLE, &[SSH_USER_FIELD]).await?;
        let mut ec2 = self.resolve(EC2_BUNDLE, &[PRIVATE_KEY_FIELD]).await?;

        let ssh_user = inspec
            .take(SSH_USER_FIELD)
            .ok_or_else(|| VerifyError::missing_field(INSPEC_BUNDLE, SSH_USER_FIELD))?
            .use_secret(|bytes| std::str::from_utf8(bytes).map(|s| s.trim().to_owned()))
            .map_err(|_| VerifyError::invalid_target("ssh-user is not valid UTF-8"))?;

        let private_key = ec2
            .take(PRIVATE_KEY_FIELD)
            .ok_or_else(|| VerifyError::missing_field(EC2_BUNDLE, PRIVATE_KEY_FIELD))?;

        Ok(InspecSecrets {
            ssh_user,
            private_key,
        })
    }
}

// ==============================================================================
// 3. Stores
// ==============================================================================

#[derive(Deserialize)]
struct SecretsDocument {
    #[serde(flatten)]
    bundles: HashMap<String, serde_json::Value>,
}

/// Reads project secrets from a JSON document shaped like a data bag item:
/// top-level keys are bundle names, each an object of string fields.
/// Non-object top-level entries (such as `id`) are ignored.
pub struct JsonFileSecretStore {
    path: PathBuf,
}

impl JsonFileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretStore for JsonFileSecretStore {
    async fn lookup(&self, bundle: &str) -> Result<Option<SecretBundle>> {
        let raw = Zeroizing::new(tokio::fs::read(&self.path).await.map_err(|e| {
            VerifyError::SecretStore(format!("cannot read {}: {}", self.path.display(), e))
        })?);

        let mut document: SecretsDocument = serde_json::from_slice(&raw).map_err(|e| {
            VerifyError::SecretStore(format!("cannot parse {}: {}", self.path.display(), e))
        })?;

        let fields = match document.bundles.remove(bundle) {
            None | Some(serde_json::Value::Null) => return Ok(None),
            Some(serde_json::Value::Object(fields)) => fields,
            Some(_) => {
                return Err(VerifyError::SecretStore(format!(
                    "bundle '{bundle}' in {} is not an object",
                    self.path.display()
                )));
            }
        };

        let mut found = SecretBundle::new();
        for (name, value) in fields {
            if let serde_json::Value::String(value) = value {
                found.insert(name, value);
            }
        }
        if found.is_empty() {
            tracing::warn!(bundle, "Secret bundle has no string fields");
        }
        Ok(Some(found))
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemorySecretStore {
    bundles: HashMap<String, HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, bundle: &str, field: &str, value: &str) -> Self {
        self.bundles
            .entry(bundle.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
        self
    }

    pub fn with_empty_bundle(mut self, bundle: &str) -> Self {
        self.bundles.entry(bundle.to_owned()).or_default();
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn lookup(&self, bundle: &str) -> Result<Option<SecretBundle>> {
        Ok(self.bundles.get(bundle).map(|fields| {
            let mut found = SecretBundle::new();
            for (name, value) in fields {
                found.insert(name.clone(), value.clone());
            }
            found
        }))
    }
}
