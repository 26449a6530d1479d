// src/sys/credentials.rs

use std::path::Path;

use crate::error::{Result, VerifyError};
use crate::sys::identity::validate_ssh_user;
use crate::sys::secrets::{EC2_BUNDLE, InspecSecrets, PRIVATE_KEY_FIELD};
use crate::sys::traits::{FileSystem, KeyMaterial};

/// rwx------
pub const SSH_DIR_MODE: u32 = 0o700;
/// rw-------
pub const KEY_FILE_MODE: u32 = 0o600;
pub const SSH_DIR_NAME: &str = ".ssh";

/// Writes the project's private key to `<scratch>/.ssh/<ssh-user>.pem`.
///
/// The caller owns cleanup of the scratch directory; the key stays on disk
/// for the duration of the remote run and beyond.
pub struct CredentialProvisioner<'a> {
    fs: &'a dyn FileSystem,
}

impl<'a> CredentialProvisioner<'a> {
    pub fn new(fs: &'a dyn FileSystem) -> Self {
        Self { fs }
    }

    pub fn key_path(scratch_dir: &Path, ssh_user: &str) -> std::path::PathBuf {
        scratch_dir
            .join(SSH_DIR_NAME)
            .join(format!("{ssh_user}.pem"))
    }

    pub fn materialize(&self, secrets: &InspecSecrets, scratch_dir: &Path) -> Result<KeyMaterial> {
        // 1. 🛡️ Everything that can fail without touching disk fails first.
        validate_ssh_user(&secrets.ssh_user)?;
        if secrets.private_key.is_empty() {
            return Err(VerifyError::missing_field(EC2_BUNDLE, PRIVATE_KEY_FIELD));
        }

        // 2. Private directory (idempotent)
        let ssh_dir = scratch_dir.join(SSH_DIR_NAME);
        self.fs.ensure_directory(&ssh_dir, SSH_DIR_MODE)?;

        // 3. Key file, restrictive from inception
        let path = Self::key_path(scratch_dir, &secrets.ssh_user);
        secrets
            .private_key
            .use_secret(|pem| self.fs.write_file(&path, pem, KEY_FILE_MODE))?;

        tracing::info!(path = %path.display(), "Provisioned SSH private key");
        Ok(KeyMaterial {
            path,
            mode: KEY_FILE_MODE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::fs::{LocalFileSystem, MemoryEntry, MemoryFileSystem};
    use crate::sys::secrets::ProviderCredential;
    use std::os::unix::fs::MetadataExt;

    fn secrets(user: &str, key: &str) -> InspecSecrets {
        InspecSecrets {
            ssh_user: user.to_owned(),
            private_key: ProviderCredential::from(key.to_owned()),
        }
    }

    #[test]
    fn writes_key_under_scratch_ssh_dir() {
        let mem = MemoryFileSystem::new();
        let key = CredentialProvisioner::new(&mem)
            .materialize(&secrets("deploy", "PEM"), Path::new("/cache"))
            .unwrap();

        assert_eq!(key.path, Path::new("/cache/.ssh/deploy.pem"));
        assert_eq!(key.mode, 0o600);
        assert_eq!(
            mem.entry(Path::new("/cache/.ssh")),
            Some(MemoryEntry::Directory { mode: 0o700 })
        );
        assert_eq!(
            mem.entry(&key.path),
            Some(MemoryEntry::File {
                mode: 0o600,
                contents: b"PEM".to_vec()
            })
        );
    }

    #[test]
    fn blank_key_performs_no_writes() {
        let mem = MemoryFileSystem::new();
        let err = CredentialProvisioner::new(&mem)
            .materialize(&secrets("deploy", ""), Path::new("/cache"))
            .unwrap_err();
        assert!(matches!(err, VerifyError::MissingSecret { .. }));
        assert!(mem.paths().is_empty());
    }

    #[test]
    fn traversal_in_user_performs_no_writes() {
        let mem = MemoryFileSystem::new();
        let err = CredentialProvisioner::new(&mem)
            .materialize(&secrets("../../etc/cron.d/x", "PEM"), Path::new("/cache"))
            .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidTarget(_)));
        assert!(mem.paths().is_empty());
    }

    #[test]
    fn unwritable_scratch_is_filesystem_error() {
        let mem = MemoryFileSystem::new();
        mem.deny_under("/cache");
        let err = CredentialProvisioner::new(&mem)
            .materialize(&secrets("deploy", "PEM"), Path::new("/cache"))
            .unwrap_err();
        assert!(matches!(
            err,
            VerifyError::Filesystem { ref path, .. } if path == Path::new("/cache/.ssh")
        ));
    }

    #[test]
    fn real_key_file_is_owner_only_and_rewritable() {
        let scratch = tempfile::tempdir().unwrap();
        let provisioner = CredentialProvisioner::new(&LocalFileSystem);

        let first = provisioner
            .materialize(&secrets("deploy", "FIRST"), scratch.path())
            .unwrap();
        let second = provisioner
            .materialize(&secrets("deploy", "SECOND"), scratch.path())
            .unwrap();
        assert_eq!(first.path, second.path);

        let meta = std::fs::metadata(&second.path).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o600);
        assert_eq!(std::fs::read(&second.path).unwrap(), b"SECOND");

        let dir_meta = std::fs::metadata(scratch.path().join(".ssh")).unwrap();
        assert_eq!(dir_meta.mode() & 0o077, 0);
    }
}
