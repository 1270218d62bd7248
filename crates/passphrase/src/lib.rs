//! Repository passphrases: file storage under `~/.borgboi/passphrases` and the
//! precedence chain that decides which secret borg is given.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use borgboi_core::{Config, Repository, StorageError};
use borgboi_storage::{MigrationResult, RepositoryStorage};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PASSPHRASE_ENV: &str = "BORG_PASSPHRASE";
pub const NEW_PASSPHRASE_ENV: &str = "BORG_NEW_PASSPHRASE";

pub type Result<T> = std::result::Result<T, PassphraseError>;

#[derive(Debug, Error)]
pub enum PassphraseError {
    #[error("passphrase file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("passphrase verification failed for repository '{0}', migration aborted")]
    VerificationFailed(String),
    #[error("invalid repository name for a passphrase file: '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PassphraseError + '_ {
    move |source| PassphraseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A fresh 256-bit secret, hex encoded.
pub fn generate_passphrase() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One `<name>.key` file per repository in an owner-only directory.
#[derive(Debug, Clone)]
pub struct PassphraseStore {
    dir: PathBuf,
}

impl PassphraseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.passphrases_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, repo_name: &str) -> Result<PathBuf> {
        if repo_name.is_empty() || repo_name.contains(['/', '\\']) || repo_name == ".." {
            return Err(PassphraseError::InvalidName(repo_name.to_owned()));
        }
        Ok(self.dir.join(format!("{repo_name}.key")))
    }

    /// Writes the secret as-is. The directory ends up 0700 and the file 0600.
    pub fn save(&self, repo_name: &str, secret: &str) -> Result<PathBuf> {
        let path = self.file_path(repo_name)?;
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        restrict(&self.dir, 0o700)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(io_err(&path))?;
        // open() leaves the mode of an existing file alone.
        restrict(&path, 0o600)?;
        file.write_all(secret.as_bytes()).map_err(io_err(&path))?;
        file.sync_all().map_err(io_err(&path))?;

        debug!(repo = %repo_name, path = %path.display(), "saved passphrase file");
        Ok(path)
    }

    /// Reads the secret, trimmed. Loose permissions are reported but do not block the read.
    pub fn load(&self, repo_name: &str) -> Result<Option<String>> {
        let path = self.file_path(repo_name)?;
        if !path.exists() {
            return Ok(None);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).map_err(io_err(&path))?.permissions().mode() & 0o777;
            if mode != 0o600 {
                warn!(
                    path = %path.display(),
                    mode = %format!("{mode:o}"),
                    "passphrase file has insecure permissions, expected 600 (run: chmod 600 {})",
                    path.display()
                );
            }
        }

        let raw = fs::read_to_string(&path).map_err(io_err(&path))?;
        Ok(Some(raw.trim().to_owned()))
    }

    pub fn exists(&self, repo_name: &str) -> bool {
        self.file_path(repo_name).is_ok_and(|p| p.exists())
    }

    /// Returns whether a file was removed.
    pub fn remove(&self, repo_name: &str) -> Result<bool> {
        let path = self.file_path(repo_name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err(path))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Which borg secret is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassphraseKind {
    Current,
    /// The replacement secret during a key change.
    New,
}

impl PassphraseKind {
    pub fn env_var(&self) -> &'static str {
        match self {
            Self::Current => PASSPHRASE_ENV,
            Self::New => NEW_PASSPHRASE_ENV,
        }
    }
}

/// Where a resolved secret came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassphraseSource {
    Override,
    File(PathBuf),
    Inline,
    Environment(&'static str),
    Config,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Evaluates the passphrase precedence chain. Holds no state between calls.
#[derive(Clone)]
pub struct Resolver {
    store: PassphraseStore,
    config_passphrase: Option<String>,
    config_new_passphrase: Option<String>,
    env: EnvLookup,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("store", &self.store)
            .field("config_passphrase", &self.config_passphrase.as_ref().map(|_| "<redacted>"))
            .field("config_new_passphrase", &self.config_new_passphrase.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl Resolver {
    pub fn new(
        store: PassphraseStore,
        config_passphrase: Option<String>,
        config_new_passphrase: Option<String>,
    ) -> Self {
        Self {
            store,
            config_passphrase,
            config_new_passphrase,
            env: Arc::new(|key: &str| std::env::var(key).ok()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            PassphraseStore::from_config(config),
            config.borg.borg_passphrase.clone(),
            config.borg.borg_new_passphrase.clone(),
        )
    }

    /// Replaces the process environment as the source of `BORG_PASSPHRASE`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Arc::new(lookup);
        self
    }

    pub fn store(&self) -> &PassphraseStore {
        &self.store
    }

    /// First hit of: override, passphrase file, inline value, environment (if allowed),
    /// config default.
    pub fn resolve(
        &self,
        repo_name: &str,
        override_secret: Option<&str>,
        inline: Option<&str>,
        allow_env: bool,
    ) -> Result<Option<String>> {
        self.resolve_kind(PassphraseKind::Current, repo_name, override_secret, inline, allow_env)
            .map(|found| found.map(|(_, secret)| secret))
    }

    pub fn resolve_for(
        &self,
        repo: &Repository,
        override_secret: Option<&str>,
        allow_env: bool,
    ) -> Result<Option<String>> {
        self.resolve(&repo.name, override_secret, repo.passphrase.as_deref(), allow_env)
    }

    pub fn resolve_kind(
        &self,
        kind: PassphraseKind,
        repo_name: &str,
        override_secret: Option<&str>,
        inline: Option<&str>,
        allow_env: bool,
    ) -> Result<Option<(PassphraseSource, String)>> {
        let found = self.lookup(kind, repo_name, override_secret, inline, allow_env)?;
        match &found {
            Some((source, _)) => debug!(repo = %repo_name, ?kind, ?source, "resolved passphrase"),
            None => debug!(repo = %repo_name, ?kind, "no passphrase available"),
        }
        Ok(found)
    }

    fn lookup(
        &self,
        kind: PassphraseKind,
        repo_name: &str,
        override_secret: Option<&str>,
        inline: Option<&str>,
        allow_env: bool,
    ) -> Result<Option<(PassphraseSource, String)>> {
        if let Some(secret) = override_secret {
            return Ok(Some((PassphraseSource::Override, secret.to_owned())));
        }
        if let Some(secret) = self.store.load(repo_name)? {
            return Ok(Some((PassphraseSource::File(self.store.file_path(repo_name)?), secret)));
        }
        if let Some(secret) = inline {
            return Ok(Some((PassphraseSource::Inline, secret.to_owned())));
        }
        if allow_env {
            if let Some(secret) = (self.env)(kind.env_var()) {
                return Ok(Some((PassphraseSource::Environment(kind.env_var()), secret)));
            }
        }
        let default = match kind {
            PassphraseKind::Current => &self.config_passphrase,
            PassphraseKind::New => &self.config_new_passphrase,
        };
        Ok(default.clone().map(|secret| (PassphraseSource::Config, secret)))
    }
}

/// Moves an inline secret into its passphrase file, verifying the file reads back identically.
///
/// On a mismatch the new file is deleted. The caller's inline value is never touched.
pub fn migrate_inline(store: &PassphraseStore, repo_name: &str, secret: &str) -> Result<PathBuf> {
    let path = store.save(repo_name, secret)?;
    match store.load(repo_name)? {
        Some(read_back) if read_back == secret => Ok(path),
        _ => {
            if let Err(e) = store.remove(repo_name) {
                warn!(repo = %repo_name, error = %e, "failed to clean up unverified passphrase file");
            }
            Err(PassphraseError::VerificationFailed(repo_name.to_owned()))
        }
    }
}

/// Writes `secret` to the repository's passphrase file and records that on the entity.
pub fn migrate_repository(
    storage: &dyn RepositoryStorage,
    store: &PassphraseStore,
    repo: &mut Repository,
    secret: &str,
) -> Result<PathBuf> {
    let path = migrate_inline(store, &repo.name, secret)?;
    repo.passphrase_file_path = Some(path.display().to_string());
    repo.passphrase_migrated = true;
    storage.save(repo)?;
    info!(repo = %repo.name, path = %path.display(), "migrated passphrase to file");
    Ok(path)
}

/// Migrates the repository's inline secret if it has one and has not been migrated yet.
pub fn auto_migrate_repository(
    storage: &dyn RepositoryStorage,
    store: &PassphraseStore,
    repo: &mut Repository,
) -> Result<bool> {
    if repo.passphrase_migrated {
        return Ok(false);
    }
    let Some(secret) = repo.passphrase.clone() else {
        return Ok(false);
    };
    migrate_repository(storage, store, repo, &secret)?;
    Ok(true)
}

/// Runs `auto_migrate_repository` over every stored repository.
pub fn migrate_all(storage: &dyn RepositoryStorage, store: &PassphraseStore) -> Result<MigrationResult> {
    let mut result = MigrationResult::default();
    for mut repo in storage.list_all()? {
        match auto_migrate_repository(storage, store, &mut repo) {
            Ok(true) => result.migrated += 1,
            Ok(false) => result.skipped += 1,
            Err(e) => {
                warn!(repo = %repo.name, error = %e, "passphrase migration failed");
                result.errors.push((repo.name.clone(), e.to_string()));
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn resolver(store: PassphraseStore, env: &[(&str, &str)]) -> Resolver {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Resolver::new(store, Some("from-config".into()), Some("new-from-config".into()))
            .with_env(move |key| env.get(key).cloned())
    }

    #[test]
    fn precedence_chain_peels_off_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = PassphraseStore::new(tmp.path().join("passphrases"));
        store.save("docs", "from-file").unwrap();
        let r = resolver(store.clone(), &[(PASSPHRASE_ENV, "from-env")]);

        let get = |ov: Option<&str>, inline: Option<&str>, env: bool| {
            r.resolve("docs", ov, inline, env).unwrap()
        };
        assert_eq!(get(Some("override"), Some("inline"), true).as_deref(), Some("override"));
        assert_eq!(get(None, Some("inline"), true).as_deref(), Some("from-file"));

        store.remove("docs").unwrap();
        assert_eq!(get(None, Some("inline"), true).as_deref(), Some("inline"));
        assert_eq!(get(None, None, true).as_deref(), Some("from-env"));
        assert_eq!(get(None, None, false).as_deref(), Some("from-config"));

        let bare = Resolver::new(store, None, None).with_env(|_| None);
        assert_eq!(bare.resolve("docs", None, None, true).unwrap(), None);
    }

    #[test]
    fn new_passphrase_uses_its_own_env_and_default() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let r = resolver(PassphraseStore::new(tmp.path()), &[(NEW_PASSPHRASE_ENV, "new-env")]);

        let (source, secret) = r
            .resolve_kind(PassphraseKind::New, "docs", None, None, true)
            .unwrap()
            .unwrap();
        assert_eq!(source, PassphraseSource::Environment(NEW_PASSPHRASE_ENV));
        assert_eq!(secret, "new-env");

        let (source, secret) = r
            .resolve_kind(PassphraseKind::New, "docs", None, None, false)
            .unwrap()
            .unwrap();
        assert_eq!(source, PassphraseSource::Config);
        assert_eq!(secret, "new-from-config");
        assert_eq!(r.resolve("docs", None, None, true).unwrap().as_deref(), Some("from-config"));
    }

    #[cfg(unix)]
    #[test]
    fn files_are_owner_only_and_loose_files_still_load() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let store = PassphraseStore::new(tmp.path().join("passphrases"));
        let path = store.save("docs", "s3cret").unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&path), 0o600);
        assert_eq!(mode(store.dir()), 0o700);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(store.load("docs").unwrap().as_deref(), Some("s3cret"));

        store.save("docs", "rotated").unwrap();
        assert_eq!(mode(&path), 0o600);
    }

    #[test]
    fn load_trims_and_missing_is_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = PassphraseStore::new(tmp.path());
        assert_eq!(store.load("docs").unwrap(), None);
        fs::write(tmp.path().join("docs.key"), "  padded\n").unwrap();
        assert_eq!(store.load("docs").unwrap().as_deref(), Some("padded"));
    }

    #[test]
    fn verification_failure_removes_the_new_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = PassphraseStore::new(tmp.path());
        let err = migrate_inline(&store, "docs", "trailing-space ").unwrap_err();
        assert!(matches!(err, PassphraseError::VerificationFailed(_)));
        assert!(!store.exists("docs"));
    }

    #[test]
    fn rejects_names_that_escape_the_directory() {
        let store = PassphraseStore::new("/tmp/passphrases");
        assert!(matches!(store.file_path("../x"), Err(PassphraseError::InvalidName(_))));
        assert!(store.file_path("").is_err());
    }

    #[test]
    fn generated_passphrases_are_256_bit_hex() {
        let a = generate_passphrase();
        let b = generate_passphrase();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
