//! Saved portal accounts, persisted as `{"<account>": ["<password>", <autoLogin>]}`.
//!
//! The layout is the one the desktop client has always written, so existing
//! `net_ids.json` files keep working. Passwords are stored in plaintext; the
//! file is at least restricted to its owner on Unix.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub account_id: String,
    pub password: String,
    pub auto_login: bool,
}

impl Credential {
    pub fn new(account_id: impl Into<String>, password: impl Into<String>, auto_login: bool) -> Self {
        Self {
            account_id: account_id.into(),
            password: password.into(),
            auto_login,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account_id", &self.account_id)
            .field("password", &"<redacted>")
            .field("auto_login", &self.auto_login)
            .finish()
    }
}

type Entries = BTreeMap<String, (String, bool)>;

/// Single writer of the credentials file.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    entries: Entries,
}

impl CredentialStore {
    /// Read `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries: Entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| Error::StoreFormat {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                tracing::info!("No saved accounts at {}", path.display());
                Entries::new()
            }
            Err(source) => return Err(Error::Store { path, source }),
        };
        let flagged = entries.values().filter(|(_, auto)| *auto).count();
        if flagged > 1 {
            tracing::warn!(
                "{} accounts are marked for auto-login in {}; using the first",
                flagged,
                path.display()
            );
        }
        tracing::info!("Loaded {} account(s) from {}", entries.len(), path.display());
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All credentials, ordered by account id.
    pub fn list(&self) -> Vec<Credential> {
        self.entries
            .iter()
            .map(|(id, (password, auto))| Credential::new(id.clone(), password.clone(), *auto))
            .collect()
    }

    pub fn get(&self, account_id: &str) -> Option<Credential> {
        self.entries
            .get(account_id)
            .map(|(password, auto)| Credential::new(account_id, password.clone(), *auto))
    }

    /// The account eligible for unattended sign-in.
    pub fn auto_login(&self) -> Option<Credential> {
        self.entries
            .iter()
            .find(|(_, (_, auto))| *auto)
            .map(|(id, (password, _))| Credential::new(id.clone(), password.clone(), true))
    }

    /// Replace the whole store. A repeated account id keeps its last password
    /// and is flagged if any copy was; then only the first flagged account
    /// keeps auto-login. Entries with an empty account id are dropped.
    pub fn save_all(&mut self, credentials: Vec<Credential>) -> Result<()> {
        let mut merged: Vec<Credential> = Vec::with_capacity(credentials.len());
        for cred in credentials {
            if cred.account_id.trim().is_empty() {
                tracing::warn!("Skipping account with empty id");
                continue;
            }
            match merged.iter_mut().find(|c| c.account_id == cred.account_id) {
                Some(existing) => {
                    tracing::warn!(
                        "Account {} listed twice; keeping the last password",
                        cred.account_id
                    );
                    existing.password = cred.password;
                    existing.auto_login |= cred.auto_login;
                }
                None => merged.push(cred),
            }
        }

        let mut entries = Entries::new();
        let mut auto_taken = false;
        for cred in merged {
            let auto = if cred.auto_login && auto_taken {
                tracing::warn!(
                    "Only one account may auto-login; clearing flag on {}",
                    cred.account_id
                );
                false
            } else {
                auto_taken |= cred.auto_login;
                cred.auto_login
            };
            entries.insert(cred.account_id, (cred.password, auto));
        }
        self.commit(entries)
    }

    /// Add or replace one account. Setting its auto-login flag clears everyone else's.
    pub fn upsert(&mut self, credential: Credential) -> Result<()> {
        let mut entries = self.entries.clone();
        if credential.auto_login {
            clear_auto_login(&mut entries);
        }
        entries.insert(
            credential.account_id,
            (credential.password, credential.auto_login),
        );
        self.commit(entries)
    }

    /// Returns whether the account existed.
    pub fn remove(&mut self, account_id: &str) -> Result<bool> {
        let mut entries = self.entries.clone();
        if entries.remove(account_id).is_none() {
            return Ok(false);
        }
        self.commit(entries)?;
        Ok(true)
    }

    pub fn set_auto_login(&mut self, account_id: &str, enabled: bool) -> Result<()> {
        if !self.entries.contains_key(account_id) {
            return Err(Error::UnknownAccount(account_id.to_string()));
        }
        let mut entries = self.entries.clone();
        if enabled {
            clear_auto_login(&mut entries);
        }
        if let Some(entry) = entries.get_mut(account_id) {
            entry.1 = enabled;
        }
        self.commit(entries)
    }

    /// Write `entries` and only then make them the in-memory state.
    fn commit(&mut self, entries: Entries) -> Result<()> {
        self.persist(&entries)?;
        self.entries = entries;
        Ok(())
    }

    /// Write to a sibling temp file, then rename over the real one.
    fn persist(&self, entries: &Entries) -> Result<()> {
        let store_err = |source| Error::Store {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(store_err)?;
        }
        let json = serde_json::to_vec_pretty(entries).map_err(|source| Error::StoreFormat {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(store_err)?;
        restrict_permissions(&tmp).map_err(store_err)?;
        fs::rename(&tmp, &self.path).map_err(store_err)?;
        tracing::info!("Saved {} account(s) to {}", entries.len(), self.path.display());
        Ok(())
    }
}

fn clear_auto_login(entries: &mut Entries) {
    for (_, auto) in entries.values_mut() {
        *auto = false;
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::load(dir.path().join("net_ids.json")).unwrap()
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.is_empty());
        assert_eq!(store.auto_login(), None);
    }

    #[test]
    fn round_trip_is_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let written = vec![
            Credential::new("u2021003", "c", false),
            Credential::new("u2021001", "a", true),
            Credential::new("u2021002", "p@ss \"w\"", false),
        ];
        store_in(&dir).save_all(written.clone()).unwrap();

        let reloaded = store_in(&dir).list();
        let expected: HashSet<_> = written.iter().map(|c| c.account_id.clone()).collect();
        let got: HashSet<_> = reloaded.iter().map(|c| c.account_id.clone()).collect();
        assert_eq!(got, expected);
        for cred in &written {
            assert!(reloaded.contains(cred), "{:?} missing after reload", cred);
        }
    }

    #[test]
    fn reads_desktop_client_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net_ids.json");
        fs::write(&path, r#"{"u2021001": ["secret", true], "u2021002": ["other", false]}"#).unwrap();

        let store = CredentialStore::load(&path).unwrap();
        assert_eq!(store.auto_login(), Some(Credential::new("u2021001", "secret", true)));
        assert_eq!(store.get("u2021002").map(|c| c.auto_login), Some(false));
    }

    #[test]
    fn writes_desktop_client_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.upsert(Credential::new("u1", "pw", true)).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"u1": ["pw", true]}));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net_ids.json");
        fs::write(&path, "not json").unwrap();
        let err = CredentialStore::load(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Store);
    }

    #[test]
    fn only_one_auto_login_survives() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store
            .save_all(vec![
                Credential::new("b", "2", true),
                Credential::new("a", "1", true),
                Credential::new("", "x", true),
            ])
            .unwrap();
        let flagged: Vec<_> = store.list().into_iter().filter(|c| c.auto_login).collect();
        assert_eq!(flagged, vec![Credential::new("b", "2", true)]);
        assert_eq!(store.list().len(), 2);

        store.set_auto_login("a", true).unwrap();
        assert_eq!(store.auto_login().map(|c| c.account_id), Some("a".to_string()));
        assert_eq!(store.get("b").map(|c| c.auto_login), Some(false));

        store.upsert(Credential::new("c", "3", true)).unwrap();
        assert_eq!(store.auto_login().map(|c| c.account_id), Some("c".to_string()));
        assert_eq!(store.get("a").map(|c| c.auto_login), Some(false));
    }

    #[test]
    fn remove_and_unknown_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.upsert(Credential::new("a", "1", false)).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(matches!(
            store.set_auto_login("ghost", true),
            Err(Error::UnknownAccount(id)) if id == "ghost"
        ));
        assert!(store_in(&dir).is_empty());
    }

    #[test]
    fn duplicate_ids_keep_the_auto_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store
            .save_all(vec![
                Credential::new("a", "old", true),
                Credential::new("b", "2", false),
                Credential::new("a", "new", false),
            ])
            .unwrap();
        assert_eq!(store.auto_login(), Some(Credential::new("a", "new", true)));
        assert_eq!(store_in(&dir).list(), store.list());
    }

    #[test]
    fn failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let mut store = CredentialStore::load(sub.join("net_ids.json")).unwrap();
        store.upsert(Credential::new("u0", "pw", true)).unwrap();
        let before = store.list();

        // a regular file where the parent directory should be
        fs::remove_dir_all(&sub).unwrap();
        fs::write(&sub, "not a directory").unwrap();

        let err = store.upsert(Credential::new("u1", "pw", true)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Store);
        assert_eq!(store.auto_login().map(|c| c.account_id), Some("u0".to_string()));

        assert!(store.save_all(vec![Credential::new("u2", "x", false)]).is_err());
        assert!(store.set_auto_login("u0", false).is_err());
        assert!(store.remove("u0").is_err());
        assert_eq!(store.list(), before);
    }

    #[test]
    fn debug_hides_password() {
        let text = format!("{:?}", Credential::new("u1", "hunter2", false));
        assert!(!text.contains("hunter2"));
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.upsert(Credential::new("u1", "pw", false)).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
