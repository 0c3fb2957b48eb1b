//! Filesystem database and identity verifier.
//!
//! State lives in two subtrees under the configured root:
//!
//! ```text
//! identities/<switch>/<port>/<mac>/identity.json
//! profiles/<q1>/<q2>/…/profile.json
//! ```
//!
//! Verification is deny-by-default: any unexpected I/O error while
//! reading prior state fails the request closed.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use autopolicy_common::Identity;
use thiserror::Error;

const DB_IDS: &str = "identities";
const DB_PFS: &str = "profiles";

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o640;

/// Identity verification errors. The messages are part of the wire
/// contract: they surface verbatim in 403 responses.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("MAC address not authorized on that port")]
    UnknownMac,
    #[error("DB error for that MAC: should be a directory")]
    MacNotDir,
    #[error("identity downgrade detected")]
    Downgrade,
    #[error("DB error: {0}")]
    Io(#[from] io::Error),
    #[error("DB error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("DB error: {0}")]
    StoredIdentity(#[from] autopolicy_common::IdentityError),
}

/// The on-disk state store.
pub struct Db {
    root: PathBuf,
    auto: bool,
    fix: bool,
}

impl Db {
    /// Open (creating if needed) the database rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, auto: bool, fix: bool) -> io::Result<Db> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::set_permissions(&root, fs::Permissions::from_mode(0o750))?;
        Ok(Db { root, auto, fix })
    }

    /// Human tag for log lines: `switch/port/mac`.
    pub fn tag(id: &Identity) -> String {
        format!(
            "{}/{}/{}",
            id.get("@switch").unwrap_or(""),
            id.get("@port").unwrap_or(""),
            id.get("@mac").unwrap_or("")
        )
    }

    fn mac_path(&self, id: &Identity) -> PathBuf {
        self.port_path(id).join(id.get("@mac").unwrap_or(""))
    }

    fn port_path(&self, id: &Identity) -> PathBuf {
        self.root
            .join(DB_IDS)
            .join(id.get("@switch").unwrap_or(""))
            .join(id.get("@port").unwrap_or(""))
    }

    pub fn profile_dir(&self, qstring: &str) -> PathBuf {
        if qstring.is_empty() {
            self.root.join(DB_PFS)
        } else {
            self.root.join(DB_PFS).join(qstring)
        }
    }

    pub fn profile_path(&self, qstring: &str) -> PathBuf {
        self.profile_dir(qstring).join("profile.json")
    }

    /// Verify a submitted identity against stored state.
    ///
    /// Checks that the MAC is authorized on the switch port
    /// (auto-learning the first MAC when the `auto` policy is on),
    /// then compares every previously stored claim against the
    /// submission: a missing or changed claim is a downgrade, `$`
    /// keys may only grow lexicographically. When the `fix` policy is
    /// on, missing claims are copied back from the stored identity.
    /// A submission richer than the stored one is persisted.
    pub fn verify(&self, mut id: Identity) -> Result<Identity, VerifyError> {
        let path = self.mac_path(&id);
        let tag = Db::tag(&id);
        tracing::debug!("{tag}: verifying identity");

        match fs::metadata(&path) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(VerifyError::MacNotDir);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.learn_mac(&id, &path, &tag)?;
            }
            Err(err) => return Err(err.into()),
        }

        // claims still unseen by the stored identity
        let mut todo: Vec<String> = id.claim_keys().map(str::to_string).collect();

        let stored = path.join("identity.json");
        match fs::read(&stored) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {} // first identity seen so far
            Err(err) => return Err(err.into()),
            Ok(bytes) => {
                let raw: serde_json::Value = serde_json::from_slice(&bytes)?;
                let old = Identity::from_value(&raw)?;

                for (key, oldval) in old.iter() {
                    if key.starts_with('@') {
                        continue;
                    }
                    match id.get(key) {
                        None => {
                            if self.fix {
                                tracing::debug!(
                                    "{tag}: missing key '{key}', will fix: use old value '{oldval}'"
                                );
                                id.set(key, oldval);
                                todo.retain(|k| k.as_str() != key);
                            } else {
                                tracing::info!(
                                    "{tag}: downgrade of '{key}': old value '{oldval}', now missing"
                                );
                                return Err(VerifyError::Downgrade);
                            }
                        }
                        Some(newval) if newval == oldval => {
                            todo.retain(|k| k.as_str() != key);
                        }
                        Some(newval) if key.starts_with('$') => {
                            if newval < oldval {
                                tracing::info!(
                                    "{tag}: downgrade of '{key}': old '{oldval}' bigger than new '{newval}'"
                                );
                                return Err(VerifyError::Downgrade);
                            }
                            tracing::info!(
                                "{tag}: update of '{key}': old '{oldval}' smaller than new '{newval}'"
                            );
                        }
                        Some(newval) => {
                            tracing::info!(
                                "{tag}: downgrade of '{key}': old '{oldval}' vs. new '{newval}'"
                            );
                            return Err(VerifyError::Downgrade);
                        }
                    }
                }
            }
        }

        // submitted identity is richer than the stored one
        if !todo.is_empty() {
            tracing::info!("{tag}: writing new identity file");
            if let Err(err) = write_file_atomic(&stored, &id.to_json_bytes(), FILE_MODE) {
                tracing::error!("{tag}: storing the identity failed: {err}");
            }
        }

        Ok(id)
    }

    /// Auto-learn policy for a MAC directory that does not exist yet.
    fn learn_mac(&self, id: &Identity, path: &Path, tag: &str) -> Result<(), VerifyError> {
        if !self.auto {
            return Err(VerifyError::UnknownMac);
        }

        match fs::read_dir(self.port_path(id)) {
            Ok(mut entries) => {
                // port already known: only learn the first MAC on it
                if entries.next().is_some() {
                    return Err(VerifyError::UnknownMac);
                }
                mkdir(path)?;
                tracing::debug!("{tag}: first MAC on existing port -> auto-add");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                mkdir_all(path)?;
                tracing::debug!("{tag}: first MAC on non-existing port -> auto-add");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn mkdir(path: &Path) -> io::Result<()> {
    fs::create_dir(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE))
}

pub(crate) fn mkdir_all(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(DIR_MODE))
}

/// Write a file through a temporary sibling and an atomic rename, so
/// concurrent readers observe either the old or the new complete file.
pub(crate) fn write_file_atomic(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Escape a value so it is safe inside a profile query path: lowercase
/// A–Z, keep `a-z 0-9 -`, squeeze any other run into a single `_`,
/// trim `_` from both ends.
pub fn esc(val: &str) -> String {
    let mut out = String::with_capacity(val.len());
    let mut underscore = false;

    for ch in val.chars() {
        match ch {
            'A'..='Z' => {
                out.push(ch.to_ascii_lowercase());
                underscore = false;
            }
            'a'..='z' | '0'..='9' | '-' => {
                out.push(ch);
                underscore = false;
            }
            _ => {
                if !underscore {
                    out.push('_');
                    underscore = true;
                }
            }
        }
    }

    out.trim_matches('_').to_string()
}
