//! File-backed profile store
//!
//! ```text
//! <profile_dir>/<id>.toml          profile
//! <profile_dir>/<id>.deleted       deferred-deletion marker
//! <runtime_dir>/<id>.auth          transient credentials (0600)
//! <runtime_dir>/<id>.log           client instance log
//! <runtime_dir>/<id>.state.json    runtime state
//! ```

use crate::collaborators::ProfileStore;
use crate::config::ClientConfig;
use crate::profile::{ProfileError, ProfileId, VpnProfile};
use crate::runtime::TunnelRuntimeState;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Profiles as TOML files, runtime artifacts in a separate directory.
#[derive(Debug, Clone)]
pub struct FileProfileStore {
    profile_dir: PathBuf,
    runtime_dir: PathBuf,
}

fn io_error(path: &Path, err: io::Error) -> ProfileError {
    ProfileError::IoError(format!("{}: {}", path.display(), err))
}

/// Remove a file, treating "already gone" as success.
fn remove_if_exists(path: &Path) -> Result<(), ProfileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path, e)),
    }
}

impl FileProfileStore {
    pub fn new(profile_dir: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile_dir: profile_dir.into(),
            runtime_dir: runtime_dir.into(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(&config.profile_dir, &config.runtime_dir)
    }

    /// Create the runtime directory if needed.
    pub fn ensure_dirs(&self) -> Result<(), ProfileError> {
        fs::create_dir_all(&self.runtime_dir).map_err(|e| io_error(&self.runtime_dir, e))
    }

    fn checked(id: &ProfileId) -> Result<&str, ProfileError> {
        if id.is_valid() {
            Ok(id.as_str())
        } else {
            Err(ProfileError::InvalidId(id.as_str().to_string()))
        }
    }

    fn profile_path(&self, id: &ProfileId) -> Result<PathBuf, ProfileError> {
        Ok(self.profile_dir.join(format!("{}.toml", Self::checked(id)?)))
    }

    fn marker_path(&self, id: &ProfileId) -> Result<PathBuf, ProfileError> {
        Ok(self.profile_dir.join(format!("{}.deleted", Self::checked(id)?)))
    }

    fn runtime_path(&self, id: &ProfileId, suffix: &str) -> Result<PathBuf, ProfileError> {
        Ok(self.runtime_dir.join(format!("{}.{}", Self::checked(id)?, suffix)))
    }

    /// Write a profile file (used by tooling and tests).
    pub fn save_profile(&self, profile: &VpnProfile) -> Result<(), ProfileError> {
        let path = self.profile_path(&profile.id)?;
        let content =
            toml::to_string_pretty(profile).map_err(|e| ProfileError::ParseError(e.to_string()))?;
        fs::create_dir_all(&self.profile_dir).map_err(|e| io_error(&self.profile_dir, e))?;
        write_atomic(&path, content.as_bytes())
    }
}

/// Write through a temporary file and rename over the target.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ProfileError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_error(path, e))
}

#[cfg(unix)]
fn create_private(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

impl ProfileStore for FileProfileStore {
    fn get(&self, id: &ProfileId) -> Result<VpnProfile, ProfileError> {
        let path = self.profile_path(id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProfileError::NotFound(id.clone()));
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        let profile: VpnProfile = toml::from_str(&content)
            .map_err(|e| ProfileError::ParseError(format!("{}: {}", path.display(), e)))?;
        if &profile.id != id {
            return Err(ProfileError::ParseError(format!(
                "{}: declares id {}",
                path.display(),
                profile.id
            )));
        }
        Ok(profile)
    }

    fn list(&self) -> Result<Vec<ProfileId>, ProfileError> {
        let entries = match fs::read_dir(&self.profile_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.profile_dir, e)),
        };

        let mut ids: Vec<ProfileId> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(ProfileId::from)
            })
            .filter(ProfileId::is_valid)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn save_state(&self, state: &TunnelRuntimeState) -> Result<(), ProfileError> {
        let path = self.runtime_path(&state.profile_id, "state.json")?;
        let json =
            serde_json::to_vec_pretty(state).map_err(|e| ProfileError::ParseError(e.to_string()))?;
        write_atomic(&path, &json)
    }

    fn load_state(&self, id: &ProfileId) -> Result<Option<TunnelRuntimeState>, ProfileError> {
        let path = self.runtime_path(id, "state.json")?;
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ProfileError::ParseError(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn remove_state(&self, id: &ProfileId) -> Result<(), ProfileError> {
        remove_if_exists(&self.runtime_path(id, "state.json")?)
    }

    fn write_credentials(&self, profile: &VpnProfile) -> Result<Option<PathBuf>, ProfileError> {
        let path = self.runtime_path(&profile.id, "auth")?;
        let Some(credentials) = &profile.credentials else {
            remove_if_exists(&path)?;
            return Ok(None);
        };

        let mut file = create_private(&path).map_err(|e| io_error(&path, e))?;
        writeln!(file, "{}", credentials.username)
            .and_then(|()| writeln!(file, "{}", credentials.password))
            .map_err(|e| io_error(&path, e))?;
        debug!("Wrote credentials for {}", profile.id);
        Ok(Some(path))
    }

    fn remove_credentials(&self, id: &ProfileId) -> Result<(), ProfileError> {
        remove_if_exists(&self.runtime_path(id, "auth")?)
    }

    fn truncate_log(&self, id: &ProfileId) -> Result<PathBuf, ProfileError> {
        let path = self.runtime_path(id, "log")?;
        File::create(&path).map_err(|e| io_error(&path, e))?;
        Ok(path)
    }

    fn mark_deleted(&self, id: &ProfileId) -> Result<(), ProfileError> {
        if !self.profile_path(id)?.exists() {
            return Err(ProfileError::NotFound(id.clone()));
        }
        let marker = self.marker_path(id)?;
        File::create(&marker).map_err(|e| io_error(&marker, e))?;
        Ok(())
    }

    fn is_marked_deleted(&self, id: &ProfileId) -> bool {
        self.marker_path(id).is_ok_and(|marker| marker.exists())
    }

    fn delete_profile(&self, id: &ProfileId) -> Result<(), ProfileError> {
        let mut result = Ok(());
        let paths = [
            self.profile_path(id)?,
            self.marker_path(id)?,
            self.runtime_path(id, "auth")?,
            self.runtime_path(id, "log")?,
            self.runtime_path(id, "state.json")?,
        ];
        for path in &paths {
            if let Err(e) = remove_if_exists(path) {
                warn!("Profile {}: {}", id, e);
                result = Err(e);
            }
        }
        result
    }
}
