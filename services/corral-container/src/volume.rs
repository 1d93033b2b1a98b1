//! The volume holder.
//!
//! Volumes are named chunks of backing storage provisioned under a pool
//! directory. The container engine only forwards the five volume RPCs here;
//! the on-disk layout below the pool directory is the back-end's business.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::state::Cred;

/// One provisioned volume.
#[derive(Debug, Clone)]
pub struct Volume {
    name: String,
    source: String,
    quota: String,
    flags: String,
    owner: Cred,
}

impl Volume {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn quota(&self) -> &str {
        &self.quota
    }

    pub fn flags(&self) -> &str {
        &self.flags
    }

    /// Compares `cred` against the owning credential; root bypasses.
    pub fn check_permission(&self, cred: Cred) -> Result<()> {
        if cred.is_privileged() || cred.uid == self.owner.uid {
            return Ok(());
        }
        Err(Error::PermissionDenied(format!(
            "volume {} is owned by uid {}",
            self.name, self.owner.uid
        )))
    }
}

/// Registry of volumes over one pool directory.
pub struct VolumeHolder {
    pool: PathBuf,
    order: Vec<String>,
    volumes: HashMap<String, Volume>,
}

impl VolumeHolder {
    /// Opens the holder, creating the pool directory if needed and
    /// re-adopting any volume directories left from a previous run.
    pub fn open(pool: impl Into<PathBuf>) -> Result<Self> {
        let pool = pool.into();
        fs::create_dir_all(&pool).map_err(|e| Error::Storage(e.to_string()))?;

        let mut holder = Self {
            pool,
            order: Vec::new(),
            volumes: HashMap::new(),
        };
        holder.adopt_existing()?;
        Ok(holder)
    }

    fn adopt_existing(&mut self) -> Result<()> {
        let entries = fs::read_dir(&self.pool).map_err(|e| Error::Storage(e.to_string()))?;
        let mut names = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        names.sort();

        for name in names {
            warn!(volume = %name, "re-adopting volume from a previous run");
            let source = self.backing_dir(&name).to_string_lossy().into_owned();
            self.insert(Volume {
                name,
                source,
                quota: String::new(),
                flags: String::new(),
                owner: Cred::root(),
            });
        }
        Ok(())
    }

    fn backing_dir(&self, name: &str) -> PathBuf {
        self.pool.join(name)
    }

    fn insert(&mut self, volume: Volume) {
        self.order.push(volume.name.clone());
        self.volumes.insert(volume.name.clone(), volume);
    }

    /// Looks a volume up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Volume> {
        self.volumes.get(name)
    }

    /// Provisions a volume.
    pub fn create(
        &mut self,
        name: &str,
        source: &str,
        quota: &str,
        flags: &str,
        cred: Cred,
    ) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidValue(format!("invalid volume name {name:?}")));
        }
        if self.volumes.contains_key(name) {
            return Err(Error::InvalidValue(format!(
                "volume {name} already exists"
            )));
        }

        fs::create_dir_all(self.backing_dir(name))
            .map_err(|e| Error::Storage(e.to_string()))?;

        self.insert(Volume {
            name: name.to_owned(),
            source: source.to_owned(),
            quota: quota.to_owned(),
            flags: flags.to_owned(),
            owner: cred,
        });
        info!(volume = name, uid = cred.uid, "volume created");
        Ok(())
    }

    /// Destroys a volume after an ownership check.
    pub fn destroy(&mut self, name: &str, cred: Cred) -> Result<()> {
        let Some(volume) = self.volumes.get(name) else {
            return Err(Error::VolumeDoesNotExist(format!(
                "volume {name} doesn't exist"
            )));
        };
        volume.check_permission(cred)?;

        fs::remove_dir_all(self.backing_dir(name))
            .map_err(|e| Error::Storage(e.to_string()))?;

        self.volumes.remove(name);
        self.order.retain(|n| n != name);
        info!(volume = name, "volume destroyed");
        Ok(())
    }

    /// Volumes in creation order.
    pub fn list(&self) -> Vec<&Volume> {
        self.order
            .iter()
            .filter_map(|name| self.volumes.get(name))
            .collect()
    }

    /// The pool directory.
    #[must_use]
    pub fn pool(&self) -> &Path {
        &self.pool
    }
}
