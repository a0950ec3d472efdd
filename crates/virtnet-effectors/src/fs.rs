//! The `fs.*` effector of spec §6: atomic writes, pidfile reads, directory
//! creation, and symlink-target checks, shared by persistence and the DHCP
//! sidecar supervisor.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub trait FsEffector: Send + Sync {
    fn write_string(&self, path: &Path, text: &str) -> Result<()>;
    fn read_pid(&self, dir: &Path, name: &str) -> Result<Option<i32>>;
    fn make_path(&self, path: &Path) -> Result<()>;
    fn link_points_to(&self, link: &Path, target: &Path) -> Result<bool>;
}

pub struct StdFsEffector;

impl FsEffector for StdFsEffector {
    /// Write-to-temp-then-rename so a reader never observes a partial file.
    fn write_string(&self, path: &Path, text: &str) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let tmp = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("virtnet")
        ));
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }

    fn read_pid(&self, dir: &Path, name: &str) -> Result<Option<i32>> {
        virtnet_util::pid::read_pid(dir, name)
    }

    fn make_path(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
    }

    fn link_points_to(&self, link: &Path, target: &Path) -> Result<bool> {
        match std::fs::read_link(link) {
            Ok(resolved) => Ok(resolved == target),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("reading link {}", link.display())),
        }
    }
}

/// `<dir>/autostart/<name>.xml -> <dir>/<name>.xml`, the autostart symlink
/// convention shared by the persistence layer and this effector's callers.
pub fn autostart_link_target(def_dir: &Path, name: &str) -> PathBuf {
    def_dir.join(format!("{name}.xml"))
}
