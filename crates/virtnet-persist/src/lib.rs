//! Definition persistence (spec §6/§C3): the on-disk `<sysconfdir>` layout
//! for network definitions, autostart symlinks, per-network state files, and
//! the daemon-wide lock — modeled on the teacher's `StateStore`, including
//! its stale-lock crash recovery (`is_lock_stale`/`force_remove_lock`).

pub mod codec;

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use virtnet_model::NetworkDef;
use virtnet_util::{set_permissions_0600, set_permissions_0700};

/// The four directories of spec §6's filesystem-paths table.
#[derive(Debug, Clone)]
pub struct PersistPaths {
    pub def_dir: PathBuf,
    pub autostart_dir: PathBuf,
    pub state_dir: PathBuf,
    pub run_dir: PathBuf,
}

impl PersistPaths {
    /// System mode: `<sysconfdir>/libvirt/qemu/networks`, its `autostart`
    /// child, `<localstatedir>/lib/libvirt/network`, `<localstatedir>/run/libvirt/network`.
    pub fn system(sysconfdir: &Path, localstatedir: &Path) -> Self {
        let def_dir = sysconfdir.join("libvirt/qemu/networks");
        Self {
            autostart_dir: def_dir.join("autostart"),
            def_dir,
            state_dir: localstatedir.join("lib/libvirt/network"),
            run_dir: localstatedir.join("run/libvirt/network"),
        }
    }

    /// Session mode: everything rooted under `$HOME/.libvirt`.
    pub fn session(home: &Path) -> Self {
        let root = home.join(".libvirt");
        Self {
            def_dir: root.join("qemu/networks"),
            autostart_dir: root.join("qemu/networks/autostart"),
            state_dir: root.join("network/lib"),
            run_dir: root.join("network/run"),
        }
    }

    pub fn ensure_all(&self) -> Result<()> {
        for dir in [&self.def_dir, &self.autostart_dir, &self.state_dir, &self.run_dir] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    fn def_path(&self, name: &str) -> PathBuf {
        self.def_dir.join(format!("{name}.xml"))
    }

    fn autostart_path(&self, name: &str) -> PathBuf {
        self.autostart_dir.join(format!("{name}.xml"))
    }
}

/// Writes `def` to `<def_dir>/<name>.xml`, replacing any prior definition.
pub fn save_definition(paths: &PersistPaths, def: &NetworkDef) -> Result<()> {
    let path = paths.def_path(&def.name);
    let xml = codec::encode(def);
    fs::write(&path, xml).with_context(|| format!("writing {}", path.display()))?;
    set_permissions_0600(&path)?;
    Ok(())
}

pub fn remove_definition(paths: &PersistPaths, name: &str) -> Result<()> {
    let path = paths.def_path(name);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// Loads every well-formed definition in `def_dir`; a per-file parse or I/O
/// failure is logged and the scan continues (spec §7).
pub fn load_all_definitions(paths: &PersistPaths) -> Result<Vec<NetworkDef>> {
    let mut defs = Vec::new();
    let entries = match fs::read_dir(&paths.def_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(defs),
        Err(e) => return Err(e).with_context(|| format!("listing {}", paths.def_dir.display())),
    };
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("xml") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
        match fs::read_to_string(&path).map_err(anyhow::Error::from).and_then(|s| codec::decode(&s).map_err(anyhow::Error::from)) {
            Ok(def) if def.name != stem => {
                tracing::warn!(path = %path.display(), name = %def.name, "skipping network definition whose filename does not match its name");
            }
            Ok(def) => defs.push(def),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unparseable network definition"),
        }
    }
    Ok(defs)
}

/// Points `<autostart_dir>/<name>.xml` at `<def_dir>/<name>.xml`, or removes
/// it when `on` is false.
pub fn set_autostart(paths: &PersistPaths, name: &str, on: bool) -> Result<()> {
    let link = paths.autostart_path(name);
    match fs::remove_file(&link) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing stale autostart link {}", link.display())),
    }
    if on {
        std::os::unix::fs::symlink(paths.def_path(name), &link)
            .with_context(|| format!("linking {}", link.display()))?;
    }
    Ok(())
}

pub fn is_autostart(paths: &PersistPaths, name: &str) -> bool {
    fs::read_link(paths.autostart_path(name))
        .map(|target| target == paths.def_path(name))
        .unwrap_or(false)
}

/// The daemon-wide advisory lock, guarding against a second daemon instance
/// starting against the same state directory.
pub struct DaemonLock {
    pub lock_path: PathBuf,
}

impl DaemonLock {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            lock_path: run_dir.join("virtnetd.lock"),
        }
    }

    /// Removes a lock left by a process that is no longer running, then
    /// creates a fresh one holding our own pid.
    pub fn acquire(&self) -> Result<fs::File> {
        if self.lock_path.exists() && self.is_stale()? {
            tracing::warn!(path = %self.lock_path.display(), "removing stale daemon lock from a crashed instance");
            let _ = fs::remove_file(&self.lock_path);
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .with_context(|| format!("lock file exists: {} (is virtnetd already running?)", self.lock_path.display()))?;
        set_permissions_0600(&self.lock_path)?;
        writeln!(file, "{}", std::process::id()).context("writing pid to lock file")?;
        file.sync_all()?;
        Ok(file)
    }

    pub fn is_stale(&self) -> Result<bool> {
        let contents = match fs::read_to_string(&self.lock_path) {
            Ok(c) => c,
            Err(_) => return Ok(true),
        };
        match contents.trim().parse::<i32>() {
            Ok(pid) => Ok(!virtnet_util::pid::is_alive(pid)),
            Err(_) => Ok(true),
        }
    }

    pub fn release(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.lock_path.display())),
        }
    }
}
