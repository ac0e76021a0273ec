//! Kernel WireGuard backend driven through `wg-quick` and `wg`
//!
//! The interface configuration is kept at `<dir>/<interface>.conf`. A new
//! interface is brought up with `wg-quick up`; an existing one is updated in
//! place with `wg syncconf`, which replaces the peer set without dropping
//! established sessions.

use crate::device::{DeviceBackend, DeviceState};
use crate::error::{GuardError, Result};
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Executes external programs
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning stdout on success
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Runs commands on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("Executing command: {} {:?}", program, args);

        let output = Command::new(program).args(args).output().map_err(|e| {
            GuardError::Infrastructure(format!(
                "Failed to execute {} {}: {}",
                program,
                args.join(" "),
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GuardError::Infrastructure(format!(
                "Command failed: {} {}: {}",
                program,
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Device backend for the Linux kernel module
pub struct WgQuickBackend {
    config_dir: PathBuf,
    runner: Box<dyn CommandRunner>,
}

impl WgQuickBackend {
    /// Backend writing interface configs into `config_dir`
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        Self::with_runner(config_dir, Box::new(SystemRunner))
    }

    /// Backend using a custom command runner
    pub fn with_runner<P: AsRef<Path>>(config_dir: P, runner: Box<dyn CommandRunner>) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            runner,
        }
    }

    /// Path of an interface's configuration file
    pub fn config_path(&self, interface: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", interface))
    }

    fn interface_exists(&self, interface: &str) -> bool {
        self.runner.run("ip", &["link", "show", "dev", interface]).is_ok()
    }

    fn write_private(path: &Path, contents: &str) -> Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(path).map_err(|e| {
            GuardError::Infrastructure(format!("Failed to write {:?}: {}", path, e))
        })?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn write_config(&self, desired: &DeviceState) -> Result<PathBuf> {
        fs::create_dir_all(&self.config_dir)?;

        let path = self.config_path(&desired.interface);
        let tmp = self
            .config_dir
            .join(format!(".{}.conf.tmp", desired.interface));
        Self::write_private(&tmp, &desired.to_profile().render())?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    fn sync(&self, interface: &str, config: &Path) -> Result<()> {
        let config = path_arg(config)?;
        let stripped = self.runner.run("wg-quick", &["strip", config])?;

        let tmp = self.config_dir.join(format!(".{}.sync.tmp", interface));
        Self::write_private(&tmp, &stripped)?;

        let synced = path_arg(&tmp).and_then(|tmp_arg| {
            self.runner
                .run("wg", &["syncconf", interface, tmp_arg])
                .map(|_| ())
        });
        let _ = fs::remove_file(&tmp);
        synced
    }
}

impl DeviceBackend for WgQuickBackend {
    fn apply(&self, desired: &DeviceState) -> Result<()> {
        let config = self.write_config(desired)?;

        if self.interface_exists(&desired.interface) {
            self.sync(&desired.interface, &config)?;
            debug!("Synced interface {}", desired.interface);
        } else {
            self.runner.run("wg-quick", &["up", path_arg(&config)?])?;
            info!("Brought up interface {}", desired.interface);
        }

        Ok(())
    }

    fn teardown(&self, interface: &str) -> Result<()> {
        let config = self.config_path(interface);

        if self.interface_exists(interface) {
            if config.exists() {
                self.runner.run("wg-quick", &["down", path_arg(&config)?])?;
            } else {
                self.runner.run("ip", &["link", "delete", "dev", interface])?;
            }
            info!("Brought down interface {}", interface);
        }

        match fs::remove_file(&config) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GuardError::Infrastructure(format!(
                "Failed to remove {:?}: {}",
                config, e
            ))),
        }
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| GuardError::Config(format!("Non UTF-8 path: {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::KeyPair;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Records invocations; `ip link show` succeeds only for `present` links
    #[derive(Clone, Default)]
    struct RecordingRunner {
        calls: Arc<Mutex<Vec<String>>>,
        present: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingRunner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", program, args.join(" ")));

            match (program, args) {
                ("ip", ["link", "show", "dev", name]) => {
                    if self.present.lock().unwrap().iter().any(|p| p.as_str() == *name) {
                        Ok(String::new())
                    } else {
                        Err(GuardError::Infrastructure("no such device".to_string()))
                    }
                }
                ("wg-quick", ["strip", _]) => Ok("[Interface]\n".to_string()),
                _ => Ok(String::new()),
            }
        }
    }

    fn state() -> DeviceState {
        DeviceState {
            interface: "t0".to_string(),
            private_key: KeyPair::generate().unwrap().private,
            address: "10.0.0.1/24".parse().unwrap(),
            listen_port: 51820,
            peers: vec![],
        }
    }

    #[test]
    fn test_apply_brings_up_new_interface() {
        let dir = TempDir::new().unwrap();
        let runner = RecordingRunner::default();
        let backend = WgQuickBackend::with_runner(dir.path(), Box::new(runner.clone()));

        backend.apply(&state()).unwrap();

        let config = backend.config_path("t0");
        let text = fs::read_to_string(&config).unwrap();
        assert!(text.contains("ListenPort = 51820"));

        let calls = runner.calls();
        assert_eq!(calls.last().unwrap(), &format!("wg-quick up {}", config.display()));
    }

    #[test]
    fn test_apply_syncs_existing_interface() {
        let dir = TempDir::new().unwrap();
        let runner = RecordingRunner::default();
        runner.present.lock().unwrap().push("t0".to_string());
        let backend = WgQuickBackend::with_runner(dir.path(), Box::new(runner.clone()));

        backend.apply(&state()).unwrap();

        let calls = runner.calls();
        assert!(calls.iter().any(|c| c.starts_with("wg-quick strip")));
        assert!(calls.iter().any(|c| c.starts_with("wg syncconf t0")));
        assert!(!calls.iter().any(|c| c.starts_with("wg-quick up")));
        assert!(!dir.path().join(".t0.sync.tmp").exists());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let runner = RecordingRunner::default();
        let backend = WgQuickBackend::with_runner(dir.path(), Box::new(runner.clone()));

        backend.apply(&state()).unwrap();
        runner.present.lock().unwrap().push("t0".to_string());

        backend.teardown("t0").unwrap();
        assert!(!backend.config_path("t0").exists());
        assert!(runner.calls().iter().any(|c| c.starts_with("wg-quick down")));

        runner.present.lock().unwrap().clear();
        backend.teardown("t0").unwrap();
    }
}
