//! ## Configuration
//!
//! Environment-driven configuration: the TCP port clients connect to, where
//! the pidfile and log file live. Grounded on `brickd_linux.py`'s
//! `TF_DATA_DIR`/`XDG_DATA_DIR`/`XDG_RUNTIME_DIR` fallback chain, re-expressed
//! with the `dirs` crate instead of hand-rolled environment parsing.

use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 4223;
const PORT_ENV: &str = "BRICKD_PORT";
const PIDFILE_ENV: &str = "BRICKD_PID_FILE";
const LOG_FILE_ENV: &str = "BRICKD_LOG_FILE";

#[derive(Debug, Clone)]
pub struct Config {
    port: u16,
    pidfile: PathBuf,
    log_file: Option<PathBuf>,
}

impl Config {
    /// Resolve configuration from the environment, following
    /// `brickd_linux.py`'s root-vs-user directory convention: root gets
    /// `/var/run`, everyone else gets their XDG runtime/data directory.
    pub fn from_env() -> Self {
        let port = std::env::var(PORT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let pidfile = std::env::var_os(PIDFILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_pidfile_path);

        let log_file = std::env::var_os(LOG_FILE_ENV).map(PathBuf::from);

        Config {
            port,
            pidfile,
            log_file,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn pidfile(&self) -> &std::path::Path {
        &self.pidfile
    }

    pub fn log_file(&self) -> Option<&std::path::Path> {
        self.log_file.as_deref()
    }
}

fn default_pidfile_path() -> PathBuf {
    if is_root() {
        return PathBuf::from("/var/run/brickd.pid");
    }

    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("brickd.pid"))
        .unwrap_or_else(|| PathBuf::from("/tmp/brickd.pid"))
}

/// Best-effort effective-uid check via `/proc/self/status`, avoiding a
/// dedicated libc binding for a single comparison. Defaults to "not root" if
/// the line can't be parsed, which is the safer default directory choice.
fn is_root() -> bool {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return false;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse::<u32>().ok())
        == Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_when_env_unset() {
        std::env::remove_var(PORT_ENV);
        assert_eq!(Config::from_env().listen_addr().port(), DEFAULT_PORT);
    }

    #[test]
    fn pidfile_env_override_is_honored() {
        std::env::set_var(PIDFILE_ENV, "/tmp/custom-brickd.pid");
        let config = Config::from_env();
        assert_eq!(config.pidfile(), std::path::Path::new("/tmp/custom-brickd.pid"));
        std::env::remove_var(PIDFILE_ENV);
    }
}
