//! Optional process-level knobs, distinct from the durable settings
//! `Store` keeps under `<path>/settings/`. These are read once at startup
//! from `<path>/simq.toml` and never touched by `Changes` — changing them
//! means editing the file and restarting the process.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

fn default_applier_tick_ms() -> u64 {
    50
}

fn default_epoll_tick_ms() -> u64 {
    2000
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_listen_backlog() -> i32 {
    1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// How often the applier thread polls the `Changes` journal.
    pub applier_tick_ms: u64,
    /// Poll timeout for each worker thread's `mio` loop; also how often
    /// idle sessions are swept.
    pub epoll_tick_ms: u64,
    /// Seconds of inactivity before a session is force-closed.
    pub idle_timeout_secs: u64,
    /// `listen(2)` backlog for each worker's `SO_REUSEPORT` socket.
    pub listen_backlog: i32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            applier_tick_ms: default_applier_tick_ms(),
            epoll_tick_ms: default_epoll_tick_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            listen_backlog: default_listen_backlog(),
        }
    }
}

impl AppConfig {
    /// Reads `<root>/simq.toml` if present; falls back to defaults when the
    /// file is absent, which is the common case.
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let path = root.join("simq.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)?;
        let cfg: Self = toml::from_str(&text)?;
        Ok(cfg)
    }

    pub fn applier_tick(&self) -> Duration {
        Duration::from_millis(self.applier_tick_ms)
    }

    pub fn epoll_tick(&self) -> Duration {
        Duration::from_millis(self.epoll_tick_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.applier_tick_ms, 50);
        assert_eq!(cfg.idle_timeout_secs, 60);
    }

    #[test]
    fn partial_toml_only_overrides_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("simq.toml"), "idle_timeout_secs = 30\n").unwrap();
        let cfg = AppConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.idle_timeout_secs, 30);
        assert_eq!(cfg.listen_backlog, 1024);
    }
}
