//! Durable directory layout rooted at `<path>`: server settings, group and
//! channel credentials/limits, per-user credentials. Direct accessors read
//! the filesystem fresh (for the admin surface, without touching the
//! running server's locks); the server keeps its own locked, in-memory
//! cache of `settings/settings` updated only through `Changes`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::access::Digest32;
use crate::message_buffer::ChannelLimits;

pub const DEFAULT_PORT: u16 = 4012;
const SETTINGS_DIR: &str = "settings";
const SETTINGS_FILE: &str = "settings";
const GROUPS_DIR: &str = "groups";
const CONSUMERS_DIR: &str = "consumers";
const PRODUCERS_DIR: &str = "producers";
const PASSWORD_FILE: &str = "password";
const CHANNEL_SETTINGS_FILE: &str = "settings";

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub count_threads: u16,
    pub port: u16,
    pub master_password: Digest32,
}

pub struct Store {
    root: PathBuf,
    settings: RwLock<Settings>,
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name.chars().all(|c| c.is_ascii_alphanumeric())
}

fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

fn encode_settings(s: &Settings) -> [u8; 36] {
    let mut buf = [0u8; 36];
    buf[0..2].copy_from_slice(&s.count_threads.to_be_bytes());
    buf[2..4].copy_from_slice(&s.port.to_be_bytes());
    buf[4..36].copy_from_slice(&s.master_password);
    buf
}

fn decode_settings(buf: &[u8]) -> Option<Settings> {
    if buf.len() != 36 {
        return None;
    }
    let count_threads = u16::from_be_bytes([buf[0], buf[1]]);
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let mut master_password = [0u8; 32];
    master_password.copy_from_slice(&buf[4..36]);
    Some(Settings {
        count_threads,
        port,
        master_password,
    })
}

fn encode_limits(l: &ChannelLimits) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&l.min_message_size.to_be_bytes());
    buf[4..8].copy_from_slice(&l.max_message_size.to_be_bytes());
    buf[8..12].copy_from_slice(&l.max_messages_in_memory.to_be_bytes());
    buf[12..16].copy_from_slice(&l.max_messages_on_disk.to_be_bytes());
    buf
}

fn decode_limits(buf: &[u8]) -> Option<ChannelLimits> {
    if buf.len() != 16 {
        return None;
    }
    Some(ChannelLimits {
        min_message_size: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
        max_message_size: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        max_messages_in_memory: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        max_messages_on_disk: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
    })
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(GROUPS_DIR))?;
        fs::create_dir_all(root.join("changes"))?;

        let settings_path = root.join(SETTINGS_DIR).join(SETTINGS_FILE);
        let max_threads = ((num_cpus::get() as f64) * 1.5).max(1.0) as u16;

        let settings = match fs::read(&settings_path).ok().and_then(|b| decode_settings(&b)) {
            Some(mut s) => {
                if s.count_threads < 1 || s.count_threads > max_threads {
                    s.count_threads = max_threads.max(1);
                }
                if s.port == 0 {
                    s.port = DEFAULT_PORT;
                }
                s
            }
            None => Settings {
                count_threads: max_threads.max(1),
                port: DEFAULT_PORT,
                master_password: [0u8; 32],
            },
        };
        atomic_write(&settings_path, &encode_settings(&settings))?;

        let store = Self {
            root,
            settings: RwLock::new(settings),
        };
        store.repair_channel_limits()?;
        Ok(store)
    }

    fn repair_channel_limits(&self) -> io::Result<()> {
        for group in self.list_groups() {
            for channel in self.list_channels(&group) {
                if let Some(limits) = self.get_direct_channel_limits(&group, &channel) {
                    let repaired = limits.repaired();
                    if repaired != limits {
                        self.write_channel_limits(&group, &channel, repaired)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ---- locked accessors (server-side) ----

    pub fn get_master_password(&self) -> Digest32 {
        self.settings.read().master_password
    }

    pub fn get_port(&self) -> u16 {
        self.settings.read().port
    }

    pub fn get_count_threads(&self) -> u16 {
        self.settings.read().count_threads
    }

    pub fn update_master_password(&self, digest: Digest32) -> io::Result<()> {
        let mut settings = self.settings.write();
        settings.master_password = digest;
        atomic_write(
            &self.root.join(SETTINGS_DIR).join(SETTINGS_FILE),
            &encode_settings(&settings),
        )
    }

    pub fn update_port(&self, port: u16) -> io::Result<()> {
        let port = if port == 0 { DEFAULT_PORT } else { port };
        let mut settings = self.settings.write();
        settings.port = port;
        atomic_write(
            &self.root.join(SETTINGS_DIR).join(SETTINGS_FILE),
            &encode_settings(&settings),
        )
    }

    pub fn update_count_threads(&self, count: u16) -> io::Result<()> {
        let max_threads = ((num_cpus::get() as f64) * 1.5).max(1.0) as u16;
        let count = count.clamp(1, max_threads.max(1));
        let mut settings = self.settings.write();
        settings.count_threads = count;
        atomic_write(
            &self.root.join(SETTINGS_DIR).join(SETTINGS_FILE),
            &encode_settings(&settings),
        )
    }

    // ---- direct accessors (admin surface) ----

    pub fn list_groups(&self) -> Vec<String> {
        list_dir_names(&self.root.join(GROUPS_DIR))
    }

    pub fn list_channels(&self, group: &str) -> Vec<String> {
        list_dir_names(&self.root.join(GROUPS_DIR).join(group))
            .into_iter()
            .collect()
    }

    pub fn list_consumers(&self, group: &str, channel: &str) -> Vec<String> {
        list_dir_names(&self.root.join(GROUPS_DIR).join(group).join(channel).join(CONSUMERS_DIR))
    }

    pub fn list_producers(&self, group: &str, channel: &str) -> Vec<String> {
        list_dir_names(&self.root.join(GROUPS_DIR).join(group).join(channel).join(PRODUCERS_DIR))
    }

    pub fn get_direct_group_password(&self, group: &str) -> Option<Digest32> {
        read_digest(&self.root.join(GROUPS_DIR).join(group).join(PASSWORD_FILE))
    }

    pub fn get_direct_consumer_password(&self, group: &str, channel: &str, login: &str) -> Option<Digest32> {
        read_digest(
            &self
                .root
                .join(GROUPS_DIR)
                .join(group)
                .join(channel)
                .join(CONSUMERS_DIR)
                .join(login)
                .join(PASSWORD_FILE),
        )
    }

    pub fn get_direct_producer_password(&self, group: &str, channel: &str, login: &str) -> Option<Digest32> {
        read_digest(
            &self
                .root
                .join(GROUPS_DIR)
                .join(group)
                .join(channel)
                .join(PRODUCERS_DIR)
                .join(login)
                .join(PASSWORD_FILE),
        )
    }

    pub fn get_direct_channel_limits(&self, group: &str, channel: &str) -> Option<ChannelLimits> {
        let path = self
            .root
            .join(GROUPS_DIR)
            .join(group)
            .join(channel)
            .join(CHANNEL_SETTINGS_FILE);
        fs::read(path).ok().and_then(|b| decode_limits(&b))
    }

    // ---- mutation (called only by the Changes applier) ----

    pub fn write_group_password(&self, group: &str, digest: Digest32) -> io::Result<()> {
        if !is_valid_name(group) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid group name"));
        }
        atomic_write(&self.root.join(GROUPS_DIR).join(group).join(PASSWORD_FILE), &digest)
    }

    pub fn remove_group_dir(&self, group: &str) -> io::Result<()> {
        let path = self.root.join(GROUPS_DIR).join(group);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn write_channel_limits(&self, group: &str, channel: &str, limits: ChannelLimits) -> io::Result<()> {
        if !is_valid_name(channel) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid channel name"));
        }
        atomic_write(
            &self.root.join(GROUPS_DIR).join(group).join(channel).join(CHANNEL_SETTINGS_FILE),
            &encode_limits(&limits),
        )
    }

    pub fn remove_channel_dir(&self, group: &str, channel: &str) -> io::Result<()> {
        let path = self.root.join(GROUPS_DIR).join(group).join(channel);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn write_consumer_password(&self, group: &str, channel: &str, login: &str, digest: Digest32) -> io::Result<()> {
        if !is_valid_name(login) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid login"));
        }
        atomic_write(
            &self
                .root
                .join(GROUPS_DIR)
                .join(group)
                .join(channel)
                .join(CONSUMERS_DIR)
                .join(login)
                .join(PASSWORD_FILE),
            &digest,
        )
    }

    pub fn write_producer_password(&self, group: &str, channel: &str, login: &str, digest: Digest32) -> io::Result<()> {
        if !is_valid_name(login) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid login"));
        }
        atomic_write(
            &self
                .root
                .join(GROUPS_DIR)
                .join(group)
                .join(channel)
                .join(PRODUCERS_DIR)
                .join(login)
                .join(PASSWORD_FILE),
            &digest,
        )
    }

    pub fn remove_consumer_dir(&self, group: &str, channel: &str, login: &str) -> io::Result<()> {
        let path = self.root.join(GROUPS_DIR).join(group).join(channel).join(CONSUMERS_DIR).join(login);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn remove_producer_dir(&self, group: &str, channel: &str, login: &str) -> io::Result<()> {
        let path = self.root.join(GROUPS_DIR).join(group).join(channel).join(PRODUCERS_DIR).join(login);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn changes_dir(&self) -> PathBuf {
        self.root.join("changes")
    }
}

fn list_dir_names(path: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| is_valid_name(name))
        .collect()
}

fn read_digest(path: &Path) -> Option<Digest32> {
    let data = fs::read(path).ok()?;
    if data.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&data);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boots_with_defaults_when_no_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.get_port(), DEFAULT_PORT);
        assert!(store.get_count_threads() >= 1);
    }

    #[test]
    fn group_password_roundtrips_through_direct_accessor() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let digest = [7u8; 32];
        store.write_group_password("acme", digest).unwrap();
        assert_eq!(store.get_direct_group_password("acme"), Some(digest));
    }

    #[test]
    fn invalid_port_falls_back_to_default_on_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.update_port(0).unwrap();
        assert_eq!(store.get_port(), DEFAULT_PORT);
    }

    #[test]
    fn channel_limits_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let limits = ChannelLimits {
            min_message_size: 1,
            max_message_size: 65536,
            max_messages_in_memory: 4,
            max_messages_on_disk: 0,
        };
        store.write_channel_limits("g", "c", limits).unwrap();
        assert_eq!(store.get_direct_channel_limits("g", "c"), Some(limits));
    }
}
