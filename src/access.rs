//! Hierarchical credential + session directory: root -> group -> channel
//! -> {consumer, producer}. Each level owns an authenticated-sessions set
//! keyed by fd; a password update at any level invalidates every live
//! session bound to that name.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub type Fd = RawFd;
pub type Digest32 = [u8; 32];

pub fn hash_password(password: &str) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Compares in constant time with respect to digest content (not length,
/// which is fixed at 32 bytes for every caller).
fn digests_equal(a: &Digest32, b: &Digest32) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

struct UserEntry {
    password: Digest32,
    sessions: HashSet<Fd>,
}

impl UserEntry {
    fn new(password: Digest32) -> Self {
        Self {
            password,
            sessions: HashSet::new(),
        }
    }
}

struct ChannelEntry {
    consumers: HashMap<String, UserEntry>,
    producers: HashMap<String, UserEntry>,
    consumer_sessions: HashSet<Fd>,
    producer_sessions: HashSet<Fd>,
}

impl ChannelEntry {
    fn new() -> Self {
        Self {
            consumers: HashMap::new(),
            producers: HashMap::new(),
            consumer_sessions: HashSet::new(),
            producer_sessions: HashSet::new(),
        }
    }
}

struct GroupEntry {
    password: RwLock<Digest32>,
    sessions: RwLock<HashSet<Fd>>,
    channels: RwLock<HashMap<String, ChannelEntry>>,
}

pub struct Access {
    master_password: RwLock<Digest32>,
    groups: RwLock<HashMap<String, Arc<GroupEntry>>>,
}

impl Access {
    pub fn new() -> Self {
        Self {
            master_password: RwLock::new([0u8; 32]),
            groups: RwLock::new(HashMap::new()),
        }
    }

    fn group(&self, name: &str) -> Result<Arc<GroupEntry>> {
        self.groups
            .read()
            .get(name)
            .cloned()
            .ok_or(Error::NotFoundGroup)
    }

    // ---- topology ----

    pub fn set_master_password(&self, digest: Digest32) {
        *self.master_password.write() = digest;
    }

    pub fn add_group(&self, name: &str, password: Digest32) -> Result<()> {
        let mut groups = self.groups.write();
        if groups.contains_key(name) {
            return Err(Error::DuplicateGroup);
        }
        groups.insert(
            name.to_string(),
            Arc::new(GroupEntry {
                password: RwLock::new(password),
                sessions: RwLock::new(HashSet::new()),
                channels: RwLock::new(HashMap::new()),
            }),
        );
        Ok(())
    }

    pub fn update_group_password(&self, name: &str, password: Digest32) -> Result<()> {
        let group = self.group(name)?;
        *group.password.write() = password;
        group.sessions.write().clear();
        Ok(())
    }

    pub fn remove_group(&self, name: &str) {
        self.groups.write().remove(name);
    }

    pub fn add_channel(&self, group_name: &str, channel_name: &str) -> Result<()> {
        let group = self.group(group_name)?;
        let mut channels = group.channels.write();
        if channels.contains_key(channel_name) {
            return Err(Error::DuplicateChannel);
        }
        channels.insert(channel_name.to_string(), ChannelEntry::new());
        Ok(())
    }

    pub fn remove_channel(&self, group_name: &str, channel_name: &str) {
        if let Ok(group) = self.group(group_name) {
            group.channels.write().remove(channel_name);
        }
    }

    fn with_channel_mut<R>(
        &self,
        group_name: &str,
        channel_name: &str,
        f: impl FnOnce(&mut ChannelEntry) -> Result<R>,
    ) -> Result<R> {
        let group = self.group(group_name)?;
        let mut channels = group.channels.write();
        let channel = channels.get_mut(channel_name).ok_or(Error::NotFoundChannel)?;
        f(channel)
    }

    pub fn add_consumer(
        &self,
        group_name: &str,
        channel_name: &str,
        login: &str,
        password: Digest32,
    ) -> Result<()> {
        self.with_channel_mut(group_name, channel_name, |channel| {
            if channel.consumers.contains_key(login) {
                return Err(Error::DuplicateConsumer);
            }
            channel.consumers.insert(login.to_string(), UserEntry::new(password));
            Ok(())
        })
    }

    pub fn add_producer(
        &self,
        group_name: &str,
        channel_name: &str,
        login: &str,
        password: Digest32,
    ) -> Result<()> {
        self.with_channel_mut(group_name, channel_name, |channel| {
            if channel.producers.contains_key(login) {
                return Err(Error::DuplicateProducer);
            }
            channel.producers.insert(login.to_string(), UserEntry::new(password));
            Ok(())
        })
    }

    pub fn update_consumer_password(
        &self,
        group_name: &str,
        channel_name: &str,
        login: &str,
        password: Digest32,
    ) -> Result<()> {
        self.with_channel_mut(group_name, channel_name, |channel| {
            let user = channel
                .consumers
                .get_mut(login)
                .ok_or(Error::NotFoundConsumer)?;
            user.password = password;
            for fd in user.sessions.drain() {
                channel.consumer_sessions.remove(&fd);
            }
            Ok(())
        })
    }

    pub fn update_producer_password(
        &self,
        group_name: &str,
        channel_name: &str,
        login: &str,
        password: Digest32,
    ) -> Result<()> {
        self.with_channel_mut(group_name, channel_name, |channel| {
            let user = channel
                .producers
                .get_mut(login)
                .ok_or(Error::NotFoundProducer)?;
            user.password = password;
            for fd in user.sessions.drain() {
                channel.producer_sessions.remove(&fd);
            }
            Ok(())
        })
    }

    pub fn remove_consumer(&self, group_name: &str, channel_name: &str, login: &str) {
        let _ = self.with_channel_mut(group_name, channel_name, |channel| {
            if let Some(user) = channel.consumers.remove(login) {
                for fd in user.sessions {
                    channel.consumer_sessions.remove(&fd);
                }
            }
            Ok(())
        });
    }

    pub fn remove_producer(&self, group_name: &str, channel_name: &str, login: &str) {
        let _ = self.with_channel_mut(group_name, channel_name, |channel| {
            if let Some(user) = channel.producers.remove(login) {
                for fd in user.sessions {
                    channel.producer_sessions.remove(&fd);
                }
            }
            Ok(())
        });
    }

    // ---- authentication ----

    pub fn auth_master(&self, password: &str) -> bool {
        digests_equal(&hash_password(password), &self.master_password.read())
    }

    pub fn auth_group(&self, name: &str, password: &str, fd: Fd) -> Result<()> {
        let group = self.group(name)?;
        if !digests_equal(&hash_password(password), &group.password.read()) {
            return Err(Error::WrongPassword);
        }
        let mut sessions = group.sessions.write();
        if !sessions.insert(fd) {
            return Err(Error::DuplicateSession);
        }
        Ok(())
    }

    pub fn auth_consumer(
        &self,
        group_name: &str,
        channel_name: &str,
        login: &str,
        password: &str,
        fd: Fd,
    ) -> Result<()> {
        self.with_channel_mut(group_name, channel_name, |channel| {
            let user = channel
                .consumers
                .get_mut(login)
                .ok_or(Error::NotFoundConsumer)?;
            if !digests_equal(&hash_password(password), &user.password) {
                return Err(Error::WrongPassword);
            }
            if !user.sessions.insert(fd) {
                return Err(Error::DuplicateSession);
            }
            channel.consumer_sessions.insert(fd);
            Ok(())
        })
    }

    pub fn auth_producer(
        &self,
        group_name: &str,
        channel_name: &str,
        login: &str,
        password: &str,
        fd: Fd,
    ) -> Result<()> {
        self.with_channel_mut(group_name, channel_name, |channel| {
            let user = channel
                .producers
                .get_mut(login)
                .ok_or(Error::NotFoundProducer)?;
            if !digests_equal(&hash_password(password), &user.password) {
                return Err(Error::WrongPassword);
            }
            if !user.sessions.insert(fd) {
                return Err(Error::DuplicateSession);
            }
            channel.producer_sessions.insert(fd);
            Ok(())
        })
    }

    // ---- logout (tolerant) ----

    pub fn logout_group(&self, name: &str, fd: Fd) {
        if let Ok(group) = self.group(name) {
            group.sessions.write().remove(&fd);
        }
    }

    pub fn logout_consumer(&self, group_name: &str, channel_name: &str, login: &str, fd: Fd) {
        let _ = self.with_channel_mut(group_name, channel_name, |channel| {
            if let Some(user) = channel.consumers.get_mut(login) {
                user.sessions.remove(&fd);
            }
            channel.consumer_sessions.remove(&fd);
            Ok(())
        });
    }

    pub fn logout_producer(&self, group_name: &str, channel_name: &str, login: &str, fd: Fd) {
        let _ = self.with_channel_mut(group_name, channel_name, |channel| {
            if let Some(user) = channel.producers.get_mut(login) {
                user.sessions.remove(&fd);
            }
            channel.producer_sessions.remove(&fd);
            Ok(())
        });
    }

    // ---- authorization checks ----

    pub fn check_group_session(&self, group_name: &str, fd: Fd) -> Result<()> {
        let group = self.group(group_name)?;
        if group.sessions.read().contains(&fd) {
            Ok(())
        } else {
            Err(Error::NotFoundSession)
        }
    }

    pub fn check_pop_message(&self, group_name: &str, channel_name: &str, fd: Fd) -> Result<()> {
        let group = self.group(group_name)?;
        let channels = group.channels.read();
        let channel = channels.get(channel_name).ok_or(Error::NotFoundChannel)?;
        if channel.consumer_sessions.contains(&fd) {
            Ok(())
        } else {
            Err(Error::NotFoundSession)
        }
    }

    pub fn check_push_message(&self, group_name: &str, channel_name: &str, fd: Fd) -> Result<()> {
        let group = self.group(group_name)?;
        let channels = group.channels.read();
        let channel = channels.get(channel_name).ok_or(Error::NotFoundChannel)?;
        if channel.producer_sessions.contains(&fd) {
            Ok(())
        } else {
            Err(Error::NotFoundSession)
        }
    }

    /// Every group-role topology/management command (update own password,
    /// list members, get/set channel limits) that doesn't also need an
    /// existence check gates on this alone: a live session at the group
    /// level for this fd.
    pub fn check_group_admin(&self, group_name: &str, fd: Fd) -> Result<()> {
        self.check_group_session(group_name, fd)
    }

    pub fn check_update_own_consumer_password(
        &self,
        group_name: &str,
        channel_name: &str,
        fd: Fd,
    ) -> Result<()> {
        self.check_pop_message(group_name, channel_name, fd)
    }

    pub fn check_update_own_producer_password(
        &self,
        group_name: &str,
        channel_name: &str,
        fd: Fd,
    ) -> Result<()> {
        self.check_push_message(group_name, channel_name, fd)
    }

    pub fn check_create_channel(&self, group_name: &str, channel_name: &str, fd: Fd) -> Result<()> {
        let group = self.group(group_name)?;
        if !group.sessions.read().contains(&fd) {
            return Err(Error::NotFoundSession);
        }
        if group.channels.read().contains_key(channel_name) {
            return Err(Error::DuplicateChannel);
        }
        Ok(())
    }

    pub fn check_update_channel_limits(&self, group_name: &str, channel_name: &str, fd: Fd) -> Result<()> {
        self.check_group_session(group_name, fd)?;
        self.with_channel_mut(group_name, channel_name, |_| Ok(()))
    }

    pub fn check_remove_channel(&self, group_name: &str, channel_name: &str, fd: Fd) -> Result<()> {
        self.check_update_channel_limits(group_name, channel_name, fd)
    }

    pub fn check_add_consumer(&self, group_name: &str, channel_name: &str, login: &str, fd: Fd) -> Result<()> {
        self.check_group_session(group_name, fd)?;
        self.with_channel_mut(group_name, channel_name, |channel| {
            if channel.consumers.contains_key(login) {
                return Err(Error::DuplicateConsumer);
            }
            Ok(())
        })
    }

    pub fn check_add_producer(&self, group_name: &str, channel_name: &str, login: &str, fd: Fd) -> Result<()> {
        self.check_group_session(group_name, fd)?;
        self.with_channel_mut(group_name, channel_name, |channel| {
            if channel.producers.contains_key(login) {
                return Err(Error::DuplicateProducer);
            }
            Ok(())
        })
    }

    pub fn check_manage_consumer(&self, group_name: &str, channel_name: &str, login: &str, fd: Fd) -> Result<()> {
        self.check_group_session(group_name, fd)?;
        self.with_channel_mut(group_name, channel_name, |channel| {
            if channel.consumers.contains_key(login) {
                Ok(())
            } else {
                Err(Error::NotFoundConsumer)
            }
        })
    }

    pub fn check_manage_producer(&self, group_name: &str, channel_name: &str, login: &str, fd: Fd) -> Result<()> {
        self.check_group_session(group_name, fd)?;
        self.with_channel_mut(group_name, channel_name, |channel| {
            if channel.producers.contains_key(login) {
                Ok(())
            } else {
                Err(Error::NotFoundProducer)
            }
        })
    }
}

impl Default for Access {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_twice_on_same_fd_is_duplicate_session() {
        let access = Access::new();
        access.add_group("g", hash_password("pw")).unwrap();
        access.auth_group("g", "pw", 7).unwrap();
        assert_eq!(access.auth_group("g", "pw", 7).unwrap_err(), Error::DuplicateSession);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let access = Access::new();
        access.add_group("g", hash_password("pw")).unwrap();
        assert_eq!(access.auth_group("g", "nope", 7).unwrap_err(), Error::WrongPassword);
    }

    #[test]
    fn password_change_invalidates_existing_session() {
        let access = Access::new();
        access.add_group("g", hash_password("pw")).unwrap();
        access.add_channel("g", "c").unwrap();
        access
            .add_consumer("g", "c", "u", hash_password("pw"))
            .unwrap();
        access.auth_consumer("g", "c", "u", "pw", 7).unwrap();
        access.check_pop_message("g", "c", 7).unwrap();

        access
            .update_consumer_password("g", "c", "u", hash_password("pw2"))
            .unwrap();
        assert_eq!(
            access.check_pop_message("g", "c", 7).unwrap_err(),
            Error::NotFoundSession
        );
    }

    #[test]
    fn check_gates_on_live_session_at_the_right_level() {
        let access = Access::new();
        access.add_group("g", hash_password("pw")).unwrap();
        access.add_channel("g", "c").unwrap();
        access
            .add_producer("g", "c", "p", hash_password("pw"))
            .unwrap();
        assert_eq!(
            access.check_push_message("g", "c", 1).unwrap_err(),
            Error::NotFoundSession
        );
        access.auth_producer("g", "c", "p", "pw", 1).unwrap();
        access.check_push_message("g", "c", 1).unwrap();
    }
}
