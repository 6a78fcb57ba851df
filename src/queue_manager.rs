//! Per-broker map of `group -> channel -> {consumers, producers, FIFO,
//! signals}`, delegating message storage and byte I/O to [`MessageBuffer`].
//! Locking nests strictly outside-in: groups, then a group's channels,
//! then a channel's consumers/producers/FIFO — matching the acquisition
//! order normative across the whole broker (see the concurrency model).

use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::message_buffer::{ChannelLimits, MessageBuffer, MessageId};

pub type Fd = RawFd;

struct Channel {
    messages: MessageBuffer,
    consumers: RwLock<HashMap<Fd, VecDeque<MessageId>>>,
    producers: RwLock<HashSet<Fd>>,
    q_list: RwLock<VecDeque<MessageId>>,
    signals: RwLock<HashMap<MessageId, u32>>,
}

struct Group {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

pub struct QueueManager {
    root: PathBuf,
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl QueueManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            groups: RwLock::new(HashMap::new()),
        }
    }

    fn group(&self, name: &str) -> Result<Arc<Group>> {
        self.groups
            .read()
            .get(name)
            .cloned()
            .ok_or(Error::NotFoundGroup)
    }

    fn channel(&self, group_name: &str, channel_name: &str) -> Result<Arc<Channel>> {
        let group = self.group(group_name)?;
        let channels = group.channels.read();
        channels
            .get(channel_name)
            .cloned()
            .ok_or(Error::NotFoundChannel)
    }

    // ---- topology ----

    pub fn add_group(&self, name: &str) -> Result<()> {
        let mut groups = self.groups.write();
        if groups.contains_key(name) {
            return Err(Error::DuplicateGroup);
        }
        groups.insert(
            name.to_string(),
            Arc::new(Group {
                channels: RwLock::new(HashMap::new()),
            }),
        );
        Ok(())
    }

    pub fn remove_group(&self, name: &str) {
        self.groups.write().remove(name);
    }

    pub fn add_channel(
        &self,
        group_name: &str,
        channel_name: &str,
        limits: ChannelLimits,
    ) -> Result<()> {
        let group = self.group(group_name)?;
        let mut channels = group.channels.write();
        if channels.contains_key(channel_name) {
            return Err(Error::DuplicateChannel);
        }
        let path = self.channel_path(group_name, channel_name);
        let messages = MessageBuffer::open(&path, limits).map_err(|_| Error::FsError)?;
        channels.insert(
            channel_name.to_string(),
            Arc::new(Channel {
                messages,
                consumers: RwLock::new(HashMap::new()),
                producers: RwLock::new(HashSet::new()),
                q_list: RwLock::new(VecDeque::new()),
                signals: RwLock::new(HashMap::new()),
            }),
        );
        Ok(())
    }

    fn channel_path(&self, group_name: &str, channel_name: &str) -> PathBuf {
        self.root.join("groups").join(group_name).join(channel_name)
    }

    pub fn update_channel_limits(
        &self,
        group_name: &str,
        channel_name: &str,
        limits: ChannelLimits,
    ) -> Result<()> {
        let channel = self.channel(group_name, channel_name)?;
        channel.messages.update_limits(limits);
        Ok(())
    }

    pub fn remove_channel(&self, group_name: &str, channel_name: &str) {
        if let Ok(group) = self.group(group_name) {
            group.channels.write().remove(channel_name);
        }
    }

    // ---- membership ----

    pub fn join_consumer(&self, group_name: &str, channel_name: &str, fd: Fd) -> Result<()> {
        let channel = self.channel(group_name, channel_name)?;
        let mut consumers = channel.consumers.write();
        if consumers.contains_key(&fd) {
            return Err(Error::DuplicateConsumer);
        }
        consumers.insert(fd, VecDeque::new());
        Ok(())
    }

    pub fn leave_consumer(&self, group_name: &str, channel_name: &str, fd: Fd) {
        let Ok(channel) = self.channel(group_name, channel_name) else {
            return;
        };
        let mut consumers = channel.consumers.write();
        let Some(pending) = consumers.remove(&fd) else {
            return;
        };
        let mut signals = channel.signals.write();
        for id in pending {
            if let Some(count) = signals.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    signals.remove(&id);
                    channel.messages.free(id);
                }
            }
        }
    }

    pub fn join_producer(&self, group_name: &str, channel_name: &str, fd: Fd) -> Result<()> {
        let channel = self.channel(group_name, channel_name)?;
        let mut producers = channel.producers.write();
        if !producers.insert(fd) {
            return Err(Error::DuplicateProducer);
        }
        Ok(())
    }

    pub fn leave_producer(&self, group_name: &str, channel_name: &str, fd: Fd) {
        if let Ok(channel) = self.channel(group_name, channel_name) {
            channel.producers.write().remove(&fd);
        }
    }

    // ---- message lifecycle ----

    fn check_producer(channel: &Channel, fd: Fd) -> Result<()> {
        if channel.producers.read().contains(&fd) {
            Ok(())
        } else {
            Err(Error::NotFoundProducer)
        }
    }

    fn check_consumer(channel: &Channel, fd: Fd) -> Result<()> {
        if channel.consumers.read().contains_key(&fd) {
            Ok(())
        } else {
            Err(Error::NotFoundConsumer)
        }
    }

    pub fn create_for_queue(
        &self,
        group_name: &str,
        channel_name: &str,
        fd: Fd,
        length: u32,
    ) -> Result<(MessageId, String)> {
        let channel = self.channel(group_name, channel_name)?;
        Self::check_producer(&channel, fd)?;
        channel.messages.add_for_queue(length)
    }

    pub fn create_for_broadcast(
        &self,
        group_name: &str,
        channel_name: &str,
        fd: Fd,
        length: u32,
    ) -> Result<MessageId> {
        let channel = self.channel(group_name, channel_name)?;
        Self::check_producer(&channel, fd)?;
        channel.messages.add_for_broadcast(length)
    }

    pub fn create_for_replication(
        &self,
        group_name: &str,
        channel_name: &str,
        fd: Fd,
        length: u32,
        uuid: &str,
    ) -> Result<MessageId> {
        let channel = self.channel(group_name, channel_name)?;
        Self::check_producer(&channel, fd)?;
        channel.messages.add_for_replication(length, uuid)
    }

    pub fn remove_message(&self, group_name: &str, channel_name: &str, fd: Fd, id: MessageId) {
        let Ok(channel) = self.channel(group_name, channel_name) else {
            return;
        };
        let is_consumer = channel.consumers.read().contains_key(&fd);
        let is_producer = channel.producers.read().contains(&fd);
        if !is_consumer && !is_producer {
            return;
        }

        if is_consumer {
            let mut signals = channel.signals.write();
            if let Some(count) = signals.get_mut(&id) {
                *count -= 1;
                if *count != 0 {
                    return;
                }
                signals.remove(&id);
            }
        }

        channel.messages.free(id);
    }

    /// Terminal ack for a queued delivery: the message was already popped
    /// off the FIFO (see `pop_message`), so acking it just frees storage.
    /// Idempotent: an unknown or already-freed uuid is a no-op.
    pub fn remove_message_by_uuid(
        &self,
        group_name: &str,
        channel_name: &str,
        fd: Fd,
        uuid: &str,
    ) {
        let Ok(channel) = self.channel(group_name, channel_name) else {
            return;
        };
        if !channel.consumers.read().contains_key(&fd) {
            return;
        }
        channel.messages.free_by_uuid(uuid);
    }

    // ---- transfer ----

    pub fn recv(&self, group_name: &str, channel_name: &str, fd: Fd, id: MessageId) -> Result<u32> {
        let channel = self.channel(group_name, channel_name)?;
        Self::check_producer(&channel, fd)?;
        channel.messages.recv(id, fd)
    }

    pub fn send(
        &self,
        group_name: &str,
        channel_name: &str,
        fd: Fd,
        id: MessageId,
        offset: u32,
    ) -> Result<u32> {
        let channel = self.channel(group_name, channel_name)?;
        Self::check_consumer(&channel, fd)?;
        channel.messages.send(id, fd, offset)
    }

    pub fn is_full_part(&self, group_name: &str, channel_name: &str, id: MessageId) -> bool {
        match self.channel(group_name, channel_name) {
            Ok(channel) => channel.messages.is_full_part(id),
            Err(_) => true,
        }
    }

    pub fn length(&self, group_name: &str, channel_name: &str, id: MessageId) -> u32 {
        match self.channel(group_name, channel_name) {
            Ok(channel) => channel.messages.get_length(id),
            Err(_) => 0,
        }
    }

    // ---- queued/broadcast dispatch ----

    pub fn push_message(
        &self,
        group_name: &str,
        channel_name: &str,
        fd: Fd,
        id: MessageId,
    ) -> Result<()> {
        let channel = self.channel(group_name, channel_name)?;
        Self::check_producer(&channel, fd)?;

        match channel.messages.get_uuid(id) {
            Some(_uuid) => {
                channel.q_list.write().push_back(id);
            }
            None => {
                let mut consumers = channel.consumers.write();
                if consumers.is_empty() {
                    channel.messages.free(id);
                } else {
                    for pending in consumers.values_mut() {
                        pending.push_back(id);
                    }
                    channel.signals.write().insert(id, consumers.len() as u32);
                }
            }
        }
        Ok(())
    }

    /// Priority order: a pending broadcast message private to this fd,
    /// then the channel FIFO head. Returns `None` if neither is available.
    ///
    /// A broadcast delivery has no separate client ack: "no acknowledgment
    /// required beyond delivery" means the pop itself is the ack, so the
    /// signal counter is decremented (and the message freed at zero) right
    /// here rather than waiting for a `remove_message` call.
    pub fn pop_message(
        &self,
        group_name: &str,
        channel_name: &str,
        fd: Fd,
    ) -> Result<Option<(MessageId, u32, Option<String>)>> {
        let channel = self.channel(group_name, channel_name)?;
        Self::check_consumer(&channel, fd)?;

        let popped = {
            let mut consumers = channel.consumers.write();
            let pending = consumers.get_mut(&fd).expect("checked above");
            pending.pop_front()
        };
        if let Some(id) = popped {
            let length = channel.messages.get_length(id);
            let mut signals = channel.signals.write();
            if let Some(count) = signals.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    signals.remove(&id);
                    channel.messages.free(id);
                }
            }
            return Ok(Some((id, length, None)));
        }

        let mut q_list = channel.q_list.write();
        if let Some(id) = q_list.pop_front() {
            let length = channel.messages.get_length(id);
            let uuid = channel.messages.get_uuid(id);
            return Ok(Some((id, length, uuid)));
        }

        Ok(None)
    }

    /// Returns a queued message to the FIFO head; used on consumer-side
    /// error or disconnect. No-op for broadcast (non-UUID) messages.
    pub fn revert_message(&self, group_name: &str, channel_name: &str, fd: Fd, id: MessageId) {
        let Ok(channel) = self.channel(group_name, channel_name) else {
            return;
        };
        if !channel.consumers.read().contains_key(&fd) {
            return;
        }
        if channel.messages.get_uuid(id).is_none() {
            return;
        }
        channel.q_list.write().push_front(id);
    }

    /// Administrative drain: empties every consumer's pending list, the
    /// FIFO, and the signal table, releasing every outstanding message.
    pub fn clear_q(&self, group_name: &str, channel_name: &str) {
        let Ok(channel) = self.channel(group_name, channel_name) else {
            return;
        };
        for pending in channel.consumers.write().values_mut() {
            pending.clear();
        }
        channel.q_list.write().clear();
        channel.signals.write().clear();
        channel.messages.clear();
    }
}

/// Directory under the broker root where a channel's on-disk overflow
/// file lives; exposed so `Initialization`/`Store` can agree with
/// `QueueManager` on layout without importing each other's internals.
pub fn channel_content_dir(root: &Path, group_name: &str, channel_name: &str) -> PathBuf {
    root.join("groups").join(group_name).join(channel_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(mem: u32, disk: u32) -> ChannelLimits {
        ChannelLimits {
            min_message_size: 1,
            max_message_size: 65536,
            max_messages_in_memory: mem,
            max_messages_on_disk: disk,
        }
    }

    fn setup(qm: &QueueManager, mem: u32, disk: u32) {
        qm.add_group("g").unwrap();
        qm.add_channel("g", "c", limits(mem, disk)).unwrap();
    }

    /// S1 — queued delivery: single producer, single consumer, FIFO empty
    /// and capacity released after the consumer's terminal ack.
    #[test]
    fn queued_delivery_round_trips_and_frees_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        setup(&qm, 4, 0);
        qm.join_producer("g", "c", 1).unwrap();
        qm.join_consumer("g", "c", 2).unwrap();

        let (id, uuid) = qm.create_for_queue("g", "c", 1, 11).unwrap();
        qm.push_message("g", "c", 1, id).unwrap();

        let (popped_id, length, popped_uuid) = qm.pop_message("g", "c", 2).unwrap().unwrap();
        assert_eq!(popped_id, id);
        assert_eq!(length, 11);
        assert_eq!(popped_uuid.as_deref(), Some(uuid.as_str()));

        // No second message queued.
        assert!(qm.pop_message("g", "c", 2).unwrap().is_none());

        qm.remove_message_by_uuid("g", "c", 2, &uuid);
        // Capacity freed: a fresh producer message of the same size succeeds
        // (ids may be recycled from the free list, so only the Ok matters).
        assert!(qm.create_for_queue("g", "c", 1, 11).is_ok());
    }

    /// S2 — broadcast fanout: delivered to exactly the consumers joined at
    /// push time, each exactly once, freed once every signal is consumed.
    #[test]
    fn broadcast_fanout_reaches_every_joined_consumer_once() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        setup(&qm, 4, 0);
        qm.join_producer("g", "c", 1).unwrap();
        qm.join_consumer("g", "c", 2).unwrap();
        qm.join_consumer("g", "c", 3).unwrap();

        let id = qm.create_for_broadcast("g", "c", 1, 3).unwrap();
        qm.push_message("g", "c", 1, id).unwrap();

        let (id_a, _, uuid_a) = qm.pop_message("g", "c", 2).unwrap().unwrap();
        let (id_b, _, uuid_b) = qm.pop_message("g", "c", 3).unwrap().unwrap();
        assert_eq!(id_a, id);
        assert_eq!(id_b, id);
        assert!(uuid_a.is_none() && uuid_b.is_none());

        // Each consumer only sees it once.
        assert!(qm.pop_message("g", "c", 2).unwrap().is_none());
        assert!(qm.pop_message("g", "c", 3).unwrap().is_none());

        // Both acked via pop (broadcast needs no further ack); capacity freed.
        assert!(qm.create_for_broadcast("g", "c", 1, 3).is_ok());
    }

    /// A late joiner never sees a broadcast pushed before it joined.
    #[test]
    fn broadcast_excludes_consumers_joining_after_push() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        setup(&qm, 4, 0);
        qm.join_producer("g", "c", 1).unwrap();
        qm.join_consumer("g", "c", 2).unwrap();

        let id = qm.create_for_broadcast("g", "c", 1, 3).unwrap();
        qm.push_message("g", "c", 1, id).unwrap();

        qm.join_consumer("g", "c", 3).unwrap();
        assert!(qm.pop_message("g", "c", 3).unwrap().is_none());
        assert!(qm.pop_message("g", "c", 2).unwrap().is_some());
    }

    /// A broadcast pushed with no joined consumers is freed immediately.
    #[test]
    fn broadcast_with_no_consumers_frees_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        setup(&qm, 1, 0);
        qm.join_producer("g", "c", 1).unwrap();

        let id = qm.create_for_broadcast("g", "c", 1, 3).unwrap();
        qm.push_message("g", "c", 1, id).unwrap();

        // Capacity (max_messages_in_memory=1) was freed by the push with
        // no consumers, so a second message fits.
        assert!(qm.create_for_broadcast("g", "c", 1, 3).is_ok());
    }

    /// S3 — capacity: a second create fails once both quotas saturate,
    /// and succeeds again once the first message is freed.
    #[test]
    fn create_fails_with_exceed_limit_once_saturated() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        setup(&qm, 1, 0);
        qm.join_producer("g", "c", 1).unwrap();

        let (id, _) = qm.create_for_queue("g", "c", 1, 10).unwrap();
        assert_eq!(
            qm.create_for_queue("g", "c", 1, 10).unwrap_err(),
            Error::ExceedLimit
        );

        qm.remove_message("g", "c", 1, id);
        assert!(qm.create_for_queue("g", "c", 1, 10).is_ok());
    }

    /// S4 — consumer disconnect mid-pop reverts a queued message to the
    /// FIFO head so the next popper sees it from the start.
    #[test]
    fn revert_returns_queued_message_to_fifo_head() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        setup(&qm, 4, 0);
        qm.join_producer("g", "c", 1).unwrap();
        qm.join_consumer("g", "c", 2).unwrap();
        qm.join_consumer("g", "c", 3).unwrap();

        let (id, _) = qm.create_for_queue("g", "c", 1, 100).unwrap();
        qm.push_message("g", "c", 1, id).unwrap();

        let (popped, _, uuid) = qm.pop_message("g", "c", 2).unwrap().unwrap();
        assert_eq!(popped, id);
        // Controller rolls back in this order on disconnect: revert the
        // in-flight message first, then tear down the consumer's membership.
        qm.revert_message("g", "c", 2, id);
        qm.leave_consumer("g", "c", 2);

        let (popped2, length2, uuid2) = qm.pop_message("g", "c", 3).unwrap().unwrap();
        assert_eq!(popped2, id);
        assert_eq!(length2, 100);
        assert_eq!(uuid2, uuid);
    }

    /// Queue FIFO ordering: messages pop in push order regardless of which
    /// consumer happens to pop next.
    #[test]
    fn fifo_preserves_push_order_across_competing_consumers() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        setup(&qm, 8, 0);
        qm.join_producer("g", "c", 1).unwrap();
        qm.join_consumer("g", "c", 2).unwrap();

        let (id1, _) = qm.create_for_queue("g", "c", 1, 5).unwrap();
        qm.push_message("g", "c", 1, id1).unwrap();
        let (id2, _) = qm.create_for_queue("g", "c", 1, 5).unwrap();
        qm.push_message("g", "c", 1, id2).unwrap();

        let (first, _, _) = qm.pop_message("g", "c", 2).unwrap().unwrap();
        let (second, _, _) = qm.pop_message("g", "c", 2).unwrap().unwrap();
        assert_eq!(first, id1);
        assert_eq!(second, id2);
    }

    /// S7 — replication idempotence: a duplicate UUID is rejected even
    /// across an intervening broadcast on the same channel.
    #[test]
    fn replication_rejects_duplicate_uuid_even_after_intervening_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        setup(&qm, 8, 0);
        qm.join_producer("g", "c", 1).unwrap();

        qm.create_for_replication("g", "c", 1, 5, "peer-uuid").unwrap();
        let bid = qm.create_for_broadcast("g", "c", 1, 5).unwrap();
        qm.push_message("g", "c", 1, bid).unwrap();

        assert_eq!(
            qm.create_for_replication("g", "c", 1, 5, "peer-uuid").unwrap_err(),
            Error::DuplicateUuid
        );
    }

    #[test]
    fn push_and_pop_require_membership() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        setup(&qm, 4, 0);
        assert_eq!(
            qm.create_for_queue("g", "c", 99, 5).unwrap_err(),
            Error::NotFoundProducer
        );
        assert_eq!(
            qm.pop_message("g", "c", 99).unwrap_err(),
            Error::NotFoundConsumer
        );
    }

    #[test]
    fn unknown_group_or_channel_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let qm = QueueManager::new(dir.path());
        assert_eq!(qm.add_channel("g", "c", limits(1, 0)).unwrap_err(), Error::NotFoundGroup);
        setup(&qm, 1, 0);
        assert_eq!(
            qm.join_consumer("g", "missing", 1).unwrap_err(),
            Error::NotFoundChannel
        );
    }
}
