//! Append-only journal of configuration mutations. `push` is the durable,
//! synchronous path used by authenticated sessions (flush-then-enqueue);
//! `push_deferred` appends without an fsync, for the admin surface batching
//! several edits before they land durably. `pop` is the applier's way to
//! read the queue — see [`crate::initialization`] for the single consumer.
//!
//! The on-disk backing is a flat, length-prefixed append file, and it is
//! also the only channel between the running server and a separate
//! `simq-server manager` invocation: the two are different processes, so
//! an in-memory `crossbeam_channel` can't carry edits between them. Every
//! write — durable or deferred — lands in the file; [`Changes::poll_disk`]
//! lets the applier pick up bytes appended by someone else's `Changes`
//! handle on the same journal without a dedicated file-watcher. On boot,
//! [`Changes::open`] reads back whatever was already in the file (entries
//! that were pushed but never reached the applier before a crash) and
//! hands them to the caller to replay before the server otherwise
//! reconstructs in-memory state from `Store` — this is what makes
//! `push`'s durability promise hold across a crash.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::access::Digest32;
use crate::message_buffer::ChannelLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Root,
    Group,
    Consumer,
    Producer,
}

impl Initiator {
    fn tag(self) -> u8 {
        match self {
            Initiator::Root => 0,
            Initiator::Group => 1,
            Initiator::Consumer => 2,
            Initiator::Producer => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Initiator::Root),
            1 => Some(Initiator::Group),
            2 => Some(Initiator::Consumer),
            3 => Some(Initiator::Producer),
            _ => None,
        }
    }
}

impl std::fmt::Display for Initiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Initiator::Root => "root",
            Initiator::Group => "group",
            Initiator::Consumer => "consumer",
            Initiator::Producer => "producer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    AddGroup { group: String, password: Digest32 },
    UpdateGroupPassword { group: String, password: Digest32 },
    RemoveGroup { group: String },
    AddChannel { group: String, channel: String, limits: ChannelLimits },
    UpdateChannelLimits { group: String, channel: String, limits: ChannelLimits },
    RemoveChannel { group: String, channel: String },
    AddConsumer { group: String, channel: String, login: String, password: Digest32 },
    UpdateConsumerPassword { group: String, channel: String, login: String, password: Digest32 },
    RemoveConsumer { group: String, channel: String, login: String },
    AddProducer { group: String, channel: String, login: String, password: Digest32 },
    UpdateProducerPassword { group: String, channel: String, login: String, password: Digest32 },
    RemoveProducer { group: String, channel: String, login: String },
    UpdateMasterPassword { password: Digest32 },
    UpdatePort { port: u16 },
    UpdateCountThreads { count: u16 },
}

impl Change {
    /// Short operation tag for the logger taxonomy (§4.9).
    pub fn operation(&self) -> &'static str {
        match self {
            Change::AddGroup { .. } => "add_group",
            Change::UpdateGroupPassword { .. } => "update_group_password",
            Change::RemoveGroup { .. } => "remove_group",
            Change::AddChannel { .. } => "add_channel",
            Change::UpdateChannelLimits { .. } => "update_channel_limits",
            Change::RemoveChannel { .. } => "remove_channel",
            Change::AddConsumer { .. } => "add_consumer",
            Change::UpdateConsumerPassword { .. } => "update_consumer_password",
            Change::RemoveConsumer { .. } => "remove_consumer",
            Change::AddProducer { .. } => "add_producer",
            Change::UpdateProducerPassword { .. } => "update_producer_password",
            Change::RemoveProducer { .. } => "remove_producer",
            Change::UpdateMasterPassword { .. } => "update_master_password",
            Change::UpdatePort { .. } => "update_port",
            Change::UpdateCountThreads { .. } => "update_count_threads",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub change: Change,
    pub initiator: Initiator,
    pub identity: String,
    pub ip: String,
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn write_digest(buf: &mut Vec<u8>, d: &Digest32) {
    buf.extend_from_slice(d);
}

fn write_limits(buf: &mut Vec<u8>, l: &ChannelLimits) {
    buf.extend_from_slice(&l.min_message_size.to_be_bytes());
    buf.extend_from_slice(&l.max_message_size.to_be_bytes());
    buf.extend_from_slice(&l.max_messages_in_memory.to_be_bytes());
    buf.extend_from_slice(&l.max_messages_on_disk.to_be_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_str(&mut self) -> Option<String> {
        let len = self.read_u32()? as usize;
        let s = std::str::from_utf8(self.buf.get(self.pos..self.pos + len)?).ok()?.to_string();
        self.pos += len;
        Some(s)
    }

    fn read_u32(&mut self) -> Option<u32> {
        let b = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes(b.try_into().unwrap()))
    }

    fn read_u16(&mut self) -> Option<u16> {
        let b = self.buf.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_be_bytes(b.try_into().unwrap()))
    }

    fn read_digest(&mut self) -> Option<Digest32> {
        let b = self.buf.get(self.pos..self.pos + 32)?;
        self.pos += 32;
        let mut out = [0u8; 32];
        out.copy_from_slice(b);
        Some(out)
    }

    fn read_limits(&mut self) -> Option<ChannelLimits> {
        Some(ChannelLimits {
            min_message_size: self.read_u32()?,
            max_message_size: self.read_u32()?,
            max_messages_in_memory: self.read_u32()?,
            max_messages_on_disk: self.read_u32()?,
        })
    }
}

fn encode(entry: &Entry) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(entry.initiator.tag());
    write_str(&mut buf, &entry.identity);
    write_str(&mut buf, &entry.ip);
    match &entry.change {
        Change::AddGroup { group, password } => {
            buf.push(0);
            write_str(&mut buf, group);
            write_digest(&mut buf, password);
        }
        Change::UpdateGroupPassword { group, password } => {
            buf.push(1);
            write_str(&mut buf, group);
            write_digest(&mut buf, password);
        }
        Change::RemoveGroup { group } => {
            buf.push(2);
            write_str(&mut buf, group);
        }
        Change::AddChannel { group, channel, limits } => {
            buf.push(3);
            write_str(&mut buf, group);
            write_str(&mut buf, channel);
            write_limits(&mut buf, limits);
        }
        Change::UpdateChannelLimits { group, channel, limits } => {
            buf.push(4);
            write_str(&mut buf, group);
            write_str(&mut buf, channel);
            write_limits(&mut buf, limits);
        }
        Change::RemoveChannel { group, channel } => {
            buf.push(5);
            write_str(&mut buf, group);
            write_str(&mut buf, channel);
        }
        Change::AddConsumer { group, channel, login, password } => {
            buf.push(6);
            write_str(&mut buf, group);
            write_str(&mut buf, channel);
            write_str(&mut buf, login);
            write_digest(&mut buf, password);
        }
        Change::UpdateConsumerPassword { group, channel, login, password } => {
            buf.push(7);
            write_str(&mut buf, group);
            write_str(&mut buf, channel);
            write_str(&mut buf, login);
            write_digest(&mut buf, password);
        }
        Change::RemoveConsumer { group, channel, login } => {
            buf.push(8);
            write_str(&mut buf, group);
            write_str(&mut buf, channel);
            write_str(&mut buf, login);
        }
        Change::AddProducer { group, channel, login, password } => {
            buf.push(9);
            write_str(&mut buf, group);
            write_str(&mut buf, channel);
            write_str(&mut buf, login);
            write_digest(&mut buf, password);
        }
        Change::UpdateProducerPassword { group, channel, login, password } => {
            buf.push(10);
            write_str(&mut buf, group);
            write_str(&mut buf, channel);
            write_str(&mut buf, login);
            write_digest(&mut buf, password);
        }
        Change::RemoveProducer { group, channel, login } => {
            buf.push(11);
            write_str(&mut buf, group);
            write_str(&mut buf, channel);
            write_str(&mut buf, login);
        }
        Change::UpdateMasterPassword { password } => {
            buf.push(12);
            write_digest(&mut buf, password);
        }
        Change::UpdatePort { port } => {
            buf.push(13);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Change::UpdateCountThreads { count } => {
            buf.push(14);
            buf.extend_from_slice(&count.to_be_bytes());
        }
    }
    buf
}

fn decode(raw: &[u8]) -> Option<Entry> {
    let mut c = Cursor { buf: raw, pos: 0 };
    let initiator = Initiator::from_tag(*raw.first()?)?;
    c.pos = 1;
    let identity = c.read_str()?;
    let ip = c.read_str()?;
    let tag = *raw.get(c.pos)?;
    c.pos += 1;
    let change = match tag {
        0 => Change::AddGroup { group: c.read_str()?, password: c.read_digest()? },
        1 => Change::UpdateGroupPassword { group: c.read_str()?, password: c.read_digest()? },
        2 => Change::RemoveGroup { group: c.read_str()? },
        3 => Change::AddChannel { group: c.read_str()?, channel: c.read_str()?, limits: c.read_limits()? },
        4 => Change::UpdateChannelLimits { group: c.read_str()?, channel: c.read_str()?, limits: c.read_limits()? },
        5 => Change::RemoveChannel { group: c.read_str()?, channel: c.read_str()? },
        6 => Change::AddConsumer {
            group: c.read_str()?,
            channel: c.read_str()?,
            login: c.read_str()?,
            password: c.read_digest()?,
        },
        7 => Change::UpdateConsumerPassword {
            group: c.read_str()?,
            channel: c.read_str()?,
            login: c.read_str()?,
            password: c.read_digest()?,
        },
        8 => Change::RemoveConsumer { group: c.read_str()?, channel: c.read_str()?, login: c.read_str()? },
        9 => Change::AddProducer {
            group: c.read_str()?,
            channel: c.read_str()?,
            login: c.read_str()?,
            password: c.read_digest()?,
        },
        10 => Change::UpdateProducerPassword {
            group: c.read_str()?,
            channel: c.read_str()?,
            login: c.read_str()?,
            password: c.read_digest()?,
        },
        11 => Change::RemoveProducer { group: c.read_str()?, channel: c.read_str()?, login: c.read_str()? },
        12 => Change::UpdateMasterPassword { password: c.read_digest()? },
        13 => Change::UpdatePort { port: c.read_u16()? },
        14 => Change::UpdateCountThreads { count: c.read_u16()? },
        _ => return None,
    };
    Some(Entry { change, initiator, identity, ip })
}

/// Reads every length-prefixed entry currently in the journal file.
fn read_all(path: &Path) -> io::Result<Vec<Entry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > data.len() {
            break; // truncated trailing write from an unclean shutdown
        }
        if let Some(entry) = decode(&data[pos..pos + len]) {
            entries.push(entry);
        }
        pos += len;
    }
    Ok(entries)
}

pub struct Changes {
    path: PathBuf,
    journal: Mutex<File>,
    read_offset: Mutex<u64>,
    tx: Sender<Entry>,
    rx: Receiver<Entry>,
}

impl Changes {
    /// Opens (creating if absent) the journal at `dir/log`, returning both
    /// the handle for future pushes and any entries left over from a crash
    /// that the caller must replay before trusting `Store`'s state.
    pub fn open(dir: &Path) -> io::Result<(Self, Vec<Entry>)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("log");
        let pending = read_all(&path)?;

        // Entries read back are about to be handed to the caller for
        // replay; once replayed they're reflected in Store, so the
        // journal starts clean for this run.
        let journal = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;

        let (tx, rx) = unbounded();
        Ok((
            Self {
                path,
                journal: Mutex::new(journal),
                read_offset: Mutex::new(0),
                tx,
                rx,
            },
            pending,
        ))
    }

    fn append(&self, entry: &Entry, durable: bool) -> io::Result<()> {
        let encoded = encode(entry);
        let mut file = self.journal.lock();
        file.write_all(&(encoded.len() as u32).to_be_bytes())?;
        file.write_all(&encoded)?;
        if durable {
            file.sync_data()?;
        }
        *self.read_offset.lock() += 4 + encoded.len() as u64;
        Ok(())
    }

    /// Durable path: appends + fsyncs before enqueueing for the applier.
    pub fn push(&self, entry: Entry) -> io::Result<()> {
        self.append(&entry, true)?;
        let _ = self.tx.send(entry);
        Ok(())
    }

    /// Batch path: appends without an fsync before enqueueing; used by the
    /// admin surface so a sequence of edits doesn't block on a flush per
    /// keystroke. Still visible to another process's `poll_disk` as soon as
    /// the write lands in the page cache.
    pub fn push_deferred(&self, entry: Entry) -> io::Result<()> {
        self.append(&entry, false)?;
        let _ = self.tx.send(entry);
        Ok(())
    }

    /// Picks up journal bytes appended since the last call — by this
    /// handle's own `push`/`push_deferred` (already accounted for via
    /// `read_offset`, so a no-op) or by a different process's `Changes`
    /// handle on the same file. Called by the applier's poll tick.
    pub fn poll_disk(&self) -> io::Result<()> {
        let mut off = self.read_offset.lock();
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len <= *off {
            return Ok(());
        }
        file.seek(SeekFrom::Start(*off))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let entry_len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            if pos + 4 + entry_len > buf.len() {
                break;
            }
            if let Some(entry) = decode(&buf[pos + 4..pos + 4 + entry_len]) {
                let _ = self.tx.send(entry);
            }
            pos += 4 + entry_len;
        }
        *off += pos as u64;
        Ok(())
    }

    pub fn pop(&self) -> Option<Entry> {
        self.rx.try_recv().ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(change: Change) -> Entry {
        Entry {
            change,
            initiator: Initiator::Root,
            identity: "root".into(),
            ip: "127.0.0.1".into(),
        }
    }

    #[test]
    fn push_then_pop_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let (changes, pending) = Changes::open(dir.path()).unwrap();
        assert!(pending.is_empty());

        changes.push(entry(Change::AddGroup { group: "g".into(), password: [1u8; 32] })).unwrap();
        changes
            .push(entry(Change::AddChannel {
                group: "g".into(),
                channel: "c".into(),
                limits: ChannelLimits {
                    min_message_size: 1,
                    max_message_size: 10,
                    max_messages_in_memory: 1,
                    max_messages_on_disk: 0,
                },
            }))
            .unwrap();

        let first = changes.pop().unwrap();
        assert!(matches!(first.change, Change::AddGroup { .. }));
        let second = changes.pop().unwrap();
        assert!(matches!(second.change, Change::AddChannel { .. }));
        assert!(changes.pop().is_none());
    }

    #[test]
    fn deferred_push_lands_in_the_journal_without_requiring_a_pop() {
        let dir = tempfile::tempdir().unwrap();
        let (changes, _) = Changes::open(dir.path()).unwrap();
        changes.push_deferred(entry(Change::RemoveGroup { group: "g".into() })).unwrap();
        assert!(changes.pop().is_some());
        assert!(std::fs::metadata(changes.path()).unwrap().len() > 0);
    }

    #[test]
    fn poll_disk_picks_up_entries_appended_by_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = Changes::open(dir.path()).unwrap();
        let (reader, _) = Changes::open(dir.path()).unwrap();

        writer.push(entry(Change::AddGroup { group: "g".into(), password: [9u8; 32] })).unwrap();
        assert!(reader.pop().is_none(), "reader hasn't polled the file yet");

        reader.poll_disk().unwrap();
        let picked_up = reader.pop().unwrap();
        assert!(matches!(picked_up.change, Change::AddGroup { .. }));
    }

    #[test]
    fn crash_before_apply_is_replayed_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (changes, _) = Changes::open(dir.path()).unwrap();
            changes.push(entry(Change::AddGroup { group: "g".into(), password: [2u8; 32] })).unwrap();
            // No pop() before "crash" (drop without applying).
        }
        let (_changes, pending) = Changes::open(dir.path()).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0].change, Change::AddGroup { .. }));
    }
}
