//! Per-channel message store. Each message occupies `ceil(length/4096)`
//! pages, either lazily-allocated in-memory buffers or lazily-allocated
//! slots of the channel's shared [`PagedFile`]. `recv`/`send` are
//! non-blocking: they progress at most one page's worth of bytes per call
//! and report 0 (not an error) when the socket would block.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::paged_file::{PagedFile, PAGE_SIZE};

pub type MessageId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    pub min_message_size: u32,
    pub max_message_size: u32,
    pub max_messages_in_memory: u32,
    pub max_messages_on_disk: u32,
}

impl ChannelLimits {
    /// Repairs an invariant-violating set of limits the way `Store` does
    /// on boot: `1 <= min <= max`, both totals fit a u32 and sum to > 0.
    pub fn repaired(mut self) -> Self {
        if self.min_message_size < 1 {
            self.min_message_size = 1;
        }
        if self.max_message_size < self.min_message_size {
            self.max_message_size = self.min_message_size;
        }
        if self.max_messages_in_memory == 0 && self.max_messages_on_disk == 0 {
            self.max_messages_in_memory = 1;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_message_size < 1 || self.min_message_size > self.max_message_size {
            return Err(Error::WrongChannelLimits);
        }
        if self.max_messages_in_memory == 0 && self.max_messages_on_disk == 0 {
            return Err(Error::WrongChannelLimits);
        }
        if self
            .max_messages_in_memory
            .checked_add(self.max_messages_on_disk)
            .is_none()
        {
            return Err(Error::WrongChannelLimits);
        }
        Ok(())
    }
}

enum Storage {
    Memory(Vec<Option<Vec<u8>>>),
    Disk(Vec<Option<u64>>),
}

struct Message {
    length: u32,
    wr_length: u32,
    uuid: Option<String>,
    storage: Storage,
}

struct Counters {
    in_memory: u32,
    on_disk: u32,
}

struct Table {
    messages: HashMap<MessageId, Message>,
    next_id: MessageId,
    free_ids: Vec<MessageId>,
}

pub struct MessageBuffer {
    paged_file: Arc<PagedFile>,
    limits: RwLock<ChannelLimits>,
    counters: RwLock<Counters>,
    table: RwLock<Table>,
    uuid_index: RwLock<HashMap<String, MessageId>>,
}

fn page_count(length: u32) -> usize {
    ((length as u64 + PAGE_SIZE - 1) / PAGE_SIZE) as usize
}

/// Bytes remaining in the current (possibly partial, page-aligned) page,
/// mirroring the source's `_calculateWRLength`.
fn residual_in_page(length: u32, wr_length: u32) -> u32 {
    let page_size = PAGE_SIZE as u32;
    if length < page_size {
        return length - wr_length;
    }
    let count = wr_length / page_size;
    let full_count = length / page_size;
    if full_count == count {
        length - wr_length
    } else {
        let residue = wr_length - count * page_size;
        page_size - residue
    }
}

pub fn is_full_part(wr_length: u32, length: u32) -> bool {
    wr_length % PAGE_SIZE as u32 == 0 || wr_length == length
}

impl MessageBuffer {
    pub fn open(path: &Path, limits: ChannelLimits) -> io::Result<Self> {
        let paged_file = Arc::new(PagedFile::open(&path.join("content"))?);
        Ok(Self {
            paged_file,
            limits: RwLock::new(limits),
            counters: RwLock::new(Counters {
                in_memory: 0,
                on_disk: 0,
            }),
            table: RwLock::new(Table {
                messages: HashMap::new(),
                next_id: 1,
                free_ids: Vec::new(),
            }),
            uuid_index: RwLock::new(HashMap::new()),
        })
    }

    pub fn update_limits(&self, limits: ChannelLimits) {
        *self.limits.write() = limits;
    }

    fn validate_length(&self, length: u32) -> Result<()> {
        let limits = self.limits.read();
        if length < limits.min_message_size || length > limits.max_message_size {
            return Err(Error::WrongMessageSize);
        }
        Ok(())
    }

    fn next_id(table: &mut Table) -> MessageId {
        if let Some(id) = table.free_ids.pop() {
            return id;
        }
        let id = table.next_id;
        table.next_id += 1;
        id
    }

    fn allocate_storage(&self, length: u32) -> Result<Storage> {
        let limits = self.limits.read();
        let mut counters = self.counters.write();
        if counters.in_memory < limits.max_messages_in_memory {
            counters.in_memory += 1;
            Ok(Storage::Memory(vec![None; page_count(length)]))
        } else if counters.on_disk < limits.max_messages_on_disk {
            counters.on_disk += 1;
            Ok(Storage::Disk(vec![None; page_count(length)]))
        } else {
            Err(Error::ExceedLimit)
        }
    }

    pub fn add_for_queue(&self, length: u32) -> Result<(MessageId, String)> {
        self.validate_length(length)?;
        let storage = self.allocate_storage(length)?;

        let mut uuid_index = self.uuid_index.write();
        let uuid = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !uuid_index.contains_key(&candidate) {
                break candidate;
            }
        };

        let mut table = self.table.write();
        let id = Self::next_id(&mut table);
        table.messages.insert(
            id,
            Message {
                length,
                wr_length: 0,
                uuid: Some(uuid.clone()),
                storage,
            },
        );
        uuid_index.insert(uuid.clone(), id);

        Ok((id, uuid))
    }

    pub fn add_for_replication(&self, length: u32, uuid: &str) -> Result<MessageId> {
        self.validate_length(length)?;

        let mut uuid_index = self.uuid_index.write();
        if uuid_index.contains_key(uuid) {
            return Err(Error::DuplicateUuid);
        }
        let storage = self.allocate_storage(length)?;

        let mut table = self.table.write();
        let id = Self::next_id(&mut table);
        table.messages.insert(
            id,
            Message {
                length,
                wr_length: 0,
                uuid: Some(uuid.to_string()),
                storage,
            },
        );
        uuid_index.insert(uuid.to_string(), id);

        Ok(id)
    }

    pub fn add_for_broadcast(&self, length: u32) -> Result<MessageId> {
        self.validate_length(length)?;
        let storage = self.allocate_storage(length)?;
        let mut table = self.table.write();
        let id = Self::next_id(&mut table);
        table.messages.insert(
            id,
            Message {
                length,
                wr_length: 0,
                uuid: None,
                storage,
            },
        );
        Ok(id)
    }

    pub fn free(&self, id: MessageId) {
        let mut table = self.table.write();
        let Some(msg) = table.messages.remove(&id) else {
            return;
        };
        if let Some(uuid) = &msg.uuid {
            self.uuid_index.write().remove(uuid);
        }
        self.release_storage(&msg.storage);
        table.free_ids.push(id);
    }

    pub fn free_by_uuid(&self, uuid: &str) {
        let id = { self.uuid_index.write().remove(uuid) };
        if let Some(id) = id {
            let mut table = self.table.write();
            if let Some(msg) = table.messages.remove(&id) {
                self.release_storage(&msg.storage);
            }
            table.free_ids.push(id);
        }
    }

    fn release_storage(&self, storage: &Storage) {
        let mut counters = self.counters.write();
        match storage {
            Storage::Memory(_) => counters.in_memory -= 1,
            Storage::Disk(pages) => {
                counters.on_disk -= 1;
                for page in pages.iter().flatten() {
                    self.paged_file.free(*page);
                }
            }
        }
    }

    pub fn get_uuid(&self, id: MessageId) -> Option<String> {
        self.table.read().messages.get(&id).and_then(|m| m.uuid.clone())
    }

    pub fn get_id(&self, uuid: &str) -> Result<MessageId> {
        self.uuid_index
            .read()
            .get(uuid)
            .copied()
            .ok_or(Error::WrongUuid)
    }

    pub fn get_length(&self, id: MessageId) -> u32 {
        self.table.read().messages.get(&id).map(|m| m.length).unwrap_or(0)
    }

    pub fn recv(&self, id: MessageId, fd: RawFd) -> Result<u32> {
        let mut table = self.table.write();
        let msg = table.messages.get_mut(&id).ok_or(Error::Unknown)?;
        let want = residual_in_page(msg.length, msg.wr_length);
        let page_idx = (msg.wr_length as u64 / PAGE_SIZE) as usize;
        let inner_offset = msg.wr_length as u64 % PAGE_SIZE;

        let progressed = match &mut msg.storage {
            Storage::Memory(pages) => {
                if inner_offset == 0 {
                    let residue = residual_full_page(msg.length, msg.wr_length);
                    pages[page_idx] = Some(vec![0u8; residue as usize]);
                }
                let buf = pages[page_idx].as_mut().expect("page allocated above");
                recv_raw(fd, &mut buf[inner_offset as usize..inner_offset as usize + want as usize])?
            }
            Storage::Disk(pages) => {
                if inner_offset == 0 {
                    pages[page_idx] = Some(self.paged_file.allocate().map_err(|_| Error::FsError)?);
                }
                let mut scratch = vec![0u8; want as usize];
                let n = recv_raw(fd, &mut scratch)?;
                if n > 0 {
                    let page = pages[page_idx].expect("page allocated above");
                    self.paged_file
                        .write(page, inner_offset, &scratch[..n as usize])
                        .map_err(|_| Error::FsError)?;
                }
                n
            }
        };

        msg.wr_length += progressed;
        Ok(progressed)
    }

    pub fn send(&self, id: MessageId, fd: RawFd, offset: u32) -> Result<u32> {
        let table = self.table.read();
        let msg = table.messages.get(&id).ok_or(Error::Unknown)?;
        let want = residual_in_page(msg.length, offset);
        let page_idx = (offset as u64 / PAGE_SIZE) as usize;
        let inner_offset = offset as u64 % PAGE_SIZE;

        match &msg.storage {
            Storage::Memory(pages) => {
                let buf = pages[page_idx].as_ref().ok_or(Error::Unknown)?;
                send_raw(fd, &buf[inner_offset as usize..inner_offset as usize + want as usize])
            }
            Storage::Disk(pages) => {
                let page = pages[page_idx].ok_or(Error::Unknown)?;
                self.paged_file
                    .send_to_fd(page, inner_offset, want as usize, fd)
                    .map(|n| n as u32)
                    .map_err(map_io_err)
            }
        }
    }

    pub fn is_full_part(&self, id: MessageId) -> bool {
        let table = self.table.read();
        match table.messages.get(&id) {
            Some(msg) => is_full_part(msg.wr_length, msg.length),
            None => true,
        }
    }

    pub fn clear(&self) {
        let ids: Vec<MessageId> = self.table.read().messages.keys().copied().collect();
        for id in ids {
            self.free(id);
        }
    }
}

/// Size of the page about to be (re)allocated at this write offset: a
/// full page unless this is the message's final, partial page.
fn residual_full_page(length: u32, wr_length: u32) -> u32 {
    let page_size = PAGE_SIZE as u32;
    let residue = length - wr_length;
    residue.min(page_size)
}

fn recv_raw(fd: RawFd, buf: &mut [u8]) -> Result<u32> {
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    check_io_result(n)
}

fn send_raw(fd: RawFd, buf: &[u8]) -> Result<u32> {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    check_io_result(n)
}

fn check_io_result(n: isize) -> Result<u32> {
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(Error::Socket);
    }
    Ok(n as u32)
}

fn map_io_err(_: io::Error) -> Error {
    Error::Socket
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ChannelLimits {
        ChannelLimits {
            min_message_size: 1,
            max_message_size: 1 << 20,
            max_messages_in_memory: 4,
            max_messages_on_disk: 4,
        }
    }

    #[test]
    fn queue_allocation_generates_unique_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let mb = MessageBuffer::open(dir.path(), limits()).unwrap();
        let (id1, uuid1) = mb.add_for_queue(10).unwrap();
        let (id2, uuid2) = mb.add_for_queue(10).unwrap();
        assert_ne!(id1, id2);
        assert_ne!(uuid1, uuid2);
        assert_eq!(mb.get_id(&uuid1).unwrap(), id1);
    }

    #[test]
    fn replication_rejects_duplicate_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let mb = MessageBuffer::open(dir.path(), limits()).unwrap();
        mb.add_for_replication(10, "u-1").unwrap();
        assert_eq!(
            mb.add_for_replication(10, "u-1").unwrap_err(),
            Error::DuplicateUuid
        );
    }

    #[test]
    fn capacity_exceeded_once_memory_and_disk_full() {
        let dir = tempfile::tempdir().unwrap();
        let mb = MessageBuffer::open(
            dir.path(),
            ChannelLimits {
                min_message_size: 1,
                max_message_size: 1024,
                max_messages_in_memory: 1,
                max_messages_on_disk: 0,
            },
        )
        .unwrap();
        mb.add_for_broadcast(10).unwrap();
        assert_eq!(mb.add_for_broadcast(10).unwrap_err(), Error::ExceedLimit);
    }

    #[test]
    fn free_releases_capacity_for_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let mb = MessageBuffer::open(
            dir.path(),
            ChannelLimits {
                min_message_size: 1,
                max_message_size: 1024,
                max_messages_in_memory: 1,
                max_messages_on_disk: 0,
            },
        )
        .unwrap();
        let id = mb.add_for_broadcast(10).unwrap();
        mb.free(id);
        assert!(mb.add_for_broadcast(10).is_ok());
    }

    #[test]
    fn full_part_boundary_matches_page_alignment() {
        assert!(is_full_part(4096, 9000));
        assert!(is_full_part(9000, 9000));
        assert!(!is_full_part(4095, 9000));
    }
}
