//! Wire framing: `u16` command tag, `u16` param count, then that many
//! params as `u32`-length-prefixed byte strings — all multi-byte integers
//! big-endian. `RecvPacket`/`SendPacket` accumulate and drain against a
//! non-blocking fd a few bytes at a time, matching however little the
//! socket gives up on a given readable/writable event.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

pub const VERSION: u32 = 1_000_001;

pub const CMD_CHECK_SECURE: u16 = 1;
pub const CMD_GET_VERSION: u16 = 2;
pub const CMD_AUTH_GROUP: u16 = 3;
pub const CMD_AUTH_CONSUMER: u16 = 4;
pub const CMD_AUTH_PRODUCER: u16 = 5;

pub const CMD_UPDATE_GROUP_PASSWORD: u16 = 10;
pub const CMD_LIST_CHANNELS: u16 = 11;
pub const CMD_LIST_CONSUMERS: u16 = 12;
pub const CMD_LIST_PRODUCERS: u16 = 13;
pub const CMD_GET_CHANNEL_LIMITS: u16 = 14;
pub const CMD_SET_CHANNEL_LIMITS: u16 = 15;
pub const CMD_ADD_CHANNEL: u16 = 16;
pub const CMD_REMOVE_CHANNEL: u16 = 17;
pub const CMD_ADD_CONSUMER: u16 = 18;
pub const CMD_UPDATE_CONSUMER_PASSWORD: u16 = 19;
pub const CMD_REMOVE_CONSUMER: u16 = 20;
pub const CMD_ADD_PRODUCER: u16 = 21;
pub const CMD_UPDATE_PRODUCER_PASSWORD: u16 = 22;
pub const CMD_REMOVE_PRODUCER: u16 = 23;

pub const CMD_UPDATE_OWN_PASSWORD: u16 = 30;
pub const CMD_POP_MESSAGE: u16 = 31;
pub const CMD_REMOVE_MESSAGE: u16 = 32;

pub const CMD_PUSH_MESSAGE: u16 = 40;
pub const CMD_PUSH_PUBLIC_MESSAGE: u16 = 41;
pub const CMD_PUSH_REPLICA_MESSAGE: u16 = 42;

/// Reserved tags for server->client response frames; disjoint from the
/// client command-tag space above.
pub const RESP_OK: u16 = 100;
pub const RESP_ERROR: u16 = 101;
pub const RESP_VERSION: u16 = 102;
pub const RESP_STRING_LIST: u16 = 103;
pub const RESP_MESSAGE_META: u16 = 104;
pub const RESP_CHANNEL_LIMITS: u16 = 105;

fn recv_raw(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(Error::Socket);
    }
    if n == 0 {
        return Err(Error::Socket);
    }
    Ok(n as usize)
}

fn send_raw(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(Error::Socket);
    }
    Ok(n as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvStage {
    Header,
    ParamLen,
    ParamBody,
    Done,
}

/// Incrementally assembled inbound frame. `recv` may be called repeatedly
/// across several readable events; `is_received` reports when the full
/// frame has landed.
pub struct RecvPacket {
    stage: RecvStage,
    scratch: Vec<u8>,
    filled: usize,
    command: u16,
    param_count: u16,
    params: Vec<Vec<u8>>,
    current_param_len: u32,
}

impl Default for RecvPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvPacket {
    pub fn new() -> Self {
        Self {
            stage: RecvStage::Header,
            scratch: vec![0u8; 4],
            filled: 0,
            command: 0,
            param_count: 0,
            params: Vec::new(),
            current_param_len: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_received(&self) -> bool {
        self.stage == RecvStage::Done
    }

    pub fn command(&self) -> u16 {
        self.command
    }

    pub fn param(&self, index: usize) -> Option<&[u8]> {
        self.params.get(index).map(|v| v.as_slice())
    }

    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.param(index).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn param_u32(&self, index: usize) -> Option<u32> {
        let b = self.param(index)?;
        if b.len() != 4 {
            return None;
        }
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Pull whatever the fd currently has buffered; never blocks. Returns
    /// once the socket would block or the frame completes.
    pub fn recv(&mut self, fd: RawFd) -> Result<()> {
        loop {
            match self.stage {
                RecvStage::Done => return Ok(()),
                RecvStage::Header => {
                    let n = recv_raw(fd, &mut self.scratch[self.filled..4])?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.filled += n;
                    if self.filled == 4 {
                        self.command = u16::from_be_bytes([self.scratch[0], self.scratch[1]]);
                        self.param_count = u16::from_be_bytes([self.scratch[2], self.scratch[3]]);
                        self.filled = 0;
                        self.stage = if self.param_count == 0 {
                            RecvStage::Done
                        } else {
                            self.scratch = vec![0u8; 4];
                            RecvStage::ParamLen
                        };
                    }
                }
                RecvStage::ParamLen => {
                    let n = recv_raw(fd, &mut self.scratch[self.filled..4])?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.filled += n;
                    if self.filled == 4 {
                        self.current_param_len =
                            u32::from_be_bytes([self.scratch[0], self.scratch[1], self.scratch[2], self.scratch[3]]);
                        self.filled = 0;
                        self.scratch = vec![0u8; self.current_param_len as usize];
                        self.stage = if self.current_param_len == 0 {
                            self.params.push(Vec::new());
                            self.advance_param()
                        } else {
                            RecvStage::ParamBody
                        };
                    }
                }
                RecvStage::ParamBody => {
                    let n = recv_raw(fd, &mut self.scratch[self.filled..])?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.filled += n;
                    if self.filled == self.scratch.len() {
                        self.params.push(std::mem::take(&mut self.scratch));
                        self.filled = 0;
                        self.stage = self.advance_param();
                    }
                }
            }
        }
    }

    fn advance_param(&mut self) -> RecvStage {
        if self.params.len() == self.param_count as usize {
            RecvStage::Done
        } else {
            self.scratch = vec![0u8; 4];
            RecvStage::ParamLen
        }
    }
}

/// An outbound frame assembled up front and drained across writable
/// events.
pub struct SendPacket {
    buf: Vec<u8>,
    offset: usize,
}

impl SendPacket {
    fn from_parts(command: u16, params: &[&[u8]]) -> Self {
        let mut buf = Vec::with_capacity(4 + params.iter().map(|p| 4 + p.len()).sum::<usize>());
        buf.extend_from_slice(&command.to_be_bytes());
        buf.extend_from_slice(&(params.len() as u16).to_be_bytes());
        for p in params {
            buf.extend_from_slice(&(p.len() as u32).to_be_bytes());
            buf.extend_from_slice(p);
        }
        Self { buf, offset: 0 }
    }

    pub fn is_sent(&self) -> bool {
        self.offset == self.buf.len()
    }

    pub fn send(&mut self, fd: RawFd) -> Result<()> {
        while self.offset < self.buf.len() {
            let n = send_raw(fd, &self.buf[self.offset..])?;
            if n == 0 {
                return Ok(());
            }
            self.offset += n;
        }
        Ok(())
    }
}

pub fn prepare_ok() -> SendPacket {
    SendPacket::from_parts(RESP_OK, &[])
}

pub fn prepare_error(description: &str) -> SendPacket {
    SendPacket::from_parts(RESP_ERROR, &[description.as_bytes()])
}

pub fn prepare_version(version: u32) -> SendPacket {
    SendPacket::from_parts(RESP_VERSION, &[&version.to_be_bytes()])
}

pub fn prepare_string_list(items: &[String]) -> SendPacket {
    let bytes: Vec<&[u8]> = items.iter().map(|s| s.as_bytes()).collect();
    SendPacket::from_parts(RESP_STRING_LIST, &bytes)
}

pub fn prepare_message_meta(length: u32, uuid: Option<&str>) -> SendPacket {
    let length_be = length.to_be_bytes();
    match uuid {
        Some(u) => SendPacket::from_parts(RESP_MESSAGE_META, &[&length_be, u.as_bytes()]),
        None => SendPacket::from_parts(RESP_MESSAGE_META, &[&length_be]),
    }
}

pub fn prepare_channel_limits(min: u32, max: u32, mem_max: u32, disk_max: u32) -> SendPacket {
    SendPacket::from_parts(
        RESP_CHANNEL_LIMITS,
        &[
            &min.to_be_bytes(),
            &max.to_be_bytes(),
            &mem_max.to_be_bytes(),
            &disk_max.to_be_bytes(),
        ],
    )
}

pub fn prepare_request(command: u16, params: &[&[u8]]) -> SendPacket {
    SendPacket::from_parts(command, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn roundtrips_a_multi_param_frame() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let mut out = prepare_request(CMD_AUTH_GROUP, &[b"acme", b"secret"]);
        while !out.is_sent() {
            out.send(std::os::unix::io::AsRawFd::as_raw_fd(&a)).unwrap();
        }

        let mut packet = RecvPacket::new();
        while !packet.is_received() {
            packet.recv(std::os::unix::io::AsRawFd::as_raw_fd(&b)).unwrap();
        }
        assert_eq!(packet.command(), CMD_AUTH_GROUP);
        assert_eq!(packet.param_str(0), Some("acme"));
        assert_eq!(packet.param_str(1), Some("secret"));
    }

    #[test]
    fn zero_param_frame_is_immediately_received_after_header() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let mut out = prepare_request(CMD_GET_VERSION, &[]);
        while !out.is_sent() {
            out.send(std::os::unix::io::AsRawFd::as_raw_fd(&a)).unwrap();
        }
        let mut packet = RecvPacket::new();
        while !packet.is_received() {
            packet.recv(std::os::unix::io::AsRawFd::as_raw_fd(&b)).unwrap();
        }
        assert_eq!(packet.command(), CMD_GET_VERSION);
    }

    #[test]
    fn message_meta_roundtrips_with_and_without_uuid() {
        let mut p = prepare_message_meta(4096, Some("abc-123"));
        assert!(!p.is_sent());
        let _ = &mut p;
        let p2 = prepare_message_meta(4096, None);
        assert_eq!(p2.buf[0..2], RESP_MESSAGE_META.to_be_bytes());
    }
}
