//! Per-connection state. A `Session` holds everything the controller needs
//! to resume a connection's FSM across epoll wake-ups: the in-flight wire
//! packet, which message (if any) is mid-transfer, and the auth context
//! established during the handshake. Sessions hold only identifiers —
//! never references into `Access`/`QueueManager` — so a session can be torn
//! down unconditionally on close without chasing back-pointers.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::fsm::Code;
use crate::message_buffer::MessageId;
use crate::protocol::{RecvPacket, SendPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Common,
    Group,
    Consumer,
    Producer,
}

/// Established once the COMMON handshake's `auth_*` succeeds; never
/// mutated afterwards (a login change requires a fresh connection).
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub group: String,
    pub channel: Option<String>,
    pub login: Option<String>,
}

pub struct Session {
    pub fd: RawFd,
    pub ip: String,
    pub last_activity: Instant,
    /// Whether the idle-timeout sweep is allowed to close this session;
    /// false only mid-transfer states where the client may legitimately
    /// pause waiting on backpressure from its own consumer.
    pub watch_ts: bool,

    pub code: Code,
    pub role: Role,
    pub auth: AuthContext,

    pub recv_packet: RecvPacket,
    pub send_packet: Option<SendPacket>,

    /// The message currently being produced into or consumed from.
    pub current_message_id: Option<MessageId>,
    pub current_message_uuid: Option<String>,
    pub current_message_length: u32,
    /// Byte offset into the current message already sent to a consumer
    /// (producer-side progress is tracked by `MessageBuffer::recv`'s own
    /// `wrLength`, not duplicated here).
    pub transfer_offset: u32,
    /// Distinguishes a consumer's current delivery: broadcast messages are
    /// acked implicitly on pop, queued messages need an explicit
    /// `remove_message(uuid)` (or a revert on disconnect).
    pub is_broadcast_delivery: bool,

    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Session {
    pub fn new(fd: RawFd, ip: String) -> Self {
        Self {
            fd,
            ip,
            last_activity: Instant::now(),
            watch_ts: true,
            code: Code::default(),
            role: Role::Common,
            auth: AuthContext::default(),
            recv_packet: RecvPacket::new(),
            send_packet: None,
            current_message_id: None,
            current_message_uuid: None,
            current_message_length: 0,
            transfer_offset: 0,
            is_broadcast_delivery: false,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn clear_transfer(&mut self) {
        self.current_message_id = None;
        self.current_message_uuid = None;
        self.current_message_length = 0;
        self.transfer_offset = 0;
    }

    pub fn group(&self) -> &str {
        &self.auth.group
    }

    pub fn channel(&self) -> &str {
        self.auth.channel.as_deref().unwrap_or("")
    }

    pub fn login(&self) -> &str {
        self.auth.login.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_starts_in_common_handshake() {
        let s = Session::new(3, "127.0.0.1".into());
        assert_eq!(s.code, Code::CommonRecvCheckSecure);
        assert_eq!(s.role, Role::Common);
    }

    #[test]
    fn clear_transfer_resets_message_fields() {
        let mut s = Session::new(3, "127.0.0.1".into());
        s.current_message_id = Some(7);
        s.transfer_offset = 40;
        s.clear_transfer();
        assert!(s.current_message_id.is_none());
        assert_eq!(s.transfer_offset, 0);
    }
}
