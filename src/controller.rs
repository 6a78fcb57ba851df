//! `ServerController`: the per-fd FSM dispatcher that ties `Session` state
//! to `Access`, `QueueManager`, `Changes` and `Store`. One controller is
//! shared (via `Arc`) across every worker thread; `progress` is the only
//! entry point an event loop calls, once per readable/writable wake-up for
//! a given fd. It owns no sockets itself — callers (the epoll loop in
//! `main.rs`) own the `TcpStream`/fd and are responsible for closing it
//! once `progress` returns `Outcome::Close`, and for calling `disconnect`
//! exactly once per connection (on close or on error) to release the
//! session's claims on `Access`/`QueueManager`.
//!
//! Authenticated mutations never touch `Access`/`QueueManager`/`Store`
//! directly: the controller only validates (read-only `check_*` calls)
//! and appends to `Changes`. Applying a change to the three is the single
//! responsibility of the applier loop in `initialization.rs` — this keeps
//! the durable journal and the in-memory state from diverging under a
//! crash mid-mutation.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::access::{hash_password, Access};
use crate::changes::{Change, Changes, Entry, Initiator};
use crate::error::{Error, ErrorSeverity, Result};
use crate::fsm::Code;
use crate::message_buffer::{is_full_part, ChannelLimits, MessageId};
use crate::protocol::{
    prepare_channel_limits, prepare_error, prepare_message_meta, prepare_ok, prepare_string_list,
    prepare_version, SendPacket, CMD_ADD_CHANNEL, CMD_ADD_CONSUMER, CMD_ADD_PRODUCER,
    CMD_AUTH_CONSUMER, CMD_AUTH_GROUP, CMD_AUTH_PRODUCER, CMD_CHECK_SECURE,
    CMD_GET_CHANNEL_LIMITS, CMD_GET_VERSION, CMD_LIST_CHANNELS, CMD_LIST_CONSUMERS,
    CMD_LIST_PRODUCERS, CMD_POP_MESSAGE, CMD_PUSH_MESSAGE, CMD_PUSH_PUBLIC_MESSAGE,
    CMD_PUSH_REPLICA_MESSAGE, CMD_REMOVE_CHANNEL, CMD_REMOVE_CONSUMER, CMD_REMOVE_MESSAGE,
    CMD_REMOVE_PRODUCER, CMD_SET_CHANNEL_LIMITS, CMD_UPDATE_CONSUMER_PASSWORD,
    CMD_UPDATE_GROUP_PASSWORD, CMD_UPDATE_OWN_PASSWORD, CMD_UPDATE_PRODUCER_PASSWORD, VERSION,
};
use crate::queue_manager::QueueManager;
use crate::session::{Role, Session};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// More I/O is needed before this session can progress further;
    /// nothing to do until the fd is next readable/writable.
    Pending,
    /// The session reached a `*Close` state. The caller must close the
    /// fd and call `disconnect`.
    Close,
}

pub struct ServerController {
    access: Arc<Access>,
    queues: Arc<QueueManager>,
    store: Arc<Store>,
    changes: Arc<Changes>,
    sessions: RwLock<HashMap<RawFd, Arc<Mutex<Session>>>>,
    idle_timeout: Duration,
}

impl ServerController {
    pub fn new(
        access: Arc<Access>,
        queues: Arc<QueueManager>,
        store: Arc<Store>,
        changes: Arc<Changes>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            access,
            queues,
            store,
            changes,
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn connect(&self, fd: RawFd, ip: String) {
        self.sessions
            .write()
            .insert(fd, Arc::new(Mutex::new(Session::new(fd, ip))));
    }

    /// Rolls back whatever the session's role and in-flight transfer
    /// claimed, then drops the session entry. Safe to call on an fd with
    /// no session (no-op) so callers don't need to track whether
    /// `connect` ever succeeded for a given fd.
    pub fn disconnect(&self, fd: RawFd) {
        let Some(session_arc) = self.sessions.write().remove(&fd) else {
            return;
        };
        let session = session_arc.lock();
        let group = session.group().to_string();
        let channel = session.channel().to_string();
        let login = session.login().to_string();

        match session.role {
            Role::Common => {}
            Role::Group => {
                self.access.logout_group(&group, fd);
            }
            Role::Consumer => {
                if let Some(id) = session.current_message_id {
                    if session.is_broadcast_delivery {
                        self.queues.remove_message(&group, &channel, fd, id);
                    } else {
                        self.queues.revert_message(&group, &channel, fd, id);
                    }
                }
                self.queues.leave_consumer(&group, &channel, fd);
                self.access.logout_consumer(&group, &channel, &login, fd);
            }
            Role::Producer => {
                if let Some(id) = session.current_message_id {
                    self.queues.remove_message(&group, &channel, fd, id);
                }
                self.queues.leave_producer(&group, &channel, fd);
                self.access.logout_producer(&group, &channel, &login, fd);
            }
        }
    }

    /// Every session past its idle timeout while sitting in a state that
    /// isn't mid-transfer (see `Session::watch_ts`). The caller closes
    /// each returned fd and calls `disconnect`.
    pub fn sweep_idle(&self) -> Vec<RawFd> {
        self.sessions
            .read()
            .iter()
            .filter_map(|(&fd, s)| {
                let session = s.lock();
                (session.watch_ts && session.idle_for() >= self.idle_timeout).then_some(fd)
            })
            .collect()
    }

    fn is_idle_eligible(code: Code) -> bool {
        matches!(
            code,
            Code::CommonRecvCheckSecure
                | Code::CommonRecvGetVersion
                | Code::CommonRecvAuth
                | Code::GroupRecvCmd
                | Code::ConsumerRecvCmd
                | Code::ProducerRecvCmd
        )
    }

    fn entry(&self, session: &Session, initiator: Initiator, change: Change) -> Entry {
        let identity = match initiator {
            Initiator::Root => "root".to_string(),
            Initiator::Group => session.group().to_string(),
            Initiator::Consumer | Initiator::Producer => session.login().to_string(),
        };
        Entry {
            change,
            initiator,
            identity,
            ip: session.ip.clone(),
        }
    }

    fn role_send_error(role: Role) -> Code {
        match role {
            Role::Common => Code::CommonSendErrorWithClose,
            Role::Group => Code::GroupSendError,
            Role::Consumer => Code::ConsumerSendError,
            Role::Producer => Code::ProducerSendError,
        }
    }

    fn role_send_error_with_close(role: Role) -> Code {
        match role {
            Role::Common => Code::CommonSendErrorWithClose,
            Role::Group => Code::GroupSendErrorWithClose,
            Role::Consumer => Code::ConsumerSendErrorWithClose,
            Role::Producer => Code::ProducerSendErrorWithClose,
        }
    }

    fn role_close(role: Role) -> Code {
        match role {
            Role::Common => Code::CommonClose,
            Role::Group => Code::GroupClose,
            Role::Consumer => Code::ConsumerClose,
            Role::Producer => Code::ProducerClose,
        }
    }

    /// Maps an `Error` to the next FSM code and (when applicable) an
    /// error reply. The COMMON handshake's literal state table has a
    /// single error path (`SEND_ERROR_WITH_CLOSE -> CLOSE`), so every
    /// error while `role == Common` takes that path regardless of the
    /// error's generic severity.
    fn apply_error(&self, session: &mut Session, err: Error) {
        let severity = if session.role == Role::Common {
            ErrorSeverity::SendErrorWithClose
        } else {
            err.severity()
        };
        match severity {
            ErrorSeverity::SendError => {
                session.send_packet = Some(prepare_error(&err.to_string()));
                session.code = Self::role_send_error(session.role);
            }
            ErrorSeverity::SendErrorWithClose => {
                session.send_packet = Some(prepare_error(&err.to_string()));
                session.code = Self::role_send_error_with_close(session.role);
            }
            ErrorSeverity::Close => {
                session.code = Self::role_close(session.role);
            }
        }
    }

    fn drain_recv(&self, session: &mut Session, fd: RawFd) -> Result<bool> {
        session.recv_packet.recv(fd).map_err(|_| Error::Socket)?;
        Ok(session.recv_packet.is_received())
    }

    fn drain_send(&self, session: &mut Session, fd: RawFd) -> Result<bool> {
        let pkt = session
            .send_packet
            .as_mut()
            .expect("send_packet set before entering a Send* state");
        pkt.send(fd).map_err(|_| Error::Socket)?;
        if pkt.is_sent() {
            session.send_packet = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Advances one session as far as the current readable/writable event
    /// allows: through as many states as complete without blocking, until
    /// either an I/O call would block (`Pending`) or the session reaches
    /// a `*Close` state (`Close`).
    pub fn progress(&self, fd: RawFd) -> Outcome {
        let Some(session_arc) = self.sessions.read().get(&fd).cloned() else {
            return Outcome::Close;
        };
        let mut session = session_arc.lock();
        session.touch();

        let outcome = loop {
            match session.code {
                Code::CommonRecvCheckSecure => match self.drain_recv(&mut session, fd) {
                    Ok(true) => {
                        let cmd = session.recv_packet.command();
                        session.recv_packet.reset();
                        if cmd == CMD_CHECK_SECURE {
                            session.send_packet = Some(prepare_ok());
                            session.code = Code::CommonSendConfirmSecure;
                        } else {
                            self.apply_error(&mut session, Error::WrongCmd);
                        }
                    }
                    Ok(false) => break Outcome::Pending,
                    Err(e) => self.apply_error(&mut session, e),
                },
                Code::CommonSendConfirmSecure => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = session.code.next_after_send(),
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::CommonClose,
                },
                Code::CommonRecvGetVersion => match self.drain_recv(&mut session, fd) {
                    Ok(true) => {
                        let cmd = session.recv_packet.command();
                        session.recv_packet.reset();
                        if cmd == CMD_GET_VERSION {
                            session.send_packet = Some(prepare_version(VERSION));
                            session.code = Code::CommonSendVersion;
                        } else {
                            self.apply_error(&mut session, Error::WrongCmd);
                        }
                    }
                    Ok(false) => break Outcome::Pending,
                    Err(e) => self.apply_error(&mut session, e),
                },
                Code::CommonSendVersion => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = session.code.next_after_send(),
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::CommonClose,
                },
                Code::CommonRecvAuth => match self.drain_recv(&mut session, fd) {
                    Ok(true) => self.dispatch_auth(&mut session, fd),
                    Ok(false) => break Outcome::Pending,
                    Err(e) => self.apply_error(&mut session, e),
                },
                Code::CommonSendConfirmAuthGroup
                | Code::CommonSendConfirmAuthConsumer
                | Code::CommonSendConfirmAuthProducer => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = session.code.next_after_send(),
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::CommonClose,
                },
                Code::CommonSendErrorWithClose => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = Code::CommonClose,
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::CommonClose,
                },

                Code::GroupRecvCmd => match self.drain_recv(&mut session, fd) {
                    Ok(true) => self.dispatch_group_cmd(&mut session, fd),
                    Ok(false) => break Outcome::Pending,
                    Err(e) => self.apply_error(&mut session, e),
                },
                Code::GroupSend | Code::GroupSendError => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = session.code.next_after_send(),
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::GroupClose,
                },
                Code::GroupSendErrorWithClose => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = Code::GroupClose,
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::GroupClose,
                },

                Code::ConsumerRecvCmd => match self.drain_recv(&mut session, fd) {
                    Ok(true) => self.dispatch_consumer_cmd(&mut session, fd),
                    Ok(false) => break Outcome::Pending,
                    Err(e) => self.apply_error(&mut session, e),
                },
                Code::ConsumerSend | Code::ConsumerSendError => {
                    match self.drain_send(&mut session, fd) {
                        Ok(true) => session.code = session.code.next_after_send(),
                        Ok(false) => break Outcome::Pending,
                        Err(_) => session.code = Code::ConsumerClose,
                    }
                }
                Code::ConsumerSendErrorWithClose => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = Code::ConsumerClose,
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::ConsumerClose,
                },
                Code::ConsumerSendMessageMeta => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = session.code.next_after_send(),
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::ConsumerClose,
                },
                Code::ConsumerRecvCmdPartMessage => match self.drain_recv(&mut session, fd) {
                    Ok(true) => {
                        session.recv_packet.reset();
                        session.code = Code::ConsumerSendPartMessage;
                    }
                    Ok(false) => break Outcome::Pending,
                    Err(e) => self.apply_error(&mut session, e),
                },
                Code::ConsumerSendPartMessage | Code::ConsumerSendPartMessageNull => {
                    let group = session.group().to_string();
                    let channel = session.channel().to_string();
                    let id = session
                        .current_message_id
                        .expect("set when entering the pop flow");
                    match self.queues.send(&group, &channel, fd, id, session.transfer_offset) {
                        Ok(0) => break Outcome::Pending,
                        Ok(n) => {
                            session.bytes_sent += n as u64;
                            session.transfer_offset += n;
                            if is_full_part(session.transfer_offset, session.current_message_length) {
                                session.send_packet = Some(prepare_ok());
                                session.code = if session.transfer_offset == session.current_message_length {
                                    Code::ConsumerSendConfirmPartMessageEnd
                                } else {
                                    Code::ConsumerSendConfirmPartMessage
                                };
                            }
                        }
                        Err(e) => self.apply_error(&mut session, e),
                    }
                }
                Code::ConsumerSendConfirmPartMessage => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = session.code.next_after_send(),
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::ConsumerClose,
                },
                Code::ConsumerSendConfirmPartMessageEnd => match self.drain_send(&mut session, fd) {
                    Ok(true) => {
                        session.code = if session.is_broadcast_delivery {
                            session.clear_transfer();
                            Code::ConsumerRecvCmd
                        } else {
                            Code::ConsumerRecvCmdRemoveMessage
                        };
                    }
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::ConsumerClose,
                },
                Code::ConsumerRecvCmdRemoveMessage => match self.drain_recv(&mut session, fd) {
                    Ok(true) => {
                        let cmd = session.recv_packet.command();
                        let uuid = session.recv_packet.param_str(0).map(|s| s.to_string());
                        session.recv_packet.reset();
                        if cmd != CMD_REMOVE_MESSAGE {
                            self.apply_error(&mut session, Error::WrongCmd);
                        } else if uuid.as_deref() != session.current_message_uuid.as_deref() {
                            self.apply_error(&mut session, Error::WrongUuid);
                        } else {
                            let group = session.group().to_string();
                            let channel = session.channel().to_string();
                            let uuid = uuid.expect("checked equal to Some(..) above");
                            self.queues.remove_message_by_uuid(&group, &channel, fd, &uuid);
                            session.clear_transfer();
                            session.send_packet = Some(prepare_ok());
                            session.code = Code::ConsumerSend;
                        }
                    }
                    Ok(false) => break Outcome::Pending,
                    Err(e) => self.apply_error(&mut session, e),
                },

                Code::ProducerRecvCmd => match self.drain_recv(&mut session, fd) {
                    Ok(true) => self.dispatch_producer_cmd(&mut session, fd),
                    Ok(false) => break Outcome::Pending,
                    Err(e) => self.apply_error(&mut session, e),
                },
                Code::ProducerSend | Code::ProducerSendError => {
                    match self.drain_send(&mut session, fd) {
                        Ok(true) => session.code = session.code.next_after_send(),
                        Ok(false) => break Outcome::Pending,
                        Err(_) => session.code = Code::ProducerClose,
                    }
                }
                Code::ProducerSendErrorWithClose => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = Code::ProducerClose,
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::ProducerClose,
                },
                Code::ProducerSendMessageMeta => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = session.code.next_after_send(),
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::ProducerClose,
                },
                Code::ProducerRecvPartMessage | Code::ProducerRecvPartMessageNull => {
                    let group = session.group().to_string();
                    let channel = session.channel().to_string();
                    let id = session
                        .current_message_id
                        .expect("set when entering the push flow");
                    match self.queues.recv(&group, &channel, fd, id) {
                        Ok(0) => break Outcome::Pending,
                        Ok(n) => {
                            session.bytes_received += n as u64;
                            session.transfer_offset += n;
                            if is_full_part(session.transfer_offset, session.current_message_length) {
                                if session.transfer_offset == session.current_message_length {
                                    match self.queues.push_message(&group, &channel, fd, id) {
                                        Ok(()) => {
                                            session.send_packet = Some(prepare_ok());
                                            session.code = Code::ProducerSendConfirmPartMessageEnd;
                                        }
                                        Err(e) => self.apply_error(&mut session, e),
                                    }
                                } else {
                                    session.send_packet = Some(prepare_ok());
                                    session.code = Code::ProducerSendConfirmPartMessage;
                                }
                            }
                        }
                        Err(e) => self.apply_error(&mut session, e),
                    }
                }
                Code::ProducerSendConfirmPartMessage => match self.drain_send(&mut session, fd) {
                    Ok(true) => session.code = session.code.next_after_send(),
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::ProducerClose,
                },
                Code::ProducerSendConfirmPartMessageEnd => match self.drain_send(&mut session, fd) {
                    Ok(true) => {
                        session.clear_transfer();
                        session.code = Code::ProducerRecvCmd;
                    }
                    Ok(false) => break Outcome::Pending,
                    Err(_) => session.code = Code::ProducerClose,
                },

                Code::CommonClose | Code::GroupClose | Code::ConsumerClose | Code::ProducerClose => {
                    break Outcome::Close;
                }
            }
        };

        session.watch_ts = Self::is_idle_eligible(session.code);
        outcome
    }

    fn dispatch_auth(&self, session: &mut Session, fd: RawFd) {
        let cmd = session.recv_packet.command();
        let p0 = session.recv_packet.param_str(0).map(|s| s.to_string());
        let p1 = session.recv_packet.param_str(1).map(|s| s.to_string());
        let p2 = session.recv_packet.param_str(2).map(|s| s.to_string());
        let p3 = session.recv_packet.param_str(3).map(|s| s.to_string());
        session.recv_packet.reset();

        let result = match cmd {
            CMD_AUTH_GROUP => match (p0, p1) {
                (Some(group), Some(password)) => {
                    self.access.auth_group(&group, &password, fd).map(|_| {
                        session.auth.group = group;
                        session.role = Role::Group;
                        Code::CommonSendConfirmAuthGroup
                    })
                }
                _ => Err(Error::WrongParam),
            },
            CMD_AUTH_CONSUMER => match (p0, p1, p2, p3) {
                (Some(group), Some(channel), Some(login), Some(password)) => {
                    match self.access.auth_consumer(&group, &channel, &login, &password, fd) {
                        Ok(()) => match self.queues.join_consumer(&group, &channel, fd) {
                            Ok(()) => {
                                session.auth.group = group;
                                session.auth.channel = Some(channel);
                                session.auth.login = Some(login);
                                session.role = Role::Consumer;
                                Ok(Code::CommonSendConfirmAuthConsumer)
                            }
                            Err(e) => {
                                self.access.logout_consumer(&group, &channel, &login, fd);
                                Err(e)
                            }
                        },
                        Err(e) => Err(e),
                    }
                }
                _ => Err(Error::WrongParam),
            },
            CMD_AUTH_PRODUCER => match (p0, p1, p2, p3) {
                (Some(group), Some(channel), Some(login), Some(password)) => {
                    match self.access.auth_producer(&group, &channel, &login, &password, fd) {
                        Ok(()) => match self.queues.join_producer(&group, &channel, fd) {
                            Ok(()) => {
                                session.auth.group = group;
                                session.auth.channel = Some(channel);
                                session.auth.login = Some(login);
                                session.role = Role::Producer;
                                Ok(Code::CommonSendConfirmAuthProducer)
                            }
                            Err(e) => {
                                self.access.logout_producer(&group, &channel, &login, fd);
                                Err(e)
                            }
                        },
                        Err(e) => Err(e),
                    }
                }
                _ => Err(Error::WrongParam),
            },
            _ => Err(Error::WrongCmd),
        };

        match result {
            Ok(code) => {
                session.send_packet = Some(prepare_ok());
                session.code = code;
            }
            Err(e) => self.apply_error(session, e),
        }
    }

    fn dispatch_group_cmd(&self, session: &mut Session, fd: RawFd) {
        let cmd = session.recv_packet.command();
        let group = session.group().to_string();
        let p = |i: usize| session.recv_packet.param_str(i).map(|s| s.to_string());
        let pu = |i: usize| session.recv_packet.param_u32(i);

        let result: Result<SendPacket> = (|| -> Result<SendPacket> {
            match cmd {
                CMD_UPDATE_GROUP_PASSWORD => {
                    let password = p(0).ok_or(Error::WrongParam)?;
                    self.access.check_group_admin(&group, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::UpdateGroupPassword {
                                group: group.clone(),
                                password: hash_password(&password),
                            },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                CMD_LIST_CHANNELS => {
                    self.access.check_group_admin(&group, fd)?;
                    Ok(prepare_string_list(&self.store.list_channels(&group)))
                }
                CMD_LIST_CONSUMERS => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    self.access.check_group_admin(&group, fd)?;
                    Ok(prepare_string_list(&self.store.list_consumers(&group, &channel)))
                }
                CMD_LIST_PRODUCERS => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    self.access.check_group_admin(&group, fd)?;
                    Ok(prepare_string_list(&self.store.list_producers(&group, &channel)))
                }
                CMD_GET_CHANNEL_LIMITS => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    self.access.check_group_admin(&group, fd)?;
                    let limits = self
                        .store
                        .get_direct_channel_limits(&group, &channel)
                        .ok_or(Error::NotFoundChannel)?;
                    Ok(prepare_channel_limits(
                        limits.min_message_size,
                        limits.max_message_size,
                        limits.max_messages_in_memory,
                        limits.max_messages_on_disk,
                    ))
                }
                CMD_SET_CHANNEL_LIMITS => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    let limits = ChannelLimits {
                        min_message_size: pu(1).ok_or(Error::WrongParam)?,
                        max_message_size: pu(2).ok_or(Error::WrongParam)?,
                        max_messages_in_memory: pu(3).ok_or(Error::WrongParam)?,
                        max_messages_on_disk: pu(4).ok_or(Error::WrongParam)?,
                    };
                    limits.validate()?;
                    self.access.check_update_channel_limits(&group, &channel, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::UpdateChannelLimits { group: group.clone(), channel, limits },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                CMD_ADD_CHANNEL => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    let limits = ChannelLimits {
                        min_message_size: pu(1).ok_or(Error::WrongParam)?,
                        max_message_size: pu(2).ok_or(Error::WrongParam)?,
                        max_messages_in_memory: pu(3).ok_or(Error::WrongParam)?,
                        max_messages_on_disk: pu(4).ok_or(Error::WrongParam)?,
                    };
                    limits.validate()?;
                    self.access.check_create_channel(&group, &channel, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::AddChannel { group: group.clone(), channel, limits },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                CMD_REMOVE_CHANNEL => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    self.access.check_remove_channel(&group, &channel, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::RemoveChannel { group: group.clone(), channel },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                CMD_ADD_CONSUMER => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    let login = p(1).ok_or(Error::WrongParam)?;
                    let password = p(2).ok_or(Error::WrongParam)?;
                    self.access.check_add_consumer(&group, &channel, &login, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::AddConsumer {
                                group: group.clone(),
                                channel,
                                login,
                                password: hash_password(&password),
                            },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                CMD_UPDATE_CONSUMER_PASSWORD => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    let login = p(1).ok_or(Error::WrongParam)?;
                    let password = p(2).ok_or(Error::WrongParam)?;
                    self.access.check_manage_consumer(&group, &channel, &login, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::UpdateConsumerPassword {
                                group: group.clone(),
                                channel,
                                login,
                                password: hash_password(&password),
                            },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                CMD_REMOVE_CONSUMER => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    let login = p(1).ok_or(Error::WrongParam)?;
                    self.access.check_manage_consumer(&group, &channel, &login, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::RemoveConsumer { group: group.clone(), channel, login },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                CMD_ADD_PRODUCER => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    let login = p(1).ok_or(Error::WrongParam)?;
                    let password = p(2).ok_or(Error::WrongParam)?;
                    self.access.check_add_producer(&group, &channel, &login, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::AddProducer {
                                group: group.clone(),
                                channel,
                                login,
                                password: hash_password(&password),
                            },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                CMD_UPDATE_PRODUCER_PASSWORD => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    let login = p(1).ok_or(Error::WrongParam)?;
                    let password = p(2).ok_or(Error::WrongParam)?;
                    self.access.check_manage_producer(&group, &channel, &login, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::UpdateProducerPassword {
                                group: group.clone(),
                                channel,
                                login,
                                password: hash_password(&password),
                            },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                CMD_REMOVE_PRODUCER => {
                    let channel = p(0).ok_or(Error::WrongParam)?;
                    let login = p(1).ok_or(Error::WrongParam)?;
                    self.access.check_manage_producer(&group, &channel, &login, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Group,
                            Change::RemoveProducer { group: group.clone(), channel, login },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                _ => Err(Error::WrongCmd),
            }
        })();

        session.recv_packet.reset();
        match result {
            Ok(pkt) => {
                session.send_packet = Some(pkt);
                session.code = Code::GroupSend;
            }
            Err(e) => self.apply_error(session, e),
        }
    }

    fn dispatch_consumer_cmd(&self, session: &mut Session, fd: RawFd) {
        let cmd = session.recv_packet.command();

        if cmd == CMD_POP_MESSAGE {
            session.recv_packet.reset();
            let group = session.group().to_string();
            let channel = session.channel().to_string();
            match self.queues.pop_message(&group, &channel, fd) {
                Ok(Some((id, length, uuid))) => {
                    session.current_message_id = Some(id);
                    session.current_message_length = length;
                    session.transfer_offset = 0;
                    session.is_broadcast_delivery = uuid.is_none();
                    session.current_message_uuid = uuid.clone();
                    session.send_packet = Some(prepare_message_meta(length, uuid.as_deref()));
                    session.code = Code::ConsumerSendMessageMeta;
                }
                Ok(None) => {
                    session.send_packet = Some(prepare_message_meta(0, None));
                    session.code = Code::ConsumerSend;
                }
                Err(e) => self.apply_error(session, e),
            }
            return;
        }

        let group = session.group().to_string();
        let channel = session.channel().to_string();
        let login = session.login().to_string();
        let p = |i: usize| session.recv_packet.param_str(i).map(|s| s.to_string());

        let result: Result<SendPacket> = (|| -> Result<SendPacket> {
            match cmd {
                CMD_UPDATE_OWN_PASSWORD => {
                    let password = p(0).ok_or(Error::WrongParam)?;
                    self.access.check_update_own_consumer_password(&group, &channel, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Consumer,
                            Change::UpdateConsumerPassword {
                                group: group.clone(),
                                channel: channel.clone(),
                                login: login.clone(),
                                password: hash_password(&password),
                            },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                _ => Err(Error::WrongCmd),
            }
        })();

        session.recv_packet.reset();
        match result {
            Ok(pkt) => {
                session.send_packet = Some(pkt);
                session.code = Code::ConsumerSend;
            }
            Err(e) => self.apply_error(session, e),
        }
    }

    fn dispatch_producer_cmd(&self, session: &mut Session, fd: RawFd) {
        let cmd = session.recv_packet.command();
        let group = session.group().to_string();
        let channel = session.channel().to_string();

        if cmd == CMD_PUSH_MESSAGE || cmd == CMD_PUSH_PUBLIC_MESSAGE || cmd == CMD_PUSH_REPLICA_MESSAGE {
            let length = session.recv_packet.param_u32(0);
            let uuid_param = session.recv_packet.param_str(1).map(|s| s.to_string());
            session.recv_packet.reset();

            let outcome: Result<(MessageId, Option<String>)> = (|| {
                let length = length.ok_or(Error::WrongParam)?;
                match cmd {
                    CMD_PUSH_MESSAGE => {
                        let (id, uuid) = self.queues.create_for_queue(&group, &channel, fd, length)?;
                        Ok((id, Some(uuid)))
                    }
                    CMD_PUSH_PUBLIC_MESSAGE => {
                        let id = self.queues.create_for_broadcast(&group, &channel, fd, length)?;
                        Ok((id, None))
                    }
                    _ => {
                        let uuid = uuid_param.ok_or(Error::WrongParam)?;
                        let id = self.queues.create_for_replication(&group, &channel, fd, length, &uuid)?;
                        Ok((id, Some(uuid)))
                    }
                }
            })();

            match outcome {
                Ok((id, uuid)) => {
                    session.current_message_id = Some(id);
                    session.current_message_length = length.unwrap_or(0);
                    session.transfer_offset = 0;
                    session.current_message_uuid = uuid.clone();
                    session.send_packet =
                        Some(prepare_message_meta(session.current_message_length, uuid.as_deref()));
                    session.code = Code::ProducerSendMessageMeta;
                }
                Err(e) => self.apply_error(session, e),
            }
            return;
        }

        let login = session.login().to_string();
        let p = |i: usize| session.recv_packet.param_str(i).map(|s| s.to_string());

        let result: Result<SendPacket> = (|| -> Result<SendPacket> {
            match cmd {
                CMD_UPDATE_OWN_PASSWORD => {
                    let password = p(0).ok_or(Error::WrongParam)?;
                    self.access.check_update_own_producer_password(&group, &channel, fd)?;
                    self.changes
                        .push(self.entry(
                            session,
                            Initiator::Producer,
                            Change::UpdateProducerPassword {
                                group: group.clone(),
                                channel: channel.clone(),
                                login: login.clone(),
                                password: hash_password(&password),
                            },
                        ))
                        .map_err(|_| Error::FsError)?;
                    Ok(prepare_ok())
                }
                _ => Err(Error::WrongCmd),
            }
        })();

        session.recv_packet.reset();
        match result {
            Ok(pkt) => {
                session.send_packet = Some(pkt);
                session.code = Code::ProducerSend;
            }
            Err(e) => self.apply_error(session, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_buffer::ChannelLimits as Limits;
    use crate::protocol::{prepare_request, RecvPacket, RESP_MESSAGE_META, RESP_OK, RESP_VERSION};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn send_frame(sock: &UnixStream, mut pkt: SendPacket) {
        let fd = sock.as_raw_fd();
        while !pkt.is_sent() {
            pkt.send(fd).unwrap();
        }
    }

    fn recv_frame(sock: &UnixStream) -> RecvPacket {
        let fd = sock.as_raw_fd();
        let mut pkt = RecvPacket::new();
        while !pkt.is_received() {
            pkt.recv(fd).unwrap();
        }
        pkt
    }

    fn limits() -> Limits {
        Limits {
            min_message_size: 1,
            max_message_size: 1024,
            max_messages_in_memory: 4,
            max_messages_on_disk: 0,
        }
    }

    fn controller_with_group(dir: &std::path::Path) -> (Arc<Access>, Arc<QueueManager>, ServerController) {
        let access = Arc::new(Access::new());
        access.add_group("acme", hash_password("secret")).unwrap();
        let queues = Arc::new(QueueManager::new(dir));
        queues.add_group("acme").unwrap();
        let store = Arc::new(Store::open(dir).unwrap());
        let (changes, pending) = Changes::open(&store.changes_dir()).unwrap();
        assert!(pending.is_empty());
        let controller = ServerController::new(
            access.clone(),
            queues.clone(),
            store,
            Arc::new(changes),
            Duration::from_secs(15),
        );
        (access, queues, controller)
    }

    fn handshake(controller: &ServerController, server_fd: RawFd, client: &UnixStream) {
        send_frame(client, prepare_request(CMD_CHECK_SECURE, &[]));
        assert_eq!(controller.progress(server_fd), Outcome::Pending);
        assert_eq!(recv_frame(client).command(), RESP_OK);

        send_frame(client, prepare_request(CMD_GET_VERSION, &[]));
        assert_eq!(controller.progress(server_fd), Outcome::Pending);
        assert_eq!(recv_frame(client).command(), RESP_VERSION);
    }

    #[test]
    fn handshake_then_group_auth_journals_add_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (_access, _queues, controller) = controller_with_group(dir.path());
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        let server_fd = server.as_raw_fd();
        controller.connect(server_fd, "127.0.0.1".into());

        handshake(&controller, server_fd, &client);

        send_frame(&client, prepare_request(CMD_AUTH_GROUP, &[b"acme", b"secret"]));
        assert_eq!(controller.progress(server_fd), Outcome::Pending);
        assert_eq!(recv_frame(&client).command(), RESP_OK);

        send_frame(
            &client,
            prepare_request(
                CMD_ADD_CHANNEL,
                &[b"orders", &1u32.to_be_bytes(), &1024u32.to_be_bytes(), &4u32.to_be_bytes(), &0u32.to_be_bytes()],
            ),
        );
        assert_eq!(controller.progress(server_fd), Outcome::Pending);
        assert_eq!(recv_frame(&client).command(), RESP_OK);

        let entry = controller.changes.pop().expect("add_channel was journaled");
        match entry.change {
            Change::AddChannel { group, channel, limits } => {
                assert_eq!(group, "acme");
                assert_eq!(channel, "orders");
                assert_eq!(limits.max_message_size, 1024);
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn wrong_password_closes_the_common_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let (_access, _queues, controller) = controller_with_group(dir.path());
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client.set_nonblocking(true).unwrap();
        let server_fd = server.as_raw_fd();
        controller.connect(server_fd, "127.0.0.1".into());

        handshake(&controller, server_fd, &client);

        send_frame(&client, prepare_request(CMD_AUTH_GROUP, &[b"acme", b"nope"]));
        assert_eq!(controller.progress(server_fd), Outcome::Pending);
        let resp = recv_frame(&client);
        assert_eq!(resp.command(), crate::protocol::RESP_ERROR);

        // Sending anything else now just drives the close.
        assert_eq!(controller.progress(server_fd), Outcome::Close);
    }

    #[test]
    fn queued_message_round_trips_from_producer_to_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let access = Arc::new(Access::new());
        access.add_group("acme", hash_password("secret")).unwrap();
        access.add_channel("acme", "orders").unwrap();
        access.add_producer("acme", "orders", "p1", hash_password("pw")).unwrap();
        access.add_consumer("acme", "orders", "c1", hash_password("pw")).unwrap();

        let queues = Arc::new(QueueManager::new(dir.path()));
        queues.add_group("acme").unwrap();
        queues.add_channel("acme", "orders", limits()).unwrap();

        let store = Arc::new(Store::open(dir.path()).unwrap());
        let (changes, _) = Changes::open(&store.changes_dir()).unwrap();
        let controller = ServerController::new(access, queues, store, Arc::new(changes), Duration::from_secs(15));

        let (prod_server, prod_client) = UnixStream::pair().unwrap();
        prod_server.set_nonblocking(true).unwrap();
        prod_client.set_nonblocking(true).unwrap();
        let prod_fd = prod_server.as_raw_fd();
        controller.connect(prod_fd, "127.0.0.1".into());
        handshake(&controller, prod_fd, &prod_client);
        send_frame(&prod_client, prepare_request(CMD_AUTH_PRODUCER, &[b"acme", b"orders", b"p1", b"pw"]));
        assert_eq!(controller.progress(prod_fd), Outcome::Pending);
        assert_eq!(recv_frame(&prod_client).command(), RESP_OK);

        let (cons_server, cons_client) = UnixStream::pair().unwrap();
        cons_server.set_nonblocking(true).unwrap();
        cons_client.set_nonblocking(true).unwrap();
        let cons_fd = cons_server.as_raw_fd();
        controller.connect(cons_fd, "127.0.0.1".into());
        handshake(&controller, cons_fd, &cons_client);
        send_frame(&cons_client, prepare_request(CMD_AUTH_CONSUMER, &[b"acme", b"orders", b"c1", b"pw"]));
        assert_eq!(controller.progress(cons_fd), Outcome::Pending);
        assert_eq!(recv_frame(&cons_client).command(), RESP_OK);

        let body = b"hello";
        send_frame(&prod_client, prepare_request(CMD_PUSH_MESSAGE, &[&(body.len() as u32).to_be_bytes()]));
        assert_eq!(controller.progress(prod_fd), Outcome::Pending);
        let meta = recv_frame(&prod_client);
        assert_eq!(meta.command(), RESP_MESSAGE_META);
        let uuid = meta.param_str(1).unwrap().to_string();

        use std::io::Write;
        prod_client.write_all(body).unwrap();
        assert_eq!(controller.progress(prod_fd), Outcome::Pending);
        assert_eq!(recv_frame(&prod_client).command(), RESP_OK);

        send_frame(&cons_client, prepare_request(CMD_POP_MESSAGE, &[]));
        assert_eq!(controller.progress(cons_fd), Outcome::Pending);
        let meta = recv_frame(&cons_client);
        assert_eq!(meta.command(), RESP_MESSAGE_META);
        assert_eq!(meta.param_str(1), Some(uuid.as_str()));

        send_frame(&cons_client, prepare_request(CMD_POP_MESSAGE, &[]));
        assert_eq!(controller.progress(cons_fd), Outcome::Pending);

        let mut received = vec![0u8; body.len()];
        cons_client.read_exact(&mut received).unwrap();
        assert_eq!(&received, body);
        assert_eq!(recv_frame(&cons_client).command(), RESP_OK);

        send_frame(&cons_client, prepare_request(CMD_REMOVE_MESSAGE, &[uuid.as_bytes()]));
        assert_eq!(controller.progress(cons_fd), Outcome::Pending);
        assert_eq!(recv_frame(&cons_client).command(), RESP_OK);
    }
}
