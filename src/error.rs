use thiserror::Error;

/// Error kinds raised by the broker core. Mirrors the single description
/// table the controller, applier, and admin surface all render from.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("group not found")]
    NotFoundGroup,
    #[error("channel not found")]
    NotFoundChannel,
    #[error("consumer not found")]
    NotFoundConsumer,
    #[error("producer not found")]
    NotFoundProducer,
    #[error("session not found")]
    NotFoundSession,

    #[error("group already exists")]
    DuplicateGroup,
    #[error("channel already exists")]
    DuplicateChannel,
    #[error("consumer already exists")]
    DuplicateConsumer,
    #[error("producer already exists")]
    DuplicateProducer,
    #[error("session already bound")]
    DuplicateSession,
    #[error("uuid already in use")]
    DuplicateUuid,

    #[error("wrong password")]
    WrongPassword,
    #[error("wrong parameter")]
    WrongParam,
    #[error("wrong message size")]
    WrongMessageSize,
    #[error("wrong channel limits")]
    WrongChannelLimits,
    #[error("wrong uuid")]
    WrongUuid,
    #[error("wrong command")]
    WrongCmd,

    #[error("limit exceeded")]
    ExceedLimit,
    #[error("access denied")]
    AccessDeny,

    #[error("filesystem error")]
    FsError,
    #[error("socket error")]
    Socket,

    #[error("unknown error")]
    Unknown,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the controller should reply with an error and keep the
    /// session alive (`SEND_ERROR`), reply and close (`SEND_ERROR_WITH_CLOSE`),
    /// or close outright without replying (`CLOSE`).
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Error::WrongParam
            | Error::WrongMessageSize
            | Error::WrongChannelLimits
            | Error::WrongUuid
            | Error::WrongCmd
            | Error::ExceedLimit
            | Error::NotFoundChannel
            | Error::NotFoundConsumer
            | Error::NotFoundProducer
            | Error::DuplicateChannel
            | Error::DuplicateConsumer
            | Error::DuplicateProducer
            | Error::DuplicateUuid
            | Error::DuplicateGroup
            | Error::NotFoundGroup
            | Error::Unknown => ErrorSeverity::SendError,

            Error::WrongPassword
            | Error::DuplicateSession
            | Error::NotFoundSession
            | Error::AccessDeny => ErrorSeverity::SendErrorWithClose,

            Error::FsError | Error::Socket => ErrorSeverity::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    SendError,
    SendErrorWithClose,
    Close,
}
