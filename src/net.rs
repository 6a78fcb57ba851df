//! Listening-socket construction for the broker's worker threads. Each
//! thread in the pool owns an independent `mio::Poll` loop over its own
//! `SO_REUSEPORT` socket bound to the same port — the kernel load-balances
//! incoming connections across them, so there's no shared accept lock.

use std::net::{SocketAddr, TcpListener};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};

pub fn build_reuseport_listener(addr: SocketAddr, backlog: i32) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).context("socket")?;

    socket.set_reuse_address(true).ok();
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    socket.set_reuse_port(true).ok();

    socket.bind(&addr.into()).context("bind")?;
    socket.listen(backlog).context("listen")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    Ok(socket.into())
}
