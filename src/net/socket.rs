// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Listener socket construction
//!
//! Listeners are built with `socket2` so SO_REUSEADDR/SO_REUSEPORT, buffer
//! sizes, and the backlog are all set before the fd reaches mio. REUSEPORT
//! is what lets every worker inherit the same bound port and have the
//! kernel spread accepts across processes.

use std::net::{SocketAddr, TcpListener};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};

const SOCKET_BUF_SIZE: usize = 256 * 1024;

/// Creates a non-blocking listener bound to `addr`:`port`.
pub fn create_listener(addr: &str, port: u16, backlog: i32) -> Result<TcpListener> {
    let sockaddr: SocketAddr = format!("{addr}:{port}")
        .parse()
        .map_err(|_| Error::Config(format!("invalid listen address {addr}:{port}")))?;

    let bind = |sockaddr: SocketAddr| -> std::io::Result<TcpListener> {
        let domain = Domain::for_address(sockaddr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        socket.set_nodelay(true)?;
        socket.set_recv_buffer_size(SOCKET_BUF_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUF_SIZE)?;
        socket.set_nonblocking(true)?;

        socket.bind(&sockaddr.into())?;
        socket.listen(backlog)?;
        Ok(socket.into())
    };

    bind(sockaddr).map_err(|source| Error::Bind {
        addr: format!("{addr}:{port}"),
        source,
    })
}

#[cfg(test)]
mod test {
    use super::create_listener;

    #[test]
    fn listener_binds_ephemeral_port() {
        let listener = create_listener("127.0.0.1", 0, 16).expect("bind failed");
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn two_listeners_share_a_port_via_reuseport() {
        let first = create_listener("127.0.0.1", 0, 16).expect("first bind failed");
        let port = first.local_addr().unwrap().port();
        let second = create_listener("127.0.0.1", port, 16);
        assert!(second.is_ok(), "SO_REUSEPORT should allow a second bind");
    }

    #[test]
    fn invalid_address_is_a_config_error() {
        assert!(create_listener("not-an-ip", 0, 16).is_err());
    }
}
