// Callback-driven I/O multiplexer for non-blocking TCP services.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Non-blocking TCP listener with callback-completed accept.

use std::fmt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, Weak};

use crate::net::addr::{InetAddress, SockaddrStorage};
use crate::net::sys;
use crate::net::AcceptCallback;
use crate::poller::IoType;
use crate::reactor::IoManager;
use crate::status::{Error, Result};
use crate::net::tcp_client::TcpClient;
use crate::watcher::{IoController, IoWatcher};

/// Listener options.
#[derive(Clone, Debug)]
pub struct Options {
    pub reuse_address: bool,
    pub backlog: i32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            reuse_address: false,
            backlog: 5,
        }
    }
}

struct ServerIo {
    fd: Option<OwnedFd>,
    local: Option<SockaddrStorage>,
    accept_cb: Option<AcceptCallback>,
    pending_accept: bool,
}

pub(crate) struct ServerInner {
    weak: Weak<ServerInner>,
    io: Mutex<ServerIo>,
    accept_ctrl: IoController,
}

/// A listening TCP socket handing out [`TcpClient`]s for accepted
/// connections. At most one accept may be in flight; users wishing to
/// accept continuously re-issue the accept from their callback.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer").finish_non_exhaustive()
    }
}

impl TcpServer {
    /// Binds and listens on `local`. Requesting port zero binds an
    /// ephemeral port; the actual bound address is cached and reported by
    /// [`TcpServer::local_addr`].
    pub fn listen(local: &InetAddress, options: &Options) -> Result<TcpServer> {
        debug_assert!(options.backlog > 0);
        let addr = SockaddrStorage::from_inet(local)?;
        let fd = sys::socket(addr.family())?;
        sys::set_non_blocking(fd.as_raw_fd())?;
        sys::set_close_exec(fd.as_raw_fd())?;
        if options.reuse_address {
            sys::set_reuse_addr(fd.as_raw_fd(), true)?;
        }
        sys::bind(fd.as_raw_fd(), &addr)?;
        sys::listen(fd.as_raw_fd(), options.backlog)?;
        let bound = sys::getsockname(fd.as_raw_fd())?;

        let inner = Arc::new_cyclic(|weak| ServerInner {
            weak: weak.clone(),
            io: Mutex::new(ServerIo {
                fd: Some(fd),
                local: Some(bound),
                accept_cb: None,
                pending_accept: false,
            }),
            accept_ctrl: IoController::new(),
        });
        #[cfg(feature = "log")]
        log::debug!(target: "tcp", "Listening on {}", bound.to_inet());
        Ok(TcpServer { inner })
    }

    /// Accepts one connection. On synchronous success returns the accepted
    /// client and its peer address; on `TryAgain` the same pair is
    /// delivered through `callback` once a connection arrives.
    pub fn accept(&self, callback: AcceptCallback) -> Result<(TcpClient, InetAddress)> {
        let mut io = self.inner.io.lock().expect("server mutex poisoned");
        debug_assert!(!io.pending_accept, "accept already in flight");
        if io.pending_accept {
            return Err(Error::corruption("accept already in flight"));
        }
        match do_accept(&io) {
            Err(err) if err.is_try_again() => {
                let fd =
                    io.fd.as_ref().ok_or_else(|| Error::corruption("listener is closed"))?
                        .as_raw_fd();
                let watcher: Weak<dyn IoWatcher> = self.inner.weak.clone();
                if !IoManager::get().watch(
                    fd,
                    IoType::read_only(),
                    watcher,
                    &self.inner.accept_ctrl,
                ) {
                    return Err(Error::internal("failed to watch the listening socket"));
                }
                io.pending_accept = true;
                io.accept_cb = Some(callback);
                Err(err)
            }
            result => result,
        }
    }

    pub fn local_addr(&self) -> Result<InetAddress> {
        let mut io = self.inner.io.lock().expect("server mutex poisoned");
        if let Some(local) = &io.local {
            return Ok(local.to_inet());
        }
        let fd =
            io.fd.as_ref().ok_or_else(|| Error::corruption("listener is closed"))?.as_raw_fd();
        let local = sys::getsockname(fd)?;
        io.local = Some(local);
        Ok(local.to_inet())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        {
            let mut io = self.inner.io.lock().expect("server mutex poisoned");
            io.accept_cb = None;
            io.pending_accept = false;
        }
        self.inner.accept_ctrl.stop_watching();
        self.inner.io.lock().expect("server mutex poisoned").fd = None;
    }
}

fn do_accept(io: &ServerIo) -> Result<(TcpClient, InetAddress)> {
    let fd = io.fd.as_ref().ok_or_else(|| Error::corruption("listener is closed"))?.as_raw_fd();
    let (accepted, peer) = sys::accept(fd)?;
    let client = TcpClient::adopt(accepted, peer)?;
    Ok((client, peer.to_inet()))
}

impl IoWatcher for ServerInner {
    fn on_readable(&self, _fd: RawFd) {
        let mut io = self.io.lock().expect("server mutex poisoned");
        if io.accept_cb.is_none() {
            return;
        }
        match do_accept(&io) {
            // the connection went away again; keep watching
            Err(err) if err.is_try_again() => {}
            result => {
                self.accept_ctrl.stop_watching();
                io.pending_accept = false;
                let callback = io.accept_cb.take().expect("accept callback stashed");
                drop(io);
                callback(result);
            }
        }
    }

    fn on_writable(&self, _fd: RawFd) {
        debug_assert!(false, "listening sockets are never watched for write");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::net::tcp_client::{self, Connecting};
    use crate::testutil::AsyncResult;

    fn loopback() -> InetAddress { InetAddress::ipv4("127.0.0.1", 0).unwrap() }

    #[test]
    fn listen_assigns_an_ephemeral_port() {
        let server = TcpServer::listen(&loopback(), &Options::default()).unwrap();
        let address = server.local_addr().unwrap();
        assert_ne!(address.port(), 0);
        assert_eq!(address.ip(), "127.0.0.1");
    }

    #[test]
    fn second_bind_without_reuse_is_in_use() {
        let server = TcpServer::listen(&loopback(), &Options::default()).unwrap();
        let address = server.local_addr().unwrap();
        let err = TcpServer::listen(&address, &Options::default()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InUse);
    }

    #[test]
    fn accept_without_a_connection_parks() {
        let server = TcpServer::listen(&loopback(), &Options::default()).unwrap();
        let accept_result: AsyncResult<Result<(TcpClient, InetAddress)>> = AsyncResult::new();
        let err = server.accept(accept_result.callback()).unwrap_err();
        assert!(err.is_try_again());
        // dropping the server with the accept still parked must not fire it
        drop(server);
        assert!(!accept_result.has_fired());
    }

    #[test]
    fn accept_backpressure_over_backlog() {
        const CLIENTS: usize = 10;
        let server =
            TcpServer::listen(&loopback(), &Options { reuse_address: true, backlog: 5 }).unwrap();
        let address = server.local_addr().unwrap();

        // open all sockets up-front without accepting a single one
        let mut clients = Vec::new();
        for _ in 0..CLIENTS {
            let connect_result: AsyncResult<Result<()>> = AsyncResult::new();
            let connecting = TcpClient::connect(
                &address,
                &tcp_client::Options::default(),
                None,
                connect_result.callback(),
            )
            .unwrap();
            clients.push((connecting.into_client(), connect_result));
        }

        // now drain: every connection is eventually accepted, and each
        // accepted socket's peer matches some client's local address
        let mut accepted_peers = BTreeSet::new();
        let mut accepted = Vec::new();
        for _ in 0..CLIENTS {
            let accept_result: AsyncResult<Result<(TcpClient, InetAddress)>> = AsyncResult::new();
            let sync = server.accept(accept_result.callback());
            let (socket, peer) = accept_result.get_result(sync).unwrap();
            assert_eq!(socket.peer_addr().unwrap(), peer);
            accepted_peers.insert(peer.to_string());
            accepted.push(socket);
        }

        let client_locals: BTreeSet<String> = clients
            .iter()
            .map(|(client, _)| client.local_addr().unwrap().to_string())
            .collect();
        assert_eq!(accepted_peers, client_locals);
        assert_eq!(accepted.len(), CLIENTS);
    }

    #[test]
    fn accept_chain_from_the_callback_shape() {
        // accepting continuously means re-issuing from the callback; here
        // the re-issue happens on the test thread between completions,
        // which exercises the same park/complete cycle repeatedly
        let server =
            TcpServer::listen(&loopback(), &Options { reuse_address: true, backlog: 5 }).unwrap();
        let address = server.local_addr().unwrap();

        for _ in 0..3 {
            let accept_result: AsyncResult<Result<(TcpClient, InetAddress)>> = AsyncResult::new();
            let sync = server.accept(accept_result.callback());
            assert!(sync.as_ref().err().map_or(false, Error::is_try_again));

            let connect_result: AsyncResult<Result<()>> = AsyncResult::new();
            let connecting = TcpClient::connect(
                &address,
                &tcp_client::Options::default(),
                None,
                connect_result.callback(),
            )
            .unwrap();
            let (socket, peer) = accept_result.get_result(sync).unwrap();
            assert_eq!(socket.peer_addr().unwrap(), peer);
            if connecting.is_pending() {
                connect_result.wait().unwrap();
            }
        }
    }
}
