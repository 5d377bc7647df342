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

//! Non-blocking TCP connection with callback-completed connect, read and
//! write.

use std::fmt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::Buffer;
use crate::net::addr::{InetAddress, SockaddrStorage};
use crate::net::sys;
use crate::net::{IoCallback, StatusCallback};
use crate::poller::IoType;
use crate::reactor::IoManager;
use crate::status::{Error, Result};
use crate::watcher::{IoController, IoWatcher};

/// Socket options applied before connecting.
///
/// `keep_alive` carries the probe delay in seconds; buffer sizes are only
/// set when given. Connect timeouts are composed by the caller from a timer
/// plus [`TcpClient::disconnect`]; the client has none built in.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub no_delay: bool,
    pub keep_alive: Option<i32>,
    pub receive_buffer_size: Option<i32>,
    pub send_buffer_size: Option<i32>,
}

/// Outcome of [`TcpClient::connect`].
pub enum Connecting {
    /// The connection completed synchronously; the callback was dropped
    /// unused.
    Done(TcpClient),
    /// The connect is in progress; the callback will be invoked once it
    /// resolves.
    Pending(TcpClient),
}

impl Connecting {
    pub fn is_pending(&self) -> bool { matches!(self, Connecting::Pending(_)) }

    pub fn into_client(self) -> TcpClient {
        match self {
            Connecting::Done(client) | Connecting::Pending(client) => client,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum ConnectState {
    Idle,
    Connecting,
    Connected,
}

/// What to do when the read watcher reports readiness.
enum ReadReady {
    /// A public `read_if_ready`: tell the user once, without reading.
    User(StatusCallback),
    /// A parked `read`: retry the actual read and either complete or rearm.
    Retry,
}

struct ClientIo {
    fd: Option<OwnedFd>,
    state: ConnectState,
    connect_cb: Option<StatusCallback>,
    read_ready: Option<ReadReady>,
    read_buf: Option<Buffer>,
    read_len: usize,
    read_cb: Option<IoCallback>,
    write_buf: Option<Buffer>,
    write_len: usize,
    write_cb: Option<IoCallback>,
    local: Option<SockaddrStorage>,
    remote: Option<SockaddrStorage>,
}

pub(crate) struct ClientInner {
    weak: Weak<ClientInner>,
    io: Mutex<ClientIo>,
    connect_ctrl: IoController,
    read_ctrl: IoController,
    write_ctrl: IoController,
}

/// A non-blocking TCP connection.
///
/// The client is a single-owner object: overlapping a read with a read, a
/// write with a write, or a connect with anything is a contract violation
/// caught by debug assertions. Completion callbacks run on worker threads,
/// serialised per direction by the runtime's dispatch; the slot for a
/// pending operation is always cleared before its callback is invoked, so
/// a callback may immediately issue the next operation.
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient").finish_non_exhaustive()
    }
}

impl TcpClient {
    /// Opens a socket and starts a non-blocking connect to `remote`,
    /// optionally binding `local` first and applying `options`.
    ///
    /// Construction-time failures (bad address, option rejection, fatal
    /// connect errno) surface synchronously as the error; otherwise the
    /// returned [`Connecting`] tells whether the connection is already
    /// established or `callback` will report the outcome.
    pub fn connect(
        remote: &InetAddress,
        options: &Options,
        local: Option<&InetAddress>,
        callback: StatusCallback,
    ) -> Result<Connecting> {
        let remote_addr = SockaddrStorage::from_inet(remote)?;
        let client = TcpClient::open(remote_addr.family())?;
        if let Some(local) = local {
            client.bind(local)?;
        }
        if options.no_delay {
            client.set_no_delay(true)?;
        }
        if let Some(delay) = options.keep_alive {
            client.set_keep_alive(true, delay)?;
        }
        if let Some(size) = options.receive_buffer_size {
            client.set_receive_buffer_size(size)?;
        }
        if let Some(size) = options.send_buffer_size {
            client.set_send_buffer_size(size)?;
        }
        client.start_connect(remote_addr, callback)
    }

    fn open(family: libc::c_int) -> Result<TcpClient> {
        let fd = sys::socket(family)?;
        sys::set_non_blocking(fd.as_raw_fd())?;
        sys::set_close_exec(fd.as_raw_fd())?;
        Ok(TcpClient::with_fd(Some(fd)))
    }

    fn with_fd(fd: Option<OwnedFd>) -> TcpClient {
        let inner = Arc::new_cyclic(|weak| ClientInner {
            weak: weak.clone(),
            io: Mutex::new(ClientIo {
                fd,
                state: ConnectState::Idle,
                connect_cb: None,
                read_ready: None,
                read_buf: None,
                read_len: 0,
                read_cb: None,
                write_buf: None,
                write_len: 0,
                write_cb: None,
                local: None,
                remote: None,
            }),
            connect_ctrl: IoController::new(),
            read_ctrl: IoController::new(),
            write_ctrl: IoController::new(),
        });
        TcpClient { inner }
    }

    /// Wraps an already-connected descriptor (an accepted socket).
    pub(crate) fn adopt(fd: OwnedFd, remote: SockaddrStorage) -> Result<TcpClient> {
        sys::set_non_blocking(fd.as_raw_fd())?;
        sys::set_close_exec(fd.as_raw_fd())?;
        let client = TcpClient::with_fd(Some(fd));
        {
            let mut io = client.inner.io.lock().expect("client mutex poisoned");
            io.remote = Some(remote);
            io.state = ConnectState::Connected;
        }
        Ok(client)
    }

    fn bind(&self, local: &InetAddress) -> Result<()> {
        let addr = SockaddrStorage::from_inet(local)?;
        let mut io = self.inner.io.lock().expect("client mutex poisoned");
        let fd = io.fd.as_ref().expect("socket open").as_raw_fd();
        sys::bind(fd, &addr)?;
        io.local = Some(addr);
        Ok(())
    }

    fn start_connect(self, remote: SockaddrStorage, callback: StatusCallback) -> Result<Connecting> {
        let established = {
            let mut io = self.inner.io.lock().expect("client mutex poisoned");
            debug_assert_eq!(io.state, ConnectState::Idle, "connect overlaps another operation");
            debug_assert!(io.connect_cb.is_none());
            let fd = io.fd.as_ref().expect("socket open").as_raw_fd();
            io.state = ConnectState::Connecting;
            io.remote = Some(remote);
            match sys::connect(fd, &remote) {
                Ok(()) => {
                    io.state = ConnectState::Connected;
                    true
                }
                Err(err) if err.is_try_again() => {
                    let watcher: Weak<dyn IoWatcher> = self.inner.weak.clone();
                    if !IoManager::get().watch(
                        fd,
                        IoType::write_only(),
                        watcher,
                        &self.inner.connect_ctrl,
                    ) {
                        io.state = ConnectState::Idle;
                        io.remote = None;
                        return Err(Error::internal("failed to watch the connecting socket"));
                    }
                    io.connect_cb = Some(callback);
                    false
                }
                Err(err) => {
                    io.state = ConnectState::Idle;
                    io.remote = None;
                    return Err(err);
                }
            }
        };
        if established {
            Ok(Connecting::Done(self))
        } else {
            Ok(Connecting::Pending(self))
        }
    }

    /// Reads up to `len` bytes into `buf`. Returns the byte count read
    /// synchronously (zero meaning EOF), or `TryAgain` with `callback`
    /// invoked once data (or EOF, or an error) arrives. Reads observe
    /// level semantics even though the underlying poller is edge-triggered:
    /// the retry loop keeps re-reading and re-arming until progress.
    pub fn read(&self, buf: &Buffer, len: usize, callback: IoCallback) -> Result<usize> {
        let mut io = self.inner.io.lock().expect("client mutex poisoned");
        debug_assert_eq!(io.state, ConnectState::Connected, "read on an unconnected socket");
        debug_assert!(io.read_ready.is_none(), "read already in flight");
        debug_assert!(io.read_cb.is_none(), "read already in flight");
        debug_assert!(len <= buf.len());
        match do_read(&io, buf, len) {
            Err(err) if err.is_try_again() => {
                if !self.inner.arm_read_watch(&io) {
                    return Err(Error::internal("failed to watch the socket for read"));
                }
                io.read_ready = Some(ReadReady::Retry);
                io.read_buf = Some(buf.clone());
                io.read_len = len;
                io.read_cb = Some(callback);
                Err(err)
            }
            result => result,
        }
    }

    /// Watch-only read primitive: never reads, only waits for readability,
    /// then invokes `callback` exactly once with `Ok`. Always returns
    /// `TryAgain` once armed.
    pub fn read_if_ready(&self, callback: StatusCallback) -> Result<()> {
        let mut io = self.inner.io.lock().expect("client mutex poisoned");
        debug_assert_eq!(io.state, ConnectState::Connected, "read on an unconnected socket");
        debug_assert!(io.read_ready.is_none(), "read already in flight");
        if !self.inner.arm_read_watch(&io) {
            return Err(Error::internal("failed to watch the socket for read"));
        }
        io.read_ready = Some(ReadReady::User(callback));
        Err(Error::try_again("read pending"))
    }

    /// Cancels a pending [`TcpClient::read_if_ready`]; its callback will
    /// never run. A later re-issue works normally.
    pub fn cancel_read_if_ready(&self) -> Result<()> {
        {
            let mut io = self.inner.io.lock().expect("client mutex poisoned");
            debug_assert!(
                matches!(io.read_ready, Some(ReadReady::User(_))),
                "no read-if-ready pending"
            );
            io.read_ready = None;
        }
        // with the slot cleared a concurrent readiness task is a no-op
        let stopped = self.inner.read_ctrl.stop_watching();
        debug_assert!(stopped);
        Ok(())
    }

    /// Writes up to `len` bytes from `buf`. Returns the (possibly partial)
    /// byte count written synchronously (callers loop for the rest), or
    /// `TryAgain` with `callback` reporting the eventual count or error.
    /// A zero-length write is rejected with `InvalidArg`.
    pub fn write(&self, buf: &Buffer, len: usize, callback: IoCallback) -> Result<usize> {
        let mut io = self.inner.io.lock().expect("client mutex poisoned");
        debug_assert_eq!(io.state, ConnectState::Connected, "write on an unconnected socket");
        debug_assert!(io.write_cb.is_none(), "write already in flight");
        if len == 0 {
            return Err(Error::invalid_arg("zero-length write"));
        }
        debug_assert!(len <= buf.len());
        match do_write(&io, buf, len) {
            Err(err) if err.is_try_again() => {
                if !self.inner.arm_write_watch(&io) {
                    return Err(Error::internal("failed to watch the socket for write"));
                }
                io.write_buf = Some(buf.clone());
                io.write_len = len;
                io.write_cb = Some(callback);
                Err(err)
            }
            result => result,
        }
    }

    /// Tears the connection down: stops all watchers, drops any pending
    /// callbacks and buffers and closes the socket. Idempotent; also runs
    /// on drop.
    pub fn disconnect(&self) -> Result<()> {
        self.inner.disconnect();
        Ok(())
    }

    /// Distinguishes a live connection from a remotely closed or half-closed
    /// one by peeking a byte.
    pub fn is_connected(&self) -> bool {
        let io = self.inner.io.lock().expect("client mutex poisoned");
        if io.state != ConnectState::Connected {
            return false;
        }
        let Some(fd) = io.fd.as_ref().map(|fd| fd.as_raw_fd()) else {
            return false;
        };
        let mut byte = [0u8; 1];
        match sys::recv(fd, &mut byte, libc::MSG_PEEK) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) => err.is_try_again(),
        }
    }

    pub fn local_addr(&self) -> Result<InetAddress> {
        let mut io = self.inner.io.lock().expect("client mutex poisoned");
        if let Some(local) = &io.local {
            return Ok(local.to_inet());
        }
        let fd = io.fd.as_ref().ok_or_else(|| Error::corruption("socket is not open"))?.as_raw_fd();
        let local = sys::getsockname(fd)?;
        io.local = Some(local);
        Ok(local.to_inet())
    }

    pub fn peer_addr(&self) -> Result<InetAddress> {
        let mut io = self.inner.io.lock().expect("client mutex poisoned");
        if io.state != ConnectState::Connected {
            return Err(Error::corruption("socket is not connected"));
        }
        if let Some(remote) = &io.remote {
            return Ok(remote.to_inet());
        }
        let fd = io.fd.as_ref().ok_or_else(|| Error::corruption("socket is not open"))?.as_raw_fd();
        let remote = sys::getpeername(fd)?;
        io.remote = Some(remote);
        Ok(remote.to_inet())
    }

    pub fn set_no_delay(&self, enable: bool) -> Result<()> {
        self.with_fd_raw(|fd| sys::set_nodelay(fd, enable))
    }

    pub fn set_keep_alive(&self, enable: bool, delay: i32) -> Result<()> {
        self.with_fd_raw(|fd| sys::set_keep_alive(fd, enable, delay))
    }

    pub fn set_receive_buffer_size(&self, size: i32) -> Result<()> {
        self.with_fd_raw(|fd| sys::set_receive_buffer_size(fd, size))
    }

    pub fn set_send_buffer_size(&self, size: i32) -> Result<()> {
        self.with_fd_raw(|fd| sys::set_send_buffer_size(fd, size))
    }

    fn with_fd_raw(&self, f: impl FnOnce(RawFd) -> Result<()>) -> Result<()> {
        let io = self.inner.io.lock().expect("client mutex poisoned");
        let fd = io.fd.as_ref().ok_or_else(|| Error::corruption("socket is not open"))?.as_raw_fd();
        f(fd)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}

fn do_read(io: &ClientIo, buf: &Buffer, len: usize) -> Result<usize> {
    let fd = io.fd.as_ref().ok_or_else(|| Error::corruption("socket is not open"))?.as_raw_fd();
    buf.with_write(len, |bytes| sys::read(fd, bytes))
}

fn do_write(io: &ClientIo, buf: &Buffer, len: usize) -> Result<usize> {
    let fd = io.fd.as_ref().ok_or_else(|| Error::corruption("socket is not open"))?.as_raw_fd();
    buf.with_read(len, |bytes| sys::write(fd, bytes))
}

impl ClientInner {
    fn arm_read_watch(&self, io: &ClientIo) -> bool {
        let Some(fd) = io.fd.as_ref().map(|fd| fd.as_raw_fd()) else {
            return false;
        };
        let watcher: Weak<dyn IoWatcher> = self.weak.clone();
        IoManager::get().watch(fd, IoType::read_only(), watcher, &self.read_ctrl)
    }

    fn arm_write_watch(&self, io: &ClientIo) -> bool {
        let Some(fd) = io.fd.as_ref().map(|fd| fd.as_raw_fd()) else {
            return false;
        };
        let watcher: Weak<dyn IoWatcher> = self.weak.clone();
        IoManager::get().watch(fd, IoType::write_only(), watcher, &self.write_ctrl)
    }

    fn disconnect(&self) {
        {
            let mut io = self.io.lock().expect("client mutex poisoned");
            io.state = ConnectState::Idle;
            io.connect_cb = None;
            io.read_ready = None;
            io.read_buf = None;
            io.read_len = 0;
            io.read_cb = None;
            io.write_buf = None;
            io.write_len = 0;
            io.write_cb = None;
        }
        // the slots are cleared, so a racing readiness task no-ops; stop
        // outside the lock so a running one can finish
        self.connect_ctrl.stop_watching();
        self.read_ctrl.stop_watching();
        self.write_ctrl.stop_watching();

        let mut io = self.io.lock().expect("client mutex poisoned");
        io.fd = None;
        io.local = None;
        io.remote = None;
    }

    /// The async connect resolved, or resolution is still pending.
    fn on_connect_ready(&self, fd: RawFd) {
        let status = sys::take_socket_error(fd);
        if matches!(&status, Err(err) if err.is_try_again()) {
            return;
        }
        let callback = {
            let mut io = self.io.lock().expect("client mutex poisoned");
            if io.connect_cb.is_none() {
                return;
            }
            self.connect_ctrl.stop_watching();
            if status.is_ok() {
                io.state = ConnectState::Connected;
            } else {
                io.state = ConnectState::Idle;
                io.remote = None;
            }
            io.connect_cb.take()
        };
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn on_read_ready(&self) {
        let mut io = self.io.lock().expect("client mutex poisoned");
        let Some(slot) = io.read_ready.take() else {
            return;
        };
        // stopping our own readiness task is the self-thread no-wait case
        self.read_ctrl.stop_watching();
        match slot {
            ReadReady::User(callback) => {
                drop(io);
                callback(Ok(()));
            }
            ReadReady::Retry => {
                let buf = io.read_buf.clone().expect("read buffer stashed");
                let len = io.read_len;
                match do_read(&io, &buf, len) {
                    Err(err) if err.is_try_again() => {
                        if self.arm_read_watch(&io) {
                            io.read_ready = Some(ReadReady::Retry);
                        } else {
                            io.read_buf = None;
                            io.read_len = 0;
                            let callback = io.read_cb.take();
                            drop(io);
                            if let Some(callback) = callback {
                                callback(Err(Error::internal(
                                    "failed to watch the socket for read",
                                )));
                            }
                        }
                    }
                    result => {
                        io.read_buf = None;
                        io.read_len = 0;
                        let callback = io.read_cb.take().expect("read callback stashed");
                        drop(io);
                        callback(result);
                    }
                }
            }
        }
    }

    fn on_write_ready(&self) {
        let mut io = self.io.lock().expect("client mutex poisoned");
        if io.write_cb.is_none() {
            return;
        }
        let buf = io.write_buf.clone().expect("write buffer stashed");
        let len = io.write_len;
        match do_write(&io, &buf, len) {
            // not actually writable yet; the watch stays armed
            Err(err) if err.is_try_again() => {}
            result => {
                self.write_ctrl.stop_watching();
                io.write_buf = None;
                io.write_len = 0;
                // clear the slot before the callback so it may write again
                let callback = io.write_cb.take().expect("write callback stashed");
                drop(io);
                callback(result);
            }
        }
    }
}

impl IoWatcher for ClientInner {
    fn on_readable(&self, _fd: RawFd) {
        self.on_read_ready();
    }

    fn on_writable(&self, fd: RawFd) {
        let state = self.io.lock().expect("client mutex poisoned").state;
        match state {
            ConnectState::Connecting => self.on_connect_ready(fd),
            ConnectState::Connected => self.on_write_ready(),
            ConnectState::Idle => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::net::tcp_server::{self, TcpServer};
    use crate::testutil::AsyncResult;

    fn loopback() -> InetAddress { InetAddress::ipv4("127.0.0.1", 0).unwrap() }

    fn listener() -> TcpServer {
        let options = tcp_server::Options { reuse_address: true, backlog: 5 };
        TcpServer::listen(&loopback(), &options).unwrap()
    }

    fn connected_pair(server: &TcpServer) -> (TcpClient, TcpClient) {
        let address = server.local_addr().unwrap();

        let connect_result: AsyncResult<Result<()>> = AsyncResult::new();
        let connecting = TcpClient::connect(
            &address,
            &Options::default(),
            None,
            connect_result.callback(),
        )
        .unwrap();

        let accept_result: AsyncResult<Result<(TcpClient, InetAddress)>> = AsyncResult::new();
        let sync = server.accept(accept_result.callback());
        let (accepted, _peer) = accept_result.get_result(sync).unwrap();

        let client = match connecting {
            Connecting::Done(client) => client,
            Connecting::Pending(client) => {
                connect_result.wait().unwrap();
                client
            }
        };
        assert!(client.is_connected());
        assert!(accepted.is_connected());
        (accepted, client)
    }

    #[test]
    fn connect_and_disconnect() {
        let server = listener();
        let (accepted, client) = connected_pair(&server);

        assert_eq!(client.peer_addr().unwrap(), server.local_addr().unwrap());
        assert_eq!(accepted.peer_addr().unwrap(), client.local_addr().unwrap());

        accepted.disconnect().unwrap();
        client.disconnect().unwrap();
        assert!(!accepted.is_connected());
        assert!(!client.is_connected());
    }

    #[test]
    fn connect_applies_options() {
        let server = listener();
        let address = server.local_addr().unwrap();
        let options = Options {
            no_delay: true,
            keep_alive: Some(30),
            receive_buffer_size: Some(64 * 1024),
            send_buffer_size: Some(64 * 1024),
        };
        let connect_result: AsyncResult<Result<()>> = AsyncResult::new();
        let connecting =
            TcpClient::connect(&address, &options, None, connect_result.callback()).unwrap();
        let accept_result: AsyncResult<Result<(TcpClient, InetAddress)>> = AsyncResult::new();
        let sync = server.accept(accept_result.callback());
        accept_result.get_result(sync).unwrap();
        if connecting.is_pending() {
            connect_result.wait().unwrap();
        }
    }

    #[test]
    fn connect_to_a_non_listening_port_fails() {
        // a bound socket which never listens reserves the port and refuses
        // every connection attempt
        let reserved = sys::socket(libc::AF_INET).unwrap();
        let bind_to = SockaddrStorage::from_inet(&loopback()).unwrap();
        sys::bind(reserved.as_raw_fd(), &bind_to).unwrap();
        let address = sys::getsockname(reserved.as_raw_fd()).unwrap().to_inet();

        let connect_result: AsyncResult<Result<()>> = AsyncResult::new();
        let outcome =
            TcpClient::connect(&address, &Options::default(), None, connect_result.callback());
        let status = match outcome {
            Err(err) => Err(err),
            Ok(Connecting::Done(_)) => Ok(()),
            Ok(Connecting::Pending(_client)) => connect_result.wait(),
        };
        assert!(status.is_err());
    }

    #[test]
    fn echo_byte() {
        let server = listener();
        let (accepted, client) = connected_pair(&server);

        // client -> server
        let payload = Buffer::from_string("a");
        let write_result: AsyncResult<Result<usize>> = AsyncResult::new();
        let written = write_result
            .get_result(client.write(&payload, payload.len(), write_result.callback()))
            .unwrap();
        assert_eq!(written, 1);

        let incoming = Buffer::with_size(1);
        let read_result: AsyncResult<Result<usize>> = AsyncResult::new();
        let read = read_result
            .get_result(accepted.read(&incoming, incoming.len(), read_result.callback()))
            .unwrap();
        assert_eq!(read, 1);
        assert_eq!(incoming.copy_out(), b"a");

        // server -> client
        let write_result: AsyncResult<Result<usize>> = AsyncResult::new();
        let written = write_result
            .get_result(accepted.write(&incoming, 1, write_result.callback()))
            .unwrap();
        assert_eq!(written, 1);

        let echoed = Buffer::with_size(1);
        let read_result: AsyncResult<Result<usize>> = AsyncResult::new();
        let read = read_result
            .get_result(client.read(&echoed, 1, read_result.callback()))
            .unwrap();
        assert_eq!(read, 1);
        assert_eq!(echoed.copy_out(), b"a");

        accepted.disconnect().unwrap();
        client.disconnect().unwrap();
    }

    #[test]
    fn partial_reads_reconstruct_the_stream() {
        let server = listener();
        let (accepted, client) = connected_pair(&server);

        // drain the outgoing message through repeated partial writes
        let message = b"test message";
        let mut outgoing = crate::DrainableBuffer::new(Buffer::from_slice(message), message.len());
        while outgoing.bytes_remaining() > 0 {
            let window = outgoing.remaining();
            let write_result: AsyncResult<Result<usize>> = AsyncResult::new();
            let n = write_result
                .get_result(accepted.write(&window, window.len(), write_result.callback()))
                .unwrap();
            outgoing.did_consume(n);
        }
        assert_eq!(outgoing.bytes_consumed(), message.len());

        // reassemble it on the far side through repeated partial reads
        let mut incoming = crate::GrowableBuffer::new();
        incoming.set_capacity(message.len());
        while incoming.remaining_capacity() > 0 {
            let window = incoming.write_window();
            let len = window.len().min(3);
            let read_result: AsyncResult<Result<usize>> = AsyncResult::new();
            let n = read_result
                .get_result(client.read(&window, len, read_result.callback()))
                .unwrap();
            assert!(n > 0, "unexpected EOF");
            incoming.set_offset(incoming.offset() + n);
        }
        assert_eq!(incoming.as_buffer().copy_out(), message);
    }

    #[test]
    fn read_reports_eof_as_zero() {
        let server = listener();
        let (accepted, client) = connected_pair(&server);

        client.disconnect().unwrap();
        let buf = Buffer::with_size(4);
        let read_result: AsyncResult<Result<usize>> = AsyncResult::new();
        let n = read_result
            .get_result(accepted.read(&buf, buf.len(), read_result.callback()))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn zero_length_write_is_invalid() {
        let server = listener();
        let (_accepted, client) = connected_pair(&server);

        let buf = Buffer::with_size(4);
        let write_result: AsyncResult<Result<usize>> = AsyncResult::new();
        let err = client.write(&buf, 0, write_result.callback()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArg);
    }

    #[test]
    fn cancel_read_if_ready_suppresses_the_callback() {
        let server = listener();
        let (accepted, client) = connected_pair(&server);

        let armed: AsyncResult<Result<()>> = AsyncResult::new();
        assert!(client.read_if_ready(armed.callback()).unwrap_err().is_try_again());
        client.cancel_read_if_ready().unwrap();

        // data arriving after the cancel must not fire the old callback
        let payload = Buffer::from_string("x");
        let write_result: AsyncResult<Result<usize>> = AsyncResult::new();
        write_result
            .get_result(accepted.write(&payload, 1, write_result.callback()))
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!armed.has_fired());

        // a re-issued watch sees the byte which is already waiting
        let rearmed: AsyncResult<Result<()>> = AsyncResult::new();
        assert!(client.read_if_ready(rearmed.callback()).unwrap_err().is_try_again());
        rearmed.wait().unwrap();

        let buf = Buffer::with_size(1);
        let read_result: AsyncResult<Result<usize>> = AsyncResult::new();
        let n = read_result
            .get_result(client.read(&buf, 1, read_result.callback()))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf.copy_out(), b"x");
    }

    #[test]
    fn is_connected_sees_remote_close() {
        let server = listener();
        let (accepted, client) = connected_pair(&server);

        // a pending byte keeps the socket observably alive
        let payload = Buffer::from_string("y");
        let write_result: AsyncResult<Result<usize>> = AsyncResult::new();
        write_result
            .get_result(client.write(&payload, 1, write_result.callback()))
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(accepted.is_connected());

        client.disconnect().unwrap();
        thread::sleep(Duration::from_millis(50));
        // the peeked byte is still there, so the socket still reads as live
        assert!(accepted.is_connected());

        // drain the byte; now only the EOF remains
        let buf = Buffer::with_size(1);
        let read_result: AsyncResult<Result<usize>> = AsyncResult::new();
        read_result.get_result(accepted.read(&buf, 1, read_result.callback())).unwrap();
        assert!(!accepted.is_connected());
    }

    #[test]
    fn callbacks_may_chain_writes() {
        let server = listener();
        let (accepted, client) = connected_pair(&server);

        // complete a parked write whose callback immediately writes again:
        // legal because the pending slot is cleared before the callback runs
        let big = Buffer::with_size(1 << 20);
        let mut parked = None;
        for _ in 0..64 {
            let write_result: AsyncResult<Result<usize>> = AsyncResult::new();
            match client.write(&big, big.len(), write_result.callback()) {
                Ok(_) => continue,
                Err(err) if err.is_try_again() => {
                    parked = Some(write_result);
                    break;
                }
                Err(err) => panic!("write failed: {err}"),
            }
        }
        let parked = parked.expect("socket buffer never filled");

        // drain the peer until the parked write completes
        let drained = Buffer::with_size(1 << 16);
        loop {
            if parked.has_fired() {
                break;
            }
            let read_result: AsyncResult<Result<usize>> = AsyncResult::new();
            let n = read_result
                .get_result(accepted.read(&drained, drained.len(), read_result.callback()))
                .unwrap();
            assert!(n > 0);
        }
        let completed = parked.wait().unwrap();
        assert!(completed > 0);

        // the slot is free again immediately
        let tail = Buffer::from_string("z");
        let write_result: AsyncResult<Result<usize>> = AsyncResult::new();
        write_result.get_result(client.write(&tail, 1, write_result.callback())).unwrap();
    }
}
