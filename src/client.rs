//! Per-connection state: receive buffer, framing loop, protocol state.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;

use crate::client_handle::ClientWriteHandle;
use crate::error::Result;
use crate::packet::{self, Packet};

/// Initial receive buffer size; grows as needed for larger frames.
const INITIAL_BUFFER_SIZE: usize = 1024;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Accepted, no client id yet. All packet types are still accepted in
    /// this state; CONNECT is not required to come first.
    Connected,
    /// A CONNECT was accepted and a client id recorded.
    Identified,
    /// Terminal: the next cleanup pass removes this connection from the
    /// worker table and every shared structure.
    Disconnecting,
}

pub struct Client {
    pub token: Token,
    pub socket: TcpStream,
    pub addr: SocketAddr,
    pub state: ClientState,
    /// Set by an accepted CONNECT; a second CONNECT silently overwrites it.
    pub client_id: Option<String>,
    /// Parsed from CONNECT, never enforced.
    pub keep_alive: u16,

    /// Incoming bytes not yet consumed as frames.
    read_buf: Vec<u8>,
    read_pos: usize,
    /// The peer closed its end (zero-length read). Frames already buffered
    /// are still dispatched; then the connection is torn down exactly as if
    /// it had sent DISCONNECT.
    pub peer_closed: bool,

    /// Shared write side: any worker may queue fanout frames here.
    pub handle: Arc<ClientWriteHandle>,
}

impl Client {
    pub fn new(token: Token, socket: TcpStream, addr: SocketAddr, worker_id: usize, epoll_fd: i32) -> Self {
        let socket_fd = socket.as_raw_fd();
        let handle = Arc::new(ClientWriteHandle::new(worker_id, epoll_fd, socket_fd, token));

        Self {
            token,
            socket,
            addr,
            state: ClientState::Connected,
            client_id: None,
            keep_alive: 0,
            read_buf: vec![0u8; INITIAL_BUFFER_SIZE],
            read_pos: 0,
            peer_closed: false,
            handle,
        }
    }

    /// Drain the socket into the receive buffer. Returns the number of new
    /// bytes. A zero-length read marks the peer as closed; the caller
    /// finishes dispatching buffered frames and then treats the connection
    /// as disconnected (an incomplete tail is discarded).
    pub fn read(&mut self) -> Result<usize> {
        let mut total = 0usize;
        loop {
            if self.read_pos >= self.read_buf.len() {
                let new_size = self.read_buf.len() * 2;
                self.read_buf.resize(new_size, 0);
            }

            match self.socket.read(&mut self.read_buf[self.read_pos..]) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(total);
                }
                Ok(n) => {
                    self.read_pos += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(total);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Extract the next complete frame from the receive buffer, removing
    /// exactly its bytes. `Ok(None)` means wait for more input.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        if self.read_pos == 0 {
            return Ok(None);
        }

        match packet::decode_frame(&self.read_buf[..self.read_pos])? {
            Some((packet, consumed)) => {
                self.read_buf.copy_within(consumed..self.read_pos, 0);
                self.read_pos -= consumed;
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Flush queued outbound bytes. Returns false if the socket would block.
    pub fn flush(&mut self) -> io::Result<bool> {
        self.handle.flush(&mut self.socket)
    }
}
