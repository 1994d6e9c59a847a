//! Worker thread driving a subset of the broker's connections.
//!
//! Each worker owns a mio Poll, the clients assigned to it, and a channel
//! the accept loop hands new sockets over on. Publish delivery crosses
//! worker boundaries through `ClientWriteHandle` directly; no channels are
//! involved on that path.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam_channel::Receiver;
use log::{debug, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::client::{Client, ClientState};
use crate::error::Result;
use crate::packet::{self, ConnackCode, Connect, Packet, Publish, Subscribe};
use crate::shared::SharedStateHandle;

/// Control messages from the accept loop.
#[derive(Debug)]
pub enum WorkerMsg {
    NewClient {
        socket: TcpStream,
        addr: SocketAddr,
    },
    /// Reserved for graceful shutdown.
    #[allow(dead_code)]
    Shutdown,
}

/// First token handed to a client; tokens count up and are never reused.
const CLIENT_START: usize = 1;

pub struct Worker {
    pub id: usize,
    poll: Poll,
    /// Raw epoll fd, shared with every client's write handle.
    epoll_fd: i32,
    clients: AHashMap<Token, Client>,
    next_token: usize,
    shared: SharedStateHandle,
    rx: Receiver<WorkerMsg>,
    /// Emit one log line per handled packet (config toggle).
    log_packet_times: bool,
}

impl Worker {
    pub fn new(
        id: usize,
        shared: SharedStateHandle,
        rx: Receiver<WorkerMsg>,
        log_packet_times: bool,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let epoll_fd = poll.as_raw_fd();

        Ok(Self {
            id,
            poll,
            epoll_fd,
            clients: AHashMap::new(),
            next_token: CLIENT_START,
            shared,
            rx,
            log_packet_times,
        })
    }

    /// Run the worker event loop until shutdown.
    pub fn run(&mut self) -> Result<()> {
        while self.run_once()? {}
        Ok(())
    }

    /// One event-loop iteration. Returns false on shutdown.
    pub fn run_once(&mut self) -> Result<bool> {
        let mut events = Events::with_capacity(1024);

        self.poll
            .poll(&mut events, Some(Duration::from_millis(10)))?;

        for event in events.iter() {
            let token = event.token();
            if event.is_readable() {
                self.handle_readable(token)?;
            }
            if event.is_writable() {
                self.handle_writable(token)?;
            }
        }

        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                WorkerMsg::NewClient { socket, addr } => {
                    self.accept_client(socket, addr)?;
                }
                WorkerMsg::Shutdown => return Ok(false),
            }
        }

        self.cleanup_clients();

        Ok(true)
    }

    fn accept_client(&mut self, mut socket: TcpStream, addr: SocketAddr) -> Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;

        debug!("worker {}: client connected from {}", self.id, addr);
        self.shared.metrics.incr_connects();

        let client = Client::new(token, socket, addr, self.id, self.epoll_fd);
        self.clients.insert(token, client);

        Ok(())
    }

    fn handle_readable(&mut self, token: Token) -> Result<()> {
        {
            let Some(client) = self.clients.get_mut(&token) else {
                return Ok(());
            };

            match client.read() {
                Ok(n) => {
                    if n > 0 {
                        self.shared.metrics.add_bytes_in(n as u64);
                    }
                }
                Err(e) => {
                    debug!("read error from {}: {}", client.addr, e);
                    client.state = ClientState::Disconnecting;
                    return Ok(());
                }
            }
        }

        // Extract and dispatch complete frames in arrival order. An
        // incomplete tail stays buffered until the next readable event.
        loop {
            let (packet, addr) = {
                let Some(client) = self.clients.get_mut(&token) else {
                    return Ok(());
                };

                // Peer closed or DISCONNECT seen: leftover bytes are ignored.
                if client.state == ClientState::Disconnecting {
                    return Ok(());
                }

                match client.next_packet() {
                    Ok(Some(packet)) => (packet, client.addr),
                    Ok(None) => {
                        // Peer closed: same as DISCONNECT once the frames it
                        // managed to deliver are handled.
                        if client.peer_closed {
                            client.state = ClientState::Disconnecting;
                        }
                        break;
                    }
                    Err(e) => {
                        warn!("closing {}: {}", client.addr, e);
                        client.state = ClientState::Disconnecting;
                        return Ok(());
                    }
                }
            };

            let label = packet.label();
            let started = Instant::now();

            if let Err(e) = self.handle_packet(token, packet) {
                // Failure boundary is this one connection; the broker and
                // every other client keep running.
                warn!("error handling {} from {}: {}", label, addr, e);
                if let Some(client) = self.clients.get_mut(&token) {
                    client.state = ClientState::Disconnecting;
                }
                return Ok(());
            }

            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.shared.metrics.observe(&label, elapsed_ms);
            if self.log_packet_times {
                debug!("[{}] from={} cycle_ms={:.3}", label, addr, elapsed_ms);
            }
        }

        Ok(())
    }

    fn handle_writable(&mut self, token: Token) -> Result<()> {
        let Some(client) = self.clients.get_mut(&token) else {
            return Ok(());
        };

        if client.flush().is_err() {
            client.state = ClientState::Disconnecting;
        }

        Ok(())
    }

    fn handle_packet(&mut self, token: Token, packet: Packet) -> Result<()> {
        match packet {
            Packet::Connect(connect) => self.handle_connect(token, connect),
            Packet::Subscribe(subscribe) => self.handle_subscribe(token, subscribe),
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::Pingreq => {
                if let Some(client) = self.clients.get(&token) {
                    let frame = packet::encode_pingresp();
                    if client.handle.queue_bytes(&frame).is_ok() {
                        self.shared.metrics.add_bytes_out(frame.len() as u64);
                    }
                }
                Ok(())
            }
            Packet::Disconnect => {
                if let Some(client) = self.clients.get_mut(&token) {
                    client.state = ClientState::Disconnecting;
                }
                Ok(())
            }
            // Consumed and counted under its TYPE_<n> label; no reply.
            Packet::Unknown { .. } => Ok(()),
        }
    }

    fn handle_connect(&mut self, token: Token, connect: Connect) -> Result<()> {
        let Some(client) = self.clients.get_mut(&token) else {
            return Ok(());
        };

        if connect.protocol_name != "MQTT" || connect.level != 4 {
            // Unacceptable protocol version. The connection stays open and
            // no client id is recorded.
            let frame = packet::encode_connack(ConnackCode::UnacceptableProtocolVersion);
            if client.handle.queue_bytes(&frame).is_ok() {
                self.shared.metrics.add_bytes_out(frame.len() as u64);
            }
            return Ok(());
        }

        debug!(
            "worker {}: client {} identified as {:?}",
            self.id, client.addr, connect.client_id
        );

        // A repeated CONNECT overwrites the previous identity.
        client.client_id = Some(connect.client_id);
        client.keep_alive = connect.keep_alive;
        client.state = ClientState::Identified;

        let frame = packet::encode_connack(ConnackCode::Accepted);
        if client.handle.queue_bytes(&frame).is_ok() {
            self.shared.metrics.add_bytes_out(frame.len() as u64);
        }

        Ok(())
    }

    fn handle_subscribe(&mut self, token: Token, subscribe: Subscribe) -> Result<()> {
        let Some(client) = self.clients.get(&token) else {
            return Ok(());
        };
        let handle = client.handle.clone();

        {
            let mut subs = self.shared.subscriptions.write();
            for (topic, _requested_qos) in &subscribe.topics {
                subs.subscribe(topic, handle.clone());
            }
        }

        // Once per SUBSCRIBE packet, not per topic.
        self.shared.metrics.incr_subscribes();

        // Every grant is QoS 0, one byte per requested topic in order.
        let granted = vec![0u8; subscribe.topics.len()];
        let frame = packet::encode_suback(subscribe.packet_id, &granted);
        if handle.queue_bytes(&frame).is_ok() {
            self.shared.metrics.add_bytes_out(frame.len() as u64);
        }

        Ok(())
    }

    fn handle_publish(&mut self, publish: Publish) -> Result<()> {
        // Encode once; every subscriber receives the same bytes.
        let frame = packet::encode_publish(&publish.topic, &publish.payload);

        // Point-in-time snapshot: subscribers added after this line do not
        // receive this message, and registry changes during delivery cannot
        // disturb it.
        let targets = self.shared.subscriptions.read().fanout(&publish.topic);

        let mut delivered = 0u64;
        for sub in &targets {
            // Isolate-and-continue: a failed or slow subscriber is skipped,
            // the rest still get the message, and the publisher is never
            // told. This protocol subset has no way to say otherwise.
            match sub.queue_bytes(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(
                    "dropping publish to subscriber (worker={}, token={:?}): {}",
                    sub.worker_id(),
                    sub.token(),
                    e
                ),
            }
        }

        self.shared.metrics.incr_publishes();
        self.shared
            .metrics
            .add_bytes_out(frame.len() as u64 * delivered);

        Ok(())
    }

    /// Remove clients marked `Disconnecting`: deregister, clear every
    /// registry entry, count the disconnect. Runs on every loop iteration,
    /// so cleanup happens on all exit paths. Socket close errors are
    /// swallowed (the fd closes when the client drops).
    fn cleanup_clients(&mut self) {
        let disconnected: Vec<Token> = self
            .clients
            .iter()
            .filter(|(_, c)| c.state == ClientState::Disconnecting)
            .map(|(t, _)| *t)
            .collect();

        for token in disconnected {
            if let Some(mut client) = self.clients.remove(&token) {
                let _ = self.poll.registry().deregister(&mut client.socket);

                self.shared
                    .subscriptions
                    .write()
                    .unsubscribe_all(client.handle.key());
                self.shared.metrics.incr_disconnects();

                debug!(
                    "worker {}: client {} closed (id={:?})",
                    self.id, client.addr, client.client_id
                );
            }
        }
    }
}
