//! Broker server: accepts connections and distributes them to workers.
//!
//! Runs single-threaded (one worker, driven from the accept thread) or
//! multi-threaded (N worker threads, accept loop in the main thread).

use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::error::Result;
use crate::shared::SharedStateHandle;
use crate::worker::{Worker, WorkerMsg};

/// Token for the listener socket.
const LISTENER: Token = Token(0);

/// Capacity of each worker's control channel.
const CHANNEL_CAPACITY: usize = 4096;

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    worker_senders: Vec<Sender<WorkerMsg>>,
    /// Round-robin cursor for connection distribution.
    next_worker: usize,
    num_workers: usize,
    shared: SharedStateHandle,
    log_packet_times: bool,
}

impl Server {
    /// Bind the listener and prepare for `num_workers` workers.
    pub fn with_workers(
        addr: SocketAddr,
        num_workers: usize,
        shared: SharedStateHandle,
        log_packet_times: bool,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        info!("relaymq listening on {}", listener.local_addr()?);

        Ok(Self {
            poll,
            listener,
            worker_senders: Vec::new(),
            next_worker: 0,
            num_workers,
            shared,
            log_packet_times,
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop and workers. Does not return under normal
    /// operation.
    pub fn run(&mut self) -> Result<()> {
        let mut receivers = Vec::with_capacity(self.num_workers);
        for _ in 0..self.num_workers {
            let (tx, rx) = bounded(CHANNEL_CAPACITY);
            self.worker_senders.push(tx);
            receivers.push(rx);
        }

        if self.num_workers == 1 {
            // Single worker: drive it from this thread (best latency).
            let rx = receivers.remove(0);
            let mut worker = Worker::new(0, self.shared.clone(), rx, self.log_packet_times)?;

            let mut events = Events::with_capacity(256);

            loop {
                self.poll
                    .poll(&mut events, Some(Duration::from_millis(1)))?;

                for event in events.iter() {
                    if event.token() == LISTENER {
                        self.accept_connections()?;
                    }
                }

                worker.run_once()?;
            }
        } else {
            let mut handles = Vec::with_capacity(self.num_workers);

            for (id, rx) in receivers.into_iter().enumerate() {
                let shared = self.shared.clone();
                let log_packet_times = self.log_packet_times;

                let handle = thread::Builder::new()
                    .name(format!("worker-{}", id))
                    .spawn(move || {
                        let mut worker = Worker::new(id, shared, rx, log_packet_times)
                            .expect("failed to create worker");
                        if let Err(e) = worker.run() {
                            error!("worker {} error: {}", id, e);
                        }
                    })?;

                handles.push(handle);
            }

            info!("spawned {} worker threads", self.num_workers);

            let mut events = Events::with_capacity(256);

            loop {
                self.poll
                    .poll(&mut events, Some(Duration::from_millis(100)))?;

                for event in events.iter() {
                    if event.token() == LISTENER {
                        self.accept_connections()?;
                    }
                }
            }
        }
    }

    /// Accept pending connections and hand each to the next worker.
    fn accept_connections(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    let worker_id = self.next_worker;
                    self.next_worker = (self.next_worker + 1) % self.num_workers;

                    debug!("accepted {} -> worker {}", addr, worker_id);

                    let _ =
                        self.worker_senders[worker_id].send(WorkerMsg::NewClient { socket, addr });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
