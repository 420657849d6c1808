//! Bounded pool of connections to a single node.
//!
//! `acquire` hands out a lease on a `Ready` connection, dialing a
//! replacement lazily when a slot is empty and parking the caller on a FIFO
//! waiter queue while another task is already dialing. Connections found
//! `Draining`/`Closed` are evicted on the next acquire.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout_at;

use reef_common::error::{ReefError, ReefResult, TransportError};
use reef_common::types::Deadline;

use crate::connection::{ConfigSink, Connection, ConnectionConfig};

enum Slot {
    Empty,
    /// Some task is dialing this slot; everyone else waits.
    Connecting,
    Up(Arc<Connection>),
}

struct PoolInner {
    slots: Vec<Slot>,
    /// Round-robin cursor over ready connections.
    next: usize,
    /// FIFO queue of acquirers parked while every slot is busy dialing.
    /// Lives under the same lock as the slots so that observing "nothing
    /// ready, nothing free" and parking are one atomic step; a dial that
    /// completes in between cannot lose the wakeup.
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A leased connection. Leases are shared: the connection multiplexes many
/// requests, and its own in-flight table provides the backpressure.
#[derive(Debug)]
pub struct ConnectionLease {
    conn: Arc<Connection>,
}

impl std::ops::Deref for ConnectionLease {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        &self.conn
    }
}

/// Pool of connections to one `host:port`.
pub struct NodePool {
    addr: String,
    cfg: ConnectionConfig,
    sink: Option<Arc<dyn ConfigSink>>,
    inner: Mutex<PoolInner>,
}

impl NodePool {
    /// `size` is clamped to 1..=64.
    pub fn new(
        addr: String,
        cfg: ConnectionConfig,
        size: usize,
        sink: Option<Arc<dyn ConfigSink>>,
    ) -> Arc<NodePool> {
        let size = size.clamp(1, 64);
        Arc::new(NodePool {
            addr,
            cfg,
            sink,
            inner: Mutex::new(PoolInner {
                slots: (0..size).map(|_| Slot::Empty).collect(),
                next: 0,
                waiters: VecDeque::new(),
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Lease a `Ready` connection before `deadline`.
    ///
    /// `NoCapacity` means the wait ran out while other tasks held the dial
    /// slots; `Timeout` means the deadline passed while dialing ourselves.
    pub async fn acquire(&self, deadline: Deadline) -> ReefResult<ConnectionLease> {
        loop {
            enum Action {
                Lease(Arc<Connection>),
                Dial(usize),
                Wait(oneshot::Receiver<()>),
            }

            let action = {
                let mut inner = self.inner.lock();
                for slot in inner.slots.iter_mut() {
                    if let Slot::Up(conn) = slot {
                        if !conn.is_ready() {
                            tracing::debug!(addr = %self.addr, peer = conn.peer(), "evicting broken connection");
                            *slot = Slot::Empty;
                        }
                    }
                }
                let len = inner.slots.len();
                let start = inner.next;
                let mut picked = None;
                for i in 0..len {
                    let idx = (start + i) % len;
                    if let Slot::Up(conn) = &inner.slots[idx] {
                        picked = Some((idx, conn.clone()));
                        break;
                    }
                }
                match picked {
                    Some((idx, conn)) => {
                        inner.next = (idx + 1) % len;
                        Action::Lease(conn)
                    }
                    None => match inner.slots.iter().position(|s| matches!(s, Slot::Empty)) {
                        Some(idx) => {
                            inner.slots[idx] = Slot::Connecting;
                            Action::Dial(idx)
                        }
                        None => {
                            let (tx, rx) = oneshot::channel();
                            inner.waiters.push_back(tx);
                            Action::Wait(rx)
                        }
                    },
                }
            };

            match action {
                Action::Lease(conn) => return Ok(ConnectionLease { conn }),
                Action::Dial(idx) => {
                    let conn_deadline = deadline.capped_by(self.cfg.connect_timeout);
                    let result = Connection::connect_until(
                        &self.addr,
                        &self.cfg,
                        self.sink.clone(),
                        conn_deadline,
                    )
                    .await;
                    let mut inner = self.inner.lock();
                    match result {
                        Ok(conn) => {
                            inner.slots[idx] = Slot::Up(conn.clone());
                            // Leases are shared, so every parked waiter can
                            // ride the fresh connection.
                            for tx in inner.waiters.drain(..) {
                                let _ = tx.send(());
                            }
                            return Ok(ConnectionLease { conn });
                        }
                        Err(e) => {
                            inner.slots[idx] = Slot::Empty;
                            // Hand the slot to the next waiter in line; a
                            // waiter whose acquire was cancelled is skipped.
                            while let Some(tx) = inner.waiters.pop_front() {
                                if tx.send(()).is_ok() {
                                    break;
                                }
                            }
                            drop(inner);
                            tracing::debug!(addr = %self.addr, error = %e, "dial failed");
                            return Err(e);
                        }
                    }
                }
                Action::Wait(rx) => match timeout_at(deadline.instant(), rx).await {
                    Ok(_) => continue,
                    Err(_) => return Err(ReefError::Transport(TransportError::NoCapacity)),
                },
            }
        }
    }

    /// Ready connections currently in the pool (diagnostics sweeps).
    pub fn ready_connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .slots
            .iter()
            .filter_map(|s| match s {
                Slot::Up(c) if c.is_ready() => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Close every connection and empty the pool.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            if let Slot::Up(conn) = slot {
                conn.close();
            }
            *slot = Slot::Empty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::{Buf, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use reef_protocol::{
        decode_packet, encode_packet, DecodeOutcome, Packet, DEFAULT_MAX_FRAME_SIZE, OP_HELLO,
        OP_NOOP, STATUS_SUCCESS,
    };

    fn pool_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_pipelined: 16,
            bucket: None,
            username: String::new(),
            password: String::new(),
            tls: false,
            enable_mutation_tokens: false,
            compression: false,
            unordered_execution: false,
            client_id: "reef-client/test".into(),
        }
    }

    /// Minimal node: answers HELLO and echoes NOOP successes.
    async fn spawn_fake_node() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    loop {
                        let packet = loop {
                            match decode_packet(&buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
                                DecodeOutcome::Complete { packet, consumed } => {
                                    buf.advance(consumed);
                                    break packet;
                                }
                                DecodeOutcome::Incomplete { .. } => {
                                    match socket.read_buf(&mut buf).await {
                                        Ok(0) | Err(_) => return,
                                        Ok(_) => {}
                                    }
                                }
                            }
                        };
                        let mut resp =
                            Packet::response(packet.opcode, STATUS_SUCCESS, packet.opaque);
                        if packet.opcode == OP_HELLO {
                            resp.value = packet.value.clone();
                        }
                        let frame = encode_packet(&resp, DEFAULT_MAX_FRAME_SIZE).unwrap();
                        if socket.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_acquire_dials_lazily_and_reuses() {
        let addr = spawn_fake_node().await;
        let pool = NodePool::new(addr.to_string(), pool_config(), 2, None);

        let lease = pool
            .acquire(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        let resp = lease
            .send(
                Packet::request(OP_NOOP, 0),
                Deadline::after(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), STATUS_SUCCESS);

        // Second acquire round-robins onto an established or fresh
        // connection without error.
        let again = pool
            .acquire(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(again.is_ready());
        assert_eq!(pool.ready_connections().len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_node_never_answers() {
        // Bound but never-accepting handshakes: connect succeeds through the
        // backlog, HELLO gets no answer, so no connection becomes Ready.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _keep = listener; // hold the socket open, never accept

        let pool = NodePool::new(addr.to_string(), pool_config(), 1, None);
        let start = tokio::time::Instant::now();
        let err = pool
            .acquire(Deadline::after(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "got {err}");
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(pool.ready_connections().is_empty());
    }

    #[tokio::test]
    async fn test_waiters_get_woken_fifo() {
        let addr = spawn_fake_node().await;
        let pool = NodePool::new(addr.to_string(), pool_config(), 1, None);

        // Three concurrent acquirers against one slot: one dials, the rest
        // park and are woken when the dial lands.
        let mut handles = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire(Deadline::after(Duration::from_secs(5))).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(pool.ready_connections().len(), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_evicted_and_replaced() {
        let addr = spawn_fake_node().await;
        let pool = NodePool::new(addr.to_string(), pool_config(), 1, None);

        let lease = pool
            .acquire(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        lease.close();
        drop(lease);

        // The dead connection is swept on the next acquire and a fresh one
        // dialed into its slot.
        let lease = pool
            .acquire(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(lease.is_ready());
        let resp = lease
            .send(
                Packet::request(OP_NOOP, 0),
                Deadline::after(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), STATUS_SUCCESS);
    }

    #[tokio::test]
    async fn test_close_empties_pool() {
        let addr = spawn_fake_node().await;
        let pool = NodePool::new(addr.to_string(), pool_config(), 2, None);
        let _ = pool
            .acquire(Deadline::after(Duration::from_secs(5)))
            .await
            .unwrap();
        pool.close();
        assert!(pool.ready_connections().is_empty());
    }
}
