//! End-to-end dispatch exercises against in-process fake nodes speaking the
//! binary KV protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use reef_common::config::{ClientConfig, Seed};
use reef_common::error::ReefError;
use reef_common::types::{Cas, Deadline};
use reef_kv::dispatcher::StoreOptions;
use reef_kv::KvDispatcher;
use reef_protocol::{
    decode_packet, encode_packet, DecodeOutcome, Packet, DEFAULT_MAX_FRAME_SIZE, OP_GET, OP_HELLO,
    OP_SELECT_BUCKET, OP_SET, STATUS_ETMPFAIL, STATUS_NOT_MY_VBUCKET, STATUS_SUCCESS,
};
use reef_topology::{ConfigProvider, MapHandle, ProviderConfig};

type Behavior = dyn Fn(&Packet) -> Option<Packet> + Send + Sync;

/// One fake data node: answers the handshake itself, hands everything else
/// to the scripted behavior, and records every request it sees.
struct FakeNode {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<Packet>>>,
}

impl FakeNode {
    async fn spawn(behavior: Arc<Behavior>) -> FakeNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_accept = seen.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => return,
                };
                let behavior = behavior.clone();
                let seen = seen_accept.clone();
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
                        seen.lock().push(packet.clone());
                        let response = match packet.opcode {
                            OP_HELLO => {
                                let mut r =
                                    Packet::response(OP_HELLO, STATUS_SUCCESS, packet.opaque);
                                r.value = packet.value.clone();
                                Some(r)
                            }
                            OP_SELECT_BUCKET => Some(Packet::response(
                                OP_SELECT_BUCKET,
                                STATUS_SUCCESS,
                                packet.opaque,
                            )),
                            _ => behavior(&packet).map(|mut r| {
                                r.opaque = packet.opaque;
                                r
                            }),
                        };
                        if let Some(resp) = response {
                            let frame = encode_packet(&resp, DEFAULT_MAX_FRAME_SIZE).unwrap();
                            if socket.write_all(&frame).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        FakeNode { addr, seen }
    }

    fn requests_of(&self, opcode: u8) -> Vec<Packet> {
        self.seen
            .lock()
            .iter()
            .filter(|p| p.opcode == opcode)
            .cloned()
            .collect()
    }
}

/// Bucket-config blob mapping every partition to `owner` (index into nodes).
fn config_blob(rev: u64, nodes: &[SocketAddr], num_partitions: usize, owner: usize) -> Vec<u8> {
    let nodes_ext: Vec<String> = nodes
        .iter()
        .map(|a| {
            format!(
                r#"{{"hostname":"127.0.0.1","services":{{"kv":{},"mgmt":8091}}}}"#,
                a.port()
            )
        })
        .collect();
    let map: Vec<String> = (0..num_partitions)
        .map(|_| format!("[{}]", owner))
        .collect();
    format!(
        r#"{{"rev":{},"name":"b","nodesExt":[{}],"vBucketServerMap":{{"numReplicas":0,"vBucketMap":[{}]}}}}"#,
        rev,
        nodes_ext.join(","),
        map.join(",")
    )
    .into_bytes()
}

fn test_client_config() -> ClientConfig {
    ClientConfig {
        seeds: vec![Seed {
            host: "127.0.0.1".into(),
            kv_port: None,
        }],
        bucket: None,
        username: String::new(),
        password: String::new(),
        ..ClientConfig::default()
    }
}

fn build_stack(blob: &[u8]) -> (Arc<ConfigProvider>, Arc<KvDispatcher>) {
    let cfg = test_client_config();
    let provider = ConfigProvider::new(
        ProviderConfig::from_client_config(&cfg),
        Arc::new(MapHandle::new()),
    );
    provider.apply_blob(blob, "127.0.0.1").unwrap();
    let dispatcher = KvDispatcher::new(&cfg, provider.clone());
    (provider, dispatcher)
}

fn far() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

#[tokio::test]
async fn test_basic_get_routes_to_computed_partition() {
    // Cluster of one node, 64 partitions; "k" hashes to partition 34.
    let node = FakeNode::spawn(Arc::new(|req: &Packet| {
        assert_eq!(req.opcode, OP_GET);
        let mut r = Packet::response(OP_GET, STATUS_SUCCESS, 0);
        r.extras = vec![0, 0, 0, 0];
        r.value = b"v".to_vec();
        Some(r)
    }))
    .await;

    let (_provider, dispatcher) = build_stack(&config_blob(1, &[node.addr], 64, 0));
    let got = dispatcher.get(b"k", far()).await.unwrap();
    assert_eq!(got.value, b"v");

    let gets = node.requests_of(OP_GET);
    assert_eq!(gets.len(), 1);
    assert_eq!(gets[0].status_or_partition, 34);
    assert_eq!(gets[0].key, b"k");
}

#[tokio::test]
async fn test_not_my_partition_retries_on_promoted_node() {
    // First attempt lands on node A, which disowns the partition and embeds
    // a config promoting node B. The retry must route to B and succeed with
    // no caller-visible error, two attempts total.
    let b = FakeNode::spawn(Arc::new(|_req: &Packet| {
        let mut r = Packet::response(OP_GET, STATUS_SUCCESS, 0);
        r.extras = vec![0, 0, 0, 0];
        r.value = b"from-b".to_vec();
        Some(r)
    }))
    .await;

    let promoted = config_blob(2, &[b.addr], 64, 0);
    let a = FakeNode::spawn(Arc::new(move |_req: &Packet| {
        let mut r = Packet::response(OP_GET, STATUS_NOT_MY_VBUCKET, 0);
        r.value = promoted.clone();
        Some(r)
    }))
    .await;

    let (provider, dispatcher) = build_stack(&config_blob(1, &[a.addr], 64, 0));

    let got = dispatcher.get(b"k", far()).await.unwrap();
    assert_eq!(got.value, b"from-b");
    assert_eq!(a.requests_of(OP_GET).len(), 1);
    assert_eq!(b.requests_of(OP_GET).len(), 1);
    // The embedded config was installed for everyone else too.
    assert_eq!(provider.map().rev(), Some(2));
}

#[tokio::test]
async fn test_deadline_releases_caller_when_no_connection_becomes_ready() {
    // A node that accepts sockets and reads frames but never writes a byte:
    // the handshake never completes, so no connection becomes Ready.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bytes_seen = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = bytes_seen.clone();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => return,
            };
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => sink.lock().extend_from_slice(&buf[..n]),
                    }
                }
            });
        }
    });

    let (_provider, dispatcher) = build_stack(&config_blob(1, &[addr], 64, 0));

    let started = std::time::Instant::now();
    let err = dispatcher
        .get(b"k", Deadline::after(Duration::from_millis(80)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(2));

    // Only the HELLO frame ever hit the wire; no operation frame followed.
    let wire = bytes_seen.lock().clone();
    if !wire.is_empty() {
        assert_eq!(wire[1], OP_HELLO);
        if let DecodeOutcome::Complete { consumed, .. } =
            decode_packet(&wire, DEFAULT_MAX_FRAME_SIZE).unwrap()
        {
            assert_eq!(consumed, wire.len(), "a frame beyond HELLO was written");
        }
    }
}

#[tokio::test]
async fn test_transient_statuses_retry_until_success() {
    use std::sync::atomic::{AtomicU32, Ordering};
    let hits = Arc::new(AtomicU32::new(0));
    let hits_behavior = hits.clone();
    let node = FakeNode::spawn(Arc::new(move |_req: &Packet| {
        let n = hits_behavior.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            Some(Packet::response(OP_GET, STATUS_ETMPFAIL, 0))
        } else {
            let mut r = Packet::response(OP_GET, STATUS_SUCCESS, 0);
            r.extras = vec![0, 0, 0, 0];
            r.value = b"eventually".to_vec();
            Some(r)
        }
    }))
    .await;

    let (_provider, dispatcher) = build_stack(&config_blob(1, &[node.addr], 64, 0));
    let got = dispatcher.get(b"k", far()).await.unwrap();
    assert_eq!(got.value, b"eventually");
    assert_eq!(node.requests_of(OP_GET).len(), 3);
}

#[tokio::test]
async fn test_domain_failure_surfaces_without_retry() {
    let node = FakeNode::spawn(Arc::new(|_req: &Packet| {
        Some(Packet::response(
            OP_GET,
            reef_protocol::STATUS_KEY_ENOENT,
            0,
        ))
    }))
    .await;

    let (_provider, dispatcher) = build_stack(&config_blob(1, &[node.addr], 64, 0));
    let err = dispatcher.get(b"missing", far()).await.unwrap_err();
    assert!(matches!(
        err,
        ReefError::Kv(reef_common::error::KvError::KeyNotFound)
    ));
    assert_eq!(node.requests_of(OP_GET).len(), 1);
}

#[tokio::test]
async fn test_upsert_returns_cas_and_mutation_token() {
    let node = FakeNode::spawn(Arc::new(|req: &Packet| {
        assert_eq!(req.opcode, OP_SET);
        assert_eq!(req.extras.len(), 8); // flags + expiry
        let mut r = Packet::response(OP_SET, STATUS_SUCCESS, 0);
        r.cas = 0xfeed;
        let mut extras = Vec::new();
        extras.extend_from_slice(&7u64.to_be_bytes()); // partition uuid
        extras.extend_from_slice(&9u64.to_be_bytes()); // seqno
        r.extras = extras;
        Some(r)
    }))
    .await;

    let (_provider, dispatcher) = build_stack(&config_blob(1, &[node.addr], 64, 0));
    let result = dispatcher
        .upsert(
            b"doc",
            br#"{"n":1}"#.to_vec(),
            StoreOptions {
                flags: 0x0200_0000,
                expiry: 60,
                cas: Cas::NONE,
            },
            far(),
        )
        .await
        .unwrap();
    assert_eq!(result.cas, Cas(0xfeed));
    let token = result.token.unwrap();
    assert_eq!(token.partition_uuid, 7);
    assert_eq!(token.seqno, 9);
}

#[tokio::test]
async fn test_invalid_keys_rejected_before_any_io() {
    let node = FakeNode::spawn(Arc::new(|_req: &Packet| None)).await;
    let (_provider, dispatcher) = build_stack(&config_blob(1, &[node.addr], 64, 0));

    assert!(matches!(
        dispatcher.get(b"", far()).await.unwrap_err(),
        ReefError::InvalidArgument(_)
    ));
    let long_key = vec![b'x'; 251];
    assert!(matches!(
        dispatcher.get(&long_key, far()).await.unwrap_err(),
        ReefError::InvalidArgument(_)
    ));
    assert!(node.seen.lock().is_empty());
}

#[tokio::test]
async fn test_requests_on_one_connection_arrive_in_send_order() {
    use reef_kv::connection::{Connection, ConnectionConfig};

    // A bespoke node that completes the handshake, then collects five
    // pipelined requests before answering any of them (in reverse, so the
    // test also proves opaque correlation rather than arrival order).
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();

        async fn next_packet(socket: &mut tokio::net::TcpStream, buf: &mut BytesMut) -> Packet {
            loop {
                match decode_packet(buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
                    DecodeOutcome::Complete { packet, consumed } => {
                        buf.advance(consumed);
                        return packet;
                    }
                    DecodeOutcome::Incomplete { .. } => {
                        let n = socket.read_buf(buf).await.unwrap();
                        assert!(n > 0, "client hung up early");
                    }
                }
            }
        }

        // Handshake: HELLO only (no bucket, no credentials in the config).
        let hello = next_packet(&mut socket, &mut buf).await;
        assert_eq!(hello.opcode, OP_HELLO);
        let mut resp = Packet::response(OP_HELLO, STATUS_SUCCESS, hello.opaque);
        resp.value = hello.value.clone();
        let frame = encode_packet(&resp, DEFAULT_MAX_FRAME_SIZE).unwrap();
        socket.write_all(&frame).await.unwrap();

        let mut requests = Vec::new();
        for _ in 0..5 {
            requests.push(next_packet(&mut socket, &mut buf).await);
        }
        let keys: Vec<&[u8]> = requests.iter().map(|p| p.key.as_slice()).collect();
        assert_eq!(keys, vec![b"k0", b"k1", b"k2", b"k3", b"k4"]);

        for req in requests.iter().rev() {
            let mut r = Packet::response(OP_GET, STATUS_SUCCESS, req.opaque);
            r.extras = vec![0, 0, 0, 0];
            r.value = req.key.clone();
            let frame = encode_packet(&r, DEFAULT_MAX_FRAME_SIZE).unwrap();
            socket.write_all(&frame).await.unwrap();
        }
    });

    let mut conn_cfg = ConnectionConfig::from_client_config(&test_client_config());
    conn_cfg.bucket = None;
    let conn = Connection::connect(&addr.to_string(), &conn_cfg, None)
        .await
        .unwrap();

    let make = |key: &'static [u8]| {
        let mut p = Packet::request(OP_GET, 3);
        p.key = key.to_vec();
        p
    };
    let deadline = far();
    // join! polls left to right, so the writer enqueues in this order.
    let (r0, r1, r2, r3, r4) = tokio::join!(
        conn.send(make(b"k0"), deadline),
        conn.send(make(b"k1"), deadline),
        conn.send(make(b"k2"), deadline),
        conn.send(make(b"k3"), deadline),
        conn.send(make(b"k4"), deadline),
    );
    assert_eq!(r0.unwrap().value, b"k0");
    assert_eq!(r1.unwrap().value, b"k1");
    assert_eq!(r2.unwrap().value, b"k2");
    assert_eq!(r3.unwrap().value, b"k3");
    assert_eq!(r4.unwrap().value, b"k4");
    server.await.unwrap();
}
