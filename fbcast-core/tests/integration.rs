//! Integration tests: the full pipeline over a real TCP connection on
//! localhost, with a client-role `WsCodec` standing in for the browser.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fbcast_core::ws::{FrameFlags, OpCode};
use fbcast_core::{
    Broadcaster, BufferPool, ChannelInputSink, ClientId, CloseCode, FrameDims, FramePump,
    FrameQueue, InboundMessage, InputEvent, Scheduler, SchedulerHandle, StreamConfig,
    StreamServer, StreamStats, TieredAllocator, WsCodec, WsFrame,
};
use flate2::{Decompress, FlushDecompress};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
const DIMS: FrameDims = FrameDims::new(16, 8);
const WAIT: Duration = Duration::from_secs(5);

type Ws = Framed<TcpStream, WsCodec>;

// ── Helpers ──────────────────────────────────────────────────────

struct Harness {
    addr: SocketAddr,
    caster: Broadcaster,
    scheduler: SchedulerHandle,
    stats: Arc<StreamStats>,
    input: mpsc::Receiver<(ClientId, InboundMessage)>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn test_config() -> StreamConfig {
    StreamConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        dims: DIMS,
        chunk_size: 50,
        ping_interval: Duration::from_secs(3600),
        idle_timeout: Duration::ZERO,
        report_interval: Duration::ZERO,
        ..StreamConfig::default()
    }
}

/// Wire up queue, pool, scheduler, pump and acceptor on an ephemeral port.
async fn start(config: StreamConfig) -> Harness {
    let config = Arc::new(config);
    let stats = Arc::new(StreamStats::new());
    let allocator = TieredAllocator::heap();
    let pool = BufferPool::new(
        config.pool_buffers,
        config.pool_buffer_size(),
        allocator.clone(),
    )
    .unwrap();
    let queue = Arc::new(
        FrameQueue::new(config.frame_queue_depth, config.dims, &allocator)
            .unwrap()
            .with_stats(Arc::clone(&stats)),
    );
    let cancel = CancellationToken::new();

    let (scheduler, _worker) =
        Scheduler::spawn(&config, pool.clone(), Arc::clone(&stats), cancel.clone());
    let (input_sink, input) = ChannelInputSink::channel(16);
    let server = StreamServer::bind(
        Arc::clone(&config),
        scheduler.clone(),
        Arc::new(input_sink),
        Arc::clone(&stats),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run(cancel.clone()));

    let pump = FramePump::new(Arc::clone(&queue), pool, scheduler.clone())
        .with_poll_interval(Duration::from_millis(10));
    tokio::spawn(pump.run(cancel.clone()));

    Harness {
        addr,
        caster: Broadcaster::new(queue),
        scheduler,
        stats,
        input,
        cancel,
    }
}

/// Send an upgrade request and return the response head plus the stream.
async fn request(addr: SocketAddr, path: &str, extra_headers: &str) -> (String, TcpStream, BytesMut) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         {extra_headers}\r\n"
    );
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut buf = BytesMut::with_capacity(1024);
    let end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = timeout(WAIT, stream.read_buf(&mut buf))
            .await
            .expect("response timed out")
            .unwrap();
        if n == 0 {
            break buf.len();
        }
    };
    let head = String::from_utf8(buf.split_to(end).to_vec()).unwrap();
    (head, stream, buf)
}

/// Upgrade and wrap the stream in a client-role codec.
async fn connect(h: &Harness, extra_headers: &str) -> (String, Ws) {
    let before = h.scheduler.client_count();
    let (head, stream, leftover) = request(h.addr, "/ws", extra_headers).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");

    let deflate = head.contains("permessage-deflate");
    let mut ws = Framed::new(stream, WsCodec::client(1 << 20).with_deflate(deflate));
    ws.read_buffer_mut().extend_from_slice(&leftover);
    wait_for(|| h.scheduler.client_count() > before).await;
    (head, ws)
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Next frame that is not a server ping.
async fn next_frame(ws: &mut Ws) -> WsFrame {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("decode error");
        if frame.opcode() != OpCode::Ping {
            return frame;
        }
    }
}

/// Read one whole data message, returning its fragments.
async fn next_message(ws: &mut Ws) -> Vec<WsFrame> {
    let mut fragments = Vec::new();
    loop {
        let frame = next_frame(ws).await;
        let done = frame.is_final();
        fragments.push(frame);
        if done {
            return fragments;
        }
    }
}

fn test_pattern() -> Vec<u8> {
    (0..DIMS.pixel_count()).map(|i| (i * 7) as u8).collect()
}

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test]
async fn test_upgrade_returns_accept_key() {
    let h = start(test_config()).await;
    let (head, _ws) = connect(&h, "").await;
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}")));
    assert!(!head.contains("permessage-deflate"));
    assert_eq!(h.stats.snapshot().handshake.count, 1);
}

#[tokio::test]
async fn test_wrong_path_gets_404() {
    let h = start(test_config()).await;
    let (head, _, _) = request(h.addr, "/other", "").await;
    assert!(head.starts_with("HTTP/1.1 404"), "{head}");
    wait_for(|| h.stats.snapshot().handshakes_failed == 1).await;
}

#[tokio::test]
async fn test_full_server_gets_503() {
    let h = start(StreamConfig {
        max_clients: 1,
        ..test_config()
    })
    .await;
    let (_, _first) = connect(&h, "").await;

    let (head, _, _) = request(h.addr, "/ws", "").await;
    assert!(head.starts_with("HTTP/1.1 503"), "{head}");
    assert_eq!(h.scheduler.client_count(), 1);
}

#[tokio::test]
async fn test_bad_version_gets_426() {
    let h = start(test_config()).await;
    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    let req = format!(
        "GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 8\r\n\r\n"
    );
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 426"), "{response}");
    assert!(response.contains("Sec-WebSocket-Version: 13"));
}

// ── Frame delivery ───────────────────────────────────────────────

#[tokio::test]
async fn test_frame_arrives_fragmented() {
    let h = start(test_config()).await;
    let (_, mut ws) = connect(&h, "").await;

    let pixels = test_pattern();
    assert!(h.caster.submit_frame(&pixels, 3));

    let fragments = next_message(&mut ws).await;
    // 1 palette byte + 128 pixels in 50-byte chunks.
    assert_eq!(fragments.len(), 3);
    assert_eq!(fragments[0].opcode(), OpCode::Binary);
    assert!(fragments[1..].iter().all(|f| f.opcode() == OpCode::Continuation));
    assert_eq!(fragments.iter().filter(|f| f.is_final()).count(), 1);

    let payload: Vec<u8> = fragments.iter().flat_map(|f| f.payload.to_vec()).collect();
    assert_eq!(payload[0], 3);
    assert_eq!(&payload[1..], &pixels[..]);
}

#[tokio::test]
async fn test_frames_arrive_in_order_for_every_client() {
    let h = start(StreamConfig {
        chunk_size: 1024,
        ..test_config()
    })
    .await;
    let (_, mut a) = connect(&h, "").await;
    let (_, mut b) = connect(&h, "").await;

    for palette in 0..4u8 {
        assert!(h.caster.submit_frame(&vec![palette; DIMS.pixel_count()], palette));
        // Let the pump drain so the two-slot queue never fills.
        wait_for(|| h.stats.frames_sent() >= 2 * (palette as u64 + 1)).await;
    }

    for ws in [&mut a, &mut b] {
        for palette in 0..4u8 {
            let message = next_message(&mut *ws).await;
            assert_eq!(message.len(), 1);
            assert_eq!(message[0].payload[0], palette);
        }
    }
}

#[tokio::test]
async fn test_deflate_negotiated_and_applied() {
    let h = start(StreamConfig {
        chunk_size: 1024,
        ..test_config()
    })
    .await;
    let (head, mut ws) = connect(
        &h,
        "Sec-WebSocket-Extensions: permessage-deflate; client_no_context_takeover\r\n",
    )
    .await;
    assert!(head.contains("permessage-deflate"), "{head}");
    assert!(head.contains("server_no_context_takeover"), "{head}");

    let pixels = test_pattern();
    assert!(h.caster.submit_frame(&pixels, 1));
    let message = next_message(&mut ws).await;
    assert_eq!(message.len(), 1);
    assert!(message[0].is_compressed());

    let mut body = message[0].payload.to_vec();
    body.extend_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);
    let mut inflated = Vec::with_capacity(4096);
    Decompress::new(false)
        .decompress_vec(&body, &mut inflated, FlushDecompress::Sync)
        .unwrap();
    assert_eq!(inflated[0], 1);
    assert_eq!(&inflated[1..], &pixels[..]);
}

// ── Control frames & input ───────────────────────────────────────

#[tokio::test]
async fn test_ping_gets_pong() {
    let h = start(test_config()).await;
    let (_, mut ws) = connect(&h, "").await;

    ws.send(WsFrame::ping(b"are you there")).await.unwrap();
    let pong = next_frame(&mut ws).await;
    assert_eq!(pong.opcode(), OpCode::Pong);
    assert_eq!(&pong.payload[..], b"are you there");
}

#[tokio::test]
async fn test_close_is_echoed() {
    let h = start(test_config()).await;
    let (_, mut ws) = connect(&h, "").await;

    ws.send(WsFrame::close(CloseCode::Normal, "bye")).await.unwrap();
    let close = next_frame(&mut ws).await;
    assert_eq!(close.opcode(), OpCode::Close);
    assert_eq!(close.close_code(), Some(CloseCode::Normal));

    wait_for(|| h.scheduler.client_count() == 0).await;
    let eof = timeout(WAIT, ws.next()).await.unwrap();
    assert!(eof.is_none());
}

#[tokio::test]
async fn test_input_reaches_sink() {
    let mut h = start(test_config()).await;
    let (_, mut ws) = connect(&h, "").await;

    ws.send(WsFrame::binary(&[0x01, 37])).await.unwrap();
    let (_, msg) = timeout(WAIT, h.input.recv()).await.unwrap().unwrap();
    assert_eq!(
        InputEvent::decode(&msg.payload).unwrap(),
        InputEvent::KeyDown { code: 37 }
    );

    // Fragmented input is reassembled.
    ws.send(WsFrame::new(
        FrameFlags::empty(),
        OpCode::Binary,
        BytesMut::from(&[0x05, 1][..]),
    ))
    .await
    .unwrap();
    ws.send(WsFrame::new(
        FrameFlags::FIN,
        OpCode::Continuation,
        BytesMut::from(&[0xFF, 2][..]),
    ))
    .await
    .unwrap();
    let (_, msg) = timeout(WAIT, h.input.recv()).await.unwrap().unwrap();
    assert_eq!(
        InputEvent::decode(&msg.payload).unwrap(),
        InputEvent::Joystick {
            buttons: 1,
            x: -1,
            y: 2
        }
    );
}

#[tokio::test]
async fn test_unmasked_client_frame_closes_with_protocol_error() {
    let h = start(test_config()).await;
    let (_, mut ws) = connect(&h, "").await;

    ws.get_mut().write_all(&[0x82, 0x01, 0x01]).await.unwrap();
    let close = next_frame(&mut ws).await;
    assert_eq!(close.opcode(), OpCode::Close);
    assert_eq!(close.close_code(), Some(CloseCode::ProtocolError));
    wait_for(|| h.scheduler.client_count() == 0).await;
}

#[tokio::test]
async fn test_dropped_connection_is_unregistered() {
    let h = start(test_config()).await;
    let (_, ws) = connect(&h, "").await;
    drop(ws);
    wait_for(|| h.scheduler.client_count() == 0).await;
}

#[tokio::test]
async fn test_malformed_close_gets_protocol_error() {
    let h = start(test_config()).await;
    for payload in [&[0x03][..], &[0x03, 0xE8, 0xC3, 0x28][..]] {
        let (_, mut ws) = connect(&h, "").await;
        ws.send(WsFrame::new(FrameFlags::FIN, OpCode::Close, BytesMut::from(payload)))
            .await
            .unwrap();
        let close = next_frame(&mut ws).await;
        assert_eq!(close.opcode(), OpCode::Close);
        assert_eq!(close.close_code(), Some(CloseCode::ProtocolError));
        wait_for(|| h.scheduler.client_count() == 0).await;
    }
}

// ── Idle clients ─────────────────────────────────────────────────

fn idle_config() -> StreamConfig {
    StreamConfig {
        ping_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(150),
        close_timeout: Duration::from_millis(100),
        ..test_config()
    }
}

#[tokio::test]
async fn test_idle_client_input_is_ignored_after_removal() {
    let mut h = start(idle_config()).await;
    let (_, mut ws) = connect(&h, "").await;

    let close = next_frame(&mut ws).await;
    assert_eq!(close.close_code(), Some(CloseCode::GoingAway));
    // No echo: the server gives up after the close timeout.
    wait_for(|| h.scheduler.client_count() == 0).await;
    assert_eq!(h.stats.snapshot().clients_evicted, 1);

    // The whole connection is gone, read side included.
    loop {
        match timeout(WAIT, ws.next()).await.expect("connection left open") {
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }
    let _ = ws.send(WsFrame::binary(&[0x01, 37])).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.input.try_recv().is_err());
}

#[tokio::test]
async fn test_idle_close_completes_on_echo() {
    let h = start(StreamConfig {
        close_timeout: Duration::from_secs(3600),
        ..idle_config()
    })
    .await;
    let (_, mut ws) = connect(&h, "").await;

    let close = next_frame(&mut ws).await;
    assert_eq!(close.close_code(), Some(CloseCode::GoingAway));
    assert_eq!(h.scheduler.client_count(), 1);

    ws.send(WsFrame::close(CloseCode::GoingAway, "")).await.unwrap();
    wait_for(|| h.scheduler.client_count() == 0).await;
    let eof = timeout(WAIT, ws.next()).await.unwrap();
    assert!(eof.is_none());
}
