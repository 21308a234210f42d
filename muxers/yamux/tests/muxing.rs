// Copyright 2021 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use peerlink_core::muxing::{MuxedStream, MuxerError, StreamMuxer};
use peerlink_core::resource::{
    MemoryPriority, PeerScope, ResourceError, ResourceScopeSpan, ScopeStat,
};
use peerlink_core::transport::memory;
use peerlink_core::PeerId;
use peerlink_yamux::{Config, Mode, YamuxConn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn conn_pair(cfg: Config) -> (YamuxConn, YamuxConn) {
    let (a, b) = memory::pair();
    let client = YamuxConn::new(a, cfg.clone(), Mode::Client, None).unwrap();
    let server = YamuxConn::new(b, cfg, Mode::Server, None).unwrap();
    (client, server)
}

#[tokio::test]
async fn hello_and_eof() {
    let (client, server) = conn_pair(Config::default());

    let mut out = client.open_stream().await.unwrap();
    out.write(b"hello").await.unwrap();
    out.close_write().await.unwrap();

    let mut inc = server.accept_stream().await.unwrap();
    let mut buf = [0u8; 5];
    let mut read = 0;
    while read < 5 {
        read += inc.read(&mut buf[read..]).await.unwrap();
    }
    assert_eq!(&buf, b"hello");
    assert_eq!(inc.read(&mut buf).await.unwrap(), 0, "FIN must surface as EOF");
}

#[tokio::test]
async fn bidirectional_traffic() {
    let (client, server) = conn_pair(Config::default());

    let mut out = client.open_stream().await.unwrap();
    out.write(b"ping").await.unwrap();

    let mut inc = server.accept_stream().await.unwrap();
    let mut buf = [0u8; 4];
    inc.read(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    inc.write(b"pong").await.unwrap();
    out.read(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn stream_close_is_idempotent() {
    let (client, server) = conn_pair(Config::default());

    let mut out = client.open_stream().await.unwrap();
    let _inc = server.accept_stream().await;
    assert!(out.close().await.is_ok());
    assert!(out.close().await.is_ok());
}

#[tokio::test]
async fn conn_close_is_idempotent() {
    let (client, _server) = conn_pair(Config::default());
    assert!(client.close().await.is_ok());
    assert!(client.close().await.is_ok());
    assert!(client.is_closed());
}

#[tokio::test]
async fn write_after_close_write_fails() {
    let (client, server) = conn_pair(Config::default());

    let mut out = client.open_stream().await.unwrap();
    let _inc = server.accept_stream().await.unwrap();
    out.close_write().await.unwrap();
    assert!(matches!(
        out.write(b"late").await,
        Err(MuxerError::StreamClosed)
    ));
}

#[tokio::test]
async fn reset_is_visible_on_both_sides() {
    let _ = env_logger::try_init();
    let (client, server) = conn_pair(Config::default());

    let mut out = client.open_stream().await.unwrap();
    out.write(b"x").await.unwrap();
    let mut inc = server.accept_stream().await.unwrap();

    out.reset();

    // Local side fails immediately.
    assert!(matches!(
        out.write(b"y").await,
        Err(MuxerError::StreamReset)
    ));

    // Remote side fails once the RST frame lands; it may first drain the
    // byte that was in flight.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut buf = [0u8; 8];
        match inc.read(&mut buf).await {
            Err(MuxerError::StreamReset) => break,
            Ok(_) => {}
            Err(e) => panic!("expected StreamReset, got {:?}", e),
        }
        assert!(Instant::now() < deadline, "reset never surfaced");
    }
    assert!(matches!(
        inc.write(b"z").await,
        Err(MuxerError::StreamReset)
    ));
}

#[tokio::test]
async fn close_read_refuses_local_reads() {
    let (client, server) = conn_pair(Config::default());

    let mut out = client.open_stream().await.unwrap();
    out.write(b"data").await.unwrap();
    let mut inc = server.accept_stream().await.unwrap();
    inc.close_read().unwrap();
    let mut buf = [0u8; 4];
    assert!(matches!(
        inc.read(&mut buf).await,
        Err(MuxerError::StreamClosed)
    ));
}

#[tokio::test]
async fn past_read_deadline_fails_promptly() {
    let _ = env_logger::try_init();
    let (client, server) = conn_pair(Config::default());

    let mut out = client.open_stream().await.unwrap();
    let _inc = server.accept_stream().await.unwrap();

    out.set_read_deadline(Some(Instant::now() - Duration::from_secs(1)));
    let mut buf = [0u8; 1];
    let started = Instant::now();
    assert!(matches!(out.read(&mut buf).await, Err(MuxerError::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(1));

    // Clearing the deadline restores blocking behavior.
    out.set_read_deadline(None);
    let pending = tokio::time::timeout(Duration::from_millis(50), out.read(&mut buf)).await;
    assert!(pending.is_err(), "read should block again");
}

#[tokio::test]
async fn concurrent_streams_are_independent() {
    let (client, server) = conn_pair(Config::default());
    let server = Arc::new(server);

    let echo = {
        let server = server.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                let mut stream = server.accept_stream().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let mut sent = 0;
                                while sent < n {
                                    sent += stream.write(&buf[sent..n]).await.unwrap();
                                }
                            }
                        }
                    }
                    let _ = stream.close().await;
                });
            }
        })
    };

    let mut handles = Vec::new();
    for i in 0..3u8 {
        let msg = vec![i; 16];
        let mut stream = client.open_stream().await.unwrap();
        handles.push(tokio::spawn(async move {
            stream.write(&msg).await.unwrap();
            let mut buf = [0u8; 16];
            let mut read = 0;
            while read < 16 {
                read += stream.read(&mut buf[read..]).await.unwrap();
            }
            assert_eq!(buf.to_vec(), msg);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    echo.await.unwrap();
}

#[tokio::test]
async fn close_terminates_streams_and_accept() {
    let _ = env_logger::try_init();
    let (client, server) = conn_pair(Config::default());

    let mut out = client.open_stream().await.unwrap();
    out.write(b"x").await.unwrap();
    client.close().await.unwrap();

    assert!(matches!(
        client.open_stream().await,
        Err(MuxerError::ConnClosed)
    ));
    // The remote sees the GoAway and fails accepts from then on.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match server.accept_stream().await {
            Err(MuxerError::ConnClosed) => break,
            Ok(_) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
        }
        assert!(Instant::now() < deadline);
    }
}

#[tokio::test]
async fn incoming_stream_limit_resets_excess() {
    let _ = env_logger::try_init();
    let mut cfg = Config::default();
    cfg.set_max_incoming_streams(1);
    let (client, server) = conn_pair(cfg);

    let mut first = client.open_stream().await.unwrap();
    let mut second = client.open_stream().await.unwrap();

    // The server resets the second stream; the reset surfaces on use.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut buf = [0u8; 1];
        match second.read(&mut buf).await {
            Err(MuxerError::StreamReset) => break,
            Ok(_) => {}
            Err(e) => panic!("expected StreamReset, got {:?}", e),
        }
        assert!(Instant::now() < deadline);
    }
    // The first stream is still usable.
    let mut first_in = server.accept_stream().await.unwrap();
    first.write(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    first_in.read(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
}

#[tokio::test]
async fn keepalive_measures_rtt() {
    let _ = env_logger::try_init();
    let mut cfg = Config::default();
    cfg.set_keepalive_interval(Duration::from_millis(50));
    let (client, _server) = conn_pair(cfg);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.last_rtt().is_some(), "keepalive ping was not answered");
}

#[derive(Default)]
struct Counters {
    reserved: AtomicUsize,
    span_done: AtomicBool,
}

#[derive(Default)]
struct TestScope {
    counters: Arc<Counters>,
}

impl PeerScope for TestScope {
    fn begin_span(&self) -> Result<Box<dyn ResourceScopeSpan>, ResourceError> {
        Ok(Box::new(TestSpan { counters: self.counters.clone() }))
    }

    fn peer(&self) -> PeerId {
        PeerId::empty()
    }

    fn stat(&self) -> ScopeStat {
        ScopeStat::default()
    }
}

struct TestSpan {
    counters: Arc<Counters>,
}

impl ResourceScopeSpan for TestSpan {
    fn reserve_memory(&self, size: usize, _prio: MemoryPriority) -> Result<(), ResourceError> {
        self.counters.reserved.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    fn release_memory(&self, size: usize) {
        self.counters.reserved.fetch_sub(size, Ordering::SeqCst);
    }

    fn done(&self) {
        self.counters.span_done.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn memory_is_accounted_per_stream() {
    let _ = env_logger::try_init();
    let scope = TestScope::default();
    let counters = scope.counters.clone();
    let (a, b) = memory::pair();
    let client = YamuxConn::new(
        a,
        Config::default(),
        Mode::Client,
        Some(Arc::new(scope) as Arc<dyn PeerScope>),
    )
    .unwrap();
    let server = YamuxConn::new(b, Config::default(), Mode::Server, None).unwrap();

    let s1 = client.open_stream().await.unwrap();
    let s2 = client.open_stream().await.unwrap();
    let window = 16 * 1024 * 1024;
    assert_eq!(counters.reserved.load(Ordering::SeqCst), 2 * window);

    drop(s1);
    drop(s2);
    client.close().await.unwrap();
    let _ = server;

    // Everything reserved must be released and the span closed.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !counters.span_done.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "span was not released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(counters.reserved.load(Ordering::SeqCst), 0);
}
