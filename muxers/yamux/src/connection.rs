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

//! The yamux connection: a task owning the socket and the streams table,
//! with [`YamuxConn`] and [`crate::YamuxStream`] as its handles.
//!
//! All mutation of the streams table happens on the connection task, so
//! `open_stream`, `accept_stream` and per-stream I/O can run concurrently
//! without a lock being held across a suspension point anywhere.

use crate::frame::{Flags, FrameType, GoAwayCode, Header, HEADER_LEN};
use crate::stream::{StreamShared, Terminal, YamuxStream};
use crate::Config;
use async_trait::async_trait;
use bytes::Bytes;
use fnv::FnvHashMap;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use peerlink_core::muxing::{MuxedStream, MuxerError, StreamMuxer};
use peerlink_core::resource::{PeerScope, ResourceScopeSpan, MEMORY_PRIORITY_NORMAL};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

const LOG_TARGET: &str = "peerlink::yamux";

/// Initial credit of every stream, before window updates raise it. Fixed by
/// the yamux specification.
pub(crate) const DEFAULT_CREDIT: u32 = 256 * 1024;

/// Hard cap on concurrently live streams per connection.
const MAX_STREAMS: usize = 8192;

/// Inbound streams the application has not accepted yet; beyond this the
/// connection resets new inbound streams rather than buffer them.
const MAX_BUFFERED_INBOUND_STREAMS: usize = 256;

/// Capacity of the handle-to-task command channel.
const COMMAND_BUFFER: usize = 64;

/// Role of this end of the connection. Clients open odd stream ids, servers
/// even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

/// Requests sent from the handles to the connection task.
pub(crate) enum Command {
    OpenStream {
        reply: oneshot::Sender<Result<YamuxStream, MuxerError>>,
    },
    Data {
        id: u32,
        body: Bytes,
    },
    WindowUpdate {
        id: u32,
        credit: u32,
    },
    CloseStream {
        id: u32,
    },
    ResetStream {
        id: u32,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

enum ReadEvent {
    Frame(Header, Bytes),
    /// Reader stopped: clean EOF (`None`) or an error.
    Closed(Option<MuxerError>),
}

struct ConnShared {
    closed: AtomicBool,
    last_rtt: Mutex<Option<Duration>>,
}

/// A yamux connection handle, created by [`crate::YamuxTransport`].
pub struct YamuxConn {
    shared: Arc<ConnShared>,
    cmd_tx: mpsc::Sender<Command>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<YamuxStream>>,
}

impl YamuxConn {
    /// Wraps `io` into a yamux session and spawns its tasks.
    ///
    /// When a `peer_scope` is given, a span is opened on it and one receive
    /// window is reserved per live stream; setup failure releases the span
    /// before returning.
    pub fn new<C>(
        io: C,
        cfg: Config,
        mode: Mode,
        peer_scope: Option<Arc<dyn PeerScope>>,
    ) -> Result<YamuxConn, MuxerError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let memory = match peer_scope {
            Some(scope) => {
                let span = scope.begin_span()?;
                Some(MemoryAccount {
                    span,
                    per_stream: cfg.max_stream_window_size as usize,
                    reserved_streams: 0,
                })
            }
            None => None,
        };

        let shared = Arc::new(ConnShared {
            closed: AtomicBool::new(false),
            last_rtt: Mutex::new(None),
        });
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(MAX_BUFFERED_INBOUND_STREAMS);
        let (frame_tx, frame_rx) = mpsc::channel(32);

        let (read_half, write_half) = io.split();
        let max_body = cfg.max_stream_window_size as usize;
        tokio::spawn(read_loop(read_half, frame_tx, max_body));

        let actor = ConnActor {
            write: write_half,
            cfg,
            mode,
            streams: FnvHashMap::default(),
            next_stream_id: match mode {
                Mode::Client => 1,
                Mode::Server => 2,
            },
            inbound_tx,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            frame_rx,
            memory,
            shared: shared.clone(),
            num_inbound: 0,
            pending_ping: None,
            next_ping_id: 0,
        };
        tokio::spawn(actor.run());

        Ok(YamuxConn {
            shared,
            cmd_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    /// Round-trip time of the most recent keepalive exchange.
    pub fn last_rtt(&self) -> Option<Duration> {
        *self.shared.last_rtt.lock()
    }
}

#[async_trait]
impl StreamMuxer for YamuxConn {
    async fn open_stream(&self) -> Result<Box<dyn MuxedStream>, MuxerError> {
        if self.is_closed() {
            return Err(MuxerError::ConnClosed);
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenStream { reply })
            .await
            .map_err(|_| MuxerError::ConnClosed)?;
        // Dropping this future before the reply arrives drops `rx`; the
        // connection task then resets the half-open stream.
        let stream = rx.await.map_err(|_| MuxerError::ConnClosed)??;
        Ok(Box::new(stream))
    }

    async fn accept_stream(&self) -> Result<Box<dyn MuxedStream>, MuxerError> {
        let mut inbound = self.inbound_rx.lock().await;
        match inbound.recv().await {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(MuxerError::ConnClosed),
        }
    }

    async fn close(&self) -> Result<(), MuxerError> {
        if self.is_closed() {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { reply }).await.is_err() {
            // Task already gone: the connection is closed.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Per-connection memory accounting against a resource span.
struct MemoryAccount {
    span: Box<dyn ResourceScopeSpan>,
    per_stream: usize,
    reserved_streams: usize,
}

impl MemoryAccount {
    fn reserve_stream(&mut self) -> Result<(), MuxerError> {
        self.span
            .reserve_memory(self.per_stream, MEMORY_PRIORITY_NORMAL)?;
        self.reserved_streams += 1;
        Ok(())
    }

    fn release_stream(&mut self) {
        if self.reserved_streams > 0 {
            self.reserved_streams -= 1;
            self.span.release_memory(self.per_stream);
        }
    }

    fn release_all(&mut self) {
        while self.reserved_streams > 0 {
            self.release_stream();
        }
        self.span.done();
    }
}

struct StreamEntry {
    shared: Arc<StreamShared>,
    inbound: bool,
}

struct ConnActor<W> {
    write: WriteHalf<W>,
    cfg: Config,
    mode: Mode,
    streams: FnvHashMap<u32, StreamEntry>,
    next_stream_id: u32,
    inbound_tx: mpsc::Sender<YamuxStream>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    frame_rx: mpsc::Receiver<ReadEvent>,
    memory: Option<MemoryAccount>,
    shared: Arc<ConnShared>,
    num_inbound: usize,
    pending_ping: Option<(u32, Instant)>,
    next_ping_id: u32,
}

impl<W> ConnActor<W>
where
    W: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self) {
        let keepalive = self.cfg.enable_keepalive;
        // The ticker exists either way; when keepalive is off its branch is
        // disabled and the period is a placeholder.
        let period = if keepalive {
            self.cfg.keepalive_interval
        } else {
            Duration::from_secs(3600)
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        let end = loop {
            tokio::select! {
                ev = self.frame_rx.recv() => match ev {
                    Some(ReadEvent::Frame(header, body)) => {
                        match self.on_frame(header, body).await {
                            Ok(true) => {}
                            Ok(false) => break Terminal::ConnClosed,
                            Err(e) => {
                                debug!(target: LOG_TARGET, "connection error: {}", e);
                                break Terminal::ConnClosed;
                            }
                        }
                    }
                    Some(ReadEvent::Closed(err)) => {
                        if let Some(e) = err {
                            debug!(target: LOG_TARGET, "receive side failed: {}", e);
                        }
                        break Terminal::ConnClosed;
                    }
                    None => break Terminal::ConnClosed,
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => match self.on_command(cmd).await {
                        Ok(true) => {}
                        Ok(false) => break Terminal::ConnClosed,
                        Err(e) => {
                            debug!(target: LOG_TARGET, "connection error: {}", e);
                            break Terminal::ConnClosed;
                        }
                    },
                    None => {
                        // Every handle and stream is gone.
                        let _ = self.send_frame(Header::go_away(GoAwayCode::Normal), &[]).await;
                        break Terminal::ConnClosed;
                    }
                },
                _ = ticker.tick(), if keepalive => {
                    if let Err(e) = self.on_keepalive().await {
                        debug!(target: LOG_TARGET, "keepalive failed: {}", e);
                        break Terminal::ConnClosed;
                    }
                }
            }
        };

        self.shutdown(end).await;
    }

    async fn on_frame(&mut self, header: Header, body: Bytes) -> Result<bool, MuxerError> {
        trace!(
            target: LOG_TARGET,
            "received {:?} frame for stream {} (len {})",
            header.typ,
            header.stream_id,
            header.length
        );
        match header.typ {
            FrameType::Data => self.on_data(header, body).await,
            FrameType::WindowUpdate => self.on_window_update(header).await,
            FrameType::Ping => self.on_ping(header).await.map(|_| true),
            FrameType::GoAway => {
                let code = GoAwayCode::from_u32(header.length);
                debug!(target: LOG_TARGET, "remote sent GoAway ({:?})", code);
                Ok(false)
            }
        }
    }

    async fn on_data(&mut self, header: Header, body: Bytes) -> Result<bool, MuxerError> {
        let id = header.stream_id;
        if header.flags.contains(Flags::SYN) {
            self.accept_inbound(id).await?;
        }
        if let Some(entry) = self.streams.get(&id) {
            if !body.is_empty() {
                let mut state = entry.shared.state.lock();
                if state.terminal.is_none() && !state.recv_closed {
                    // The remote must stay within the advertised window.
                    if state.recv_buf.len() + body.len() > state.window as usize {
                        drop(state);
                        return Err(MuxerError::Protocol(format!(
                            "stream {} overran its receive window",
                            id
                        )));
                    }
                    state.recv_buf.extend_from_slice(&body);
                }
                drop(state);
                entry.shared.recv_notify.notify_one();
            }
        } else if !header.flags.contains(Flags::RST) {
            // Frames for recently reset streams are expected noise.
            trace!(target: LOG_TARGET, "dropping data for unknown stream {}", id);
        }
        self.apply_stream_flags(id, header.flags);
        Ok(true)
    }

    async fn on_window_update(&mut self, header: Header) -> Result<bool, MuxerError> {
        let id = header.stream_id;
        if header.flags.contains(Flags::SYN) {
            self.accept_inbound(id).await?;
            if let Some(entry) = self.streams.get(&id) {
                let mut state = entry.shared.state.lock();
                state.send_window = state.send_window.saturating_add(header.length);
            }
        } else if let Some(entry) = self.streams.get(&id) {
            let mut state = entry.shared.state.lock();
            state.send_window = state.send_window.saturating_add(header.length);
            drop(state);
            entry.shared.send_notify.notify_one();
        }
        self.apply_stream_flags(id, header.flags);
        Ok(true)
    }

    async fn on_ping(&mut self, header: Header) -> Result<(), MuxerError> {
        if header.flags.contains(Flags::SYN) {
            self.send_frame(Header::ping(header.length, Flags::ACK), &[])
                .await?;
        } else if header.flags.contains(Flags::ACK) {
            if let Some((opaque, sent_at)) = self.pending_ping {
                if opaque == header.length {
                    *self.shared.last_rtt.lock() = Some(sent_at.elapsed());
                    self.pending_ping = None;
                }
            }
        }
        Ok(())
    }

    /// Handles FIN/RST bits piggy-backed on data and window-update frames.
    fn apply_stream_flags(&mut self, id: u32, flags: Flags) {
        if flags.contains(Flags::RST) {
            if let Some(entry) = self.streams.get(&id) {
                entry.shared.terminate(Terminal::Reset);
            }
            self.gc_stream(id);
            return;
        }
        if flags.contains(Flags::FIN) {
            let fully_closed = if let Some(entry) = self.streams.get(&id) {
                let mut state = entry.shared.state.lock();
                state.recv_closed = true;
                let fully = state.send_closed;
                drop(state);
                entry.shared.recv_notify.notify_one();
                fully
            } else {
                false
            };
            if fully_closed {
                self.gc_stream(id);
            }
        }
    }

    async fn accept_inbound(&mut self, id: u32) -> Result<(), MuxerError> {
        if self.streams.contains_key(&id) {
            return Ok(());
        }
        // The remote must use the parity of its role.
        let expected_parity = match self.mode {
            Mode::Client => 0,
            Mode::Server => 1,
        };
        if id % 2 != expected_parity {
            return Err(MuxerError::Protocol(format!(
                "remote opened stream {} with wrong parity",
                id
            )));
        }

        if self.num_inbound as u32 >= self.cfg.max_incoming_streams
            || self.streams.len() >= MAX_STREAMS
        {
            debug!(
                target: LOG_TARGET,
                "resetting inbound stream {}: stream limit reached", id
            );
            self.send_frame(Header::window_update(id, 0, Flags::RST), &[])
                .await?;
            return Ok(());
        }

        if let Some(memory) = &mut self.memory {
            if let Err(e) = memory.reserve_stream() {
                debug!(
                    target: LOG_TARGET,
                    "resetting inbound stream {}: {}", id, e
                );
                self.send_frame(Header::window_update(id, 0, Flags::RST), &[])
                    .await?;
                return Ok(());
            }
        }

        let shared = StreamShared::new(id, DEFAULT_CREDIT, self.cfg.max_stream_window_size);
        let stream = YamuxStream::new(shared.clone(), self.cmd_tx.clone());

        match self.inbound_tx.try_send(stream) {
            Ok(()) => {
                self.streams.insert(id, StreamEntry { shared, inbound: true });
                self.num_inbound += 1;
                // Raise the remote's credit from the protocol default to
                // our configured window.
                let delta = self.cfg.max_stream_window_size.saturating_sub(DEFAULT_CREDIT);
                self.send_frame(Header::window_update(id, delta, Flags::ACK), &[])
                    .await?;
            }
            Err(_) => {
                // The application is not accepting streams; push back.
                warn!(
                    target: LOG_TARGET,
                    "resetting inbound stream {}: accept queue is full", id
                );
                if let Some(memory) = &mut self.memory {
                    memory.release_stream();
                }
                self.send_frame(Header::window_update(id, 0, Flags::RST), &[])
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, cmd: Command) -> Result<bool, MuxerError> {
        match cmd {
            Command::OpenStream { reply } => {
                match self.open_local_stream().await {
                    Ok(stream) => {
                        let id = stream.id() as u32;
                        if reply.send(Ok(stream)).is_err() {
                            // Caller cancelled the open: do not leak a
                            // half-open stream.
                            self.reset_local(id).await?;
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Data { id, body } => {
                let still_open = self
                    .streams
                    .get(&id)
                    .map(|e| !e.shared.is_terminal())
                    .unwrap_or(false);
                if still_open {
                    self.send_frame(Header::data(id, body.len() as u32, Flags::NONE), &body)
                        .await?;
                }
            }
            Command::WindowUpdate { id, credit } => {
                if self.streams.contains_key(&id) && credit > 0 {
                    self.send_frame(Header::window_update(id, credit, Flags::NONE), &[])
                        .await?;
                }
            }
            Command::CloseStream { id } => {
                if self.streams.contains_key(&id) {
                    self.send_frame(Header::data(id, 0, Flags::FIN), &[]).await?;
                    let fully_closed = self
                        .streams
                        .get(&id)
                        .map(|e| e.shared.state.lock().recv_closed)
                        .unwrap_or(false);
                    if fully_closed {
                        self.gc_stream(id);
                    }
                }
            }
            Command::ResetStream { id } => {
                if let Some(entry) = self.streams.get(&id) {
                    entry.shared.terminate(Terminal::Reset);
                }
                if self.streams.contains_key(&id) {
                    self.send_frame(Header::window_update(id, 0, Flags::RST), &[])
                        .await?;
                    self.gc_stream(id);
                }
            }
            Command::Close { reply } => {
                let _ = self.send_frame(Header::go_away(GoAwayCode::Normal), &[]).await;
                let _ = reply.send(());
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn open_local_stream(&mut self) -> Result<YamuxStream, MuxerError> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(MuxerError::TooManyStreams);
        }
        let id = self.next_stream_id;
        self.next_stream_id = self
            .next_stream_id
            .checked_add(2)
            .ok_or(MuxerError::ConnClosed)?;

        if let Some(memory) = &mut self.memory {
            memory.reserve_stream()?;
        }

        let shared = StreamShared::new(id, DEFAULT_CREDIT, self.cfg.max_stream_window_size);
        self.streams.insert(
            id,
            StreamEntry { shared: shared.clone(), inbound: false },
        );

        let delta = self.cfg.max_stream_window_size.saturating_sub(DEFAULT_CREDIT);
        self.send_frame(Header::window_update(id, delta, Flags::SYN), &[])
            .await?;

        Ok(YamuxStream::new(shared, self.cmd_tx.clone()))
    }

    async fn reset_local(&mut self, id: u32) -> Result<(), MuxerError> {
        if let Some(entry) = self.streams.get(&id) {
            entry.shared.terminate(Terminal::Reset);
        }
        self.send_frame(Header::window_update(id, 0, Flags::RST), &[])
            .await?;
        self.gc_stream(id);
        Ok(())
    }

    async fn on_keepalive(&mut self) -> Result<(), MuxerError> {
        if self.pending_ping.is_some() {
            // The previous ping went a full interval without an answer.
            return Err(MuxerError::Timeout);
        }
        let opaque = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        self.pending_ping = Some((opaque, Instant::now()));
        self.send_frame(Header::ping(opaque, Flags::SYN), &[]).await
    }

    async fn send_frame(&mut self, header: Header, body: &[u8]) -> Result<(), MuxerError> {
        let hdr = header.encode();
        debug_assert_eq!(hdr.len(), HEADER_LEN);
        self.write.write_all(&hdr).await?;
        if !body.is_empty() {
            self.write.write_all(body).await?;
        }
        self.write.flush().await?;
        Ok(())
    }

    fn gc_stream(&mut self, id: u32) {
        if let Some(entry) = self.streams.remove(&id) {
            if entry.inbound {
                self.num_inbound -= 1;
            }
            if let Some(memory) = &mut self.memory {
                memory.release_stream();
            }
            trace!(target: LOG_TARGET, "garbage-collected stream {}", id);
        }
    }

    async fn shutdown(mut self, terminal: Terminal) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for (_, entry) in self.streams.drain() {
            entry.shared.terminate(terminal);
        }
        if let Some(memory) = &mut self.memory {
            memory.release_all();
        }
        let _ = self.write.close().await;
        debug!(target: LOG_TARGET, "connection task finished");
    }
}

async fn read_loop<R>(mut io: ReadHalf<R>, tx: mpsc::Sender<ReadEvent>, max_body: usize)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        let mut hdr_buf = [0u8; HEADER_LEN];
        match io.read_exact(&mut hdr_buf).await {
            Ok(()) => {}
            Err(e) => {
                let err = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    None
                } else {
                    Some(MuxerError::Io(e))
                };
                let _ = tx.send(ReadEvent::Closed(err)).await;
                return;
            }
        }
        let header = match Header::decode(&hdr_buf) {
            Ok(h) => h,
            Err(e) => {
                let _ = tx
                    .send(ReadEvent::Closed(Some(MuxerError::Protocol(e.to_string()))))
                    .await;
                return;
            }
        };
        let body = if header.typ == FrameType::Data && header.length > 0 {
            if header.length as usize > max_body {
                let _ = tx
                    .send(ReadEvent::Closed(Some(MuxerError::Protocol(format!(
                        "data frame of {} bytes exceeds the receive window",
                        header.length
                    )))))
                    .await;
                return;
            }
            let mut body = vec![0u8; header.length as usize];
            if let Err(e) = io.read_exact(&mut body).await {
                let _ = tx.send(ReadEvent::Closed(Some(MuxerError::Io(e)))).await;
                return;
            }
            Bytes::from(body)
        } else {
            Bytes::new()
        };
        if tx.send(ReadEvent::Frame(header, body)).await.is_err() {
            // Connection task is gone.
            return;
        }
    }
}

