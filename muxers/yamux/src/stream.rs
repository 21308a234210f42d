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

use crate::connection::Command;
use crate::frame::MAX_FRAME_BODY;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use peerlink_core::muxing::{MuxedStream, MuxerError};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

/// Why a stream stopped carrying data, beyond the orderly FIN exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Terminal {
    /// The stream was reset, locally or by the remote.
    Reset,
    /// The whole connection went away.
    ConnClosed,
}

/// State shared between a stream handle and the connection task.
///
/// The mutex guards plain data only; it is never held across an await.
pub(crate) struct StreamShared {
    pub id: u32,
    pub state: Mutex<StreamState>,
    /// Signalled when data arrives, the peer half-closes, or the stream
    /// terminates.
    pub recv_notify: Notify,
    /// Signalled when the send window is replenished or the stream
    /// terminates.
    pub send_notify: Notify,
}

pub(crate) struct StreamState {
    pub recv_buf: BytesMut,
    /// The peer sent FIN: EOF once `recv_buf` drains.
    pub recv_closed: bool,
    /// We sent FIN.
    pub send_closed: bool,
    pub terminal: Option<Terminal>,
    /// Credit for outgoing data, replenished by remote window updates.
    pub send_window: u32,
    /// Bytes consumed by the application since the last window update we
    /// sent; a new update goes out once this reaches half the window.
    pub consumed: u32,
    /// Our configured receive window for this stream.
    pub window: u32,
}

impl StreamShared {
    pub fn new(id: u32, send_window: u32, window: u32) -> Arc<Self> {
        Arc::new(StreamShared {
            id,
            state: Mutex::new(StreamState {
                recv_buf: BytesMut::new(),
                recv_closed: false,
                send_closed: false,
                terminal: None,
                send_window,
                consumed: 0,
                window,
            }),
            recv_notify: Notify::new(),
            send_notify: Notify::new(),
        })
    }

    /// Marks the stream terminal and wakes everything waiting on it.
    pub fn terminate(&self, terminal: Terminal) {
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(terminal);
        }
        drop(state);
        self.recv_notify.notify_one();
        self.send_notify.notify_one();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().terminal.is_some()
    }
}

/// One logical flow within a yamux connection.
pub struct YamuxStream {
    shared: Arc<StreamShared>,
    cmd_tx: mpsc::Sender<Command>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    /// Local `close_read` refusal.
    read_refused: bool,
    /// Full close already performed by this handle.
    closed: bool,
}

impl YamuxStream {
    pub(crate) fn new(shared: Arc<StreamShared>, cmd_tx: mpsc::Sender<Command>) -> Self {
        YamuxStream {
            shared,
            cmd_tx,
            read_deadline: None,
            write_deadline: None,
            read_refused: false,
            closed: false,
        }
    }

    fn terminal_error(terminal: Terminal) -> MuxerError {
        match terminal {
            Terminal::Reset => MuxerError::StreamReset,
            Terminal::ConnClosed => MuxerError::ConnClosed,
        }
    }

    async fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize, MuxerError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let window_update = {
                let mut state = self.shared.state.lock();
                if let Some(t) = state.terminal {
                    return Err(Self::terminal_error(t));
                }
                if !state.recv_buf.is_empty() {
                    let n = state.recv_buf.len().min(buf.len());
                    buf[..n].copy_from_slice(&state.recv_buf[..n]);
                    state.recv_buf.advance(n);
                    state.consumed += n as u32;
                    // Replenish the remote's credit once half the window
                    // was drained, not on every read.
                    if state.consumed >= state.window / 2 {
                        let credit = state.consumed;
                        state.consumed = 0;
                        Some((n, credit))
                    } else {
                        Some((n, 0))
                    }
                } else if state.recv_closed {
                    return Ok(0);
                } else {
                    None
                }
            };

            match window_update {
                Some((n, 0)) => return Ok(n),
                Some((n, credit)) => {
                    // A lost update only stalls the remote's sender; the
                    // data was already delivered.
                    let _ = self
                        .cmd_tx
                        .send(Command::WindowUpdate { id: self.shared.id, credit })
                        .await;
                    return Ok(n);
                }
                None => self.shared.recv_notify.notified().await,
            }
        }
    }

    async fn write_inner(&mut self, buf: &[u8]) -> Result<usize, MuxerError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let chunk = {
                let mut state = self.shared.state.lock();
                if let Some(t) = state.terminal {
                    return Err(Self::terminal_error(t));
                }
                if state.send_closed {
                    return Err(MuxerError::StreamClosed);
                }
                if state.send_window == 0 {
                    None
                } else {
                    let n = buf
                        .len()
                        .min(state.send_window as usize)
                        .min(MAX_FRAME_BODY);
                    state.send_window -= n as u32;
                    Some(n)
                }
            };

            match chunk {
                Some(n) => {
                    self.cmd_tx
                        .send(Command::Data {
                            id: self.shared.id,
                            body: Bytes::copy_from_slice(&buf[..n]),
                        })
                        .await
                        .map_err(|_| MuxerError::ConnClosed)?;
                    return Ok(n);
                }
                None => self.shared.send_notify.notified().await,
            }
        }
    }
}

#[async_trait]
impl MuxedStream for YamuxStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MuxerError> {
        if self.read_refused {
            return Err(MuxerError::StreamClosed);
        }
        let deadline = self.read_deadline;
        with_deadline(deadline, self.read_inner(buf)).await
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, MuxerError> {
        let deadline = self.write_deadline;
        with_deadline(deadline, self.write_inner(buf)).await
    }

    async fn close(&mut self) -> Result<(), MuxerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.read_refused = true;
        // A connection that is already gone closed the stream with it.
        match self.close_write().await {
            Ok(()) | Err(MuxerError::ConnClosed) | Err(MuxerError::StreamReset) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn close_read(&mut self) -> Result<(), MuxerError> {
        self.read_refused = true;
        Ok(())
    }

    async fn close_write(&mut self) -> Result<(), MuxerError> {
        let already = {
            let mut state = self.shared.state.lock();
            if let Some(t) = state.terminal {
                return Err(Self::terminal_error(t));
            }
            let already = state.send_closed;
            state.send_closed = true;
            already
        };
        if already {
            return Ok(());
        }
        self.cmd_tx
            .send(Command::CloseStream { id: self.shared.id })
            .await
            .map_err(|_| MuxerError::ConnClosed)?;
        Ok(())
    }

    fn reset(&mut self) {
        if self.shared.is_terminal() {
            return;
        }
        self.closed = true;
        self.shared.terminate(Terminal::Reset);
        // Best effort: if the connection task is gone the stream is dead
        // anyway.
        let _ = self
            .cmd_tx
            .try_send(Command::ResetStream { id: self.shared.id });
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        self.write_deadline = deadline;
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    fn id(&self) -> u64 {
        self.shared.id as u64
    }
}

impl Drop for YamuxStream {
    fn drop(&mut self) {
        // An abandoned open stream is reset so the remote does not keep a
        // half-open flow around.
        if !self.closed && !self.shared.is_terminal() {
            self.shared.terminate(Terminal::Reset);
            let _ = self
                .cmd_tx
                .try_send(Command::ResetStream { id: self.shared.id });
        }
    }
}

async fn with_deadline<F>(deadline: Option<Instant>, fut: F) -> Result<usize, MuxerError>
where
    F: Future<Output = Result<usize, MuxerError>>,
{
    match deadline {
        None => fut.await,
        Some(d) => {
            match tokio::time::timeout_at(tokio::time::Instant::from_std(d), fut).await {
                Ok(res) => res,
                Err(_) => Err(MuxerError::Timeout),
            }
        }
    }
}
