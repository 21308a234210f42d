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

//! Cooperative cancellation.
//!
//! Every operation in this stack that may suspend takes a [`ShutdownSignal`]
//! and is expected to abort promptly once it fires, releasing whatever it
//! holds. A [`Shutdown`] is the owning trigger; signals are cheap clones
//! that any number of tasks can wait on.

use tokio::sync::watch;

/// The triggering half of a shutdown pair.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    signal: ShutdownSignal,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Shutdown {
            tx,
            signal: ShutdownSignal { rx: Some(rx) },
        }
    }

    /// A signal tied to this trigger.
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Fires the signal. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

/// The waiting half of a shutdown pair.
///
/// [`ShutdownSignal::noop`] produces a signal that never fires, for callers
/// that genuinely have nothing to cancel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn noop() -> Self {
        ShutdownSignal { rx: None }
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once the owning [`Shutdown`] triggers (or is dropped).
    pub async fn wait(&mut self) {
        match &mut self.rx {
            None => futures::future::pending().await,
            Some(rx) => {
                if *rx.borrow() {
                    return;
                }
                loop {
                    if rx.changed().await.is_err() {
                        // Trigger dropped without firing: treat as shutdown
                        // so tasks bound to it do not outlive their owner.
                        return;
                    }
                    if *rx.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
