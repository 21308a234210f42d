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

//! Scoped resource accounting.
//!
//! A resource manager meters connections, streams and memory. The upgrade
//! pipeline reserves a connection scope before doing any work, binds the
//! authenticated peer to it after the handshake, and hands the per-peer
//! scope to the muxer, which routes its buffer allocations through a span.
//! Every acquisition is paired with a release on all exit paths; releases
//! are idempotent.

use crate::transport::Direction;
use crate::{Multiaddr, PeerId};
use std::sync::Arc;
use thiserror::Error;

/// Priority of a memory reservation, `0..=255`. Reservations below the
/// current pressure threshold are denied first.
pub type MemoryPriority = u8;

/// Default priority for stream receive buffers.
pub const MEMORY_PRIORITY_NORMAL: MemoryPriority = 128;

/// The root accounting authority.
pub trait ResourceManager: Send + Sync {
    /// Reserves budget for one connection. `use_fd` declares that the
    /// connection consumes a file descriptor.
    fn open_connection(
        &self,
        direction: Direction,
        use_fd: bool,
        endpoint: Option<&Multiaddr>,
    ) -> Result<Box<dyn ConnManagementScope>, ResourceError>;
}

/// Budget attached to one connection while it is being upgraded and used.
pub trait ConnManagementScope: Send + Sync {
    /// Binds the authenticated peer to this scope. Called once, after the
    /// security handshake. Fails when the per-peer quota is exhausted.
    fn set_peer(&self, peer: &PeerId) -> Result<(), ResourceError>;

    /// The per-peer scope, available once [`set_peer`](Self::set_peer)
    /// succeeded.
    fn peer_scope(&self) -> Option<Arc<dyn PeerScope>>;

    /// Releases the scope. Idempotent; must be called on every exit path.
    fn done(&self);
}

/// Budget attached to one peer, shared by everything that speaks to it.
pub trait PeerScope: Send + Sync {
    /// Opens a span through which memory is reserved and released.
    fn begin_span(&self) -> Result<Box<dyn ResourceScopeSpan>, ResourceError>;

    fn peer(&self) -> PeerId;

    fn stat(&self) -> ScopeStat;
}

/// A slice of a scope's budget with guaranteed release.
///
/// The muxer's memory manager is the only caller of
/// [`reserve_memory`](Self::reserve_memory)/[`release_memory`](Self::release_memory);
/// stream allocations all go through it.
pub trait ResourceScopeSpan: Send + Sync {
    fn reserve_memory(&self, size: usize, prio: MemoryPriority) -> Result<(), ResourceError>;

    fn release_memory(&self, size: usize);

    /// Releases the span and everything still reserved through it.
    /// Idempotent.
    fn done(&self);
}

/// Point-in-time usage of a scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStat {
    pub num_conns_inbound: usize,
    pub num_conns_outbound: usize,
    pub num_streams_inbound: usize,
    pub num_streams_outbound: usize,
    pub memory: usize,
}

/// Resource reservations denied by the manager.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("connection limit exceeded")]
    ConnLimitExceeded,

    #[error("per-peer limit exceeded for {0}")]
    PeerLimitExceeded(PeerId),

    #[error("memory limit exceeded: requested {requested}, available {available}")]
    MemoryLimitExceeded { requested: usize, available: usize },

    #[error("resource scope already closed")]
    ScopeClosed,
}

/// A resource manager that grants everything and accounts for nothing.
///
/// Used when no manager is configured; also a convenient base for test
/// managers.
#[derive(Debug, Default, Clone)]
pub struct NullResourceManager;

impl ResourceManager for NullResourceManager {
    fn open_connection(
        &self,
        _direction: Direction,
        _use_fd: bool,
        _endpoint: Option<&Multiaddr>,
    ) -> Result<Box<dyn ConnManagementScope>, ResourceError> {
        Ok(Box::new(NullConnScope::default()))
    }
}

#[derive(Debug, Default)]
struct NullConnScope {
    peer: parking_lot::Mutex<Option<PeerId>>,
}

impl ConnManagementScope for NullConnScope {
    fn set_peer(&self, peer: &PeerId) -> Result<(), ResourceError> {
        *self.peer.lock() = Some(peer.clone());
        Ok(())
    }

    fn peer_scope(&self) -> Option<Arc<dyn PeerScope>> {
        self.peer
            .lock()
            .clone()
            .map(|peer| Arc::new(NullPeerScope { peer }) as Arc<dyn PeerScope>)
    }

    fn done(&self) {}
}

#[derive(Debug)]
struct NullPeerScope {
    peer: PeerId,
}

impl PeerScope for NullPeerScope {
    fn begin_span(&self) -> Result<Box<dyn ResourceScopeSpan>, ResourceError> {
        Ok(Box::new(NullSpan))
    }

    fn peer(&self) -> PeerId {
        self.peer.clone()
    }

    fn stat(&self) -> ScopeStat {
        ScopeStat::default()
    }
}

#[derive(Debug)]
struct NullSpan;

impl ResourceScopeSpan for NullSpan {
    fn reserve_memory(&self, _size: usize, _prio: MemoryPriority) -> Result<(), ResourceError> {
        Ok(())
    }

    fn release_memory(&self, _size: usize) {}

    fn done(&self) {}
}
