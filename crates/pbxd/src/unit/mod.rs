//! Telephone units (TUs) and their call state machine.
//!
//! A `Unit` is the exchange-side end of one client connection. It owns the
//! connection's output sink, its call state, and a reference to the unit it
//! is paired with while a call is being set up or is in progress.
//!
//! # Ownership
//!
//! Units are shared through `Arc<Unit>`. The holders are the session that
//! created the unit, the registry slot while registered, and the peer while
//! paired. A pairing is a pair of `Arc`s pointing at each other; hangup
//! clears both, so the cycle never outlives the call.
//!
//! # Locking
//!
//! Each unit's mutable state lives behind its own `tokio::sync::Mutex`.
//! Operations touching two units always lock them in ascending `UnitId`
//! order. When a unit discovers its peer only after locking itself and the
//! peer orders first, it releases its lock, takes both in order, and checks
//! the pairing did not change in between.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Write failures are reported as `UnitError`, never raised

mod error;

pub use error::UnitError;

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio::time::timeout;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

use pbx_core::{Extension, TuState};
use pbx_protocol::Notification;

/// Output half of a client connection.
pub type NotifySink = Box<dyn AsyncWrite + Send + Unpin>;

/// Write timeout for a single notification (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier fixing the lock order between units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(u64);

impl UnitId {
    fn next() -> Self {
        Self(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tu-{}", self.0)
    }
}

// ============================================================================
// Unit
// ============================================================================

/// A telephone unit bound to one client connection.
pub struct Unit {
    id: UnitId,

    /// Assigned once, by the registry
    extension: OnceLock<Extension>,

    line: Arc<Mutex<Line>>,

    /// Cancelled to make the owning session drop the connection
    disconnect: CancellationToken,
}

/// Lock-protected part of a unit.
struct Line {
    state: TuState,
    peer: Option<Arc<Unit>>,

    /// Set when the unit leaves the registry; it can no longer be called.
    detached: bool,

    sink: BufWriter<NotifySink>,
}

/// Guards for a unit and, if paired, its peer.
struct Held {
    me: OwnedMutexGuard<Line>,
    peer: Option<(Arc<Unit>, OwnedMutexGuard<Line>)>,
}

impl Unit {
    /// Creates an unregistered unit in the ON_HOOK state.
    pub fn new(sink: impl AsyncWrite + Send + Unpin + 'static) -> Arc<Self> {
        let sink: NotifySink = Box::new(sink);
        Arc::new(Self {
            id: UnitId::next(),
            extension: OnceLock::new(),
            line: Arc::new(Mutex::new(Line {
                state: TuState::OnHook,
                peer: None,
                detached: false,
                sink: BufWriter::new(sink),
            })),
            disconnect: CancellationToken::new(),
        })
    }

    /// Returns the unit's lock-order identifier.
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Returns the assigned extension, if registered.
    pub fn extension(&self) -> Option<Extension> {
        self.extension.get().copied()
    }

    /// Records the extension. Fails if one was already assigned.
    pub(crate) fn assign_extension(&self, extension: Extension) -> Result<(), Extension> {
        self.extension.set(extension)
    }

    /// Returns a snapshot of the current state.
    pub async fn state(&self) -> TuState {
        self.line.lock().await.state
    }

    /// Returns the current peer, if paired.
    pub async fn peer(&self) -> Option<Arc<Unit>> {
        self.line.lock().await.peer.clone()
    }

    /// Asks the owning session to close the connection.
    pub fn disconnect(&self) {
        self.disconnect.cancel();
    }

    /// Resolves once `disconnect` has been called.
    pub fn disconnected(&self) -> WaitForCancellationFuture<'_> {
        self.disconnect.cancelled()
    }

    /// Returns true once `disconnect` has been called.
    pub fn is_disconnected(&self) -> bool {
        self.disconnect.is_cancelled()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Sends the current state to this unit's client.
    pub async fn notify_state(&self) -> Result<(), UnitError> {
        self.lock_line().await.notify_state().await
    }

    /// Locks the unit without changing it.
    ///
    /// The registry holds this across registration so that nothing can
    /// reach the client before its `ON_HOOK` greeting.
    pub(crate) async fn lock_line(&self) -> LineLock<'_> {
        LineLock {
            unit: self,
            line: self.line.lock().await,
        }
    }

    /// Takes the handset off the hook.
    ///
    /// ON_HOOK goes to DIAL_TONE. RINGING answers the call: both this unit
    /// and the caller go to CONNECTED. Any other state is left unchanged.
    pub async fn pickup(self: &Arc<Self>) -> Result<(), UnitError> {
        let Held { mut me, peer } = self.hold().await;
        let mut result = Ok(());
        let state = me.state;

        match state {
            TuState::OnHook => me.state = TuState::DialTone,
            TuState::Ringing => match peer {
                Some((peer, mut them)) => {
                    me.state = TuState::Connected;
                    them.state = TuState::Connected;
                    result = them.notify_peer_side(&peer).await;
                    debug!(unit = %self.id, peer = %peer.id, "call answered");
                }
                None => result = Err(UnitError::NoPeer { state }),
            },
            _ => {}
        }

        self.finish(&mut me, result).await
    }

    /// Puts the handset back on the hook.
    ///
    /// Tears down any pairing. A connected or ringing peer falls back to
    /// DIAL_TONE; a callee that was still ringing for us goes ON_HOOK.
    pub async fn hangup(self: &Arc<Self>) -> Result<(), UnitError> {
        let held = self.hold().await;
        self.hangup_held(held).await
    }

    /// Marks the unit as unreachable and hangs it up, atomically.
    ///
    /// Used by the registry on unregistration so that a concurrent dial
    /// that already looked the unit up cannot pair with it afterwards.
    pub(crate) async fn detach(self: &Arc<Self>) -> Result<(), UnitError> {
        let mut held = self.hold().await;
        held.me.detached = true;
        self.hangup_held(held).await
    }

    async fn hangup_held(self: &Arc<Self>, held: Held) -> Result<(), UnitError> {
        let Held { mut me, peer } = held;
        let mut result = Ok(());
        let state = me.state;

        match state {
            state if state.expects_peer() => match peer {
                Some((peer, mut them)) => {
                    let peer_next = if state == TuState::RingBack {
                        TuState::OnHook
                    } else {
                        TuState::DialTone
                    };
                    me.state = TuState::OnHook;
                    me.peer = None;
                    them.state = peer_next;
                    them.peer = None;
                    result = them.notify_peer_side(&peer).await;
                    debug!(unit = %self.id, peer = %peer.id, "call torn down");
                }
                None => result = Err(UnitError::NoPeer { state }),
            },
            TuState::OnHook => {}
            _ => me.state = TuState::OnHook,
        }

        self.finish(&mut me, result).await
    }

    /// Places a call to `target`, or to nothing if the number was unresolved.
    ///
    /// Only has an effect in DIAL_TONE. Dialing oneself or a unit that is
    /// off-hook or already paired gives BUSY_SIGNAL; an unresolved or
    /// detached target gives ERROR. Otherwise the two units are paired,
    /// the target goes to RINGING and this unit to RING_BACK.
    pub async fn dial(self: &Arc<Self>, target: Option<&Arc<Unit>>) -> Result<(), UnitError> {
        let target = match target {
            Some(target) if Arc::ptr_eq(target, self) => {
                let mut me = Arc::clone(&self.line).lock_owned().await;
                if me.state == TuState::DialTone {
                    me.state = TuState::BusySignal;
                }
                return self.finish(&mut me, Ok(())).await;
            }
            Some(target) => target,
            None => {
                let mut me = Arc::clone(&self.line).lock_owned().await;
                if me.state == TuState::DialTone {
                    me.state = TuState::Error;
                }
                return self.finish(&mut me, Ok(())).await;
            }
        };

        let (mut me, mut them) = lock_pair(self, target).await;
        let mut result = Ok(());

        if me.state == TuState::DialTone {
            if them.detached {
                me.state = TuState::Error;
            } else if them.peer.is_some() || them.state != TuState::OnHook {
                me.state = TuState::BusySignal;
            } else {
                me.peer = Some(Arc::clone(target));
                them.peer = Some(Arc::clone(self));
                me.state = TuState::RingBack;
                them.state = TuState::Ringing;
                result = them.notify_peer_side(target).await;
                debug!(unit = %self.id, target = %target.id, "ringing");
            }
        }
        drop(them);

        self.finish(&mut me, result).await
    }

    /// Forwards `message` to the connected peer.
    ///
    /// Fails with `NotConnected` unless the unit is CONNECTED with a peer.
    /// No state changes either way.
    pub async fn chat(self: &Arc<Self>, message: &str) -> Result<(), UnitError> {
        let Held { mut me, peer } = self.hold().await;

        let result = match (me.state, peer) {
            (TuState::Connected, Some((peer, mut them))) => them
                .send(&Notification::chat(message))
                .await
                .map_err(|e| UnitError::peer_delivery(peer.extension(), e)),
            (state, _) => Err(UnitError::NotConnected { state }),
        };

        self.finish(&mut me, result).await
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Sends this unit its resulting state and merges the outcome.
    ///
    /// A failed write to our own connection takes precedence over any
    /// other result, since it ends the session.
    async fn finish(&self, me: &mut Line, result: Result<(), UnitError>) -> Result<(), UnitError> {
        let status = me.status(self.extension());
        trace!(unit = %self.id, notification = %status, "notify");
        me.send(&status)
            .await
            .map_err(|e| UnitError::delivery(self.extension(), e))?;
        result
    }

    /// Locks this unit and its current peer in lock order.
    async fn hold(&self) -> Held {
        loop {
            let me = Arc::clone(&self.line).lock_owned().await;
            let Some(peer) = me.peer.clone() else {
                return Held { me, peer: None };
            };

            if self.id < peer.id {
                let them = Arc::clone(&peer.line).lock_owned().await;
                return Held {
                    me,
                    peer: Some((peer, them)),
                };
            }

            drop(me);
            let them = Arc::clone(&peer.line).lock_owned().await;
            let me = Arc::clone(&self.line).lock_owned().await;

            if me.peer.as_ref().is_some_and(|p| Arc::ptr_eq(p, &peer)) {
                return Held {
                    me,
                    peer: Some((peer, them)),
                };
            }

            trace!(unit = %self.id, "pairing changed while relocking, retrying");
        }
    }
}

/// A held unit lock, released once the state has been sent.
pub(crate) struct LineLock<'a> {
    unit: &'a Unit,
    line: MutexGuard<'a, Line>,
}

impl LineLock<'_> {
    /// Sends the unit's current state and releases the lock.
    pub(crate) async fn notify_state(mut self) -> Result<(), UnitError> {
        let extension = self.unit.extension();
        let status = self.line.status(extension);
        self.line
            .send(&status)
            .await
            .map_err(|e| UnitError::delivery(extension, e))
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("extension", &self.extension())
            .finish_non_exhaustive()
    }
}

impl Drop for Unit {
    fn drop(&mut self) {
        trace!(unit = %self.id, extension = ?self.extension(), "unit released");
    }
}

/// Locks two distinct units in lock order, returning guards as `(a, b)`.
async fn lock_pair(a: &Unit, b: &Unit) -> (OwnedMutexGuard<Line>, OwnedMutexGuard<Line>) {
    if a.id < b.id {
        let first = Arc::clone(&a.line).lock_owned().await;
        let second = Arc::clone(&b.line).lock_owned().await;
        (first, second)
    } else {
        let first = Arc::clone(&b.line).lock_owned().await;
        let second = Arc::clone(&a.line).lock_owned().await;
        (second, first)
    }
}

// ============================================================================
// Line
// ============================================================================

impl Line {
    /// Builds the state notification for this line.
    fn status(&self, own: Option<Extension>) -> Notification {
        let extension = match self.state {
            TuState::Connected => self.peer.as_ref().and_then(|peer| peer.extension()),
            _ => own,
        };
        Notification::state(self.state, extension)
    }

    /// Sends the peer's new state after a two-unit transition.
    async fn notify_peer_side(&mut self, peer: &Unit) -> Result<(), UnitError> {
        let status = self.status(peer.extension());
        self.send(&status)
            .await
            .map_err(|e| UnitError::peer_delivery(peer.extension(), e))
    }

    /// Writes one line and flushes it, bounded by the write timeout.
    async fn send(&mut self, notification: &Notification) -> io::Result<()> {
        let line = notification.to_line();
        let sink = &mut self.sink;

        match timeout(WRITE_TIMEOUT, async {
            sink.write_all(line.as_bytes()).await?;
            sink.flush().await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout")),
        }
    }
}
