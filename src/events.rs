//! Asynchronous line-status and presence notification
//!
//! One watcher task runs per open handle that has a registered listener. It
//! polls the transport's line-status snapshot at a bounded interval (the
//! serial stack exposes no blocking wait primitive), diffs consecutive
//! snapshots, filters against the handle's event mask, and invokes the
//! listener callback.
//!
//! Every dispatch happens while holding the listener slot's lock, so
//! unregistering (which takes the same lock) is a synchronous barrier: once
//! `unregister` returns, no callback is in flight and none will follow.
//! Mask updates ride the same lock and are therefore atomic with respect to
//! dispatch.

use crate::transport::{LineStatus, PortTransport, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Interval between line-status polls
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Bitset over the watchable signal classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    /// CTS transitions
    pub const CTS: EventMask = EventMask(1 << 0);
    /// DSR transitions
    pub const DSR: EventMask = EventMask(1 << 1);
    /// Ring-indicator transitions
    pub const RI: EventMask = EventMask(1 << 2);
    /// Carrier-detect transitions
    pub const CD: EventMask = EventMask(1 << 3);
    /// Break conditions
    pub const BREAK: EventMask = EventMask(1 << 4);
    /// Device removal
    pub const PORT_REMOVED: EventMask = EventMask(1 << 5);

    /// Every signal class; the default for new registrations
    pub fn all() -> Self {
        Self(0x3F)
    }

    /// No signal class
    pub fn empty() -> Self {
        Self(0)
    }

    /// Whether every bit of `other` is set in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Copy of `self` with the bits of `other` cleared
    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::all()
    }
}

impl std::ops::BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Line-status transition record delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEvent {
    /// Clear To Send after the transition
    pub cts: bool,
    /// Data Set Ready after the transition
    pub dsr: bool,
    /// Ring Indicator after the transition
    pub ri: bool,
    /// Carrier Detect after the transition
    pub cd: bool,
    /// A break condition was observed since the previous event
    pub was_break: bool,
}

/// Event delivered to a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    /// A line-status signal changed
    Line(LineEvent),
    /// The device disappeared; no further events follow
    Removed,
}

/// Callback invoked by the watcher, one call per transition, in order
pub trait PortListener: Send {
    /// Handle one event
    fn on_event(&mut self, event: PortEvent);
}

impl<F> PortListener for F
where
    F: FnMut(PortEvent) + Send,
{
    fn on_event(&mut self, event: PortEvent) {
        self(event)
    }
}

struct ListenerState {
    listener: Option<Box<dyn PortListener>>,
    mask: EventMask,
    removed: bool,
}

/// Listener slot shared between a session and its watcher task
pub(crate) struct ListenerSlot {
    inner: Mutex<ListenerState>,
}

impl ListenerSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ListenerState {
                listener: None,
                mask: EventMask::all(),
                removed: false,
            }),
        })
    }

    /// Install a listener, replacing any previous one. Fails (returns
    /// `false`) once the watcher has observed device removal.
    pub(crate) fn register(&self, listener: Box<dyn PortListener>) -> bool {
        let mut state = self.inner.lock();
        if state.removed {
            return false;
        }
        state.listener = Some(listener);
        true
    }

    /// Remove the listener if one is installed. Acquiring the lock waits out
    /// any dispatch in progress, which is the unregister barrier.
    pub(crate) fn unregister(&self) -> bool {
        self.inner.lock().listener.take().is_some()
    }

    /// Replace the event mask. Takes effect atomically with respect to
    /// dispatch.
    pub(crate) fn set_mask(&self, mask: EventMask) {
        self.inner.lock().mask = mask;
    }

    /// Dispatch a line transition if the mask admits any changed signal
    fn dispatch_line(&self, changed: EventMask, status: LineStatus) {
        let mut state = self.inner.lock();
        if !state.mask.intersects(changed) {
            return;
        }
        if let Some(listener) = state.listener.as_mut() {
            listener.on_event(PortEvent::Line(LineEvent {
                cts: status.cts,
                dsr: status.dsr,
                ri: status.ri,
                cd: status.cd,
                was_break: status.break_received,
            }));
        }
    }

    /// Mark the device removed and dispatch the single presence event
    fn dispatch_removed(&self) {
        let mut state = self.inner.lock();
        if state.removed {
            return;
        }
        state.removed = true;
        if !state.mask.contains(EventMask::PORT_REMOVED) {
            return;
        }
        if let Some(listener) = state.listener.as_mut() {
            listener.on_event(PortEvent::Removed);
        }
    }
}

/// Running watcher bound to one handle
pub(crate) struct Watcher {
    shutdown: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl Watcher {
    /// Stop the watcher. Callers take the listener out of the slot first,
    /// which is what guarantees no dispatch survives this call.
    pub(crate) fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

fn diff(prev: LineStatus, current: LineStatus) -> EventMask {
    let mut changed = EventMask::empty();
    if prev.cts != current.cts {
        changed = changed | EventMask::CTS;
    }
    if prev.dsr != current.dsr {
        changed = changed | EventMask::DSR;
    }
    if prev.ri != current.ri {
        changed = changed | EventMask::RI;
    }
    if prev.cd != current.cd {
        changed = changed | EventMask::CD;
    }
    if current.break_received {
        changed = changed | EventMask::BREAK;
    }
    changed
}

/// Spawn the polling watcher for one handle
pub(crate) fn spawn_watcher(
    transport: Arc<tokio::sync::Mutex<Box<dyn PortTransport>>>,
    slot: Arc<ListenerSlot>,
    description: String,
) -> Watcher {
    let shutdown = Arc::new(AtomicBool::new(false));
    let task_shutdown = shutdown.clone();

    let task = tokio::spawn(async move {
        // The snapshot taken on the first poll is the baseline; transitions
        // that happened before registration are not reported
        let mut prev: Option<LineStatus> = None;

        loop {
            if task_shutdown.load(Ordering::SeqCst) {
                break;
            }

            let status = {
                let transport = transport.lock().await;
                transport.status()
            };

            match status {
                Ok(current) => {
                    if let Some(prev) = prev {
                        let changed = diff(prev, current);
                        if changed != EventMask::empty() {
                            slot.dispatch_line(changed, current);
                        }
                    }
                    prev = Some(LineStatus { break_received: false, ..current });
                }
                Err(TransportError::NotOpen) => break,
                Err(e) => {
                    tracing::debug!("Watcher for {description} lost its device: {e}");
                    slot.dispatch_removed();
                    break;
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    });

    Watcher { shutdown, task }
}
