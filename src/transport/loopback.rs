//! In-memory null-modem loopback transport
//!
//! Two cross-wired endpoints sharing bounded byte queues. Control lines are
//! wired the way a null-modem cable wires them: each endpoint's RTS appears
//! as the peer's CTS, and DTR appears as the peer's DSR and CD. A break
//! raised on one end latches on the other until observed. `unplug` kills the
//! whole link, which is how tests simulate device removal.

use super::{LineStatus, PortTransport, TransportError};
use crate::config::LineConfig;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Default queue capacity per direction
const DEFAULT_CAPACITY: usize = 65536;

#[derive(Default)]
struct DrivenLines {
    rts: bool,
    dtr: bool,
    ring: bool,
}

/// One direction of the wire plus the signals driven by its owner
struct Wire {
    inbox: Mutex<VecDeque<u8>>,
    notify: Notify,
    driven: Mutex<DrivenLines>,
    break_latch: AtomicBool,
    unplugged: AtomicBool,
}

impl Wire {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inbox: Mutex::new(VecDeque::with_capacity(DEFAULT_CAPACITY)),
            notify: Notify::new(),
            driven: Mutex::new(DrivenLines::default()),
            break_latch: AtomicBool::new(false),
            unplugged: AtomicBool::new(false),
        })
    }
}

/// One end of a virtual null-modem link
pub struct LoopbackTransport {
    name: String,
    me: Arc<Wire>,
    peer: Arc<Wire>,
    config: LineConfig,
    capacity: usize,
    open: bool,
}

impl LoopbackTransport {
    /// Create a connected pair of endpoints
    pub fn pair(name: &str) -> (Self, Self) {
        let a = Wire::new();
        let b = Wire::new();

        let left = Self {
            name: format!("{name}.a"),
            me: a.clone(),
            peer: b.clone(),
            config: LineConfig::default(),
            capacity: DEFAULT_CAPACITY,
            open: false,
        };
        let right = Self {
            name: format!("{name}.b"),
            me: b,
            peer: a,
            config: LineConfig::default(),
            capacity: DEFAULT_CAPACITY,
            open: false,
        };
        (left, right)
    }

    /// Drive the ring-indicator signal as seen by the peer
    pub fn set_ring(&self, on: bool) {
        self.me.driven.lock().ring = on;
    }

    /// Kill the link for both ends; subsequent I/O and status calls fail
    pub fn unplug(&self) {
        self.me.unplugged.store(true, Ordering::SeqCst);
        self.peer.unplugged.store(true, Ordering::SeqCst);
        self.me.notify.notify_one();
        self.peer.notify.notify_one();
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if self.me.unplugged.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

#[async_trait]
impl PortTransport for LoopbackTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.check_link()?;
        self.open = true;
        Ok(())
    }

    async fn apply_config(&mut self, config: &LineConfig) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        self.config = *config;
        Ok(())
    }

    async fn read_bytes(&mut self, max: usize, timeout: Duration) -> Result<Bytes, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let deadline = Instant::now() + timeout;

        loop {
            self.check_link()?;

            {
                let mut inbox = self.me.inbox.lock();
                if !inbox.is_empty() {
                    let take = max.min(inbox.len());
                    let out: Vec<u8> = inbox.drain(..take).collect();
                    return Ok(Bytes::from(out));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Bytes::new());
            }
            // notify_one leaves a permit behind, so a write landing between
            // the drain above and this wait is not lost
            let _ = tokio::time::timeout(remaining, self.me.notify.notified()).await;
        }
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        self.check_link()?;
        if self.peer.unplugged.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }

        let accepted = {
            let mut inbox = self.peer.inbox.lock();
            let available = self.capacity.saturating_sub(inbox.len());
            let take = data.len().min(available);
            inbox.extend(&data[..take]);
            take
        };
        self.peer.notify.notify_one();
        Ok(accepted)
    }

    fn status(&self) -> Result<LineStatus, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        self.check_link()?;

        let peer = self.peer.driven.lock();
        Ok(LineStatus {
            cts: peer.rts,
            dsr: peer.dtr,
            ri: peer.ring,
            cd: peer.dtr,
            break_received: self.me.break_latch.swap(false, Ordering::SeqCst),
        })
    }

    async fn set_control_lines(&mut self, rts: bool, dtr: bool) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let mut driven = self.me.driven.lock();
        driven.rts = rts;
        driven.dtr = dtr;
        Ok(())
    }

    async fn set_break(&mut self, on: bool) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if on {
            self.peer.break_latch.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn clear_buffers(&mut self, input: bool, _output: bool) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if input {
            self.me.inbox.lock().clear();
        }
        // Output is delivered synchronously; there is never anything queued
        Ok(())
    }

    fn queued_bytes(&self) -> Result<(usize, usize), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        Ok((self.me.inbox.lock().len(), 0))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        self.open = false;
        // Tearing down one end removes the device from the peer's view
        self.unplug();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn description(&self) -> String {
        format!("loopback:{} ({} baud)", self.name, self.config.baud.as_u32())
    }
}
