use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::trace;

use crate::error::{NetError, Result};
use crate::frame::EthernetFrame;
use crate::mac::MacAddr;

/// A handle tracking in-flight, asynchronously-scheduled frame deliveries.
///
/// This is an explicit, `Arc`-cloneable handle rather than a process-wide
/// static: every device and remote vPort is constructed with one, and tests
/// hold their own to await quiescence via [`DeliveryTracker::all_settled`].
#[derive(Clone, Default)]
pub struct DeliveryTracker {
    inner: Arc<DeliveryTrackerInner>,
}

#[derive(Default)]
struct DeliveryTrackerInner {
    in_flight: AtomicU64,
    notify: Notify,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    /// Waits until there are no deliveries in flight at the moment all
    /// currently-pending ones complete. Intended for tests only.
    pub async fn all_settled(&self) {
        loop {
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub type ReceiveHandler = Arc<dyn Fn(EthernetFrame) -> BoxFuture<'static, ()> + Send + Sync>;

struct VPortInner {
    mac: MacAddr,
    name: String,
    peer: Mutex<Option<Weak<VPortInner>>>,
    on_receive: Mutex<Option<ReceiveHandler>>,
    tracker: DeliveryTracker,
}

/// A point-to-point Ethernet link endpoint.
///
/// `write` never runs the peer's receive handler on the caller's stack: it
/// schedules delivery as an independent task so a flood through many hops of
/// switches can't blow the stack, and so callers are never blocked by a slow
/// peer.
#[derive(Clone)]
pub struct VPort {
    inner: Arc<VPortInner>,
}

impl VPort {
    pub fn new(name: impl Into<String>, mac: MacAddr, tracker: DeliveryTracker) -> Self {
        Self {
            inner: Arc::new(VPortInner {
                mac,
                name: name.into(),
                peer: Mutex::new(None),
                on_receive: Mutex::new(None),
                tracker,
            }),
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.inner.mac
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .peer
            .lock()
            .expect("vport peer lock poisoned")
            .is_some()
    }

    /// True if this port's current peer is `other`, compared by identity
    /// rather than by MAC (two distinct ports can share a MAC in tests).
    pub fn peer_is(&self, other: &VPort) -> bool {
        self.inner
            .peer
            .lock()
            .expect("vport peer lock poisoned")
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&other.inner)))
    }

    pub fn set_on_receive(&self, handler: ReceiveHandler) {
        *self.inner.on_receive.lock().expect("vport handler lock poisoned") = Some(handler);
    }

    /// Symmetrically links `a` and `b` as peers of one another.
    pub fn link(a: &VPort, b: &VPort) {
        *a.inner.peer.lock().expect("vport peer lock poisoned") = Some(Arc::downgrade(&b.inner));
        *b.inner.peer.lock().expect("vport peer lock poisoned") = Some(Arc::downgrade(&a.inner));
    }

    /// Clears both sides of the link, if any.
    pub fn unlink(&self) {
        let peer = self
            .inner
            .peer
            .lock()
            .expect("vport peer lock poisoned")
            .take();
        if let Some(weak_peer) = peer {
            if let Some(peer_inner) = weak_peer.upgrade() {
                *peer_inner.peer.lock().expect("vport peer lock poisoned") = None;
                *peer_inner
                    .on_receive
                    .lock()
                    .expect("vport handler lock poisoned") = None;
            }
        }
        *self
            .inner
            .on_receive
            .lock()
            .expect("vport handler lock poisoned") = None;
    }

    /// Schedules `frame` for asynchronous delivery to this port's peer.
    /// Returns immediately; does not wait for the peer to process it.
    pub fn write(&self, frame: EthernetFrame) -> Result<()> {
        let peer = self
            .inner
            .peer
            .lock()
            .expect("vport peer lock poisoned")
            .clone()
            .ok_or(NetError::NotConnected)?;
        let Some(peer_inner) = peer.upgrade() else {
            return Err(NetError::NotConnected);
        };
        let handler = peer_inner
            .on_receive
            .lock()
            .expect("vport handler lock poisoned")
            .clone();
        let Some(handler) = handler else {
            trace!(port = %self.inner.name, "peer has no receive handler installed, dropping frame");
            return Ok(());
        };
        let tracker = self.inner.tracker.clone();
        tracker.begin();
        tokio::spawn(async move {
            handler(frame).await;
            tracker.end();
        });
        Ok(())
    }
}
