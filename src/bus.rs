use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::frame::{CanFrame, CanOpenFrame, NmtCommand, NmtNodeControlAddress, NmtNodeControlFrame};

/// How long the receiver waits for a frame before re-checking its running flag.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Back-off after a link-layer read error.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Default retention of a [`FrameTap`].
pub const DEFAULT_TAP_CAPACITY: usize = 500;

#[async_trait]
pub trait CanInterface {
    async fn send_frame(&self, frame: CanFrame) -> Result<()>;
    async fn wait_for_frame(&self) -> Result<CanFrame>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Predicate = dyn Fn(u16) -> bool + Send + Sync;
type Handler = dyn Fn(&CanFrame) + Send + Sync;

struct Subscription {
    id: SubscriptionId,
    predicate: Box<Predicate>,
    handler: Box<Handler>,
}

/// Fan-out point between the link layer and the protocol layers.
///
/// Dispatch reads the subscriber list through an [`ArcSwap`] and never takes
/// a lock, so the receiver task is never blocked by an SDO transaction in
/// progress on another task. Handlers run inline on the receiver and must
/// not block.
pub struct FrameBus<I> {
    interface: Arc<I>,
    subscriptions: Arc<ArcSwap<Vec<Arc<Subscription>>>>,
    next_id: Arc<AtomicU64>,
}

impl<I> Clone for FrameBus<I> {
    fn clone(&self) -> Self {
        Self {
            interface: Arc::clone(&self.interface),
            subscriptions: Arc::clone(&self.subscriptions),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<I> FrameBus<I> {
    pub fn new(interface: I) -> Self {
        Self {
            interface: Arc::new(interface),
            subscriptions: Arc::new(ArcSwap::from_pointee(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers `handler` for every inbound frame whose COB-ID satisfies `predicate`.
    pub fn subscribe<P, H>(&self, predicate: P, handler: H) -> SubscriptionId
    where
        P: Fn(u16) -> bool + Send + Sync + 'static,
        H: Fn(&CanFrame) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            predicate: Box::new(predicate),
            handler: Box::new(handler),
        });
        self.subscriptions.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&subscription));
            next
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.rcu(|current| {
            current
                .iter()
                .filter(|subscription| subscription.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    /// Opens a bounded queue of inbound frames in `cob_ids`.
    pub fn tap(&self, cob_ids: RangeInclusive<u16>, capacity: usize) -> FrameTap {
        let tap = FrameTap::new(capacity);
        let sink = tap.clone();
        let id = self.subscribe(move |cob_id| cob_ids.contains(&cob_id), move |frame| {
            sink.push(*frame)
        });
        FrameTap { id: Some(id), ..tap }
    }

    /// Hands one inbound frame to every matching subscriber.
    pub fn dispatch(&self, frame: &CanFrame) {
        let subscriptions = self.subscriptions.load();
        for subscription in subscriptions.iter() {
            if (subscription.predicate)(frame.cob_id()) {
                (subscription.handler)(frame);
            }
        }
    }
}

impl<I> FrameBus<I>
where
    I: Send + Sync + CanInterface + 'static,
{
    /// Submits `frame` to the link layer. Success means accepted for
    /// transmission, not delivered.
    pub async fn send(&self, frame: CanFrame) -> Result<()> {
        log::trace!("tx {}", frame);
        self.interface.send_frame(frame).await.map_err(|err| {
            log::warn!("failed to send {}: {}", frame, err);
            err
        })
    }

    pub async fn send_canopen(&self, frame: impl Into<CanOpenFrame>) -> Result<()> {
        self.send(frame.into().into()).await
    }

    pub async fn nmt_node_control(
        &self,
        command: NmtCommand,
        address: NmtNodeControlAddress,
    ) -> Result<()> {
        log::debug!("NMT {:?} -> {:?}", command, address);
        self.send_canopen(NmtNodeControlFrame::new(command, address))
            .await
    }

    /// Drains the link layer until `running` is cleared, dispatching every
    /// frame. Read errors are logged and never end the loop.
    pub fn spawn_receiver(&self, running: Arc<AtomicBool>) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            while running.load(Ordering::Acquire) {
                match tokio::time::timeout(RECEIVE_POLL_INTERVAL, bus.interface.wait_for_frame())
                    .await
                {
                    Err(_elapsed) => continue,
                    Ok(Ok(frame)) => {
                        log::trace!("rx {}", frame);
                        bus.dispatch(&frame);
                    }
                    // remote, error and extended-id frames from other devices
                    Ok(Err(Error::NotImplemented | Error::CanFdNotSupported)) => {
                        log::trace!("ignored non-CANopen frame");
                    }
                    Ok(Err(err)) => {
                        log::warn!("failed to receive frame: {}", err);
                        tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                    }
                }
            }
            log::debug!("frame receiver stopped");
        })
    }
}

/// Lossy retention queue fed by a bus subscription. Once `capacity` frames
/// are queued the oldest is discarded for each new arrival.
#[derive(Clone)]
pub struct FrameTap {
    id: Option<SubscriptionId>,
    queue: Arc<Mutex<VecDeque<CanFrame>>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl FrameTap {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: None,
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<CanFrame>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, frame: CanFrame) {
        let mut queue = self.lock();
        while queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(frame);
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.id
    }

    pub fn try_pop(&self) -> Option<CanFrame> {
        self.lock().pop_front()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
