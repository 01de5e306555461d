//! The user-facing bus object: one transport, one cyclic scheduler, one
//! receive dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use embedded_can::Id;
use tracing::warn;

use crate::cyclic::{CyclicKey, CyclicScheduler};
use crate::dispatch::{HandlerId, HandlerTable, RxFilter};
use crate::frame::Frame;
use crate::transport::{Transport, QUEUE_DELAY};

/// Handle to an open CAN connection.
///
/// Owns two worker threads: the cyclic scheduler (started at construction)
/// and the receive dispatcher (started with the first handler registration,
/// so purely polled use via [`CanBus::next_message`] never competes with a
/// dispatcher for inbound frames).
///
/// Workers park on timed waits only, so [`CanBus::shutdown`] quiesces within
/// a second or two.
pub struct CanBus {
    transport: Arc<dyn Transport>,
    scheduler: Arc<CyclicScheduler>,
    handlers: Arc<HandlerTable>,
    running: Arc<AtomicBool>,
    loopback: bool,
    cyclic_worker: Mutex<Option<JoinHandle<()>>>,
    dispatch_worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CanBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanBus").field("loopback", &self.loopback).finish_non_exhaustive()
    }
}

impl CanBus {
    /// Wrap a transport. With `loopback` set, every successful send is also
    /// mirrored onto the inbound path.
    pub fn new(transport: Arc<dyn Transport>, loopback: bool) -> Self {
        let scheduler = Arc::new(CyclicScheduler::new());
        let running = Arc::new(AtomicBool::new(true));

        let cyclic_worker = {
            let scheduler = scheduler.clone();
            let transport = transport.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("canlink-cyclic".into())
                .spawn(move || {
                    let send = |frame: &Frame| transmit(transport.as_ref(), loopback, frame);
                    scheduler.run(&send, &running)
                })
                .expect("spawn cyclic worker")
        };

        Self {
            transport,
            scheduler,
            handlers: Arc::new(HandlerTable::new()),
            running,
            loopback,
            cyclic_worker: Mutex::new(Some(cyclic_worker)),
            dispatch_worker: Mutex::new(None),
        }
    }

    /// Queue a frame for transmission. Returns false when the outbound
    /// queue stays full for the send window, or when loopback cannot place
    /// the inbound copy.
    pub fn send(&self, frame: &Frame) -> bool {
        transmit(self.transport.as_ref(), self.loopback, frame)
    }

    /// Take the next inbound frame. `None` timeout blocks while the
    /// transport is running.
    pub fn next_message(&self, timeout: Option<Duration>) -> Option<Frame> {
        self.transport.next_message(timeout)
    }

    /// Block up to `timeout` for the next frame with exactly this id.
    ///
    /// Frames are observed through a temporary handler registration, so
    /// concurrent handlers still see everything they subscribed to.
    pub fn wait_for_message(&self, id: Id, timeout: Duration) -> Option<Frame> {
        let (tx, rx) = crossbeam_channel::bounded::<Frame>(1);
        let token = self.add_receive_handler(RxFilter::Id(id), move |frame| {
            let _ = tx.try_send(frame.clone());
        });
        let result = rx.recv_timeout(timeout).ok();
        self.remove_receive_handler(token);
        result
    }

    /// Transmit `frame` every `period` until stopped. `key` defaults to the
    /// frame's identifier; adding an existing key replaces that entry and
    /// restarts its schedule.
    pub fn add_cyclic_message(
        &self,
        frame: Frame,
        period: Duration,
        key: Option<CyclicKey>,
    ) -> bool {
        self.scheduler.add(frame, period, key)
    }

    /// Replace the payload of a cyclic entry without touching its schedule.
    pub fn update_cyclic_message(&self, frame: Frame, key: Option<CyclicKey>) -> bool {
        self.scheduler.update(frame, key)
    }

    /// Stop emissions for `key`. The entry stays listed and can be
    /// re-added later.
    pub fn stop_cyclic_message(&self, key: impl Into<CyclicKey>) -> bool {
        self.scheduler.stop(&key.into())
    }

    /// Snapshot of cyclic entries as (key, active) in insertion order.
    pub fn cyclic_messages(&self) -> Vec<(CyclicKey, bool)> {
        self.scheduler.list()
    }

    /// Register a receive handler; the returned id is the removal key.
    /// Handlers run on the dispatch worker in registration order.
    pub fn add_receive_handler(
        &self,
        filter: impl Into<RxFilter>,
        handler: impl FnMut(&Frame) + Send + 'static,
    ) -> HandlerId {
        let id = self.handlers.add(filter.into(), Box::new(handler));
        self.ensure_dispatcher();
        id
    }

    pub fn remove_receive_handler(&self, id: HandlerId) -> bool {
        self.handlers.remove(id)
    }

    pub fn lifetime_sent(&self) -> u64 {
        self.transport.lifetime_sent()
    }

    pub fn lifetime_received(&self) -> u64 {
        self.transport.lifetime_received()
    }

    /// Stop the scheduler, then the dispatcher, then the transport.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.scheduler.wake();
        if let Some(worker) = self.cyclic_worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.dispatch_worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        self.transport.shutdown();
    }

    fn ensure_dispatcher(&self) {
        let mut slot = self.dispatch_worker.lock().unwrap();
        if slot.is_some() || !self.running.load(Ordering::Acquire) {
            return;
        }
        let handlers = self.handlers.clone();
        let transport = self.transport.clone();
        let running = self.running.clone();
        let worker = std::thread::Builder::new()
            .name("canlink-dispatch".into())
            .spawn(move || handlers.run(transport.as_ref(), &running))
            .expect("spawn dispatch worker");
        *slot = Some(worker);
    }
}

/// The one transmit path: bounded outbound put, then the loopback mirror.
/// Used by both user sends and the cyclic worker.
fn transmit(transport: &dyn Transport, loopback: bool, frame: &Frame) -> bool {
    if !transport.send(frame.clone(), Some(QUEUE_DELAY)) {
        return false;
    }
    if loopback && !transport.inject(frame.clone()) {
        warn!("loopback copy dropped, inbound queue full: {frame}");
        return false;
    }
    true
}
