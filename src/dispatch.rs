//! Inbound frame demultiplexing to registered receive handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use embedded_can::{Frame as _, Id};
use tracing::error;

use crate::frame::Frame;
use crate::transport::Transport;

/// What a handler wants to see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxFilter {
    /// Exactly this identifier (the id itself carries the extended flag).
    Id(Id),
    /// Every frame whose extended flag matches.
    Any { extended: bool },
}

impl RxFilter {
    pub fn matches(&self, frame: &Frame) -> bool {
        match *self {
            RxFilter::Id(id) => frame.id() == id,
            RxFilter::Any { extended } => frame.is_extended() == extended,
        }
    }
}

impl From<Id> for RxFilter {
    fn from(id: Id) -> Self {
        RxFilter::Id(id)
    }
}

/// Opaque registration handle, the removal key for a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Box<dyn FnMut(&Frame) + Send>;

struct Registration {
    id: HandlerId,
    filter: RxFilter,
    handler: Handler,
}

/// Registration-ordered handler table.
///
/// The table mutex is held while handlers run, so a handler must not call
/// back into add/remove from inside its own invocation.
pub(crate) struct HandlerTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    next_id: u64,
    entries: Vec<Registration>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    pub fn add(&self, filter: RxFilter, handler: Handler) -> HandlerId {
        let mut inner = self.inner.lock().unwrap();
        let id = HandlerId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push(Registration {
            id,
            filter,
            handler,
        });
        id
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|r| r.id != id);
        inner.entries.len() != before
    }

    /// Run every matching handler in registration order. A panicking
    /// handler is logged and skipped; the rest still run.
    pub fn dispatch(&self, frame: &Frame) {
        let mut inner = self.inner.lock().unwrap();
        for reg in inner.entries.iter_mut() {
            if !reg.filter.matches(frame) {
                continue;
            }
            let handler = &mut reg.handler;
            if catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
                error!("receive handler panicked on {frame}, isolating");
            }
        }
    }

    /// Dispatch worker loop body. Runs until `running` clears.
    pub fn run(&self, transport: &dyn Transport, running: &AtomicBool) {
        // Modest timeout: long enough to idle cheaply, short enough to
        // notice shutdown promptly.
        const RECV_WAIT: Duration = Duration::from_secs(1);

        while running.load(Ordering::Acquire) {
            if let Some(frame) = transport.next_message(Some(RECV_WAIT)) {
                self.dispatch(&frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn seen_counter(table: &HandlerTable, filter: RxFilter) -> (HandlerId, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = count.clone();
        let id = table.add(
            filter,
            Box::new(move |_| {
                clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (id, count)
    }

    #[test]
    fn specific_id_must_match_exactly() {
        let table = HandlerTable::new();
        let target = Frame::new_ext(0x123, &[]).unwrap();
        let (_, hits) = seen_counter(&table, RxFilter::Id(target.id()));

        table.dispatch(&target);
        table.dispatch(&Frame::new_ext(0x124, &[]).unwrap());
        // Same bits, standard id: the extended flag keeps it out
        table.dispatch(&Frame::new_std(0x123, &[]).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_filters_on_extended_flag() {
        let table = HandlerTable::new();
        let (_, ext_hits) = seen_counter(&table, RxFilter::Any { extended: true });
        let (_, std_hits) = seen_counter(&table, RxFilter::Any { extended: false });

        table.dispatch(&Frame::new_ext(0x1, &[]).unwrap());
        table.dispatch(&Frame::new_ext(0x2, &[]).unwrap());
        table.dispatch(&Frame::new_std(0x3, &[]).unwrap());
        assert_eq!(ext_hits.load(Ordering::SeqCst), 2);
        assert_eq!(std_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let table = HandlerTable::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            table.add(
                RxFilter::Any { extended: true },
                Box::new(move |_| order.lock().unwrap().push(tag)),
            );
        }
        table.dispatch(&Frame::new_ext(0x1, &[]).unwrap());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let table = HandlerTable::new();
        table.add(
            RxFilter::Any { extended: true },
            Box::new(|_| panic!("handler fault")),
        );
        let (_, hits) = seen_counter(&table, RxFilter::Any { extended: true });

        table.dispatch(&Frame::new_ext(0x1, &[]).unwrap());
        table.dispatch(&Frame::new_ext(0x2, &[]).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_by_handle() {
        let table = HandlerTable::new();
        let (id, hits) = seen_counter(&table, RxFilter::Any { extended: true });
        table.dispatch(&Frame::new_ext(0x1, &[]).unwrap());
        assert!(table.remove(id));
        assert!(!table.remove(id));
        table.dispatch(&Frame::new_ext(0x1, &[]).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
