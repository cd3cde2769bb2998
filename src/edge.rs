//! In-memory edges between processors.
//!
//! An edge is a bounded single-producer single-consumer queue. The producer
//! half offers items and observes backpressure as a plain `false`; the
//! consumer half is an ordered [`InboundStream`] that yields
//! [`StreamItem::EndOfStream`] once the producer has closed and the queue has
//! drained. A tasklet writes through an [`EdgeOutbox`], which broadcasts each
//! item to all of its outbound edges and keeps per-edge delivery state so a
//! refused broadcast can be resumed without duplicating the item anywhere.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::StreamItem;

/// Bounded buffered sink. `offer` returning `false` means the downstream
/// cannot accept the item now; the caller must retry later with the same
/// item.
pub trait Outbox {
    fn offer(&mut self, item: StreamItem) -> bool;
}

/// Ordered sequence of items flowing into a tasklet. Each stream has a
/// stable ordinal given by its position in the tasklet's stream list.
pub trait InboundStream {
    /// Head of the stream without consuming it.
    fn peek(&mut self) -> Option<&StreamItem>;

    /// Takes the head of the stream.
    fn poll(&mut self) -> Option<StreamItem>;

    /// Drops the head of the stream.
    fn remove(&mut self);
}

struct EdgeState {
    queue: VecDeque<StreamItem>,
    capacity: usize,
    closed: bool,
}

/// Creates one edge with the given capacity and hands back its two halves.
pub fn edge(capacity: usize) -> (EdgeProducer, EdgeConsumer) {
    let state = Arc::new(Mutex::new(EdgeState {
        queue: VecDeque::with_capacity(capacity),
        capacity,
        closed: false,
    }));
    (
        EdgeProducer {
            state: Arc::clone(&state),
        },
        EdgeConsumer {
            state,
            peeked: None,
        },
    )
}

/// Producer half of an edge.
pub struct EdgeProducer {
    state: Arc<Mutex<EdgeState>>,
}

impl EdgeProducer {
    /// Marks the edge closed. The consumer sees `EndOfStream` once the
    /// queue drains. Idempotent.
    pub fn close(&mut self) {
        self.state.lock().closed = true;
    }
}

impl Outbox for EdgeProducer {
    fn offer(&mut self, item: StreamItem) -> bool {
        let mut state = self.state.lock();
        if state.queue.len() >= state.capacity {
            return false;
        }
        state.queue.push_back(item);
        true
    }
}

/// Consumer half of an edge.
pub struct EdgeConsumer {
    state: Arc<Mutex<EdgeState>>,
    // Head item pulled out of the shared queue so peek can hand out a
    // reference without holding the lock.
    peeked: Option<StreamItem>,
}

impl InboundStream for EdgeConsumer {
    fn peek(&mut self) -> Option<&StreamItem> {
        if self.peeked.is_none() {
            let mut state = self.state.lock();
            self.peeked = match state.queue.pop_front() {
                Some(item) => Some(item),
                None if state.closed => Some(StreamItem::EndOfStream),
                None => None,
            };
        }
        self.peeked.as_ref()
    }

    fn poll(&mut self) -> Option<StreamItem> {
        self.peek();
        self.peeked.take()
    }

    fn remove(&mut self) {
        let _ = self.poll();
    }
}

/// Routes every offered item to all outbound edges.
///
/// Partial acceptance is remembered: an edge that took the in-flight item is
/// not offered it again, and `offer` keeps returning `false` until the last
/// edge accepts. The retry must present the same item.
pub struct EdgeOutbox {
    edges: Vec<EdgeProducer>,
    pending: Vec<bool>,
    in_flight: Option<StreamItem>,
    delivered_last_offer: usize,
}

impl EdgeOutbox {
    pub fn new(edges: Vec<EdgeProducer>) -> Self {
        let pending = vec![false; edges.len()];
        EdgeOutbox {
            edges,
            pending,
            in_flight: None,
            delivered_last_offer: 0,
        }
    }

    /// Number of edges the most recent `offer` delivered to.
    pub(crate) fn delivered_last_offer(&self) -> usize {
        self.delivered_last_offer
    }

    /// `true` while a refused item is still owed to some edge. Until the
    /// original caller retries it to completion, nothing else may be
    /// offered.
    pub(crate) fn has_unfinished(&self) -> bool {
        self.in_flight.is_some()
    }
}

impl Outbox for EdgeOutbox {
    fn offer(&mut self, item: StreamItem) -> bool {
        if self.in_flight.is_none() {
            self.in_flight = Some(item.clone());
            for pending in &mut self.pending {
                *pending = true;
            }
        } else {
            debug_assert_eq!(
                self.in_flight.as_ref(),
                Some(&item),
                "offer retried with a different item"
            );
        }
        self.delivered_last_offer = 0;
        for (edge, pending) in self.edges.iter_mut().zip(&mut self.pending) {
            if *pending && edge.offer(item.clone()) {
                *pending = false;
                self.delivered_last_offer += 1;
            }
        }
        if self.pending.contains(&true) {
            false
        } else {
            self.in_flight = None;
            true
        }
    }
}
