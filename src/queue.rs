// queue.rs - outbound datagram queue with a single drainer
//
// Whoever flips `draining` from false to true owns the drain until it finds
// the queue empty; every other push only appends. The lock guards the deque
// alone and is never held across a send.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{trace, warn};

use crate::{buffer::PooledBuffer, io::DatagramSink, metrics::Metrics};

#[derive(Debug)]
struct Outgoing {
    buffer: PooledBuffer,
    target: SocketAddr,
}

struct Inner<S> {
    sink: S,
    pending: Mutex<VecDeque<Outgoing>>,
    draining: AtomicBool,
    metrics: Arc<Metrics>,
}

/// FIFO of sealed datagrams awaiting transmission.
pub struct SendQueue<S> {
    inner: Arc<Inner<S>>,
    runtime: Handle,
}

impl<S> Clone for SendQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            runtime: self.runtime.clone(),
        }
    }
}

impl<S> SendQueue<S> {
    pub fn len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pending.lock().is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub fn sink(&self) -> &S {
        &self.inner.sink
    }
}

impl<S> std::fmt::Debug for SendQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("pending", &self.len())
            .field("draining", &self.is_draining())
            .finish()
    }
}

impl<S: DatagramSink> SendQueue<S> {
    /// Drain tasks are spawned onto `runtime`.
    pub fn new(sink: S, metrics: Arc<Metrics>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                pending: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                metrics,
            }),
            runtime,
        }
    }

    /// Appends a datagram; starts a drainer if none is running.
    pub fn push(&self, buffer: PooledBuffer, target: SocketAddr) {
        {
            let mut pending = self.inner.pending.lock();
            pending.push_back(Outgoing { buffer, target });
            self.inner.metrics.send_queue_depth.set(pending.len() as i64);
        }
        if !self.inner.draining.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(&self.inner);
            self.runtime.spawn(drain(inner));
        }
    }
}

async fn drain<S: DatagramSink>(inner: Arc<Inner<S>>) {
    loop {
        let next = {
            let mut pending = inner.pending.lock();
            let next = pending.pop_front();
            inner.metrics.send_queue_depth.set(pending.len() as i64);
            next
        };

        let Some(Outgoing { mut buffer, target }) = next else {
            inner.draining.store(false, Ordering::Release);
            // A push may have landed between the empty pop and the store.
            let refilled = !inner.pending.lock().is_empty();
            if refilled && !inner.draining.swap(true, Ordering::AcqRel) {
                continue;
            }
            return;
        };

        match inner.sink.send_buffer(&mut buffer, target).await {
            Ok(sent) => {
                trace!(%target, sent, "datagram sent");
                inner.metrics.datagrams_sent.inc();
                inner.metrics.bytes_sent.inc_by(sent as u64);
            }
            Err(err) => {
                warn!(?err, %target, "datagram send failed");
                inner.metrics.send_errors.inc();
            }
        }
        // `buffer` drops here and returns to its pool.
    }
}
