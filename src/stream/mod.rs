//! The streaming engine.
//!
//! Four logical streams (DEBUG, STATUS, DATA, FFT) share one descriptor
//! pool; each stream has its own bounded queue and sender fiber. Producers
//! enqueue without ever blocking. Overload is resolved by stopping
//! acquisition and flushing the queues, surfaced to clients through the
//! slow-connection flag in the next state broadcast; producers are never
//! slowed down and streams are never corrupted.
//!
//! The DATA stream additionally throttles the HTTP side: when its queue
//! runs deep the shared `http_permitted` flag is cleared, and the DATA
//! fiber raises it again once descriptor-pool occupancy falls below the
//! low-water threshold.

pub mod descriptor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::config::{
    DATA_DESCRIPTOR_POOL_SIZE, DATA_QUEUE_SIZE, DEBUG_QUEUE_SIZE, FFT_QUEUE_SIZE,
    MAX_CONNECTIONS, SEND_TYPE_DATA, SEND_TYPE_DEBUG, SEND_TYPE_FFT, SEND_TYPE_STATUS,
    STATUS_QUEUE_SIZE,
};
use crate::measure::state::StateController;
use crate::net::connection::{ConnectionRegistry, ConnectionType};
use crate::pool::Pool;
use crate::queue::MarkerQueue;

use descriptor::{Completion, DataDescriptor, SendPtr};

/// DATA queue depth above which static-file serving is paused.
pub const LOCK_HTTP_THRESHOLD: usize = DATA_QUEUE_SIZE / 4;
/// Descriptor-pool occupancy below which it is resumed.
pub const RELEASE_HTTP_THRESHOLD: usize = DATA_QUEUE_SIZE / 8;

const STREAM_COUNT: usize = 4;

fn queue_index(send_type: u8) -> usize {
    match send_type {
        SEND_TYPE_DEBUG => 0,
        SEND_TYPE_STATUS => 1,
        SEND_TYPE_DATA => 2,
        SEND_TYPE_FFT => 3,
        _ => unreachable!("no stream queue for send type {:#04x}", send_type),
    }
}

/// Called when a copy-mode enqueue fails; stops acquisition and raises the
/// slow-connection flag.
type OverloadHook = Box<dyn Fn() + Send + Sync>;

pub struct Streamer {
    pool: Pool<DataDescriptor>,
    queues: [MarkerQueue; STREAM_COUNT],
    flush_requested: AtomicBool,
    http_permitted: AtomicBool,
    overload_hook: Mutex<Option<OverloadHook>>,
}

impl Streamer {
    pub fn new() -> Self {
        Streamer {
            pool: Pool::from_fn(DATA_DESCRIPTOR_POOL_SIZE, |_| DataDescriptor::new()),
            queues: [
                MarkerQueue::new(DEBUG_QUEUE_SIZE),
                MarkerQueue::new(STATUS_QUEUE_SIZE),
                MarkerQueue::new(DATA_QUEUE_SIZE),
                MarkerQueue::new(FFT_QUEUE_SIZE),
            ],
            flush_requested: AtomicBool::new(false),
            http_permitted: AtomicBool::new(true),
            overload_hook: Mutex::new(None),
        }
    }

    /// Installs the reaction to descriptor exhaustion. Must be set before
    /// acquisition can run.
    pub fn set_overload_hook(&self, hook: OverloadHook) {
        *self.overload_hook.lock() = Some(hook);
    }

    pub fn http_permitted(&self) -> bool {
        self.http_permitted.load(Ordering::Acquire)
    }

    pub fn descriptor_pool_used(&self) -> usize {
        self.pool.used_count()
    }

    pub fn queue_depth(&self, send_type: u8) -> usize {
        self.queues[queue_index(send_type)].len()
    }

    /// Sends a copied payload on the given stream. On failure the overload
    /// reaction fires: acquisition stops, the slow-connection flag is set and
    /// all stream queues are flushed.
    pub fn send_data(&self, send_type: u8, payload: &[u8]) -> bool {
        let ok = self.internal_send(send_type, |body| {
            body.prepare_copy(send_type, payload, None)
        });
        if !ok {
            if let Some(hook) = self.overload_hook.lock().as_ref() {
                hook();
            }
            self.flush_and_request_status();
        }
        ok
    }

    /// Sends caller-owned bytes without copying. The producer guarantees 7
    /// writable bytes in front of the payload for the in-place headers and
    /// keeps the memory alive until `callback` fires. Unlike the copy path,
    /// a failure here only drops the message.
    pub fn send_data_non_copy(
        &self,
        send_type: u8,
        payload: SendPtr,
        len: usize,
        callback: Completion,
    ) -> bool {
        self.internal_send(send_type, |body| {
            body.prepare_borrowed(send_type, payload, len, Some(callback))
        })
    }

    /// Convenience wrapper for textual diagnostics on the DEBUG stream.
    pub fn send_debug(&self, text: &str) {
        let _ = self.internal_send(SEND_TYPE_DEBUG, |body| {
            body.prepare_copy(SEND_TYPE_DEBUG, text.as_bytes(), None)
        });
    }

    fn internal_send(
        &self,
        send_type: u8,
        fill: impl FnOnce(&mut descriptor::DescriptorBody),
    ) -> bool {
        let slot = match self.pool.allocate() {
            Some(slot) => slot,
            None => return false,
        };

        fill(&mut *self.pool.get(slot).body().lock());

        let queue = &self.queues[queue_index(send_type)];
        if queue.enqueue(slot).is_err() {
            self.pool.free(slot);
            return false;
        }

        // Opportunistic GC: reclaim descriptors the fibers are done with,
        // but never while a fiber is moving its marker.
        self.collect_passed();

        let pool_count = self.pool.used_count();
        if pool_count > 8 {
            debug!(
                "descriptor pool at {}, data queue at {}",
                pool_count,
                self.queues[queue_index(SEND_TYPE_DATA)].len()
            );
        }

        if send_type == SEND_TYPE_DATA
            && self.http_permitted.load(Ordering::Acquire)
            && queue.len() > LOCK_HTTP_THRESHOLD
        {
            self.http_permitted.store(false, Ordering::Release);
            debug!("data queue deep, pausing http");
        }

        true
    }

    fn collect_passed(&self) {
        for queue in &self.queues {
            if queue.is_marker_updating() {
                continue;
            }
            while queue.head_behind_marker() {
                if let Some(slot) = queue.dequeue() {
                    self.pool.free(slot);
                }
            }
        }
    }

    /// Drains every stream queue back into the pool and asks the DATA fiber
    /// to broadcast the state once it runs.
    pub fn flush_and_request_status(&self) {
        self.flush_requested.store(true, Ordering::Release);
        for queue in &self.queues {
            while let Some(slot) = queue.dequeue() {
                self.pool.free(slot);
            }
        }
    }

    /// One line per stream plus pool usage, for the debugging command.
    pub fn stats_string(&self) -> String {
        format!(
            "queues debug/status/data/fft: {}/{}/{}/{}\npool: {} used of {}, high water {}\nhttp permitted: {}\n",
            self.queues[0].len(),
            self.queues[1].len(),
            self.queues[2].len(),
            self.queues[3].len(),
            self.pool.used_count(),
            self.pool.capacity(),
            self.pool.high_water(),
            self.http_permitted()
        )
    }

    /// Starts the four sender fibers.
    pub fn spawn_senders(
        self: &Arc<Self>,
        connections: Arc<ConnectionRegistry>,
        state: Arc<StateController>,
        running: Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        let kinds = [
            (SEND_TYPE_DEBUG, "sender-debug"),
            (SEND_TYPE_STATUS, "sender-status"),
            (SEND_TYPE_DATA, "sender-data"),
            (SEND_TYPE_FFT, "sender-fft"),
        ];
        kinds
            .iter()
            .map(|&(send_type, name)| {
                let streamer = self.clone();
                let connections = connections.clone();
                let state = state.clone();
                let running = running.clone();
                thread::Builder::new()
                    .name(name.into())
                    .spawn(move || {
                        streamer.sender_loop(send_type, &connections, &state, &running)
                    })
                    .expect("spawn sender fiber")
            })
            .collect()
    }

    fn sender_loop(
        &self,
        send_type: u8,
        connections: &ConnectionRegistry,
        state: &StateController,
        running: &AtomicBool,
    ) {
        let is_data_fiber = send_type == SEND_TYPE_DATA;
        let queue = &self.queues[queue_index(send_type)];

        while running.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));

            // After an overrun flush the client needs to learn about it.
            if is_data_fiber && self.flush_requested.swap(false, Ordering::AcqRel) {
                self.http_permitted.store(true, Ordering::Release);
                state.update_complete_state(true);
            }

            let backlog = queue.len();
            for _ in 0..backlog {
                let slot = match queue.marker_front() {
                    Some(slot) => slot,
                    None => break,
                };

                let descriptor = self.pool.get(slot);
                let mut body = descriptor.body().lock();

                for index in 0..MAX_CONNECTIONS {
                    if body.delivered[index] {
                        continue;
                    }
                    let connection = match connections.get(index) {
                        Some(c) => c,
                        None => {
                            // No such connection; handled by definition.
                            body.delivered[index] = true;
                            continue;
                        }
                    };
                    if connection.send_type() & body.send_type == 0 {
                        body.delivered[index] = true;
                        continue;
                    }

                    let frame = match connection.conn_type() {
                        ConnectionType::Tcp => body.adcp_frame(),
                        ConnectionType::WebSocket => body.ws_frame(),
                        _ => {
                            body.delivered[index] = true;
                            continue;
                        }
                    };
                    match connection.try_write_for(Duration::from_millis(1), frame) {
                        Some(Ok(())) => body.delivered[index] = true,
                        Some(Err(e)) => {
                            // The connection task will notice and clean up.
                            warn!("write to connection {} failed: {}", connection.id(), e);
                            body.delivered[index] = true;
                        }
                        None => {} // write lock contended, retry next tick
                    }
                }

                if body.delivered_to_all(MAX_CONNECTIONS) {
                    queue.marker_dequeue();
                    let callback = body.callback.take();
                    drop(body);
                    if let Some(callback) = callback {
                        callback();
                    }
                } else {
                    // Head of this stream still owes a delivery; try again
                    // next tick, order within the stream is preserved.
                    break;
                }
            }

            if is_data_fiber
                && !self.http_permitted.load(Ordering::Acquire)
                && self.pool.used_count() < RELEASE_HTTP_THRESHOLD
            {
                self.http_permitted.store(true, Ordering::Release);
                debug!("descriptor pool drained, resuming http");
            }
        }
    }
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_send_enqueues_and_frames() {
        let streamer = Streamer::new();
        assert!(streamer.send_data(SEND_TYPE_STATUS, &[1, 2, 3]));
        assert_eq!(streamer.queue_depth(SEND_TYPE_STATUS), 1);
        assert_eq!(streamer.descriptor_pool_used(), 1);
    }

    #[test]
    fn test_queue_overflow_triggers_overload_and_flush() {
        let streamer = Streamer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        streamer.set_overload_hook(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        // With no fiber consuming, the STATUS queue (16) fills first.
        for _ in 0..STATUS_QUEUE_SIZE {
            assert!(streamer.send_data(SEND_TYPE_STATUS, &[0]));
        }
        assert!(!streamer.send_data(SEND_TYPE_STATUS, &[0]));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The flush returned every descriptor to the pool.
        assert_eq!(streamer.descriptor_pool_used(), 0);
        assert_eq!(streamer.queue_depth(SEND_TYPE_STATUS), 0);
        assert!(streamer.flush_requested.load(Ordering::Acquire));
    }

    #[test]
    fn test_http_lock_threshold() {
        let streamer = Streamer::new();
        assert!(streamer.http_permitted());
        for _ in 0..LOCK_HTTP_THRESHOLD {
            assert!(streamer.send_data(SEND_TYPE_DATA, &[0]));
        }
        assert!(streamer.http_permitted(), "at threshold, still permitted");
        assert!(streamer.send_data(SEND_TYPE_DATA, &[0]));
        assert!(!streamer.http_permitted(), "above threshold, paused");
    }

    #[test]
    fn test_non_copy_failure_does_not_stop_acquisition() {
        let streamer = Streamer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        streamer.set_overload_hook(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let mut backing = vec![0u8; 64];
        let payload = SendPtr(unsafe { backing.as_mut_ptr().add(7) });
        for _ in 0..FFT_QUEUE_SIZE {
            assert!(streamer.send_data_non_copy(SEND_TYPE_FFT, payload, 8, Box::new(|| {})));
        }
        assert!(!streamer.send_data_non_copy(SEND_TYPE_FFT, payload, 8, Box::new(|| {})));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
