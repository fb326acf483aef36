//! Background transmit and receive drivers
//!
//! Each driver owns one backend and one worker thread. The worker's only
//! suspension point is its idle poll, so [`TxDriver::stop`] and
//! [`RxDriver::stop`] take effect within one poll interval once the current
//! word is finished.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::core::{ArincWord, IntoArincWord};
use crate::encoding::WordCodec;
use crate::error::{LinkError, Result};
use crate::queue::{QueueOrder, TxQueue};
use crate::receiver::{ReceiveSource, RxEvent, RxPoll};
use crate::transmitter::Transmit;

/// Handle to a background transmit worker
///
/// Words passed to [`TxDriver::send`] are queued and shifted out one at a
/// time by the worker, oldest first unless the queue is configured as
/// [`QueueOrder::Lifo`].
#[derive(Debug)]
pub struct TxDriver<B> {
    queue: Arc<TxQueue>,
    sent: Arc<AtomicU64>,
    worker: Option<JoinHandle<B>>,
}

impl<B> TxDriver<B>
where
    B: Transmit + Send + 'static,
{
    /// Start the transmit worker on `backend`
    pub fn spawn(backend: B, config: LinkConfig) -> Result<Self> {
        config.validate()?;
        if config.order == QueueOrder::Lifo {
            warn!("transmit queue configured newest-first; words will be reordered");
        }

        let queue = Arc::new(TxQueue::new(config.queue_capacity, config.order));
        let sent = Arc::new(AtomicU64::new(0));
        let poll = backend.idle_poll(config.poll_interval);

        info!(
            backend = backend.name(),
            frequency_hz = config.frequency_hz,
            capacity = config.queue_capacity,
            ?poll,
            "starting transmit worker"
        );

        let worker = {
            let queue = Arc::clone(&queue);
            let sent = Arc::clone(&sent);
            thread::Builder::new()
                .name(format!("{}-tx", config.thread_name))
                .spawn(move || run_tx(backend, &queue, &sent, poll))
                .map_err(|e| {
                    error!(error = %e, "failed to spawn transmit worker");
                    LinkError::worker(format!("Failed to spawn transmit worker: {}", e))
                })?
        };

        Ok(TxDriver {
            queue,
            sent,
            worker: Some(worker),
        })
    }

    /// Queue a word for transmission without blocking
    pub fn send(&self, word: impl IntoArincWord) -> Result<()> {
        self.queue.enqueue(word)
    }

    /// Ask the worker to exit once the current word is finished
    ///
    /// Safe to call any number of times. Words still queued are not sent.
    pub fn stop(&self) {
        if self.queue.stop() {
            info!(pending = self.queue.len(), "transmit driver stopping");
        }
    }

    /// Whether the worker is still accepting words
    pub fn is_running(&self) -> bool {
        !self.queue.is_stopped()
            && self
                .worker
                .as_ref()
                .is_some_and(|worker| !worker.is_finished())
    }

    /// Words waiting in the queue
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Words handed to the backend without error so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Wait until every queued word has been handed to the backend
    ///
    /// A sequenced backend may still be shifting the last words out of its
    /// FIFO when this returns; [`TxDriver::shutdown`] flushes it.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout)
    }

    /// Stop the worker, wait for it to exit and take the backend back
    ///
    /// Returns the backend together with the number of queued words that
    /// were never started.
    pub fn shutdown(mut self) -> Result<(B, usize)> {
        self.stop();
        let worker = self
            .worker
            .take()
            .ok_or_else(|| LinkError::worker("Transmit worker already joined"))?;
        let backend = worker.join().map_err(|_| {
            error!("transmit worker panicked");
            LinkError::worker("Transmit worker panicked")
        })?;

        let discarded = self.queue.drain().len();
        if discarded > 0 {
            info!(discarded, "queued words discarded at shutdown");
        }
        Ok((backend, discarded))
    }
}

impl<B> Drop for TxDriver<B> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.queue.stop();
            let _ = worker.join();
        }
    }
}

fn run_tx<B: Transmit>(mut backend: B, queue: &TxQueue, sent: &AtomicU64, poll: Duration) -> B {
    loop {
        let Some(word) = queue.pop_timeout(poll) else {
            if queue.is_stopped() {
                break;
            }
            continue;
        };

        let wire = WordCodec::to_wire(word);
        match backend.transmit(wire) {
            Ok(()) => {
                sent.fetch_add(1, Ordering::Relaxed);
                debug!(word = %word, wire = format_args!("0x{:08X}", wire), "word transmitted");
            }
            Err(err) => warn!(word = %word, error = %err, "word not transmitted"),
        }
        queue.complete();
    }

    if let Err(err) = backend.flush() {
        warn!(error = %err, "backend did not drain before stop");
    }
    info!(sent = sent.load(Ordering::Relaxed), "transmit worker stopped");
    backend
}

/// Handle to a background receive worker
///
/// The callback runs on the worker thread, once per completed word in
/// reception order, and once with [`LinkError::ReceiveTimeout`] for every
/// word abandoned mid-way.
#[derive(Debug)]
pub struct RxDriver<S> {
    stop: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
    worker: Option<JoinHandle<S>>,
}

impl<S> RxDriver<S>
where
    S: ReceiveSource + Send + 'static,
{
    /// Start draining `source`, handing every event to `callback`
    pub fn spawn<F>(source: S, config: LinkConfig, callback: F) -> Result<Self>
    where
        F: FnMut(Result<ArincWord>) + Send + 'static,
    {
        config.validate()?;

        let stop = Arc::new(AtomicBool::new(false));
        let received = Arc::new(AtomicU64::new(0));
        let poll = source.idle_poll(config.poll_interval);

        info!(source = source.name(), ?poll, "starting receive worker");

        let worker = {
            let stop = Arc::clone(&stop);
            let received = Arc::clone(&received);
            thread::Builder::new()
                .name(format!("{}-rx", config.thread_name))
                .spawn(move || run_rx(source, callback, &stop, &received, poll))
                .map_err(|e| {
                    error!(error = %e, "failed to spawn receive worker");
                    LinkError::worker(format!("Failed to spawn receive worker: {}", e))
                })?
        };

        Ok(RxDriver {
            stop,
            received,
            worker: Some(worker),
        })
    }

    /// Ask the worker to exit the next time the line is idle
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            info!("receive driver stopping");
        }
    }

    /// Whether the worker is still running
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Words delivered to the callback so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Stop the worker, wait for it to exit and take the source back
    pub fn shutdown(mut self) -> Result<S> {
        self.stop();
        let worker = self
            .worker
            .take()
            .ok_or_else(|| LinkError::worker("Receive worker already joined"))?;
        worker.join().map_err(|_| {
            error!("receive worker panicked");
            LinkError::worker("Receive worker panicked")
        })
    }
}

impl<S> Drop for RxDriver<S> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.stop.store(true, Ordering::Release);
            let _ = worker.join();
        }
    }
}

fn idle_wait(poll: Duration) {
    if poll.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(poll);
    }
}

fn run_rx<S, F>(
    mut source: S,
    mut callback: F,
    stop: &AtomicBool,
    received: &AtomicU64,
    poll: Duration,
) -> S
where
    S: ReceiveSource,
    F: FnMut(Result<ArincWord>),
{
    loop {
        match source.poll() {
            Ok(RxPoll::Event(RxEvent::Word(wire))) => {
                let word = WordCodec::from_wire(wire);
                received.fetch_add(1, Ordering::Relaxed);
                debug!(word = %word, wire = format_args!("0x{:08X}", wire), "word received");
                callback(Ok(word));
            }
            Ok(RxPoll::Event(RxEvent::Timeout { bits })) => {
                warn!(bits, "receive timeout, partial word dropped");
                callback(Err(LinkError::ReceiveTimeout { bits }));
            }
            // Mid-word: never sleep, never stop
            Ok(RxPoll::Busy) => thread::yield_now(),
            Ok(RxPoll::Idle) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                idle_wait(poll);
            }
            Err(err) => {
                warn!(source = source.name(), error = %err, "receive poll failed");
                if stop.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(poll.max(Duration::from_millis(1)));
            }
        }
    }

    info!(received = received.load(Ordering::Relaxed), "receive worker stopped");
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::time::Instant;
    use tracing_test::traced_test;

    /// Records every wire word instead of driving lines
    #[derive(Debug, Default)]
    struct Recorder {
        wires: Vec<u32>,
        fail_on: Option<u32>,
        flushed: bool,
    }

    impl Transmit for Recorder {
        fn transmit(&mut self, wire: u32) -> Result<()> {
            if self.fail_on == Some(wire) {
                return Err(LinkError::pin("line stuck"));
            }
            self.wires.push(wire);
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.flushed = true;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    /// Blocks on the first word until released
    struct Held {
        gate: Option<mpsc::Receiver<()>>,
        inner: Recorder,
    }

    impl Transmit for Held {
        fn transmit(&mut self, wire: u32) -> Result<()> {
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv();
            }
            self.inner.transmit(wire)
        }

        fn name(&self) -> &'static str {
            "held"
        }
    }

    /// Replays a fixed script of poll results
    struct Script(VecDeque<RxPoll>);

    impl ReceiveSource for Script {
        fn poll(&mut self) -> Result<RxPoll> {
            Ok(self.0.pop_front().unwrap_or(RxPoll::Idle))
        }

        fn name(&self) -> &'static str {
            "script"
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn test_tx_driver_sends_reversed_words_in_order() -> Result<()> {
        let driver = TxDriver::spawn(Recorder::default(), LinkConfig::default())?;
        assert!(driver.is_running());
        for word in [0xAu32, 0xB, 0xC] {
            driver.send(word)?;
        }
        assert!(driver.wait_idle(Duration::from_secs(5)));
        assert_eq!(driver.sent(), 3);

        let (backend, discarded) = driver.shutdown()?;
        assert_eq!(discarded, 0);
        assert!(backend.flushed);
        assert_eq!(
            backend.wires,
            vec![WordCodec::reverse(0xA), WordCodec::reverse(0xB), WordCodec::reverse(0xC)]
        );
        Ok(())
    }

    #[test]
    fn test_tx_driver_rejects_bad_length() -> Result<()> {
        let driver = TxDriver::spawn(Recorder::default(), LinkConfig::default())?;
        assert!(matches!(driver.send(&[1u8, 2, 3][..]), Err(LinkError::Length(_))));
        assert!(matches!(driver.send(0x1_0000_0000u64), Err(LinkError::Length(_))));
        driver.send(vec![0u8, 0, 0, 1])?;
        assert!(driver.wait_idle(Duration::from_secs(5)));

        let (backend, _) = driver.shutdown()?;
        assert_eq!(backend.wires, vec![WordCodec::reverse(1)]);
        Ok(())
    }

    #[test]
    fn test_tx_driver_survives_backend_error() -> Result<()> {
        let backend = Recorder {
            fail_on: Some(WordCodec::reverse(2)),
            ..Recorder::default()
        };
        let driver = TxDriver::spawn(backend, LinkConfig::default())?;
        for word in [1u32, 2, 3] {
            driver.send(word)?;
        }
        assert!(driver.wait_idle(Duration::from_secs(5)));
        assert_eq!(driver.sent(), 2);

        let (backend, _) = driver.shutdown()?;
        assert_eq!(backend.wires, vec![WordCodec::reverse(1), WordCodec::reverse(3)]);
        Ok(())
    }

    #[test]
    fn test_tx_driver_stop_is_idempotent() -> Result<()> {
        let driver = TxDriver::spawn(Recorder::default(), LinkConfig::default())?;
        driver.stop();
        driver.stop();
        assert!(!driver.is_running());
        assert_eq!(driver.send(1u32), Err(LinkError::Stopped));
        let (backend, discarded) = driver.shutdown()?;
        assert!(backend.wires.is_empty());
        assert_eq!(discarded, 0);
        Ok(())
    }

    #[test]
    fn test_spawn_rejects_invalid_config() {
        let config = LinkConfig {
            queue_capacity: 0,
            ..LinkConfig::default()
        };
        assert!(matches!(
            TxDriver::spawn(Recorder::default(), config),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_rx_driver_delivers_events_in_order() -> Result<()> {
        let script = Script(VecDeque::from(vec![
            RxPoll::Busy,
            RxPoll::Event(RxEvent::Word(WordCodec::reverse(0x11))),
            RxPoll::Idle,
            RxPoll::Busy,
            RxPoll::Event(RxEvent::Timeout { bits: 5 }),
            RxPoll::Event(RxEvent::Word(WordCodec::reverse(0x22))),
        ]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let driver = RxDriver::spawn(script, LinkConfig::default(), move |event| {
            sink.lock().push(event);
        })?;
        assert!(wait_for(|| seen.lock().len() == 3));
        assert_eq!(driver.received(), 2);

        let source = driver.shutdown()?;
        assert!(source.0.is_empty());
        assert_eq!(
            *seen.lock(),
            vec![
                Ok(ArincWord::new(0x11)),
                Err(LinkError::ReceiveTimeout { bits: 5 }),
                Ok(ArincWord::new(0x22)),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_rx_driver_does_not_stop_mid_word() -> Result<()> {
        // Busy for a while, then the word completes
        let mut polls: VecDeque<RxPoll> = std::iter::repeat(RxPoll::Busy).take(10_000).collect();
        polls.push_back(RxPoll::Event(RxEvent::Word(0)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let driver = RxDriver::spawn(Script(polls), LinkConfig::default(), move |event| {
            sink.lock().push(event);
        })?;
        driver.stop();
        let source = driver.shutdown()?;

        assert!(source.0.is_empty());
        assert_eq!(*seen.lock(), vec![Ok(ArincWord::new(0))]);
        Ok(())
    }

    #[test]
    #[traced_test]
    fn test_queue_pressure_is_logged() {
        let (release, gate) = mpsc::channel();
        let backend = Held {
            gate: Some(gate),
            inner: Recorder::default(),
        };
        let config = LinkConfig {
            queue_capacity: 1,
            order: QueueOrder::Lifo,
            ..LinkConfig::default()
        };
        let driver = TxDriver::spawn(backend, config).unwrap();

        driver.send(1u32).unwrap();
        assert!(wait_for(|| driver.pending() == 0));
        driver.send(2u32).unwrap();
        assert_eq!(driver.send(3u32), Err(LinkError::QueueFull { capacity: 1 }));

        driver.stop();
        release.send(()).unwrap();
        let (backend, discarded) = driver.shutdown().unwrap();
        assert_eq!(discarded, 1);
        assert_eq!(backend.inner.wires, vec![WordCodec::reverse(1)]);

        assert!(logs_contain("newest-first"));
        assert!(logs_contain("starting transmit worker"));
        assert!(logs_contain("transmit queue full"));
        assert!(logs_contain("transmit driver stopping"));
        assert!(logs_contain("queued words discarded at shutdown"));
    }
}
