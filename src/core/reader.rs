//! Worker pool draining the conversation queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use super::envelope::{ConversationKey, Envelope, LeaseId};
use super::queue::{Claimed, QueueStore};
use crate::config::QueueSettings;

/// Per-message context handed to handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    pub key: ConversationKey,
    pub trace_id: String,
    pub lease_id: LeaseId,
}

impl MessageContext {
    /// Span carrying the message identifiers; handlers run inside it.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "message",
            key = %self.key,
            trace_id = %self.trace_id,
            lease_id = %self.lease_id
        )
    }
}

/// Processes one envelope. Errors and panics are logged by the pool and the envelope is
/// finished either way; it is never retried.
#[async_trait]
pub trait MessageHandler<P: Send + 'static>: Send + Sync {
    async fn handle(&self, ctx: MessageContext, envelope: Envelope<P>) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<P, F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(MessageContext, Envelope<P>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    HandlerFn(f)
}

#[async_trait]
impl<P, F, Fut> MessageHandler<P> for HandlerFn<F>
where
    P: Send + 'static,
    F: Fn(MessageContext, Envelope<P>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: MessageContext, envelope: Envelope<P>) -> anyhow::Result<()> {
        (self.0)(ctx, envelope).await
    }
}

/// Fixed-size pool of workers, each looping claim → handle → finish.
///
/// [`stop`](WorkerPool::stop) drains the pool. Dropping it only signals the workers.
pub struct WorkerPool<P: Send + 'static> {
    queue: Arc<QueueStore<P>>,
    handler: Arc<dyn MessageHandler<P>>,
    workers_num: usize,
    fetch_delay: Duration,
    shutdown: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl<P> WorkerPool<P>
where
    P: DeserializeOwned + Send + 'static,
{
    pub fn new(
        queue: Arc<QueueStore<P>>,
        settings: &QueueSettings,
        handler: Arc<dyn MessageHandler<P>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            handler,
            workers_num: settings.workers_num.max(1),
            fetch_delay: settings.fetch_interval(),
            shutdown,
            workers: JoinSet::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Spawn the workers. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.is_running() {
            tracing::warn!("Worker pool already running");
            return;
        }
        self.shutdown.send_replace(false);

        tracing::info!(workers_num = self.workers_num, "Listening for incoming messages");
        for id in 0..self.workers_num {
            let worker = Worker {
                id,
                queue: self.queue.clone(),
                handler: self.handler.clone(),
                fetch_delay: self.fetch_delay,
                shutdown: self.shutdown.subscribe(),
            };
            self.workers.spawn(worker.run());
        }
    }

    /// Stop claiming and wait until every in-flight message has been handled.
    pub async fn stop(&mut self) {
        tracing::info!("Closing incoming queue for reading");
        self.shutdown.send_replace(true);

        tracing::info!("Waiting until all workers process the remaining messages");
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                tracing::error!("Worker task failed: {}", e);
            }
        }
        tracing::info!("All workers have been stopped");
    }
}

/// Dropping a running pool signals shutdown and detaches the workers instead of aborting
/// them, so in-flight messages are still finished. Call [`WorkerPool::stop`] to wait for that.
impl<P: Send + 'static> Drop for WorkerPool<P> {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shutdown.send_replace(true);
        self.workers.detach_all();
        tracing::debug!("Worker pool dropped while running, workers detached");
    }
}

struct Worker<P: Send + 'static> {
    id: usize,
    queue: Arc<QueueStore<P>>,
    handler: Arc<dyn MessageHandler<P>>,
    fetch_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<P> Worker<P>
where
    P: DeserializeOwned + Send + 'static,
{
    async fn run(mut self) {
        tracing::debug!(worker = self.id, "Worker started");
        while !*self.shutdown.borrow() {
            match self.queue.claim().await {
                Ok(Some(claimed)) => self.process(claimed).await,
                Ok(None) => {
                    if self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = self.id, "Failed to fetch message: {}", e);
                    if self.idle().await {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker = self.id, "Worker stopped");
    }

    /// Wait `fetch_delay` before the next claim. Returns true once shutdown was requested.
    async fn idle(&mut self) -> bool {
        if self.fetch_delay.is_zero() {
            tokio::task::yield_now().await;
            return *self.shutdown.borrow();
        }
        tokio::select! {
            _ = tokio::time::sleep(self.fetch_delay) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }

    async fn process(&self, claimed: Claimed<P>) {
        let Claimed {
            key,
            envelope,
            lease_id,
        } = claimed;
        let ctx = MessageContext {
            key,
            trace_id: envelope.trace_id.clone(),
            lease_id: lease_id.clone(),
        };
        let span = ctx.span();
        tracing::info!(parent: &span, worker = self.id, "Message received from incoming queue");

        // Own task so a panicking handler cannot take the worker down with it.
        let handler = self.handler.clone();
        let outcome = tokio::spawn(
            async move { handler.handle(ctx, envelope).await }.instrument(span.clone()),
        )
        .await;

        match outcome {
            Ok(Ok(())) => tracing::info!(parent: &span, "Finished processing incoming message"),
            Ok(Err(e)) => tracing::error!(parent: &span, "Message handler failed: {:#}", e),
            Err(e) if e.is_panic() => tracing::error!(parent: &span, "Message handler panicked"),
            Err(e) => tracing::error!(parent: &span, "Message handler task failed: {}", e),
        }

        if let Err(e) = self.queue.finish(&lease_id).await {
            tracing::error!(parent: &span, "Failed to finish processing: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::{QueueDocument, StoredEnvelope};
    use crate::core::producer::Producer;
    use crate::error::{Error, Result};
    use crate::store::{Filter, MemoryStore, SqliteStore, Store, Update};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    type Seen = Arc<Mutex<Vec<(String, u32)>>>;

    fn settings(workers_num: usize, fetch_delay: u64) -> QueueSettings {
        QueueSettings {
            max_processing_time: 20_000,
            workers_num,
            fetch_delay,
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(tokio::time::Instant::now() < deadline, "timed out");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn recording_handler(seen: Seen) -> Arc<dyn MessageHandler<u32>> {
        Arc::new(handler_fn(move |ctx: MessageContext, envelope: Envelope<u32>| {
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                seen.lock()
                    .unwrap()
                    .push((ctx.key.to_string(), envelope.payload));
                Ok(())
            }
        }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_handles_everything_in_per_key_order() {
        let backends: Vec<Arc<dyn Store>> = vec![
            Arc::new(MemoryStore::new()),
            Arc::new(SqliteStore::open_in_memory("incoming").unwrap()),
        ];

        for store in backends {
            let producer: Producer<u32> = Producer::new(store.clone());
            for n in 0..20u32 {
                producer.put(i64::from(n % 4), n, format!("req-{}", n)).await.unwrap();
            }

            let seen: Seen = Arc::new(Mutex::new(Vec::new()));
            let queue = Arc::new(QueueStore::new(store.clone(), &settings(4, 0)));
            let mut pool = WorkerPool::new(queue, &settings(4, 0), recording_handler(seen.clone()));
            pool.start();

            wait_until(|| seen.lock().unwrap().len() == 20).await;
            pool.stop().await;

            let seen = seen.lock().unwrap().clone();
            let mut by_key: HashMap<String, Vec<u32>> = HashMap::new();
            for (key, n) in seen {
                by_key.entry(key).or_default().push(n);
            }
            assert_eq!(by_key.len(), 4);
            for (key, values) in by_key {
                let k: u32 = key.parse().unwrap();
                let expected: Vec<u32> = (0..20).filter(|n| n % 4 == k).collect();
                assert_eq!(values, expected);
            }
            assert!(store.list().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_block_the_conversation() {
        crate::logging::init_test();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let producer: Producer<u32> = Producer::new(store.clone());
        for n in 0..3u32 {
            producer.put(1_i64, n, "req").await.unwrap();
        }

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handler: Arc<dyn MessageHandler<u32>> = Arc::new(handler_fn(
            move |_ctx: MessageContext, envelope: Envelope<u32>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    match envelope.payload {
                        0 => panic!("handler blew up"),
                        1 => anyhow::bail!("handler failed"),
                        _ => Ok(()),
                    }
                }
            },
        ));

        let queue = Arc::new(QueueStore::new(store.clone(), &settings(1, 1)));
        let mut pool = WorkerPool::new(queue, &settings(1, 1), handler);
        pool.start();

        wait_until(|| handled.load(Ordering::SeqCst) == 3).await;
        pool.stop().await;

        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_in_flight_handler() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let producer: Producer<u32> = Producer::new(store.clone());
        producer.put(5_i64, 1, "req").await.unwrap();
        producer.put(5_i64, 2, "req").await.unwrap();

        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let (started_tx, finished_flag) = (started.clone(), finished.clone());
        let handler: Arc<dyn MessageHandler<u32>> = Arc::new(handler_fn(
            move |_ctx: MessageContext, _envelope: Envelope<u32>| {
                let started = started_tx.clone();
                let finished = finished_flag.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        let queue = Arc::new(QueueStore::new(store.clone(), &settings(2, 10)));
        let mut pool = WorkerPool::new(queue, &settings(2, 10), handler);
        pool.start();
        assert!(pool.is_running());

        started.notified().await;
        pool.stop().await;

        assert!(finished.load(Ordering::SeqCst));
        assert!(!pool.is_running());

        // Only the first message was taken; its lease is released and the second waits.
        let doc = store.get(&ConversationKey::from(5_i64)).await.unwrap().unwrap();
        assert_eq!(doc.pending.len(), 1);
        assert!(doc.lease.is_none());
    }

    #[tokio::test]
    async fn test_idle_pool_stops_promptly() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueStore::<u32>::new(store, &settings(3, 60_000)));
        let mut pool = WorkerPool::new(
            queue,
            &settings(3, 60_000),
            recording_handler(Arc::new(Mutex::new(Vec::new()))),
        );
        pool.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), pool.stop())
            .await
            .expect("stop should interrupt the idle wait");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_pool_still_finishes_in_flight_message() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let producer: Producer<u32> = Producer::new(store.clone());
        producer.put(8_i64, 1, "req").await.unwrap();

        let started = Arc::new(Notify::new());
        let started_tx = started.clone();
        let handler: Arc<dyn MessageHandler<u32>> = Arc::new(handler_fn(
            move |_ctx: MessageContext, _envelope: Envelope<u32>| {
                let started = started_tx.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
            },
        ));

        let queue = Arc::new(QueueStore::new(store.clone(), &settings(1, 10)));
        let mut pool = WorkerPool::new(queue, &settings(1, 10), handler);
        pool.start();
        started.notified().await;
        drop(pool);

        let key = ConversationKey::from(8_i64);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while store.get(&key).await.unwrap().is_some() {
            assert!(tokio::time::Instant::now() < deadline, "lease was never finished");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Memory store whose deletes always fail.
    #[derive(Default)]
    struct BrokenDeletes {
        inner: MemoryStore,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl Store for BrokenDeletes {
        async fn push(&self, key: &ConversationKey, envelope: StoredEnvelope) -> Result<()> {
            self.inner.push(key, envelope).await
        }

        async fn find_one_and_update(
            &self,
            filter: &Filter,
            update: &Update,
        ) -> Result<Option<QueueDocument>> {
            self.inner.find_one_and_update(filter, update).await
        }

        async fn update_one(&self, filter: &Filter, update: &Update) -> Result<bool> {
            self.inner.update_one(filter, update).await
        }

        async fn delete_one(&self, _filter: &Filter) -> Result<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Err(Error::Store("delete unavailable".to_string()))
        }

        async fn get(&self, key: &ConversationKey) -> Result<Option<QueueDocument>> {
            self.inner.get(key).await
        }

        async fn list(&self) -> Result<Vec<QueueDocument>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_finish_errors_do_not_stop_the_worker() {
        let broken = Arc::new(BrokenDeletes::default());
        let store: Arc<dyn Store> = broken.clone();
        let producer: Producer<u32> = Producer::new(store.clone());
        for key in 0..3_i64 {
            producer.put(key, 0, "req").await.unwrap();
        }

        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(QueueStore::new(store.clone(), &settings(1, 1)));
        let mut pool = WorkerPool::new(queue, &settings(1, 1), recording_handler(seen.clone()));
        pool.start();

        wait_until(|| seen.lock().unwrap().len() == 3).await;
        pool.stop().await;

        assert_eq!(broken.deletes.load(Ordering::SeqCst), 3);
        // Finish failed before releasing anything, so every conversation keeps its lease.
        let docs = store.list().await.unwrap();
        assert_eq!(docs.len(), 3);
        assert!(docs.iter().all(|doc| doc.pending.is_empty() && doc.lease.is_some()));
    }
}
