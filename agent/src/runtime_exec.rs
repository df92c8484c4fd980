//! C7: the runtime executor. Watches `/config/run/<self>` for batches of
//! shell commands and runs each batch serially in a background task,
//! deduplicating replays by epoch counter.

use crate::context::AgentContext;
use anyhow::Result;
use futures::StreamExt;
use netsat_model::{Keys, RunBatch};
use netsat_store::{EventKind, Store, WatchItem};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Bounded so a runaway publisher can't grow unbounded memory; overrun
/// drops the oldest queued batch and logs loudly rather than blocking the
/// watch loop (§5 "Backpressure").
const QUEUE_CAPACITY: usize = 32;

pub struct RuntimeExecutor<S: Store> {
    ctx: Arc<AgentContext<S>>,
    queue: Mutex<VecDeque<RunBatch>>,
    notify: Notify,
    last_applied_epoch: Mutex<Option<u64>>,
}

impl<S: Store> RuntimeExecutor<S> {
    pub fn new(ctx: Arc<AgentContext<S>>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            last_applied_epoch: Mutex::new(None),
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let executor = self.clone().spawn_worker();

        let key = Keys::run(&self.ctx.self_name);

        if let Ok(Some(value)) = self.ctx.store.get(&key).await {
            self.enqueue_from_bytes(&value);
        }

        let mut stream = self.ctx.store.watch(key);

        while let Some(item) = stream.next().await {
            match item {
                WatchItem::Event(ev) if ev.kind == EventKind::Put => {
                    if let Some(value) = ev.value {
                        self.enqueue_from_bytes(&value);
                    }
                }
                WatchItem::Event(_) => {}
                WatchItem::Resync => {
                    if let Ok(Some(value)) = self.ctx.store.get(&Keys::run(&self.ctx.self_name)).await {
                        self.enqueue_from_bytes(&value);
                    }
                }
            }
        }

        executor.abort();
        Ok(())
    }

    fn enqueue_from_bytes(&self, value: &[u8]) {
        let batch: RunBatch = match serde_json::from_slice(value) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "corrupt run batch, ignoring");
                return;
            }
        };

        self.enqueue(batch);
    }

    fn enqueue(&self, batch: RunBatch) {
        let mut queue = self.queue.lock();

        if queue.len() >= QUEUE_CAPACITY {
            tracing::error!(epoch = batch.epoch_counter, "run queue overrun, dropping oldest batch");
            queue.pop_front();
        }

        queue.push_back(batch);
        drop(queue);
        self.notify.notify_one();
    }

    fn spawn_worker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let next = self.queue.lock().pop_front();

                let Some(batch) = next else {
                    self.notify.notified().await;
                    continue;
                };

                self.apply(batch).await;
            }
        })
    }

    async fn apply(&self, batch: RunBatch) {
        {
            let mut last = self.last_applied_epoch.lock();
            if *last == Some(batch.epoch_counter) {
                tracing::debug!(epoch = batch.epoch_counter, "run batch already applied, skipping");
                return;
            }
            *last = Some(batch.epoch_counter);
        }

        if batch.commands.is_empty() {
            return;
        }

        let joined = batch.commands.join(" && ");

        match self.ctx.command.run("sh", &["-c", &joined]).await {
            Ok(out) if !out.success() => {
                tracing::warn!(epoch = batch.epoch_counter, status = out.status, stderr = %out.stderr, "run batch failed");
            }
            Err(e) => {
                tracing::warn!(epoch = batch.epoch_counter, error = %e, "run batch failed to execute");
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsat_command::RecordingCommandRunner;
    use netsat_model::{L3Config, Node};
    use netsat_store::MemoryStore;
    use std::time::Duration;

    fn ctx() -> (Arc<AgentContext<MemoryStore>>, Arc<RecordingCommandRunner>) {
        let store = MemoryStore::new();
        let command = RecordingCommandRunner::new();
        let node = Node::new("sat1", "satellite", "w1", 1);
        (
            Arc::new(AgentContext::new(store, command.clone(), "sat1".into(), node, L3Config::default())),
            command,
        )
    }

    #[tokio::test]
    async fn runs_commands_joined_with_and() {
        let (ctx, command) = ctx();
        let executor = RuntimeExecutor::new(ctx.clone());

        executor.enqueue(RunBatch {
            epoch_counter: 1,
            commands: vec!["ip link set br1 up".into(), "ip link set br2 up".into()],
        });

        let worker = executor.clone().spawn_worker();
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.abort();

        assert!(command.was_run("sh", &["-c", "ip link set br1 up && ip link set br2 up"]));
    }

    #[tokio::test]
    async fn does_not_reapply_the_same_epoch_twice() {
        let (ctx, command) = ctx();
        let executor = RuntimeExecutor::new(ctx.clone());

        executor.enqueue(RunBatch { epoch_counter: 5, commands: vec!["echo hi".into()] });
        let worker = executor.clone().spawn_worker();
        tokio::time::sleep(Duration::from_millis(20)).await;

        executor.enqueue(RunBatch { epoch_counter: 5, commands: vec!["echo hi".into()] });
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.abort();

        assert_eq!(command.invocations().len(), 1);
    }

    #[tokio::test]
    async fn overrun_drops_the_oldest_batch() {
        let (ctx, _command) = ctx();
        let executor = RuntimeExecutor::new(ctx.clone());

        for i in 0..QUEUE_CAPACITY + 5 {
            executor.enqueue(RunBatch { epoch_counter: i as u64, commands: vec!["true".into()] });
        }

        assert_eq!(executor.queue.lock().len(), QUEUE_CAPACITY);
    }
}
