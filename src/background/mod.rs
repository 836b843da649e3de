//! Background Runner (spec §4.6 K, §5 "parallel worker pool").
//!
//! Grounded: `examples/adolfousier-opencrabs/src/a2a/server.rs`'s
//! `stream::unfold` over an mpsc receiver for the shape of a task-driven
//! fan-out; here the consumer side drives the Thread Runner instead of
//! relaying JSON-RPC events.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::processor::{ChunkSink, StreamChunk};
use crate::runner::ThreadRunner;

/// One unit of work handed from the Execution Service to the worker pool.
#[derive(Debug, Clone)]
pub struct EnqueuedRun {
    pub agent_run_id: Uuid,
    pub thread_id: Uuid,
    pub model_name: String,
}

pub type RunQueue = mpsc::UnboundedSender<EnqueuedRun>;

/// Publishes every chunk a run produces as a structured log event. Actual
/// delivery to a live client (SSE, websocket) is the frontend's concern and
/// out of scope for this core (spec §1); this is the publish boundary K
/// owns, with logging standing in for that external transport.
struct TracingChunkSink;

impl ChunkSink for TracingChunkSink {
    fn publish(&self, agent_run_id: Uuid, chunk: StreamChunk) {
        tracing::info!(
            agent_run_id = %agent_run_id,
            chunk_type = ?chunk.kind,
            content = %chunk.content,
            metadata = %chunk.metadata,
            "stream chunk published"
        );
    }
}

/// Fixed-size pool of tokio tasks all pulling from the same receiver.
/// Ordering across runs is not guaranteed; ordering within one run is owned
/// entirely by the Thread Runner.
pub struct BackgroundRunner {
    runner: Arc<ThreadRunner>,
}

impl BackgroundRunner {
    pub fn new(runner: Arc<ThreadRunner>) -> Self {
        Self { runner }
    }

    /// Drains `rx` until the channel closes, running at most `worker_count`
    /// thread runs concurrently. A single consumer loop acquiring a permit
    /// per job stands in for a fixed worker pool without needing multiple
    /// receivers on one mpsc channel.
    pub fn spawn_workers(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<EnqueuedRun>, worker_count: usize) {
        let semaphore = Arc::new(Semaphore::new(worker_count.max(1)));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let runner = self.runner.clone();
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                tokio::spawn(async move {
                    let _permit = permit;
                    let sink: Arc<dyn ChunkSink> = Arc::new(TracingChunkSink);
                    tracing::info!(agent_run_id = %job.agent_run_id, thread_id = %job.thread_id, "running enqueued thread");
                    if let Err(e) = runner.run_thread(job.thread_id, job.agent_run_id, job.model_name, sink).await {
                        tracing::error!(agent_run_id = %job.agent_run_id, error = %e, "thread run failed");
                    }
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingSink {
        chunks: Mutex<Vec<(Uuid, StreamChunk)>>,
    }

    impl ChunkSink for CollectingSink {
        fn publish(&self, agent_run_id: Uuid, chunk: StreamChunk) {
            self.chunks.lock().unwrap().push((agent_run_id, chunk));
        }
    }

    #[test]
    fn collecting_sink_records_published_chunks() {
        let sink = CollectingSink { chunks: Mutex::new(Vec::new()) };
        let run_id = Uuid::new_v4();
        sink.publish(run_id, StreamChunk::status("stopped", "Insufficient credits: insufficient"));
        let recorded = sink.chunks.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, run_id);
    }
}
