//! Bounded worker pool for stage jobs
//!
//! Jobs flow through a channel sized by the worker count; results flow
//! back through another and are collected while workers run. Every job
//! sent to the pool produces exactly one result, including jobs that
//! panic or are cancelled.

use crate::error::{StagehouseError, StagehouseResult};
use crate::stage::StageId;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Work performed for one stage
pub(crate) type StageJob<T> =
    Arc<dyn Fn(StageId) -> BoxFuture<'static, StagehouseResult<T>> + Send + Sync>;

/// Box an async closure into a [`StageJob`]
pub(crate) fn stage_job<T, F, Fut>(f: F) -> StageJob<T>
where
    T: Send + 'static,
    F: Fn(StageId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StagehouseResult<T>> + Send + 'static,
{
    Arc::new(move |stage| f(stage).boxed())
}

/// Outcome of one stage job
#[derive(Debug)]
pub struct JobResult<T> {
    pub stage: StageId,
    pub outcome: StagehouseResult<T>,
}

/// Run `job` for every stage on at most `workers` concurrent tasks
///
/// `on_result` sees each result as soon as it arrives. Results are
/// returned in completion order.
pub(crate) async fn run<T, F>(
    stages: Vec<StageId>,
    workers: usize,
    cancel: &CancellationToken,
    job: StageJob<T>,
    mut on_result: F,
) -> Vec<JobResult<T>>
where
    T: Send + 'static,
    F: FnMut(&JobResult<T>),
{
    if stages.is_empty() {
        return Vec::new();
    }

    let workers = workers.clamp(1, stages.len());
    let (job_tx, job_rx) = mpsc::channel::<StageId>(workers);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<JobResult<T>>(workers);

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let job = Arc::clone(&job);
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let next = job_rx.lock().await.recv().await;
                let Some(stage) = next else {
                    break;
                };
                let result = run_job(stage, &job, &cancel).await;
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
            debug!(worker, "Sync worker finished");
        }));
    }
    drop(result_tx);

    let total = stages.len();
    let producer = async move {
        for stage in stages {
            if job_tx.send(stage).await.is_err() {
                break;
            }
        }
    };
    let collector = async {
        let mut results = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            on_result(&result);
            results.push(result);
        }
        results
    };

    let ((), results) = tokio::join!(producer, collector);

    for joined in join_all(handles).await {
        if let Err(e) = joined {
            warn!("Sync worker failed: {}", e);
        }
    }

    results
}

async fn run_job<T: Send + 'static>(
    stage: StageId,
    job: &StageJob<T>,
    cancel: &CancellationToken,
) -> JobResult<T> {
    if cancel.is_cancelled() {
        return JobResult {
            stage,
            outcome: Err(StagehouseError::Cancelled),
        };
    }

    let work = job(stage.clone());
    let cancel = cancel.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StagehouseError::Cancelled),
            outcome = work => outcome,
        }
    });

    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => Err(StagehouseError::Internal(format!(
            "sync job for stage {} failed: {}",
            stage, e
        ))),
    };

    JobResult { stage, outcome }
}
