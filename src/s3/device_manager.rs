//! The S3 device manager: a fixed pool of upload workers fed by the
//! partition writers. The first failed upload stops the node; temp folders
//! registered by the writers are removed once every worker has exited.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::core::results::{ComputePipesResult, ResultSender};
use crate::error::{PipeError, PipeResult};
use crate::s3::store::{self, StoreHandle};

/// One upload: a finished local part file and its destination key.
#[derive(Debug, Clone)]
pub struct S3UploadTask {
    pub external_bucket: Option<String>,
    pub file_key: String,
    pub local_file_path: PathBuf,
}

pub struct S3DeviceManager {
    task_tx: flume::Sender<S3UploadTask>,
    temp_folders: Mutex<Vec<PathBuf>>,
    pool: tokio::task::JoinHandle<()>,
}

impl S3DeviceManager {
    /// Spawn the worker pool. `s3_result_tx` receives exactly one aggregated
    /// result once the pool drains; on the first upload error the node's
    /// cancellation token fires.
    pub fn start(
        store: StoreHandle,
        region: String,
        pool_size: usize,
        s3_result_tx: ResultSender,
        cancel: CancellationToken,
    ) -> PipeResult<Arc<Self>> {
        if pool_size < 1 {
            return Err(PipeError::config(
                "s3 device manager cannot have s3_worker_pool_size < 1",
            ));
        }
        let (task_tx, task_rx) = flume::bounded::<S3UploadTask>(10);
        let (worker_result_tx, worker_result_rx) =
            flume::unbounded::<ComputePipesResult>();

        tracing::debug!("starting {} s3 upload workers", pool_size);
        let mut workers = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let task_rx = task_rx.clone();
            let store = store.clone();
            let region = region.clone();
            let results = worker_result_tx.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                upload_worker(id, store, region, task_rx, results, cancel).await;
            }));
        }
        drop(worker_result_tx);

        // collector: aggregate worker results, publish once, cancel on error
        let collector_cancel = cancel.clone();
        let collector = tokio::spawn(async move {
            let mut parts_count = 0i64;
            let mut first_err: Option<String> = None;
            while let Ok(result) = worker_result_rx.recv_async().await {
                parts_count += result.parts_count;
                if result.err.is_some() && first_err.is_none() {
                    first_err = result.err;
                    break;
                }
            }
            let failed = first_err.is_some();
            let _ = s3_result_tx.send_async(ComputePipesResult {
                label: "s3_put_object".to_string(),
                parts_count,
                err: first_err,
            })
            .await;
            if failed {
                collector_cancel.cancel();
            }
        });

        let pool = tokio::spawn(async move {
            for w in workers {
                let _ = w.await;
            }
            let _ = collector.await;
        });

        Ok(Arc::new(Self {
            task_tx,
            temp_folders: Mutex::new(Vec::new()),
            pool,
        }))
    }

    /// A producer-side handle; the task channel closes when the manager and
    /// every producer clone are dropped.
    pub fn task_sender(&self) -> flume::Sender<S3UploadTask> {
        self.task_tx.clone()
    }

    /// Register a temp folder for removal after the pool exits.
    pub fn register_temp_folder(&self, path: PathBuf) {
        self.temp_folders
            .lock()
            .expect("temp folder lock")
            .push(path);
    }

    /// Close the task channel, wait for the workers to drain, then remove
    /// every registered temp folder. Producers must have dropped their
    /// senders by now (the executors' `finally` guarantees it).
    pub async fn finish(self: Arc<Self>, session_id: &str) {
        let manager = match Arc::try_unwrap(self) {
            Ok(m) => m,
            Err(_) => {
                tracing::warn!("s3 device manager still has live handles at finish");
                return;
            }
        };
        drop(manager.task_tx);
        let _ = manager.pool.await;
        for folder in manager.temp_folders.lock().expect("temp folder lock").drain(..) {
            if let Err(e) = std::fs::remove_dir_all(&folder) {
                tracing::warn!(
                    "{} - while removing temp folder {}: {}",
                    session_id,
                    folder.display(),
                    e
                );
            }
        }
    }
}

async fn upload_worker(
    id: usize,
    store: StoreHandle,
    region: String,
    task_rx: flume::Receiver<S3UploadTask>,
    results: flume::Sender<ComputePipesResult>,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = task_rx.recv_async() => match task {
                Ok(t) => t,
                Err(_) => break, // all producers done
            },
        };
        let result = match upload_one(&store, &region, &task).await {
            Ok(()) => ComputePipesResult::ok(task.file_key.clone(), 1),
            Err(e) => {
                tracing::error!("s3 worker {}: upload of {} failed: {}", id, task.file_key, e);
                ComputePipesResult::error(task.file_key.clone(), &e)
            }
        };
        if results.send_async(result).await.is_err() {
            break;
        }
    }
}

async fn upload_one(store: &StoreHandle, region: &str, task: &S3UploadTask) -> PipeResult<()> {
    match &task.external_bucket {
        Some(bucket) => {
            let external = store::for_bucket(bucket, region)?;
            store::put_local_file(&external, &task.file_key, &task.local_file_path).await
        }
        None => store::put_local_file(store, &task.file_key, &task.local_file_path).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;

    fn local_store(root: &std::path::Path) -> StoreHandle {
        Arc::new(LocalFileSystem::new_with_prefix(root).unwrap())
    }

    #[tokio::test]
    async fn uploads_parts_and_aggregates_counts() {
        let bucket = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let (s3_tx, s3_rx) = flume::bounded(1);
        let cancel = CancellationToken::new();
        let mgr = S3DeviceManager::start(
            local_store(bucket.path()),
            "us-east-1".to_string(),
            2,
            s3_tx,
            cancel.clone(),
        )
        .unwrap();

        let sender = mgr.task_sender();
        for i in 0..3 {
            let path = scratch.path().join(format!("part-{i}.csv"));
            std::fs::write(&path, format!("row-{i}\n")).unwrap();
            sender
                .send_async(S3UploadTask {
                    external_bucket: None,
                    file_key: format!("stage/s1/reducing01/p0/part-{i}.csv"),
                    local_file_path: path,
                })
                .await
                .unwrap();
        }
        drop(sender);
        mgr.finish("s1").await;

        let result = s3_rx.recv_async().await.unwrap();
        assert_eq!(result.parts_count, 3);
        assert!(result.err.is_none());
        assert!(!cancel.is_cancelled());
        assert!(
            bucket
                .path()
                .join("stage/s1/reducing01/p0/part-2.csv")
                .exists()
        );
    }

    #[tokio::test]
    async fn first_failed_upload_cancels_the_node() {
        let bucket = tempfile::tempdir().unwrap();
        let (s3_tx, s3_rx) = flume::bounded(1);
        let cancel = CancellationToken::new();
        let mgr = S3DeviceManager::start(
            local_store(bucket.path()),
            "us-east-1".to_string(),
            1,
            s3_tx,
            cancel.clone(),
        )
        .unwrap();

        let sender = mgr.task_sender();
        sender
            .send_async(S3UploadTask {
                external_bucket: None,
                file_key: "stage/s1/p0/part-0.csv".to_string(),
                local_file_path: PathBuf::from("/no/such/file"),
            })
            .await
            .unwrap();
        drop(sender);
        mgr.finish("s1").await;

        let result = s3_rx.recv_async().await.unwrap();
        assert!(result.err.is_some());
        assert!(cancel.is_cancelled());
    }
}
