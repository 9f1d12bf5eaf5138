use bytes::Bytes;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use which::which;

use crate::config::BackupRequest;
use crate::dump::{self, DumpInvocation};
use crate::errors::{AppError, Result};
use crate::progress::{ProgressSink, ProgressStatus};
use crate::store::{JobRecordStore, JobStatus};
use crate::upload::ArtifactUploader;

const READ_CHUNK: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { download_url: String },
    Failed { detail: String },
    Cancelled,
}

/// Orchestrates one backup execution: spawns the dump process, fans its
/// stdout out to the local spool file and the uploader concurrently, forwards
/// stderr lines to the progress sink, reacts to cancellation, and finalizes
/// the job record. Every failure inside an execution ends as exactly one
/// terminal record transition plus one terminal progress event; nothing
/// escapes to other executions.
pub struct BackupRunner {
    store: Arc<JobRecordStore>,
    uploader: Arc<dyn ArtifactUploader>,
    spool_dir: PathBuf,
}

impl BackupRunner {
    pub fn new(
        store: Arc<JobRecordStore>,
        uploader: Arc<dyn ArtifactUploader>,
        spool_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            uploader,
            spool_dir: spool_dir.into(),
        }
    }

    pub fn store(&self) -> &Arc<JobRecordStore> {
        &self.store
    }

    /// Runs one backup for the given request. An unsupported kind is rejected
    /// here, before any record, file, or process exists.
    pub async fn execute(
        &self,
        request: &BackupRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<JobOutcome> {
        let invocation = dump::resolve(request)?;
        let artifact_name = dump::artifact_name(&request.database);
        self.execute_invocation(&request.database, artifact_name, invocation, progress, cancel)
            .await
    }

    pub(crate) async fn execute_invocation(
        &self,
        subject: &str,
        artifact_name: String,
        invocation: DumpInvocation,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<JobOutcome> {
        tokio::fs::create_dir_all(&self.spool_dir).await?;
        let spool_path = self.spool_dir.join(&artifact_name);

        let record = self.store.create(subject, &artifact_name).await?;
        info!(job_id = %record.id, subject, artifact = %artifact_name, "starting backup job");
        progress.status(
            ProgressStatus::Processing,
            Some(format!("backing up {subject}")),
        );

        let program = match which(&invocation.program) {
            Ok(path) => path,
            Err(e) => {
                let error =
                    AppError::SpawnFailure(format!("dump tool {:?} not found: {e}", invocation.program));
                return self
                    .finalize_failed(record.id, &spool_path, error, &progress)
                    .await;
            }
        };

        let mut child = match Command::new(&program)
            .args(&invocation.args)
            .envs(invocation.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let error = AppError::SpawnFailure(format!("failed to spawn {}: {e}", program.display()));
                return self
                    .finalize_failed(record.id, &spool_path, error, &progress)
                    .await;
            }
        };
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        // Fan-out: one producer, two independent consumers over bounded
        // channels, so upload progress overlaps dump production.
        let (sink_tx, sink_rx) = mpsc::channel::<Bytes>(16);
        let (upload_tx, upload_rx) = mpsc::channel::<Bytes>(16);
        let upload_cancel = cancel.child_token();

        let uploader = self.uploader.clone();
        let upload_key = artifact_name.clone();
        let upload_token = upload_cancel.clone();
        let upload_handle =
            tokio::spawn(async move { uploader.upload(&upload_key, upload_rx, upload_token).await });
        let sink_handle = tokio::spawn(write_spool(spool_path.clone(), sink_rx));
        let stderr_handle = tokio::spawn(forward_stderr(stderr, progress.clone()));

        let wait_result = tokio::select! {
            status = drive_dump(&mut child, stdout, &sink_tx, &upload_tx) => Some(status),
            _ = cancel.cancelled() => None,
        };

        let Some(wait_result) = wait_result else {
            // Cancellation observer fired mid-stream. The upload token must
            // fire before the byte channels close, so the uploader observes
            // the abort rather than a normal end-of-stream.
            info!(job_id = %record.id, "cancellation requested, terminating dump process");
            upload_cancel.cancel();
            drop(sink_tx);
            drop(upload_tx);
            child.start_kill().ok();
            let _ = child.wait().await;
            let _ = upload_handle.await;
            let _ = sink_handle.await;
            // A grandchild that inherited the stderr pipe can outlive the
            // kill; the tail is not needed here, so the reader must not be
            // awaited.
            stderr_handle.abort();
            let _ = stderr_handle.await;
            cleanup_spool(&spool_path).await;

            let applied = self
                .store
                .cancel_if_processing(record.id, "cancelled by requester")
                .await?;
            if applied {
                progress.status(
                    ProgressStatus::Cancelled,
                    Some(format!("backup of {subject} cancelled")),
                );
            }
            progress.close();
            return Ok(JobOutcome::Cancelled);
        };

        let stderr_tail = stderr_handle.await.unwrap_or_default();

        let status = match wait_result {
            Ok(status) => status,
            Err(e) => {
                upload_cancel.cancel();
                drop(sink_tx);
                drop(upload_tx);
                let _ = upload_handle.await;
                let _ = sink_handle.await;
                let error = AppError::DumpProcess(format!("failed waiting for dump process: {e}"));
                return self
                    .finalize_failed(record.id, &spool_path, error, &progress)
                    .await;
            }
        };

        if !status.success() {
            // The upload must be aborted before the channel closes; a dump
            // that died mid-stream must never become a committed artifact.
            upload_cancel.cancel();
            drop(sink_tx);
            drop(upload_tx);
            let _ = upload_handle.await;
            let _ = sink_handle.await;
            let detail = if stderr_tail.is_empty() {
                format!("dump process exited with {status}")
            } else {
                format!(
                    "dump process exited with {status}: {}",
                    stderr_tail.join("\n")
                )
            };
            return self
                .finalize_failed(record.id, &spool_path, AppError::DumpProcess(detail), &progress)
                .await;
        }

        // Clean exit: release the senders so both consumers observe
        // end-of-stream.
        drop(sink_tx);
        drop(upload_tx);

        // Local sink must be fully flushed before the job can complete.
        match sink_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                upload_cancel.cancel();
                let _ = upload_handle.await;
                return self
                    .finalize_failed(record.id, &spool_path, AppError::Io(e), &progress)
                    .await;
            }
            Err(e) => {
                upload_cancel.cancel();
                let _ = upload_handle.await;
                let error = AppError::DumpProcess(format!("local sink task failed: {e}"));
                return self
                    .finalize_failed(record.id, &spool_path, error, &progress)
                    .await;
            }
        }

        progress.status(
            ProgressStatus::Uploading,
            Some("dump finished, waiting for upload".to_string()),
        );
        let download_url = match upload_handle.await {
            Ok(Ok(url)) => url,
            Ok(Err(e)) => {
                return self
                    .finalize_failed(record.id, &spool_path, e, &progress)
                    .await;
            }
            Err(e) => {
                let error = AppError::Upload(format!("upload task failed: {e}"));
                return self
                    .finalize_failed(record.id, &spool_path, error, &progress)
                    .await;
            }
        };

        self.store
            .transition(
                record.id,
                JobStatus::Completed,
                Some(download_url.clone()),
                None,
            )
            .await?;
        info!(job_id = %record.id, subject, "backup job completed");
        progress.status(
            ProgressStatus::Completed,
            Some(format!("backup of {subject} completed")),
        );
        progress.close();
        cleanup_spool(&spool_path).await;
        Ok(JobOutcome::Completed { download_url })
    }

    async fn finalize_failed(
        &self,
        job_id: Uuid,
        spool_path: &Path,
        error: AppError,
        progress: &ProgressSink,
    ) -> Result<JobOutcome> {
        let detail = error.to_string();
        warn!(%job_id, detail = %detail, "backup job failed");
        self.store
            .transition(job_id, JobStatus::Failed, None, Some(detail.clone()))
            .await?;
        progress.status(ProgressStatus::Failed, Some(detail.clone()));
        progress.close();
        cleanup_spool(spool_path).await;
        Ok(JobOutcome::Failed { detail })
    }
}

/// Pumps child stdout into both consumers, then reaps the child. The caller
/// keeps the senders: end-of-stream becomes observable only once the exit
/// status has been judged, so a failed dump can abort the upload before the
/// uploader sees the channel close. If a consumer goes away mid-stream the
/// dump cannot succeed and the child is killed.
async fn drive_dump(
    child: &mut Child,
    mut stdout: ChildStdout,
    sink_tx: &mpsc::Sender<Bytes>,
    upload_tx: &mpsc::Sender<Bytes>,
) -> std::io::Result<ExitStatus> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if sink_tx.send(chunk.clone()).await.is_err() || upload_tx.send(chunk).await.is_err() {
            child.start_kill().ok();
            break;
        }
    }
    child.wait().await
}

async fn write_spool(path: PathBuf, mut rx: mpsc::Receiver<Bytes>) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(&path).await?;
    while let Some(chunk) = rx.recv().await {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Forwards diagnostic lines to the progress sink and keeps a bounded tail
/// for the failure diagnostic. Stderr never affects job status.
async fn forward_stderr(stderr: ChildStderr, progress: ProgressSink) -> Vec<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        progress.line(line.clone());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

async fn cleanup_spool(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to delete local artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Drains the byte source like the real uploader, without a network.
    /// Mirrors its cancellation contract: a token fired before the source
    /// closed aborts instead of committing, and `committed` records whether
    /// a remote artifact would exist.
    struct MockUploader {
        received: Mutex<Vec<u8>>,
        committed: AtomicBool,
        fail_with: Option<String>,
    }

    impl MockUploader {
        fn new() -> Self {
            Self {
                received: Mutex::new(Vec::new()),
                committed: AtomicBool::new(false),
                fail_with: None,
            }
        }

        fn failing(detail: &str) -> Self {
            Self {
                received: Mutex::new(Vec::new()),
                committed: AtomicBool::new(false),
                fail_with: Some(detail.to_string()),
            }
        }

        fn bytes_received(&self) -> Vec<u8> {
            self.received.lock().unwrap().clone()
        }

        fn committed(&self) -> bool {
            self.committed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ArtifactUploader for MockUploader {
        async fn upload(
            &self,
            key: &str,
            mut body: mpsc::Receiver<Bytes>,
            cancel: CancellationToken,
        ) -> crate::errors::Result<String> {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    chunk = body.recv() => match chunk {
                        Some(chunk) => self.received.lock().unwrap().extend_from_slice(&chunk),
                        None => break,
                    },
                }
            }
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if let Some(detail) = &self.fail_with {
                return Err(AppError::Upload(detail.clone()));
            }
            self.committed.store(true, Ordering::SeqCst);
            Ok(format!("https://storage.example/presigned/{key}"))
        }
    }

    fn shell(script: &str) -> DumpInvocation {
        DumpInvocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
        }
    }

    fn runner_with(
        dir: &tempfile::TempDir,
        uploader: Arc<dyn ArtifactUploader>,
    ) -> BackupRunner {
        let store = Arc::new(JobRecordStore::new(dir.path().join("jobs.json")));
        BackupRunner::new(store, uploader, dir.path().join("spool"))
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_successful_run_completes_record_and_cleans_spool() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let uploader = Arc::new(MockUploader::new());
        let runner = runner_with(&dir, uploader.clone());
        let (progress, rx) = ProgressSink::channel();

        let outcome = runner
            .execute_invocation(
                "appdb",
                "appdb_test.dump".to_string(),
                shell("printf 'hello dump'"),
                progress,
                CancellationToken::new(),
            )
            .await?;

        assert_eq!(
            outcome,
            JobOutcome::Completed {
                download_url: "https://storage.example/presigned/appdb_test.dump".to_string()
            }
        );
        assert_eq!(uploader.bytes_received(), b"hello dump");
        assert!(!dir.path().join("spool/appdb_test.dump").exists());

        let records = runner.store().list().await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, JobStatus::Completed);
        assert!(records[0].download_reference.is_some());
        assert!(records[0].error_detail.is_none());
        assert!(records[0].completed_at.is_some());

        let events = collect(rx).await;
        let statuses: Vec<_> = events.iter().filter_map(|e| e.status).collect();
        assert_eq!(
            statuses.last().copied(),
            Some(crate::progress::ProgressStatus::Closed)
        );
        assert_eq!(
            statuses[statuses.len() - 2],
            crate::progress::ProgressStatus::Completed
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_large_output_streams_through_both_consumers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let uploader = Arc::new(MockUploader::new());
        let runner = runner_with(&dir, uploader.clone());
        let (progress, _rx) = ProgressSink::channel();

        let outcome = runner
            .execute_invocation(
                "appdb",
                "appdb_large.dump".to_string(),
                shell("head -c 262144 /dev/zero"),
                progress,
                CancellationToken::new(),
            )
            .await?;

        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        assert_eq!(uploader.bytes_received().len(), 262144);
        Ok(())
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr_detail() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner_with(&dir, Arc::new(MockUploader::new()));
        let (progress, rx) = ProgressSink::channel();

        let outcome = runner
            .execute_invocation(
                "appdb",
                "appdb_fail.dump".to_string(),
                shell("echo 'connection refused' >&2; exit 3"),
                progress,
                CancellationToken::new(),
            )
            .await?;

        let JobOutcome::Failed { detail } = outcome else {
            panic!("expected failed outcome");
        };
        assert!(detail.contains("connection refused"));
        assert!(!dir.path().join("spool/appdb_fail.dump").exists());

        let records = runner.store().list().await?;
        assert_eq!(records[0].status, JobStatus::Failed);
        assert!(records[0].error_detail.as_deref().unwrap().contains("connection refused"));
        assert!(records[0].download_reference.is_none());

        let events = collect(rx).await;
        let statuses: Vec<_> = events.iter().filter_map(|e| e.status).collect();
        assert_eq!(
            &statuses[statuses.len() - 2..],
            &[
                crate::progress::ProgressStatus::Failed,
                crate::progress::ProgressStatus::Closed
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_dump_never_commits_upload() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let uploader = Arc::new(MockUploader::new());
        let runner = runner_with(&dir, uploader.clone());
        let (progress, _rx) = ProgressSink::channel();

        let outcome = runner
            .execute_invocation(
                "appdb",
                "appdb_partial.dump".to_string(),
                shell("printf partialdata; echo 'dump exploded' >&2; exit 3"),
                progress,
                CancellationToken::new(),
            )
            .await?;

        let JobOutcome::Failed { detail } = outcome else {
            panic!("expected failed outcome");
        };
        assert!(detail.contains("dump exploded"));
        // The truncated stream must not have become a remote artifact.
        assert!(!uploader.committed());
        Ok(())
    }

    #[tokio::test]
    async fn test_stderr_lines_forwarded_as_progress() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner_with(&dir, Arc::new(MockUploader::new()));
        let (progress, rx) = ProgressSink::channel();

        runner
            .execute_invocation(
                "appdb",
                "appdb_diag.dump".to_string(),
                shell("echo 'dumping table users' >&2; printf data"),
                progress,
                CancellationToken::new(),
            )
            .await?;

        let events = collect(rx).await;
        assert!(
            events
                .iter()
                .any(|e| e.message.as_deref() == Some("dumping table users") && e.status.is_none())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_error_fails_job() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner_with(&dir, Arc::new(MockUploader::failing("bucket gone")));
        let (progress, _rx) = ProgressSink::channel();

        let outcome = runner
            .execute_invocation(
                "appdb",
                "appdb_upfail.dump".to_string(),
                shell("printf data"),
                progress,
                CancellationToken::new(),
            )
            .await?;

        let JobOutcome::Failed { detail } = outcome else {
            panic!("expected failed outcome");
        };
        assert!(detail.contains("bucket gone"));
        let records = runner.store().list().await?;
        assert_eq!(records[0].status, JobStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_dump_tool_fails_job() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner_with(&dir, Arc::new(MockUploader::new()));
        let (progress, _rx) = ProgressSink::channel();

        let outcome = runner
            .execute_invocation(
                "appdb",
                "appdb_notool.dump".to_string(),
                DumpInvocation {
                    program: "definitely-not-a-real-dump-tool".to_string(),
                    args: Vec::new(),
                    env: Vec::new(),
                },
                progress,
                CancellationToken::new(),
            )
            .await?;

        let JobOutcome::Failed { detail } = outcome else {
            panic!("expected failed outcome");
        };
        assert!(detail.contains("not found"));
        let records = runner.store().list().await?;
        assert_eq!(records[0].status, JobStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = Arc::new(runner_with(&dir, Arc::new(MockUploader::new())));
        let (progress, rx) = ProgressSink::channel();
        let cancel = CancellationToken::new();

        let task = {
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                runner
                    .execute_invocation(
                        "appdb",
                        "appdb_cancel.dump".to_string(),
                        shell("sleep 30"),
                        progress,
                        cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        // Repeated cancels must be harmless.
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task).await???;
        assert_eq!(outcome, JobOutcome::Cancelled);
        assert!(!dir.path().join("spool/appdb_cancel.dump").exists());

        let records = runner.store().list().await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, JobStatus::Cancelled);
        assert!(records[0].error_detail.is_some());
        assert!(records[0].download_reference.is_none());

        // A later cancel against the already-terminal record is a no-op.
        assert!(
            !runner
                .store()
                .cancel_if_processing(records[0].id, "again")
                .await?
        );

        let events = collect(rx).await;
        let statuses: Vec<_> = events.iter().filter_map(|e| e.status).collect();
        assert_eq!(
            &statuses[statuses.len() - 2..],
            &[
                crate::progress::ProgressStatus::Cancelled,
                crate::progress::ProgressStatus::Closed
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_with_orphaned_pipe_holder() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let uploader = Arc::new(MockUploader::new());
        let runner = Arc::new(runner_with(&dir, uploader.clone()));
        let (progress, _rx) = ProgressSink::channel();
        let cancel = CancellationToken::new();

        // The backgrounded sleep inherits the stdio pipes and outlives the
        // killed shell; finalization must not wait for it.
        let task = {
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                runner
                    .execute_invocation(
                        "appdb",
                        "appdb_orphan.dump".to_string(),
                        shell("sleep 30 & printf partialdata; wait"),
                        progress,
                        cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task).await???;
        assert_eq!(outcome, JobOutcome::Cancelled);
        assert!(!uploader.committed());

        let records = runner.store().list().await?;
        assert_eq!(records[0].status, JobStatus::Cancelled);
        Ok(())
    }

    #[tokio::test]
    async fn test_unsupported_kind_creates_no_record() -> anyhow::Result<()> {
        use crate::config::{BackupRequest, StorageSettings};
        use crate::dump::DatabaseKind;

        let dir = tempfile::tempdir()?;
        let runner = runner_with(&dir, Arc::new(MockUploader::new()));
        let (progress, _rx) = ProgressSink::channel();

        let request = BackupRequest {
            kind: DatabaseKind::Mongodb,
            host: "db".to_string(),
            port: 27017,
            username: "u".to_string(),
            password: "p".to_string(),
            database: "appdb".to_string(),
            require_tls: false,
            storage: StorageSettings {
                endpoint_url: "http://minio:9000".to_string(),
                region: "us-east-1".to_string(),
                bucket_name: "backups".to_string(),
                access_key_id: "AK".to_string(),
                secret_access_key: "SK".to_string(),
                key_prefix: None,
                url_ttl_secs: 3600,
            },
            schedule: None,
        };

        let err = runner
            .execute(&request, progress, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnsupportedKind(_)));
        assert!(runner.store().list().await?.is_empty());
        Ok(())
    }
}
