//! Bounded-concurrency part transfer: range-read source + part-upload
//! destination, with per-part retry, a pool-wide deadline, and cooperative
//! cancellation.
//!
//! Grounded on `migration_lib/processor.py`'s `job_processor`/`woker_thread`
//! state machine (`start -> downloading -> uploading -> complete`, with
//! absorbing `quit`/`timeout`/`cancelled` states and the `5 * attempt`
//! second linear backoff) — re-expressed with `tokio::task::JoinSet` +
//! `tokio::sync::Semaphore` + `tokio_util::sync::CancellationToken` instead
//! of a thread pool, since the surrounding stack is fully async-native.
//! This is the one deliberate HOW deviation noted in DESIGN.md: the
//! teacher's original `ThreadPoolExecutor` becomes async tasks, but the
//! state machine and retry discipline carry over unchanged.

use crate::storage::{DownloadCapability, StorageError, UploadCapability};
use crate::types::MAX_PARTS;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// One object's worth of identity needed by every part worker.
#[derive(Debug, Clone)]
pub struct PartPoolJob {
    pub src_key: String,
    pub des_key: String,
    pub size: u64,
    pub version: Option<String>,
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// A part's download hit an unrecoverable source error, or exhausted
    /// its download retry budget.
    #[error("unrecoverable source error, object aborted")]
    Quit,

    /// The job deadline elapsed, or a part exhausted its upload retry
    /// budget. The destination multipart upload is left in place for a
    /// later resume.
    #[error("job timed out")]
    Timeout,

    #[error("part transfer failed: {0}")]
    Err(String),
}

/// Outcome of one part worker's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartOutcome {
    Complete,
    Quit,
    Timeout,
    Cancelled,
}

/// Executes a part-transfer plan with bounded concurrency.
pub struct PartTransferPool {
    source: Arc<dyn DownloadCapability>,
    destination: Arc<dyn UploadCapability>,
    max_threads: usize,
    max_retries: u32,
    job_timeout: Duration,
    verify_md5_twice: bool,
    include_version: bool,
}

impl PartTransferPool {
    pub fn new(
        source: Arc<dyn DownloadCapability>,
        destination: Arc<dyn UploadCapability>,
        max_threads: usize,
        max_retries: u32,
        job_timeout: Duration,
        verify_md5_twice: bool,
        include_version: bool,
    ) -> Self {
        Self {
            source,
            destination,
            max_threads: max_threads.max(1),
            max_retries,
            job_timeout,
            verify_md5_twice,
            include_version,
        }
    }

    /// Run the plan to completion. `plan` is `(part_number, start_index)`
    /// pairs; `dryrun_etags` maps part numbers already present on the
    /// destination (from a resumed upload's `list_parts`) to their ETag,
    /// which for a single part equals the hex MD5 digest — letting a
    /// dryrun part's entry in the composite ETag be reconstructed without
    /// re-downloading it, unless `verify_md5_twice` forces a re-read.
    #[instrument(skip(self, plan, dryrun_etags, cancel))]
    pub async fn run(
        &self,
        job: &PartPoolJob,
        upload_id: &str,
        chunk_size: u64,
        plan: &[(i32, u64)],
        dryrun_etags: &HashMap<i32, String>,
        cancel: CancellationToken,
    ) -> Result<String, PoolError> {
        if self.include_version && job.version.is_some() {
            // Open Question 1 (DESIGN.md): version-pinned multipart
            // downloads are rejected rather than silently spliced across
            // revisions. Migrator enforces this before constructing a
            // pool, so reaching here with both set is a caller bug.
            return Err(PoolError::Err(
                "include_version with multipart is unsupported; Migrator must reject this combination".to_string(),
            ));
        }
        debug_assert!(plan.len() <= MAX_PARTS);

        let md5_list: Arc<Vec<Mutex<Option<[u8; 16]>>>> =
            Arc::new((0..plan.len()).map(|_| Mutex::new(None)).collect());
        let complete_list: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let semaphore = Arc::new(Semaphore::new(self.max_threads));

        let mut join_set = tokio::task::JoinSet::new();
        for &(part_number, start) in plan {
            let dryrun_etag = dryrun_etags.get(&part_number).cloned();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let md5_list = md5_list.clone();
            let complete_list = complete_list.clone();
            let source = self.source.clone();
            let destination = self.destination.clone();
            let job = job.clone();
            let upload_id = upload_id.to_string();
            let max_retries = self.max_retries;
            let verify_md5_twice = self.verify_md5_twice;

            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return PartOutcome::Cancelled,
                };
                run_part_worker(
                    PartWorkerArgs {
                        source,
                        destination,
                        job,
                        upload_id,
                        part_number,
                        start,
                        chunk_size,
                        max_retries,
                        verify_md5_twice,
                        dryrun_etag,
                    },
                    md5_list,
                    complete_list,
                    cancel,
                )
                .await
            });
        }

        let wait_all = async {
            let mut saw_quit = false;
            let mut saw_timeout = false;
            while let Some(result) = join_set.join_next().await {
                match result {
                    Ok(PartOutcome::Complete) | Ok(PartOutcome::Cancelled) => {}
                    Ok(PartOutcome::Quit) => saw_quit = true,
                    Ok(PartOutcome::Timeout) => saw_timeout = true,
                    Err(e) => warn!("part worker task panicked: {e}"),
                }
            }
            if saw_quit {
                Err(PoolError::Quit)
            } else if saw_timeout {
                Err(PoolError::Timeout)
            } else {
                Ok(())
            }
        };

        match tokio::time::timeout(self.job_timeout, wait_all).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                cancel.cancel();
                join_set.abort_all();
                return Err(e);
            }
            Err(_) => {
                cancel.cancel();
                join_set.abort_all();
                return Err(PoolError::Timeout);
            }
        }

        let completed = complete_list.lock().unwrap().len();
        if completed != plan.len() {
            return Err(PoolError::Err(format!(
                "{completed}/{} parts completed before the pool drained",
                plan.len()
            )));
        }

        let digests: Vec<[u8; 16]> = (0..plan.len())
            .map(|i| {
                md5_list[i]
                    .lock()
                    .unwrap()
                    .expect("every completed part must have recorded its MD5")
            })
            .collect();
        Ok(crate::multipart::composite_etag(&digests))
    }
}

struct PartWorkerArgs {
    source: Arc<dyn DownloadCapability>,
    destination: Arc<dyn UploadCapability>,
    job: PartPoolJob,
    upload_id: String,
    part_number: i32,
    start: u64,
    chunk_size: u64,
    max_retries: u32,
    verify_md5_twice: bool,
    dryrun_etag: Option<String>,
}

async fn run_part_worker(
    args: PartWorkerArgs,
    md5_list: Arc<Vec<Mutex<Option<[u8; 16]>>>>,
    complete_list: Arc<Mutex<Vec<i32>>>,
    cancel: CancellationToken,
) -> PartOutcome {
    if cancel.is_cancelled() {
        return PartOutcome::Cancelled;
    }

    let slot = (args.part_number - 1) as usize;
    let is_dryrun = args.dryrun_etag.is_some();

    if is_dryrun && !args.verify_md5_twice {
        let etag = args.dryrun_etag.as_deref().unwrap_or_default();
        if let Some(digest) = etag_to_raw_md5(etag) {
            *md5_list[slot].lock().unwrap() = Some(digest);
            complete_list.lock().unwrap().push(args.part_number);
            return PartOutcome::Complete;
        }
        // Fall through and re-download if the ETag isn't a plain MD5 hex
        // (e.g. the upstream already composed it, which shouldn't happen
        // for a single uploaded part, but we don't want to wedge here).
    }

    let body = match download_with_retry(&args, &cancel).await {
        Ok(body) => body,
        Err(outcome) => return outcome,
    };

    *md5_list[slot].lock().unwrap() = Some(body.md5);

    match upload_with_retry(&args, body, &cancel).await {
        Ok(()) => {
            complete_list.lock().unwrap().push(args.part_number);
            PartOutcome::Complete
        }
        Err(outcome) => outcome,
    }
}

async fn download_with_retry(
    args: &PartWorkerArgs,
    cancel: &CancellationToken,
) -> Result<crate::storage::ObjectBody, PartOutcome> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(PartOutcome::Cancelled);
        }
        match args
            .source
            .get_object(&args.job.src_key, args.job.size, args.start, args.chunk_size, args.job.version.as_deref())
            .await
        {
            Ok(body) => return Ok(body),
            Err(e) => {
                attempt += 1;
                debug!(
                    "download attempt {attempt} failed for {}#{}: {e}",
                    args.job.src_key, args.part_number
                );
                if attempt >= args.max_retries {
                    cancel.cancel();
                    return Err(PartOutcome::Quit);
                }
                if sleep_or_cancel(Duration::from_secs(5 * attempt as u64), cancel).await {
                    return Err(PartOutcome::Cancelled);
                }
            }
        }
    }
}

async fn upload_with_retry(
    args: &PartWorkerArgs,
    body: crate::storage::ObjectBody,
    cancel: &CancellationToken,
) -> Result<(), PartOutcome> {
    let body_md5 = crate::storage::content_md5_base64(&body.md5);
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(PartOutcome::Cancelled);
        }
        // Re-upload the same bytes each attempt; nothing here consumes
        // `body.data` irreversibly since `Bytes` is a cheap refcounted clone.
        match args
            .destination
            .upload_part(&args.job.des_key, &args.upload_id, args.part_number, body.data.clone(), &body_md5)
            .await
        {
            Ok(_etag) => return Ok(()),
            Err(e) => {
                attempt += 1;
                debug!(
                    "upload attempt {attempt} failed for {}#{}: {e}",
                    args.job.des_key, args.part_number
                );
                if attempt >= args.max_retries {
                    cancel.cancel();
                    return Err(PartOutcome::Timeout);
                }
                if sleep_or_cancel(Duration::from_secs(5 * attempt as u64), cancel).await {
                    return Err(PartOutcome::Cancelled);
                }
            }
        }
    }
}

/// Sleep for `duration`, or return early (with `true`) if cancellation is
/// observed first — the "abandon sleep and return immediately" tie-break
/// from spec.md §4.7.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}

/// Decode a quoted ETag as a raw MD5 digest, when it's a plain (non-composite)
/// hex MD5 — true for any single part uploaded without server-side encryption.
fn etag_to_raw_md5(etag: &str) -> Option<[u8; 16]> {
    let trimmed = etag.trim_matches('"');
    if trimmed.contains('-') || trimmed.len() != 32 {
        return None;
    }
    let bytes = hex::decode(trimmed).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ListingPage, ObjectBody, PartsPage, UploadsPage};
    use crate::types::{HeadMetadata, JobInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeSource {
        body: bytes::Bytes,
        stall: bool,
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl DownloadCapability for FakeSource {
        async fn list_objects(
            &self,
            _prefix: &str,
            _include_version: bool,
            _token: Option<String>,
        ) -> Result<ListingPage, StorageError> {
            unimplemented!()
        }

        async fn get_object(
            &self,
            _key: &str,
            size: u64,
            start: u64,
            chunk_size: u64,
            _version: Option<&str>,
        ) -> Result<ObjectBody, StorageError> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::Backend("transient".to_string()));
            }
            let end = (start + chunk_size.max(1)).min(size) as usize;
            let data = self.body.slice(start as usize..end);
            let md5: [u8; 16] = Md5::digest(&data).into();
            Ok(ObjectBody { data, md5 })
        }

        async fn head_object(&self, _key: &str) -> Result<HeadMetadata, StorageError> {
            unimplemented!()
        }
    }

    struct FakeDestination {
        uploaded: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl UploadCapability for FakeDestination {
        async fn upload_object(
            &self,
            _key: &str,
            _body: bytes::Bytes,
            _content_md5: &str,
            _storage_class: Option<&str>,
            _extra_metadata: &HeadMetadata,
        ) -> Result<String, StorageError> {
            unimplemented!()
        }
        async fn create_multipart_upload(
            &self,
            _key: &str,
            _storage_class: Option<&str>,
            _extra_metadata: &HeadMetadata,
        ) -> Result<String, StorageError> {
            unimplemented!()
        }
        async fn upload_part(
            &self,
            _key: &str,
            _upload_id: &str,
            part_number: i32,
            _body: bytes::Bytes,
            _body_md5: &str,
        ) -> Result<String, StorageError> {
            self.uploaded.lock().unwrap().push(part_number);
            Ok(format!("\"etag-{part_number}\""))
        }
        async fn complete_multipart_upload(&self, _key: &str, _upload_id: &str) -> Result<String, StorageError> {
            unimplemented!()
        }
        async fn list_parts(
            &self,
            _key: &str,
            _upload_id: &str,
            _token: Option<String>,
        ) -> Result<PartsPage, StorageError> {
            unimplemented!()
        }
        async fn list_multipart_uploads(
            &self,
            _prefix: &str,
            _key: Option<&str>,
            _token: Option<String>,
        ) -> Result<UploadsPage, StorageError> {
            unimplemented!()
        }
        async fn abort_multipart_upload(&self, _key: &str, _upload_id: &str) -> Result<(), StorageError> {
            Ok(())
        }
        async fn delete_object(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn job() -> PartPoolJob {
        PartPoolJob {
            src_key: "big.bin".to_string(),
            des_key: "big.bin".to_string(),
            size: 30,
            version: None,
        }
    }

    #[tokio::test]
    async fn scenario_s2_resume_reuses_dryrun_part_and_completes_others() {
        let source = Arc::new(FakeSource {
            body: bytes::Bytes::from(vec![7u8; 30]),
            stall: false,
            fail_times: AtomicU32::new(0),
        });
        let destination = Arc::new(FakeDestination {
            uploaded: Mutex::new(Vec::new()),
        });
        let pool = PartTransferPool::new(source, destination.clone(), 10, 5, Duration::from_secs(30), false, false);

        let plan = vec![(1, 0), (2, 10), (3, 20)];
        let mut dryrun = HashMap::new();
        // part 1 already uploaded; its ETag is the plain MD5 hex of its bytes.
        let part1_md5 = Md5::digest(&[7u8; 10]);
        dryrun.insert(1, format!("\"{}\"", hex::encode(part1_md5)));

        let etag = pool
            .run(&job(), "upload-1", 10, &plan, &dryrun, CancellationToken::new())
            .await
            .unwrap();

        assert!(etag.ends_with("-3\""));
        // Only parts 2 and 3 actually hit upload_part.
        let mut uploaded = destination.uploaded.lock().unwrap().clone();
        uploaded.sort();
        assert_eq!(uploaded, vec![2, 3]);
    }

    #[tokio::test]
    async fn scenario_s6_timeout_cancels_and_reports_timeout() {
        let source = Arc::new(FakeSource {
            body: bytes::Bytes::from(vec![1u8; 10]),
            stall: true,
            fail_times: AtomicU32::new(0),
        });
        let destination = Arc::new(FakeDestination {
            uploaded: Mutex::new(Vec::new()),
        });
        let pool = PartTransferPool::new(source, destination.clone(), 10, 5, Duration::from_secs(1), false, false);

        let job = PartPoolJob {
            src_key: "slow.bin".to_string(),
            des_key: "slow.bin".to_string(),
            size: 10,
            version: None,
        };
        let result = pool.run(&job, "upload-1", 10, &[(1, 0)], &HashMap::new(), CancellationToken::new()).await;
        assert!(matches!(result, Err(PoolError::Timeout)));
        assert!(destination.uploaded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn download_exhausting_retries_quits() {
        let source = Arc::new(FakeSource {
            body: bytes::Bytes::from(vec![1u8; 10]),
            stall: false,
            fail_times: AtomicU32::new(10),
        });
        let destination = Arc::new(FakeDestination {
            uploaded: Mutex::new(Vec::new()),
        });
        let pool = PartTransferPool::new(source, destination, 10, 1, Duration::from_secs(30), false, false);
        let result = pool
            .run(&job(), "upload-1", 10, &[(1, 0)], &HashMap::new(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PoolError::Quit)));
    }

    #[test]
    fn etag_to_raw_md5_rejects_composite_etags() {
        assert!(etag_to_raw_md5("\"abcd1234-3\"").is_none());
        assert!(etag_to_raw_md5("not-hex-and-not-32-chars").is_none());
    }

    #[test]
    fn etag_to_raw_md5_accepts_plain_hex_digest() {
        let digest = Md5::digest(b"hello");
        let etag = format!("\"{}\"", hex::encode(digest));
        assert_eq!(etag_to_raw_md5(&etag), Some(digest.into()));
    }
}
