//! Batch run orchestration
//!
//! Fingerprints every request, groups requests by fingerprint, and runs
//! one producer per distinct fingerprint: lookup, then reserve/convert/
//! commit on a miss, then materialize a reference for every member of the
//! group. Failures are scoped to their group; one malformed geometry tree
//! never blocks unrelated conversions in the same batch.

use crate::batch::{BatchReport, ConversionRequest, ConversionResult, RequestOutcome};
use crate::convert::Converter;
use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::materialize::materialize;
use crate::registry::{CacheEntry, Registry, ReserveOutcome};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tuning knobs for a batch run
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Cap on concurrently producing fingerprint groups (0 = one worker
    /// per group)
    pub max_workers: usize,
    /// Bounded wait for a reservation held elsewhere
    pub reservation_wait: Duration,
    /// Poll interval while waiting out a foreign reservation
    pub poll_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            reservation_wait: Duration::from_secs(300),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// One member of a fingerprint group
struct GroupMember {
    index: usize,
    request_id: String,
    output_path: PathBuf,
}

/// All requests sharing one fingerprint
struct Group {
    fingerprint: Fingerprint,
    representation: Vec<u8>,
    members: Vec<GroupMember>,
}

/// Coordinates registry, converter, and materializer for whole batches
pub struct Orchestrator {
    registry: Registry,
    converter: Arc<dyn Converter>,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        registry: Registry,
        converter: Arc<dyn Converter>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            registry,
            converter,
            options,
        }
    }

    /// Run a batch; exactly one outcome per request, in input order
    pub async fn run(&self, requests: Vec<ConversionRequest>) -> BatchReport {
        let total = requests.len();
        let mut outcomes: Vec<Option<RequestOutcome>> = Vec::with_capacity(total);
        outcomes.resize_with(total, || None);

        // Fingerprint up front; degenerate representations fail their
        // request here without consuming a worker. Slot ids survive even
        // when a worker is lost, so fallback outcomes stay attributable.
        let mut groups: HashMap<Fingerprint, Group> = HashMap::new();
        let mut slot_ids: Vec<String> = Vec::with_capacity(total);
        for (index, request) in requests.into_iter().enumerate() {
            slot_ids.push(request.request_id.clone());
            match fingerprint(&request.representation) {
                Ok(fp) => {
                    let group = groups.entry(fp).or_insert_with(|| Group {
                        fingerprint: fp,
                        representation: request.representation.clone(),
                        members: Vec::new(),
                    });
                    group.members.push(GroupMember {
                        index,
                        request_id: request.request_id,
                        output_path: request.output_path,
                    });
                }
                Err(e) => {
                    warn!("Request '{}' rejected: {}", request.request_id, e);
                    outcomes[index] = Some(RequestOutcome::failed(request.request_id, &e));
                }
            }
        }

        info!(
            "Batch: {} request(s), {} distinct fingerprint(s)",
            total,
            groups.len()
        );

        let cap = if self.options.max_workers == 0 {
            groups.len().max(1)
        } else {
            self.options.max_workers
        };
        let semaphore = Arc::new(Semaphore::new(cap));

        let mut handles = Vec::with_capacity(groups.len());
        for group in groups.into_values() {
            let registry = self.registry.clone();
            let converter = Arc::clone(&self.converter);
            let options = self.options.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                // Semaphore lives for the whole batch; acquire cannot fail
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                run_group(registry, converter, options, group).await
            }));
        }

        for joined in join_all(handles).await {
            let group_outcomes = match joined {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    // A panicked worker loses its group; surfaced below
                    warn!("Worker task failed: {}", e);
                    continue;
                }
            };
            for (index, outcome) in group_outcomes {
                outcomes[index] = Some(outcome);
            }
        }

        BatchReport {
            results: outcomes
                .into_iter()
                .zip(slot_ids)
                .map(|(o, request_id)| {
                    o.unwrap_or_else(|| {
                        RequestOutcome::failed(
                            request_id,
                            &ForgeError::Internal("worker lost before reporting".to_string()),
                        )
                    })
                })
                .collect(),
        }
    }
}

/// Resolve one fingerprint group and materialize every member
async fn run_group(
    registry: Registry,
    converter: Arc<dyn Converter>,
    options: OrchestratorOptions,
    group: Group,
) -> Vec<(usize, RequestOutcome)> {
    let entry = resolve_entry(
        &registry,
        converter.as_ref(),
        &options,
        group.fingerprint,
        &group.representation,
    )
    .await;

    let mut outcomes = Vec::with_capacity(group.members.len());
    match entry {
        Ok((entry, cache_hit)) => {
            for member in group.members {
                let outcome = match materialize(&entry.artifact_path, &member.output_path) {
                    Ok(strategy) => RequestOutcome::Converted(ConversionResult {
                        request_id: member.request_id,
                        fingerprint: group.fingerprint.to_hex(),
                        resolved_path: member.output_path,
                        cache_hit,
                        link_strategy: strategy,
                    }),
                    Err(e) => RequestOutcome::failed(member.request_id, &e),
                };
                outcomes.push((member.index, outcome));
            }
        }
        Err(e) => {
            // The whole group shares this failure; siblings are untouched
            for member in group.members {
                outcomes.push((member.index, RequestOutcome::failed(member.request_id, &e)));
            }
        }
    }
    outcomes
}

/// Get the committed entry for a fingerprint, producing it if needed
///
/// Exactly one worker (across threads and processes) converts; everyone
/// else either sees the committed entry or waits out the reservation
/// within the configured bound.
async fn resolve_entry(
    registry: &Registry,
    converter: &dyn Converter,
    options: &OrchestratorOptions,
    fp: Fingerprint,
    representation: &[u8],
) -> ForgeResult<(CacheEntry, bool)> {
    let deadline = Instant::now() + options.reservation_wait;

    loop {
        if let Some(entry) = registry.lookup(fp)? {
            debug!("Cache hit for {}", fp);
            return Ok((entry, true));
        }

        match registry.reserve(fp)? {
            ReserveOutcome::Reserved(reservation) => {
                // Another producer may have committed between the lookup
                // and the reserve; their entry is authoritative.
                if let Some(entry) = registry.lookup(fp)? {
                    registry.abort(reservation);
                    return Ok((entry, true));
                }

                let scratch = registry.scratch_path(fp);
                match converter.convert(representation, &scratch).await {
                    Ok(()) => {
                        let entry = registry.commit(reservation, &scratch)?;
                        info!("Converted and committed {}", fp);
                        return Ok((entry, false));
                    }
                    Err(e) => {
                        registry.abort(reservation);
                        let _ = std::fs::remove_file(&scratch);
                        return Err(e);
                    }
                }
            }
            ReserveOutcome::Busy => {
                if Instant::now() >= deadline {
                    return Err(ForgeError::ReservationTimeout {
                        fingerprint: fp.to_hex(),
                        waited_secs: options.reservation_wait.as_secs(),
                    });
                }
                debug!("Fingerprint {} busy, waiting", fp);
                tokio::time::sleep(options.poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RequestOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-process converter that counts invocations and fails on demand
    struct MockConverter {
        calls: AtomicUsize,
    }

    impl MockConverter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Converter for MockConverter {
        async fn convert(&self, representation: &[u8], scratch: &std::path::Path) -> ForgeResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if representation.windows(3).any(|w| w == b"BAD") {
                return Err(ForgeError::KernelExit {
                    command: "mock".to_string(),
                    code: 1,
                    stderr: "degenerate geometry".to_string(),
                });
            }
            let mut artifact = b"SOLID:".to_vec();
            artifact.extend_from_slice(representation);
            std::fs::write(scratch, artifact)
                .map_err(|e| ForgeError::io("mock scratch write", e))
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn orchestrator(dir: &TempDir, converter: Arc<MockConverter>) -> Orchestrator {
        let registry = Registry::open(
            dir.path().join("cache"),
            "step",
            Duration::from_secs(600),
        )
        .unwrap();
        Orchestrator::new(
            registry,
            converter,
            OrchestratorOptions {
                max_workers: 4,
                reservation_wait: Duration::from_secs(5),
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    fn request(id: &str, rep: &[u8], dir: &TempDir, name: &str) -> ConversionRequest {
        ConversionRequest::new(id, rep.to_vec(), dir.path().join("out").join(name))
    }

    fn converted(outcome: &RequestOutcome) -> &ConversionResult {
        match outcome {
            RequestOutcome::Converted(result) => result,
            RequestOutcome::Failed { error, .. } => panic!("unexpected failure: {}", error),
        }
    }

    #[tokio::test]
    async fn identical_requests_convert_once() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        let orch = orchestrator(&dir, Arc::clone(&converter));

        let report = orch
            .run(vec![
                request("a", b"BOX 10x10x10", &dir, "a.step"),
                request("b", b"BOX 10x10x10", &dir, "b.step"),
            ])
            .await;

        assert_eq!(converter.calls(), 1);
        assert!(report.is_success());

        let a = converted(&report.results[0]);
        let b = converted(&report.results[1]);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert!(!a.cache_hit && !b.cache_hit);
        assert_eq!(
            std::fs::read(&a.resolved_path).unwrap(),
            std::fs::read(&b.resolved_path).unwrap()
        );
        #[cfg(unix)]
        assert_eq!(a.link_strategy, crate::materialize::LinkStrategy::Symlink);
    }

    #[tokio::test]
    async fn distinct_representation_converts_again() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        let orch = orchestrator(&dir, Arc::clone(&converter));

        let report = orch
            .run(vec![
                request("a", b"BOX 10x10x10", &dir, "a.step"),
                request("b", b"BOX 10x10x10", &dir, "b.step"),
                request("c", b"BOX 12x10x10", &dir, "c.step"),
            ])
            .await;

        assert_eq!(converter.calls(), 2);
        assert_eq!(report.conversions(), 2);
        let a = converted(&report.results[0]);
        let c = converted(&report.results[2]);
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[tokio::test]
    async fn cross_run_cache_hit_skips_conversion() {
        let dir = TempDir::new().unwrap();

        let first = MockConverter::new();
        let orch = orchestrator(&dir, Arc::clone(&first));
        orch.run(vec![request("a", b"BOX 10x10x10", &dir, "a.step")])
            .await;
        assert_eq!(first.calls(), 1);

        // Fresh orchestrator over the same cache directory, as a new
        // pipeline run would open it
        let second = MockConverter::new();
        let orch = orchestrator(&dir, Arc::clone(&second));
        let report = orch
            .run(vec![request("again", b"BOX 10x10x10", &dir, "fresh.step")])
            .await;

        assert_eq!(second.calls(), 0);
        let result = converted(&report.results[0]);
        assert!(result.cache_hit);
    }

    #[tokio::test]
    async fn group_failure_isolated_from_siblings() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        let orch = orchestrator(&dir, Arc::clone(&converter));

        // Malformed group submitted first; order must not matter
        let report = orch
            .run(vec![
                request("bad-1", b"BAD GEOMETRY", &dir, "bad1.step"),
                request("ok-1", b"BOX 10x10x10", &dir, "ok1.step"),
                request("bad-2", b"BAD GEOMETRY", &dir, "bad2.step"),
                request("ok-2", b"BOX 10x10x10", &dir, "ok2.step"),
            ])
            .await;

        assert_eq!(report.failed_count(), 2);
        assert!(report.results[1].is_success());
        assert!(report.results[3].is_success());

        for index in [0, 2] {
            match &report.results[index] {
                RequestOutcome::Failed {
                    kind, retryable, ..
                } => {
                    assert_eq!(kind, "non_zero_exit");
                    assert!(!retryable);
                }
                RequestOutcome::Converted(_) => panic!("malformed group must fail"),
            }
        }
        // Malformed group converted at most once, valid group exactly once
        assert_eq!(converter.calls(), 2);
    }

    #[tokio::test]
    async fn failed_conversion_leaves_no_cache_entry() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        let orch = orchestrator(&dir, Arc::clone(&converter));

        orch.run(vec![request("bad", b"BAD GEOMETRY", &dir, "bad.step")])
            .await;

        let registry = Registry::open(
            dir.path().join("cache"),
            "step",
            Duration::from_secs(600),
        )
        .unwrap();
        assert!(registry.entries().unwrap().is_empty());
        let fp = fingerprint(b"BAD GEOMETRY").unwrap();
        // Reservation released, so a retry could reserve immediately
        assert!(matches!(
            registry.reserve(fp).unwrap(),
            ReserveOutcome::Reserved(_)
        ));
    }

    #[tokio::test]
    async fn empty_representation_fails_only_its_request() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        let orch = orchestrator(&dir, Arc::clone(&converter));

        let report = orch
            .run(vec![
                request("empty", b"", &dir, "empty.step"),
                request("ok", b"BOX 10x10x10", &dir, "ok.step"),
            ])
            .await;

        match &report.results[0] {
            RequestOutcome::Failed { kind, .. } => assert_eq!(kind, "input"),
            RequestOutcome::Converted(_) => panic!("empty representation must fail"),
        }
        assert!(report.results[1].is_success());
        assert_eq!(converter.calls(), 1);
    }

    #[tokio::test]
    async fn outcomes_preserve_input_order() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        let orch = orchestrator(&dir, Arc::clone(&converter));

        let ids = ["p-3", "p-1", "p-2", "p-1-dup"];
        let report = orch
            .run(vec![
                request(ids[0], b"TILE 3", &dir, "p3.step"),
                request(ids[1], b"TILE 1", &dir, "p1.step"),
                request(ids[2], b"TILE 2", &dir, "p2.step"),
                request(ids[3], b"TILE 1", &dir, "p1d.step"),
            ])
            .await;

        let reported: Vec<_> = report.results.iter().map(|r| r.request_id()).collect();
        assert_eq!(reported, ids);
    }

    /// Converter whose task dies mid-flight instead of returning an error
    struct CrashingConverter;

    #[async_trait]
    impl Converter for CrashingConverter {
        async fn convert(&self, representation: &[u8], scratch: &std::path::Path) -> ForgeResult<()> {
            if representation == b"CRASH" {
                panic!("converter crashed");
            }
            std::fs::write(scratch, b"SOLID").map_err(|e| ForgeError::io("scratch write", e))
        }

        fn name(&self) -> &'static str {
            "crashing"
        }
    }

    #[tokio::test]
    async fn lost_worker_outcomes_keep_request_ids() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(
            dir.path().join("cache"),
            "step",
            Duration::from_secs(600),
        )
        .unwrap();
        let orch = Orchestrator::new(
            registry,
            Arc::new(CrashingConverter),
            OrchestratorOptions {
                max_workers: 4,
                reservation_wait: Duration::from_secs(5),
                poll_interval: Duration::from_millis(10),
            },
        );

        let report = orch
            .run(vec![
                request("crash-1", b"CRASH", &dir, "c1.step"),
                request("ok", b"BOX 10x10x10", &dir, "ok.step"),
                request("crash-2", b"CRASH", &dir, "c2.step"),
            ])
            .await;

        assert!(report.results[1].is_success());
        for index in [0, 2] {
            match &report.results[index] {
                RequestOutcome::Failed { kind, .. } => assert_eq!(kind, "internal"),
                RequestOutcome::Converted(_) => panic!("crashed group must fail"),
            }
        }
        // Attribution survives the lost worker
        assert_eq!(report.results[0].request_id(), "crash-1");
        assert_eq!(report.results[2].request_id(), "crash-2");
    }

    #[tokio::test]
    async fn foreign_reservation_times_out_as_retryable() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        let registry = Registry::open(
            dir.path().join("cache"),
            "step",
            Duration::from_secs(600),
        )
        .unwrap();

        // Simulate another process holding the fingerprint
        let fp = fingerprint(b"BOX 10x10x10").unwrap();
        let ReserveOutcome::Reserved(_held) = registry.reserve(fp).unwrap() else {
            panic!("expected reservation");
        };

        let orch = Orchestrator::new(
            registry.clone(),
            Arc::clone(&converter) as Arc<dyn Converter>,
            OrchestratorOptions {
                max_workers: 1,
                reservation_wait: Duration::from_millis(50),
                poll_interval: Duration::from_millis(10),
            },
        );
        let report = orch
            .run(vec![request("a", b"BOX 10x10x10", &dir, "a.step")])
            .await;

        match &report.results[0] {
            RequestOutcome::Failed {
                kind, retryable, ..
            } => {
                assert_eq!(kind, "reservation_timeout");
                assert!(*retryable);
            }
            RequestOutcome::Converted(_) => panic!("expected timeout"),
        }
        assert_eq!(converter.calls(), 0);
    }

    #[tokio::test]
    async fn waiter_proceeds_after_foreign_commit() {
        let dir = TempDir::new().unwrap();
        let converter = MockConverter::new();
        let registry = Registry::open(
            dir.path().join("cache"),
            "step",
            Duration::from_secs(600),
        )
        .unwrap();

        let fp = fingerprint(b"BOX 10x10x10").unwrap();
        let ReserveOutcome::Reserved(held) = registry.reserve(fp).unwrap() else {
            panic!("expected reservation");
        };

        let orch = Orchestrator::new(
            registry.clone(),
            Arc::clone(&converter) as Arc<dyn Converter>,
            OrchestratorOptions {
                max_workers: 1,
                reservation_wait: Duration::from_secs(5),
                poll_interval: Duration::from_millis(10),
            },
        );

        // Commit from "elsewhere" while the batch is waiting
        let committer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                let scratch = registry.scratch_path(fp);
                std::fs::write(&scratch, b"SOLID from other process").unwrap();
                registry.commit(held, &scratch).unwrap();
            })
        };

        let report = orch
            .run(vec![request("a", b"BOX 10x10x10", &dir, "a.step")])
            .await;
        committer.await.unwrap();

        let result = converted(&report.results[0]);
        assert!(result.cache_hit);
        assert_eq!(converter.calls(), 0);
        assert_eq!(
            std::fs::read(&result.resolved_path).unwrap(),
            b"SOLID from other process"
        );
    }
}
