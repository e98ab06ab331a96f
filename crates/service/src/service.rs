use crate::config::ReaperConfig;
use crate::records::{CoverageInput, ScanListing, ScanRecord, ScanRequest, ScannedFile};
use anyhow::{bail, Context, Result};
use reaper_analysis::{
    samples_from_v8, CoverageMapper, CoverageSample, DeadCodeClassifier, Verdict,
};
use reaper_lifecycle::{
    get_typed, put_typed, require_typed, resolve_in_root, unix_now_ms, CancelToken,
    CommandReplayer, FileStore, LiveFunction, PatchApplication, PatchLifecycle, PatchState,
    RecordKind, Replayer, Store, VerificationResult, VerifyOutcome, VerifyRequest,
};
use reaper_patch::{Patch, PatchGenerator, PatchRequest, SafetyProfile};
use reaper_source_index::{index_source, revision_of, FunctionId, IndexOutcome, UnparsableFile};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

static SCAN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

enum FileOutcome {
    Scanned(ScannedFile),
    Unparsable(UnparsableFile),
}

/// The five core operations over one configured store
pub struct ReaperService {
    config: ReaperConfig,
    store: Arc<dyn Store>,
    classifier: DeadCodeClassifier,
    generator: PatchGenerator,
}

impl ReaperService {
    /// Service backed by JSON records under `config.data_dir`
    pub fn new(config: ReaperConfig) -> Self {
        let store: Arc<dyn Store> = Arc::new(FileStore::new(config.data_dir.clone()));
        Self::with_store(config, store)
    }

    pub fn with_store(config: ReaperConfig, store: Arc<dyn Store>) -> Self {
        Self {
            classifier: DeadCodeClassifier::new(config.risk.weights.clone()),
            generator: PatchGenerator::new(config.patch_config()),
            config,
            store,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    fn lifecycle(&self, root: &Path) -> PatchLifecycle {
        PatchLifecycle::new(
            root,
            self.config.lock_dir(),
            self.store.clone(),
            self.config.lifecycle_config(),
        )
    }

    fn samples(&self, inputs: &[CoverageInput]) -> Result<Vec<CoverageSample>> {
        let filter = self.config.script_filter();
        let mut samples = Vec::new();
        for input in inputs {
            match input {
                CoverageInput::V8 {
                    session_id,
                    payload,
                } => samples.extend(
                    samples_from_v8(payload, session_id, &filter)
                        .with_context(|| format!("Invalid coverage for session {session_id}"))?,
                ),
                CoverageInput::Samples { samples: given } => samples.extend(given.iter().cloned()),
            }
        }
        Ok(samples)
    }

    /// Index, map and classify every file of the scan, in parallel.
    ///
    /// Files that fail to parse or read are reported and excluded; the rest of the scan
    /// carries on.
    pub async fn scan_and_analyze(&self, request: ScanRequest) -> Result<ScanRecord> {
        if request.coverage.is_empty() {
            bail!("scan needs at least one coverage input");
        }
        let samples = self.samples(&request.coverage)?;
        if samples.is_empty() {
            bail!("coverage inputs contained no usable script samples");
        }

        let mut by_file: BTreeMap<String, Vec<CoverageSample>> = BTreeMap::new();
        for sample in &samples {
            by_file
                .entry(sample.file.clone())
                .or_default()
                .push(sample.clone());
        }
        let files: BTreeSet<String> = if request.files.is_empty() {
            by_file.keys().cloned().collect()
        } else {
            request.files.iter().cloned().collect()
        };
        for file in by_file.keys().filter(|f| !files.contains(*f)) {
            log::debug!("coverage for {file} is outside the scanned file set");
        }

        let mut join = JoinSet::new();
        for path in files {
            let target = resolve_in_root(&request.root, &path)?;
            let file_samples = by_file.remove(&path).unwrap_or_default();
            let mapper = self.config.mapper();
            let classifier = self.classifier.clone();
            join.spawn(async move {
                let text = match tokio::fs::read_to_string(&target).await {
                    Ok(text) => text,
                    Err(err) => {
                        return FileOutcome::Unparsable(UnparsableFile {
                            file: path,
                            revision: String::new(),
                            reason: format!("unreadable: {err}"),
                            error_offset: None,
                        })
                    }
                };
                let fallback = path.clone();
                tokio::task::spawn_blocking(move || {
                    analyze_file(path, text, &file_samples, mapper, &classifier)
                })
                .await
                .unwrap_or_else(|err| {
                    FileOutcome::Unparsable(UnparsableFile {
                        file: fallback,
                        revision: String::new(),
                        reason: format!("analysis task failed: {err}"),
                        error_offset: None,
                    })
                })
            });
        }

        let mut scanned = Vec::new();
        let mut unparsable = Vec::new();
        while let Some(outcome) = join.join_next().await {
            match outcome.context("scan task panicked")? {
                FileOutcome::Scanned(file) => scanned.push(file),
                FileOutcome::Unparsable(file) => {
                    log::warn!("{}: excluded from scan ({})", file.file, file.reason);
                    unparsable.push(file);
                }
            }
        }
        scanned.sort_by(|a, b| a.path.cmp(&b.path));
        unparsable.sort_by(|a, b| a.file.cmp(&b.file));

        let created_at_ms = unix_now_ms();
        let root = request.root.canonicalize().unwrap_or(request.root);
        let record = ScanRecord {
            id: scan_id(&root, &scanned, created_at_ms),
            summary: ScanRecord::summarize(&scanned, unparsable.len()),
            root,
            created_at_ms,
            plan: request.plan,
            sessions: samples.iter().map(|s| s.session_id.clone()).collect(),
            files: scanned,
            unparsable,
        };
        put_typed(
            self.store.as_ref(),
            RecordKind::Scan,
            &record.id,
            &record.id,
            &record,
        )
        .await?;

        log::info!(
            "scan {}: {} file(s), {} dead, {} uncertain, {} live",
            record.id,
            record.summary.files,
            record.summary.dead,
            record.summary.uncertain,
            record.summary.live
        );
        Ok(record)
    }

    pub async fn scan(&self, scan_id: &str) -> Result<ScanRecord> {
        Ok(require_typed(self.store.as_ref(), RecordKind::Scan, scan_id).await?)
    }

    pub async fn patch(&self, patch_id: &str) -> Result<Patch> {
        Ok(require_typed(self.store.as_ref(), RecordKind::Patch, patch_id).await?)
    }

    /// Build a patch from a scan's candidates against the files as they are now.
    ///
    /// Files that changed since the scan have their candidates discarded as stale.
    pub async fn generate_patch(
        &self,
        scan_id: &str,
        profile: SafetyProfile,
        selection: Option<BTreeSet<FunctionId>>,
    ) -> Result<Patch> {
        let scan = self.scan(scan_id).await?;

        let mut sources = BTreeMap::new();
        for file in &scan.files {
            let target = resolve_in_root(&scan.root, &file.path)?;
            match tokio::fs::read_to_string(&target).await {
                Ok(text) => {
                    sources.insert(file.path.clone(), text);
                }
                Err(err) => log::warn!("{}: unreadable, skipping ({err})", file.path),
            }
        }
        let candidates: Vec<_> = scan
            .candidates()
            .filter(|c| sources.contains_key(&c.file))
            .cloned()
            .collect();

        let patch = self
            .generator
            .generate(&PatchRequest {
                scan_id,
                profile,
                candidates: &candidates,
                sources: &sources,
                selection: selection.as_ref(),
            })
            .with_context(|| format!("Failed to generate {profile} patch for scan {scan_id}"))?;

        put_typed(
            self.store.as_ref(),
            RecordKind::Patch,
            &patch.id,
            scan_id,
            &patch,
        )
        .await?;
        log::info!(
            "patch {} ({profile}): {} file(s), {} function(s), {} bytes",
            patch.id,
            patch.files_touched(),
            patch.included_function_ids.len() + patch.higher_risk_function_ids.len(),
            patch.bytes_removed
        );
        Ok(patch)
    }

    pub async fn apply_patch(&self, patch_id: &str) -> Result<PatchApplication> {
        let patch = self.patch(patch_id).await?;
        let scan = self.scan(&patch.scan_id).await?;
        Ok(self.lifecycle(&scan.root).apply(&patch).await?)
    }

    /// Verify with the configured replay command
    pub async fn verify_patch(&self, patch_id: &str, cancel: CancelToken) -> Result<VerifyOutcome> {
        let Some((program, args)) = self.config.verify.replay_command.split_first() else {
            bail!("no replay command configured (verify.replay_command or REAPER_REPLAY_COMMAND)");
        };
        let replayer = CommandReplayer::new(program.clone(), args.to_vec(), self.config.script_filter());
        self.verify_patch_with(patch_id, &replayer, cancel).await
    }

    pub async fn verify_patch_with(
        &self,
        patch_id: &str,
        replayer: &dyn Replayer,
        cancel: CancelToken,
    ) -> Result<VerifyOutcome> {
        let patch = self.patch(patch_id).await?;
        let scan = self.scan(&patch.scan_id).await?;

        let live: Vec<LiveFunction> = scan.live_functions();
        let coverage_before = scan.coverage_by_file();
        let sources = scan.sources();
        let request = VerifyRequest {
            patch: &patch,
            plan: &scan.plan,
            live_before: &live,
            coverage_before: &coverage_before,
            unpatched_sources: &sources,
        };
        Ok(self
            .lifecycle(&scan.root)
            .verify(request, replayer, cancel)
            .await?)
    }

    pub async fn rollback_patch(&self, patch_id: &str) -> Result<PatchApplication> {
        let patch = self.patch(patch_id).await?;
        let scan = self.scan(&patch.scan_id).await?;
        Ok(self.lifecycle(&scan.root).rollback(patch_id).await?)
    }

    pub async fn patch_state(&self, patch_id: &str) -> Result<PatchState> {
        let patch = self.patch(patch_id).await?;
        let scan = self.scan(&patch.scan_id).await?;
        Ok(self.lifecycle(&scan.root).state(patch_id).await?)
    }

    /// Any stored record as raw JSON
    pub async fn show(&self, kind: RecordKind, id: &str) -> Result<Value> {
        self.store
            .get(kind, id)
            .await?
            .with_context(|| format!("{} not found: {id}", kind.as_str()))
    }

    pub async fn list(&self, scan_id: &str) -> Result<ScanListing> {
        self.scan(scan_id).await?;
        let store = self.store.as_ref();
        let mut listing = ScanListing {
            scan_id: scan_id.to_string(),
            ..ScanListing::default()
        };
        for id in store.list_by_scan(RecordKind::Patch, scan_id).await? {
            if let Some(patch) = get_typed::<Patch>(store, RecordKind::Patch, &id).await? {
                listing.patches.push(patch);
            }
        }
        for id in store.list_by_scan(RecordKind::Application, scan_id).await? {
            if let Some(app) = get_typed(store, RecordKind::Application, &id).await? {
                listing.applications.push(app);
            }
        }
        for id in store.list_by_scan(RecordKind::Verification, scan_id).await? {
            if let Some(result) =
                get_typed::<VerificationResult>(store, RecordKind::Verification, &id).await?
            {
                listing.verifications.push(result);
            }
        }
        Ok(listing)
    }
}

fn analyze_file(
    path: String,
    text: String,
    samples: &[CoverageSample],
    mapper: CoverageMapper,
    classifier: &DeadCodeClassifier,
) -> FileOutcome {
    let index = match index_source(&path, &text) {
        Ok(IndexOutcome::Indexed(index)) => index,
        Ok(IndexOutcome::Unparsable(file)) => return FileOutcome::Unparsable(file),
        Err(err) => {
            return FileOutcome::Unparsable(UnparsableFile {
                revision: revision_of(&text),
                file: path,
                reason: err.to_string(),
                error_offset: None,
            })
        }
    };

    let analysed = mapper.map(&index, samples).and_then(|mapping| {
        let candidates = classifier.classify(&index, &mapping)?;
        Ok((mapping, candidates))
    });
    let (mapping, candidates) = match analysed {
        Ok(result) => result,
        Err(err) => {
            return FileOutcome::Unparsable(UnparsableFile {
                file: path,
                revision: index.revision.clone(),
                reason: format!("coverage could not be mapped: {err}"),
                error_offset: None,
            })
        }
    };
    if samples.is_empty() {
        log::warn!("{path}: no coverage recorded, every function counts as unexecuted");
    }
    for dropped in &mapping.dropped {
        log::warn!(
            "{path}: dropped coverage range {}..{} from {} ({})",
            dropped.start_offset,
            dropped.end_offset,
            dropped.session_id,
            dropped.reason
        );
    }

    let live = candidates
        .iter()
        .filter(|c| c.verdict == Verdict::Live)
        .filter_map(|c| index.get(&c.function_range_id))
        .map(LiveFunction::from)
        .collect();

    FileOutcome::Scanned(ScannedFile {
        coverage_pct: mapping.script_coverage_pct(&index),
        revision: index.revision.clone(),
        sessions: mapping.sessions.clone(),
        dropped_ranges: mapping.dropped,
        path,
        source: text,
        candidates,
        live,
    })
}

fn scan_id(root: &Path, files: &[ScannedFile], created_at_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.to_string_lossy().as_bytes());
    for file in files {
        hasher.update(file.path.as_bytes());
        hasher.update(file.revision.as_bytes());
    }
    hasher.update(created_at_ms.to_le_bytes());
    hasher.update(SCAN_SEQUENCE.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("scan-{hex}")
}
