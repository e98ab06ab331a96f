use crate::error::{LifecycleError, Result};
use crate::file_io::{resolve_in_root, unix_now_ms, write_atomic};
use crate::lock::acquire_scan_lock;
use crate::replay::{CancelToken, ReplayRequest, Replayer};
use crate::state::{PatchApplication, PatchState, StateChange, Transition};
use crate::store::{get_typed, put_typed, RecordKind, Store};
use crate::verify::{evaluate, VerifyOutcome, VerifyRequest};
use reaper_analysis::{CoverageMapper, DEFAULT_BOUNDARY_TOLERANCE};
use reaper_patch::{apply_file_diff, parse_unified_diff, Patch, PatchError};
use reaper_source_index::revision_of;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub boundary_tolerance: usize,
    pub replay_timeout: Duration,
    pub coverage_drop_threshold_pct: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            boundary_tolerance: DEFAULT_BOUNDARY_TOLERANCE,
            replay_timeout: Duration::from_secs(600),
            coverage_drop_threshold_pct: 2.0,
        }
    }
}

/// Applies, verifies and rolls back patches against the files under one project root.
///
/// File mutation and state changes for a scan happen under that scan's lock. The replay
/// itself runs unlocked, so a long verification never holds up other scans or a rollback.
pub struct PatchLifecycle {
    root: PathBuf,
    lock_dir: PathBuf,
    store: Arc<dyn Store>,
    config: LifecycleConfig,
}

struct PlannedWrite {
    path: String,
    target: PathBuf,
    patched: String,
}

impl PatchLifecycle {
    pub fn new(
        root: impl Into<PathBuf>,
        lock_dir: impl Into<PathBuf>,
        store: Arc<dyn Store>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            root: root.into(),
            lock_dir: lock_dir.into(),
            store,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn application(&self, patch_id: &str) -> Result<Option<PatchApplication>> {
        get_typed(self.store.as_ref(), RecordKind::Application, patch_id).await
    }

    /// `Generated` for a patch that was never applied
    pub async fn state(&self, patch_id: &str) -> Result<PatchState> {
        Ok(self
            .application(patch_id)
            .await?
            .map_or(PatchState::Generated, |app| app.state))
    }

    /// Write every file of `patch`, or none of them.
    ///
    /// Each file must still be at the revision the patch was generated from, and the diff
    /// must reproduce the expected post-patch revision. The snapshot is stored before the
    /// first write.
    pub async fn apply(&self, patch: &Patch) -> Result<PatchApplication> {
        let _lock = acquire_scan_lock(&self.lock_dir, &patch.scan_id).await?;

        if let Some(existing) = self.application(&patch.id).await? {
            return Err(LifecycleError::InvalidTransition {
                patch_id: patch.id.clone(),
                from: existing.state,
                action: Transition::Apply.as_str(),
            });
        }

        let mut snapshot = BTreeMap::new();
        let mut writes = Vec::with_capacity(patch.files.len());
        for file in &patch.files {
            let target = resolve_in_root(&self.root, &file.path)?;
            let current = match tokio::fs::read_to_string(&target).await {
                Ok(text) => text,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(LifecycleError::conflict(&file.path, "file no longer exists"));
                }
                Err(err) => return Err(err.into()),
            };

            let actual = revision_of(&current);
            if actual != file.base_revision {
                return Err(LifecycleError::conflict(
                    &file.path,
                    format!(
                        "source changed since the patch was generated (expected {}, found {actual})",
                        file.base_revision
                    ),
                ));
            }

            let diff = parse_unified_diff(&file.diff)?
                .into_iter()
                .find(|d| d.path == file.path)
                .ok_or_else(|| PatchError::malformed(format!("no hunks for {}", file.path)))?;
            let patched = apply_file_diff(&current, &diff)?;
            if revision_of(&patched) != file.patched_revision {
                return Err(LifecycleError::conflict(
                    &file.path,
                    "diff does not reproduce the generated text",
                ));
            }

            snapshot.insert(file.path.clone(), current);
            writes.push(PlannedWrite {
                path: file.path.clone(),
                target,
                patched,
            });
        }

        let now = unix_now_ms();
        let application = PatchApplication {
            patch_id: patch.id.clone(),
            scan_id: patch.scan_id.clone(),
            root: self.root.display().to_string(),
            snapshot,
            applied_at_ms: now,
            state: PatchState::Applied,
            history: vec![
                StateChange {
                    state: PatchState::Generated,
                    at_ms: patch.created_at_ms,
                },
                StateChange {
                    state: PatchState::Applied,
                    at_ms: now,
                },
            ],
        };
        self.save_application(&application).await?;

        let mut written: Vec<&PlannedWrite> = Vec::with_capacity(writes.len());
        for write in &writes {
            if let Err(err) = write_atomic(&write.target, write.patched.as_bytes()).await {
                log::warn!(
                    "patch {}: writing {} failed ({err}); restoring {} file(s)",
                    patch.id,
                    write.path,
                    written.len()
                );
                for done in &written {
                    if let Some(original) = application.snapshot.get(&done.path) {
                        if let Err(restore_err) =
                            write_atomic(&done.target, original.as_bytes()).await
                        {
                            log::warn!("restoring {} failed: {restore_err}", done.path);
                        }
                    }
                }
                self.store
                    .delete(RecordKind::Application, &patch.id)
                    .await?;
                return Err(err);
            }
            written.push(write);
        }

        log::info!(
            "applied patch {} to {} file(s), {} bytes removed",
            patch.id,
            writes.len(),
            patch.bytes_removed
        );
        Ok(application)
    }

    /// Restore every touched file from the snapshot.
    ///
    /// Rolling back an already rolled-back patch succeeds without touching anything.
    pub async fn rollback(&self, patch_id: &str) -> Result<PatchApplication> {
        let scan_id = self
            .application(patch_id)
            .await?
            .ok_or_else(|| LifecycleError::NotApplied(patch_id.to_string()))?
            .scan_id;

        let _lock = acquire_scan_lock(&self.lock_dir, &scan_id).await?;
        let mut application = self
            .application(patch_id)
            .await?
            .ok_or_else(|| LifecycleError::NotApplied(patch_id.to_string()))?;

        if application.state == PatchState::RolledBack {
            log::debug!("patch {patch_id} already rolled back");
            return Ok(application);
        }
        let next = application
            .state
            .next(Transition::Rollback)
            .ok_or_else(|| LifecycleError::InvalidTransition {
                patch_id: patch_id.to_string(),
                from: application.state,
                action: Transition::Rollback.as_str(),
            })?;

        for (path, original) in &application.snapshot {
            let target = resolve_in_root(&self.root, path)?;
            write_atomic(&target, original.as_bytes()).await?;
        }

        application.record(next, unix_now_ms());
        self.save_application(&application).await?;
        log::info!(
            "rolled back patch {patch_id}, restored {} file(s)",
            application.snapshot.len()
        );
        Ok(application)
    }

    /// Replay the interaction plan against the patched files and judge the result.
    ///
    /// A regression is a result, not an error: the patch moves to `Regressed` and stays on
    /// disk until the caller rolls it back. A timeout or cancellation leaves it `Applied`.
    pub async fn verify(
        &self,
        request: VerifyRequest<'_>,
        replayer: &dyn Replayer,
        mut cancel: CancelToken,
    ) -> Result<VerifyOutcome> {
        let patch = request.patch;
        let application = self
            .application(&patch.id)
            .await?
            .ok_or_else(|| LifecycleError::NotApplied(patch.id.clone()))?;
        self.ensure_verifiable(&application)?;

        let replay_request = ReplayRequest {
            patch_id: patch.id.clone(),
            plan: request.plan.to_string(),
            root: self.root.clone(),
            files: application.files().map(str::to_string).collect(),
        };

        let timeout = self.config.replay_timeout;
        let replay = tokio::select! {
            res = tokio::time::timeout(timeout, replayer.replay(&replay_request)) => match res {
                Ok(outcome) => outcome?,
                Err(_) => {
                    log::warn!("patch {}: replay timed out after {timeout:?}", patch.id);
                    return Ok(VerifyOutcome::TimedOut { after: timeout });
                }
            },
            _ = cancel.cancelled() => {
                log::info!("patch {}: verification cancelled", patch.id);
                return Ok(VerifyOutcome::Cancelled);
            }
        };

        let result = evaluate(
            &request,
            &application.snapshot,
            &replay,
            CoverageMapper::new(self.config.boundary_tolerance),
            self.config.coverage_drop_threshold_pct,
        )?;

        let _lock = acquire_scan_lock(&self.lock_dir, &application.scan_id).await?;
        let mut application = self
            .application(&patch.id)
            .await?
            .ok_or_else(|| LifecycleError::NotApplied(patch.id.clone()))?;
        self.ensure_verifiable(&application)?;

        let transition = if result.passed {
            Transition::Pass
        } else {
            Transition::Regress
        };
        let next = application
            .state
            .next(transition)
            .ok_or_else(|| LifecycleError::InvalidTransition {
                patch_id: patch.id.clone(),
                from: application.state,
                action: transition.as_str(),
            })?;

        put_typed(
            self.store.as_ref(),
            RecordKind::Verification,
            &patch.id,
            &patch.scan_id,
            &result,
        )
        .await?;
        application.record(next, result.verified_at_ms);
        self.save_application(&application).await?;

        if result.passed {
            log::info!("patch {} verified", patch.id);
            Ok(VerifyOutcome::Passed(result))
        } else {
            log::warn!(
                "patch {} regressed: {} newly dead, {} replay failure(s)",
                patch.id,
                result.newly_dead_that_were_live.len(),
                result.replay_failures.len()
            );
            Ok(VerifyOutcome::Regressed(result))
        }
    }

    fn ensure_verifiable(&self, application: &PatchApplication) -> Result<()> {
        if application.state == PatchState::Applied {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition {
                patch_id: application.patch_id.clone(),
                from: application.state,
                action: "verify",
            })
        }
    }

    async fn save_application(&self, application: &PatchApplication) -> Result<()> {
        put_typed(
            self.store.as_ref(),
            RecordKind::Application,
            &application.patch_id,
            &application.scan_id,
            application,
        )
        .await
    }
}
