//! Concurrent flashing of one OS update.
//!
//! The kernel, root filesystem, stateful and optional mini-OS transfers are
//! independent, so they run as one group of concurrent tasks. The first
//! failure cancels the group's scope; tasks that already started run to
//! completion, tasks that have not started yet report `Cancelled`. Every task
//! reports exactly one outcome, and the control loop waits for all of them.
//!
//! Post-install steps touch shared device state and run afterwards, one at a
//! time, in a fixed order.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::blob::Artifact;
use crate::error::{ErrorKind, ProvisionError, Result};
use crate::flash::{ImageFlasher, StatefulInstaller};
use crate::partition::PartitionState;
use crate::progress::{ProgressReporter, ProgressSink};
use crate::wire::FlashResult;

/// Default interval between aggregate progress lines.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

type TaskBody = Box<dyn FnOnce(&ProgressSink, &CancellationToken) -> Result<u64> + Send>;

/// One blocking transfer of the group.
pub struct FlashTask {
    pub name: String,
    body: TaskBody,
}

impl FlashTask {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: FnOnce(&ProgressSink, &CancellationToken) -> Result<u64> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            body: Box::new(body),
        }
    }
}

struct TaskOutcome {
    name: String,
    result: Result<u64>,
}

/// Bytes written by each task of a successful group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub written: Vec<(String, u64)>,
}

impl GroupReport {
    pub fn total(&self) -> u64 {
        self.written.iter().map(|(_, n)| n).sum()
    }
}

// ============================================================================
// Post-install
// ============================================================================

/// Device operations that follow a successful transfer group.
#[async_trait]
pub trait DevicePostInstall: Send + Sync {
    /// Mount the new root read-only and run its `postinst` script.
    async fn run_postinst(&self, root: &str) -> Result<()>;

    /// Strip rootfs verification from the kernel in partition `kernel_num`.
    async fn disable_rootfs_verification(&self, kernel_num: u32) -> Result<()>;

    /// Ask firmware to clear the security module owner on next boot.
    async fn clear_tpm_owner(&self) -> Result<()>;
}

/// Arguments of the post-install steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostSteps {
    /// Newly written root partition
    pub root: String,
    /// Partition number of the newly written kernel
    pub kernel_num: u32,
    pub clear_tpm_owner: bool,
}

// ============================================================================
// Plan
// ============================================================================

/// Where a job writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashTarget {
    Partition(PathBuf),
    Stateful,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashJob {
    pub name: &'static str,
    pub artifact: Artifact,
    pub target: FlashTarget,
}

/// Every transfer of one update plus its post-install arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPlan {
    pub jobs: Vec<FlashJob>,
    pub post: PostSteps,
    pub clobber_stateful: bool,
}

impl FlashPlan {
    /// Build the plan that writes the inactive slot of `state`.
    pub fn new(
        state: &PartitionState,
        clobber_stateful: bool,
        clear_tpm_owner: bool,
        update_minios: bool,
    ) -> Self {
        let mut jobs = vec![
            FlashJob {
                name: "kernel",
                artifact: Artifact::Kernel,
                target: FlashTarget::Partition(state.inactive_kernel().into()),
            },
            FlashJob {
                name: "rootfs",
                artifact: Artifact::Root,
                target: FlashTarget::Partition(state.inactive_root().into()),
            },
            FlashJob {
                name: "stateful",
                artifact: Artifact::Stateful,
                target: FlashTarget::Stateful,
            },
        ];
        if update_minios {
            jobs.push(FlashJob {
                name: "minios",
                artifact: Artifact::MiniOs,
                target: FlashTarget::Partition(state.inactive_minios().into()),
            });
        }

        Self {
            jobs,
            post: PostSteps {
                root: state.inactive_root(),
                kernel_num: state.inactive.kernel,
                clear_tpm_owner,
            },
            clobber_stateful,
        }
    }

    /// Turn the plan into runnable tasks.
    pub fn tasks(&self, flasher: &ImageFlasher, installer: &StatefulInstaller) -> Vec<FlashTask> {
        self.jobs
            .iter()
            .map(|job| match &job.target {
                FlashTarget::Partition(path) => {
                    let flasher = flasher.clone();
                    let path = path.clone();
                    let artifact = job.artifact;
                    FlashTask::new(job.name, move |sink: &ProgressSink, cancel: &CancellationToken| {
                        flasher.flash(artifact, &path, sink, cancel)
                    })
                }
                FlashTarget::Stateful => {
                    let installer = installer.clone();
                    let clobber = self.clobber_stateful;
                    FlashTask::new(job.name, move |sink: &ProgressSink, cancel: &CancellationToken| {
                        installer.install(sink, cancel, clobber)
                    })
                }
            })
            .collect()
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Debug, Clone)]
pub struct FlashOrchestrator {
    progress_interval: Duration,
}

impl Default for FlashOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

impl FlashOrchestrator {
    pub fn new(progress_interval: Duration) -> Self {
        Self {
            progress_interval: progress_interval.max(Duration::from_millis(10)),
        }
    }

    /// Run `tasks` concurrently until every one of them has reported.
    pub async fn run_group(
        &self,
        tasks: Vec<FlashTask>,
        parent: &CancellationToken,
    ) -> Result<GroupReport> {
        let scope = parent.child_token();
        let launched = tasks.len();
        let (tx, mut rx) = mpsc::channel::<TaskOutcome>(launched.max(1));
        let mut reporter = ProgressReporter::new();

        for task in tasks {
            let sink = reporter.sink(&task.name);
            let tx = tx.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                let FlashTask { name, body } = task;
                let result = if scope.is_cancelled() {
                    Err(ProvisionError::Cancelled(format!("{} not started", name)))
                } else {
                    let blocking = tokio::task::spawn_blocking(move || body(&sink, &scope));
                    match blocking.await {
                        Ok(result) => result,
                        Err(e) => Err(ProvisionError::Io(io::Error::new(
                            io::ErrorKind::Other,
                            format!("{} task did not finish: {}", name, e),
                        ))),
                    }
                };
                // The receiver only goes away once every outcome is counted.
                let _ = tx.send(TaskOutcome { name, result }).await;
            });
        }
        drop(tx);

        let mut ticker = tokio::time::interval(self.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut first_error: Option<ProvisionError> = None;
        let mut report = GroupReport::default();

        while completed < launched {
            tokio::select! {
                outcome = rx.recv() => {
                    let Some(TaskOutcome { name, result }) = outcome else {
                        // Every sender is gone without reporting.
                        failed += launched - completed;
                        first_error.get_or_insert_with(|| ProvisionError::Cancelled(
                            "flash tasks exited without reporting".to_string(),
                        ));
                        break;
                    };
                    completed += 1;
                    match result {
                        Ok(written) => {
                            info!("[flash] {} done, {} bytes ({}/{})", name, written, completed, launched);
                            report.written.push((name, written));
                        }
                        Err(e) => {
                            failed += 1;
                            if e.kind() == ErrorKind::Cancelled {
                                warn!("[flash] {} {}", name, e);
                            } else {
                                error!("[flash] {} failed: {}", name, e);
                            }
                            if first_error.is_none() {
                                scope.cancel();
                                first_error = Some(e);
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    info!("[flash] {}", reporter.report());
                }
            }
        }

        info!("[flash] {}", reporter.report());

        match first_error {
            Some(first) => Err(ProvisionError::FlashGroupFailed {
                failed,
                total: launched,
                first: Box::new(first),
            }),
            None => Ok(report),
        }
    }

    /// Run the transfer group, then the post-install steps.
    pub async fn run(
        &self,
        tasks: Vec<FlashTask>,
        post_steps: &PostSteps,
        device: &dyn DevicePostInstall,
        cancel: &CancellationToken,
    ) -> Result<FlashResult> {
        let report = self.run_group(tasks, cancel).await?;
        info!("[flash] transferred {} bytes", report.total());

        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(
                "post-install skipped after cancellation".to_string(),
            ));
        }
        run_post_steps(post_steps, device).await
    }

    /// Execute `plan` with the given flasher and installer.
    pub async fn flash_device(
        &self,
        plan: &FlashPlan,
        flasher: &ImageFlasher,
        installer: &StatefulInstaller,
        device: &dyn DevicePostInstall,
        cancel: &CancellationToken,
    ) -> Result<FlashResult> {
        let tasks = plan.tasks(flasher, installer);
        self.run(tasks, &plan.post, device, cancel).await
    }
}

/// Post-install in order. Only the postinst failure is fatal.
pub async fn run_post_steps(steps: &PostSteps, device: &dyn DevicePostInstall) -> Result<FlashResult> {
    let mut result = FlashResult::default();

    info!("[postinst] running postinst on {}", steps.root);
    device.run_postinst(&steps.root).await.map_err(|e| match e {
        ProvisionError::PostInstallFailed(_) => e,
        other => ProvisionError::PostInstallFailed(other.to_string()),
    })?;

    info!("[postinst] disabling rootfs verification on kernel {}", steps.kernel_num);
    if let Err(e) = device.disable_rootfs_verification(steps.kernel_num).await {
        warn!("[postinst] disabling rootfs verification failed, will retry: {}", e);
        result.retry_disable_rootfs_verification = true;
    }

    if steps.clear_tpm_owner {
        info!("[postinst] clearing TPM owner");
        if let Err(e) = device.clear_tpm_owner().await {
            warn!("[postinst] clearing TPM owner failed, will retry: {}", e);
            result.retry_clear_tpm_owner = true;
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::resolve;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeDevice {
        calls: Mutex<Vec<String>>,
        fail_postinst: bool,
        fail_verification: bool,
        fail_tpm: bool,
    }

    impl FakeDevice {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DevicePostInstall for FakeDevice {
        async fn run_postinst(&self, root: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("postinst {}", root));
            if self.fail_postinst {
                return Err(ProvisionError::InvalidRequest("mount failed".to_string()));
            }
            Ok(())
        }

        async fn disable_rootfs_verification(&self, kernel_num: u32) -> Result<()> {
            self.calls.lock().unwrap().push(format!("verity {}", kernel_num));
            if self.fail_verification {
                return Err(ProvisionError::RootfsVerificationToggleFailed("x".to_string()));
            }
            Ok(())
        }

        async fn clear_tpm_owner(&self) -> Result<()> {
            self.calls.lock().unwrap().push("tpm".to_string());
            if self.fail_tpm {
                return Err(ProvisionError::SecurityModuleClearFailed("x".to_string()));
            }
            Ok(())
        }
    }

    fn ok_task(name: &str, bytes: u64) -> FlashTask {
        FlashTask::new(name, move |sink: &ProgressSink, _: &CancellationToken| {
            sink.set_total(bytes);
            sink.add(bytes);
            Ok(bytes)
        })
    }

    fn post(clear_tpm_owner: bool) -> PostSteps {
        PostSteps {
            root: "/dev/sda5".to_string(),
            kernel_num: 4,
            clear_tpm_owner,
        }
    }

    #[test]
    fn test_plan_for_slot_a() {
        let state = resolve("/dev/nvme0n1p3").unwrap();
        let plan = FlashPlan::new(&state, true, false, false);
        let targets: Vec<_> = plan.jobs.iter().map(|j| (j.name, j.target.clone())).collect();
        assert_eq!(
            targets,
            vec![
                ("kernel", FlashTarget::Partition("/dev/nvme0n1p4".into())),
                ("rootfs", FlashTarget::Partition("/dev/nvme0n1p5".into())),
                ("stateful", FlashTarget::Stateful),
            ]
        );
        assert_eq!(plan.post.root, "/dev/nvme0n1p5");
        assert_eq!(plan.post.kernel_num, 4);
    }

    #[test]
    fn test_plan_with_minios() {
        let state = resolve("/dev/sda5").unwrap();
        let plan = FlashPlan::new(&state, false, true, true);
        let minios = plan.jobs.iter().find(|j| j.name == "minios").unwrap();
        assert_eq!(minios.target, FlashTarget::Partition("/dev/sda9".into()));
        assert_eq!(minios.artifact, Artifact::MiniOs);
        assert!(plan.post.clear_tpm_owner);
    }

    #[tokio::test]
    async fn test_group_success_reports_every_task() {
        let orchestrator = FlashOrchestrator::new(Duration::from_millis(10));
        let report = orchestrator
            .run_group(
                vec![ok_task("kernel", 10), ok_task("rootfs", 20), ok_task("stateful", 30)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.written.len(), 3);
        assert_eq!(report.total(), 60);
    }

    #[tokio::test]
    async fn test_cancelled_scope_still_reports_every_task() {
        let parent = CancellationToken::new();
        parent.cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let tasks = (0..4)
            .map(|i| {
                let ran = ran.clone();
                FlashTask::new(&format!("t{}", i), move |_: &ProgressSink, _: &CancellationToken| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                })
            })
            .collect();

        let err = FlashOrchestrator::default()
            .run_group(tasks, &parent)
            .await
            .unwrap_err();

        match err {
            ProvisionError::FlashGroupFailed { failed, total, first } => {
                assert_eq!(failed, 4);
                assert_eq!(total, 4);
                assert!(first.is_cancelled());
            }
            other => panic!("unexpected error {}", other),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_post_steps_run_in_order() {
        let device = FakeDevice::default();
        let result = FlashOrchestrator::default()
            .run(vec![ok_task("kernel", 1)], &post(true), &device, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(device.calls(), vec!["postinst /dev/sda5", "verity 4", "tpm"]);
        assert_eq!(result, FlashResult::default());
    }

    #[tokio::test]
    async fn test_tpm_clear_skipped_unless_requested() {
        let device = FakeDevice::default();
        run_post_steps(&post(false), &device).await.unwrap();
        assert_eq!(device.calls(), vec!["postinst /dev/sda5", "verity 4"]);
    }

    #[tokio::test]
    async fn test_postinst_failure_is_fatal() {
        let device = FakeDevice {
            fail_postinst: true,
            ..Default::default()
        };
        let err = run_post_steps(&post(true), &device).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PostInstallFailed);
        assert_eq!(device.calls(), vec!["postinst /dev/sda5"]);
    }

    #[tokio::test]
    async fn test_retryable_post_steps_set_flags() {
        let device = FakeDevice {
            fail_verification: true,
            fail_tpm: true,
            ..Default::default()
        };
        let result = run_post_steps(&post(true), &device).await.unwrap();
        assert!(result.retry_disable_rootfs_verification);
        assert!(result.retry_clear_tpm_owner);
        assert_eq!(device.calls().len(), 3);
    }
}
