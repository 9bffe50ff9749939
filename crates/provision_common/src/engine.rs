//! Step/command execution with per-step rollback.
//!
//! A `Service` is a finite chain of steps. Each step is an ordered list of
//! `Command`s. If a command fails, the commands before it in the same step
//! are reverted newest first and the step fails. Earlier steps are not
//! unwound; the service gets a `cleanup_on_failure` call instead.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::error::{ProvisionError, Result};

/// One reversible unit of work against a service `S`.
#[async_trait]
pub trait Command<S: Send>: Send {
    async fn execute(&mut self, svc: &mut S) -> Result<()>;

    /// Undo `execute`. Only called after `execute` succeeded.
    async fn revert(&mut self, svc: &mut S) -> Result<()>;

    /// Static description of what failed, used in the step error.
    fn error_message(&self) -> String;

    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// A state machine made of named steps.
#[async_trait]
pub trait Service: Send + Sized {
    type Step: Copy + fmt::Debug + PartialEq + Send + Sync + 'static;

    fn first_step(&self) -> Self::Step;

    /// Diagnostics only.
    fn step_name(step: Self::Step) -> &'static str;

    fn commands(&self, step: Self::Step) -> Vec<Box<dyn Command<Self>>>;

    /// Successor of `step`, `None` when `step` is terminal.
    fn next(&self, step: Self::Step) -> Option<Self::Step>;

    /// Best-effort cleanup of side effects earlier steps left behind.
    async fn cleanup_on_failure(&mut self, completed: &[Self::Step], err: &ProvisionError) -> Result<()>;
}

/// Run the commands of `step` in order, reverting on failure.
pub async fn execute_step<S: Service>(svc: &mut S, step: S::Step) -> Result<()> {
    let step_name = S::step_name(step);
    let mut commands = svc.commands(step);
    debug!("[engine] {}: {} commands", step_name, commands.len());

    for i in 0..commands.len() {
        let err = match commands[i].execute(svc).await {
            Ok(()) => continue,
            Err(e) => e,
        };
        let message = commands[i].error_message();
        error!("[engine] {}: {} failed: {}", step_name, commands[i].name(), err);

        let mut revert_errors = Vec::new();
        for done in commands[..i].iter_mut().rev() {
            debug!("[engine] {}: reverting {}", step_name, done.name());
            if let Err(e) = done.revert(svc).await {
                warn!("[engine] {}: revert of {} failed: {}", step_name, done.name(), e);
                revert_errors.push(ProvisionError::StepRevertFailed {
                    command: done.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        return Err(ProvisionError::StepFailed {
            step: step_name,
            message,
            source: Box::new(err),
            revert_errors,
        });
    }
    Ok(())
}

/// Failure of a service run, with the steps that completed before it.
#[derive(Debug)]
pub struct DriveError<Step> {
    pub completed: Vec<Step>,
    pub error: ProvisionError,
}

/// Set once a service has begun its first step.
#[derive(Debug, Clone, Default)]
pub struct StartFlag(Arc<AtomicBool>);

impl StartFlag {
    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execute steps from `first_step` until a terminal step or a failure.
pub async fn drive<S: Service>(
    svc: &mut S,
    started: &StartFlag,
) -> std::result::Result<Vec<S::Step>, DriveError<S::Step>> {
    let mut completed: Vec<S::Step> = Vec::new();
    let mut current = Some(svc.first_step());
    started.mark();

    while let Some(step) = current {
        if completed.contains(&step) {
            let error = ProvisionError::InvalidRequest(format!(
                "step {} reached twice",
                S::step_name(step)
            ));
            return Err(DriveError { completed, error });
        }

        info!("[engine] step {}", S::step_name(step));
        if let Err(error) = execute_step(svc, step).await {
            return Err(DriveError { completed, error });
        }
        completed.push(step);
        current = svc.next(step);
    }
    Ok(completed)
}

/// Drive `svc` and run its cleanup hook if it fails.
pub async fn run_service<S: Service>(svc: &mut S, started: &StartFlag) -> Result<Vec<S::Step>> {
    match drive(svc, started).await {
        Ok(completed) => Ok(completed),
        Err(DriveError { completed, error }) => {
            if let Err(e) = svc.cleanup_on_failure(&completed, &error).await {
                warn!("[engine] cleanup after failure also failed: {}", e);
            }
            Err(error)
        }
    }
}

/// Bound `fut` by `limit`, reporting whether work had begun when it expired.
pub async fn with_deadline<F, T>(limit: Duration, started: &StartFlag, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) if started.is_set() => Err(ProvisionError::TimedOutWhileRunning(limit)),
        Err(_) => Err(ProvisionError::TimedOutBeforeStart(limit)),
    }
}
