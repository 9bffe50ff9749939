//! Step rollback through the public engine API.

use async_trait::async_trait;
use provision_common::engine::{run_service, Command, Service, StartFlag};
use provision_common::{ErrorKind, ProvisionError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Install,
}

#[derive(Default)]
struct Installer {
    log: Vec<String>,
    fail_revert_of: Option<usize>,
    cleaned_after: Option<usize>,
}

struct Part {
    index: usize,
    fails: bool,
}

#[async_trait]
impl Command<Installer> for Part {
    async fn execute(&mut self, svc: &mut Installer) -> Result<()> {
        svc.log.push(format!("execute #{}", self.index));
        if self.fails {
            return Err(ProvisionError::UpdateFirmwareFailed("disk on fire".to_string()));
        }
        Ok(())
    }

    async fn revert(&mut self, svc: &mut Installer) -> Result<()> {
        svc.log.push(format!("revert #{}", self.index));
        if svc.fail_revert_of == Some(self.index) {
            return Err(ProvisionError::UpdateFirmwareFailed("revert refused".to_string()));
        }
        Ok(())
    }

    fn error_message(&self) -> String {
        format!("part #{} could not be installed", self.index)
    }
}

#[async_trait]
impl Service for Installer {
    type Step = Step;

    fn first_step(&self) -> Step {
        Step::Install
    }

    fn step_name(_: Step) -> &'static str {
        "Install"
    }

    fn commands(&self, _: Step) -> Vec<Box<dyn Command<Self>>> {
        (0..3)
            .map(|index| Box::new(Part { index, fails: index == 2 }) as Box<dyn Command<Self>>)
            .collect()
    }

    fn next(&self, _: Step) -> Option<Step> {
        None
    }

    async fn cleanup_on_failure(&mut self, completed: &[Step], _: &ProvisionError) -> Result<()> {
        self.cleaned_after = Some(completed.len());
        Ok(())
    }
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn test_third_command_failure_reverts_first_two_newest_first() {
    let mut svc = Installer::default();
    let started = StartFlag::default();

    let err = run_service(&mut svc, &started).await.unwrap_err();

    assert_eq!(
        svc.log,
        vec!["execute #0", "execute #1", "execute #2", "revert #1", "revert #0"]
    );
    assert!(!svc.log.contains(&"revert #2".to_string()));

    let msg = err.to_string();
    assert!(msg.contains("part #2 could not be installed"), "{}", msg);
    assert!(msg.contains("disk on fire"), "{}", msg);
    assert_eq!(err.kind(), ErrorKind::UpdateFirmwareFailed);

    assert_eq!(svc.cleaned_after, Some(0));
    assert!(started.is_set());
}

#[tokio::test]
async fn test_failed_revert_does_not_stop_the_unwind() {
    let mut svc = Installer {
        fail_revert_of: Some(1),
        ..Default::default()
    };
    let err = run_service(&mut svc, &StartFlag::default()).await.unwrap_err();

    assert_eq!(&svc.log[svc.log.len() - 2..], ["revert #1", "revert #0"]);
    match &err {
        ProvisionError::StepFailed { revert_errors, .. } => {
            assert_eq!(revert_errors.len(), 1);
            assert_eq!(revert_errors[0].kind(), ErrorKind::StepRevertFailed);
            assert!(revert_errors[0].to_string().contains("revert refused"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::UpdateFirmwareFailed);
}

#[tokio::test]
async fn test_last_revert_failure_is_kept() {
    let mut svc = Installer {
        fail_revert_of: Some(0),
        ..Default::default()
    };
    let err = run_service(&mut svc, &StartFlag::default()).await.unwrap_err();

    match &err {
        ProvisionError::StepFailed { revert_errors, .. } => {
            assert_eq!(revert_errors.len(), 1);
            assert_eq!(revert_errors[0].kind(), ErrorKind::StepRevertFailed);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.to_string().contains("revert refused"));
}
