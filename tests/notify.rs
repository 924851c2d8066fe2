// ABOUTME: Integration tests for run notifications and hook scripts.
// ABOUTME: Tests hook discovery, execution, environment passing and fan-out failures.

use rollout::notify::{Fanout, HookEvent, HookNotifier, Notifier, NotifyError, RunNotification, TracingNotifier};
use rollout::status::DeploymentStatus;
use rollout::types::{RunId, ServiceName};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tempfile::TempDir;

fn create_hook(dir: &TempDir, event: HookEvent, script: &str) {
    let notifier = HookNotifier::new(dir.path());
    let hook_path = notifier.hook_path(event);
    fs::create_dir_all(hook_path.parent().unwrap()).unwrap();
    fs::write(&hook_path, script).unwrap();

    let mut perms = fs::metadata(&hook_path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&hook_path, perms).unwrap();
}

fn notification(status: DeploymentStatus, error: Option<&str>) -> RunNotification {
    RunNotification {
        service: ServiceName::new("testapp").unwrap(),
        run_id: RunId::new("0f3c9a7e21b4"),
        status,
        duration_ms: 1500,
        error: error.map(String::from),
    }
}

#[test]
fn hooks_live_under_the_project_directory() {
    let dir = TempDir::new().unwrap();
    let notifier = HookNotifier::new(dir.path());
    assert_eq!(
        notifier.hook_path(HookEvent::Failure),
        dir.path().join(".rollout/hooks/on-failure")
    );
}

/// Test: on-success hook sees the run details.
#[tokio::test]
async fn success_hook_receives_run_environment() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("seen.txt");
    create_hook(
        &dir,
        HookEvent::Success,
        &format!(
            "#!/bin/sh\necho \"$ROLLOUT_SERVICE $ROLLOUT_RUN_ID $ROLLOUT_STATUS $ROLLOUT_DURATION_MS\" > {}\n",
            out.display()
        ),
    );

    HookNotifier::new(dir.path())
        .notify(&notification(DeploymentStatus::Succeeded, None))
        .await
        .unwrap();

    let seen = fs::read_to_string(out).unwrap();
    assert_eq!(seen.trim(), "testapp 0f3c9a7e21b4 succeeded 1500");
}

/// Test: on-failure hook gets the error message.
#[tokio::test]
async fn failure_hook_receives_the_error() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("error.txt");
    create_hook(
        &dir,
        HookEvent::Failure,
        &format!("#!/bin/sh\nprintf '%s' \"$ROLLOUT_ERROR\" > {}\n", out.display()),
    );

    HookNotifier::new(dir.path())
        .notify(&notification(DeploymentStatus::Failed, Some("build failed with exit code 1")))
        .await
        .unwrap();

    assert_eq!(fs::read_to_string(out).unwrap(), "build failed with exit code 1");
}

/// Test: only the hook matching the outcome runs.
#[tokio::test]
async fn success_does_not_trigger_failure_hook() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("ran");
    create_hook(
        &dir,
        HookEvent::Failure,
        &format!("#!/bin/sh\ntouch {}\n", marker.display()),
    );

    HookNotifier::new(dir.path())
        .notify(&notification(DeploymentStatus::Succeeded, None))
        .await
        .unwrap();

    assert!(!marker.exists());
}

/// Test: a failing hook reports its exit code and stderr.
#[tokio::test]
async fn failing_hook_is_an_error() {
    let dir = TempDir::new().unwrap();
    create_hook(
        &dir,
        HookEvent::Failure,
        "#!/bin/sh\necho 'slack webhook returned 500' >&2\nexit 4\n",
    );

    let err = HookNotifier::new(dir.path())
        .notify(&notification(DeploymentStatus::Failed, Some("cancelled")))
        .await
        .unwrap_err();

    match err {
        NotifyError::HookFailed { hook, code, stderr } => {
            assert_eq!(hook, "on-failure");
            assert_eq!(code, Some(4));
            assert_eq!(stderr, "slack webhook returned 500");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

/// Test: non-executable hook fails to spawn.
#[tokio::test]
async fn non_executable_hook_fails_to_spawn() {
    let dir = TempDir::new().unwrap();
    create_hook(&dir, HookEvent::Success, "#!/bin/sh\nexit 0\n");
    let path = HookNotifier::new(dir.path()).hook_path(HookEvent::Success);
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

    let err = HookNotifier::new(dir.path())
        .notify(&notification(DeploymentStatus::Succeeded, None))
        .await
        .unwrap_err();

    assert!(matches!(err, NotifyError::HookSpawn { hook: "on-success", .. }));
}

/// Test: fan-out keeps delivering after one notifier fails.
#[tokio::test]
async fn fanout_collects_every_failure() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    for dir in [&first, &second] {
        create_hook(dir, HookEvent::Failure, "#!/bin/sh\nexit 1\n");
    }
    let fanout = Fanout::new()
        .with(Arc::new(TracingNotifier))
        .with(Arc::new(HookNotifier::new(first.path())))
        .with(Arc::new(HookNotifier::new(second.path())));
    assert_eq!(fanout.len(), 3);

    let err = fanout
        .notify(&notification(DeploymentStatus::Failed, Some("boom")))
        .await
        .unwrap_err();

    match err {
        NotifyError::Several(failures) => assert_eq!(failures.len(), 2),
        other => panic!("expected two failures, got {:?}", other),
    }
}

#[tokio::test]
async fn empty_fanout_always_succeeds() {
    let fanout = Fanout::new();
    assert!(fanout.is_empty());
    fanout
        .notify(&notification(DeploymentStatus::Succeeded, None))
        .await
        .unwrap();
}
