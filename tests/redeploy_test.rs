mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use ecs_hatch::config::DeployConfig;
use ecs_hatch::env::{DeployProgress, DeployStage, EnvChange, EnvEditor, ProgressFn, Redeployer};
use ecs_hatch::error::{Backoff, HatchError, ProviderError, ValidationError};
use ecs_hatch::model::Service;

use common::{definition, raw_service, service, task_definition_arn, FakeCloud, REGION};

fn cloud() -> Arc<FakeCloud> {
    let cloud = Arc::new(FakeCloud {
        services: vec![
            raw_service("prod", "svc-a", "app"),
            raw_service("prod", "svc-b", "app"),
            raw_service("prod", "svc-c", "app"),
            raw_service("prod", "other", "billing"),
        ],
        failing_updates: vec!["svc-b".to_string()],
        ..FakeCloud::default()
    });
    cloud.add_definition(definition("app", 1, "app", &[("LOG_LEVEL", "info"), ("PORT", "8080")]));
    cloud
}

async fn editor(cloud: &Arc<FakeCloud>) -> EnvEditor {
    EnvEditor::load(
        cloud.as_ref(),
        cloud.clone(),
        cloud.clone(),
        REGION,
        &task_definition_arn("app", 1),
        "app",
    )
    .await
    .unwrap()
}

fn redeployer(cloud: &Arc<FakeCloud>) -> Redeployer {
    Redeployer::new(
        cloud.clone(),
        &DeployConfig {
            poll_interval_secs: 1,
            timeout_secs: 60,
        },
    )
}

fn recorder() -> (ProgressFn, Arc<Mutex<Vec<DeployProgress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (Arc::new(move |p| sink.lock().unwrap().push(p)), seen)
}

fn svc(name: &str) -> Service {
    service("prod", name, "app")
}

#[tokio::test(start_paused = true)]
async fn test_forced_redeploy_without_changes_is_stable() {
    let cloud = cloud();
    let mut editor = editor(&cloud).await;
    let redeployer = redeployer(&cloud);
    assert!(!editor.is_dirty());

    let mut revisions = Vec::new();
    for _ in 0..2 {
        let (progress, _) = recorder();
        let report = editor
            .redeploy(&redeployer, vec![svc("svc-a")], true, progress, CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.registered);
        assert!(report.all_succeeded());
        revisions.push(report.task_definition);
    }

    assert_eq!(revisions, vec![task_definition_arn("app", 1); 2]);
    assert_eq!(cloud.registrations.load(Ordering::SeqCst), 0);
    let updates = cloud.updates.lock().unwrap().clone();
    assert_eq!(
        updates,
        vec![
            ("svc-a".to_string(), task_definition_arn("app", 1), true),
            ("svc-a".to_string(), task_definition_arn("app", 1), true),
        ]
    );
    assert_eq!(editor.task_definition().arn, task_definition_arn("app", 1));
}

#[tokio::test(start_paused = true)]
async fn test_one_failing_service_does_not_stop_the_others() {
    let cloud = cloud();
    let mut editor = editor(&cloud).await;
    editor.set("LOG_LEVEL", "debug").unwrap();
    assert_eq!(
        editor.diff(),
        vec![EnvChange::Modified {
            key: "LOG_LEVEL".to_string(),
            old: "info".to_string(),
            new: "debug".to_string(),
        }]
    );

    let (progress, seen) = recorder();
    let report = editor
        .redeploy(
            &redeployer(&cloud),
            vec![svc("svc-a"), svc("svc-b"), svc("svc-c")],
            false,
            progress,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.registered);
    assert_eq!(report.task_definition, task_definition_arn("app", 2));
    assert_eq!(cloud.registrations.load(Ordering::SeqCst), 1);
    assert!(!report.all_succeeded());

    let results: Vec<(&str, bool)> = report
        .outcomes
        .iter()
        .map(|o| (o.service.as_str(), o.result.is_ok()))
        .collect();
    assert_eq!(results, vec![("svc-a", true), ("svc-b", false), ("svc-c", true)]);

    let seen = seen.lock().unwrap();
    let last_stage = |name: &str| {
        seen.iter()
            .rev()
            .find(|p| p.service == name)
            .map(|p| p.stage.clone())
            .unwrap()
    };
    assert_eq!(last_stage("svc-a"), DeployStage::Steady);
    assert!(matches!(last_stage("svc-b"), DeployStage::Failed(_)));
    assert_eq!(last_stage("svc-c"), DeployStage::Steady);
    assert!(seen.iter().any(|p| p.service.is_empty()
        && p.stage
            == DeployStage::Registered {
                task_definition: task_definition_arn("app", 2),
            }));

    // The registered revision becomes the new baseline.
    assert!(!editor.is_dirty());
    assert_eq!(editor.task_definition().arn, task_definition_arn("app", 2));
    let registered = cloud.definitions.lock().unwrap()[&task_definition_arn("app", 2)].clone();
    assert_eq!(
        registered.containers[0].environment,
        vec![
            ("LOG_LEVEL".to_string(), "debug".to_string()),
            ("PORT".to_string(), "8080".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_throttled_status_poll_is_retried() {
    let cloud = cloud();
    cloud.throttled_polls.store(2, Ordering::SeqCst);
    let mut editor = editor(&cloud).await;

    let (progress, _) = recorder();
    let report = editor
        .redeploy(&redeployer(&cloud), vec![svc("svc-a")], true, progress, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.all_succeeded(), "outcomes: {:?}", report.outcomes);
    assert_eq!(cloud.throttled_polls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_throttling_beyond_the_budget_fails_the_service() {
    let cloud = cloud();
    cloud.throttled_polls.store(10, Ordering::SeqCst);
    let mut editor = editor(&cloud).await;
    let backoff = Backoff {
        max_attempts: 3,
        ..Backoff::default()
    };

    let (progress, _) = recorder();
    let report = editor
        .redeploy(
            &redeployer(&cloud).with_backoff(backoff),
            vec![svc("svc-a")],
            true,
            progress,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(
        report.outcomes[0].result,
        Err(HatchError::Provider(ProviderError::Transient { .. }))
    ));
    assert_eq!(cloud.throttled_polls.load(Ordering::SeqCst), 7);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_variable_loads_once_with_the_last_value() {
    let cloud = cloud();
    cloud.add_definition(definition("app", 1, "app", &[("PORT", "80"), ("LOG_LEVEL", "info"), ("PORT", "8080")]));
    let mut editor = editor(&cloud).await;

    let entries: Vec<(&str, Option<&str>)> = editor.entries().iter().map(|e| (e.key.as_str(), e.value())).collect();
    assert_eq!(entries, vec![("LOG_LEVEL", Some("info")), ("PORT", Some("8080"))]);
    assert!(!editor.is_dirty());

    editor.remove("PORT").unwrap();
    assert_eq!(editor.remove("PORT").unwrap_err(), ValidationError::UnknownKey("PORT".to_string()));
    assert_eq!(editor.diff(), vec![EnvChange::Removed { key: "PORT".to_string() }]);
}

#[tokio::test(start_paused = true)]
async fn test_redeploy_requests_are_validated() {
    let cloud = cloud();
    let mut editor = editor(&cloud).await;

    assert_eq!(
        editor.plan_redeploy(vec![svc("svc-a")], false).unwrap_err(),
        ValidationError::NothingToRedeploy
    );
    editor.add("FEATURE_X", "on").unwrap();
    assert_eq!(
        editor.plan_redeploy(Vec::new(), false).unwrap_err(),
        ValidationError::EmptyRedeploySelection
    );
    assert_eq!(
        editor.add("PORT", "9090").unwrap_err(),
        ValidationError::DuplicateKey("PORT".to_string())
    );

    let (progress, _) = recorder();
    let err = editor
        .redeploy(&redeployer(&cloud), Vec::new(), true, progress, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, HatchError::Validation(ValidationError::EmptyRedeploySelection));
    assert!(cloud.updates.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_candidates_share_the_task_family() {
    let cloud = cloud();
    let editor = editor(&cloud).await;
    let services: Vec<Service> = ["svc-a", "svc-b", "svc-c"]
        .into_iter()
        .map(svc)
        .chain(std::iter::once(service("prod", "other", "billing")))
        .collect();

    let names: Vec<String> = editor
        .redeploy_candidates(&services)
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["svc-a", "svc-b", "svc-c"]);
}
