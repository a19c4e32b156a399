//! Durability of rollout state across process restarts.
//!
//! Each rollctl invocation opens the redb file, runs one operation and
//! exits; these tests reopen the store between steps the same way.

use std::path::Path;
use std::sync::Arc;

use rollgate_engine::*;
use rollgate_state::*;

fn open(path: &Path) -> Engine {
    let store = StateStore::open(path).unwrap();
    Engine::new(Arc::new(store), EngineConfig::default())
}

async fn seed(engine: &Engine) {
    engine.create_team(Some("ops".into()), "ops").await.unwrap();
    engine
        .create_application(NewApplication {
            id: Some("os".into()),
            product_id: Some("io.example.os".into()),
            name: "os".into(),
            description: String::new(),
            team_id: "ops".into(),
        })
        .await
        .unwrap();
    engine
        .create_channel(NewChannel {
            id: Some("stable".into()),
            name: "stable".into(),
            color: String::new(),
            application_id: "os".into(),
            arch: Arch::Amd64,
            package_id: None,
        })
        .await
        .unwrap();
    engine
        .create_package(NewPackage {
            id: Some("os-2".into()),
            application_id: "os".into(),
            version: "2.0.0".into(),
            arch: Arch::Amd64,
            kind: PackageType::PlatformUpdate,
            url: "https://updates.example.com/".into(),
            filename: "os-2.gz".into(),
            description: String::new(),
            size: 1,
            hash: String::new(),
            action: None,
            extra_files: Vec::new(),
            channels_blacklist: Vec::new(),
        })
        .await
        .unwrap();
    let mut channel = engine.store().get_channel("stable").await.unwrap().unwrap();
    channel.package_id = Some("os-2".into());
    engine.update_channel(&channel).await.unwrap();
    engine
        .create_group(NewGroup {
            id: Some("prod".into()),
            name: "prod".into(),
            description: String::new(),
            application_id: "os".into(),
            channel_id: Some("stable".into()),
            policy: RolloutPolicy {
                safe_mode: false,
                max_updates_per_period: 1,
                ..RolloutPolicy::default()
            },
            track: Some("stable".into()),
        })
        .await
        .unwrap();
}

fn check_in(instance: &str, version: &str) -> CheckInRequest {
    CheckInRequest {
        instance_id: instance.into(),
        alias: None,
        ip: "192.0.2.1".into(),
        version: version.into(),
        app_id: "io.example.os".into(),
        track: "stable".into(),
        arch: "amd64".into(),
        events: Vec::new(),
        update_check: true,
        multi_manifest: false,
    }
}

#[tokio::test]
async fn grants_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rollgate.redb");

    {
        let engine = open(&path);
        seed(&engine).await;
        let response = engine.process_check_in(&check_in("node-1", "1.0.0")).await.unwrap();
        assert!(matches!(response.update, UpdateOutcome::Update { .. }));
    }

    // Fresh process: caches are cold, the quota must still see node-1's grant.
    let engine = open(&path);
    let response = engine.process_check_in(&check_in("node-2", "1.0.0")).await.unwrap();
    assert_eq!(
        response.update,
        UpdateOutcome::NoUpdate {
            reason: Denial::MaxUpdatesPerPeriodLimitReached
        }
    );

    let again = engine.process_check_in(&check_in("node-1", "1.0.0")).await.unwrap();
    let UpdateOutcome::Update { manifest, .. } = again.update else {
        panic!("expected redelivery, got {:?}", again.update);
    };
    assert_eq!(manifest[0].package.id, "os-2");
}

#[tokio::test]
async fn history_and_activity_are_appended_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rollgate.redb");

    {
        let engine = open(&path);
        seed(&engine).await;
        engine.process_check_in(&check_in("node-1", "1.0.0")).await.unwrap();
    }

    {
        let engine = open(&path);
        let mut req = check_in("node-1", "1.0.0");
        req.update_check = false;
        req.events = [(13, 1), (14, 1), (800, 1), (3, 2)]
            .into_iter()
            .map(|(event_type, event_result)| ProgressEvent {
                event_type,
                event_result,
                previous_version: None,
                error_code: None,
            })
            .collect();
        let response = engine.process_check_in(&req).await.unwrap();
        assert_eq!(response.instance.status, InstanceStatus::Complete);
        assert_eq!(response.instance.version, "2.0.0");
    }

    let engine = open(&path);
    let history = engine.instance_status_history("node-1", "os", 10).await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].status, InstanceStatus::Complete);

    let classes: Vec<ActivityClass> = engine
        .list_activity("os", 0)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.class)
        .collect();
    assert!(classes.contains(&ActivityClass::ChannelPackageUpdated));
    assert!(classes.contains(&ActivityClass::RolloutStarted));
    assert!(classes.contains(&ActivityClass::RolloutFinished));
    assert!(!engine.get_group("prod").await.unwrap().unwrap().rollout_in_progress);
}
