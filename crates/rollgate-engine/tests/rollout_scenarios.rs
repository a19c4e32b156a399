//! End-to-end rollout scenarios.
//!
//! Drives the engine against an in-memory store with a manual clock:
//! floor walks, policy throttles, the event state machine, catalog
//! integrity rules and check-in processing.

use std::sync::Arc;

use rollgate_engine::config::UNLIMITED_UPDATES_PER_PERIOD;
use rollgate_engine::*;
use rollgate_state::*;

// 2024-01-03 12:00:00 UTC, a Wednesday.
const NOW: u64 = 1_704_283_200;

struct Fleet {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
}

fn unlimited() -> RolloutPolicy {
    RolloutPolicy {
        safe_mode: false,
        max_updates_per_period: UNLIMITED_UPDATES_PER_PERIOD,
        ..RolloutPolicy::default()
    }
}

async fn fleet_with(policy: RolloutPolicy, config: EngineConfig) -> Fleet {
    let store: Arc<dyn UpdateStore> = Arc::new(StateStore::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(NOW));
    let engine = Arc::new(Engine::with_clock(store, config, clock.clone()));

    engine.create_team(Some("team".into()), "ops").await.unwrap();
    engine
        .create_application(NewApplication {
            id: Some("app".into()),
            product_id: Some("io.example.os".into()),
            name: "example os".into(),
            description: String::new(),
            team_id: "team".into(),
        })
        .await
        .unwrap();
    engine
        .create_channel(NewChannel {
            id: Some("stable".into()),
            name: "stable".into(),
            color: "#0af".into(),
            application_id: "app".into(),
            arch: Arch::Amd64,
            package_id: None,
        })
        .await
        .unwrap();
    engine
        .create_group(NewGroup {
            id: Some("prod".into()),
            name: "production".into(),
            description: String::new(),
            application_id: "app".into(),
            channel_id: Some("stable".into()),
            policy,
            track: Some("stable".into()),
        })
        .await
        .unwrap();

    Fleet { engine, clock }
}

async fn fleet(policy: RolloutPolicy) -> Fleet {
    fleet_with(policy, EngineConfig::default()).await
}

fn new_package(id: &str, version: &str, arch: Arch) -> NewPackage {
    NewPackage {
        id: Some(id.into()),
        application_id: "app".into(),
        version: version.into(),
        arch,
        kind: PackageType::PlatformUpdate,
        url: "https://updates.example.com/".into(),
        filename: format!("update-{version}.gz"),
        description: String::new(),
        size: 1024,
        hash: "c2hh".into(),
        action: None,
        extra_files: Vec::new(),
        channels_blacklist: Vec::new(),
    }
}

impl Fleet {
    async fn package(&self, id: &str, version: &str) -> Package {
        self.engine
            .create_package(new_package(id, version, Arch::Amd64))
            .await
            .unwrap()
    }

    async fn target(&self, package_id: &str) {
        let mut channel = self.engine.store().get_channel("stable").await.unwrap().unwrap();
        channel.package_id = Some(package_id.into());
        self.engine.update_channel(&channel).await.unwrap();
    }

    async fn floor(&self, package_id: &str) {
        self.engine
            .add_channel_package_floor("stable", package_id, "schema migration")
            .await
            .unwrap();
    }

    /// Floors 1000 and 2000, target 3000.
    async fn with_floors(&self) {
        self.package("p1000", "1000.0.0").await;
        self.package("p2000", "2000.0.0").await;
        self.package("p3000", "3000.0.0").await;
        self.floor("p1000").await;
        self.floor("p2000").await;
        self.target("p3000").await;
    }

    async fn check(&self, instance: &str, version: &str) -> EngineResult<Package> {
        self.engine.get_update_package(&registration(instance, version)).await
    }

    async fn report(&self, instance: &str, event_type: u32, event_result: u32) -> EngineResult<Option<InstanceStatus>> {
        self.engine
            .register_event(&EventReport {
                instance_id: instance.into(),
                app_id: "app".into(),
                group_id: "prod".into(),
                event: ProgressEvent {
                    event_type,
                    event_result,
                    previous_version: None,
                    error_code: None,
                },
            })
            .await
    }

    async fn complete(&self, instance: &str) {
        for (event_type, event_result) in [(13, 1), (14, 1), (800, 1), (3, 2)] {
            self.report(instance, event_type, event_result).await.unwrap();
        }
    }

    async fn row(&self, instance: &str) -> InstanceApplication {
        self.engine
            .store()
            .get_instance_application(instance, "app")
            .await
            .unwrap()
            .unwrap()
    }

    async fn group(&self) -> Group {
        self.engine.get_group("prod").await.unwrap().unwrap()
    }

    async fn activity(&self) -> Vec<ActivityClass> {
        self.engine
            .list_activity("app", 0)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.class)
            .collect()
    }
}

fn registration(instance: &str, version: &str) -> InstanceRegistration {
    InstanceRegistration {
        instance_id: instance.into(),
        alias: None,
        ip: "10.0.0.7".into(),
        version: version.into(),
        app_id: "io.example.os".into(),
        group_id: "prod".into(),
    }
}

fn check_in(instance: &str, version: &str) -> CheckInRequest {
    CheckInRequest {
        instance_id: instance.into(),
        alias: None,
        ip: "10.0.0.7".into(),
        version: version.into(),
        app_id: "io.example.os".into(),
        track: "stable".into(),
        arch: "x86_64".into(),
        events: Vec::new(),
        update_check: true,
        multi_manifest: false,
    }
}

fn denial<T: std::fmt::Debug>(result: EngineResult<T>) -> Denial {
    result.unwrap_err().denial().expect("expected a flow-control answer")
}

// ── Floors ───────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_instances_stop_at_each_floor() {
    let f = fleet(unlimited()).await;
    f.with_floors().await;

    assert_eq!(f.check("i-500", "500.0.0").await.unwrap().version, "1000.0.0");
    assert_eq!(f.check("i-1500", "1500.0.0").await.unwrap().version, "2000.0.0");
    assert_eq!(f.check("i-2500", "2500.0.0").await.unwrap().version, "3000.0.0");

    assert_eq!(
        f.row("i-500").await.last_update_version.as_deref(),
        Some("1000.0.0")
    );
}

#[tokio::test]
async fn scenario_b_target_can_be_a_floor() {
    let f = fleet(unlimited()).await;
    f.with_floors().await;
    f.floor("p3000").await;

    let required = f.engine.required_floors("stable", "2500.0.0").await.unwrap();
    assert_eq!(required.floors.len(), 1);
    assert_eq!(required.floors[0].package.id, "p3000");
    assert!(!required.has_more);

    assert_eq!(f.check("i-2500", "2500.0.0").await.unwrap().version, "3000.0.0");
}

#[tokio::test]
async fn single_manifest_client_walks_floor_by_floor() {
    let f = fleet(unlimited()).await;
    f.with_floors().await;

    let mut version = "500.0.0".to_string();
    let mut delivered = Vec::new();
    for _ in 0..3 {
        let package = f.check("walker", &version).await.unwrap();
        f.complete("walker").await;
        assert_eq!(f.row("walker").await.version, package.version);
        version = package.version.clone();
        delivered.push(package.version);
    }
    assert_eq!(delivered, vec!["1000.0.0", "2000.0.0", "3000.0.0"]);
    assert_eq!(
        denial(f.check("walker", &version).await),
        Denial::NoUpdatePackageAvailable
    );
}

#[tokio::test]
async fn multi_manifest_check_in_gets_floors_and_target() {
    let f = fleet(unlimited()).await;
    f.with_floors().await;

    let mut req = check_in("m-1", "500.0.0");
    req.multi_manifest = true;
    let response = f.engine.process_check_in(&req).await.unwrap();

    let UpdateOutcome::Update {
        manifest,
        has_more_floors,
    } = response.update
    else {
        panic!("expected an update, got {:?}", response.update);
    };
    let versions: Vec<&str> = manifest.iter().map(|e| e.package.version.as_str()).collect();
    assert_eq!(versions, vec!["1000.0.0", "2000.0.0", "3000.0.0"]);
    assert!(manifest[0].is_floor && manifest[1].is_floor);
    assert!(manifest[2].is_target && !manifest[2].is_floor);
    assert!(!has_more_floors);
    assert_eq!(
        response.instance.last_update_version.as_deref(),
        Some("3000.0.0")
    );

    // The client installs everything and reports back in one go.
    req.events = [(13, 1), (14, 1), (800, 1), (3, 2)]
        .into_iter()
        .map(|(event_type, event_result)| ProgressEvent {
            event_type,
            event_result,
            previous_version: Some("500.0.0".into()),
            error_code: None,
        })
        .collect();
    let response = f.engine.process_check_in(&req).await.unwrap();
    assert!(response.events.iter().all(|ack| ack.rejected.is_none()));
    assert_eq!(response.events[3].status, Some(InstanceStatus::Complete));
    assert_eq!(response.instance.version, "3000.0.0");
    assert_eq!(
        response.update,
        UpdateOutcome::NoUpdate {
            reason: Denial::NoUpdatePackageAvailable
        }
    );
}

#[tokio::test]
async fn floor_cap_bounds_the_manifest() {
    let config = EngineConfig {
        max_floors_per_response: 2,
        ..EngineConfig::default()
    };
    let f = fleet_with(unlimited(), config).await;
    f.with_floors().await;
    f.package("p2500", "2500.0.0").await;
    f.floor("p2500").await;

    let mut req = check_in("m-1", "500.0.0");
    req.multi_manifest = true;
    let response = f.engine.process_check_in(&req).await.unwrap();
    let UpdateOutcome::Update {
        manifest,
        has_more_floors,
    } = response.update
    else {
        panic!("expected an update");
    };
    assert_eq!(manifest.len(), 2);
    assert!(has_more_floors);
    assert!(manifest.iter().all(|e| !e.is_target));
    assert_eq!(
        response.instance.last_update_version.as_deref(),
        Some("2000.0.0")
    );
}

// ── Policy ───────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_c_disabled_updates_deny_everyone() {
    let f = fleet(RolloutPolicy {
        updates_enabled: false,
        ..unlimited()
    })
    .await;
    f.with_floors().await;

    for (instance, version) in [("a", "1.0.0"), ("b", "1500.0.0"), ("c", "2999.9.9")] {
        assert_eq!(denial(f.check(instance, version).await), Denial::UpdatesDisabled);
        assert_eq!(f.row(instance).await.status, InstanceStatus::OnHold);
    }
}

#[tokio::test]
async fn scenario_d_up_to_date_instance() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    assert_eq!(
        denial(f.check("fresh", "3000.0.0").await),
        Denial::NoUpdatePackageAvailable
    );
    assert_eq!(f.row("fresh").await.status, InstanceStatus::Undefined);

    assert_eq!(f.check("upgraded", "2500.0.0").await.unwrap().id, "p3000");
    assert!(f.group().await.rollout_in_progress);
    // Installed out of band; the next check-in closes the grant.
    assert_eq!(
        denial(f.check("upgraded", "3000.0.0").await),
        Denial::NoUpdatePackageAvailable
    );
    let row = f.row("upgraded").await;
    assert_eq!(row.status, InstanceStatus::Complete);
    assert_eq!(row.version, "3000.0.0");
    assert!(!f.group().await.rollout_in_progress);
}

#[tokio::test]
async fn granted_update_is_redelivered_without_policy_checks() {
    let f = fleet(RolloutPolicy {
        safe_mode: false,
        max_updates_per_period: 1,
        ..RolloutPolicy::default()
    })
    .await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    let first = f.check("a", "1.0.0").await.unwrap();
    let granted_at = f.row("a").await.last_update_granted_at;
    assert_eq!(
        denial(f.check("b", "1.0.0").await),
        Denial::MaxUpdatesPerPeriodLimitReached
    );

    f.clock.advance(30);
    let again = f.check("a", "1.0.0").await.unwrap();
    assert_eq!(again.id, first.id);
    let row = f.row("a").await;
    assert_eq!(row.status, InstanceStatus::UpdateGranted);
    assert_eq!(row.last_update_granted_at, granted_at);
    let history = f.engine.instance_status_history("a", "app", 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn period_quota_then_concurrency_cap() {
    let f = fleet(RolloutPolicy {
        safe_mode: false,
        max_updates_per_period: 2,
        ..RolloutPolicy::default()
    })
    .await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    f.check("a", "1.0.0").await.unwrap();
    f.check("b", "1.0.0").await.unwrap();
    assert_eq!(
        denial(f.check("c", "1.0.0").await),
        Denial::MaxUpdatesPerPeriodLimitReached
    );
    assert_eq!(f.row("c").await.status, InstanceStatus::OnHold);

    // A new period, but both grants are still running.
    f.clock.advance(1_000);
    assert_eq!(
        denial(f.check("c", "1.0.0").await),
        Denial::MaxConcurrentUpdatesLimitReached
    );

    f.complete("a").await;
    assert_eq!(f.check("c", "1.0.0").await.unwrap().id, "p3000");
}

#[tokio::test]
async fn safe_mode_canaries_a_single_instance() {
    let f = fleet(RolloutPolicy {
        safe_mode: true,
        max_updates_per_period: 5,
        ..RolloutPolicy::default()
    })
    .await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    f.check("canary", "1.0.0").await.unwrap();
    assert_eq!(
        denial(f.check("second", "1.0.0").await),
        Denial::MaxUpdatesPerPeriodLimitReached
    );

    f.complete("canary").await;
    assert_eq!(f.check("second", "1.0.0").await.unwrap().id, "p3000");
    assert_eq!(f.check("third", "1.0.0").await.unwrap().id, "p3000");
}

#[tokio::test]
async fn safe_mode_canary_passes_through_a_floor() {
    let f = fleet(RolloutPolicy {
        safe_mode: true,
        max_updates_per_period: 5,
        ..RolloutPolicy::default()
    })
    .await;
    f.package("p1000", "1000.0.0").await;
    f.package("p3000", "3000.0.0").await;
    f.floor("p1000").await;
    f.target("p3000").await;

    assert_eq!(f.check("canary", "500.0.0").await.unwrap().id, "p1000");
    assert_eq!(
        denial(f.check("second", "500.0.0").await),
        Denial::MaxUpdatesPerPeriodLimitReached
    );

    // Landing on the floor ends the canary attempt without finishing the rollout.
    f.complete("canary").await;
    let canary = f.row("canary").await;
    assert_eq!(canary.version, "1000.0.0");
    assert_eq!(canary.status, InstanceStatus::Complete);
    assert!(f.group().await.rollout_in_progress);

    assert_eq!(f.check("second", "500.0.0").await.unwrap().id, "p1000");
    assert_eq!(f.check("canary", "1000.0.0").await.unwrap().id, "p3000");
    assert_eq!(
        f.row("canary").await.last_update_target.as_deref(),
        Some("3000.0.0")
    );

    f.complete("canary").await;
    assert_eq!(f.row("canary").await.version, "3000.0.0");
    assert!(!f.activity().await.contains(&ActivityClass::RolloutFailed));
}

#[tokio::test]
async fn timed_out_canary_disables_the_group() {
    let f = fleet(RolloutPolicy {
        safe_mode: true,
        max_updates_per_period: 5,
        update_timeout_secs: 60,
        ..RolloutPolicy::default()
    })
    .await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    f.check("canary", "1.0.0").await.unwrap();
    f.report("canary", 13, 1).await.unwrap();

    f.clock.advance(1_000);
    assert_eq!(
        denial(f.check("second", "1.0.0").await),
        Denial::MaxTimedOutUpdatesLimitReached
    );
    assert!(!f.group().await.policy.updates_enabled);
    assert!(f.activity().await.contains(&ActivityClass::RolloutFailed));

    assert_eq!(denial(f.check("third", "1.0.0").await), Denial::UpdatesDisabled);
}

#[tokio::test]
async fn missing_target_is_logged_once() {
    let f = fleet(unlimited()).await;

    assert_eq!(denial(f.check("a", "1.0.0").await), Denial::NoPackageFound);
    assert_eq!(denial(f.check("b", "1.0.0").await), Denial::NoPackageFound);

    let classes = f.activity().await;
    assert_eq!(classes, vec![ActivityClass::PackageNotFound]);
}

#[tokio::test]
async fn in_flight_instance_is_told_to_wait() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    f.check("a", "1.0.0").await.unwrap();
    f.report("a", 13, 1).await.unwrap();
    assert_eq!(
        denial(f.check("a", "1.0.0").await),
        Denial::UpdateInProgressOnInstance
    );
}

// ── Events ───────────────────────────────────────────────────────

#[tokio::test]
async fn events_without_a_grant_are_refused() {
    let f = fleet(unlimited()).await;
    f.engine
        .register_instance(&registration("idle", "1.0.0"))
        .await
        .unwrap();

    assert_eq!(denial(f.report("idle", 13, 1).await), Denial::NoUpdateInProgress);
    assert!(matches!(
        f.report("idle", 13, 2).await,
        Err(EngineError::InvalidEventTypeOrResult {
            event_type: 13,
            event_result: 2
        })
    ));
}

#[tokio::test]
async fn regressions_are_ignored_and_failures_recorded() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;
    f.check("a", "1.0.0").await.unwrap();

    assert_eq!(f.report("a", 800, 1).await.unwrap(), Some(InstanceStatus::Installed));
    assert_eq!(f.report("a", 13, 1).await.unwrap(), None);
    assert_eq!(f.report("a", 3, 1).await.unwrap(), None);
    assert_eq!(f.row("a").await.status, InstanceStatus::Installed);

    assert_eq!(f.report("a", 3, 0).await.unwrap(), Some(InstanceStatus::Error));
    let row = f.row("a").await;
    assert!(!row.update_in_progress);
    assert_eq!(row.version, "1.0.0");
    assert!(f.group().await.policy.updates_enabled);
    assert!(f.activity().await.contains(&ActivityClass::InstanceUpdateFailed));

    let history = f.engine.instance_status_history("a", "app", 10).await.unwrap();
    let statuses: Vec<InstanceStatus> = history.iter().map(|h| h.status).collect();
    assert_eq!(
        statuses,
        vec![
            InstanceStatus::Error,
            InstanceStatus::Installed,
            InstanceStatus::UpdateGranted
        ]
    );
}

#[tokio::test]
async fn completing_the_last_instance_finishes_the_rollout() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    f.check("a", "1.0.0").await.unwrap();
    f.check("b", "1.0.0").await.unwrap();
    f.complete("a").await;
    assert!(f.group().await.rollout_in_progress);

    f.complete("b").await;
    assert!(!f.group().await.rollout_in_progress);
    let classes = f.activity().await;
    assert_eq!(classes[0], ActivityClass::RolloutFinished);
    assert!(classes.contains(&ActivityClass::RolloutStarted));
}

// ── Catalog integrity ────────────────────────────────────────────

#[tokio::test]
async fn floor_then_blacklist_is_rejected() {
    let f = fleet(unlimited()).await;
    let mut package = f.package("p1000", "1000.0.0").await;
    f.floor("p1000").await;

    package.channels_blacklist.push("stable".into());
    assert!(matches!(
        f.engine.update_package(&package).await,
        Err(EngineError::PackageIsFloor)
    ));
    let stored = f.engine.store().get_package("p1000").await.unwrap().unwrap();
    assert!(stored.channels_blacklist.is_empty());
}

#[tokio::test]
async fn blacklist_then_floor_is_rejected() {
    let f = fleet(unlimited()).await;
    let mut new = new_package("p2000", "2000.0.0", Arch::Amd64);
    new.channels_blacklist.push("stable".into());
    f.engine.create_package(new).await.unwrap();

    assert!(matches!(
        f.engine
            .add_channel_package_floor("stable", "p2000", "migration")
            .await,
        Err(EngineError::BlacklistedPackage)
    ));
    assert!(f.engine.list_channel_floors("stable").await.unwrap().is_empty());

    let mut channel = f.engine.store().get_channel("stable").await.unwrap().unwrap();
    channel.package_id = Some("p2000".into());
    assert!(matches!(
        f.engine.update_channel(&channel).await,
        Err(EngineError::BlacklistedPackage)
    ));
}

#[tokio::test]
async fn cannot_blacklist_the_channel_target() {
    let f = fleet(unlimited()).await;
    let mut package = f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    package.channels_blacklist.push("stable".into());
    assert!(matches!(
        f.engine.update_package(&package).await,
        Err(EngineError::BlacklistingTargetChannel)
    ));
}

#[tokio::test]
async fn architecture_must_match_the_channel() {
    let f = fleet(unlimited()).await;
    f.engine
        .create_package(new_package("arm", "3000.0.0", Arch::Aarch64))
        .await
        .unwrap();

    let mut channel = f.engine.store().get_channel("stable").await.unwrap().unwrap();
    channel.package_id = Some("arm".into());
    assert!(matches!(
        f.engine.update_channel(&channel).await,
        Err(EngineError::ArchMismatch { .. })
    ));
    assert!(matches!(
        f.engine.add_channel_package_floor("stable", "arm", "x").await,
        Err(EngineError::ArchMismatch { .. })
    ));
}

#[tokio::test]
async fn invalid_references_are_rejected() {
    let f = fleet(unlimited()).await;
    assert!(matches!(
        f.engine
            .create_package(new_package("bad", "not.a.version", Arch::Amd64))
            .await,
        Err(EngineError::InvalidSemver(_))
    ));
    assert!(matches!(
        f.engine
            .create_group(NewGroup {
                id: None,
                name: "berlin".into(),
                description: String::new(),
                application_id: "app".into(),
                channel_id: None,
                policy: RolloutPolicy {
                    office_hours: true,
                    timezone: Some("Europe/Atlantis".into()),
                    ..RolloutPolicy::default()
                },
                track: None,
            })
            .await,
        Err(EngineError::InvalidTimezone(_))
    ));
    assert!(matches!(
        f.engine.register_instance(&registration("a", "1.0.0")).await.map(|_| ()),
        Ok(())
    ));
    let mut bad_ip = registration("b", "1.0.0");
    bad_ip.ip = "300.1.1.1".into();
    assert!(matches!(
        f.engine.register_instance(&bad_ip).await,
        Err(EngineError::InvalidIp(_))
    ));
    let mut wrong_app = registration("c", "1.0.0");
    wrong_app.app_id = "io.example.other".into();
    assert!(matches!(
        f.engine.register_instance(&wrong_app).await,
        Err(EngineError::InvalidApplicationOrGroup)
    ));
}

#[tokio::test]
async fn renaming_a_team_keeps_its_creation_time() {
    let f = fleet(unlimited()).await;
    let before = f.engine.store().get_team("team").await.unwrap().unwrap();

    f.clock.advance(3_600);
    let renamed = f
        .engine
        .update_team(&Team {
            name: "platform".into(),
            created_at: NOW + 3_600,
            ..before.clone()
        })
        .await
        .unwrap();

    assert_eq!(renamed.name, "platform");
    assert_eq!(renamed.created_at, before.created_at);
    assert_eq!(f.engine.store().get_team("team").await.unwrap(), Some(renamed));
    assert!(matches!(
        f.engine
            .update_team(&Team {
                id: "ghost".into(),
                ..before
            })
            .await,
        Err(EngineError::InvalidTeam(_))
    ));
}

// ── Instances and check-ins ──────────────────────────────────────

#[tokio::test]
async fn check_in_does_not_undo_reported_progress() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    f.check("node", "1.0.0").await.unwrap();
    f.report("node", 13, 1).await.unwrap();

    let mut late = check_in("node", "1.0.0");
    late.update_check = false;
    f.engine.process_check_in(&late).await.unwrap();

    let row = f.row("node").await;
    assert_eq!(row.status, InstanceStatus::Downloading);
    assert!(row.update_in_progress);
    assert_eq!(row.last_update_version.as_deref(), Some("3000.0.0"));
}

#[tokio::test]
async fn moving_group_resets_status() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;
    f.check("a", "1.0.0").await.unwrap();

    f.engine
        .create_group(NewGroup {
            id: Some("canary".into()),
            name: "canary".into(),
            description: String::new(),
            application_id: "app".into(),
            channel_id: Some("stable".into()),
            policy: unlimited(),
            track: Some("canary".into()),
        })
        .await
        .unwrap();
    let mut req = registration("a", "1.0.0");
    req.group_id = "canary".into();
    let record = f.engine.register_instance(&req).await.unwrap();

    assert_eq!(record.application.group_id, "canary");
    assert_eq!(record.application.status, InstanceStatus::Undefined);
    assert!(!record.application.update_in_progress);
}

#[tokio::test]
async fn tracks_resolve_per_architecture_and_follow_new_groups() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    let response = f.engine.process_check_in(&check_in("a", "1.0.0")).await.unwrap();
    assert_eq!(response.group_id, "prod");

    let mut arm = check_in("a", "1.0.0");
    arm.arch = "arm64".into();
    assert!(matches!(
        f.engine.process_check_in(&arm).await,
        Err(EngineError::InvalidApplicationOrGroup)
    ));

    let mut beta = check_in("b", "1.0.0");
    beta.track = "beta".into();
    assert!(matches!(
        f.engine.process_check_in(&beta).await,
        Err(EngineError::InvalidApplicationOrGroup)
    ));
    f.engine
        .create_group(NewGroup {
            id: Some("beta-group".into()),
            name: "beta".into(),
            description: String::new(),
            application_id: "app".into(),
            channel_id: Some("stable".into()),
            policy: unlimited(),
            track: Some("beta".into()),
        })
        .await
        .unwrap();
    let response = f.engine.process_check_in(&beta).await.unwrap();
    assert_eq!(response.group_id, "beta-group");
}

#[tokio::test]
async fn ping_without_update_check_only_registers() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    let mut ping = check_in("a", "1.0.0");
    ping.update_check = false;
    let response = f.engine.process_check_in(&ping).await.unwrap();
    assert_eq!(response.update, UpdateOutcome::NotRequested);
    assert_eq!(response.instance.status, InstanceStatus::Undefined);
    assert_eq!(response.instance.last_check_at, NOW);
}

#[tokio::test]
async fn rejected_events_do_not_fail_the_check_in() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    let mut req = check_in("a", "1.0.0");
    req.events.push(ProgressEvent {
        event_type: 13,
        event_result: 1,
        previous_version: None,
        error_code: None,
    });
    let response = f.engine.process_check_in(&req).await.unwrap();
    assert!(response.events[0].rejected.is_some());
    assert!(matches!(response.update, UpdateOutcome::Update { .. }));
}

#[tokio::test]
async fn synthetic_instances_are_left_out_of_stats() {
    let f = fleet(unlimited()).await;
    f.engine
        .register_instance(&registration("real-1", "1.0.0"))
        .await
        .unwrap();
    f.engine
        .register_instance(&registration("{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}", "1.0.0"))
        .await
        .unwrap();

    let stats = f
        .engine
        .group_instances_stats("prod", StatsWindow::Hour)
        .await
        .unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.undefined, 1);

    let breakdown = f.engine.group_version_breakdown("prod").await.unwrap();
    assert_eq!(breakdown.len(), 1);
    assert_eq!(breakdown[0].instances, 1);
    assert!(matches!(
        f.engine.group_instances_stats("nope", StatsWindow::Day).await,
        Err(EngineError::InvalidGroup(_))
    ));
}

#[tokio::test]
async fn concurrent_check_ins_all_succeed() {
    let f = fleet(unlimited()).await;
    f.package("p3000", "3000.0.0").await;
    f.target("p3000").await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&f.engine);
        handles.push(tokio::spawn(async move {
            engine
                .get_update_package(&registration(&format!("node-{i}"), "1.0.0"))
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().id, "p3000");
    }
    let stats = f.engine.group_updates_stats("prod").await.unwrap().unwrap();
    assert_eq!(stats.updates_in_progress, 16);
}
