//! Daemon loop and operator commands against real stores.

use std::sync::Arc;
use std::time::Duration;

use fleetroll_rollout::{ApprovalMethod, ChannelNotifier, RolloutError, RolloutStateStore, RolloutUpdate};
use fleetroll_state::{
    Batch, BatchLimit, BatchSequence, Device, DeviceSelectionStrategy, DeviceSummaryStatus,
    DisruptionAllowance, Fleet, NULL_ORG_ID, Percentage, RolloutPolicy, StateStore, fleet_owner,
};
use fleetrolld::commands;
use fleetrolld::config::DaemonConfig;
use fleetrolld::daemon;

const ORG: &str = NULL_ORG_ID;

fn seed(store: &StateStore, fleet_name: &str, devices: usize) {
    let mut fleet = Fleet::new(fleet_name);
    fleet.spec.rollout_policy = Some(RolloutPolicy {
        device_selection: Some(DeviceSelectionStrategy::BatchSequence(BatchSequence {
            sequence: vec![Batch {
                limit: Some(BatchLimit::Percentage(Percentage::new(100).unwrap())),
                ..Default::default()
            }],
        })),
        disruption_allowance: Some(DisruptionAllowance {
            max_unavailable: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    });
    store.put_fleet(ORG, &fleet).unwrap();
    store
        .update_rollout_state(ORG, fleet_name, &[RolloutUpdate::TemplateVersion("tv-1".into())])
        .unwrap();
    for i in 0..devices {
        let mut device = Device::new(&format!("{fleet_name}-d{i}"));
        device.metadata.owner = Some(fleet_owner(fleet_name));
        device.status.summary = DeviceSummaryStatus::Online;
        store.put_device(ORG, &device).unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn daemon_reconciles_until_shutdown() {
    let store = StateStore::open_in_memory().unwrap();
    seed(&store, "east", 2);
    let config = DaemonConfig::default();

    daemon::run(&config, store.clone(), tokio::time::sleep(Duration::from_secs(1)))
        .await
        .unwrap();

    let state = store.rollout_state(ORG, "east").unwrap();
    assert_eq!(state.deploying_template_version.as_deref(), Some("tv-1"));
    assert_eq!(state.batch_number, 0);
}

#[test]
fn reconcile_once_then_approve() {
    let store = StateStore::open_in_memory().unwrap();
    seed(&store, "east", 2);
    let (notifier, mut events) = ChannelNotifier::new();
    let notifier = Arc::new(notifier);

    commands::reconcile_once(&store, ORG, notifier.clone()).unwrap();
    assert!(events.try_recv().is_err(), "nothing approved yet");

    commands::approve(&store, ORG, "east").unwrap();
    commands::reconcile_once(&store, ORG, notifier).unwrap();
    assert!(events.try_recv().is_ok());

    let status = commands::status(&store, ORG, "east").unwrap();
    assert!(status.state.approved);
    assert_eq!(status.batches, Some(1));
    assert_eq!(status.selected_devices, vec!["east-d0", "east-d1"]);
}

#[test]
fn commands_reject_unknown_fleets() {
    let store = StateStore::open_in_memory().unwrap();

    let err = commands::approve(&store, ORG, "ghost").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RolloutError>(),
        Some(RolloutError::FleetNotFound(_))
    ));
    assert!(commands::set_approval_method(&store, ORG, "ghost", ApprovalMethod::Automatic).is_err());
    assert!(commands::status(&store, ORG, "ghost").is_err());
}

#[test]
fn approval_method_switch() {
    let store = StateStore::open_in_memory().unwrap();
    seed(&store, "east", 0);

    commands::set_approval_method(&store, ORG, "east", ApprovalMethod::Automatic).unwrap();
    let status = commands::status(&store, ORG, "east").unwrap();
    assert_eq!(status.state.approval_method, ApprovalMethod::Automatic);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["fleet"], "east");
    assert_eq!(json["approval_method"], "automatic");
    assert_eq!(json["batch_number"], -1);
}

#[test]
fn store_is_created_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig::parse(&format!(
        "[store]\npath = {:?}\n",
        dir.path().join("nested/fleetroll.redb")
    ))
    .unwrap();

    {
        let store = commands::open_store(&config).unwrap();
        seed(&store, "east", 1);
    }

    let store = commands::open_store(&config).unwrap();
    assert!(store.get_fleet(ORG, "east").unwrap().is_some());
}
