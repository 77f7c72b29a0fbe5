//! Disruption allowance reconciler against an in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use fleetroll_rollout::{
    ChannelNotifier, DisruptionAllowanceReconciler, RolloutError, RolloutEvent,
    RolloutStateStore, RolloutUpdate,
};
use fleetroll_state::{
    DEVICE_ANNOTATION_RENDERED_TEMPLATE_VERSION, DEVICE_ANNOTATION_RENDERED_VERSION,
    DEVICE_ANNOTATION_TEMPLATE_VERSION, Device, DeviceSummaryStatus, DisruptionAllowance, Fleet,
    ListParams, NULL_ORG_ID, RolloutPolicy, StateStore, fleet_owner,
};

const ORG: &str = NULL_ORG_ID;
const FLEET: &str = "myfleet";
const TV: &str = "tv-2";

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn labels1() -> BTreeMap<String, String> {
    labels(&[("label-1", "value-1"), ("label-2", "value-2")])
}

fn labels2() -> BTreeMap<String, String> {
    labels(&[("label-1", "value-3"), ("label-2", "value-2")])
}

fn group_by() -> Vec<String> {
    vec!["label-1".to_string(), "label-2".to_string()]
}

fn allowance(max: Option<i64>, min: Option<i64>, group_by: Vec<String>) -> Option<DisruptionAllowance> {
    Some(DisruptionAllowance {
        group_by,
        max_unavailable: max,
        min_available: min,
    })
}

struct Setup {
    annotate_tv: bool,
    annotate_rendered_tv: bool,
}

const TARGETED: Setup = Setup {
    annotate_tv: true,
    annotate_rendered_tv: false,
};

/// Fleet with a template version and `n` online, idle devices.
fn init(store: &StateStore, name: &str, allowance: Option<DisruptionAllowance>, n: usize, setup: Setup) {
    let mut fleet = Fleet::new(name);
    fleet.spec.rollout_policy = Some(RolloutPolicy {
        disruption_allowance: allowance,
        ..Default::default()
    });
    store.put_fleet(ORG, &fleet).unwrap();
    store
        .update_rollout_state(ORG, name, &[RolloutUpdate::TemplateVersion(TV.to_string())])
        .unwrap();

    for i in 0..n {
        let mut device = Device::new(&format!("{name}-d{i}"));
        device.metadata.owner = Some(fleet_owner(name));
        device.status.summary = DeviceSummaryStatus::Online;
        device.status.config.rendered_version = "5".to_string();
        let annotations = &mut device.metadata.annotations;
        annotations.insert(DEVICE_ANNOTATION_RENDERED_VERSION.to_string(), "5".to_string());
        if setup.annotate_tv {
            annotations.insert(DEVICE_ANNOTATION_TEMPLATE_VERSION.to_string(), TV.to_string());
        }
        if setup.annotate_rendered_tv {
            annotations.insert(
                DEVICE_ANNOTATION_RENDERED_TEMPLATE_VERSION.to_string(),
                TV.to_string(),
            );
        }
        store.put_device(ORG, &device).unwrap();
    }
}

fn set_labels(store: &StateStore, groups: &[(BTreeMap<String, String>, usize)]) {
    let mut devices = store
        .list_devices(ORG, &ListParams::default())
        .unwrap()
        .into_iter();
    for (labels, n) in groups {
        for mut device in devices.by_ref().take(*n) {
            device.metadata.labels = labels.clone();
            store.put_device(ORG, &device).unwrap();
        }
    }
}

fn reconciler(store: &StateStore) -> (DisruptionAllowanceReconciler, UnboundedReceiver<RolloutEvent>) {
    let (notifier, rx) = ChannelNotifier::new();
    (DisruptionAllowanceReconciler::new(store.clone(), Arc::new(notifier)), rx)
}

/// Names of the devices told to re-render.
fn notified(rx: &mut UnboundedReceiver<RolloutEvent>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            RolloutEvent::DeviceSourceUpdated { device, .. } => names.push(device),
            other => panic!("unexpected event {other:?}"),
        }
    }
    names
}

fn labels_of(store: &StateStore, device: &str) -> BTreeMap<String, String> {
    store.get_device(ORG, device).unwrap().unwrap().metadata.labels
}

#[test]
fn fleets_without_allowance_are_ignored() {
    let cases = [
        (0, Setup { annotate_tv: false, annotate_rendered_tv: false }),
        (1, Setup { annotate_tv: false, annotate_rendered_tv: false }),
        (1, TARGETED),
        (1, Setup { annotate_tv: true, annotate_rendered_tv: true }),
    ];
    for (n, setup) in cases {
        let store = StateStore::open_in_memory().unwrap();
        init(&store, FLEET, None, n, setup);
        let (reconciler, mut rx) = reconciler(&store);

        reconciler.reconcile().unwrap();
        assert!(notified(&mut rx).is_empty());
    }
}

#[test]
fn min_available_holds_back_a_lone_device() {
    let store = StateStore::open_in_memory().unwrap();
    init(&store, FLEET, allowance(Some(1), Some(1), vec![]), 1, TARGETED);
    let (reconciler, mut rx) = reconciler(&store);

    reconciler.reconcile().unwrap();
    assert!(notified(&mut rx).is_empty());
}

#[test]
fn one_of_two_devices_may_update() {
    let store = StateStore::open_in_memory().unwrap();
    init(&store, FLEET, allowance(Some(1), Some(1), vec![]), 2, TARGETED);
    let (reconciler, mut rx) = reconciler(&store);

    reconciler.reconcile().unwrap();
    assert_eq!(notified(&mut rx).len(), 1);
}

#[test]
fn budget_applies_per_label_group() {
    let store = StateStore::open_in_memory().unwrap();
    init(&store, FLEET, allowance(Some(1), Some(1), group_by()), 6, TARGETED);
    set_labels(&store, &[(labels1(), 4), (labels2(), 1)]);
    let (reconciler, mut rx) = reconciler(&store);

    reconciler.reconcile().unwrap();

    // Only the four-device group can spare one; the single-device groups
    // must stay available.
    let names = notified(&mut rx);
    assert_eq!(names.len(), 1);
    assert_eq!(labels_of(&store, &names[0]), labels1());
}

#[test]
fn min_available_only_releases_all_but_one_per_group() {
    let store = StateStore::open_in_memory().unwrap();
    init(&store, FLEET, allowance(None, Some(1), group_by()), 9, TARGETED);
    set_labels(&store, &[(labels1(), 4), (labels2(), 3)]);
    let (reconciler, mut rx) = reconciler(&store);

    reconciler.reconcile().unwrap();

    let names = notified(&mut rx);
    assert_eq!(names.len(), 6);
    let count = |expected: &BTreeMap<String, String>| {
        names
            .iter()
            .filter(|name| &labels_of(&store, name) == expected)
            .count()
    };
    assert_eq!(count(&labels1()), 3);
    assert_eq!(count(&labels2()), 2);
    assert_eq!(count(&BTreeMap::new()), 1);
}

#[test]
fn busy_devices_exhaust_max_unavailable() {
    let store = StateStore::open_in_memory().unwrap();
    init(&store, FLEET, allowance(Some(2), None, vec![]), 4, TARGETED);
    for name in ["myfleet-d0", "myfleet-d1"] {
        let mut device = store.get_device(ORG, name).unwrap().unwrap();
        device.status.config.rendered_version = "4".to_string();
        store.put_device(ORG, &device).unwrap();
    }
    let (reconciler, mut rx) = reconciler(&store);

    reconciler.reconcile().unwrap();
    assert!(notified(&mut rx).is_empty());

    // One device finishes; one slot opens.
    let mut device = store.get_device(ORG, "myfleet-d0").unwrap().unwrap();
    device.status.config.rendered_version = "5".to_string();
    store.put_device(ORG, &device).unwrap();

    reconciler.reconcile().unwrap();
    assert_eq!(notified(&mut rx).len(), 1);
}

#[test]
fn offline_and_rendered_devices_are_left_alone() {
    let store = StateStore::open_in_memory().unwrap();
    init(&store, FLEET, allowance(Some(10), None, vec![]), 3, TARGETED);
    let mut offline = store.get_device(ORG, "myfleet-d0").unwrap().unwrap();
    offline.status.summary = DeviceSummaryStatus::Unknown;
    store.put_device(ORG, &offline).unwrap();
    store
        .update_device_annotations(
            ORG,
            "myfleet-d1",
            &labels(&[(DEVICE_ANNOTATION_RENDERED_TEMPLATE_VERSION, TV)]),
            &[],
        )
        .unwrap();
    let (reconciler, mut rx) = reconciler(&store);

    reconciler.reconcile().unwrap();

    // Offline devices don't count toward the budget, but the listing of
    // candidates is not restricted to online devices.
    let names = notified(&mut rx);
    assert_eq!(names, vec!["myfleet-d0".to_string(), "myfleet-d2".to_string()]);
}

#[test]
fn missing_bounds_fail_only_that_fleet() {
    let store = StateStore::open_in_memory().unwrap();
    init(&store, "broken", allowance(None, None, vec![]), 2, TARGETED);
    init(&store, FLEET, allowance(Some(1), None, vec![]), 2, TARGETED);
    let (reconciler, mut rx) = reconciler(&store);

    let err = reconciler.reconcile().unwrap_err();

    assert_eq!(err.errors.len(), 1);
    assert!(matches!(
        &err.errors[0],
        RolloutError::Fleet { fleet, source }
            if fleet == "broken" && matches!(**source, RolloutError::InvalidDisruptionAllowance(_))
    ));
    assert_eq!(notified(&mut rx), vec!["myfleet-d0".to_string()]);
}
