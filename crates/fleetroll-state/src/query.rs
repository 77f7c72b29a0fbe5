//! Device query parameters and aggregate result types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Filters for listing, counting, and bulk-marking devices. Every populated
/// field must match; empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListParams {
    /// Accepted owner references (`Fleet/<name>`).
    pub owners: Vec<String>,
    /// Exact label matches.
    pub labels: BTreeMap<String, String>,
    pub label_match_expressions: Vec<MatchExpression>,
    pub annotation_match_expressions: Vec<MatchExpression>,
    pub selected_for_rollout: Option<bool>,
    /// Maximum number of devices returned by a list.
    pub limit: Option<usize>,
}

impl ListParams {
    /// Devices owned by the named fleet.
    pub fn owned_by_fleet(fleet_name: &str) -> Self {
        Self {
            owners: vec![fleet_owner(fleet_name)],
            ..Default::default()
        }
    }

    /// Restrict to devices matching a label selector.
    pub fn with_selector(mut self, selector: &LabelSelector) -> Self {
        self.labels
            .extend(selector.match_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.label_match_expressions
            .extend(selector.match_expressions.iter().cloned());
        self
    }

    pub fn matches(&self, device: &Device) -> bool {
        let meta = &device.metadata;
        if !self.owners.is_empty()
            && !meta
                .owner
                .as_ref()
                .is_some_and(|owner| self.owners.contains(owner))
        {
            return false;
        }
        if self
            .selected_for_rollout
            .is_some_and(|selected| selected != device.selected_for_rollout)
        {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| meta.labels.get(k) == Some(v))
            && self
                .label_match_expressions
                .iter()
                .all(|e| e.matches(&meta.labels))
            && self
                .annotation_match_expressions
                .iter()
                .all(|e| e.matches(&meta.annotations))
    }
}

/// Extra per-device conditions applied on top of [`ListParams`] when
/// counting by label groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePredicate {
    /// Summary status is anything but `Unknown`.
    Online,
    /// The rendered version annotation differs from the applied version.
    RenderedVersionMismatch,
}

impl DevicePredicate {
    pub fn matches(self, device: &Device) -> bool {
        match self {
            Self::Online => device.is_online(),
            Self::RenderedVersionMismatch => device.is_converging(),
        }
    }
}

/// Values of the group-by label keys for one device group. A `None` value
/// means the devices of the group do not carry that label.
pub type LabelGroup = BTreeMap<String, Option<String>>;

/// Build the group a device belongs to for the given label keys.
pub fn label_group(device: &Device, group_by: &[String]) -> LabelGroup {
    group_by
        .iter()
        .map(|key| (key.clone(), device.metadata.labels.get(key).cloned()))
        .collect()
}

/// Number of rollout-selected devices sharing one completion state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCount {
    /// Value of the rendered template version annotation.
    pub rendered_template_version: Option<String>,
    /// Whether the rendered version annotation equals the applied version.
    pub same_rendered_version: bool,
    pub summary_status: DeviceSummaryStatus,
    pub updating_reason: Option<UpdatingReason>,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, owner: &str, labels: &[(&str, &str)]) -> Device {
        let mut d = Device::new(name);
        d.metadata.owner = Some(fleet_owner(owner));
        d.metadata.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        d
    }

    #[test]
    fn owner_filter() {
        let params = ListParams::owned_by_fleet("east");
        assert!(params.matches(&device("d1", "east", &[])));
        assert!(!params.matches(&device("d2", "west", &[])));
        assert!(!params.matches(&Device::new("orphan")));
        assert!(ListParams::default().matches(&Device::new("orphan")));
    }

    #[test]
    fn selected_and_annotation_filters() {
        let mut d = device("d1", "east", &[]);
        let params = ListParams {
            selected_for_rollout: Some(true),
            annotation_match_expressions: vec![MatchExpression::new(
                DEVICE_ANNOTATION_TEMPLATE_VERSION,
                MatchOperator::NotIn,
                &["v2"],
            )],
            ..ListParams::owned_by_fleet("east")
        };
        assert!(!params.matches(&d));

        d.selected_for_rollout = true;
        assert!(params.matches(&d));

        d.metadata.annotations.insert(
            DEVICE_ANNOTATION_TEMPLATE_VERSION.to_string(),
            "v2".to_string(),
        );
        assert!(!params.matches(&d));
    }

    #[test]
    fn selector_scoping() {
        let selector = LabelSelector {
            match_labels: [("site".to_string(), "lab".to_string())].into(),
            match_expressions: vec![],
        };
        let params = ListParams::owned_by_fleet("east").with_selector(&selector);
        assert!(params.matches(&device("d1", "east", &[("site", "lab")])));
        assert!(!params.matches(&device("d2", "east", &[("site", "prod")])));
    }

    #[test]
    fn groups_record_missing_labels() {
        let keys = vec!["site".to_string(), "tier".to_string()];
        let group = label_group(&device("d1", "east", &[("site", "lab")]), &keys);
        assert_eq!(group.get("site"), Some(&Some("lab".to_string())));
        assert_eq!(group.get("tier"), Some(&None));
        assert!(label_group(&Device::new("d2"), &[]).is_empty());
    }
}
