//! Resource types for the fleetroll state store.
//!
//! These types represent the persisted state of fleets and devices. All
//! types are serializable to/from JSON for storage in redb tables, and the
//! policy types also round-trip through TOML fixtures.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of the organization that owns a resource.
pub type OrgId = String;

/// Organization used when the deployment is single-tenant.
pub const NULL_ORG_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Resource kind used in device owner references.
pub const FLEET_KIND: &str = "Fleet";

/// Template version the device is expected to run.
pub const DEVICE_ANNOTATION_TEMPLATE_VERSION: &str = "device-controller/templateVersion";

/// Template version of the last configuration rendered for the device.
pub const DEVICE_ANNOTATION_RENDERED_TEMPLATE_VERSION: &str =
    "device-controller/renderedTemplateVersion";

/// Monotonic version number of the last rendered configuration.
pub const DEVICE_ANNOTATION_RENDERED_VERSION: &str = "device-controller/renderedVersion";

/// Owner reference of a device that belongs to the named fleet.
pub fn fleet_owner(fleet_name: &str) -> String {
    format!("{FLEET_KIND}/{fleet_name}")
}

// ── Metadata ──────────────────────────────────────────────────────

/// Metadata shared by fleets and devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    /// Owner reference, `Fleet/<name>` for fleet-managed devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

// ── Selectors ─────────────────────────────────────────────────────

/// Operator of a single match expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A requirement on one key of a label or annotation map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExpression {
    pub key: String,
    pub operator: MatchOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl MatchExpression {
    pub fn new(key: &str, operator: MatchOperator, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Evaluate the expression against a label or annotation map.
    ///
    /// `NotIn` also matches when the key is absent.
    pub fn matches(&self, map: &BTreeMap<String, String>) -> bool {
        let value = map.get(&self.key);
        match self.operator {
            MatchOperator::In => value.is_some_and(|v| self.values.contains(v)),
            MatchOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            MatchOperator::Exists => value.is_some(),
            MatchOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Label selector: exact label matches plus match expressions, ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<MatchExpression>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|e| e.matches(labels))
    }
}

// ── Percentage & limits ───────────────────────────────────────────

/// A whole percentage in `0..=100`, written as `"NN%"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Percentage(u32);

impl Percentage {
    pub fn new(value: u32) -> Result<Self, String> {
        if value > 100 {
            return Err(format!("percentage {value} is out of range 0-100"));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl FromStr for Percentage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .trim()
            .strip_suffix('%')
            .ok_or_else(|| format!("percentage {s:?} must end with '%'"))?;
        let value = digits
            .parse::<u32>()
            .map_err(|e| format!("invalid percentage {s:?}: {e}"))?;
        Self::new(value)
    }
}

impl TryFrom<String> for Percentage {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Percentage> for String {
    fn from(p: Percentage) -> Self {
        p.to_string()
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Capacity of one batch: an absolute device count or a percentage of the
/// devices its selector matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchLimit {
    Absolute(i64),
    Percentage(Percentage),
}

// ── Fleet ─────────────────────────────────────────────────────────

/// A named group of devices sharing a rollout policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Fleet {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: FleetSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FleetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_policy: Option<RolloutPolicy>,
}

/// How new template versions reach the fleet's devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RolloutPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selection: Option<DeviceSelectionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disruption_allowance: Option<DisruptionAllowance>,
    /// Fleet-wide default success threshold for automatic approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<Percentage>,
}

/// Strategy used to pick the devices of each rollout step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy")]
pub enum DeviceSelectionStrategy {
    BatchSequence(BatchSequence),
}

/// An ordered list of batches walked one at a time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchSequence {
    #[serde(default)]
    pub sequence: Vec<Batch>,
}

/// One step of a batch sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    /// Devices eligible for this batch; `None` matches the whole fleet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<BatchLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<Percentage>,
}

/// Budget capping how many devices of a group may update at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DisruptionAllowance {
    /// Label keys whose value combinations form the budget groups.
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i64>,
}

impl Fleet {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..Default::default()
            },
            spec: FleetSpec::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }
}

// ── Device ────────────────────────────────────────────────────────

/// An edge device managed by exactly one fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: DeviceStatus,
    /// Set while the device belongs to the fleet's current rollout batch.
    #[serde(default)]
    pub selected_for_rollout: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    #[serde(default)]
    pub summary: DeviceSummaryStatus,
    #[serde(default)]
    pub config: DeviceConfigStatus,
    /// Reason reported by the agent while an update is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updating_reason: Option<UpdatingReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfigStatus {
    /// Rendered version the agent last applied.
    #[serde(default)]
    pub rendered_version: String,
}

/// Summarized health of a device as last reported by its agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceSummaryStatus {
    Online,
    Degraded,
    Error,
    Rebooting,
    PoweredOff,
    #[default]
    Unknown,
}

/// Phase of an in-flight update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UpdatingReason {
    Preparing,
    ReadyToUpdate,
    ApplyingUpdate,
    Rebooting,
    ActivatingConfig,
    RollingBack,
    Updated,
    Canceled,
    Error,
}

impl UpdatingReason {
    /// Whether the device is actively transitioning to a new config.
    pub fn is_in_update(self) -> bool {
        matches!(
            self,
            Self::ApplyingUpdate | Self::Rebooting | Self::ActivatingConfig | Self::RollingBack
        )
    }
}

impl Device {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    /// Online means the agent reported a summary other than `Unknown`.
    pub fn is_online(&self) -> bool {
        self.status.summary != DeviceSummaryStatus::Unknown
    }

    /// True while the rendered version annotation differs from the version
    /// the agent reports as applied (a missing annotation counts as differing).
    pub fn is_converging(&self) -> bool {
        self.annotation(DEVICE_ANNOTATION_RENDERED_VERSION)
            != Some(self.status.config.rendered_version.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn percentage_parses_and_validates() {
        assert_eq!("50%".parse::<Percentage>().unwrap().value(), 50);
        assert_eq!(" 100% ".parse::<Percentage>().unwrap().value(), 100);
        assert!("50".parse::<Percentage>().is_err());
        assert!("101%".parse::<Percentage>().is_err());
        assert!("abc%".parse::<Percentage>().is_err());
    }

    #[test]
    fn batch_limit_accepts_integer_or_percentage() {
        let abs: BatchLimit = serde_json::from_str("4").unwrap();
        assert_eq!(abs, BatchLimit::Absolute(4));

        let pct: BatchLimit = serde_json::from_str("\"25%\"").unwrap();
        assert_eq!(pct, BatchLimit::Percentage(Percentage::new(25).unwrap()));

        assert!(serde_json::from_str::<BatchLimit>("\"25\"").is_err());
        assert_eq!(serde_json::to_string(&pct).unwrap(), "\"25%\"");
    }

    #[test]
    fn rollout_policy_from_json() {
        let json = r#"{
            "device_selection": {
                "strategy": "BatchSequence",
                "sequence": [
                    { "selector": { "match_labels": { "site": "lab" } }, "limit": 1 },
                    { "limit": "50%", "success_threshold": "80%" },
                    {}
                ]
            },
            "disruption_allowance": { "group_by": ["site"], "max_unavailable": 2 },
            "success_threshold": "95%"
        }"#;
        let policy: RolloutPolicy = serde_json::from_str(json).unwrap();
        let Some(DeviceSelectionStrategy::BatchSequence(seq)) = &policy.device_selection else {
            panic!("expected batch sequence");
        };
        assert_eq!(seq.sequence.len(), 3);
        assert_eq!(seq.sequence[0].limit, Some(BatchLimit::Absolute(1)));
        assert!(seq.sequence[2].selector.is_none());
        let da = policy.disruption_allowance.unwrap();
        assert_eq!(da.max_unavailable, Some(2));
        assert_eq!(da.min_available, None);
        assert_eq!(policy.success_threshold.unwrap().value(), 95);
    }

    #[test]
    fn match_expression_operators() {
        let l = labels(&[("site", "lab"), ("tier", "edge")]);

        assert!(MatchExpression::new("site", MatchOperator::In, &["lab", "prod"]).matches(&l));
        assert!(!MatchExpression::new("site", MatchOperator::In, &["prod"]).matches(&l));
        assert!(!MatchExpression::new("zone", MatchOperator::In, &["a"]).matches(&l));

        assert!(MatchExpression::new("site", MatchOperator::NotIn, &["prod"]).matches(&l));
        assert!(!MatchExpression::new("site", MatchOperator::NotIn, &["lab"]).matches(&l));
        // Absent keys satisfy NotIn.
        assert!(MatchExpression::new("zone", MatchOperator::NotIn, &["a"]).matches(&l));

        assert!(MatchExpression::new("tier", MatchOperator::Exists, &[]).matches(&l));
        assert!(MatchExpression::new("zone", MatchOperator::DoesNotExist, &[]).matches(&l));
        assert!(!MatchExpression::new("tier", MatchOperator::DoesNotExist, &[]).matches(&l));
    }

    #[test]
    fn label_selector_ands_labels_and_expressions() {
        let selector = LabelSelector {
            match_labels: labels(&[("site", "lab")]),
            match_expressions: vec![MatchExpression::new(
                "tier",
                MatchOperator::In,
                &["edge"],
            )],
        };
        assert!(selector.matches(&labels(&[("site", "lab"), ("tier", "edge")])));
        assert!(!selector.matches(&labels(&[("site", "lab")])));
        assert!(!selector.matches(&labels(&[("site", "prod"), ("tier", "edge")])));
        assert!(LabelSelector::default().matches(&BTreeMap::new()));
    }

    #[test]
    fn device_convergence() {
        let mut device = Device::new("d1");
        assert!(device.is_converging(), "missing annotation counts as converging");

        device
            .metadata
            .annotations
            .insert(DEVICE_ANNOTATION_RENDERED_VERSION.to_string(), "5".to_string());
        device.status.config.rendered_version = "4".to_string();
        assert!(device.is_converging());

        device.status.config.rendered_version = "5".to_string();
        assert!(!device.is_converging());
    }

    #[test]
    fn in_update_reasons() {
        assert!(UpdatingReason::Rebooting.is_in_update());
        assert!(UpdatingReason::ApplyingUpdate.is_in_update());
        assert!(!UpdatingReason::Error.is_in_update());
        assert!(!UpdatingReason::Updated.is_in_update());
    }
}
