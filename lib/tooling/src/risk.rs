//! Risk classification and the approval threshold policy.
//!
//! Every entry point that can run a tool (chat tool calls, REST execution,
//! workflow tool nodes) consults this one mapping, so a newly added or
//! misregistered tool cannot silently bypass approval: unknown names
//! classify as high risk.

use crate::registry::ToolRegistry;
use crate::tool::ApprovalLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The derived risk tier of a tool call.
///
/// Ordered so that threshold comparisons are plain `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Read-only operations.
    Low,
    /// Mutating but reversible operations.
    Medium,
    /// Destructive or irreversible operations, and any unknown tool.
    High,
}

impl RiskLevel {
    /// Maps a tool's intrinsic approval level to its risk tier.
    #[must_use]
    pub fn from_approval_level(level: ApprovalLevel) -> Self {
        match level {
            ApprovalLevel::Auto => Self::Low,
            ApprovalLevel::Confirm => Self::Medium,
            ApprovalLevel::Danger => Self::High,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = ParseRiskLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(ParseRiskLevelError {
                value: s.to_string(),
            }),
        }
    }
}

/// Error returned when parsing a risk level from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRiskLevelError {
    /// The value that failed to parse.
    pub value: String,
}

impl fmt::Display for ParseRiskLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid risk level '{}' (expected low, medium, or high)",
            self.value
        )
    }
}

impl std::error::Error for ParseRiskLevelError {}

fn default_threshold() -> RiskLevel {
    RiskLevel::Medium
}

/// Process-wide approval policy: calls at or above the threshold require
/// a human decision before they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// The risk level at/above which approval is mandatory.
    #[serde(default = "default_threshold")]
    pub threshold: RiskLevel,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

impl ApprovalPolicy {
    /// Creates a policy with the given threshold.
    #[must_use]
    pub fn new(threshold: RiskLevel) -> Self {
        Self { threshold }
    }

    /// Loads the policy from the `APPROVAL_THRESHOLD` environment variable.
    ///
    /// Invalid or unset values fall back to `medium` with a logged warning;
    /// a misconfigured deployment must not end up approval-free.
    #[must_use]
    pub fn from_env() -> Self {
        let loaded: Result<String, _> = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .and_then(|c| c.get_string("approval_threshold"));

        match loaded {
            Ok(raw) => match raw.parse::<RiskLevel>() {
                Ok(threshold) => Self { threshold },
                Err(e) => {
                    tracing::warn!(error = %e, "falling back to default approval threshold");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Returns the risk level of the named tool.
    ///
    /// Unknown tools are [`RiskLevel::High`]: a name the catalog does not
    /// recognize must never run unattended.
    #[must_use]
    pub fn risk_level_of(&self, registry: &ToolRegistry, tool_name: &str) -> RiskLevel {
        registry
            .approval_level(tool_name)
            .map_or(RiskLevel::High, RiskLevel::from_approval_level)
    }

    /// Returns true if invoking the named tool requires human approval.
    #[must_use]
    pub fn requires_approval(&self, registry: &ToolRegistry, tool_name: &str) -> bool {
        self.risk_level_of(registry, tool_name) >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::EchoTool;
    use std::sync::Arc;

    fn sample_registry() -> ToolRegistry {
        ToolRegistry::builder()
            .register(Arc::new(EchoTool::new("list_buckets", ApprovalLevel::Auto)))
            .register(Arc::new(EchoTool::new(
                "update_dns_record",
                ApprovalLevel::Confirm,
            )))
            .register(Arc::new(EchoTool::new(
                "delete_database",
                ApprovalLevel::Danger,
            )))
            .build()
    }

    #[test]
    fn risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }

    #[test]
    fn approval_level_maps_to_risk() {
        assert_eq!(
            RiskLevel::from_approval_level(ApprovalLevel::Auto),
            RiskLevel::Low
        );
        assert_eq!(
            RiskLevel::from_approval_level(ApprovalLevel::Confirm),
            RiskLevel::Medium
        );
        assert_eq!(
            RiskLevel::from_approval_level(ApprovalLevel::Danger),
            RiskLevel::High
        );
    }

    #[test]
    fn unknown_tool_is_high_risk() {
        let registry = sample_registry();
        let policy = ApprovalPolicy::default();

        assert_eq!(
            policy.risk_level_of(&registry, "no_such_tool"),
            RiskLevel::High
        );
        // Regardless of threshold, unknown tools require approval.
        for threshold in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High] {
            let policy = ApprovalPolicy::new(threshold);
            assert!(policy.requires_approval(&registry, "no_such_tool"));
        }
    }

    #[test]
    fn default_threshold_is_medium() {
        let registry = sample_registry();
        let policy = ApprovalPolicy::default();

        assert!(!policy.requires_approval(&registry, "list_buckets"));
        assert!(policy.requires_approval(&registry, "update_dns_record"));
        assert!(policy.requires_approval(&registry, "delete_database"));
    }

    #[test]
    fn threshold_is_monotone() {
        let registry = sample_registry();
        // For a fixed tool, raising the threshold never turns a false into
        // a true.
        for tool in ["list_buckets", "update_dns_record", "delete_database"] {
            let mut previous = true;
            for threshold in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High] {
                let current =
                    ApprovalPolicy::new(threshold).requires_approval(&registry, tool);
                assert!(previous || !current, "threshold raise flipped false to true");
                previous = current;
            }
        }
    }

    #[test]
    fn low_threshold_requires_approval_for_everything() {
        let registry = sample_registry();
        let policy = ApprovalPolicy::new(RiskLevel::Low);

        assert!(policy.requires_approval(&registry, "list_buckets"));
        assert!(policy.requires_approval(&registry, "update_dns_record"));
        assert!(policy.requires_approval(&registry, "delete_database"));
    }

    #[test]
    fn high_threshold_only_gates_danger() {
        let registry = sample_registry();
        let policy = ApprovalPolicy::new(RiskLevel::High);

        assert!(!policy.requires_approval(&registry, "list_buckets"));
        assert!(!policy.requires_approval(&registry, "update_dns_record"));
        assert!(policy.requires_approval(&registry, "delete_database"));
    }

    #[test]
    fn parse_risk_level() {
        assert_eq!("low".parse::<RiskLevel>().unwrap(), RiskLevel::Low);
        assert_eq!("HIGH".parse::<RiskLevel>().unwrap(), RiskLevel::High);
        assert!("extreme".parse::<RiskLevel>().is_err());
    }
}
