//! Retention-rule configuration.
//!
//! The deserializable shapes a configuration front end hands to the
//! pruner factory. How the bytes arrive (file, daemon control socket) is
//! out of scope; the structures below are plain serde and work with any
//! self-describing format:
//!
//! ```
//! use snapferry::config::PruningPairConfig;
//!
//! let cfg: PruningPairConfig = serde_json::from_str(
//!     r#"{
//!         "keep_sender": [{"type": "last_n", "count": 2}],
//!         "keep_receiver": [{"type": "not_replicated"}]
//!     }"#,
//! )
//! .unwrap();
//! assert_eq!(cfg.keep_sender.len(), 1);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapferryError};
use crate::pruning::KeepRule;

/// One retention rule as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeepRuleConfig {
    /// Keep the `count` most recent snapshots.
    LastN { count: usize },
    /// Keep snapshots not yet confirmed by the receiving side.
    NotReplicated,
}

/// Sender and receiver rule lists for one replication job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruningPairConfig {
    #[serde(default)]
    pub keep_sender: Vec<KeepRuleConfig>,
    #[serde(default)]
    pub keep_receiver: Vec<KeepRuleConfig>,
}

/// Compile configured rules into [`KeepRule`]s.
pub fn rules_from_config(configs: &[KeepRuleConfig]) -> Result<Vec<KeepRule>> {
    configs
        .iter()
        .map(|c| match c {
            KeepRuleConfig::LastN { count } => {
                if *count == 0 {
                    Err(SnapferryError::Config(
                        "last_n count must be positive".to_string(),
                    ))
                } else {
                    Ok(KeepRule::KeepLastN { count: *count })
                }
            }
            KeepRuleConfig::NotReplicated => Ok(KeepRule::KeepNotReplicated),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_from_config() {
        let rules = rules_from_config(&[
            KeepRuleConfig::LastN { count: 3 },
            KeepRuleConfig::NotReplicated,
        ])
        .unwrap();
        assert_eq!(
            rules,
            vec![
                KeepRule::KeepLastN { count: 3 },
                KeepRule::KeepNotReplicated
            ]
        );
    }

    #[test]
    fn test_last_n_zero_rejected() {
        let err = rules_from_config(&[KeepRuleConfig::LastN { count: 0 }]).unwrap_err();
        assert!(matches!(err, SnapferryError::Config(_)));
    }

    #[test]
    fn test_empty_config_is_empty_rules() {
        assert!(rules_from_config(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_deserialize_pair_from_json() {
        let cfg: PruningPairConfig = serde_json::from_str(
            r#"{
                "keep_sender": [{"type": "last_n", "count": 2}],
                "keep_receiver": []
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.keep_sender, vec![KeepRuleConfig::LastN { count: 2 }]);
        assert!(cfg.keep_receiver.is_empty());
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let cfg: PruningPairConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.keep_sender.is_empty());
        assert!(cfg.keep_receiver.is_empty());
    }

    #[test]
    fn test_unknown_rule_type_rejected() {
        let res: std::result::Result<PruningPairConfig, _> = serde_json::from_str(
            r#"{"keep_sender": [{"type": "keep_everything_forever"}]}"#,
        );
        assert!(res.is_err());
    }
}
