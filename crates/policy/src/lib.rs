use fedra_contracts::PrivacyLevel;
use serde::Serialize;
use serde_json::Value;

/// Artifact fields consulted for the cohort count, in priority order.
const COHORT_FIELDS: &[&str] = &["sample_size", "total_subjects", "n_subjects", "n"];

pub const BLOCK_REASON: &str = "cohort-below-minimum";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub released: bool,
    /// Cohort observed in the artifact, if any field was present and numeric.
    pub observed: Option<u64>,
    pub min_cohort_size: u64,
}

impl GateDecision {
    /// Payload to publish externally. Released results pass through
    /// untouched; blocked results get the placeholder.
    pub fn external_payload(&self, artifact: &Value) -> Value {
        if self.released {
            artifact.clone()
        } else {
            serde_json::json!({
                "blocked": true,
                "reason": BLOCK_REASON,
                "min_cohort_size": self.min_cohort_size,
                "observed": self.observed,
            })
        }
    }
}

/// Decides whether an artifact may be released under the catalog's minimum
/// cohort size.
///
/// An artifact with no recognizable cohort field is releasable unless the
/// catalog's privacy level is `high`, in which case unknown counts as below
/// minimum.
pub fn evaluate(artifact: &Value, min_cohort_size: u64, privacy: PrivacyLevel) -> GateDecision {
    let observed = cohort_count(artifact);

    let released = match observed {
        Some(n) => n >= min_cohort_size,
        None => privacy != PrivacyLevel::High,
    };

    GateDecision {
        released,
        observed,
        min_cohort_size,
    }
}

/// First cohort field present with a usable non-negative numeric value.
pub fn cohort_count(artifact: &Value) -> Option<u64> {
    let object = artifact.as_object()?;

    for field in COHORT_FIELDS {
        let Some(value) = object.get(*field) else {
            continue;
        };
        if let Some(n) = value.as_u64() {
            return Some(n);
        }
        if let Some(f) = value.as_f64()
            && f.is_finite()
            && f >= 0.0
            && f.fract() == 0.0
        {
            return Some(f as u64);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cohort_at_minimum_is_released() {
        let artifact = serde_json::json!({"sample_size": 10, "mean": 1.5});
        let decision = evaluate(&artifact, 10, PrivacyLevel::Medium);
        assert!(decision.released);
        assert_eq!(decision.observed, Some(10));
        assert_eq!(decision.external_payload(&artifact), artifact);
    }

    #[test]
    fn cohort_one_below_minimum_is_blocked() {
        let artifact = serde_json::json!({"sample_size": 9});
        let decision = evaluate(&artifact, 10, PrivacyLevel::Low);
        assert!(!decision.released);

        let external = decision.external_payload(&artifact);
        assert_eq!(external["blocked"], serde_json::json!(true));
        assert_eq!(external["reason"], serde_json::json!(BLOCK_REASON));
        assert_eq!(external["min_cohort_size"], serde_json::json!(10));
        assert_eq!(external["observed"], serde_json::json!(9));
        assert!(external.get("sample_size").is_none());
    }

    #[test]
    fn cohort_fields_are_checked_in_order() {
        // sample_size wins even when a later field would pass the gate.
        let artifact = serde_json::json!({"n": 500, "sample_size": 3});
        let decision = evaluate(&artifact, 10, PrivacyLevel::Low);
        assert_eq!(decision.observed, Some(3));
        assert!(!decision.released);

        let artifact = serde_json::json!({"n_subjects": 40});
        assert_eq!(cohort_count(&artifact), Some(40));
    }

    #[test]
    fn unknown_cohort_blocks_only_high_privacy() {
        let artifact = serde_json::json!({"summary": "no counts here"});

        let low = evaluate(&artifact, 10, PrivacyLevel::Low);
        assert!(low.released);
        assert_eq!(low.observed, None);

        let high = evaluate(&artifact, 10, PrivacyLevel::High);
        assert!(!high.released);
        assert_eq!(
            high.external_payload(&artifact)["observed"],
            serde_json::Value::Null
        );
    }

    #[test]
    fn non_numeric_and_negative_cohorts_count_as_unknown() {
        assert_eq!(cohort_count(&serde_json::json!({"n": "forty"})), None);
        assert_eq!(cohort_count(&serde_json::json!({"n": -4})), None);
        assert_eq!(cohort_count(&serde_json::json!({"n": 12.5})), None);
        assert_eq!(cohort_count(&serde_json::json!({"n": 12.0})), Some(12));
        assert_eq!(cohort_count(&serde_json::json!([1, 2, 3])), None);
    }

    #[test]
    fn float_cohort_at_boundary_behaves_like_integer() {
        let artifact = serde_json::json!({"total_subjects": 10.0});
        assert!(evaluate(&artifact, 10, PrivacyLevel::High).released);
    }
}
