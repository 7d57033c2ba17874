//! UID definitions for fleet resources.

use crate::define_uid;

// =============================================================================
// Workload Objects
// =============================================================================

define_uid!(FleetUid, "flt");
define_uid!(InstanceUid, "inst");

// =============================================================================
// Bookkeeping
// =============================================================================

define_uid!(EventUid, "evt");

// Correlates the log lines and events of one reconcile invocation.
define_uid!(ReconcileId, "rec");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fleet_uid_roundtrip() {
        let uid = FleetUid::new();
        let parsed: FleetUid = uid.to_string().parse().unwrap();
        assert_eq!(uid, parsed);
        assert!(uid.to_string().starts_with("flt_"));
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let result: Result<FleetUid, _> = "inst_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        let err = result.unwrap_err();
        assert_eq!(err.kind, "flt");
        assert_eq!(err.problem, crate::IdProblem::ForeignPrefix("inst".to_string()));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<InstanceUid, _> = "inst01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert_eq!(result.unwrap_err().problem, crate::IdProblem::MissingSeparator);
    }

    #[test]
    fn test_empty() {
        let result: Result<InstanceUid, _> = "".parse();
        assert_eq!(result.unwrap_err().problem, crate::IdProblem::Empty);
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<InstanceUid, _> = "inst_nope".parse();
        let err = result.unwrap_err();
        assert!(matches!(err.problem, crate::IdProblem::BadUlid(_)));
        assert!(err.to_string().starts_with("invalid inst UID \"inst_nope\""));
    }

    #[test]
    fn test_json_is_plain_string() {
        let uid = InstanceUid::new();
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, format!("\"{uid}\""));
        let parsed: InstanceUid = serde_json::from_str(&json).unwrap();
        assert_eq!(uid, parsed);
    }

    #[test]
    fn test_suffix_is_lowercase_tail() {
        let uid = InstanceUid::new();
        let suffix = uid.suffix(5);
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| !c.is_ascii_uppercase()));
        assert!(uid.ulid().to_string().to_ascii_lowercase().ends_with(&suffix));
    }

    #[test]
    fn test_uids_sort_by_creation() {
        let first = InstanceUid::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = InstanceUid::new();
        assert!(first < second);
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [
            FleetUid::PREFIX,
            InstanceUid::PREFIX,
            EventUid::PREFIX,
            ReconcileId::PREFIX,
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn prop_foreign_prefix_never_parses(prefix in "[a-z]{1,6}") {
            prop_assume!(prefix != FleetUid::PREFIX);
            let input = format!("{prefix}_{}", crate::Ulid::new());
            prop_assert!(FleetUid::parse(&input).is_err());
        }
    }
}
