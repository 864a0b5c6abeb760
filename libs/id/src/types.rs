//! Identifier kinds generated by the scheduler.

use crate::define_id;

// A science goal as materialized on this node. A fresh id is minted every time
// the goal source delivers a new version of the goal.
define_id!(GoalId, "goal");

// One dispatch of a plugin to the execution substrate. Status reports carry it
// so a late report from an earlier run can be told apart from the current one.
define_id!(DispatchId, "dsp");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_goal_id_prefix() {
        let id = GoalId::new();
        assert!(id.to_string().starts_with("goal_"));
    }

    #[test]
    fn test_goal_id_roundtrip() {
        let id = GoalId::new();
        let parsed: GoalId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_goal_id_rejects_dispatch_prefix() {
        let dispatch = DispatchId::new().to_string();
        let err = GoalId::parse(&dispatch).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(GoalId::parse(""), Err(IdError::Empty));
        assert_eq!(
            GoalId::parse("goal01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(IdError::MissingSeparator)
        );
        assert!(matches!(
            GoalId::parse("goal_not-a-ulid"),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_goal_id_json() {
        let id = GoalId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: GoalId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let first = GoalId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = GoalId::new();
        assert!(first < second);
    }

    proptest! {
        #[test]
        fn prop_any_ulid_roundtrips(hi in any::<u64>(), lo in any::<u64>()) {
            let ulid = crate::Ulid::from((hi, lo));
            let id = DispatchId::from_ulid(ulid);
            prop_assert_eq!(DispatchId::parse(&id.to_string()), Ok(id));
        }
    }
}
