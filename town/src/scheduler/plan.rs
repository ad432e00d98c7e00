//! The dispatch plan: a pure capacity function.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanReason {
    /// Nothing was ready.
    None,
    /// Ready work exists but every slot is taken.
    Capacity,
    Ok,
}

#[derive(Debug, Clone)]
pub struct DispatchPlan {
    /// Prefix of the ready list to dispatch, in order.
    pub to_dispatch: Vec<String>,
    pub reason: PlanReason,
}

/// Decide what to dispatch: at most `min(max - active, batch)` items,
/// taken from the front of `ready`. Stable for equal inputs.
pub fn plan_dispatch(max: i64, batch: usize, active: usize, ready: &[String]) -> DispatchPlan {
    if ready.is_empty() {
        return DispatchPlan { to_dispatch: Vec::new(), reason: PlanReason::None };
    }

    let slots = (max - active as i64).max(0) as usize;
    let budget = slots.min(batch);
    if budget == 0 {
        return DispatchPlan { to_dispatch: Vec::new(), reason: PlanReason::Capacity };
    }

    DispatchPlan {
        to_dispatch: ready.iter().take(budget).cloned().collect(),
        reason: PlanReason::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("gt-{i}")).collect()
    }

    #[test]
    fn test_bounded_by_free_slots_and_batch() {
        let plan = plan_dispatch(4, 10, 1, &ready(5));
        assert_eq!(plan.to_dispatch.len(), 3);
        assert_eq!(plan.reason, PlanReason::Ok);

        let plan = plan_dispatch(10, 2, 0, &ready(5));
        assert_eq!(plan.to_dispatch.len(), 2);

        let plan = plan_dispatch(10, 10, 0, &ready(3));
        assert_eq!(plan.to_dispatch, ready(3));
    }

    #[test]
    fn test_saturated_reports_capacity() {
        let plan = plan_dispatch(2, 5, 2, &ready(3));
        assert!(plan.to_dispatch.is_empty());
        assert_eq!(plan.reason, PlanReason::Capacity);

        // Over-subscription clamps rather than going negative.
        let plan = plan_dispatch(2, 5, 7, &ready(3));
        assert!(plan.to_dispatch.is_empty());
        assert_eq!(plan.reason, PlanReason::Capacity);
    }

    #[test]
    fn test_empty_ready_is_none() {
        let plan = plan_dispatch(4, 4, 0, &[]);
        assert!(plan.to_dispatch.is_empty());
        assert_eq!(plan.reason, PlanReason::None);
    }

    #[test]
    fn test_takes_prefix_in_order() {
        let plan = plan_dispatch(3, 2, 1, &ready(4));
        assert_eq!(plan.to_dispatch, vec!["gt-0", "gt-1"]);
    }
}
