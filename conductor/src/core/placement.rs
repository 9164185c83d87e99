//! Fleet placement policy: eligibility and least-loaded selection.

use super::types::{MachineNode, MachineStatus};

/// Whether a node can accept one more run.
pub fn is_eligible(node: &MachineNode) -> bool {
    node.status == MachineStatus::Online && node.active_workers < node.max_workers
}

/// True iff at least one node can accept a run.
pub fn any_capacity(nodes: &[MachineNode]) -> bool {
    nodes.iter().any(is_eligible)
}

/// Pick the least-loaded eligible node.
///
/// Lowest `active_workers / max_workers` ratio wins; ties break on the
/// most recent heartbeat, then on name for determinism.
pub fn least_loaded(nodes: &[MachineNode]) -> Option<&MachineNode> {
    nodes
        .iter()
        .filter(|node| is_eligible(node))
        .min_by(|a, b| {
            load_ratio(a)
                .partial_cmp(&load_ratio(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_heartbeat_at.cmp(&a.last_heartbeat_at))
                .then_with(|| a.name.cmp(&b.name))
        })
}

fn load_ratio(node: &MachineNode) -> f64 {
    if node.max_workers == 0 {
        return 1.0;
    }
    f64::from(node.active_workers) / f64::from(node.max_workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MachineRole;
    use chrono::{TimeZone, Utc};

    fn node(name: &str, active: u32, max: u32, status: MachineStatus, beat_s: i64) -> MachineNode {
        MachineNode {
            name: name.to_string(),
            host: format!("{name}.local"),
            role: MachineRole::Worker,
            max_workers: max,
            active_workers: active,
            last_heartbeat_at: Utc.timestamp_opt(beat_s, 0).unwrap(),
            status,
        }
    }

    #[test]
    fn offline_and_full_nodes_are_ineligible() {
        assert!(!is_eligible(&node("a", 0, 4, MachineStatus::Offline, 0)));
        assert!(!is_eligible(&node("b", 4, 4, MachineStatus::Online, 0)));
        assert!(is_eligible(&node("c", 3, 4, MachineStatus::Online, 0)));
    }

    #[test]
    fn least_loaded_prefers_lowest_ratio() {
        let nodes = vec![
            node("busy", 3, 4, MachineStatus::Online, 100),
            node("idle", 1, 4, MachineStatus::Online, 100),
        ];
        assert_eq!(least_loaded(&nodes).expect("node").name, "idle");
    }

    #[test]
    fn ratio_ties_break_on_recent_heartbeat() {
        let nodes = vec![
            node("stale", 1, 4, MachineStatus::Online, 100),
            node("fresh", 1, 4, MachineStatus::Online, 200),
        ];
        assert_eq!(least_loaded(&nodes).expect("node").name, "fresh");
    }

    #[test]
    fn no_eligible_node_yields_none() {
        let nodes = vec![
            node("a", 4, 4, MachineStatus::Online, 0),
            node("b", 0, 4, MachineStatus::Offline, 0),
        ];
        assert!(least_loaded(&nodes).is_none());
        assert!(!any_capacity(&nodes));
    }

    #[test]
    fn zero_max_workers_never_wins() {
        let nodes = vec![node("z", 0, 0, MachineStatus::Online, 0)];
        assert!(least_loaded(&nodes).is_none());
    }
}
