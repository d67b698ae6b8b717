//! Reconciliation Loop — each tick, re-resolves every group's owned local
//! ports and diffs against that group's own previous-tick port set,
//! installing filters for newly-seen ports and removing filters for ports
//! that disappeared, then replaces `previous` with the freshly resolved
//! state wholesale (spec §4.6, steps 2-4).
//!
//! The previous-tick state is tracked per group name (`GroupPortState`,
//! spec §3), not derived from the shared `FilterRegistry`: the registry
//! holds every group's filters in one `port -> handle` map per direction,
//! so diffing a single group against the registry's full port set would
//! misattribute other groups' ports as "gone" for this group. Keeping an
//! explicit `previous[name]` set, as the spec's main loop does, avoids that
//! cross-group contamination.
//!
//! `resolver::resolve` omits a group from its result entirely once it owns
//! no ports (rather than mapping it to an empty set), so a group going
//! fully dark shows up as a *missing* key in `current` — that is what step
//! 3 below ("a group name previously tracked but absent from current")
//! detects and prunes.
//!
//! Ingress filters are installed before egress filters for a newly-seen
//! port, matching the order the donor CLI's main loop applies them in
//! (spec §5).

use crate::registry::FilterRegistry;
use crate::resolver::{self, CompiledGroup, LocalPort};
use crate::tc::{Direction, TcDriver};
use crate::topology::Topology;
use std::collections::{HashMap, HashSet};

/// Per group name, the set of local ports considered "owned" by that group
/// as of the last tick (spec §3's `GroupPortState`). A group with no
/// entry is equivalent to one with an empty port set.
#[derive(Debug, Default)]
pub struct GroupPortState(HashMap<String, HashSet<LocalPort>>);

impl GroupPortState {
    pub fn new() -> Self {
        Self::default()
    }

    fn ports_for(&self, name: &str) -> HashSet<LocalPort> {
        self.0.get(name).cloned().unwrap_or_default()
    }
}

/// Runs one reconciliation tick against the live process/socket state,
/// mutating `registry` and `previous` (and the kernel filter set) in place.
pub fn tick(
    tc: &TcDriver,
    topology: &Topology,
    groups: &[CompiledGroup],
    registry: &mut FilterRegistry,
    previous: &mut GroupPortState,
) {
    let current = resolver::resolve(groups);

    // Step 2: for every group the resolver still sees, diff its ports
    // against its own previous-tick state and install/remove filters.
    for (name, ports) in &current {
        let Some(leaves) = topology.group_leaves.get(name) else {
            continue;
        };
        let previous_ports = previous.ports_for(name);
        let new_ports: HashSet<LocalPort> = ports.difference(&previous_ports).copied().collect();
        let gone_ports: HashSet<LocalPort> = previous_ports.difference(ports).copied().collect();

        if let Some(class_id) = leaves.ingress {
            apply_side(tc, topology, Direction::Ingress, class_id, &new_ports, &gone_ports, registry);
        }
        if let Some(class_id) = leaves.egress {
            apply_side(tc, topology, Direction::Egress, class_id, &new_ports, &gone_ports, registry);
        }
    }

    // Step 3: a group name previously tracked but absent from this tick's
    // `current` (no process currently owns it, or its owned processes now
    // hold no ports) loses every filter it had and is forgotten outright.
    for (name, ports) in previous.0.iter() {
        if current.contains_key(name) {
            continue;
        }
        let Some(leaves) = topology.group_leaves.get(name) else {
            continue;
        };
        if let Some(class_id) = leaves.ingress {
            apply_side(tc, topology, Direction::Ingress, class_id, &HashSet::new(), ports, registry);
        }
        if let Some(class_id) = leaves.egress {
            apply_side(tc, topology, Direction::Egress, class_id, &HashSet::new(), ports, registry);
        }
    }

    // Step 4: replace previous with current wholesale.
    previous.0 = current;
}

/// Installs filters for `new_ports` and removes filters for `gone_ports` on
/// one side of one group's leaf, mutating the shared registry.
fn apply_side(
    tc: &TcDriver,
    topology: &Topology,
    direction: Direction,
    class_id: u32,
    new_ports: &HashSet<LocalPort>,
    gone_ports: &HashSet<LocalPort>,
    registry: &mut FilterRegistry,
) {
    let (device, handle) = topology.handle_for(direction);

    for &port in new_ports {
        if registry.contains(direction, port) {
            continue;
        }
        let match_expression = match direction {
            Direction::Ingress => format!("match ip dport {port} 0xffff"),
            Direction::Egress => format!("match ip sport {port} 0xffff"),
        };
        match tc.add_u32_filter(device, handle.qdisc_id, &match_expression, class_id) {
            Ok(filter_handle) => registry.insert(direction, port, filter_handle),
            Err(e) => log::warn!("failed to install {direction:?} filter for port {port}: {e}"),
        }
    }

    for &port in gone_ports {
        if let Some(filter_handle) = registry.remove(direction, port) {
            if let Err(e) = tc.remove_u32_filter(device, handle.qdisc_id, &filter_handle) {
                log::warn!("failed to remove {direction:?} filter for port {port}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_diff_only_adds_new_ports() {
        let current: HashSet<LocalPort> = [80, 443].into_iter().collect();
        let previous: HashSet<LocalPort> = [443, 8080].into_iter().collect();
        let new: HashSet<&LocalPort> = current.difference(&previous).collect();
        let gone: HashSet<&LocalPort> = previous.difference(&current).collect();
        assert_eq!(new, [&80u16].into_iter().collect());
        assert_eq!(gone, [&8080u16].into_iter().collect());
    }

    #[test]
    fn group_port_state_tracks_independently_per_group() {
        let mut state = GroupPortState::new();
        state.0.insert("http".to_string(), [80].into_iter().collect());
        state.0.insert("browser".to_string(), [9000].into_iter().collect());
        assert_eq!(state.ports_for("http"), [80u16].into_iter().collect());
        assert_eq!(state.ports_for("browser"), [9000u16].into_iter().collect());
        assert!(state.ports_for("unknown").is_empty());
    }

    #[test]
    fn group_absent_from_current_is_treated_as_fully_gone() {
        // Mirrors step 3: a group tracked last tick with ports {80, 443}
        // that vanishes from `current` entirely must see both ports diffed
        // out, not just the ones it happens to share with another group.
        let mut previous = GroupPortState::new();
        previous.0.insert("http".to_string(), [80, 443].into_iter().collect());

        let current: HashMap<String, HashSet<LocalPort>> = HashMap::new();
        assert!(!current.contains_key("http"));

        let previous_ports = previous.ports_for("http");
        let gone: HashSet<LocalPort> = previous_ports
            .difference(&current.get("http").cloned().unwrap_or_default())
            .copied()
            .collect();
        assert_eq!(gone, [80u16, 443u16].into_iter().collect());
    }
}
