//! Topology Builder — constructs the two HTB trees (ingress side on the IFB
//! device, egress side on the real device), installs the ingress qdisc and
//! mirror-redirect filter, creates per-group leaf classes, and installs the
//! lowest-priority default leaf on each side (spec §4.4).

use crate::config::{GlobalConfig, GroupSpec, Rate};
use crate::ifb::IfbManager;
use crate::runner::Runner;
use crate::tc::{Direction, QDiscHandle, TcDriver, MAX_RATE};
use crate::teardown::TeardownStack;
use anyhow::Result;
use std::collections::HashMap;

/// Per-group leaf class ids, either or both of which may be absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupLeaves {
    pub ingress: Option<u32>,
    pub egress: Option<u32>,
}

/// Everything the Reconciliation Loop needs to install and remove port
/// filters: the two qdisc handles and the per-group leaf class ids.
pub struct Topology {
    pub device: String,
    pub ifb_device: String,
    pub ingress_handle: QDiscHandle,
    pub egress_handle: QDiscHandle,
    pub group_leaves: HashMap<String, GroupLeaves>,
}

impl Topology {
    pub fn handle_for(&self, direction: Direction) -> (&str, QDiscHandle) {
        match direction {
            Direction::Ingress => (self.ifb_device.as_str(), self.ingress_handle),
            Direction::Egress => (self.device.as_str(), self.egress_handle),
        }
    }
}

/// Fixed per-group floors used when a group sets a rate/priority but not a
/// minimum (spec §4.4's "Default rate/minimum rule").
const GROUP_DOWNLOAD_FLOOR: &str = "10kbps";
const GROUP_UPLOAD_FLOOR: &str = "1kbps";
const GLOBAL_DOWNLOAD_MINIMUM: &str = "100kbps";
const GLOBAL_UPLOAD_MINIMUM: &str = "10kbps";

/// `default_priority = max over all groups of max(upload-priority,
/// download-priority) + 1` (missing priorities contribute -1); 0 if no
/// group specifies any priority. This is the corrected formula from spec
/// §9, not the historical revision that sometimes skipped the `+ 1`.
fn compute_default_priority(groups: &[GroupSpec]) -> u32 {
    let max = groups
        .iter()
        .flat_map(|g| [g.download_priority, g.upload_priority])
        .map(|p| p.unwrap_or(-1))
        .max()
        .unwrap_or(-1);
    (max + 1).max(0) as u32
}

struct EffectiveGlobal {
    download_rate: Rate,
    upload_rate: Rate,
    download_minimum: Rate,
    upload_minimum: Rate,
    download_priority: u32,
    upload_priority: u32,
}

fn resolve_global(global: &GlobalConfig, default_priority: u32) -> EffectiveGlobal {
    let download_rate = match &global.download_rate {
        Some(rate) => rate.clone(),
        None => {
            log::warn!(
                "no global download rate configured; using MAX_RATE ({MAX_RATE}) — \
                 prioritization will be ineffective since HTB cannot prioritize \
                 against an unbounded parent"
            );
            Rate(MAX_RATE.to_string())
        }
    };
    let upload_rate = match &global.upload_rate {
        Some(rate) => rate.clone(),
        None => {
            log::warn!(
                "no global upload rate configured; using MAX_RATE ({MAX_RATE}) — \
                 prioritization will be ineffective since HTB cannot prioritize \
                 against an unbounded parent"
            );
            Rate(MAX_RATE.to_string())
        }
    };

    EffectiveGlobal {
        download_rate,
        upload_rate,
        download_minimum: global
            .download_minimum
            .clone()
            .unwrap_or_else(|| Rate(GLOBAL_DOWNLOAD_MINIMUM.to_string())),
        upload_minimum: global
            .upload_minimum
            .clone()
            .unwrap_or_else(|| Rate(GLOBAL_UPLOAD_MINIMUM.to_string())),
        download_priority: global
            .download_priority
            .map(|p| p.max(0) as u32)
            .unwrap_or(default_priority),
        upload_priority: global
            .upload_priority
            .map(|p| p.max(0) as u32)
            .unwrap_or(default_priority),
    }
}

pub struct BuildParams<'a> {
    pub device: &'a str,
    pub global: &'a GlobalConfig,
    pub groups: &'a [GroupSpec],
}

pub fn build(
    runner: &Runner,
    teardown: &mut TeardownStack,
    params: BuildParams,
) -> Result<Topology> {
    let tc = TcDriver::new(runner);
    let ifb = IfbManager::new(runner);

    let device = params.device.to_string();
    let default_priority = compute_default_priority(params.groups);
    let effective_global = resolve_global(params.global, default_priority);

    // Step 1: attach ingress qdisc to the real device.
    tc.attach_ingress_qdisc(&device)?;
    {
        let d = device.clone();
        teardown.push(move || {
            let r = Runner::new();
            let tc = TcDriver::new(&r);
            let _ = tc.remove_qdisc(&d, crate::tc::INGRESS_PARENT);
        });
    }

    // Step 2: acquire an IFB device.
    let ifb_device = ifb.acquire(teardown)?;

    // Step 3: mirror-redirect ingress traffic to the IFB device.
    tc.install_mirror_redirect(&device, &ifb_device)?;

    // Step 4: ingress side — HTB qdisc + root class + default leaf on the IFB device.
    let ingress_qdisc_id = TcDriver::free_id(&tc.list_qdisc_ids(&ifb_device)?);
    tc.add_htb_qdisc(&ifb_device, ingress_qdisc_id)?;
    {
        let d = ifb_device.clone();
        teardown.push(move || {
            let r = Runner::new();
            let tc = TcDriver::new(&r);
            let _ = tc.remove_qdisc(&d, "root");
        });
    }
    let ingress_root_class_id = TcDriver::free_id(&tc.list_class_ids(&ifb_device, ingress_qdisc_id)?);
    tc.add_root_class(
        &ifb_device,
        ingress_qdisc_id,
        ingress_root_class_id,
        effective_global.download_rate.token(),
    )?;
    let ingress_handle = QDiscHandle {
        qdisc_id: ingress_qdisc_id,
        root_class_id: ingress_root_class_id,
    };
    let ingress_default_leaf = tc.add_htb_leaf(
        &ifb_device,
        &ingress_handle,
        effective_global.download_rate.token(),
        effective_global.download_minimum.token(),
        effective_global.download_priority,
    )?;
    tc.install_default_catchall(&ifb_device, ingress_qdisc_id, ingress_default_leaf)?;

    // Step 5: egress side — HTB qdisc + root class + default leaf on the real device.
    let egress_qdisc_id = TcDriver::free_id(&tc.list_qdisc_ids(&device)?);
    tc.add_htb_qdisc(&device, egress_qdisc_id)?;
    {
        let d = device.clone();
        teardown.push(move || {
            let r = Runner::new();
            let tc = TcDriver::new(&r);
            let _ = tc.remove_qdisc(&d, "root");
        });
    }
    let egress_root_class_id = TcDriver::free_id(&tc.list_class_ids(&device, egress_qdisc_id)?);
    tc.add_root_class(
        &device,
        egress_qdisc_id,
        egress_root_class_id,
        effective_global.upload_rate.token(),
    )?;
    let egress_handle = QDiscHandle {
        qdisc_id: egress_qdisc_id,
        root_class_id: egress_root_class_id,
    };
    let egress_default_leaf = tc.add_htb_leaf(
        &device,
        &egress_handle,
        effective_global.upload_rate.token(),
        effective_global.upload_minimum.token(),
        effective_global.upload_priority,
    )?;
    tc.install_default_catchall(&device, egress_qdisc_id, egress_default_leaf)?;

    // Step 6: per-group leaves.
    let mut group_leaves = HashMap::new();
    for group in params.groups {
        let mut leaves = GroupLeaves::default();

        if group.download_rate.is_some() || group.download_priority.is_some() {
            let ceil = group
                .download_rate
                .clone()
                .unwrap_or_else(|| effective_global.download_rate.clone());
            let floor = group
                .download_minimum
                .clone()
                .unwrap_or_else(|| Rate(GROUP_DOWNLOAD_FLOOR.to_string()));
            let priority = group
                .download_priority
                .map(|p| p.max(0) as u32)
                .unwrap_or(default_priority);
            let class_id =
                tc.add_htb_leaf(&ifb_device, &ingress_handle, ceil.token(), floor.token(), priority)?;
            leaves.ingress = Some(class_id);
        }

        if group.upload_rate.is_some() || group.upload_priority.is_some() {
            let ceil = group
                .upload_rate
                .clone()
                .unwrap_or_else(|| effective_global.upload_rate.clone());
            let floor = group
                .upload_minimum
                .clone()
                .unwrap_or_else(|| Rate(GROUP_UPLOAD_FLOOR.to_string()));
            let priority = group
                .upload_priority
                .map(|p| p.max(0) as u32)
                .unwrap_or(default_priority);
            let class_id =
                tc.add_htb_leaf(&device, &egress_handle, ceil.token(), floor.token(), priority)?;
            leaves.egress = Some(class_id);
        }

        group_leaves.insert(group.name.clone(), leaves);
    }

    Ok(Topology {
        device,
        ifb_device,
        ingress_handle,
        egress_handle,
        group_leaves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupSpec;

    fn group(name: &str, dp: Option<i64>, up: Option<i64>) -> GroupSpec {
        GroupSpec {
            name: name.to_string(),
            match_conditions: Vec::new(),
            recursive: false,
            download_rate: None,
            download_minimum: None,
            download_priority: dp,
            upload_rate: None,
            upload_minimum: None,
            upload_priority: up,
        }
    }

    #[test]
    fn default_priority_with_specified_priorities() {
        let groups = vec![
            group("a", Some(2), None),
            group("b", Some(5), None),
            group("c", Some(3), None),
        ];
        assert_eq!(compute_default_priority(&groups), 6);
    }

    #[test]
    fn default_priority_with_no_priorities_is_zero() {
        let groups = vec![group("a", None, None), group("b", None, None)];
        assert_eq!(compute_default_priority(&groups), 0);
    }

    #[test]
    fn default_priority_with_no_groups_is_zero() {
        assert_eq!(compute_default_priority(&[]), 0);
    }

    #[test]
    fn default_priority_considers_both_directions() {
        let groups = vec![group("a", Some(1), Some(9))];
        assert_eq!(compute_default_priority(&groups), 10);
    }
}
