//! Process/Socket Resolver — enumerates processes and their local TCP/UDP
//! sockets, applies each group's predicate set, and yields the set of local
//! ports currently owned by each group (spec §4.5).
//!
//! Attribute reading is grounded in `/proc` parsing already used by the
//! donor codebase's `ProcessDetails::from_pid` and its procfs-based socket
//! mapper: `comm` for `name`, the `exe` symlink target, `cmdline` split on
//! NUL and rejoined with single spaces, and the decimal string of `pid`
//! itself.

use crate::config::GroupSpec;
use crate::error::ShaperError;
use anyhow::Result;
use procfs::process::{FDTarget, Process};
use regex::Regex;
use std::collections::{HashMap, HashSet};

pub type LocalPort = u16;

/// One compiled `(attribute, regex)` condition.
struct CompiledCondition {
    attribute: String,
    regex: Regex,
}

/// A group's predicate set plus its recursion flag, precompiled once so the
/// Reconciliation Loop doesn't recompile regexes every tick.
pub struct CompiledGroup {
    pub name: String,
    conditions: Vec<CompiledCondition>,
    pub recursive: bool,
}

impl CompiledGroup {
    pub fn compile(spec: &GroupSpec) -> Result<Self> {
        let mut conditions = Vec::with_capacity(spec.match_conditions.len());
        for condition in &spec.match_conditions {
            let regex = Regex::new(&condition.regex)?;
            conditions.push(CompiledCondition {
                attribute: condition.attribute.clone(),
                regex,
            });
        }
        Ok(Self {
            name: spec.name.clone(),
            conditions,
            recursive: spec.recursive,
        })
    }
}

/// Reads a process attribute as the string form the predicate language
/// operates on: integers become their decimal form, sequences are joined
/// with single spaces (spec §4.5b).
fn read_attribute(pid: i32, attribute: &str) -> Option<String> {
    match attribute {
        "name" => std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .ok()
            .map(|s| s.trim().to_string()),
        "exe" => std::fs::read_link(format!("/proc/{pid}/exe"))
            .ok()
            .map(|p| p.to_string_lossy().into_owned()),
        "cmdline" => std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
            .ok()
            .map(|s| {
                s.split('\0')
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
        "pid" => Some(pid.to_string()),
        _ => None,
    }
}

/// Left-anchored, right-unanchored match: Python's `re.match` semantics.
fn matches_anchored(regex: &Regex, value: &str) -> bool {
    regex.find(value).map(|m| m.start() == 0).unwrap_or(false)
}

fn evaluate_predicate(pid: i32, conditions: &[CompiledCondition]) -> bool {
    conditions.iter().all(|condition| {
        match read_attribute(pid, &condition.attribute) {
            Some(value) => matches_anchored(&condition.regex, &value),
            None => {
                log::debug!(
                    "{} (attribute {:?} unreadable while evaluating predicate)",
                    ShaperError::RaceOnProcess { pid },
                    condition.attribute
                );
                false
            }
        }
    })
}

fn all_pids() -> Vec<i32> {
    match procfs::process::all_processes() {
        Ok(iter) => iter
            .filter_map(|p| p.ok())
            .map(|p: Process| p.pid())
            .collect(),
        Err(e) => {
            log::warn!("failed to enumerate processes: {e}");
            Vec::new()
        }
    }
}

fn parent_pid(pid: i32) -> Option<i32> {
    Process::new(pid).ok()?.stat().ok().map(|s| s.ppid)
}

/// Transitive descendants of `pid`. Races with process death mid-traversal
/// are silently tolerated — a vanished candidate is simply dropped from the
/// frontier (spec §4.5: "descendant lookup races ... silently tolerated").
fn descendants(pid: i32, children_of: &HashMap<i32, Vec<i32>>) -> HashSet<i32> {
    let mut result = HashSet::new();
    let mut frontier = vec![pid];
    while let Some(current) = frontier.pop() {
        if let Some(children) = children_of.get(&current) {
            for &child in children {
                if result.insert(child) {
                    frontier.push(child);
                }
            }
        }
    }
    result
}

/// Local ports currently open by each pid, restricted to IPv4 TCP/UDP (the
/// controller's Non-goal excludes non-IPv4 shaping, so IPv6 sockets are
/// never surfaced into a group's port set).
fn pid_to_local_ports() -> HashMap<i32, HashSet<LocalPort>> {
    let mut socket_to_pid: HashMap<u64, i32> = HashMap::new();

    if let Ok(procs) = procfs::process::all_processes() {
        for proc_result in procs {
            let Ok(process) = proc_result else { continue };
            let pid = process.pid();
            let Ok(fds) = process.fd() else { continue };
            for fd_result in fds {
                let Ok(fd) = fd_result else { continue };
                if let FDTarget::Socket(inode) = fd.target {
                    socket_to_pid.insert(inode, pid);
                }
            }
        }
    }

    let mut ports: HashMap<i32, HashSet<LocalPort>> = HashMap::new();
    let mut record = |inode: u64, port: u16| {
        if let Some(&pid) = socket_to_pid.get(&inode) {
            ports.entry(pid).or_default().insert(port);
        }
    };

    if let Ok(entries) = procfs::net::tcp() {
        for entry in entries {
            record(entry.inode, entry.local_address.port());
        }
    }
    if let Ok(entries) = procfs::net::udp() {
        for entry in entries {
            record(entry.inode, entry.local_address.port());
        }
    }

    ports
}

/// Enumerates live processes, applies each group's predicate set, and
/// returns the set of local ports currently owned by each group name.
///
/// A group that currently owns no ports (no process matched its predicate
/// set, or matched processes hold no sockets) is omitted from the result
/// entirely rather than mapped to an empty set — the donor's
/// `filter_net_connections`-style lookup has the same
/// present-only-when-nonempty shape, and the Reconciliation Loop's
/// "group name previously tracked but absent from current" step (spec
/// §4.6 step 3) depends on that absence to detect a group going dark.
pub fn resolve(groups: &[CompiledGroup]) -> HashMap<String, HashSet<LocalPort>> {
    let pids = all_pids();

    // Build the pid parent/child index once, lazily, only if any group is recursive.
    let need_descendants = groups.iter().any(|g| g.recursive);
    let children_of: HashMap<i32, Vec<i32>> = if need_descendants {
        let mut index: HashMap<i32, Vec<i32>> = HashMap::new();
        for &pid in &pids {
            if let Some(ppid) = parent_pid(pid) {
                index.entry(ppid).or_default().push(pid);
            }
        }
        index
    } else {
        HashMap::new()
    };

    let port_index = pid_to_local_ports();

    let mut result: HashMap<String, HashSet<LocalPort>> = HashMap::new();
    for group in groups {
        let mut owned_pids = HashSet::new();
        for &pid in &pids {
            if evaluate_predicate(pid, &group.conditions) {
                owned_pids.insert(pid);
                if group.recursive {
                    owned_pids.extend(descendants(pid, &children_of));
                }
            }
        }

        let mut ports = HashSet::new();
        for pid in owned_pids {
            if let Some(pid_ports) = port_index.get(&pid) {
                ports.extend(pid_ports);
            }
        }
        if !ports.is_empty() {
            result.insert(group.name.clone(), ports);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchored_left_not_right() {
        let re = Regex::new("^chrom").unwrap();
        assert!(matches_anchored(&re, "chromium"));
        assert!(!matches_anchored(&re, "google-chromium"));
    }

    #[test]
    fn descendants_traverses_transitively() {
        let mut children_of = HashMap::new();
        children_of.insert(1, vec![2, 3]);
        children_of.insert(2, vec![4]);
        let set = descendants(1, &children_of);
        assert_eq!(set, [2, 3, 4].into_iter().collect());
    }

    #[test]
    fn descendants_of_leaf_is_empty() {
        let children_of: HashMap<i32, Vec<i32>> = HashMap::new();
        assert!(descendants(99, &children_of).is_empty());
    }

    #[test]
    fn resolve_omits_groups_owning_no_ports() {
        let spec = GroupSpec {
            name: "nothing-matches-this".to_string(),
            match_conditions: vec![crate::config::MatchCondition {
                attribute: "name".to_string(),
                regex: "^definitely-no-such-process-zzz$".to_string(),
            }],
            recursive: false,
            download_rate: None,
            download_minimum: None,
            download_priority: None,
            upload_rate: None,
            upload_minimum: None,
            upload_priority: None,
        };
        let groups = vec![CompiledGroup::compile(&spec).unwrap()];
        let result = resolve(&groups);
        assert!(
            !result.contains_key("nothing-matches-this"),
            "a group owning no ports must be absent from the result, not mapped to an empty set"
        );
    }
}
