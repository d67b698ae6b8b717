//! TC Driver — stateless façade over the kernel traffic-control command
//! surface (`tc qdisc|class|filter ...`).
//!
//! Owns the regex grammar used to parse `tc`'s loosely-specified textual
//! output (ported verbatim from `traffictoll.tc`'s `QDISC_ID_REGEX`,
//! `CLASS_ID_REGEX`, `FILTER_ID_REGEX`) and the free-identifier allocator.
//! Parse failures on individual lines are warnings, never fatal: the
//! operation still returns a best-effort set (spec §4.2).

use crate::error::ShaperError;
use crate::runner::Runner;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static QDISC_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^qdisc\s+\S+\s+([a-z0-9]+):").unwrap());
static CLASS_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^class\s+\S+\s+([a-z0-9]+):([a-z0-9]+)").unwrap());
static FILTER_HANDLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"filter .*? fh ([a-z0-9]+::[a-z0-9]+)").unwrap());

/// TC stores rates as a 32-bit unsigned integer in bps internally (`man tc`).
pub const MAX_RATE: u32 = u32::MAX;

/// Parent handle of the kernel's reserved ingress qdisc.
pub const INGRESS_PARENT: &str = "ffff:fff1";

/// One side (ingress or egress) of the shaping topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy)]
pub struct QDiscHandle {
    pub qdisc_id: u32,
    pub root_class_id: u32,
}

/// Try decimal first, then hex — the documented decimal-then-hex fallback
/// for qdisc ids (the ingress qdisc prints its handle in hex; spec §9).
fn parse_id_token(token: &str) -> Option<u32> {
    u32::from_str_radix(token, 10)
        .ok()
        .or_else(|| u32::from_str_radix(token, 16).ok())
}

pub struct TcDriver<'a> {
    runner: &'a Runner,
}

impl<'a> TcDriver<'a> {
    pub fn new(runner: &'a Runner) -> Self {
        Self { runner }
    }

    fn run_ok(&self, args: &str) -> Result<()> {
        let command = format!("tc {args}");
        let out = self.runner.run(&command, false)?;
        if !out.success() {
            return Err(ShaperError::KernelOpFailure {
                command,
                exit_code: out.exit_code,
            }
            .into());
        }
        Ok(())
    }

    pub fn list_qdisc_ids(&self, device: &str) -> Result<HashSet<u32>> {
        let out = self
            .runner
            .run(&format!("tc qdisc show dev {device}"), true)?;
        let mut ids = HashSet::new();
        for line in out.stdout.lines() {
            match QDISC_ID_RE.captures(line) {
                Some(caps) => {
                    let token = &caps[1];
                    match parse_id_token(token) {
                        Some(id) => {
                            ids.insert(id);
                        }
                        None => log::warn!("unparseable qdisc id token {token:?} in line {line:?}"),
                    }
                }
                None => {}
            }
        }
        Ok(ids)
    }

    pub fn list_class_ids(&self, device: &str, qdisc_id: u32) -> Result<HashSet<u32>> {
        let out = self
            .runner
            .run(&format!("tc class show dev {device}"), true)?;
        let mut ids = HashSet::new();
        for line in out.stdout.lines() {
            let Some(caps) = CLASS_ID_RE.captures(line) else {
                continue;
            };
            let line_qdisc = match parse_id_token(&caps[1]) {
                Some(id) => id,
                None => {
                    log::warn!("unparseable class qdisc id in line {line:?}");
                    continue;
                }
            };
            if line_qdisc != qdisc_id {
                continue;
            }
            match parse_id_token(&caps[2]) {
                Some(id) => {
                    ids.insert(id);
                }
                None => log::warn!("unparseable class id in line {line:?}"),
            }
        }
        Ok(ids)
    }

    pub fn list_filter_handles(&self, device: &str) -> Result<HashSet<String>> {
        let out = self
            .runner
            .run(&format!("tc filter show dev {device}"), true)?;
        let mut handles = HashSet::new();
        for line in out.stdout.lines() {
            if let Some(caps) = FILTER_HANDLE_RE.captures(line) {
                handles.insert(caps[1].to_string());
            }
        }
        Ok(handles)
    }

    /// Smallest positive integer not in `used`.
    pub fn free_id(used: &HashSet<u32>) -> u32 {
        let mut current = 1;
        while used.contains(&current) {
            current += 1;
        }
        current
    }

    pub fn add_htb_qdisc(&self, device: &str, qdisc_id: u32) -> Result<()> {
        self.run_ok(&format!("qdisc add dev {device} root handle {qdisc_id}: htb"))
    }

    pub fn add_root_class(&self, device: &str, qdisc_id: u32, class_id: u32, rate: &str) -> Result<()> {
        self.run_ok(&format!(
            "class add dev {device} parent {qdisc_id}: classid {qdisc_id}:{class_id} htb rate {rate}"
        ))
    }

    /// Allocates a fresh class id and creates it as a child of the root
    /// class with `rate=floor`, `ceil=ceil`; leaves may only borrow from the
    /// parent (no further children beneath a leaf).
    pub fn add_htb_leaf(
        &self,
        device: &str,
        handle: &QDiscHandle,
        ceil_rate: &str,
        floor_rate: &str,
        priority: u32,
    ) -> Result<u32> {
        let used = self.list_class_ids(device, handle.qdisc_id)?;
        let class_id = Self::free_id(&used);
        self.run_ok(&format!(
            "class add dev {device} parent {}:{} classid {}:{class_id} htb rate {floor_rate} ceil {ceil_rate} prio {priority}",
            handle.qdisc_id, handle.root_class_id, handle.qdisc_id
        ))?;
        Ok(class_id)
    }

    /// Installs a priority-1 u32 filter and returns the handle obtained as
    /// the set difference between filter handles observed before and after
    /// insertion. If the difference has more than one element, a warning is
    /// logged and any one element (necessarily one of the new ones, so
    /// removal stays correct) is returned — documented hazard, spec §9.
    pub fn add_u32_filter(
        &self,
        device: &str,
        qdisc_id: u32,
        match_expression: &str,
        class_id: u32,
    ) -> Result<String> {
        let before = self.list_filter_handles(device)?;
        self.run_ok(&format!(
            "filter add dev {device} protocol ip parent {qdisc_id}: prio 1 u32 {match_expression} flowid {qdisc_id}:{class_id}"
        ))?;
        let after = self.list_filter_handles(device)?;

        let mut difference: Vec<String> = after.difference(&before).cloned().collect();
        if difference.is_empty() {
            return Err(ShaperError::DependencyOutputError {
                command: "tc filter add".to_string(),
                detail: "no new filter handle observed after insertion".to_string(),
            }
            .into());
        }
        if difference.len() > 1 {
            log::warn!("parsed ambiguous filter handle: {difference:?}");
        }
        Ok(difference.remove(0))
    }

    pub fn remove_u32_filter(&self, device: &str, qdisc_id: u32, filter_handle: &str) -> Result<()> {
        // Missing-resource failures are tolerated: teardown paths call this
        // on filters that the kernel may already have dropped along with
        // their parent qdisc.
        let command = format!(
            "tc filter del dev {device} parent {qdisc_id}: handle {filter_handle} prio 1 protocol ip u32"
        );
        let out = self.runner.run(&command, false)?;
        if !out.success() {
            log::debug!("tc filter del reported failure (tolerated): {command}");
        }
        Ok(())
    }

    pub fn remove_qdisc(&self, device: &str, parent: &str) -> Result<()> {
        let command = format!("tc qdisc del dev {device} parent {parent}");
        let out = self.runner.run(&command, false)?;
        if !out.success() {
            log::debug!("tc qdisc del reported failure (tolerated): {command}");
        }
        Ok(())
    }

    pub fn attach_ingress_qdisc(&self, device: &str) -> Result<()> {
        self.run_ok(&format!("qdisc add dev {device} handle ffff: ingress"))
    }

    pub fn install_mirror_redirect(&self, device: &str, target_device: &str) -> Result<()> {
        self.run_ok(&format!(
            "filter add dev {device} parent ffff: protocol ip u32 match u32 0 0 action mirred egress redirect dev {target_device}"
        ))
    }

    pub fn install_default_catchall(&self, device: &str, qdisc_id: u32, leaf_class_id: u32) -> Result<()> {
        self.run_ok(&format!(
            "filter add dev {device} parent {qdisc_id}: prio 2 protocol ip u32 match u32 0 0 flowid {qdisc_id}:{leaf_class_id}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_id_smallest_not_in_set() {
        let used: HashSet<u32> = [1, 2, 4].into_iter().collect();
        assert_eq!(TcDriver::free_id(&used), 3);
    }

    #[test]
    fn free_id_empty_set_is_one() {
        assert_eq!(TcDriver::free_id(&HashSet::new()), 1);
    }

    #[test]
    fn qdisc_regex_parses_decimal() {
        let caps = QDISC_ID_RE.captures("qdisc htb 1: dev eth0 root refcnt 2").unwrap();
        assert_eq!(parse_id_token(&caps[1]), Some(1));
    }

    #[test]
    fn qdisc_regex_parses_hex_ingress() {
        let caps = QDISC_ID_RE
            .captures("qdisc ingress ffff: dev eth0 parent ffff:fff1 ----------------")
            .unwrap();
        assert_eq!(parse_id_token(&caps[1]), Some(0xffff));
    }

    #[test]
    fn class_regex_filters_by_qdisc() {
        let line = "class htb 2:10 root prio 0 rate 1000bit ceil 1000bit burst 1600b cburst 1600b";
        let caps = CLASS_ID_RE.captures(line).unwrap();
        assert_eq!(parse_id_token(&caps[1]), Some(2));
        assert_eq!(parse_id_token(&caps[2]), Some(0x10));
    }

    #[test]
    fn filter_handle_regex_extracts_handle() {
        let line = "filter parent 2: protocol ip pref 1 u32 fh 800::800 order 2048 key ht 800 bkt 0";
        let caps = FILTER_HANDLE_RE.captures(line).unwrap();
        assert_eq!(&caps[1], "800::800");
    }
}
