//! IFB Device Manager — acquires an intermediate functional-block pseudo
//! device usable for ingress redirection, reusing an existing inactive one
//! where possible and recording exactly what it changed so teardown can
//! restore prior host state (spec §4.3).

use crate::runner::Runner;
use crate::teardown::TeardownStack;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static IFB_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^ifb\d+$").unwrap());

fn list_interfaces() -> Result<HashSet<String>> {
    let mut names = HashSet::new();
    for entry in procfs::net::dev_status().context("failed to read /proc/net/dev")? {
        names.insert(entry.0);
    }
    Ok(names)
}

fn is_interface_up(name: &str) -> bool {
    std::fs::read_to_string(format!("/sys/class/net/{name}/operstate"))
        .map(|s| s.trim() != "down")
        .unwrap_or(false)
}

pub struct IfbManager<'a> {
    runner: &'a Runner,
}

impl<'a> IfbManager<'a> {
    pub fn new(runner: &'a Runner) -> Self {
        Self { runner }
    }

    /// Acquire an IFB device, registering whatever teardown action restores
    /// the host to its prior state (spec §4.3: the manager must not unload
    /// a module it did not load).
    pub fn acquire(&self, teardown: &mut TeardownStack) -> Result<String> {
        let interfaces = list_interfaces()?;
        if let Some(existing) = interfaces.iter().find(|name| IFB_NAME_RE.is_match(name)) {
            let name = existing.clone();
            if is_interface_up(&name) {
                return Ok(name);
            }

            self.bring_up(&name)?;
            let down_name = name.clone();
            teardown.push(move || {
                let runner = Runner::new();
                let _ = runner.run(&format!("ip link set dev {down_name} down"), false);
            });
            return Ok(name);
        }

        self.create_and_load(teardown)
    }

    fn bring_up(&self, name: &str) -> Result<()> {
        let out = self
            .runner
            .run(&format!("ip link set dev {name} up"), false)?;
        if !out.success() {
            anyhow::bail!("failed to bring up IFB device {name}");
        }
        Ok(())
    }

    fn create_and_load(&self, teardown: &mut TeardownStack) -> Result<String> {
        let before = list_interfaces()?;

        let out = self
            .runner
            .run("modprobe ifb numifbs=1", false)?;
        if !out.success() {
            anyhow::bail!("failed to load ifb kernel module");
        }

        let after = list_interfaces()?;
        let mut new_devices: Vec<String> = after.difference(&before).cloned().collect();
        if new_devices.is_empty() {
            anyhow::bail!("ifb module load did not create a new interface");
        }
        if new_devices.len() > 1 {
            log::warn!("ambiguous set of interfaces created by ifb module load: {new_devices:?}");
        }
        let name = new_devices.remove(0);

        self.bring_up(&name)?;

        teardown.push(|| {
            let runner = Runner::new();
            let _ = runner.run("rmmod ifb", false);
        });

        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifb_name_regex_matches_digits_only() {
        assert!(IFB_NAME_RE.is_match("ifb0"));
        assert!(IFB_NAME_RE.is_match("ifb12"));
        assert!(!IFB_NAME_RE.is_match("ifb"));
        assert!(!IFB_NAME_RE.is_match("eth0"));
        assert!(!IFB_NAME_RE.is_match("ifbx0"));
    }
}
