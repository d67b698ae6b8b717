//! Configuration loading — a narrow, typed collaborator over the YAML
//! document described in spec §6. Parsing itself (the mapping loader) is
//! explicitly out of scope for the shaping controller's core per spec §1,
//! so this module stays a thin `serde_yaml` adapter plus the structural
//! validation spec §7 assigns to `ConfigError`.

use crate::error::ShaperError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// A rate token such as `"2mbps"` or a bare decimal bps count. Kept
/// unit-preserving: the TC Driver forwards it verbatim since numeric
/// interpretation is the kernel tool's job (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rate(pub String);

impl Rate {
    pub fn token(&self) -> &str {
        &self.0
    }
}

/// One `(attribute, regex)` condition in a predicate set.
#[derive(Debug, Clone)]
pub struct MatchCondition {
    pub attribute: String,
    pub regex: String,
}

/// A fully-validated process group, ready for the Topology Builder.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub name: String,
    pub match_conditions: Vec<MatchCondition>,
    pub recursive: bool,
    pub download_rate: Option<Rate>,
    pub download_minimum: Option<Rate>,
    pub download_priority: Option<i64>,
    pub upload_rate: Option<Rate>,
    pub upload_minimum: Option<Rate>,
    pub upload_priority: Option<i64>,
}

/// Global caps and defaults from the top level of the config document.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub download_rate: Option<Rate>,
    pub upload_rate: Option<Rate>,
    pub download_minimum: Option<Rate>,
    pub upload_minimum: Option<Rate>,
    pub download_priority: Option<i64>,
    pub upload_priority: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub global: GlobalConfig,
    pub groups: Vec<GroupSpec>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    download: Option<String>,
    upload: Option<String>,
    #[serde(rename = "download-minimum")]
    download_minimum: Option<String>,
    #[serde(rename = "upload-minimum")]
    upload_minimum: Option<String>,
    #[serde(rename = "download-priority")]
    download_priority: Option<i64>,
    #[serde(rename = "upload-priority")]
    upload_priority: Option<i64>,
    #[serde(default)]
    processes: HashMap<String, RawGroup>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    #[serde(default)]
    #[serde(rename = "match")]
    match_: Vec<HashMap<String, String>>,
    #[serde(default)]
    recursive: bool,
    download: Option<String>,
    upload: Option<String>,
    #[serde(rename = "download-minimum")]
    download_minimum: Option<String>,
    #[serde(rename = "upload-minimum")]
    upload_minimum: Option<String>,
    #[serde(rename = "download-priority")]
    download_priority: Option<i64>,
    #[serde(rename = "upload-priority")]
    upload_priority: Option<i64>,
}

fn rate(token: Option<String>) -> Option<Rate> {
    token.map(Rate)
}

/// Load and validate a configuration document from disk.
pub fn load(path: &Path) -> Result<ResolvedConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse(&contents)
}

/// Parse a configuration document already read into memory.
pub fn parse(contents: &str) -> Result<ResolvedConfig> {
    let raw: RawConfig = serde_yaml::from_str(contents)
        .map_err(|e| ShaperError::ConfigError(format!("failed to parse config: {e}")))?;

    let global = GlobalConfig {
        download_rate: rate(raw.download),
        upload_rate: rate(raw.upload),
        download_minimum: rate(raw.download_minimum),
        upload_minimum: rate(raw.upload_minimum),
        download_priority: raw.download_priority,
        upload_priority: raw.upload_priority,
    };

    let mut groups = Vec::new();
    for (name, group) in raw.processes {
        if group.match_.is_empty() {
            log::warn!("group {name:?} has no match conditions, skipping");
            continue;
        }

        let mut match_conditions = Vec::with_capacity(group.match_.len());
        for condition in &group.match_ {
            let Some((attribute, regex)) = condition.iter().next() else {
                return Err(ShaperError::ConfigError(format!(
                    "group {name:?} has an empty match condition"
                ))
                .into());
            };
            match_conditions.push(MatchCondition {
                attribute: attribute.clone(),
                regex: regex.clone(),
            });
        }

        groups.push(GroupSpec {
            name,
            match_conditions,
            recursive: group.recursive,
            download_rate: rate(group.download),
            download_minimum: rate(group.download_minimum),
            download_priority: group.download_priority,
            upload_rate: rate(group.upload),
            upload_minimum: rate(group.upload_minimum),
            upload_priority: group.upload_priority,
        });
    }

    // Group names come from a mapping's keys and are therefore already
    // unique by construction; re-check explicitly so a future refactor
    // that builds `groups` from something other than a map still trips
    // spec's "collisions are rejected" rule.
    let mut seen = std::collections::HashSet::new();
    for group in &groups {
        if !seen.insert(group.name.clone()) {
            return Err(ShaperError::ConfigError(format!(
                "duplicate group name: {:?}",
                group.name
            ))
            .into());
        }
    }

    Ok(ResolvedConfig { global, groups })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let doc = r#"
download: 100mbps
upload: 20mbps
processes:
  http:
    match:
      - name: "^nginx$"
    download: 2mbps
"#;
        let config = parse(doc).unwrap();
        assert_eq!(config.global.download_rate, Some(Rate("100mbps".into())));
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].name, "http");
        assert_eq!(config.groups[0].match_conditions.len(), 1);
        assert_eq!(config.groups[0].match_conditions[0].attribute, "name");
        assert_eq!(config.groups[0].match_conditions[0].regex, "^nginx$");
    }

    #[test]
    fn group_without_match_is_skipped() {
        let doc = r#"
processes:
  broken:
    download: 1mbps
"#;
        let config = parse(doc).unwrap();
        assert!(config.groups.is_empty());
    }

    #[test]
    fn empty_config_has_no_groups() {
        let config = parse("{}").unwrap();
        assert!(config.groups.is_empty());
        assert!(config.global.download_rate.is_none());
    }

    #[test]
    fn malformed_yaml_is_config_error() {
        let err = parse("download: [this is not a scalar").unwrap_err();
        assert!(err.to_string().contains("config") || err.downcast_ref::<ShaperError>().is_some());
    }

    #[test]
    fn loads_from_a_real_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shaper.yaml");
        std::fs::write(
            &path,
            r#"
download: 50mbps
upload: 10mbps
processes:
  browser:
    match:
      - name: "^firefox$"
    upload: 1mbps
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.global.download_rate, Some(Rate("50mbps".into())));
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].name, "browser");
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.yaml");
        assert!(load(&missing).is_err());
    }
}
