//! Per-repo environment descriptor
//!
//! A repo describes its environment either as JSON at `minienv.json` or as
//! YAML at `.github/minienv.yml` under a `metadata` key; the YAML form wins
//! when both exist. When the descriptor does not pin a platform, the tab
//! list is derived from the repo's Compose file.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_yaml::Value;
use tracing::debug;

use crate::details::Tab;
use crate::repo::{RepoCredentials, RepoFetcher};

pub const DESCRIPTOR_JSON_PATH: &str = "minienv.json";
pub const DESCRIPTOR_YAML_PATH: &str = ".github/minienv.yml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvDescriptor {
    #[serde(default)]
    pub env: Option<DescriptorEnv>,
    #[serde(default)]
    pub editor: Option<DescriptorEditor>,
    #[serde(default)]
    pub proxy: Option<DescriptorProxy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorEnv {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub vars: Option<Vec<DescriptorEnvVar>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorEnvVar {
    pub name: String,
    #[serde(default, rename = "defaultValue")]
    pub default_value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorEditor {
    #[serde(default)]
    pub hide: bool,
    #[serde(default, rename = "srcDir")]
    pub src_dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorProxy {
    #[serde(default)]
    pub ports: Option<Vec<DescriptorProxyPort>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorProxyPort {
    pub port: u16,
    #[serde(default)]
    pub hide: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub tabs: Option<Vec<DescriptorProxyTab>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorProxyTab {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
}

impl EnvDescriptor {
    /// Platform pinned by the descriptor, empty when not declared.
    pub fn platform(&self) -> &str {
        self.env
            .as_ref()
            .and_then(|e| e.platform.as_deref())
            .unwrap_or("")
    }

    /// First non-hidden proxy port, used as the platform port.
    pub fn first_proxy_port(&self) -> Option<u16> {
        self.proxy
            .as_ref()?
            .ports
            .as_ref()?
            .iter()
            .find(|p| !p.hide)
            .map(|p| p.port)
    }
}

/// Wrapper for the YAML descriptor variant.
#[derive(Debug, Deserialize)]
struct DescriptorDocument {
    #[serde(default)]
    metadata: Option<EnvDescriptor>,
}

/// Download the repo's descriptor.
///
/// Absent files yield `Ok(None)`; files that exist but fail to parse are an
/// error.
pub async fn download_descriptor(
    fetcher: &dyn RepoFetcher,
    repo: &str,
    branch: &str,
    creds: &RepoCredentials,
) -> Result<Option<EnvDescriptor>> {
    if let Some(body) = fetcher.fetch(repo, branch, DESCRIPTOR_YAML_PATH, creds).await? {
        let document: DescriptorDocument =
            serde_yaml::from_str(&body).context("parsing .github/minienv.yml")?;
        if let Some(descriptor) = document.metadata {
            return Ok(Some(descriptor));
        }
        debug!("descriptor yaml present but carries no metadata");
    }
    if let Some(body) = fetcher.fetch(repo, branch, DESCRIPTOR_JSON_PATH, creds).await? {
        let descriptor: EnvDescriptor =
            serde_json::from_str(&body).context("parsing minienv.json")?;
        return Ok(Some(descriptor));
    }
    Ok(None)
}

/// Download and parse the repo's Compose file (`.yml`, then `.yaml`).
pub async fn download_compose(
    fetcher: &dyn RepoFetcher,
    repo: &str,
    branch: &str,
    creds: &RepoCredentials,
) -> Result<Value> {
    let body = match fetcher
        .fetch(repo, branch, "docker-compose.yml", creds)
        .await?
    {
        Some(body) => body,
        None => fetcher
            .fetch(repo, branch, "docker-compose.yaml", creds)
            .await?
            .ok_or_else(|| anyhow!("repo has no docker-compose file"))?,
    };
    serde_yaml::from_str(&body).context("parsing docker-compose file")
}

/// Collect a tab for every `ports` leaf in the Compose document.
///
/// Only string entries whose host side (`HOST:CONTAINER`) is numeric
/// contribute; everything else is ignored.
pub fn compose_tabs(document: &Value) -> Vec<Tab> {
    let mut tabs = Vec::new();
    walk_ports(document, None, &mut tabs);
    tabs
}

fn walk_ports(value: &Value, parent: Option<&str>, tabs: &mut Vec<Tab>) {
    match value {
        Value::String(entry) => {
            if parent == Some("ports") {
                if let Some(port) = host_port(entry) {
                    tabs.push(Tab::for_port(port));
                }
            }
        }
        Value::Sequence(items) => {
            for item in items {
                walk_ports(item, parent, tabs);
            }
        }
        Value::Mapping(mapping) => {
            for (key, item) in mapping {
                let key = key.as_str().map(str::to_lowercase);
                walk_ports(item, key.as_deref(), tabs);
            }
        }
        _ => {}
    }
}

/// Host side of a `HOST:CONTAINER` port mapping.
fn host_port(entry: &str) -> Option<u16> {
    entry.splitn(2, ':').next()?.parse().ok()
}

/// Apply the descriptor's proxy-port overrides to the Compose-derived tabs.
///
/// Hidden ports are skipped. A port with sub-tabs updates the matching tab
/// with the first sub-tab and appends the rest; a port without sub-tabs
/// updates the matching tab directly. Ports with no Compose match are
/// synthesized. Names default to the port rendered as a string.
pub fn apply_proxy_overrides(tabs: &mut Vec<Tab>, descriptor: &EnvDescriptor) {
    let Some(ports) = descriptor.proxy.as_ref().and_then(|p| p.ports.as_ref()) else {
        return;
    };
    for proxy_port in ports {
        if proxy_port.hide {
            continue;
        }
        match proxy_port.tabs.as_ref().filter(|t| !t.is_empty()) {
            Some(sub_tabs) => {
                for (index, sub_tab) in sub_tabs.iter().enumerate() {
                    if index == 0 {
                        if !update_matching(tabs, proxy_port.port, &sub_tab.name, &sub_tab.path) {
                            tabs.push(override_tab(proxy_port.port, &sub_tab.name, &sub_tab.path));
                        }
                    } else {
                        tabs.push(override_tab(proxy_port.port, &sub_tab.name, &sub_tab.path));
                    }
                }
            }
            None => {
                if !update_matching(tabs, proxy_port.port, &proxy_port.name, &proxy_port.path) {
                    tabs.push(override_tab(proxy_port.port, &proxy_port.name, &proxy_port.path));
                }
            }
        }
    }
}

fn update_matching(tabs: &mut [Tab], port: u16, name: &str, path: &str) -> bool {
    let mut matched = false;
    for tab in tabs.iter_mut().filter(|t| t.port == port) {
        if !name.is_empty() {
            tab.name = name.to_string();
        }
        if !path.is_empty() {
            tab.path = path.to_string();
        }
        matched = true;
    }
    matched
}

fn override_tab(port: u16, name: &str, path: &str) -> Tab {
    Tab {
        port,
        name: if name.is_empty() {
            port.to_string()
        } else {
            name.to_string()
        },
        url: String::new(),
        path: path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_compose_tabs_numeric_host_side() {
        let doc = parse(
            r#"
version: "2"
services:
  web:
    image: nginx
    ports:
      - "8080:80"
      - "9000:90"
"#,
        );
        let tabs = compose_tabs(&doc);
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].port, 8080);
        assert_eq!(tabs[0].name, "8080");
        assert_eq!(tabs[1].port, 9000);
    }

    #[test]
    fn test_compose_tabs_ignores_non_numeric_host() {
        let doc = parse(
            r#"
services:
  web:
    ports:
      - "http:80"
"#,
        );
        assert!(compose_tabs(&doc).is_empty());
    }

    #[test]
    fn test_compose_tabs_ignores_ports_elsewhere() {
        let doc = parse(
            r#"
services:
  web:
    environment:
      - "8080:80"
"#,
        );
        assert!(compose_tabs(&doc).is_empty());
    }

    #[test]
    fn test_compose_tabs_bare_port() {
        let doc = parse(
            r#"
services:
  web:
    ports:
      - "3000"
"#,
        );
        let tabs = compose_tabs(&doc);
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].port, 3000);
    }

    #[test]
    fn test_compose_tabs_scalar_document_does_not_panic() {
        assert!(compose_tabs(&parse("42")).is_empty());
        assert!(compose_tabs(&parse("null")).is_empty());
    }

    #[test]
    fn test_proxy_override_updates_matching_tab() {
        let mut tabs = vec![Tab::for_port(8080), Tab::for_port(9000)];
        let descriptor: EnvDescriptor = serde_json::from_str(
            r#"{"proxy":{"ports":[{"port":8080,"name":"app","path":"/"}]}}"#,
        )
        .unwrap();
        apply_proxy_overrides(&mut tabs, &descriptor);
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].name, "app");
        assert_eq!(tabs[0].path, "/");
        assert_eq!(tabs[1].name, "9000");
        assert_eq!(tabs[1].path, "");
    }

    #[test]
    fn test_proxy_override_hidden_port_skipped() {
        let mut tabs = vec![Tab::for_port(8080)];
        let descriptor: EnvDescriptor = serde_json::from_str(
            r#"{"proxy":{"ports":[{"port":8080,"hide":true,"name":"app"}]}}"#,
        )
        .unwrap();
        apply_proxy_overrides(&mut tabs, &descriptor);
        assert_eq!(tabs[0].name, "8080");
    }

    #[test]
    fn test_proxy_override_sub_tabs() {
        let mut tabs = vec![Tab::for_port(8080)];
        let descriptor: EnvDescriptor = serde_json::from_str(
            r#"{"proxy":{"ports":[{"port":8080,"tabs":[
                {"name":"first","path":"/a"},
                {"name":"second","path":"/b"}
            ]}]}}"#,
        )
        .unwrap();
        apply_proxy_overrides(&mut tabs, &descriptor);
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].name, "first");
        assert_eq!(tabs[0].path, "/a");
        assert_eq!(tabs[1].port, 8080);
        assert_eq!(tabs[1].name, "second");
        assert_eq!(tabs[1].path, "/b");
    }

    #[test]
    fn test_proxy_override_synthesizes_unmatched_port() {
        let mut tabs = Vec::new();
        let descriptor: EnvDescriptor =
            serde_json::from_str(r#"{"proxy":{"ports":[{"port":4000}]}}"#).unwrap();
        apply_proxy_overrides(&mut tabs, &descriptor);
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].port, 4000);
        assert_eq!(tabs[0].name, "4000");
    }

    #[test]
    fn test_descriptor_platform_accessors() {
        let descriptor: EnvDescriptor = serde_json::from_str(
            r#"{"env":{"platform":"node"},"proxy":{"ports":[{"port":3000,"hide":true},{"port":3001}]}}"#,
        )
        .unwrap();
        assert_eq!(descriptor.platform(), "node");
        assert_eq!(descriptor.first_proxy_port(), Some(3001));
    }
}
