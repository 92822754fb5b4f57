//! Tool presets and the Dockerfile layer built on top of the base agent image.
//!
//! The raw `tools.yaml` document is resolved into flat per-installer package
//! lists. Image staleness is tracked by hashing the raw file bytes, not the
//! resolved lists, so any edit to the file triggers a rebuild.

use crate::error::CyrusError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const TOOLS_HASH_LEN: usize = 16;

pub const TOOLS_TEMPLATE_YAML: &str = r#"# Extra tooling baked into the Cyrus image.
# Run `cyrus-local tools list` to see the available presets.
# Any change to this file triggers an image rebuild on the next `start`.

presets: []
#  - python
#  - rust

apt: []
npm: []
pip: []
cargo: []

# Shell commands run in order, one RUN line each.
commands: []

# Extra Dockerfile instructions appended after the generated layers.
# customDockerfile: Dockerfile.custom
"#;

/// Package installs need root; the agent itself runs as the image's `node` user.
const INSTALL_USER: &str = "root";
const RUNTIME_USER: &str = "node";

const RUSTUP_BOOTSTRAP: &str = "command -v cargo >/dev/null 2>&1 || (curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | RUSTUP_HOME=/usr/local/rustup CARGO_HOME=/usr/local/cargo sh -s -- -y --no-modify-path --profile minimal && ln -sf /usr/local/cargo/bin/* /usr/local/bin/)";

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ToolConfig {
    pub presets: Vec<String>,
    pub apt: Vec<String>,
    pub npm: Vec<String>,
    pub pip: Vec<String>,
    pub cargo: Vec<String>,
    pub commands: Vec<String>,
    pub custom_dockerfile: Option<String>,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTools {
    pub apt: Vec<String>,
    pub npm: Vec<String>,
    pub pip: Vec<String>,
    pub cargo: Vec<String>,
    pub commands: Vec<String>,
    pub custom_dockerfile: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub apt: &'static [&'static str],
    pub npm: &'static [&'static str],
    pub pip: &'static [&'static str],
    pub cargo: &'static [&'static str],
    pub commands: &'static [&'static str],
}

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "python",
        description: "Python 3 with pip and venv",
        apt: &["python3", "python3-pip", "python3-venv"],
        npm: &[],
        pip: &[],
        cargo: &[],
        commands: &[],
    },
    Preset {
        name: "rust",
        description: "Rust toolchain via rustup",
        apt: &["build-essential", "pkg-config", "libssl-dev", "curl"],
        npm: &[],
        pip: &[],
        cargo: &[],
        commands: &[RUSTUP_BOOTSTRAP],
    },
    Preset {
        name: "go",
        description: "Go compiler",
        apt: &["golang-go"],
        npm: &[],
        pip: &[],
        cargo: &[],
        commands: &[],
    },
    Preset {
        name: "ruby",
        description: "Ruby with bundler",
        apt: &["ruby-full", "build-essential"],
        npm: &[],
        pip: &[],
        cargo: &[],
        commands: &["gem install bundler"],
    },
    Preset {
        name: "java",
        description: "OpenJDK with Maven",
        apt: &["default-jdk", "maven"],
        npm: &[],
        pip: &[],
        cargo: &[],
        commands: &[],
    },
    Preset {
        name: "aws",
        description: "AWS CLI v2",
        apt: &["curl", "unzip"],
        npm: &[],
        pip: &[],
        cargo: &[],
        commands: &["curl -sSL \"https://awscli.amazonaws.com/awscli-exe-linux-$(uname -m).zip\" -o /tmp/awscliv2.zip && unzip -q /tmp/awscliv2.zip -d /tmp && /tmp/aws/install && rm -rf /tmp/aws /tmp/awscliv2.zip"],
    },
    Preset {
        name: "kubernetes",
        description: "kubectl and helm",
        apt: &["curl", "ca-certificates"],
        npm: &[],
        pip: &[],
        cargo: &[],
        commands: &[
            "curl -sSLo /usr/local/bin/kubectl \"https://dl.k8s.io/release/$(curl -sSL https://dl.k8s.io/release/stable.txt)/bin/linux/$(dpkg --print-architecture)/kubectl\" && chmod +x /usr/local/bin/kubectl",
            "curl -sSL https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3 | bash",
        ],
    },
    Preset {
        name: "terraform",
        description: "HashiCorp Terraform",
        apt: &["curl", "unzip"],
        npm: &[],
        pip: &[],
        cargo: &[],
        commands: &["curl -sSLo /tmp/terraform.zip \"https://releases.hashicorp.com/terraform/1.9.8/terraform_1.9.8_linux_$(dpkg --print-architecture).zip\" && unzip -q /tmp/terraform.zip -d /usr/local/bin && rm /tmp/terraform.zip"],
    },
];

pub fn find_preset(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|preset| preset.name == name.trim())
}

pub fn parse_tool_config(content: &str) -> Result<ToolConfig, CyrusError> {
    let value: serde_yaml::Value = serde_yaml::from_str(content)?;
    if value.is_null() {
        return Ok(ToolConfig::default());
    }
    Ok(serde_yaml::from_value(value)?)
}

fn extend_owned(target: &mut Vec<String>, items: &[&str]) {
    target.extend(items.iter().map(|item| item.to_string()));
}

fn dedup_in_place(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

/// Expands presets in list order, then appends user entries. Package lists are
/// deduplicated; commands are kept verbatim since order and repetition matter.
pub fn resolve_config(raw: &ToolConfig) -> ResolvedTools {
    let mut resolved = ResolvedTools::default();
    for name in &raw.presets {
        let Some(preset) = find_preset(name) else {
            warn!(preset = %name, "unknown tool preset, skipping");
            continue;
        };
        extend_owned(&mut resolved.apt, preset.apt);
        extend_owned(&mut resolved.npm, preset.npm);
        extend_owned(&mut resolved.pip, preset.pip);
        extend_owned(&mut resolved.cargo, preset.cargo);
        extend_owned(&mut resolved.commands, preset.commands);
    }
    resolved.apt.extend(raw.apt.iter().cloned());
    resolved.npm.extend(raw.npm.iter().cloned());
    resolved.pip.extend(raw.pip.iter().cloned());
    resolved.cargo.extend(raw.cargo.iter().cloned());
    resolved.commands.extend(raw.commands.iter().cloned());

    for list in [
        &mut resolved.apt,
        &mut resolved.npm,
        &mut resolved.pip,
        &mut resolved.cargo,
    ] {
        list.retain(|item| !item.trim().is_empty());
        dedup_in_place(list);
    }
    resolved.custom_dockerfile = raw
        .custom_dockerfile
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);
    resolved
}

pub fn has_tools(resolved: &ResolvedTools) -> bool {
    !resolved.apt.is_empty()
        || !resolved.npm.is_empty()
        || !resolved.pip.is_empty()
        || !resolved.cargo.is_empty()
        || !resolved.commands.is_empty()
        || resolved.custom_dockerfile.is_some()
}

pub fn generate_dockerfile(resolved: &ResolvedTools, base_image: &str) -> String {
    let mut out = install_layers(resolved, base_image);
    out.push_str(&format!("\nUSER {RUNTIME_USER}\n"));
    out
}

fn install_layers(resolved: &ResolvedTools, base_image: &str) -> String {
    let mut out = format!("FROM {base_image}\nUSER {INSTALL_USER}\n");
    if !resolved.apt.is_empty() {
        out.push_str(&format!(
            "\nRUN apt-get update \\\n    && apt-get install -y --no-install-recommends {} \\\n    && rm -rf /var/lib/apt/lists/*\n",
            resolved.apt.join(" ")
        ));
    }
    if !resolved.npm.is_empty() {
        out.push_str(&format!("\nRUN npm install -g {}\n", resolved.npm.join(" ")));
    }
    if !resolved.pip.is_empty() {
        out.push_str(&format!(
            "\nRUN pip3 install --no-cache-dir --break-system-packages {}\n",
            resolved.pip.join(" ")
        ));
    }
    if !resolved.cargo.is_empty() {
        out.push_str(&format!(
            "\nRUN {RUSTUP_BOOTSTRAP} \\\n    && RUSTUP_HOME=/usr/local/rustup CARGO_HOME=/usr/local/cargo cargo install --root /usr/local {}\n",
            resolved.cargo.join(" ")
        ));
    }
    if !resolved.commands.is_empty() {
        out.push('\n');
        for command in &resolved.commands {
            out.push_str(&format!("RUN {command}\n"));
        }
    }
    out
}

fn strip_from_lines(content: &str) -> String {
    content
        .lines()
        .filter(|line| {
            let upper = line.trim_start().to_ascii_uppercase();
            !(upper.starts_with("FROM ") || upper == "FROM")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(TOOLS_HASH_LEN);
    digest
}

#[derive(Debug, Clone)]
pub struct ToolConfigResolver {
    tools_file: PathBuf,
    config_dir: PathBuf,
}

impl ToolConfigResolver {
    pub fn new(tools_file: PathBuf, config_dir: PathBuf) -> Self {
        Self {
            tools_file,
            config_dir,
        }
    }

    pub fn tools_file(&self) -> &Path {
        &self.tools_file
    }

    pub fn exists(&self) -> bool {
        self.tools_file.is_file()
    }

    pub fn load(&self) -> Result<Option<ToolConfig>, CyrusError> {
        if !self.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.tools_file)?;
        let config = parse_tool_config(&content).map_err(|err| {
            CyrusError::Config(format!(
                "invalid tool configuration {}: {err}",
                self.tools_file.display()
            ))
        })?;
        Ok(Some(config))
    }

    pub fn resolved(&self) -> Result<Option<ResolvedTools>, CyrusError> {
        Ok(self.load()?.as_ref().map(resolve_config))
    }

    /// `None` when there is no tools file.
    pub fn config_hash(&self) -> Result<Option<String>, CyrusError> {
        if !self.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.tools_file)?;
        let hash = hash_bytes(&bytes);
        debug!(hash = %hash, "tool config hash");
        Ok(Some(hash))
    }

    pub fn custom_dockerfile_path(&self, resolved: &ResolvedTools) -> Option<PathBuf> {
        resolved.custom_dockerfile.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                self.config_dir.join(path)
            }
        })
    }

    /// Generated layers plus the custom Dockerfile body, if one is configured.
    pub fn render_dockerfile(
        &self,
        resolved: &ResolvedTools,
        base_image: &str,
    ) -> Result<String, CyrusError> {
        let mut text = install_layers(resolved, base_image);
        if let Some(path) = self.custom_dockerfile_path(resolved) {
            if !path.is_file() {
                return Err(CyrusError::Config(format!(
                    "custom Dockerfile not found: {}",
                    path.display()
                )));
            }
            let custom = fs::read_to_string(&path)?;
            text.push_str(&format!("\n# from {}\n", path.display()));
            text.push_str(&strip_from_lines(&custom));
            text.push('\n');
        }
        text.push_str(&format!("\nUSER {RUNTIME_USER}\n"));
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn preset_catalog_covers_common_toolchains() {
        for name in [
            "python",
            "rust",
            "go",
            "ruby",
            "java",
            "aws",
            "kubernetes",
            "terraform",
        ] {
            assert!(find_preset(name).is_some(), "missing preset {name}");
        }
    }

    #[test]
    fn resolve_dedups_packages_but_not_commands() {
        let raw = ToolConfig {
            presets: vec!["python".to_string()],
            apt: vec!["python3".to_string(), "jq".to_string(), "jq".to_string()],
            commands: vec!["echo hi".to_string(), "echo hi".to_string()],
            ..ToolConfig::default()
        };
        let resolved = resolve_config(&raw);
        assert_eq!(resolved.apt.iter().filter(|p| *p == "python3").count(), 1);
        assert_eq!(resolved.apt.iter().filter(|p| *p == "jq").count(), 1);
        assert_eq!(resolved.commands, vec!["echo hi", "echo hi"]);
    }

    #[test]
    fn resolve_skips_unknown_presets() {
        let raw = ToolConfig {
            presets: vec!["cobol".to_string(), "go".to_string()],
            ..ToolConfig::default()
        };
        let resolved = resolve_config(&raw);
        assert_eq!(resolved.apt, vec!["golang-go"]);
        assert!(has_tools(&resolved));
    }

    #[test]
    fn overlapping_presets_share_packages() {
        let raw = ToolConfig {
            presets: vec!["aws".to_string(), "terraform".to_string()],
            ..ToolConfig::default()
        };
        let resolved = resolve_config(&raw);
        assert_eq!(resolved.apt, vec!["curl", "unzip"]);
        assert_eq!(resolved.commands.len(), 2);
    }

    #[test]
    fn empty_config_has_no_tools() {
        let resolved = resolve_config(&ToolConfig::default());
        assert!(!has_tools(&resolved));
        let custom_only = resolve_config(&ToolConfig {
            custom_dockerfile: Some("Dockerfile.custom".to_string()),
            ..ToolConfig::default()
        });
        assert!(has_tools(&custom_only));
    }

    #[test]
    fn dockerfile_skips_empty_categories() {
        let resolved = ResolvedTools {
            pip: vec!["httpie".to_string(), "ruff".to_string()],
            commands: vec!["echo one".to_string(), "echo two".to_string()],
            ..ResolvedTools::default()
        };
        let text = generate_dockerfile(&resolved, "cyrus-local:base");
        assert!(text.starts_with("FROM cyrus-local:base\n"));
        assert!(text.contains("RUN pip3 install --no-cache-dir --break-system-packages httpie ruff\n"));
        assert!(!text.contains("apt-get"));
        assert!(!text.contains("npm install"));
        assert!(!text.contains("cargo install"));
        let one = text.find("RUN echo one").unwrap();
        let two = text.find("RUN echo two").unwrap();
        assert!(one < two);
    }

    #[test]
    fn dockerfile_apt_block_disables_recommends_and_clears_lists() {
        let resolved = ResolvedTools {
            apt: vec!["jq".to_string(), "ripgrep".to_string()],
            npm: vec!["pnpm".to_string()],
            ..ResolvedTools::default()
        };
        let text = generate_dockerfile(&resolved, "base");
        assert!(text.contains("apt-get install -y --no-install-recommends jq ripgrep"));
        assert!(text.contains("rm -rf /var/lib/apt/lists/*"));
        assert!(text.contains("RUN npm install -g pnpm\n"));
        assert_eq!(text.matches("RUN ").count(), 2);
    }

    #[test]
    fn dockerfile_installs_as_root_and_hands_back_to_node() {
        let resolved = resolve_config(&parse_tool_config("presets: [python]\nnpm: [pnpm]\n").unwrap());
        let text = generate_dockerfile(&resolved, "cyrus-local:base");
        let root = text.find("USER root\n").unwrap();
        let first_run = text.find("RUN ").unwrap();
        assert!(root < first_run);
        assert!(text.trim_end().ends_with("USER node"));
        assert_eq!(text.matches("USER ").count(), 2);
    }

    #[test]
    fn dockerfile_is_deterministic() {
        let raw = parse_tool_config("presets: [rust]\ncargo: [ripgrep]\n").unwrap();
        let resolved = resolve_config(&raw);
        assert_eq!(
            generate_dockerfile(&resolved, "b"),
            generate_dockerfile(&resolved, "b")
        );
    }

    #[test]
    fn parse_accepts_empty_and_rejects_unknown_fields() {
        assert_eq!(parse_tool_config("").unwrap(), ToolConfig::default());
        assert_eq!(
            parse_tool_config("# only comments\n").unwrap(),
            ToolConfig::default()
        );
        assert!(parse_tool_config("aptt: [jq]\n").is_err());
        let parsed = parse_tool_config("customDockerfile: extra.Dockerfile\n").unwrap();
        assert_eq!(parsed.custom_dockerfile.as_deref(), Some("extra.Dockerfile"));
    }

    #[test]
    fn template_parses_to_empty_config() {
        let parsed = parse_tool_config(TOOLS_TEMPLATE_YAML).unwrap();
        assert!(!has_tools(&resolve_config(&parsed)));
    }

    #[test]
    fn hash_is_none_without_file_and_tracks_bytes() {
        let dir = tempdir().unwrap();
        let resolver = ToolConfigResolver::new(dir.path().join("tools.yaml"), dir.path().into());
        assert_eq!(resolver.config_hash().unwrap(), None);

        fs::write(resolver.tools_file(), "apt: [jq]\n").unwrap();
        let first = resolver.config_hash().unwrap().unwrap();
        assert_eq!(first.len(), TOOLS_HASH_LEN);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        fs::write(resolver.tools_file(), "apt: [jq] # same packages\n").unwrap();
        let second = resolver.config_hash().unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn render_appends_custom_dockerfile_without_from() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("Dockerfile.custom"),
            "FROM ubuntu\nENV FOO=bar\nRUN echo custom\n",
        )
        .unwrap();
        let resolver = ToolConfigResolver::new(dir.path().join("tools.yaml"), dir.path().into());
        let resolved = ResolvedTools {
            custom_dockerfile: Some(PathBuf::from("Dockerfile.custom")),
            ..ResolvedTools::default()
        };
        let text = resolver.render_dockerfile(&resolved, "base").unwrap();
        assert_eq!(text.matches("FROM ").count(), 1);
        assert!(text.contains("ENV FOO=bar\nRUN echo custom\n"));
        let custom = text.find("RUN echo custom").unwrap();
        assert!(text.find("USER root").unwrap() < custom);
        assert!(text.rfind("USER node").unwrap() > custom);
    }

    #[test]
    fn render_errors_on_missing_custom_dockerfile() {
        let dir = tempdir().unwrap();
        let resolver = ToolConfigResolver::new(dir.path().join("tools.yaml"), dir.path().into());
        let resolved = ResolvedTools {
            custom_dockerfile: Some(PathBuf::from("missing")),
            ..ResolvedTools::default()
        };
        assert!(resolver.render_dockerfile(&resolved, "base").is_err());
    }
}
