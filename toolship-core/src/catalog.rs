//! Built-in tool catalog.
//!
//! Every wrapped tool is a [`ToolDefinition`]: image, binary and a set of
//! operations. Each [`OperationDef`] fixes the exit policy for that call
//! site, the target kinds it accepts and its option grammar. Adding a tool
//! is a data change; nothing here branches on tool names.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ToolOverride;
use crate::error::CatalogError;
use crate::options::{OptionGrammar, OptionRule};
use crate::plan::ToolSpec;
use crate::policy::ExitPolicy;
use crate::target::TargetKind;

use crate::policy::ExitPolicy::{
    AnySucceedsIfOutputNonEmpty as Any, FallbackToStderr as Fallback, Strict,
};
use crate::target::TargetKind::{
    Blob, ContainerImage as Image, LocalDirectory as Dir, LocalFile as File,
    RemoteRepository as Repo,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDef {
    pub name: String,
    pub description: String,
    pub exit_policy: ExitPolicy,
    pub targets: Vec<TargetKind>,
    pub grammar: OptionGrammar,
    /// Setup commands run with the tool binary before the main command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<Vec<String>>,
}

impl OperationDef {
    pub fn new(
        name: &str,
        description: &str,
        exit_policy: ExitPolicy,
        targets: &[TargetKind],
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            exit_policy,
            targets: targets.to_vec(),
            grammar: OptionGrammar::default(),
            setup: Vec::new(),
        }
    }

    pub fn grammar(mut self, grammar: OptionGrammar) -> Self {
        self.grammar = grammar;
        self
    }

    pub fn setup(mut self, args: &[&str]) -> Self {
        self.setup.push(args.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn accepts(&self, kind: TargetKind) -> bool {
        self.targets.contains(&kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub image: String,
    pub binary: String,
    pub operations: BTreeMap<String, OperationDef>,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, image: &str, binary: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            image: image.to_string(),
            binary: binary.to_string(),
            operations: BTreeMap::new(),
        }
    }

    pub fn operation(mut self, op: OperationDef) -> Self {
        self.operations.insert(op.name.clone(), op);
        self
    }

    /// The invocation identity of one operation.
    pub fn spec(&self, op: &OperationDef) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            image: self.image.clone(),
            binary: self.binary.clone(),
            exit_policy: op.exit_policy,
            setup: op.setup.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolDefinition) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    pub fn get(&self, tool: &str) -> Result<&ToolDefinition, CatalogError> {
        self.tools.get(tool).ok_or_else(|| CatalogError::UnknownTool {
            tool: tool.to_string(),
        })
    }

    pub fn operation(
        &self,
        tool: &str,
        operation: &str,
    ) -> Result<(&ToolDefinition, &OperationDef), CatalogError> {
        let def = self.get(tool)?;
        let op = def
            .operations
            .get(operation)
            .ok_or_else(|| CatalogError::UnknownOperation {
                tool: tool.to_string(),
                operation: operation.to_string(),
            })?;
        Ok((def, op))
    }

    /// Look up an operation and check it accepts `kind`.
    pub fn resolve(
        &self,
        tool: &str,
        operation: &str,
        kind: TargetKind,
    ) -> Result<(&ToolDefinition, &OperationDef), CatalogError> {
        let (def, op) = self.operation(tool, operation)?;
        if !op.accepts(kind) {
            return Err(CatalogError::UnsupportedTarget {
                tool: tool.to_string(),
                operation: operation.to_string(),
                kind: kind.as_str(),
            });
        }
        Ok((def, op))
    }

    /// Apply configured image and binary overrides. Exit policies are
    /// never overridable.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, ToolOverride>) {
        for (name, ov) in overrides {
            let Some(def) = self.tools.get_mut(name) else {
                warn!(tool = %name, "Override for unknown tool ignored");
                continue;
            };
            if let Some(image) = &ov.image {
                def.image = image.clone();
            }
            if let Some(binary) = &ov.binary {
                def.binary = binary.clone();
            }
        }
    }

    /// Catalog of the tools toolship ships with.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for tool in [
            checkov(),
            trivy(),
            grype(),
            syft(),
            gitleaks(),
            trufflehog(),
            semgrep(),
            hadolint(),
            tflint(),
            terrascan(),
            kubescape(),
            osv_scanner(),
            actionlint(),
            conftest(),
            cosign(),
            infracost(),
            planner("terraform", "Terraform", "hashicorp/terraform:latest", "terraform"),
            planner("tofu", "OpenTofu", "opentofu/opentofu:latest", "tofu"),
            openinfraquote(),
            curl(),
            gunzip(),
        ] {
            catalog.register(tool);
        }
        catalog
    }
}

// ── Tool table ──

fn checkov() -> ToolDefinition {
    let common = |g: OptionGrammar| {
        g.fixed(&["--output", "json"])
            .rule(OptionRule::comma_list("framework", "--framework"))
            .rule(OptionRule::comma_list("check", "--check"))
            .rule(OptionRule::comma_list("skip-check", "--skip-check"))
            .rule(OptionRule::value("config-file", "--config-file"))
            .rule(OptionRule::switch("compact", "--compact"))
            .rule(OptionRule::switch("quiet", "--quiet"))
            .rule(OptionRule::switch("download-external-modules", "--download-external-modules"))
    };
    ToolDefinition::new(
        "checkov",
        "Static analysis for infrastructure as code",
        "bridgecrew/checkov:latest",
        "checkov",
    )
    .operation(
        OperationDef::new("scan", "Scan a directory of IaC files", Any, &[Dir, Repo])
            .grammar(common(OptionGrammar::new().target_flag("--directory"))),
    )
    .operation(
        OperationDef::new("scan-file", "Scan a single IaC file or plan", Any, &[File, Blob])
            .grammar(common(OptionGrammar::new().target_flag("--file"))),
    )
}

fn trivy() -> ToolDefinition {
    let common = |g: OptionGrammar| {
        g.fixed(&["--format", "json", "--quiet"])
            .rule(OptionRule::comma_list("severity", "--severity"))
            .rule(OptionRule::comma_list("scanners", "--scanners"))
            .rule(OptionRule::switch("ignore-unfixed", "--ignore-unfixed"))
            .rule(OptionRule::repeated("skip-dirs", "--skip-dirs"))
            .rule(OptionRule::value("ignorefile", "--ignorefile"))
            .rule(OptionRule::value("config", "--config"))
            .rule(OptionRule::value("exit-code", "--exit-code"))
    };
    ToolDefinition::new(
        "trivy",
        "Vulnerability, misconfiguration and secret scanner",
        "aquasec/trivy:latest",
        "trivy",
    )
    .operation(
        OperationDef::new("fs", "Scan a local filesystem", Strict, &[Dir, File, Repo])
            .grammar(common(OptionGrammar::new().subcommand(&["fs"]))),
    )
    .operation(
        OperationDef::new("image", "Scan a container image", Strict, &[Image])
            .grammar(common(OptionGrammar::new().subcommand(&["image"]))),
    )
    .operation(
        OperationDef::new("config", "Scan IaC configuration files", Strict, &[Dir, File])
            .grammar(common(OptionGrammar::new().subcommand(&["config"]))),
    )
}

fn grype() -> ToolDefinition {
    ToolDefinition::new(
        "grype",
        "Vulnerability scanner for images and filesystems",
        "anchore/grype:latest",
        "/grype",
    )
    .operation(
        OperationDef::new("scan", "Scan an image, directory or SBOM", Fallback, &[Image, Dir, File])
            .grammar(
                OptionGrammar::new()
                    .fixed(&["-o", "json"])
                    .rule(OptionRule::value("fail-on", "--fail-on"))
                    .rule(OptionRule::switch("only-fixed", "--only-fixed"))
                    .rule(OptionRule::value("scope", "--scope"))
                    .rule(OptionRule::repeated("exclude", "--exclude"))
                    .rule(OptionRule::value("config", "--config")),
            ),
    )
}

fn syft() -> ToolDefinition {
    ToolDefinition::new(
        "syft",
        "Software bill of materials generator",
        "anchore/syft:latest",
        "/syft",
    )
    .operation(
        OperationDef::new("sbom", "Generate an SBOM", Strict, &[Image, Dir, File])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["scan"])
                    .rule(
                        OptionRule::value("output", "-o")
                            .describe("Output format: syft-json, spdx-json or cyclonedx-json"),
                    )
                    .rule(OptionRule::value("scope", "--scope"))
                    .rule(OptionRule::repeated("exclude", "--exclude")),
            ),
    )
}

fn gitleaks() -> ToolDefinition {
    ToolDefinition::new(
        "gitleaks",
        "Secret detection in code and git history",
        "zricethezav/gitleaks:latest",
        "gitleaks",
    )
    .operation(
        OperationDef::new("detect", "Detect secrets in a source tree", Fallback, &[Dir, Repo])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["detect"])
                    .fixed(&[
                        "--report-format",
                        "json",
                        "--report-path",
                        "/dev/stdout",
                        "--no-banner",
                    ])
                    .target_flag("--source")
                    .rule(OptionRule::switch("no-git", "--no-git"))
                    .rule(OptionRule::switch("redact", "--redact"))
                    .rule(OptionRule::value("config", "--config"))
                    .rule(OptionRule::value("baseline-path", "--baseline-path"))
                    .rule(OptionRule::joined("log-opts", "--log-opts=")),
            ),
    )
}

fn trufflehog() -> ToolDefinition {
    ToolDefinition::new(
        "trufflehog",
        "Verified secret scanning",
        "trufflesecurity/trufflehog:latest",
        "trufflehog",
    )
    .operation(
        OperationDef::new("filesystem", "Scan files for secrets", Fallback, &[Dir, File, Repo])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["filesystem"])
                    .fixed(&["--json", "--no-update"])
                    .rule(OptionRule::switch("only-verified", "--only-verified"))
                    .rule(OptionRule::value("exclude-paths", "--exclude-paths"))
                    .rule(OptionRule::value("concurrency", "--concurrency")),
            ),
    )
}

fn semgrep() -> ToolDefinition {
    ToolDefinition::new(
        "semgrep",
        "Pattern-based static analysis",
        "semgrep/semgrep:latest",
        "semgrep",
    )
    .operation(
        OperationDef::new("scan", "Run semgrep rules over source code", Any, &[Dir, File, Repo])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["scan"])
                    .fixed(&["--json", "--quiet"])
                    .rule(
                        OptionRule::repeated("config", "--config")
                            .describe("Rule sources, e.g. auto, p/owasp-top-ten or a local path"),
                    )
                    .rule(OptionRule::repeated("severity", "--severity"))
                    .rule(OptionRule::repeated("exclude", "--exclude"))
                    .rule(OptionRule::value("metrics", "--metrics"))
                    .rule(OptionRule::switch("error", "--error")),
            ),
    )
}

fn hadolint() -> ToolDefinition {
    ToolDefinition::new(
        "hadolint",
        "Dockerfile linter",
        "hadolint/hadolint:latest-debian",
        "hadolint",
    )
    .operation(
        OperationDef::new("lint", "Lint a Dockerfile", Any, &[File])
            .grammar(
                OptionGrammar::new()
                    .fixed(&["--format", "json"])
                    .rule(OptionRule::value("config", "--config"))
                    .rule(OptionRule::repeated("ignore", "--ignore"))
                    .rule(OptionRule::value("failure-threshold", "--failure-threshold"))
                    .rule(OptionRule::repeated("trusted-registry", "--trusted-registry")),
            ),
    )
}

fn tflint() -> ToolDefinition {
    ToolDefinition::new(
        "tflint",
        "Terraform linter",
        "ghcr.io/terraform-linters/tflint:latest",
        "tflint",
    )
    .operation(
        OperationDef::new("lint", "Lint a Terraform module", Any, &[Dir, Repo])
            .grammar(
                OptionGrammar::new()
                    .fixed(&["--format", "json"])
                    .no_target()
                    .rule(OptionRule::value("config", "--config"))
                    .rule(OptionRule::repeated("enable-rule", "--enable-rule"))
                    .rule(OptionRule::repeated("disable-rule", "--disable-rule"))
                    .rule(OptionRule::joined(
                        "minimum-failure-severity",
                        "--minimum-failure-severity=",
                    ))
                    .rule(OptionRule::switch("recursive", "--recursive")),
            ),
    )
}

fn terrascan() -> ToolDefinition {
    ToolDefinition::new(
        "terrascan",
        "Policy-as-code scanner for IaC",
        "tenable/terrascan:latest",
        "terrascan",
    )
    .operation(
        OperationDef::new("scan", "Scan an IaC directory", Fallback, &[Dir, Repo])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["scan"])
                    .fixed(&["-o", "json"])
                    .target_flag("-d")
                    .rule(OptionRule::value("iac-type", "-i"))
                    .rule(OptionRule::value("policy-type", "-t"))
                    .rule(OptionRule::value("severity", "--severity"))
                    .rule(OptionRule::comma_list("skip-rules", "--skip-rules"))
                    .rule(OptionRule::switch("non-recursive", "--non-recursive")),
            ),
    )
}

fn kubescape() -> ToolDefinition {
    ToolDefinition::new(
        "kubescape",
        "Kubernetes manifest security scanner",
        "quay.io/kubescape/kubescape-cli:latest",
        "kubescape",
    )
    .operation(
        OperationDef::new("scan", "Scan Kubernetes manifests", Fallback, &[Dir, File, Repo])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["scan"])
                    .fixed(&["--format", "json"])
                    .rule(
                        OptionRule::positional("framework")
                            .describe("Framework to scan against, e.g. nsa"),
                    )
                    .rule(OptionRule::value("severity-threshold", "--severity-threshold"))
                    .rule(OptionRule::comma_list("exclude-namespaces", "--exclude-namespaces"))
                    .rule(OptionRule::value("compliance-threshold", "--compliance-threshold")),
            ),
    )
}

fn osv_scanner() -> ToolDefinition {
    ToolDefinition::new(
        "osv-scanner",
        "Dependency vulnerability scanner backed by OSV",
        "ghcr.io/google/osv-scanner:latest",
        "/osv-scanner",
    )
    .operation(
        OperationDef::new("scan", "Scan lockfiles in a source tree", Any, &[Dir, Repo])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["scan", "source"])
                    .fixed(&["--format", "json"])
                    .rule(OptionRule::switch("recursive", "--recursive"))
                    .rule(OptionRule::value("config", "--config"))
                    .rule(OptionRule::repeated("lockfile", "--lockfile")),
            ),
    )
    .operation(
        OperationDef::new("image", "Scan a container image", Any, &[Image])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["scan", "image"])
                    .fixed(&["--format", "json"]),
            ),
    )
}

fn actionlint() -> ToolDefinition {
    ToolDefinition::new(
        "actionlint",
        "GitHub Actions workflow linter",
        "rhysd/actionlint:latest",
        "actionlint",
    )
    .operation(
        OperationDef::new("lint", "Lint workflows under .github/workflows", Any, &[Dir, Repo])
            .grammar(
                OptionGrammar::new()
                    .fixed(&["-format", "{{json .}}"])
                    .no_target()
                    .rule(OptionRule::repeated("ignore", "-ignore"))
                    .rule(OptionRule::value("shellcheck", "-shellcheck"))
                    .rule(OptionRule::value("config-file", "-config-file")),
            ),
    )
}

fn conftest() -> ToolDefinition {
    ToolDefinition::new(
        "conftest",
        "Rego policy tests for structured configuration",
        "openpolicyagent/conftest:latest",
        "conftest",
    )
    .operation(
        OperationDef::new("test", "Test configuration against policies", Any, &[Dir, File])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["test"])
                    .fixed(&["--output", "json"])
                    .rule(OptionRule::repeated("policy", "--policy"))
                    .rule(OptionRule::repeated("namespace", "--namespace"))
                    .rule(OptionRule::switch("all-namespaces", "--all-namespaces"))
                    .rule(OptionRule::value("parser", "--parser"))
                    .rule(OptionRule::switch("combine", "--combine")),
            ),
    )
}

fn cosign() -> ToolDefinition {
    let identity = |g: OptionGrammar| {
        g.rule(OptionRule::value("key", "--key"))
            .rule(OptionRule::value("certificate-identity", "--certificate-identity"))
            .rule(OptionRule::value("certificate-oidc-issuer", "--certificate-oidc-issuer"))
    };
    ToolDefinition::new(
        "cosign",
        "Container image and blob signature verification",
        "gcr.io/projectsigstore/cosign:latest",
        "/ko-app/cosign",
    )
    .operation(
        OperationDef::new("verify", "Verify an image signature", Fallback, &[Image])
            .grammar(identity(
                OptionGrammar::new()
                    .subcommand(&["verify"])
                    .fixed(&["--output", "json"]),
            )),
    )
    .operation(
        OperationDef::new("verify-attestation", "Verify an image attestation", Fallback, &[Image])
            .grammar(identity(
                OptionGrammar::new()
                    .subcommand(&["verify-attestation"])
                    .rule(OptionRule::value("type", "--type")),
            )),
    )
    .operation(
        OperationDef::new("verify-blob", "Verify a blob signature", Fallback, &[Blob, File])
            .grammar(identity(
                OptionGrammar::new()
                    .subcommand(&["verify-blob"])
                    .rule(OptionRule::value("signature", "--signature"))
                    .rule(OptionRule::value("bundle", "--bundle")),
            )),
    )
}

fn infracost() -> ToolDefinition {
    ToolDefinition::new(
        "infracost",
        "Cloud cost estimates for Terraform",
        "infracost/infracost:latest",
        "infracost",
    )
    .operation(
        OperationDef::new(
            "breakdown",
            "Cost breakdown of a Terraform project or plan",
            Strict,
            &[Dir, File],
        )
        .grammar(
            OptionGrammar::new()
                .subcommand(&["breakdown"])
                .fixed(&["--format", "json", "--no-color"])
                .target_flag("--path")
                .rule(OptionRule::value("usage-file", "--usage-file"))
                .rule(OptionRule::repeated("terraform-var-file", "--terraform-var-file"))
                .rule(OptionRule::switch("show-skipped", "--show-skipped")),
        ),
    )
}

/// Terraform and OpenTofu share a command line.
fn planner(name: &str, product: &str, image: &str, binary: &str) -> ToolDefinition {
    ToolDefinition::new(
        name,
        &format!("{product} plan generation and validation"),
        image,
        binary,
    )
    .operation(
        OperationDef::new("plan", "Generate a JSON plan for a module", Strict, &[Dir, Repo])
            .setup(&["init", "-input=false", "-no-color"])
            .setup(&["plan", "-input=false", "-no-color", "-out=tfplan"])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["show"])
                    .fixed(&["-json", "-no-color", "tfplan"])
                    .no_target(),
            ),
    )
    .operation(
        OperationDef::new("validate", "Validate a module", Strict, &[Dir, Repo])
            .setup(&["init", "-backend=false", "-input=false", "-no-color"])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["validate"])
                    .fixed(&["-json", "-no-color"])
                    .no_target(),
            ),
    )
}

fn openinfraquote() -> ToolDefinition {
    ToolDefinition::new(
        "openinfraquote",
        "Terraform cost estimation from a pricing catalog",
        "ghcr.io/initech-consulting/openinfraquote:latest",
        "oiq",
    )
    .operation(
        OperationDef::new("match", "Match plan resources against a pricesheet", Strict, &[File])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["match"])
                    .rule(OptionRule::value("pricesheet", "--pricesheet").required()),
            ),
    )
    .operation(
        // Reads match output on stdin, so it only runs as a pipeline stage.
        OperationDef::new("price", "Price matched resources for a region", Strict, &[])
            .grammar(
                OptionGrammar::new()
                    .subcommand(&["price"])
                    .fixed(&["--format", "json"])
                    .no_target()
                    .rule(OptionRule::value("region", "--region").required()),
            ),
    )
}

fn curl() -> ToolDefinition {
    ToolDefinition::new(
        "curl",
        "HTTP downloads into the container scratch area",
        "curlimages/curl:latest",
        "curl",
    )
    .operation(
        OperationDef::new("download", "Download a URL", Strict, &[])
            .grammar(
                OptionGrammar::new()
                    .fixed(&["--fail", "--silent", "--show-error", "--location", "--create-dirs"])
                    .rule(OptionRule::value("output", "--output").required())
                    .rule(OptionRule::positional("url").required().after_target()),
            ),
    )
}

fn gunzip() -> ToolDefinition {
    ToolDefinition::new(
        "gunzip",
        "Decompress gzip files to stdout",
        "busybox:stable",
        "gunzip",
    )
    .operation(
        OperationDef::new("decompress", "Write the decompressed file to stdout", Strict, &[File])
            .grammar(OptionGrammar::new().fixed(&["-c"])),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{ToolOptions, render};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtin_has_every_family() {
        let catalog = ToolCatalog::builtin();
        for name in [
            "checkov", "trivy", "grype", "syft", "gitleaks", "trufflehog", "semgrep",
            "hadolint", "tflint", "terrascan", "kubescape", "osv-scanner", "actionlint",
            "conftest", "cosign", "infracost", "terraform", "tofu", "openinfraquote",
            "curl", "gunzip",
        ] {
            assert!(catalog.get(name).is_ok(), "missing {name}");
        }
    }

    #[test]
    fn test_policies_are_fixed_per_operation() {
        let catalog = ToolCatalog::builtin();
        let policy = |t: &str, o: &str| catalog.operation(t, o).unwrap().1.exit_policy;
        assert_eq!(policy("checkov", "scan"), ExitPolicy::AnySucceedsIfOutputNonEmpty);
        assert_eq!(policy("gitleaks", "detect"), ExitPolicy::FallbackToStderr);
        assert_eq!(policy("trivy", "fs"), ExitPolicy::Strict);
        assert_eq!(policy("openinfraquote", "match"), ExitPolicy::Strict);
    }

    #[test]
    fn test_unknown_lookups() {
        let catalog = ToolCatalog::builtin();
        assert!(matches!(catalog.get("nmap"), Err(CatalogError::UnknownTool { .. })));
        assert!(matches!(
            catalog.operation("trivy", "sbom"),
            Err(CatalogError::UnknownOperation { .. })
        ));
        assert_eq!(
            catalog.resolve("hadolint", "lint", TargetKind::ContainerImage).unwrap_err(),
            CatalogError::UnsupportedTarget {
                tool: "hadolint".into(),
                operation: "lint".into(),
                kind: "image",
            }
        );
    }

    #[test]
    fn test_overrides_change_image_not_policy() {
        let mut catalog = ToolCatalog::builtin();
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "checkov".to_string(),
            ToolOverride {
                image: Some("mirror.local/checkov:3".into()),
                binary: None,
                ..ToolOverride::default()
            },
        );
        overrides.insert("nonexistent".to_string(), ToolOverride::default());
        catalog.apply_overrides(&overrides);

        let (def, op) = catalog.operation("checkov", "scan").unwrap();
        let spec = def.spec(op);
        assert_eq!(spec.image, "mirror.local/checkov:3");
        assert_eq!(spec.binary, "checkov");
        assert_eq!(spec.exit_policy, ExitPolicy::AnySucceedsIfOutputNonEmpty);
    }

    #[test]
    fn test_checkov_renders_target_flag() {
        let catalog = ToolCatalog::builtin();
        let (_, op) = catalog.operation("checkov", "scan").unwrap();
        let options = ToolOptions::new().set("framework", "terraform").set("compact", true);
        let args = render("checkov", &op.grammar, &options, Some(".")).unwrap();
        assert_eq!(
            args.to_vec(),
            vec![
                "--output",
                "json",
                "--framework",
                "terraform",
                "--compact",
                "--directory",
                "."
            ]
        );
    }

    #[test]
    fn test_planner_setup_precedes_show() {
        let catalog = ToolCatalog::builtin();
        let (def, op) = catalog.operation("tofu", "plan").unwrap();
        let spec = def.spec(op);
        assert_eq!(spec.binary, "tofu");
        assert_eq!(spec.setup.len(), 2);
        assert_eq!(spec.setup[1].last().map(String::as_str), Some("-out=tfplan"));
    }

    #[test]
    fn test_pipeline_only_operations() {
        let catalog = ToolCatalog::builtin();
        let internal: Vec<(String, String)> = catalog
            .tools()
            .flat_map(|t| {
                t.operations
                    .values()
                    .filter(|op| op.targets.is_empty())
                    .map(|op| (t.name.clone(), op.name.clone()))
            })
            .collect();
        assert_eq!(
            internal,
            vec![
                ("curl".to_string(), "download".to_string()),
                ("openinfraquote".to_string(), "price".to_string()),
            ]
        );
    }
}
