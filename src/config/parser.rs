//! Manifest loading with environment overrides.
//!
//! Manifests are YAML. `KUBEPLAN_*` environment variables override a handful
//! of fields after parsing, and a `.env` file next to the manifest is loaded
//! first when present.

use crate::error::{ConfigError, ReconcilerError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::ClusterManifest;

/// Environment variable holding the provider bearer token.
pub const API_TOKEN_ENV: &str = "KUBEPLAN_API_TOKEN";

/// Parser for `kubeplan.yaml` manifests.
#[derive(Debug, Default)]
pub struct ManifestParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ManifestParser {
    /// Creates a new manifest parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving the `.env` file.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a manifest from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ClusterManifest> {
        let path = path.as_ref();
        info!("Loading manifest from: {}", path.display());

        if !path.exists() {
            return Err(ReconcilerError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ReconcilerError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a manifest from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ClusterManifest> {
        let manifest: ClusterManifest = serde_yaml::from_str(content).map_err(|e| {
            let location = e
                .location()
                .map(|l| format!("line {}, column {}", l.line(), l.column()))
                .or_else(|| source.map(|p| p.display().to_string()));
            ReconcilerError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed manifest for cluster '{}' on {}",
            manifest.spec.cluster.name, manifest.spec.cloud
        );
        Ok(manifest)
    }

    /// Loads a manifest and applies `KUBEPLAN_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ClusterManifest> {
        let mut manifest = self.load_file(path)?;
        Self::apply_env_overrides(&mut manifest, |name| std::env::var(name).ok());
        Ok(manifest)
    }

    /// Applies overrides from a variable lookup.
    pub fn apply_env_overrides(
        manifest: &mut ClusterManifest,
        lookup: impl Fn(&str) -> Option<String>,
    ) {
        if let Some(name) = lookup("KUBEPLAN_CLUSTER_NAME") {
            debug!("Overriding cluster.name from environment");
            manifest.spec.cluster.name = name;
        }

        if let Some(region) = lookup("KUBEPLAN_REGION") {
            debug!("Overriding cluster.region from environment");
            manifest.spec.cluster.region = region;
        }

        if let Some(bucket) = lookup("KUBEPLAN_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            manifest.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("KUBEPLAN_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            manifest.state.prefix = Some(prefix);
        }

        if let Some(endpoint) = lookup("KUBEPLAN_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            manifest.provider.endpoint = Some(endpoint);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ReconcilerError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider API token from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not set.
    pub fn api_token() -> Result<String> {
        std::env::var(API_TOKEN_ENV).map_err(|_| {
            ReconcilerError::Config(ConfigError::MissingEnvVar {
                name: String::from(API_TOKEN_ENV),
            })
        })
    }
}

/// Default manifest file names to search for.
pub const DEFAULT_MANIFEST_FILES: &[&str] = &["kubeplan.yaml", "kubeplan.yml"];

/// Finds the manifest in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no manifest is found.
pub fn find_manifest(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_MANIFEST_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found manifest: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ReconcilerError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_MANIFEST_FILES[0]),
    }))
}
