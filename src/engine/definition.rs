//! Generation definitions supplied by the surrounding application.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::classify::{Matcher, ResourceClass, RouteRule, RouteTable};
use crate::cache::Generation;

const DEFAULT_OFFLINE_DOCUMENT: &str = "/offline.html";

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read generation manifest `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse generation manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid generation manifest: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    PathPrefix,
    PathSuffix,
    Path,
}

/// A manifest-supplied classification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    #[serde(rename = "match")]
    pub kind: MatchKind,
    pub value: String,
    pub class: ResourceClass,
}

impl From<&RouteRuleConfig> for RouteRule {
    fn from(config: &RouteRuleConfig) -> Self {
        let matcher = match config.kind {
            MatchKind::PathPrefix => Matcher::PathPrefix(config.value.clone()),
            MatchKind::PathSuffix => Matcher::PathSuffix(config.value.clone()),
            MatchKind::Path => Matcher::PathExact(config.value.clone()),
        };
        RouteRule::new(matcher, config.class)
    }
}

/// One generation's configuration: what to precache and how to route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationDefinition {
    pub generation: Generation,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub optional_assets: Vec<String>,
    #[serde(default = "default_offline_documents")]
    pub offline_documents: Vec<String>,
    #[serde(default)]
    pub routes: Vec<RouteRuleConfig>,
    #[serde(default)]
    pub skip_waiting: bool,
}

fn default_offline_documents() -> Vec<String> {
    vec![DEFAULT_OFFLINE_DOCUMENT.to_string()]
}

/// A precache entry and whether it counts toward install success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheEntry {
    pub url: String,
    pub core: bool,
}

impl GenerationDefinition {
    pub fn new(generation: impl Into<String>) -> Self {
        Self {
            generation: Generation::new(generation),
            assets: Vec::new(),
            optional_assets: Vec::new(),
            offline_documents: default_offline_documents(),
            routes: Vec::new(),
            skip_waiting: false,
        }
    }

    pub fn with_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assets = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optional_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_offline_documents<I, S>(mut self, documents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.offline_documents = documents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_routes(mut self, routes: Vec<RouteRuleConfig>) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, DefinitionError> {
        let definition: Self = serde_json::from_str(raw)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        let tag = self.generation.as_str();
        if tag.trim().is_empty() {
            return Err(DefinitionError::Invalid(
                "generation must not be empty".to_string(),
            ));
        }
        if tag.trim() != tag {
            return Err(DefinitionError::Invalid(format!(
                "generation `{tag}` has surrounding whitespace"
            )));
        }
        if let Some(rule) = self.routes.iter().find(|rule| rule.value.is_empty()) {
            return Err(DefinitionError::Invalid(format!(
                "route rule for class `{}` has an empty value",
                rule.class
            )));
        }
        Ok(())
    }

    /// Core assets followed by optional ones, each URL listed once. A URL in
    /// both lists is core.
    pub fn precache_entries(&self) -> Vec<PrecacheEntry> {
        let mut seen = HashSet::new();
        let core = self.assets.iter().map(|url| (url, true));
        let optional = self.optional_assets.iter().map(|url| (url, false));

        core.chain(optional)
            .filter(|(url, _)| seen.insert(*url))
            .map(|(url, core)| PrecacheEntry {
                url: url.clone(),
                core,
            })
            .collect()
    }

    pub fn route_table(&self) -> RouteTable {
        RouteTable::with_rules(self.routes.iter().map(RouteRule::from).collect())
    }

    pub fn profile(&self) -> GenerationProfile {
        GenerationProfile {
            generation: self.generation.clone(),
            routes: self.route_table(),
            offline_documents: self.offline_documents.clone(),
        }
    }
}

/// The part of a definition the dispatcher needs while the generation serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationProfile {
    pub generation: Generation,
    pub routes: RouteTable,
    pub offline_documents: Vec<String>,
}

/// Where the coordinator looks for the current definition when asked to
/// check for an update.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn load(&self) -> Result<GenerationDefinition, DefinitionError>;
}

/// A JSON manifest on disk, re-read on every load.
#[derive(Debug, Clone)]
pub struct ManifestFile {
    path: PathBuf,
}

impl ManifestFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DefinitionSource for ManifestFile {
    async fn load(&self) -> Result<GenerationDefinition, DefinitionError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| DefinitionError::Io {
                path: self.path.clone(),
                source,
            })?;
        GenerationDefinition::from_json(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_defaults_apply() {
        let definition =
            GenerationDefinition::from_json(r#"{"generation":"v1","assets":["/"]}"#)
                .expect("valid manifest");
        assert_eq!(definition.offline_documents, vec!["/offline.html"]);
        assert!(!definition.skip_waiting);
        assert!(definition.optional_assets.is_empty());
    }

    #[test]
    fn route_rules_parse_from_manifest() {
        let definition = GenerationDefinition::from_json(
            r#"{
                "generation": "v2",
                "routes": [{"match": "path_prefix", "value": "/api/", "class": "api-like"}]
            }"#,
        )
        .expect("valid manifest");
        assert_eq!(
            definition.routes,
            vec![RouteRuleConfig {
                kind: MatchKind::PathPrefix,
                value: "/api/".to_string(),
                class: ResourceClass::ApiLike,
            }]
        );
    }

    #[test]
    fn empty_generation_is_rejected() {
        let err = GenerationDefinition::from_json(r#"{"generation":"  "}"#)
            .expect_err("blank generation");
        assert!(matches!(err, DefinitionError::Invalid(_)));
    }

    #[test]
    fn precache_entries_are_deduplicated_core_first() {
        let definition = GenerationDefinition::new("v1")
            .with_assets(["/", "/app.css", "/"])
            .with_optional_assets(["/app.css", "/system_status_html"]);

        assert_eq!(
            definition.precache_entries(),
            vec![
                PrecacheEntry {
                    url: "/".to_string(),
                    core: true
                },
                PrecacheEntry {
                    url: "/app.css".to_string(),
                    core: true
                },
                PrecacheEntry {
                    url: "/system_status_html".to_string(),
                    core: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn manifest_file_reports_missing_path() {
        let err = ManifestFile::new("/definitely/not/here.json")
            .load()
            .await
            .expect_err("missing file");
        assert!(matches!(err, DefinitionError::Io { .. }));
    }
}
