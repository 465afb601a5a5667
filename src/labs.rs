//! Lab definitions
//!
//! A lab names a compose template and the subdomains it publishes. Each subdomain
//! maps to the template variable that receives its allocated host port.

use crate::route::{validate_token, Feature, MAIN_SUBDOMAIN};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabError {
    #[error("could not find lab with id {0:?}")]
    NotFound(String),
}

/// Optional behaviors a lab's routes should get
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct LabFeatures {
    /// Proxy upgraded (WebSocket) connections
    #[serde(default)]
    pub websockets: bool,
}

impl LabFeatures {
    /// Route feature flags derived from the lab toggles
    pub fn route_features(&self) -> BTreeSet<Feature> {
        let mut features = BTreeSet::new();
        if self.websockets {
            features.insert(Feature::WebSocket);
        }
        features
    }
}

/// Definition of a single lab
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LabDefinition {
    /// Compose template, relative to the templates directory unless absolute
    pub compose: PathBuf,

    /// Subdomain -> template variable receiving that subdomain's port.
    /// The `main` subdomain publishes at `student.lab.domain`.
    #[serde(default = "default_subdomain_routes")]
    pub subdomain_routes: BTreeMap<String, String>,

    #[serde(default)]
    pub features: LabFeatures,

    /// Optional human-readable description shown in listings
    pub description: Option<String>,
}

fn default_subdomain_routes() -> BTreeMap<String, String> {
    BTreeMap::from([(MAIN_SUBDOMAIN.to_string(), "port".to_string())])
}

impl LabDefinition {
    pub fn new(compose: impl Into<PathBuf>) -> Self {
        Self {
            compose: compose.into(),
            subdomain_routes: default_subdomain_routes(),
            features: LabFeatures::default(),
            description: None,
        }
    }

    /// Replace the subdomain routes (builder pattern)
    pub fn with_routes<'a>(mut self, routes: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        self.subdomain_routes = routes
            .into_iter()
            .map(|(s, v)| (s.to_string(), v.to_string()))
            .collect();
        self
    }

    /// Enable WebSocket proxying (builder pattern)
    pub fn with_websockets(mut self) -> Self {
        self.features.websockets = true;
        self
    }

    /// Validate the definition
    pub fn validate(&self, lab_id: &str) -> Result<(), String> {
        if validate_token("lab_id", lab_id).is_err() {
            return Err(format!(
                "Lab {:?}: id must not contain '|', ',', '/', or whitespace",
                lab_id
            ));
        }
        if self.compose.as_os_str().is_empty() {
            return Err(format!("Lab '{}': 'compose' must not be empty", lab_id));
        }
        if self.subdomain_routes.is_empty() {
            return Err(format!(
                "Lab '{}': 'subdomain_routes' must define at least one subdomain",
                lab_id
            ));
        }
        for (subdomain, variable) in &self.subdomain_routes {
            if validate_token("subdomain", subdomain).is_err() {
                return Err(format!("Lab '{}': invalid subdomain {:?}", lab_id, subdomain));
            }
            if variable.is_empty()
                || !variable.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(format!(
                    "Lab '{}': port variable {:?} for subdomain '{}' must be alphanumeric/underscore",
                    lab_id, variable, subdomain
                ));
            }
        }
        Ok(())
    }
}

/// Lookup over the configured labs
#[derive(Debug, Clone, Default)]
pub struct LabCatalog {
    labs: BTreeMap<String, LabDefinition>,
}

impl LabCatalog {
    pub fn new(labs: BTreeMap<String, LabDefinition>) -> Self {
        Self { labs }
    }

    pub fn get(&self, lab_id: &str) -> Result<&LabDefinition, LabError> {
        self.labs
            .get(lab_id)
            .ok_or_else(|| LabError::NotFound(lab_id.to_string()))
    }

    /// Lab ids in sorted order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.labs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LabDefinition)> {
        self.labs.iter().map(|(id, lab)| (id.as_str(), lab))
    }

    pub fn is_empty(&self) -> bool {
        self.labs.is_empty()
    }
}
