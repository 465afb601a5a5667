//! The route store
//!
//! The proxy configuration file is the only durable state. Loading parses every
//! blank-line separated block that starts with a metadata line back into a route;
//! saving regenerates the whole file from memory and swaps it into place atomically.
//!
//! The store assumes a single operator. Callers that may run concurrently should
//! hold a [`crate::lock::StoreLock`] across load, mutation and save.

use crate::certs::CertificateError;
use crate::reload::{ProxyReloader, ReloadError, ReloadOutcome};
use crate::route::{Feature, MetadataError, RouteRecord, METADATA_MARKER};
use crate::synth::Synthesizer;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid route: {0}")]
    InvalidRoute(#[from] MetadataError),

    #[error("route {name} is already published")]
    NameTaken { name: String },

    #[error("target port {port} is already used by {existing}")]
    PortConflict { port: u16, existing: String },

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// A block that looked like a route but could not be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    /// Zero-based index of the block in the file
    pub block: usize,
    /// The offending metadata line
    pub line: String,
    pub reason: String,
}

/// Result of parsing a configuration file's text
#[derive(Debug, Default)]
pub struct ParsedConfig {
    pub routes: Vec<RouteRecord>,
    pub warnings: Vec<ParseWarning>,
}

/// Split configuration text into blocks separated by blank lines
fn blocks(content: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Parse routes out of configuration text.
///
/// Blocks without a leading metadata line (headers, hand-written boilerplate) are
/// dropped. A malformed metadata line or a duplicate route name only costs its own
/// block; it is reported as a warning and parsing continues.
pub fn parse_config(content: &str) -> ParsedConfig {
    let mut parsed = ParsedConfig::default();
    let mut names = BTreeSet::new();

    for (index, block) in blocks(content).into_iter().enumerate() {
        let first = block[0].trim();
        if !first.starts_with(METADATA_MARKER) {
            debug!(block = index, "Dropping block without metadata");
            continue;
        }

        match RouteRecord::from_metadata_line(first) {
            Ok(route) => {
                if names.insert(route.name()) {
                    parsed.routes.push(route);
                } else {
                    parsed.warnings.push(ParseWarning {
                        block: index,
                        line: first.to_string(),
                        reason: format!("duplicate route {}", route.name()),
                    });
                }
            }
            Err(e) => parsed.warnings.push(ParseWarning {
                block: index,
                line: first.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    parsed
}

/// Request to publish one subdomain
#[derive(Debug, Clone)]
pub struct NewRoute {
    pub student_id: String,
    pub lab_id: String,
    pub subdomain: String,
    pub domain: String,
    pub target_port: u16,
    pub target_address: String,
    pub features: BTreeSet<Feature>,
    /// `None` uses the certificate provider's defaults
    pub listen_ports: Option<Vec<u16>>,
}

impl NewRoute {
    pub fn new(
        student_id: impl Into<String>,
        lab_id: impl Into<String>,
        subdomain: impl Into<String>,
        domain: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            lab_id: lab_id.into(),
            subdomain: subdomain.into(),
            domain: domain.into(),
            target_port,
            target_address: "127.0.0.1".to_string(),
            features: BTreeSet::new(),
            listen_ports: None,
        }
    }

    /// Set the backend address (builder pattern)
    pub fn with_target_address(mut self, address: impl Into<String>) -> Self {
        self.target_address = address.into();
        self
    }

    /// Set feature flags (builder pattern)
    pub fn with_features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.features = features.into_iter().collect();
        self
    }

    /// Set explicit listen ports (builder pattern)
    pub fn with_listen_ports(mut self, ports: Vec<u16>) -> Self {
        self.listen_ports = Some(ports);
        self
    }
}

/// Result of [`RouteStore::add_route`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// A route with the same name exists; it was left untouched
    AlreadyPresent,
}

/// Matches a student or lab id; `*` matches everything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Exact(String),
}

impl Selector {
    pub fn parse(s: &str) -> Self {
        if s == "*" {
            Selector::All
        } else {
            Selector::Exact(s.to_string())
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Exact(expected) => expected == value,
        }
    }
}

/// Routes for one proxy instance, backed by its configuration file
#[derive(Debug)]
pub struct RouteStore {
    path: PathBuf,
    routes: Vec<RouteRecord>,
    in_use_ports: BTreeSet<u16>,
    warnings: Vec<ParseWarning>,
    synthesizer: Synthesizer,
    reloader: ProxyReloader,
}

impl RouteStore {
    /// Load the store from `path`, creating an empty file if none exists
    pub fn load(path: impl Into<PathBuf>, synthesizer: Synthesizer) -> Result<Self, StoreError> {
        let path = path.into();

        if !path.exists() {
            info!(path = %path.display(), "Creating empty proxy configuration");
            std::fs::write(&path, "").map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        }

        let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;

        let parsed = parse_config(&content);
        for warning in &parsed.warnings {
            warn!(
                path = %path.display(),
                block = warning.block,
                line = %warning.line,
                reason = %warning.reason,
                "Skipping unparseable route block"
            );
        }

        let mut store = Self {
            path,
            routes: parsed.routes,
            in_use_ports: BTreeSet::new(),
            warnings: parsed.warnings,
            synthesizer,
            reloader: ProxyReloader::default(),
        };
        store.refresh_in_use();

        info!(
            path = %store.path.display(),
            routes = store.routes.len(),
            skipped = store.warnings.len(),
            "Route store loaded"
        );
        Ok(store)
    }

    /// Use a specific reload command (builder pattern)
    pub fn with_reloader(mut self, reloader: ProxyReloader) -> Self {
        self.reloader = reloader;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn routes(&self) -> &[RouteRecord] {
        &self.routes
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }

    /// Blocks skipped during load
    pub fn warnings(&self) -> &[ParseWarning] {
        &self.warnings
    }

    pub fn get(&self, name: &str) -> Option<&RouteRecord> {
        self.routes.iter().find(|r| r.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Routes whose student and lab match the selectors
    pub fn matching<'a>(
        &'a self,
        student: &'a Selector,
        lab: &'a Selector,
    ) -> impl Iterator<Item = &'a RouteRecord> + 'a {
        self.routes
            .iter()
            .filter(move |r| student.matches(r.student_id()) && lab.matches(r.lab_id()))
    }

    /// Lab id -> students with at least one route in that lab
    pub fn active_labs(&self) -> BTreeMap<String, Vec<String>> {
        let mut labs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for route in &self.routes {
            labs.entry(route.lab_id().to_string())
                .or_default()
                .insert(route.student_id().to_string());
        }
        labs.into_iter()
            .map(|(lab, students)| (lab, students.into_iter().collect()))
            .collect()
    }

    /// Ports claimed by stored routes, to exclude from allocation
    pub fn allocated_ports(&self) -> &BTreeSet<u16> {
        &self.in_use_ports
    }

    fn refresh_in_use(&mut self) {
        self.in_use_ports = self
            .routes
            .iter()
            .flat_map(|r| std::iter::once(r.target_port()).chain(r.listen_ports().iter().copied()))
            .collect();
    }

    fn build_record(&self, request: NewRoute) -> Result<RouteRecord, StoreError> {
        let listen_ports = request
            .listen_ports
            .unwrap_or_else(|| self.synthesizer.certificates().default_listen_ports());

        Ok(RouteRecord::new(
            request.student_id,
            request.subdomain,
            request.lab_id,
            request.domain,
            request.target_address,
            request.target_port,
            listen_ports,
            request.features,
        )?)
    }

    fn check_target_port(&self, route: &RouteRecord) -> Result<(), StoreError> {
        match self
            .routes
            .iter()
            .find(|r| r.target_port() == route.target_port())
        {
            Some(existing) => Err(StoreError::PortConflict {
                port: route.target_port(),
                existing: existing.name(),
            }),
            None => Ok(()),
        }
    }

    /// Build the record `request` would add without adding it.
    ///
    /// Unlike [`RouteStore::add_route`], a name that is already stored is an error.
    pub fn check_route(&self, request: &NewRoute) -> Result<RouteRecord, StoreError> {
        let route = self.build_record(request.clone())?;
        let name = route.name();
        if self.contains(&name) {
            return Err(StoreError::NameTaken { name });
        }
        self.check_target_port(&route)?;
        Ok(route)
    }

    /// Add a route. Adding a name that already exists is a no-op.
    pub fn add_route(&mut self, request: NewRoute) -> Result<AddOutcome, StoreError> {
        let route = self.build_record(request)?;

        let name = route.name();
        if self.contains(&name) {
            debug!(route = %name, "Route already exists, leaving it unchanged");
            return Ok(AddOutcome::AlreadyPresent);
        }
        self.check_target_port(&route)?;

        info!(route = %route.route_map(), "Added route");
        self.routes.push(route);
        self.refresh_in_use();
        Ok(AddOutcome::Added)
    }

    /// Remove a route by name. Unknown names are ignored.
    pub fn remove_route(&mut self, name: &str) -> Option<RouteRecord> {
        let index = self.routes.iter().position(|r| r.name() == name)?;
        let route = self.routes.remove(index);
        self.refresh_in_use();
        info!(route = %route.route_map(), "Removed route");
        Some(route)
    }

    /// The file content `save` would write
    pub fn render(&self) -> Result<String, StoreError> {
        Ok(self.synthesizer.render_all(&self.routes)?)
    }

    /// Rewrite the configuration file from the in-memory routes.
    ///
    /// Content is written to a temporary file in the same directory and renamed
    /// over the existing file, so a failure leaves the previous file intact.
    pub fn save(&self) -> Result<(), StoreError> {
        let content = self.render()?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let write_err = |source: std::io::Error| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(content.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        set_readable(tmp.path()).map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        info!(
            path = %self.path.display(),
            routes = self.routes.len(),
            "Saved proxy configuration"
        );
        Ok(())
    }

    /// Signal the proxy to reload unless `skip` is set. A failed reload is
    /// reported but does not undo the last save.
    pub async fn reload(&self, skip: bool) -> Result<ReloadOutcome, ReloadError> {
        self.reloader.reload(skip).await
    }
}

/// Temporary files are created owner-only; the proxy needs to read the result
#[cfg(unix)]
fn set_readable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_readable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
