//! Lab provisioning
//!
//! Ties the pieces together: a lab is started for a student by allocating one port per
//! published subdomain, bringing the compose project up with those ports, and only then
//! recording the routes. Every operation ends with a save and a proxy reload.

use crate::compose::ComposeRunner;
use crate::error::Result;
use crate::labs::{LabCatalog, LabDefinition};
use crate::ports::{PortAllocator, PortProbe, TcpProbe};
use crate::route::{validate_token, RouteRecord};
use crate::store::{AddOutcome, NewRoute, RouteStore, Selector, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{error, info, warn};

/// Result of [`Provisioner::create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Containers were started and these routes recorded
    Created(Vec<RouteRecord>),
    /// The student already has this lab; nothing was touched
    AlreadyExists,
}

/// Counts reported by [`Provisioner::recreate_all`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecreateSummary {
    pub recreated: usize,
    pub failed: usize,
}

pub struct Provisioner<P = TcpProbe> {
    store: RouteStore,
    catalog: LabCatalog,
    allocator: PortAllocator<P>,
    compose: ComposeRunner,
    domain: String,
    target_address: String,
}

impl<P: PortProbe> Provisioner<P> {
    pub fn new(
        store: RouteStore,
        catalog: LabCatalog,
        allocator: PortAllocator<P>,
        compose: ComposeRunner,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            store,
            catalog,
            allocator,
            compose,
            domain: domain.into(),
            target_address: "127.0.0.1".to_string(),
        }
    }

    /// Address the proxy forwards to (builder pattern)
    pub fn with_target_address(mut self, address: impl Into<String>) -> Self {
        self.target_address = address.into();
        self
    }

    pub fn store(&self) -> &RouteStore {
        &self.store
    }

    pub fn catalog(&self) -> &LabCatalog {
        &self.catalog
    }

    /// Labs that can be created
    pub fn available_labs(&self) -> Vec<(&str, &LabDefinition)> {
        self.catalog.iter().collect()
    }

    /// Lab id -> students currently running it
    pub fn active_labs(&self) -> BTreeMap<String, Vec<String>> {
        self.store.active_labs()
    }

    /// Start `lab_id` for `student_id` and publish its routes
    pub async fn create(
        &mut self,
        student_id: &str,
        lab_id: &str,
        skip_reload: bool,
    ) -> Result<CreateOutcome> {
        let outcome = self.provision(student_id, lab_id).await?;
        if let CreateOutcome::Created(_) = outcome {
            self.commit(skip_reload).await?;
        }
        Ok(outcome)
    }

    /// Create `lab_id` for students `<prefix><start>` .. `<prefix><start + count - 1>`.
    ///
    /// Stops at the first failure; students created before it are still saved.
    pub async fn create_many(
        &mut self,
        prefix: &str,
        lab_id: &str,
        count: u32,
        start: u32,
        skip_reload: bool,
    ) -> Result<Vec<String>> {
        let mut created = Vec::new();
        let mut failure = None;

        for n in start..start.saturating_add(count) {
            let student_id = format!("{}{}", prefix, n);
            match self.provision(&student_id, lab_id).await {
                Ok(CreateOutcome::Created(_)) => created.push(student_id),
                Ok(CreateOutcome::AlreadyExists) => {}
                Err(e) => {
                    error!(student = %student_id, lab = lab_id, error = %e, "Failed to create lab");
                    failure = Some(e);
                    break;
                }
            }
        }

        if !created.is_empty() {
            self.commit(skip_reload).await?;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    /// Tear down every lab matching the selectors and drop their routes
    pub async fn delete(
        &mut self,
        student: &Selector,
        lab: &Selector,
        skip_reload: bool,
    ) -> Result<Vec<RouteRecord>> {
        let removed = self.teardown(student, lab).await;
        if !removed.is_empty() {
            self.commit(skip_reload).await?;
        } else {
            info!("No routes matched, nothing to delete");
        }
        Ok(removed)
    }

    /// Delete and recreate every active lab, pausing between teardown and startup
    pub async fn recreate_all(&mut self, pause: Duration, skip_reload: bool) -> Result<RecreateSummary> {
        let pairs: Vec<(String, String)> = self
            .store
            .active_labs()
            .into_iter()
            .flat_map(|(lab, students)| students.into_iter().map(move |s| (s, lab.clone())))
            .collect();

        let mut summary = RecreateSummary::default();
        for (student_id, lab_id) in pairs {
            let student = Selector::Exact(student_id.clone());
            let lab = Selector::Exact(lab_id.clone());
            self.teardown(&student, &lab).await;
            self.store.save()?;

            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            match self.provision(&student_id, &lab_id).await {
                Ok(_) => {
                    self.store.save()?;
                    summary.recreated += 1;
                }
                Err(e) => {
                    error!(student = %student_id, lab = %lab_id, error = %e, "Failed to recreate lab");
                    summary.failed += 1;
                }
            }
        }

        self.store.reload(skip_reload).await?;
        info!(
            recreated = summary.recreated,
            failed = summary.failed,
            "Recreated active labs"
        );
        Ok(summary)
    }

    /// Start containers and add routes without saving
    async fn provision(&mut self, student_id: &str, lab_id: &str) -> Result<CreateOutcome> {
        let lab = self.catalog.get(lab_id)?.clone();
        validate_token("student_id", student_id)?;
        validate_token("lab_id", lab_id)?;

        let student = Selector::Exact(student_id.to_string());
        let lab_selector = Selector::Exact(lab_id.to_string());
        if self.store.matching(&student, &lab_selector).next().is_some() {
            info!(student = student_id, lab = lab_id, "Lab already exists for student");
            return Ok(CreateOutcome::AlreadyExists);
        }

        let ports = self
            .allocator
            .allocate(lab.subdomain_routes.len(), self.store.allocated_ports())?;
        let assignments: Vec<(&String, &String, u16)> = lab
            .subdomain_routes
            .iter()
            .zip(ports)
            .map(|((subdomain, variable), port)| (subdomain, variable, port))
            .collect();

        let container = format!("{}-{}", student_id, lab_id);
        let mut variables = BTreeMap::from([
            ("student_id".to_string(), student_id.to_string()),
            ("lab_id".to_string(), lab_id.to_string()),
            ("container_name".to_string(), container.clone()),
            ("domain".to_string(), self.domain.clone()),
        ]);
        for (_, variable, port) in &assignments {
            variables.insert((*variable).clone(), port.to_string());
        }

        // every route must be addable before any container starts
        let features = lab.features.route_features();
        let requests: Vec<NewRoute> = assignments
            .iter()
            .map(|(subdomain, _, port)| {
                NewRoute::new(student_id, lab_id, subdomain.as_str(), &self.domain, *port)
                    .with_target_address(&self.target_address)
                    .with_features(features.iter().cloned())
            })
            .collect();
        let records = requests
            .iter()
            .map(|request| self.store.check_route(request))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let project = self.compose.prepare(&container, &lab.compose, &variables)?;
        if let Err(e) = self.compose.up(&project).await {
            self.compose.discard(&project);
            return Err(e.into());
        }

        let mut created = Vec::new();
        let mut failure = None;
        for (request, route) in requests.into_iter().zip(records) {
            match self.store.add_route(request) {
                Ok(AddOutcome::Added) => created.push(route),
                Ok(AddOutcome::AlreadyPresent) => {
                    failure = Some(StoreError::NameTaken { name: route.name() });
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            error!(student = student_id, lab = lab_id, error = %e, "Failed to record routes, stopping containers");
            for route in &created {
                self.store.remove_route(&route.name());
            }
            if let Err(down) = self.compose.down(&project).await {
                error!(container = %container, error = %down, "Failed to stop containers");
                self.compose.discard(&project);
            }
            return Err(e.into());
        }

        info!(student = student_id, lab = lab_id, routes = created.len(), "Lab created");
        Ok(CreateOutcome::Created(created))
    }

    /// Remove matching routes and bring their compose projects down without saving
    async fn teardown(&mut self, student: &Selector, lab: &Selector) -> Vec<RouteRecord> {
        let names: Vec<String> = self.store.matching(student, lab).map(|r| r.name()).collect();
        let removed: Vec<RouteRecord> = names
            .iter()
            .filter_map(|name| self.store.remove_route(name))
            .collect();

        let mut containers = BTreeSet::new();
        for route in &removed {
            containers.insert((route.container_name(), route.lab_id().to_string()));
        }

        for (container, lab_id) in containers {
            let template = match self.catalog.get(&lab_id) {
                Ok(lab) => lab.compose.clone(),
                Err(e) => {
                    warn!(container = %container, error = %e, "No compose template, skipping container teardown");
                    continue;
                }
            };
            let project = self.compose.existing(&container, &template);
            if let Err(e) = self.compose.down(&project).await {
                error!(container = %container, error = %e, "Failed to stop containers");
            }
        }

        removed
    }

    async fn commit(&self, skip_reload: bool) -> Result<()> {
        self.store.save()?;
        self.store.reload(skip_reload).await?;
        Ok(())
    }
}
