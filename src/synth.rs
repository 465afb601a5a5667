//! Server block synthesis
//!
//! Each route renders to one nginx `server` block whose first line is the route's
//! metadata comment, so the generated file doubles as the route database. Blocks
//! never contain blank lines; a blank line is the block separator.

use crate::certs::{CertificateError, CertificatePaths, CertificateProvider};
use crate::route::{Feature, RouteRecord};
use std::fmt::Write;
use thiserror::Error;

const TLS_PORT: u16 = 443;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("guard header name {0:?} must be non-empty and contain only letters, digits and '-'")]
    InvalidName(String),

    #[error("guard header value must not contain quotes, backslashes or control characters")]
    InvalidValue,
}

/// Shared-secret header every proxied request must carry.
/// Requests arriving without it (for example straight to the backend IP) get a 403.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardHeader {
    name: String,
    value: String,
}

impl GuardHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self, GuardError> {
        let name = name.into();
        let value = value.into();

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(GuardError::InvalidName(name));
        }
        if value
            .chars()
            .any(|c| c == '"' || c == '\\' || c == '$' || c.is_control())
        {
            return Err(GuardError::InvalidValue);
        }
        Ok(Self { name, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// nginx variable holding this request header (`X-Foo-Bar` -> `$http_x_foo_bar`)
    pub fn variable(&self) -> String {
        format!("$http_{}", self.name.to_ascii_lowercase().replace('-', "_"))
    }
}

/// Renders routes into proxy configuration text
#[derive(Debug, Clone)]
pub struct Synthesizer {
    certificates: CertificateProvider,
    guard: Option<GuardHeader>,
}

impl Synthesizer {
    pub fn new(certificates: CertificateProvider) -> Self {
        Self {
            certificates,
            guard: None,
        }
    }

    /// Require a shared-secret header on every route (builder pattern)
    pub fn with_guard(mut self, guard: GuardHeader) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn certificates(&self) -> &CertificateProvider {
        &self.certificates
    }

    pub fn guard(&self) -> Option<&GuardHeader> {
        self.guard.as_ref()
    }

    /// Render a single server block (no trailing newline).
    ///
    /// Certificate material is requested only when the route listens on 443 and a
    /// TLS provider is active.
    pub fn render(&self, route: &RouteRecord) -> Result<String, CertificateError> {
        let terminate_tls =
            self.certificates.is_enabled() && route.listen_ports().contains(&TLS_PORT);
        let tls_paths = if terminate_tls {
            self.certificates.get_paths(route.lab_id())?
        } else {
            None
        };

        let mut block = String::new();
        // writing into a String cannot fail
        let _ = self.write_block(&mut block, route, tls_paths.as_ref());
        Ok(block)
    }

    /// Render every route, blank-line separated, with a trailing newline
    pub fn render_all<'a>(
        &self,
        routes: impl IntoIterator<Item = &'a RouteRecord>,
    ) -> Result<String, CertificateError> {
        let blocks = routes
            .into_iter()
            .map(|route| self.render(route))
            .collect::<Result<Vec<_>, _>>()?;

        if blocks.is_empty() {
            return Ok(String::new());
        }
        let mut content = blocks.join("\n\n");
        content.push('\n');
        Ok(content)
    }

    fn write_block(
        &self,
        out: &mut String,
        route: &RouteRecord,
        tls: Option<&CertificatePaths>,
    ) -> std::fmt::Result {
        writeln!(out, "{}", route.to_metadata_line())?;
        writeln!(out, "server {{")?;

        for port in route.listen_ports() {
            if *port == TLS_PORT && tls.is_some() {
                writeln!(out, "    listen {} ssl;", port)?;
            } else {
                writeln!(out, "    listen {};", port)?;
            }
        }
        writeln!(out, "    server_name {};", route.name())?;

        if let Some(paths) = tls {
            writeln!(out, "    ssl_certificate     {};", paths.cert.display())?;
            writeln!(out, "    ssl_certificate_key {};", paths.key.display())?;
            writeln!(out, "    ssl_prefer_server_ciphers off;")?;
        }

        writeln!(out, "    location / {{")?;
        if let Some(guard) = &self.guard {
            writeln!(out, "        if ({} != \"{}\") {{", guard.variable(), guard.value)?;
            writeln!(out, "            return 403;")?;
            writeln!(out, "        }}")?;
        }
        writeln!(
            out,
            "        proxy_pass http://{}:{};",
            route.target_address(),
            route.target_port()
        )?;
        writeln!(out, "        proxy_set_header Host $host;")?;
        writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;")?;
        writeln!(
            out,
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
        )?;
        if route.has_feature(&Feature::WebSocket) {
            writeln!(out, "        proxy_http_version 1.1;")?;
            writeln!(out, "        proxy_set_header Upgrade $http_upgrade;")?;
            writeln!(out, "        proxy_set_header Connection \"upgrade\";")?;
            writeln!(out, "        proxy_read_timeout 1h;")?;
        }
        writeln!(out, "    }}")?;
        write!(out, "}}")
    }
}
