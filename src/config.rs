use crate::certs::{CertProviderKind, CertificateProvider, SelfSignedProvider};
use crate::compose::ComposeRunner;
use crate::labs::{LabCatalog, LabDefinition};
use crate::ports::PortAllocator;
use crate::reload::ProxyReloader;
use crate::synth::{GuardHeader, Synthesizer};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {name}: {reason}")]
    Env { name: &'static str, reason: String },

    #[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Environment variable overriding `proxy.config_dir`
pub const ENV_PROXY_CONF_DIR: &str = "LABGATE_PROXY_CONF_DIR";
/// Environment variable overriding `tls.provider`
pub const ENV_CERT_PROVIDER: &str = "LABGATE_CERT_PROVIDER";
/// Environment variable overriding `proxy.guard_value`
pub const ENV_GUARD_VALUE: &str = "LABGATE_GUARD_VALUE";
/// Environment variable overriding `domain`
pub const ENV_DOMAIN: &str = "LABGATE_DOMAIN";

/// Longest certificate validity accepted in `tls.validity_days` (100 years)
pub const MAX_VALIDITY_DAYS: u32 = 36_500;

/// Global configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Base domain shared by every lab route
    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub ports: PortsConfig,

    #[serde(default)]
    pub compose: ComposeConfig,

    /// Lab definitions keyed by lab id
    #[serde(default)]
    pub labs: BTreeMap<String, LabDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Directory holding the proxy configuration (default: /etc/nginx/)
    #[serde(default = "default_proxy_config_dir")]
    pub config_dir: PathBuf,

    /// File inside `config_dir` that holds the generated routes
    #[serde(default = "default_proxy_config_file")]
    pub config_file: String,

    /// Command that makes the proxy re-read its configuration
    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    /// Header carrying the shared secret
    #[serde(default = "default_guard_header")]
    pub guard_header: String,

    /// Shared secret; when set, requests without it are answered with 403
    pub guard_value: Option<String>,

    /// Hold an exclusive lock on the configuration while a command runs
    #[serde(default = "default_true")]
    pub lock: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            config_dir: default_proxy_config_dir(),
            config_file: default_proxy_config_file(),
            reload_command: default_reload_command(),
            guard_header: default_guard_header(),
            guard_value: None,
            lock: true,
        }
    }
}

impl ProxyConfig {
    /// Full path of the generated configuration file
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(&self.config_file)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// "none" or "self-signed"
    #[serde(default)]
    pub provider: CertProviderKind,

    /// Where generated certificates and keys are kept
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Subject organization for generated certificates
    #[serde(default = "default_organization")]
    pub organization: String,

    /// Validity of generated certificates in days
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            provider: CertProviderKind::default(),
            cert_dir: default_cert_dir(),
            organization: default_organization(),
            validity_days: default_validity_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    /// First port handed out to backends
    #[serde(default = "default_port_start")]
    pub start: u16,

    /// End of the backend port range (exclusive)
    #[serde(default = "default_port_end")]
    pub end: u16,

    /// Per-port connect timeout while probing for listeners
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Address the proxy forwards to
    #[serde(default = "default_target_address")]
    pub target_address: String,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            probe_timeout_ms: default_probe_timeout(),
            target_address: default_target_address(),
        }
    }
}

impl PortsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ComposeConfig {
    /// Compose CLI invocation (e.g. "docker compose" or "docker-compose")
    #[serde(default = "default_compose_command")]
    pub command: String,

    /// Directory that lab `compose` paths are relative to
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,

    /// Directory for per-student env files
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            command: default_compose_command(),
            templates_dir: default_templates_dir(),
            work_dir: default_work_dir(),
        }
    }
}

// Default value functions
fn default_domain() -> String {
    "example.com".to_string()
}

fn default_proxy_config_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/")
}

fn default_proxy_config_file() -> String {
    "labgate.conf".to_string()
}

fn default_reload_command() -> String {
    "nginx -s reload".to_string()
}

fn default_guard_header() -> String {
    "X-Labgate-Token".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("./certs")
}

fn default_organization() -> String {
    "labgate".to_string()
}

fn default_validity_days() -> u32 {
    365
}

fn default_port_start() -> u16 {
    8000
}

fn default_port_end() -> u16 {
    9000
}

fn default_probe_timeout() -> u64 {
    200 // ms; nothing listening on loopback is refused immediately
}

fn default_target_address() -> String {
    "127.0.0.1".to_string()
}

fn default_compose_command() -> String {
    "docker compose".to_string()
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("./lab_configs")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./tmp")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            proxy: ProxyConfig::default(),
            tls: TlsConfig::default(),
            ports: PortsConfig::default(),
            compose: ComposeConfig::default(),
            labs: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Read, apply environment overrides, and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in `load`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_PROXY_CONF_DIR) {
            self.proxy.config_dir = PathBuf::from(dir);
        }
        if let Some(provider) = lookup(ENV_CERT_PROVIDER) {
            self.tls.provider = provider.parse().map_err(|e| ConfigError::Env {
                name: ENV_CERT_PROVIDER,
                reason: format!("{}", e),
            })?;
        }
        if let Some(value) = lookup(ENV_GUARD_VALUE) {
            self.proxy.guard_value = if value.is_empty() { None } else { Some(value) };
        }
        if let Some(domain) = lookup(ENV_DOMAIN) {
            self.domain = domain;
        }
        Ok(())
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if crate::route::validate_token("domain", &self.domain).is_err() {
            errors.push(format!("'domain' is invalid: {:?}", self.domain));
        }
        if self.ports.start == 0 || self.ports.start >= self.ports.end {
            errors.push(format!(
                "'ports' range {}-{} is invalid",
                self.ports.start, self.ports.end
            ));
        }
        if crate::route::validate_token("target_address", &self.ports.target_address).is_err() {
            errors.push(format!(
                "'ports.target_address' is invalid: {:?}",
                self.ports.target_address
            ));
        }
        if self.tls.validity_days == 0 || self.tls.validity_days > MAX_VALIDITY_DAYS {
            errors.push(format!(
                "'tls.validity_days' must be between 1 and {}",
                MAX_VALIDITY_DAYS
            ));
        }
        if self.proxy.config_file.is_empty() {
            errors.push("'proxy.config_file' must not be empty".to_string());
        }
        if let Err(e) = self.guard() {
            errors.push(e);
        }
        if let Err(e) = ProxyReloader::from_command_line(&self.proxy.reload_command) {
            errors.push(e.to_string());
        }
        if let Err(e) = shell_words::split(&self.compose.command) {
            errors.push(format!("'compose.command' is invalid: {}", e));
        }
        for (lab_id, lab) in &self.labs {
            if let Err(e) = lab.validate(lab_id) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        Ok(())
    }

    fn guard(&self) -> Result<Option<GuardHeader>, String> {
        match &self.proxy.guard_value {
            Some(value) => GuardHeader::new(&self.proxy.guard_header, value)
                .map(Some)
                .map_err(|e| e.to_string()),
            None => Ok(None),
        }
    }

    /// Certificate provider selected by `tls.provider`
    pub fn certificate_provider(&self) -> CertificateProvider {
        match self.tls.provider {
            CertProviderKind::None => CertificateProvider::None,
            CertProviderKind::SelfSigned => CertificateProvider::SelfSigned(
                SelfSignedProvider::new(&self.tls.cert_dir, &self.domain)
                    .with_organization(&self.tls.organization)
                    .with_validity_days(i64::from(self.tls.validity_days)),
            ),
        }
    }

    /// Synthesizer with the configured provider and guard header
    pub fn synthesizer(&self) -> Result<Synthesizer, ConfigError> {
        let synthesizer = Synthesizer::new(self.certificate_provider());
        match self.guard().map_err(|e| ConfigError::Invalid(vec![e]))? {
            Some(guard) => Ok(synthesizer.with_guard(guard)),
            None => Ok(synthesizer),
        }
    }

    pub fn reloader(&self) -> Result<ProxyReloader, ConfigError> {
        ProxyReloader::from_command_line(&self.proxy.reload_command)
            .map_err(|e| ConfigError::Invalid(vec![e.to_string()]))
    }

    pub fn port_allocator(&self) -> PortAllocator {
        PortAllocator::new(self.ports.start, self.ports.end, self.ports.probe_timeout())
    }

    pub fn compose_runner(&self) -> Result<ComposeRunner, ConfigError> {
        ComposeRunner::new(
            &self.compose.command,
            &self.compose.templates_dir,
            &self.compose.work_dir,
        )
        .map_err(|e| ConfigError::Invalid(vec![e.to_string()]))
    }

    pub fn lab_catalog(&self) -> LabCatalog {
        LabCatalog::new(self.labs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml = r#"
domain = "labs.example.org"

[proxy]
config_dir = "/tmp/nginx"
config_file = "labs.conf"
reload_command = "systemctl reload nginx"
guard_value = "s3cret"

[tls]
provider = "self-signed"
cert_dir = "/var/lib/labgate/certs"

[ports]
start = 10000
end = 10100

[labs.xss101]
compose = "xss101.yml"
subdomain_routes = { main = "web_port", api = "api_port" }
features = { websockets = true }

[labs.csrf]
compose = "csrf.yml"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.domain, "labs.example.org");
        assert_eq!(config.proxy.config_path(), PathBuf::from("/tmp/nginx/labs.conf"));
        assert_eq!(config.tls.provider, CertProviderKind::SelfSigned);
        assert_eq!(config.ports.start, 10000);
        assert_eq!(config.labs.len(), 2);
        assert!(config.labs["xss101"].features.websockets);
        assert!(config.validate().is_ok());
        assert!(config.certificate_provider().is_enabled());
        assert!(config.synthesizer().unwrap().guard().is_some());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.domain, "example.com");
        assert_eq!(config.proxy.config_path(), PathBuf::from("/etc/nginx/labgate.conf"));
        assert_eq!(config.proxy.reload_command, "nginx -s reload");
        assert!(config.proxy.guard_value.is_none());
        assert!(config.proxy.lock);
        assert_eq!(config.tls.provider, CertProviderKind::None);
        assert_eq!(config.tls.validity_days, 365);
        assert_eq!(config.ports.start, 8000);
        assert_eq!(config.ports.end, 9000);
        assert_eq!(config.ports.probe_timeout(), Duration::from_millis(200));
        assert_eq!(config.compose.command, "docker compose");
        assert!(config.labs.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_provider_fails_at_parse() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[tls]
provider = "letsencrypt"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_provider_aliases() {
        for value in ["SELF_SIGNED", "Self-Signed", "self_signed", " self-signed "] {
            let config: Config =
                toml::from_str(&format!("[tls]\nprovider = \"{}\"\n", value)).unwrap();
            assert_eq!(config.tls.provider, CertProviderKind::SelfSigned, "{}", value);
        }
        let config: Config = toml::from_str("[tls]\nprovider = \"None\"\n").unwrap();
        assert_eq!(config.tls.provider, CertProviderKind::None);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_PROXY_CONF_DIR, "/srv/nginx"),
            (ENV_CERT_PROVIDER, "SELF_SIGNED"),
            (ENV_GUARD_VALUE, "token"),
            (ENV_DOMAIN, "wtf.local"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.proxy.config_dir, PathBuf::from("/srv/nginx"));
        assert_eq!(config.tls.provider, CertProviderKind::SelfSigned);
        assert_eq!(config.proxy.guard_value.as_deref(), Some("token"));
        assert_eq!(config.domain, "wtf.local");
    }

    #[test]
    fn test_env_override_rejects_unknown_provider() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|name| (name == ENV_CERT_PROVIDER).then(|| "acme".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: ENV_CERT_PROVIDER, .. }));
    }

    #[test]
    fn test_validate_collects_errors() {
        let config: Config = toml::from_str(
            r#"
domain = "bad domain"

[proxy]
guard_value = "has\"quote"
reload_command = ""

[ports]
start = 9000
end = 8000

[labs."x|y"]
compose = "a.yml"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'domain' is invalid"));
        assert!(err.contains("'ports' range 9000-8000 is invalid"));
        assert!(err.contains("guard header value"));
        assert!(err.contains("invalid reload command"));
        assert!(err.contains("x|y"));
    }

    #[test]
    fn test_validate_rejects_empty_port_range() {
        let mut config = Config::default();
        config.ports.start = 8000;
        config.ports.end = 8000;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'ports' range 8000-8000 is invalid"));

        config.ports.end = 8001;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_target_address() {
        let mut config = Config::default();
        config.ports.target_address = "10.0.0.1 bad".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'ports.target_address' is invalid"));
    }

    #[test]
    fn test_validate_bounds_validity_days() {
        let mut config = Config::default();
        config.tls.validity_days = u32::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'tls.validity_days' must be between 1 and 36500"));

        config.tls.validity_days = 0;
        assert!(config.validate().is_err());

        config.tls.validity_days = MAX_VALIDITY_DAYS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labgate.toml");
        std::fs::write(&path, "domain = \"example.net\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.domain.is_empty());

        let missing = Config::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
