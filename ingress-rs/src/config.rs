//! Configuration for the proxy.
//!
//! [`ProxyConfig`] is the validated, programmatic construction surface;
//! [`FileConfig`] is the TOML file format the binary loads and maps onto it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::acme::LETS_ENCRYPT;
use crate::error::{ProxyError, Result};
use crate::rule::HostPolicy;

/// Transformer applied to an HTTP server's handler stack before start.
pub type HttpMiddleware = Arc<dyn Fn(axum::Router) -> axum::Router + Send + Sync>;

/// Hook applied to a gRPC server builder before start.
pub type GrpcInit = Arc<dyn Fn(&mut h2::server::Builder) + Send + Sync>;

/// Validated proxy options. Built with [`ProxyConfig::builder`].
#[derive(Clone)]
pub struct ProxyConfig {
    pub(crate) insecure_port: u16,
    pub(crate) secure_port: u16,
    pub(crate) cert_cache: PathBuf,
    pub(crate) acme_contact: Option<String>,
    pub(crate) acme_directory: String,
    pub(crate) host_policy: HostPolicy,
    pub(crate) routes: Vec<String>,
    pub(crate) middlewares: Vec<HttpMiddleware>,
    pub(crate) http_init: Vec<HttpMiddleware>,
    pub(crate) https_init: Vec<HttpMiddleware>,
    pub(crate) grpc_init: Vec<GrpcInit>,
    pub(crate) grpcs_init: Vec<GrpcInit>,
    pub(crate) redirect_https: bool,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("insecure_port", &self.insecure_port)
            .field("secure_port", &self.secure_port)
            .field("cert_cache", &self.cert_cache)
            .field("acme_contact", &self.acme_contact)
            .field("acme_directory", &self.acme_directory)
            .field("host_policy", &self.host_policy)
            .field("routes", &self.routes)
            .field("redirect_https", &self.redirect_https)
            .finish()
    }
}

impl ProxyConfig {
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }
}

/// Builder for [`ProxyConfig`]. A host policy and at least one routing
/// expression are required.
pub struct ProxyConfigBuilder {
    insecure_port: u16,
    secure_port: u16,
    cert_cache: PathBuf,
    acme_contact: Option<String>,
    acme_directory: String,
    host_policy: Option<HostPolicy>,
    routes: Vec<String>,
    middlewares: Vec<HttpMiddleware>,
    http_init: Vec<HttpMiddleware>,
    https_init: Vec<HttpMiddleware>,
    grpc_init: Vec<GrpcInit>,
    grpcs_init: Vec<GrpcInit>,
    redirect_https: bool,
}

impl Default for ProxyConfigBuilder {
    fn default() -> Self {
        Self {
            insecure_port: 80,
            secure_port: 443,
            cert_cache: PathBuf::from("/tmp/certs"),
            acme_contact: None,
            acme_directory: LETS_ENCRYPT.to_string(),
            host_policy: None,
            routes: Vec::new(),
            middlewares: Vec::new(),
            http_init: Vec::new(),
            https_init: Vec::new(),
            grpc_init: Vec::new(),
            grpcs_init: Vec::new(),
            redirect_https: false,
        }
    }
}

impl ProxyConfigBuilder {
    /// Port for plaintext traffic (default 80).
    pub fn insecure_port(mut self, port: u16) -> Self {
        self.insecure_port = port;
        self
    }

    /// Port for TLS traffic (default 443).
    pub fn secure_port(mut self, port: u16) -> Self {
        self.secure_port = port;
        self
    }

    /// Directory certificates are cached in (default `/tmp/certs`).
    pub fn cert_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_cache = path.into();
        self
    }

    /// Contact email for the ACME account.
    pub fn acme_contact(mut self, contact: impl Into<String>) -> Self {
        self.acme_contact = Some(contact.into());
        self
    }

    /// ACME directory URL (default Let's Encrypt production).
    pub fn acme_directory(mut self, url: impl Into<String>) -> Self {
        self.acme_directory = url.into();
        self
    }

    /// The certificate host policy (required).
    pub fn host_policy(mut self, policy: HostPolicy) -> Self {
        self.host_policy = Some(policy);
        self
    }

    /// Add one routing expression.
    pub fn route(mut self, expression: impl Into<String>) -> Self {
        self.routes.push(expression.into());
        self
    }

    /// Add several routing expressions.
    pub fn routes<I, S>(mut self, expressions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes.extend(expressions.into_iter().map(Into::into));
        self
    }

    /// Add a handler transformer applied to both HTTP servers.
    pub fn middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(axum::Router) -> axum::Router + Send + Sync + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Add a transformer applied to the plaintext HTTP server only.
    pub fn http_init<F>(mut self, init: F) -> Self
    where
        F: Fn(axum::Router) -> axum::Router + Send + Sync + 'static,
    {
        self.http_init.push(Arc::new(init));
        self
    }

    /// Add a transformer applied to the TLS HTTP server only.
    pub fn https_init<F>(mut self, init: F) -> Self
    where
        F: Fn(axum::Router) -> axum::Router + Send + Sync + 'static,
    {
        self.https_init.push(Arc::new(init));
        self
    }

    /// Add a hook applied to the plaintext gRPC server builder.
    pub fn grpc_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&mut h2::server::Builder) + Send + Sync + 'static,
    {
        self.grpc_init.push(Arc::new(init));
        self
    }

    /// Add a hook applied to the TLS gRPC server builder.
    pub fn grpcs_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&mut h2::server::Builder) + Send + Sync + 'static,
    {
        self.grpcs_init.push(Arc::new(init));
        self
    }

    /// Answer plaintext HTTP with a 301 to HTTPS instead of proxying.
    pub fn redirect_https(mut self, redirect: bool) -> Self {
        self.redirect_https = redirect;
        self
    }

    pub fn build(self) -> Result<ProxyConfig> {
        if self.routes.is_empty() {
            return Err(ProxyError::Config(
                "at least one routing expression is required".to_string(),
            ));
        }
        let host_policy = self
            .host_policy
            .ok_or_else(|| ProxyError::Config("host policy is required".to_string()))?;
        Ok(ProxyConfig {
            insecure_port: self.insecure_port,
            secure_port: self.secure_port,
            cert_cache: self.cert_cache,
            acme_contact: self.acme_contact,
            acme_directory: self.acme_directory,
            host_policy,
            routes: self.routes,
            middlewares: self.middlewares,
            http_init: self.http_init,
            https_init: self.https_init,
            grpc_init: self.grpc_init,
            grpcs_init: self.grpcs_init,
            redirect_https: self.redirect_https,
        })
    }
}

/// TOML file configuration for the binary.
///
/// ```toml
/// debug = false
/// watch = true
///
/// [server]
/// insecure_port = 80
/// secure_port = 443
/// redirect_https = false
///
/// [acme]
/// cache_dir = "/tmp/certs"
/// contact = "ops@example.com"
/// allowed_hosts = ["example.com", "api.example.com"]
///
/// routing = [
///     'http && host == "example.com" => "http://127.0.0.1:3000"',
///     'grpc && host == "api.example.com" => "127.0.0.1:50051"',
/// ]
///
/// [cors]
/// origins = ["https://app.example.com"]
/// methods = ["GET", "POST"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub acme: AcmeSection,
    /// Routing expressions, evaluated in order.
    pub routing: Vec<String>,
    pub cors: Option<CorsSection>,
    #[serde(default)]
    pub debug: bool,
    /// Re-apply the routing table when the config file changes.
    #[serde(default)]
    pub watch: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "default_insecure_port")]
    pub insecure_port: u16,
    #[serde(default = "default_secure_port")]
    pub secure_port: u16,
    #[serde(default)]
    pub redirect_https: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            insecure_port: default_insecure_port(),
            secure_port: default_secure_port(),
            redirect_https: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcmeSection {
    #[serde(default = "default_cert_cache")]
    pub cache_dir: PathBuf,
    pub contact: Option<String>,
    #[serde(default = "default_acme_directory")]
    pub directory: String,
    /// Fixed allow-list of hostnames certificates may be issued for.
    pub allowed_hosts: Option<Vec<String>>,
    /// Expression host policy, e.g. `host.ends_with(".example.com")`.
    pub policy: Option<String>,
}

impl Default for AcmeSection {
    fn default() -> Self {
        Self {
            cache_dir: default_cert_cache(),
            contact: None,
            directory: default_acme_directory(),
            allowed_hosts: None,
            policy: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsSection {
    #[serde(default)]
    pub origins: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub headers: Vec<String>,
}

fn default_insecure_port() -> u16 {
    80
}

fn default_secure_port() -> u16 {
    443
}

fn default_cert_cache() -> PathBuf {
    PathBuf::from("/tmp/certs")
}

fn default_acme_directory() -> String {
    LETS_ENCRYPT.to_string()
}

impl FileConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("failed to read config file: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("failed to parse config: {e}")))
    }

    /// The host policy described by the `[acme]` section.
    pub fn host_policy(&self) -> Result<HostPolicy> {
        if let Some(hosts) = &self.acme.allowed_hosts {
            return Ok(HostPolicy::allowed_hosts(hosts.clone()));
        }
        if let Some(expression) = &self.acme.policy {
            return HostPolicy::expression(expression);
        }
        Err(ProxyError::Config(
            "acme section needs either allowed_hosts or policy".to_string(),
        ))
    }

    /// Map the file settings onto the proxy construction surface, leaving
    /// the builder open for programmatic additions (e.g. middleware).
    pub fn to_builder(&self) -> Result<ProxyConfigBuilder> {
        let mut builder = ProxyConfig::builder()
            .insecure_port(self.server.insecure_port)
            .secure_port(self.server.secure_port)
            .cert_cache(self.acme.cache_dir.clone())
            .acme_directory(self.acme.directory.clone())
            .host_policy(self.host_policy()?)
            .routes(self.routing.clone())
            .redirect_https(self.server.redirect_https);
        if let Some(contact) = &self.acme.contact {
            builder = builder.acme_contact(contact.clone());
        }
        Ok(builder)
    }

    /// Map the file settings onto the proxy construction surface.
    pub fn to_proxy_config(&self) -> Result<ProxyConfig> {
        self.to_builder()?.build()
    }
}
