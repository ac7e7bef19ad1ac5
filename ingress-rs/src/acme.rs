//! ACME certificate management.
//!
//! A thin adapter around the `instant-acme` client: it gates issuance behind
//! the host policy, persists account credentials and certificates in the
//! cert-cache directory, feeds HTTP-01 tokens to the challenge handler, and
//! supplies the TLS listener's certificate resolver.

use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use parking_lot::{Mutex, RwLock};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::rule::HostPolicy;

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory (for testing).
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Maximum time allowed for a complete certificate acquisition.
const ACME_TOTAL_TIMEOUT: Duration = Duration::from_secs(300);
/// How often the renewal loop wakes up.
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
/// Renew certificates expiring within this many days.
const RENEW_BEFORE_DAYS: i64 = 30;

/// ACME challenge token storage for HTTP-01 validation.
#[derive(Clone)]
pub struct ChallengeStore {
    tokens: Arc<tokio::sync::RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    pub async fn put(&self, token: &str, key_auth: &str) {
        let mut tokens = self.tokens.write().await;
        tokens.insert(token.to_string(), key_auth.to_string());
        debug!(token = %token, "Added ACME challenge");
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        let tokens = self.tokens.read().await;
        tokens.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        let mut tokens = self.tokens.write().await;
        tokens.remove(token);
        debug!(token = %token, "Removed ACME challenge");
    }
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Certificate metadata persisted next to the PEM pair.
#[derive(Debug, Serialize, Deserialize)]
struct CertMetadata {
    domain: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// ACME certificate manager.
pub struct CertManager {
    policy: HostPolicy,
    cache_dir: PathBuf,
    contact: Option<String>,
    directory_url: String,
    challenges: ChallengeStore,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    default_cert: RwLock<Option<Arc<CertifiedKey>>>,
    pending: Mutex<HashSet<String>>,
    account: tokio::sync::Mutex<Option<Account>>,
}

impl fmt::Debug for CertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertManager")
            .field("cache_dir", &self.cache_dir)
            .field("directory_url", &self.directory_url)
            .finish()
    }
}

impl CertManager {
    /// Create a manager over the given cache directory.
    ///
    /// The directory is created with mode 0700 when missing, and any
    /// certificates already cached there are loaded into the resolver.
    pub fn new(
        policy: HostPolicy,
        cache_dir: PathBuf,
        contact: Option<String>,
        directory_url: String,
    ) -> Result<Self> {
        ensure_cache_dir(&cache_dir)?;
        let manager = Self {
            policy,
            cache_dir,
            contact,
            directory_url,
            challenges: ChallengeStore::new(),
            certs: RwLock::new(HashMap::new()),
            default_cert: RwLock::new(None),
            pending: Mutex::new(HashSet::new()),
            account: tokio::sync::Mutex::new(None),
        };
        let loaded = manager.load_cached()?;
        if loaded > 0 {
            info!(count = loaded, "Loaded cached certificates");
        }
        Ok(manager)
    }

    /// The token store the HTTP challenge handler reads from.
    pub fn challenges(&self) -> ChallengeStore {
        self.challenges.clone()
    }

    pub(crate) fn certified(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.read().get(domain).cloned()
    }

    pub(crate) fn default_certified(&self) -> Option<Arc<CertifiedKey>> {
        self.default_cert.read().clone()
    }

    /// The rustls certificate resolver backed by this manager.
    pub(crate) fn resolver(self: &Arc<Self>) -> Arc<CertResolver> {
        Arc::new(CertResolver {
            manager: self.clone(),
        })
    }

    /// Kick off a background issuance for `domain` if the policy allows it
    /// and none is already running.
    pub(crate) fn request_issuance(self: &Arc<Self>, domain: &str) {
        if let Err(e) = self.policy.check(domain) {
            warn!(host = %domain, error = %e, "Refusing certificate issuance");
            return;
        }
        {
            let mut pending = self.pending.lock();
            if !pending.insert(domain.to_string()) {
                return;
            }
        }
        let manager = self.clone();
        let domain = domain.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(ACME_TOTAL_TIMEOUT, manager.issue(&domain)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(host = %domain, error = %e, "Certificate issuance failed"),
                Err(_) => warn!(host = %domain, "Certificate issuance timed out"),
            }
            manager.pending.lock().remove(&domain);
        });
    }

    /// Background renewal loop: re-issue certificates expiring soon.
    pub(crate) fn spawn_renewal(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEWAL_INTERVAL).await;
                let domains: Vec<String> = manager.certs.read().keys().cloned().collect();
                for domain in domains {
                    if manager.needs_renewal(&domain) {
                        info!(host = %domain, "Certificate expiring soon, renewing");
                        manager.request_issuance(&domain);
                    }
                }
            }
        })
    }

    fn needs_renewal(&self, domain: &str) -> bool {
        let meta_path = self.cache_dir.join(format!("{domain}.json"));
        let meta = std::fs::read_to_string(&meta_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<CertMetadata>(&raw).ok());
        match meta {
            Some(meta) => meta.expires_at - Utc::now() < chrono::Duration::days(RENEW_BEFORE_DAYS),
            None => {
                warn!(host = %domain, "No certificate metadata, scheduling renewal");
                true
            }
        }
    }

    /// Run one complete HTTP-01 order for `domain`.
    async fn issue(&self, domain: &str) -> Result<()> {
        info!(host = %domain, directory = %self.directory_url, "Obtaining certificate via ACME");
        let account = self.account().await?;

        let identifiers = vec![Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(acme_err)?;

        let authorizations = order.authorizations().await.map_err(acme_err)?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {
                    let challenge = authz
                        .challenges
                        .iter()
                        .find(|c| c.r#type == ChallengeType::Http01)
                        .ok_or_else(|| {
                            ProxyError::Acme("no HTTP-01 challenge offered".to_string())
                        })?;
                    let key_auth = order.key_authorization(challenge);
                    self.challenges.put(&challenge.token, key_auth.as_str()).await;
                    order
                        .set_challenge_ready(&challenge.url)
                        .await
                        .map_err(acme_err)?;
                    let ready = self.wait_for_order(&mut order, 10).await;
                    self.challenges.remove(&challenge.token).await;
                    ready?;
                }
                AuthorizationStatus::Valid => {
                    debug!(host = %domain, "Authorization already valid");
                }
                status => {
                    return Err(ProxyError::Acme(format!(
                        "unexpected authorization status: {status:?}"
                    )));
                }
            }
        }

        let mut params = CertificateParams::new(vec![domain.to_string()]).map_err(acme_err)?;
        params.distinguished_name = DistinguishedName::new();
        let key_pair = KeyPair::generate().map_err(acme_err)?;
        let csr = params.serialize_request(&key_pair).map_err(acme_err)?;

        order.finalize(csr.der()).await.map_err(acme_err)?;
        self.wait_for_order(&mut order, 10).await?;

        let chain = order
            .certificate()
            .await
            .map_err(acme_err)?
            .ok_or_else(|| ProxyError::Acme("no certificate returned".to_string()))?;

        self.store(domain, &chain, &key_pair.serialize_pem())?;
        info!(host = %domain, "Certificate obtained");
        Ok(())
    }

    async fn wait_for_order(&self, order: &mut Order, max_attempts: u32) -> Result<()> {
        for attempt in 0..max_attempts {
            tokio::time::sleep(Duration::from_secs(2)).await;
            order.refresh().await.map_err(acme_err)?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(ProxyError::Acme("order became invalid".to_string()))
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    debug!(attempt = attempt + 1, "Waiting for ACME order");
                }
            }
        }
        Err(ProxyError::Acme("order did not become ready in time".to_string()))
    }

    /// Load or create the ACME account, persisting its credentials.
    async fn account(&self) -> Result<Account> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let credentials_path = self.cache_dir.join("account.json");
        if let Ok(raw) = std::fs::read_to_string(&credentials_path) {
            if let Ok(credentials) = serde_json::from_str::<AccountCredentials>(&raw) {
                match Account::from_credentials(credentials).await {
                    Ok(account) => {
                        debug!("Reusing stored ACME account");
                        *guard = Some(account.clone());
                        return Ok(account);
                    }
                    Err(e) => {
                        warn!(error = %e, "Stored ACME account unusable, creating a new one")
                    }
                }
            }
        }

        info!(directory = %self.directory_url, "Creating ACME account");
        let contact: Vec<String> = self.contact.iter().map(|c| format!("mailto:{c}")).collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(acme_err)?;

        match serde_json::to_string_pretty(&credentials) {
            Ok(serialized) => {
                if let Err(e) = std::fs::write(&credentials_path, serialized) {
                    warn!(error = %e, "Failed to persist ACME account credentials");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize ACME account credentials"),
        }

        *guard = Some(account.clone());
        Ok(account)
    }

    /// Persist a fresh certificate and install it in the resolver.
    fn store(&self, domain: &str, chain_pem: &str, key_pem: &str) -> Result<()> {
        let cert_path = self.cache_dir.join(format!("{domain}.crt"));
        let key_path = self.cache_dir.join(format!("{domain}.key"));
        std::fs::write(&cert_path, chain_pem)?;
        std::fs::write(&key_path, key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600));
        }

        let metadata = CertMetadata {
            domain: domain.to_string(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(90),
        };
        match serde_json::to_string_pretty(&metadata) {
            Ok(serialized) => {
                let meta_path = self.cache_dir.join(format!("{domain}.json"));
                if let Err(e) = std::fs::write(meta_path, serialized) {
                    warn!(host = %domain, error = %e, "Failed to write certificate metadata");
                }
            }
            Err(e) => warn!(host = %domain, error = %e, "Failed to serialize certificate metadata"),
        }

        let certified = load_certified_key(chain_pem, key_pem)?;
        self.install(domain, certified);
        Ok(())
    }

    fn install(&self, domain: &str, key: Arc<CertifiedKey>) {
        self.certs.write().insert(domain.to_string(), key.clone());
        let mut default = self.default_cert.write();
        if default.is_none() {
            *default = Some(key);
        }
    }

    /// Load every PEM pair already present in the cache directory.
    fn load_cached(&self) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            let Some(domain) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            let key_path = path.with_extension("key");
            if !key_path.exists() {
                warn!(host = %domain, "Cached certificate has no private key");
                continue;
            }
            let cert_pem = std::fs::read_to_string(&path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            match load_certified_key(&cert_pem, &key_pem) {
                Ok(key) => {
                    self.install(&domain, key);
                    loaded += 1;
                    debug!(host = %domain, "Loaded certificate from cache");
                }
                Err(e) => warn!(host = %domain, error = %e, "Failed to parse cached certificate"),
            }
        }
        Ok(loaded)
    }
}

/// Resolves certificates during TLS handshakes by SNI.
///
/// A cache miss refuses the present handshake and triggers a background
/// issuance; the client's retry succeeds once the order completes.
pub(crate) struct CertResolver {
    manager: Arc<CertManager>,
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver")
            .field("domains", &self.manager.certs.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(sni) => {
                if let Some(key) = self.manager.certified(sni) {
                    return Some(key);
                }
                self.manager.request_issuance(sni);
                None
            }
            None => self.manager.default_certified(),
        }
    }
}

fn ensure_cache_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|e| ProxyError::Config(format!("failed to create cert cache {path:?}: {e}")))
}

fn load_certified_key(cert_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
        .collect::<std::result::Result<Vec<CertificateDer>, _>>()
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .ok_or_else(|| ProxyError::Tls("no private key found".to_string()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn acme_err<E: fmt::Display>(e: E) -> ProxyError {
    ProxyError::Acme(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_manager(dir: &Path) -> CertManager {
        CertManager::new(
            HostPolicy::custom(|_| true),
            dir.to_path_buf(),
            Some("ops@example.com".to_string()),
            LETS_ENCRYPT_STAGING.to_string(),
        )
        .unwrap()
    }

    fn self_signed(domain: &str) -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    #[tokio::test]
    async fn test_challenge_store() {
        let store = ChallengeStore::new();
        store.put("test-token", "test-auth").await;
        assert_eq!(
            store.get("test-token").await,
            Some("test-auth".to_string())
        );
        store.remove("test-token").await;
        assert_eq!(store.get("test-token").await, None);
    }

    #[test]
    fn test_cache_dir_is_created() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("certs");
        let _ = test_manager(&cache);
        assert!(cache.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&cache).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_store_and_reload() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        let (cert_pem, key_pem) = self_signed("example.com");
        manager.store("example.com", &cert_pem, &key_pem).unwrap();

        assert!(manager.certified("example.com").is_some());
        assert!(manager.default_certified().is_some());
        assert!(dir.path().join("example.com.crt").exists());
        assert!(dir.path().join("example.com.key").exists());

        // a fresh manager picks the pair up from disk
        let reloaded = test_manager(dir.path());
        assert!(reloaded.certified("example.com").is_some());
    }

    #[test]
    fn test_needs_renewal() {
        let dir = tempdir().unwrap();
        let manager = test_manager(dir.path());
        let (cert_pem, key_pem) = self_signed("fresh.example");
        manager.store("fresh.example", &cert_pem, &key_pem).unwrap();
        assert!(!manager.needs_renewal("fresh.example"));

        let expiring = CertMetadata {
            domain: "old.example".to_string(),
            issued_at: Utc::now() - chrono::Duration::days(80),
            expires_at: Utc::now() + chrono::Duration::days(10),
        };
        std::fs::write(
            dir.path().join("old.example.json"),
            serde_json::to_string(&expiring).unwrap(),
        )
        .unwrap();
        assert!(manager.needs_renewal("old.example"));
        // no metadata at all also schedules a renewal
        assert!(manager.needs_renewal("unknown.example"));
    }

    #[tokio::test]
    async fn test_forbidden_host_is_not_issued() {
        let dir = tempdir().unwrap();
        let manager = Arc::new(
            CertManager::new(
                HostPolicy::allowed_hosts(["allowed.example"]),
                dir.path().to_path_buf(),
                None,
                LETS_ENCRYPT_STAGING.to_string(),
            )
            .unwrap(),
        );
        manager.request_issuance("forbidden.example");
        assert!(!manager.pending.lock().contains("forbidden.example"));
    }
}
