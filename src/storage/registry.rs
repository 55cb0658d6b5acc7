//! Registry HTTP API v2 client
//!
//! Only the calls a repo stages storage needs: list tags, read one image's
//! metadata, delete a tag. Authentication is an anonymous bearer token
//! negotiated from the registry's `WWW-Authenticate` challenge, or a
//! pre-issued token taken from the environment.
//!
//! ureq is blocking; every request runs on the blocking thread pool.

use crate::config::schema::RegistryConfig;
use crate::error::{StagehouseError, StagehouseResult};
use crate::stage::ImageInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use ureq::http::Response;
use ureq::{Agent, Body};

const DOCKER_HUB_HOST: &str = "docker.io";
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

const TAGS_PAGE_SIZE: u32 = 1000;

/// Registry operations used by the repo stages storage
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// All tags of `repository`; a repository that does not exist has none
    async fn list_tags(&self, repository: &str) -> StagehouseResult<Vec<String>>;

    /// Metadata of `repository:tag`, `None` when the tag does not exist
    async fn image_info(&self, repository: &str, tag: &str)
        -> StagehouseResult<Option<ImageInfo>>;

    /// Delete the manifest `repository:tag` points to; missing tags are skipped
    async fn delete_tag(&self, repository: &str, tag: &str) -> StagehouseResult<()>;
}

/// A repository split into registry host and path
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RepositoryRef {
    pub host: String,
    pub path: String,
}

impl RepositoryRef {
    pub fn parse(repository: &str) -> Self {
        match repository.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                Self {
                    host: first.to_string(),
                    path: rest.to_string(),
                }
            }
            Some(_) => Self {
                host: DOCKER_HUB_HOST.to_string(),
                path: repository.to_string(),
            },
            None => Self {
                host: DOCKER_HUB_HOST.to_string(),
                path: format!("library/{}", repository),
            },
        }
    }

    fn api_host(&self) -> &str {
        if self.host == DOCKER_HUB_HOST {
            DOCKER_HUB_API_HOST
        } else {
            &self.host
        }
    }
}

/// Parsed `WWW-Authenticate` header
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Challenge {
    pub scheme: String,
    pub params: HashMap<String, String>,
}

/// Parse `Bearer realm="...",service="...",scope="..."`
pub(crate) fn parse_challenge(header: &str) -> Challenge {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
    let mut params = HashMap::new();

    let mut chars = rest.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value);
    }

    Challenge {
        scheme: scheme.to_string(),
        params,
    }
}

/// Path of the `rel="next"` target in a `Link` header
pub(crate) fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.replace(' ', "").contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        Some(target.to_string())
    })
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Descriptor {
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Manifest {
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ImageConfig {
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: Option<ContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

/// Assemble image metadata from a manifest and its config blob
pub(crate) fn image_info_from(
    repository: &str,
    tag: &str,
    digest: String,
    manifest: &Manifest,
    config: ImageConfig,
) -> ImageInfo {
    let mut info = ImageInfo::new(repository, tag);
    info.id = digest;
    info.size = manifest.config.as_ref().map_or(0, |c| c.size)
        + manifest.layers.iter().map(|l| l.size).sum::<u64>();
    if let Some(created) = config.created {
        info.created_at = created;
    }
    info.labels = config
        .config
        .and_then(|c| c.labels)
        .unwrap_or_default();
    info
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Head,
    Delete,
}

struct Transport {
    agent: Agent,
    insecure: Vec<String>,
    static_token: Option<String>,
    tokens: Mutex<HashMap<String, String>>,
}

fn registry_error(url: &str, reason: impl ToString) -> StagehouseError {
    StagehouseError::Registry {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

fn header<'a>(resp: &'a Response<Body>, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

fn read_body(url: &str, resp: &mut Response<Body>) -> StagehouseResult<String> {
    resp.body_mut()
        .read_to_string()
        .map_err(|e| registry_error(url, e))
}

fn status_error(url: &str, resp: &mut Response<Body>) -> StagehouseError {
    let status = resp.status().as_u16();
    let body = resp.body_mut().read_to_string().unwrap_or_default();
    let body: String = body.trim().chars().take(200).collect();
    if body.is_empty() {
        registry_error(url, format!("HTTP {}", status))
    } else {
        registry_error(url, format!("HTTP {}: {}", status, body))
    }
}

impl Transport {
    fn base_url(&self, repo: &RepositoryRef) -> String {
        let scheme = if self.insecure.iter().any(|h| h == &repo.host) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, repo.api_host())
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        token: Option<&str>,
    ) -> StagehouseResult<Response<Body>> {
        let mut req = match method {
            Method::Get => self.agent.get(url),
            Method::Head => self.agent.head(url),
            Method::Delete => self.agent.delete(url),
        };
        if let Some(accept) = accept {
            req = req.header("Accept", accept);
        }
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req.call().map_err(|e| registry_error(url, e))
    }

    /// Send a request, negotiating a bearer token on 401
    fn send(
        &self,
        repo: &RepositoryRef,
        method: Method,
        url: &str,
        accept: Option<&str>,
    ) -> StagehouseResult<Response<Body>> {
        let key = format!("{}/{}", repo.host, repo.path);
        let cached = match &self.static_token {
            Some(token) => Some(token.clone()),
            None => self
                .tokens
                .lock()
                .map_err(|_| StagehouseError::Internal("registry token cache poisoned".into()))?
                .get(&key)
                .cloned(),
        };

        let resp = self.request(method, url, accept, cached.as_deref())?;
        if resp.status().as_u16() != 401 || self.static_token.is_some() {
            return Ok(resp);
        }

        let Some(challenge) = header(&resp, "www-authenticate").map(parse_challenge) else {
            return Ok(resp);
        };
        if !challenge.scheme.eq_ignore_ascii_case("bearer") {
            return Ok(resp);
        }

        let token = self.fetch_token(&challenge)?;
        self.tokens
            .lock()
            .map_err(|_| StagehouseError::Internal("registry token cache poisoned".into()))?
            .insert(key, token.clone());
        self.request(method, url, accept, Some(&token))
    }

    fn fetch_token(&self, challenge: &Challenge) -> StagehouseResult<String> {
        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| registry_error("token", "bearer challenge without realm"))?;
        debug!("Requesting registry token from {}", realm);

        let mut req = self.agent.get(realm);
        if let Some(service) = challenge.params.get("service") {
            req = req.query("service", service);
        }
        if let Some(scope) = challenge.params.get("scope") {
            req = req.query("scope", scope);
        }

        let mut resp = req.call().map_err(|e| registry_error(realm, e))?;
        if !resp.status().is_success() {
            return Err(status_error(realm, &mut resp));
        }
        let body = read_body(realm, &mut resp)?;
        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| registry_error(realm, e))?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| registry_error(realm, "token response without token"))
    }

    fn list_tags(&self, repository: &str) -> StagehouseResult<Vec<String>> {
        let repo = RepositoryRef::parse(repository);
        let base = self.base_url(&repo);
        let mut url = format!("{}/v2/{}/tags/list?n={}", base, repo.path, TAGS_PAGE_SIZE);
        let mut tags = Vec::new();

        loop {
            let mut resp = self.send(&repo, Method::Get, &url, None)?;
            match resp.status().as_u16() {
                200 => {}
                404 => return Ok(tags),
                _ => return Err(status_error(&url, &mut resp)),
            }

            let next = header(&resp, "link").and_then(next_link);
            let body = read_body(&url, &mut resp)?;
            let page: TagList = serde_json::from_str(&body).map_err(|e| registry_error(&url, e))?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) if next.starts_with("http") => url = next,
                Some(next) => url = format!("{}{}", base, next),
                None => return Ok(tags),
            }
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        repo: &RepositoryRef,
        url: &str,
        accept: Option<&str>,
    ) -> StagehouseResult<Option<(Option<String>, T)>> {
        let mut resp = self.send(repo, Method::Get, url, accept)?;
        match resp.status().as_u16() {
            200 => {}
            404 => return Ok(None),
            _ => return Err(status_error(url, &mut resp)),
        }
        let digest = header(&resp, "docker-content-digest").map(str::to_string);
        let body = read_body(url, &mut resp)?;
        let digest = digest.or_else(|| Some(content_digest(body.as_bytes())));
        let value = serde_json::from_str(&body).map_err(|e| registry_error(url, e))?;
        Ok(Some((digest, value)))
    }

    fn image_info(&self, repository: &str, tag: &str) -> StagehouseResult<Option<ImageInfo>> {
        let repo = RepositoryRef::parse(repository);
        let base = self.base_url(&repo);
        let url = format!("{}/v2/{}/manifests/{}", base, repo.path, tag);

        let Some((digest, mut manifest)) =
            self.get_json::<Manifest>(&repo, &url, Some(MANIFEST_ACCEPT))?
        else {
            return Ok(None);
        };

        // Image index: describe the first platform manifest
        if manifest.config.is_none() {
            if let Some(first) = manifest.manifests.first() {
                let url = format!("{}/v2/{}/manifests/{}", base, repo.path, first.digest);
                match self.get_json::<Manifest>(&repo, &url, Some(MANIFEST_ACCEPT))? {
                    Some((_, platform)) => manifest = platform,
                    None => return Ok(None),
                }
            }
        }

        let config = match &manifest.config {
            Some(descriptor) => {
                let url = format!("{}/v2/{}/blobs/{}", base, repo.path, descriptor.digest);
                self.get_json::<ImageConfig>(&repo, &url, None)?
                    .map(|(_, config)| config)
                    .unwrap_or_default()
            }
            None => ImageConfig::default(),
        };

        Ok(Some(image_info_from(
            repository,
            tag,
            digest.unwrap_or_default(),
            &manifest,
            config,
        )))
    }

    fn delete_tag(&self, repository: &str, tag: &str) -> StagehouseResult<()> {
        let repo = RepositoryRef::parse(repository);
        let base = self.base_url(&repo);
        let url = format!("{}/v2/{}/manifests/{}", base, repo.path, tag);

        let mut resp = self.send(&repo, Method::Head, &url, Some(MANIFEST_ACCEPT))?;
        let digest = match resp.status().as_u16() {
            200 => header(&resp, "docker-content-digest").map(str::to_string),
            404 => return Ok(()),
            _ => return Err(status_error(&url, &mut resp)),
        };
        let digest = match digest {
            Some(digest) => digest,
            None => match self.get_json::<serde_json::Value>(&repo, &url, Some(MANIFEST_ACCEPT))? {
                Some((Some(digest), _)) => digest,
                _ => return Ok(()),
            },
        };

        let url = format!("{}/v2/{}/manifests/{}", base, repo.path, digest);
        debug!("Deleting manifest {}", url);
        let mut resp = self.send(&repo, Method::Delete, &url, None)?;
        match resp.status().as_u16() {
            200 | 202 | 404 => Ok(()),
            405 => Err(registry_error(&url, "manifest deletion is disabled on this registry")),
            _ => Err(status_error(&url, &mut resp)),
        }
    }
}

fn content_digest(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(body)))
}

/// Registry client over ureq
#[derive(Clone)]
pub struct RegistryClient {
    transport: Arc<Transport>,
}

impl RegistryClient {
    /// Create a client from `[registry]` settings
    pub fn new(config: &RegistryConfig) -> Self {
        let agent_config = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .http_status_as_error(false)
            .build();
        let static_token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());

        Self {
            transport: Arc::new(Transport {
                agent: Agent::new_with_config(agent_config),
                insecure: config.insecure.clone(),
                static_token,
                tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> StagehouseResult<T>
    where
        F: FnOnce(&Transport) -> StagehouseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || f(&transport))
            .await
            .map_err(|e| StagehouseError::Internal(format!("registry task failed: {}", e)))?
    }
}

#[async_trait]
impl RegistryApi for RegistryClient {
    async fn list_tags(&self, repository: &str) -> StagehouseResult<Vec<String>> {
        let repository = repository.to_string();
        self.blocking(move |t| t.list_tags(&repository)).await
    }

    async fn image_info(
        &self,
        repository: &str,
        tag: &str,
    ) -> StagehouseResult<Option<ImageInfo>> {
        let (repository, tag) = (repository.to_string(), tag.to_string());
        self.blocking(move |t| t.image_info(&repository, &tag)).await
    }

    async fn delete_tag(&self, repository: &str, tag: &str) -> StagehouseResult<()> {
        let (repository, tag) = (repository.to_string(), tag.to_string());
        self.blocking(move |t| t.delete_tag(&repository, &tag)).await
    }
}
