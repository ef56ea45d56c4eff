//! kache kubehub: an `ObjectSource` over the Kubernetes API for one kind.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use futures::StreamExt;
use kache_core::{ListPage, ObjectKey, ObjectSource, Resource, ResourceVersion, SourceError, WatchEvent, WatchStream};
use kube::{
    api::{Api, ListParams, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind, WatchEvent as KubeEvent},
    discovery::{Discovery, Scope},
    Client, Config,
};
use metrics::counter;
use tracing::{debug, info, warn};

const DEFAULT_PAGE_SIZE: u32 = 500;
/// Server-side watch timeout; the reflector reconnects when the stream ends.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Build a client from an explicit kubeconfig, or from the default chain (in-cluster, then
/// `$KUBECONFIG` / `~/.kube/config`).
pub async fn client_from(kubeconfig: Option<PathBuf>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(&path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("loading kubeconfig {}", path.display()))?;
            Client::try_from(config).context("building kube client")
        }
        None => Client::try_default().await.context("inferring kube client config"),
    }
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, SourceError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(SourceError::Config(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), SourceError> {
    let discovery = Discovery::new(client).run().await.map_err(|e| classify(&e))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(SourceError::Config(format!("GVK not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

/// Map a kube error onto the informer's failure classes.
pub fn classify(e: &kube::Error) -> SourceError {
    match e {
        kube::Error::Api(resp) => classify_status(resp),
        kube::Error::Auth(e) => SourceError::Auth(e.to_string()),
        kube::Error::SerdeError(e) => SourceError::Malformed(e.to_string()),
        other => SourceError::Transient(other.to_string()),
    }
}

fn classify_status(resp: &ErrorResponse) -> SourceError {
    let msg = format!("{} ({}): {}", resp.code, resp.reason, resp.message);
    match resp.code {
        410 => SourceError::Expired(msg),
        401 | 403 => SourceError::Auth(msg),
        404 => SourceError::Config(msg),
        _ => SourceError::Transient(msg),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_resource(obj: &DynamicObject) -> Result<Resource, SourceError> {
    let meta = &obj.metadata;
    let name = meta.name.as_deref().ok_or_else(|| SourceError::Malformed("object missing metadata.name".into()))?;
    let version = meta
        .resource_version
        .as_deref()
        .ok_or_else(|| SourceError::Malformed(format!("{} missing metadata.resourceVersion", name)))
        .and_then(ResourceVersion::parse)?;
    let mut payload = serde_json::to_value(obj).map_err(|e| SourceError::Malformed(e.to_string()))?;
    strip_managed_fields(&mut payload);
    Ok(Resource::new(ObjectKey::new(meta.namespace.as_deref(), name), version, payload))
}

fn convert_event(item: Result<KubeEvent<DynamicObject>, kube::Error>) -> Result<WatchEvent, SourceError> {
    match item {
        Ok(KubeEvent::Added(o)) => to_resource(&o).map(WatchEvent::Added),
        Ok(KubeEvent::Modified(o)) => to_resource(&o).map(WatchEvent::Modified),
        Ok(KubeEvent::Deleted(o)) => to_resource(&o).map(WatchEvent::Deleted),
        Ok(KubeEvent::Bookmark(b)) => ResourceVersion::parse(&b.metadata.resource_version).map(WatchEvent::Bookmark),
        Ok(KubeEvent::Error(resp)) => Ok(WatchEvent::Error(classify_status(&resp))),
        Err(e) => Err(classify(&e)),
    }
}

/// Lists and watches one kind, optionally within one namespace.
#[derive(Clone)]
pub struct KubeSource {
    api: Api<DynamicObject>,
    gvk_key: String,
    page_size: u32,
}

impl KubeSource {
    /// Resolve `gvk_key` through discovery and scope the API to `namespace` when the kind is
    /// namespaced.
    pub async fn new(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self, SourceError> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match namespace {
            Some(ns) if namespaced => Api::namespaced_with(client, ns, &ar),
            Some(ns) => {
                warn!(gvk = %gvk_key, ns = %ns, "kind is cluster-scoped; ignoring namespace");
                Api::all_with(client, &ar)
            }
            None => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, plural = %ar.plural, "kube source ready");
        Ok(Self::from_api(api, gvk_key))
    }

    pub fn from_api(api: Api<DynamicObject>, gvk_key: impl Into<String>) -> Self {
        Self { api, gvk_key: gvk_key.into(), page_size: DEFAULT_PAGE_SIZE }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn gvk_key(&self) -> &str { &self.gvk_key }
}

#[async_trait::async_trait]
impl ObjectSource for KubeSource {
    async fn list(&self) -> Result<ListPage, SourceError> {
        counter!("kache_kube_requests_total", 1, "op" => "list");
        let mut items = Vec::new();
        let mut version = None;
        let mut skipped = 0usize;
        let mut pages = 0usize;
        let mut lp = ListParams::default().limit(self.page_size);
        loop {
            let page = self.api.list(&lp).await.map_err(|e| classify(&e))?;
            pages += 1;
            // Continuation pages share the first page's snapshot version.
            if version.is_none() {
                version = page.metadata.resource_version.as_deref().map(ResourceVersion::parse).transpose()?;
            }
            for obj in &page.items {
                match to_resource(obj) {
                    Ok(r) => items.push(r),
                    Err(e) => {
                        skipped += 1;
                        counter!("kache_malformed_events_total", 1);
                        warn!(gvk = %self.gvk_key, error = %e, "skipping malformed listed object");
                    }
                }
            }
            match page.metadata.continue_.as_deref() {
                Some(token) if !token.is_empty() => lp = lp.continue_token(token),
                _ => break,
            }
        }
        let version = version.or_else(|| items.iter().map(|r| r.version).max()).unwrap_or_default();
        debug!(gvk = %self.gvk_key, count = items.len(), pages, skipped, %version, "kube list");
        Ok(ListPage { items, version })
    }

    async fn watch(&self, from: ResourceVersion) -> Result<WatchStream, SourceError> {
        counter!("kache_kube_requests_total", 1, "op" => "watch");
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self.api.watch(&wp, &from.to_string()).await.map_err(|e| classify(&e))?;
        debug!(gvk = %self.gvk_key, %from, "kube watch opened");
        Ok(stream.map(convert_event).boxed())
    }
}
