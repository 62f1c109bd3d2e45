//! konform kubehub: the resource-store client trait and its backends.

#![forbid(unsafe_code)]

pub mod client;
pub mod kubestore;
pub mod memory;

use anyhow::{Context, Result};
use konform_core::Gvk;
use kube::{
    discovery::{Discovery, Scope},
    Client,
};

pub use client::{KindInfo, StoreClient, WatchEvent, WatchStream};
pub use kubestore::KubeStore;
pub use memory::{MemoryStore, Op};

/// Client for the current kube context.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from the current context")
}

/// Every kind the API server serves (CRDs included), in its preferred version.
pub async fn discover(client: Client) -> Result<Vec<(Gvk, KindInfo)>> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            out.push((Gvk::new(ar.group, ar.version, ar.kind), KindInfo { namespaced }));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
