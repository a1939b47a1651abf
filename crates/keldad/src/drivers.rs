//! Driver registry for the cloud reconcilers.
//!
//! The provider SDK integrations (EC2, GCE, DigitalOcean, Vagrant) build
//! against `kelda_cloud::Provider` out of tree and register here. A build
//! without a driver keeps the rest of the control plane running; the
//! partition logs until its driver is linked.

use std::sync::Arc;

use kelda_cloud::{Provider, ProviderFactory};
use kelda_db::ProviderName;

pub struct Registry;

impl ProviderFactory for Registry {
    fn provider(
        &self,
        name: ProviderName,
        region: &str,
        _namespace: &str,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        anyhow::bail!("no {name} driver linked into this build (region {region})")
    }
}
