//! The container runtime contract and the caching wrapper around it.
//!
//! The supervisor only sees this trait; the real client wraps the local
//! Docker daemon, tests use a recording fake. Successful pulls are cached
//! per `repo:tag` for a minute so a busy reconcile loop doesn't hammer the
//! registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use kelda_counter::Counter;

/// How long a successful pull satisfies later pulls of the same image.
const PULL_CACHE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DockerError {
    /// The distinguished sentinel for operations on a missing container;
    /// callers may absorb it.
    #[error("container does not exist")]
    NoSuchContainer,

    #[error("docker: {0}")]
    Api(String),
}

/// A bind mount into an infrastructure container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    /// Propagate mounts created inside the target back to the host.
    pub shared: bool,
}

/// Everything needed to start one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub filepath_to_content: BTreeMap<String, String>,
    pub network_mode: String,
    pub pid_mode: String,
    pub privileged: bool,
    pub volumes_from: Vec<String>,
    pub mounts: Vec<Mount>,
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningContainer {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
}

/// The operations the supervisor needs from the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), DockerError>;
    /// Create and start a container; returns its runtime id.
    async fn run(&self, opts: RunOptions) -> Result<String, DockerError>;
    async fn remove(&self, name: &str) -> Result<(), DockerError>;
    async fn running(&self) -> Result<Vec<RunningContainer>, DockerError>;
}

/// Wraps a runtime with the pull cache.
pub struct CachingRuntime<R> {
    inner: R,
    cache_timeout: Duration,
    pulled: Mutex<HashMap<String, Instant>>,
    counter: Counter,
}

impl<R: ContainerRuntime> CachingRuntime<R> {
    pub fn new(inner: R) -> CachingRuntime<R> {
        Self::with_timeout(inner, PULL_CACHE_TIMEOUT)
    }

    pub fn with_timeout(inner: R, cache_timeout: Duration) -> CachingRuntime<R> {
        CachingRuntime {
            inner,
            cache_timeout,
            pulled: Mutex::new(HashMap::new()),
            counter: Counter::new("Docker"),
        }
    }
}

/// The cache key: the image with an explicit tag.
fn repo_tag(image: &str) -> String {
    // A colon after the last slash means the tag is already explicit.
    let after_slash = image.rsplit('/').next().unwrap_or(image);
    if after_slash.contains(':') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

#[async_trait]
impl<R: ContainerRuntime> ContainerRuntime for CachingRuntime<R> {
    async fn pull(&self, image: &str) -> Result<(), DockerError> {
        let key = repo_tag(image);
        {
            let pulled = self.pulled.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(at) = pulled.get(&key) {
                if at.elapsed() < self.cache_timeout {
                    return Ok(());
                }
            }
        }
        self.counter.inc("Pull");
        self.inner.pull(image).await?;
        self.pulled
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, Instant::now());
        Ok(())
    }

    async fn run(&self, opts: RunOptions) -> Result<String, DockerError> {
        self.counter.inc("Run");
        self.inner.run(opts).await
    }

    async fn remove(&self, name: &str) -> Result<(), DockerError> {
        self.counter.inc("Remove");
        self.inner.remove(name).await
    }

    async fn running(&self) -> Result<Vec<RunningContainer>, DockerError> {
        self.inner.running().await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Arc;

    /// A recording in-memory runtime for supervisor tests.
    #[derive(Default)]
    pub struct FakeState {
        pub containers: Vec<RunningContainer>,
        pub pulls: Vec<String>,
        pub removes: Vec<String>,
        pub runs: Vec<RunOptions>,
    }

    #[derive(Clone, Default)]
    pub struct FakeRuntime {
        pub state: Arc<Mutex<FakeState>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn pull(&self, image: &str) -> Result<(), DockerError> {
            self.state.lock().unwrap().pulls.push(image.to_string());
            Ok(())
        }

        async fn run(&self, opts: RunOptions) -> Result<String, DockerError> {
            let mut state = self.state.lock().unwrap();
            state.containers.push(RunningContainer {
                name: opts.name.clone(),
                image: opts.image.clone(),
                args: opts.args.clone(),
            });
            state.runs.push(opts);
            Ok(format!("cid-{}", state.runs.len()))
        }

        async fn remove(&self, name: &str) -> Result<(), DockerError> {
            let mut state = self.state.lock().unwrap();
            let before = state.containers.len();
            state.containers.retain(|c| c.name != name);
            state.removes.push(name.to_string());
            if state.containers.len() == before {
                return Err(DockerError::NoSuchContainer);
            }
            Ok(())
        }

        async fn running(&self) -> Result<Vec<RunningContainer>, DockerError> {
            Ok(self.state.lock().unwrap().containers.clone())
        }
    }
}
