use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

use kubeport_types::ContextInfo;

/// Namespace used when neither the caller nor the kubeconfig context names one
const DEFAULT_NAMESPACE: &str = "default";

/// Kubeconfig wrapper that hands out cluster clients
pub struct KubeClient {
    kubeconfig: Kubeconfig,
    current_context: Option<String>,
}

impl KubeClient {
    /// Create a new KubeClient by loading the kubeconfig
    pub fn new() -> Result<Self> {
        let kubeconfig =
            Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?;

        Ok(Self::from_kubeconfig(kubeconfig))
    }

    /// Wrap an already loaded kubeconfig
    pub fn from_kubeconfig(kubeconfig: Kubeconfig) -> Self {
        let current_context = kubeconfig.current_context.clone();

        Self {
            kubeconfig,
            current_context,
        }
    }

    /// Get all available contexts from kubeconfig
    pub fn get_contexts(&self) -> Vec<ContextInfo> {
        self.kubeconfig
            .contexts
            .iter()
            .map(|ctx| {
                let context = ctx.context.as_ref();
                ContextInfo::new(
                    ctx.name.clone(),
                    context.map(|c| c.cluster.clone()).unwrap_or_default(),
                    context.and_then(|c| c.user.clone()).unwrap_or_default(),
                    context.and_then(|c| c.namespace.clone()),
                    Some(&ctx.name) == self.current_context.as_ref(),
                )
            })
            .collect()
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Create a kube::Client for a specific context
    pub async fn client_for_context(&self, context_name: &str) -> Result<kube::Client> {
        let config = kube::Config::from_custom_kubeconfig(
            self.kubeconfig.clone(),
            &KubeConfigOptions {
                context: Some(context_name.to_string()),
                ..Default::default()
            },
        )
        .await
        .context(format!(
            "Failed to create config for context: {}",
            context_name
        ))?;

        kube::Client::try_from(config).context(format!(
            "Failed to create client for context: {}",
            context_name
        ))
    }

    /// Connect to a cluster and scope the client to one namespace.
    ///
    /// Falls back to the current context, then to the context's own namespace,
    /// then to `default`.
    pub async fn connect(
        &self,
        context: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<ClusterClient> {
        let context_name = context
            .or(self.current_context())
            .context("No context given and kubeconfig has no current-context")?;

        if !self.kubeconfig.contexts.iter().any(|c| c.name == context_name) {
            anyhow::bail!("Context '{}' not found in kubeconfig", context_name);
        }

        let client = self.client_for_context(context_name).await?;

        let namespace = namespace
            .map(str::to_string)
            .or_else(|| self.context_namespace(context_name))
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        debug!(context = context_name, namespace = %namespace, "connected to cluster");

        Ok(ClusterClient::new(client, namespace))
    }

    /// Namespace pinned by a kubeconfig context, if any
    fn context_namespace(&self, context_name: &str) -> Option<String> {
        self.kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .and_then(|c| c.context.as_ref())
            .and_then(|c| c.namespace.clone())
    }
}

/// A kube::Client bound to the namespace every operation runs in
#[derive(Clone)]
pub struct ClusterClient {
    pub(crate) client: kube::Client,
    pub(crate) namespace: String,
}

impl ClusterClient {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }
}
