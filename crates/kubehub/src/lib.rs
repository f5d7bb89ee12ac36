//! podmeter kubehub: the orchestrator-facing collaborators of the metering
//! engine. Enumerates running workloads per namespace and discovers the
//! per-user namespaces to poll.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{api::{Api, ListParams}, Client};
use podmeter_core::UserId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => WorkloadPhase::Pending,
            "Running" => WorkloadPhase::Running,
            "Succeeded" => WorkloadPhase::Succeeded,
            "Failed" => WorkloadPhase::Failed,
            _ => WorkloadPhase::Unknown,
        }
    }
}

/// A workload as reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub id: String,
    pub creation_time: DateTime<Utc>,
    pub phase: WorkloadPhase,
}

/// Lists the workloads of one namespace.
#[async_trait::async_trait]
pub trait WorkloadLister: Send + Sync {
    async fn list_workloads(&self, namespace: &str) -> Result<Vec<WorkloadInfo>>;

    /// Workloads currently in the `Running` phase.
    async fn list_running_workloads(&self, namespace: &str) -> Result<Vec<WorkloadInfo>> {
        let all = self.list_workloads(namespace).await?;
        Ok(all.into_iter().filter(|w| w.phase == WorkloadPhase::Running).collect())
    }
}

/// Enumerates `(user_id, namespace)` pairs whose workloads are metered.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_namespaces(&self) -> Result<Vec<(UserId, String)>>;
}

/// Convert a pod into a workload entry. Pods without a name or creation
/// timestamp cannot be metered and are skipped.
pub fn workload_from_pod(pod: &Pod) -> Option<WorkloadInfo> {
    let id = pod.metadata.name.clone()?;
    let creation_time = pod.metadata.creation_timestamp.as_ref()?.0;
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(WorkloadPhase::parse)
        .unwrap_or(WorkloadPhase::Unknown);
    Some(WorkloadInfo { id, creation_time, phase })
}

/// Pod lister backed by the Kubernetes API.
pub struct KubeWorkloads {
    client: Client,
}

impl KubeWorkloads {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }
}

#[async_trait::async_trait]
impl WorkloadLister for KubeWorkloads {
    async fn list_workloads(&self, namespace: &str) -> Result<Vec<WorkloadInfo>> {
        let started = std::time::Instant::now();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing pods in namespace {}", namespace))?;
        let out: Vec<WorkloadInfo> = list.items.iter().filter_map(workload_from_pod).collect();
        metrics::histogram!("kube_list_pods_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(ns = %namespace, pods = list.items.len(), kept = out.len(), "pods listed");
        Ok(out)
    }
}

/// Matches per-user namespace names (`<prefix><digits>`).
#[derive(Debug, Clone)]
pub struct NamespaceConvention {
    re: Regex,
    prefix: String,
}

impl NamespaceConvention {
    pub fn new(prefix: &str) -> Result<Self> {
        let re = Regex::new(&format!("^{}([0-9]+)$", regex::escape(prefix)))
            .map_err(|e| anyhow!("invalid namespace prefix {:?}: {}", prefix, e))?;
        Ok(Self { re, prefix: prefix.to_string() })
    }

    pub fn user_of(&self, namespace: &str) -> Option<UserId> {
        self.re.captures(namespace)?.get(1)?.as_str().parse().ok()
    }

    pub fn namespace_of(&self, user: UserId) -> String { format!("{}{}", self.prefix, user) }
}

/// Discovers users from the cluster's namespaces under the naming convention.
pub struct KubeUserDirectory {
    client: Client,
    convention: NamespaceConvention,
}

impl KubeUserDirectory {
    pub fn new(client: Client, convention: NamespaceConvention) -> Self { Self { client, convention } }
}

#[async_trait::async_trait]
impl UserDirectory for KubeUserDirectory {
    async fn user_namespaces(&self) -> Result<Vec<(UserId, String)>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.context("listing namespaces")?;
        let mut out: Vec<(UserId, String)> = list
            .items
            .iter()
            .filter_map(|ns| ns.metadata.name.as_deref())
            .filter_map(|name| self.convention.user_of(name).map(|u| (u, name.to_string())))
            .collect();
        out.sort();
        out.dedup();
        info!(users = out.len(), "user namespaces discovered");
        Ok(out)
    }
}

/// Fixed user → namespace mapping.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Vec<(UserId, String)>,
}

impl StaticDirectory {
    pub fn new(entries: Vec<(UserId, String)>) -> Self { Self { entries } }

    /// Build from user ids using the namespace convention.
    pub fn for_users(users: &[UserId], convention: &NamespaceConvention) -> Self {
        Self::new(users.iter().map(|u| (*u, convention.namespace_of(*u))).collect())
    }
}

#[async_trait::async_trait]
impl UserDirectory for StaticDirectory {
    async fn user_namespaces(&self) -> Result<Vec<(UserId, String)>> { Ok(self.entries.clone()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, created: &str, phase: Option<&str>) -> Pod {
        let mut v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "ns-1", "creationTimestamp": created },
        });
        if let Some(p) = phase {
            v["status"] = serde_json::json!({ "phase": p });
        }
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn pod_conversion_reads_phase_and_creation() {
        let w = workload_from_pod(&pod("dev-a", "2024-01-02T03:04:05Z", Some("Running"))).unwrap();
        assert_eq!(w.id, "dev-a");
        assert_eq!(w.phase, WorkloadPhase::Running);
        assert_eq!(w.creation_time.to_rfc3339(), "2024-01-02T03:04:05+00:00");

        let w = workload_from_pod(&pod("dev-b", "2024-01-02T03:04:05Z", None)).unwrap();
        assert_eq!(w.phase, WorkloadPhase::Unknown);
    }

    #[test]
    fn namespace_convention_round_trips_user_ids() {
        let c = NamespaceConvention::new("ns-").unwrap();
        assert_eq!(c.user_of("ns-42"), Some(42));
        assert_eq!(c.user_of("ns-"), None);
        assert_eq!(c.user_of("ns-4x"), None);
        assert_eq!(c.user_of("kube-system"), None);
        assert_eq!(c.namespace_of(42), "ns-42");

        let dotted = NamespaceConvention::new("dev.").unwrap();
        assert_eq!(dotted.user_of("devx7"), None);
        assert_eq!(dotted.user_of("dev.7"), Some(7));
    }

    struct Fixed(Vec<WorkloadInfo>);

    #[async_trait::async_trait]
    impl WorkloadLister for Fixed {
        async fn list_workloads(&self, _namespace: &str) -> Result<Vec<WorkloadInfo>> { Ok(self.0.clone()) }
    }

    #[tokio::test]
    async fn running_filter_drops_other_phases() {
        let t = Utc::now();
        let l = Fixed(vec![
            WorkloadInfo { id: "a".into(), creation_time: t, phase: WorkloadPhase::Running },
            WorkloadInfo { id: "b".into(), creation_time: t, phase: WorkloadPhase::Pending },
            WorkloadInfo { id: "c".into(), creation_time: t, phase: WorkloadPhase::Succeeded },
        ]);
        let running = l.list_running_workloads("ns-1").await.unwrap();
        assert_eq!(running.iter().map(|w| w.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn static_directory_uses_convention() {
        let c = NamespaceConvention::new("ns-").unwrap();
        let d = StaticDirectory::for_users(&[3, 1], &c);
        assert_eq!(d.user_namespaces().await.unwrap(), vec![(3, "ns-3".to_string()), (1, "ns-1".to_string())]);
    }
}
