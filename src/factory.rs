use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, Pod, PodSpec,
    ResourceRequirements, SeccompProfile, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use kube_runtime::wait::{Condition, await_condition};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::languages::{self, LanguageConfig};
use crate::pool::{PodHandle, PodProvider, PodStatus};
use crate::sidecar::SidecarClient;

/* ============================= CONSTANTS ============================= */

const SIDECAR_CONTAINER: &str = "sidecar";
const RUNTIME_CONTAINER: &str = "runtime";
const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/mnt/data";

const LABEL_MANAGED: &str = "codepod.io/managed";
const LABEL_TYPE: &str = "codepod.io/type";
const LABEL_LANGUAGE: &str = "codepod.io/language";
const LABEL_SESSION: &str = "codepod.io/session-id";
const LABEL_ISOLATED: &str = "codepod.io/network-isolated";
const ANNOTATION_CREATED_AT: &str = "codepod.io/created-at";

/* ============================= FACTORY ============================= */

/// Builds, creates, readiness-gates, and deletes execution pods.
pub struct PodFactory {
    client: Client,
    settings: Arc<Settings>,
    sidecar: SidecarClient,
}

impl PodFactory {
    pub fn new(client: Client, settings: Arc<Settings>) -> Self {
        let sidecar = SidecarClient::new(settings.sidecar_port);
        Self { client, settings, sidecar }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    /* ── MANIFEST ── */

    /// Two containers in one pod: the sidecar HTTP server that receives
    /// code, and the language runtime it executes into. They share the
    /// workspace volume and the process namespace.
    pub fn build_manifest(
        settings: &Settings,
        lang: &LanguageConfig,
        pod_name: &str,
        session_id: Option<&str>,
    ) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(
            LABEL_TYPE.to_string(),
            if session_id.is_some() { "execution" } else { "pool" }.to_string(),
        );
        labels.insert(LABEL_LANGUAGE.to_string(), lang.code.to_string());
        if settings.network_isolated {
            // Selected by the cluster's deny-all NetworkPolicy: no
            // inter-pod traffic, no metadata endpoints, no private ranges
            labels.insert(LABEL_ISOLATED.to_string(), "true".to_string());
        }
        if let Some(session) = session_id {
            labels.insert(LABEL_SESSION.to_string(), session.to_string());
        }

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_CREATED_AT.to_string(), Utc::now().to_rfc3339());

        let seccomp = SeccompProfile {
            type_: settings.seccomp_profile.as_str().to_string(),
            ..Default::default()
        };

        let security_context = |user_id: i64| SecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(user_id),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            seccomp_profile: Some(seccomp.clone()),
            ..Default::default()
        };

        let workspace_mount = VolumeMount {
            name: WORKSPACE_VOLUME.to_string(),
            mount_path: WORKSPACE_PATH.to_string(),
            ..Default::default()
        };

        let mut sidecar_env = vec![
            env_var("LANGUAGE", lang.code),
            env_var("EXECUTION_COMMAND", lang.execution_command),
            env_var("USES_STDIN", if lang.uses_stdin { "true" } else { "false" }),
            env_var("WORKING_DIR", WORKSPACE_PATH),
        ];
        if settings.network_isolated {
            for (key, value) in lang.isolated_env {
                sidecar_env.push(env_var(key, value));
            }
        }

        let sidecar = Container {
            name: SIDECAR_CONTAINER.to_string(),
            image: Some(settings.sidecar_image.clone()),
            ports: Some(vec![ContainerPort {
                container_port: settings.sidecar_port as i32,
                name: Some("http".to_string()),
                ..Default::default()
            }]),
            env: Some(sidecar_env),
            // User code runs under the sidecar's limits
            resources: Some(resource_requirements(
                &settings.sidecar_cpu_limit,
                &settings.sidecar_memory_limit,
                &settings.cpu_request,
                &settings.memory_request,
            )),
            security_context: Some(security_context(lang.user_id)),
            volume_mounts: Some(vec![workspace_mount.clone()]),
            ..Default::default()
        };

        let memory_limit = format!(
            "{}Mi",
            (settings.max_memory_mb as f64 * lang.memory_multiplier).ceil() as u64
        );
        let runtime = Container {
            name: RUNTIME_CONTAINER.to_string(),
            image: Some(languages::image_for(
                lang,
                &settings.image_registry,
                &settings.image_tag,
            )),
            image_pull_policy: Some(settings.image_pull_policy.clone()),
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            resources: Some(resource_requirements(
                &settings.cpu_limit,
                &memory_limit,
                &settings.cpu_request,
                &settings.memory_request,
            )),
            security_context: Some(security_context(lang.user_id)),
            volume_mounts: Some(vec![workspace_mount]),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                namespace: Some(settings.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![sidecar, runtime],
                restart_policy: Some("Never".to_string()),
                // The sidecar reaches the runtime container through the
                // shared process namespace
                share_process_namespace: Some(true),
                automount_service_account_token: Some(false),
                enable_service_links: Some(false),
                volumes: Some(vec![Volume {
                    name: WORKSPACE_VOLUME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    /* ── CREATE / WAIT ── */

    async fn create_pod(&self, language: &str, session_id: Option<&str>) -> Result<PodHandle> {
        let lang = languages::get_language(language)
            .ok_or_else(|| anyhow!("Unsupported language: {language}"))?;

        let pod_name = format!("codepod-{}-{}", lang.code, &Uuid::new_v4().simple().to_string()[..8]);
        let manifest = Self::build_manifest(&self.settings, lang, &pod_name, session_id);

        debug!(pod = %pod_name, language = %lang.code, "pod_creating");
        self.pods()
            .create(&PostParams::default(), &manifest)
            .await
            .context("Failed to create pod")?;

        match self.wait_ready(&pod_name).await {
            Ok(pod) => {
                let handle = PodHandle {
                    uid: pod.metadata.uid.clone().unwrap_or_else(|| pod_name.clone()),
                    name: pod_name.clone(),
                    namespace: self.settings.namespace.clone(),
                    language: lang.code.to_string(),
                    pod_ip: pod
                        .status
                        .as_ref()
                        .and_then(|s| s.pod_ip.clone())
                        .unwrap_or_default(),
                    status: PodStatus::Warm,
                    created_at: Utc::now(),
                    session_id: session_id.map(str::to_string),
                    health_check_failures: 0,
                };
                info!(pod = %pod_name, ip = %handle.pod_ip, "pod_ready");
                Ok(handle)
            }
            Err(e) => {
                // Never leave a half-started pod behind
                let _ = self.delete_by_name(&pod_name).await;
                Err(e)
            }
        }
    }

    /// Wait for the sidecar container to report ready with a pod IP
    /// assigned, bounded by the configured readiness timeout.
    async fn wait_ready(&self, pod_name: &str) -> Result<Pod> {
        let ready = await_condition(self.pods(), pod_name, sidecar_ready());
        let result = tokio::time::timeout(self.settings.pod_ready_timeout, ready)
            .await
            .map_err(|_| {
                anyhow!(
                    "Pod {} not ready within {}s",
                    pod_name,
                    self.settings.pod_ready_timeout.as_secs()
                )
            })?;
        result
            .context("Watch failed while waiting for pod readiness")?
            .ok_or_else(|| anyhow!("Pod {} disappeared while starting", pod_name))
    }

    async fn delete_by_name(&self, pod_name: &str) -> Result<()> {
        match self.pods().delete(pod_name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already gone is success
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "pod_delete_error");
                Err(e.into())
            }
        }
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn resource_requirements(
    cpu_limit: &str,
    memory_limit: &str,
    cpu_request: &str,
    memory_request: &str,
) -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(cpu_limit.to_string()));
    limits.insert("memory".to_string(), Quantity(memory_limit.to_string()));

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(cpu_request.to_string()));
    requests.insert("memory".to_string(), Quantity(memory_request.to_string()));

    ResourceRequirements {
        limits: Some(limits),
        requests: Some(requests),
        ..Default::default()
    }
}

/// Ready means: running phase, pod IP assigned, sidecar container ready.
fn sidecar_ready() -> impl Condition<Pod> {
    |pod: Option<&Pod>| {
        let Some(status) = pod.and_then(|p| p.status.as_ref()) else {
            return false;
        };
        if status.pod_ip.as_deref().unwrap_or("").is_empty() {
            return false;
        }
        status
            .container_statuses
            .as_ref()
            .is_some_and(|statuses| {
                statuses
                    .iter()
                    .any(|cs| cs.name == SIDECAR_CONTAINER && cs.ready)
            })
    }
}

/* ============================= PROVIDER IMPL ============================= */

#[async_trait]
impl PodProvider for PodFactory {
    async fn create(&self, language: &str, session_id: Option<&str>) -> Result<PodHandle> {
        self.create_pod(language, session_id).await
    }

    async fn delete(&self, handle: &PodHandle) -> Result<()> {
        self.delete_by_name(&handle.name).await
    }

    async fn probe(&self, handle: &PodHandle) -> bool {
        self.sidecar.health(&handle.pod_ip).await
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus as K8sPodStatus};

    fn settings() -> Settings {
        Settings::default()
    }

    fn manifest_for(lang: &str, session: Option<&str>) -> Pod {
        let lang = languages::get_language(lang).unwrap();
        PodFactory::build_manifest(&settings(), lang, "codepod-test-1", session)
    }

    fn containers(pod: &Pod) -> &Vec<Container> {
        &pod.spec.as_ref().unwrap().containers
    }

    // ── structure ──

    #[test]
    fn test_manifest_has_sidecar_and_runtime() {
        let pod = manifest_for("py", None);
        let names: Vec<&str> = containers(&pod).iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec![SIDECAR_CONTAINER, RUNTIME_CONTAINER]);
    }

    #[test]
    fn test_manifest_shares_process_namespace_and_workspace() {
        let pod = manifest_for("py", None);
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.share_process_namespace, Some(true));
        for c in containers(&pod) {
            let mounts = c.volume_mounts.as_ref().unwrap();
            assert!(mounts.iter().any(|m| m.mount_path == WORKSPACE_PATH));
        }
    }

    #[test]
    fn test_runtime_image_from_registry() {
        let pod = manifest_for("py", None);
        let runtime = &containers(&pod)[1];
        assert_eq!(runtime.image.as_deref(), Some("codepod-python:latest"));
    }

    #[test]
    fn test_no_service_account_token() {
        let pod = manifest_for("py", None);
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.automount_service_account_token, Some(false));
    }

    // ── security ──

    #[test]
    fn test_security_context_non_root_no_caps() {
        let pod = manifest_for("py", None);
        for c in containers(&pod) {
            let sc = c.security_context.as_ref().unwrap();
            assert_eq!(sc.run_as_non_root, Some(true));
            assert_eq!(sc.run_as_user, Some(65532));
            assert_eq!(sc.allow_privilege_escalation, Some(false));
            assert_eq!(
                sc.capabilities.as_ref().unwrap().drop,
                Some(vec!["ALL".to_string()])
            );
            assert_eq!(
                sc.seccomp_profile.as_ref().unwrap().type_,
                "RuntimeDefault"
            );
        }
    }

    #[test]
    fn test_unconfined_seccomp_flows_through() {
        let mut s = settings();
        s.seccomp_profile = crate::config::SeccompProfile::Unconfined;
        let lang = languages::get_language("py").unwrap();
        let pod = PodFactory::build_manifest(&s, lang, "p", None);
        let sc = containers(&pod)[0].security_context.as_ref().unwrap();
        assert_eq!(sc.seccomp_profile.as_ref().unwrap().type_, "Unconfined");
    }

    // ── labels ──

    #[test]
    fn test_pool_pod_labels() {
        let pod = manifest_for("py", None);
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_MANAGED).map(String::as_str), Some("true"));
        assert_eq!(labels.get(LABEL_TYPE).map(String::as_str), Some("pool"));
        assert_eq!(labels.get(LABEL_LANGUAGE).map(String::as_str), Some("py"));
        assert!(!labels.contains_key(LABEL_SESSION));
        assert!(
            pod.metadata
                .annotations
                .as_ref()
                .unwrap()
                .contains_key(ANNOTATION_CREATED_AT)
        );
    }

    #[test]
    fn test_execution_pod_carries_session_label() {
        let pod = manifest_for("py", Some("sess-42"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_TYPE).map(String::as_str), Some("execution"));
        assert_eq!(labels.get(LABEL_SESSION).map(String::as_str), Some("sess-42"));
    }

    // ── resources ──

    #[test]
    fn test_memory_multiplier_applied_to_runtime() {
        // Java multiplies the 512 MB base by 1.5
        let pod = manifest_for("java", None);
        let runtime = &containers(&pod)[1];
        let limits = runtime.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get("memory").unwrap().0, "768Mi");
    }

    #[test]
    fn test_sidecar_uses_sidecar_limits() {
        let pod = manifest_for("py", None);
        let sidecar = &containers(&pod)[0];
        let limits = sidecar.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get("cpu").unwrap().0, "500m");
        assert_eq!(limits.get("memory").unwrap().0, "512Mi");
    }

    // ── environment ──

    #[test]
    fn test_go_gets_module_proxy_off_when_isolated() {
        let pod = manifest_for("go", None);
        let env = containers(&pod)[0].env.as_ref().unwrap();
        let find = |name: &str| env.iter().find(|e| e.name == name).and_then(|e| e.value.as_deref());
        assert_eq!(find("GOPROXY"), Some("off"));
        assert_eq!(find("GOSUMDB"), Some("off"));
    }

    #[test]
    fn test_go_proxy_untouched_without_isolation() {
        let mut s = settings();
        s.network_isolated = false;
        let lang = languages::get_language("go").unwrap();
        let pod = PodFactory::build_manifest(&s, lang, "p", None);
        let env = containers(&pod)[0].env.as_ref().unwrap();
        assert!(!env.iter().any(|e| e.name == "GOPROXY"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert!(!labels.contains_key(LABEL_ISOLATED));
    }

    #[test]
    fn test_isolated_pods_carry_policy_label() {
        let pod = manifest_for("py", None);
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_ISOLATED).map(String::as_str), Some("true"));
    }

    #[test]
    fn test_sidecar_env_describes_language() {
        let pod = manifest_for("rs", None);
        let env = containers(&pod)[0].env.as_ref().unwrap();
        let find = |name: &str| env.iter().find(|e| e.name == name).and_then(|e| e.value.as_deref());
        assert_eq!(find("LANGUAGE"), Some("rs"));
        assert_eq!(find("EXECUTION_COMMAND"), Some("rustc code.rs -o code && ./code"));
        assert_eq!(find("USES_STDIN"), Some("false"));
    }

    // ── readiness condition ──

    fn pod_with_status(ip: Option<&str>, sidecar_ready_flag: bool) -> Pod {
        Pod {
            metadata: ObjectMeta::default(),
            spec: None,
            status: Some(K8sPodStatus {
                pod_ip: ip.map(str::to_string),
                container_statuses: Some(vec![ContainerStatus {
                    name: SIDECAR_CONTAINER.to_string(),
                    ready: sidecar_ready_flag,
                    image: String::new(),
                    image_id: String::new(),
                    restart_count: 0,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_ready_requires_ip_and_sidecar() {
        let cond = sidecar_ready();
        assert!(cond.matches_object(Some(&pod_with_status(Some("10.0.0.1"), true))));
        assert!(!cond.matches_object(Some(&pod_with_status(None, true))));
        assert!(!cond.matches_object(Some(&pod_with_status(Some(""), true))));
        assert!(!cond.matches_object(Some(&pod_with_status(Some("10.0.0.1"), false))));
        assert!(!cond.matches_object(None));
    }
}
