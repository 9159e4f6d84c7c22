//! Pod ownership for resources created by the uploader
//!
//! Every object the pipeline creates (token secret, export) is owned by the
//! pod running the uploader. When that pod is deleted the garbage collector
//! reclaims them, so the pipeline never cleans up after itself.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use disk_uploader_common::{Error, Result, POD_NAMESPACE_ENV, POD_NAME_ENV};

use crate::client::ClusterClient;

/// Name and namespace of the pod running the uploader
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodIdentity {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
}

impl PodIdentity {
    /// Create an identity from explicit values
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Read `POD_NAME` and `POD_NAMESPACE` from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the identity through an arbitrary variable lookup
    ///
    /// Unset and empty variables are both rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::environment(key))
        };
        Ok(Self {
            name: required(POD_NAME_ENV)?,
            namespace: required(POD_NAMESPACE_ENV)?,
        })
    }
}

/// The resolved owner pod: identity plus the UID owner references need
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerPod {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod UID
    pub uid: String,
}

impl OwnerPod {
    /// Owner reference pointing at this pod
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: <Pod as k8s_openapi::Resource>::API_VERSION.to_string(),
            kind: <Pod as k8s_openapi::Resource>::KIND.to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: None,
            block_owner_deletion: None,
        }
    }
}

/// Resolves the owner pod once per run and stamps owner references
pub struct OwnershipResolver {
    client: Arc<dyn ClusterClient>,
    identity: PodIdentity,
    resolved: OnceCell<OwnerPod>,
}

impl OwnershipResolver {
    /// Create a resolver for the given pod identity
    pub fn new(client: Arc<dyn ClusterClient>, identity: PodIdentity) -> Self {
        Self {
            client,
            identity,
            resolved: OnceCell::new(),
        }
    }

    /// Fetch the owner pod from the cluster
    ///
    /// The first successful lookup is cached; a failed lookup is not, so a
    /// later call fetches again.
    pub async fn resolve_owner_pod(&self) -> Result<&OwnerPod> {
        self.resolved
            .get_or_try_init(|| async {
                let PodIdentity { name, namespace } = &self.identity;
                let pod = self
                    .client
                    .get_pod(namespace, name)
                    .await
                    .map_err(|e| Error::lookup(namespace, name, e.to_string()))?;

                let uid = pod
                    .metadata
                    .uid
                    .clone()
                    .filter(|uid| !uid.is_empty())
                    .ok_or_else(|| Error::lookup(namespace, name, "pod has no uid"))?;

                info!(pod = %name, namespace = %namespace, uid = %uid, "Resolved owner pod");
                Ok(OwnerPod {
                    name: pod.metadata.name.clone().unwrap_or_else(|| name.clone()),
                    namespace: pod
                        .metadata
                        .namespace
                        .clone()
                        .unwrap_or_else(|| namespace.clone()),
                    uid,
                })
            })
            .await
    }

    /// Resolve the owner pod and attach it to `object`
    pub async fn set_pod_owner_reference<K>(&self, object: &mut K) -> Result<()>
    where
        K: Resource<DynamicType = ()>,
    {
        let owner = self.resolve_owner_pod().await?;
        attach_owner_reference(object, owner)
    }
}

/// Replace the owner references of `object` with a single reference to `pod`
///
/// Owner references cannot cross namespaces, so the object must live in the
/// pod's namespace.
pub fn attach_owner_reference<K>(object: &mut K, pod: &OwnerPod) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    let object_namespace = object.meta().namespace.clone().unwrap_or_default();
    if object_namespace != pod.namespace {
        return Err(Error::CrossNamespace {
            object_namespace,
            owner_namespace: pod.namespace.clone(),
        });
    }

    debug!(
        kind = %K::kind(&()),
        object = ?object.meta().name,
        pod = %pod.name,
        "Attaching pod owner reference"
    );
    object.meta_mut().owner_references = Some(vec![pod.owner_reference()]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::testing::{api_error, pod, NAMESPACE, POD_NAME, POD_UID};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::HashMap;

    fn owner(namespace: &str) -> OwnerPod {
        OwnerPod {
            name: POD_NAME.to_string(),
            namespace: namespace.to_string(),
            uid: POD_UID.to_string(),
        }
    }

    fn secret_in(namespace: Option<&str>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("vm1".to_string()),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn identity_from_lookup() {
        let env: HashMap<&str, &str> =
            [(POD_NAME_ENV, "uploader-1"), (POD_NAMESPACE_ENV, "vms")].into();
        let identity = PodIdentity::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(identity, PodIdentity::new("uploader-1", "vms"));
    }

    #[test]
    fn identity_requires_both_variables() {
        let only_name: HashMap<&str, &str> = [(POD_NAME_ENV, "uploader-1")].into();
        let err = PodIdentity::from_lookup(|k| only_name.get(k).map(|v| v.to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Environment { ref variable } if variable == POD_NAMESPACE_ENV));

        let err = PodIdentity::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, Error::Environment { ref variable } if variable == POD_NAME_ENV));
    }

    #[test]
    fn identity_rejects_empty_values() {
        let env: HashMap<&str, &str> = [(POD_NAME_ENV, ""), (POD_NAMESPACE_ENV, "vms")].into();
        let err = PodIdentity::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(err, Error::Environment { .. }));
    }

    #[test]
    fn attach_sets_single_pod_reference() {
        let mut secret = secret_in(Some(NAMESPACE));
        secret.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "kubevirt.io/v1".to_string(),
            kind: "VirtualMachine".to_string(),
            name: "vm1".to_string(),
            uid: "stale".to_string(),
            ..Default::default()
        }]);

        attach_owner_reference(&mut secret, &owner(NAMESPACE)).unwrap();

        let refs = secret.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].api_version, "v1");
        assert_eq!(refs[0].kind, "Pod");
        assert_eq!(refs[0].name, POD_NAME);
        assert_eq!(refs[0].uid, POD_UID);
    }

    #[test]
    fn attach_across_namespaces_fails() {
        let mut secret = secret_in(Some("other"));
        let err = attach_owner_reference(&mut secret, &owner(NAMESPACE)).unwrap_err();
        match err {
            Error::CrossNamespace {
                object_namespace,
                owner_namespace,
            } => {
                assert_eq!(object_namespace, "other");
                assert_eq!(owner_namespace, NAMESPACE);
            }
            other => panic!("expected CrossNamespace, got {:?}", other),
        }
        assert!(secret.metadata.owner_references.is_none());
    }

    #[test]
    fn attach_to_object_without_namespace_fails() {
        let mut secret = secret_in(None);
        let err = attach_owner_reference(&mut secret, &owner(NAMESPACE)).unwrap_err();
        assert!(matches!(err, Error::CrossNamespace { .. }));
    }

    #[tokio::test]
    async fn resolve_fetches_pod_once() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_pod().times(1).returning(|ns, name| {
            assert_eq!(ns, NAMESPACE);
            assert_eq!(name, POD_NAME);
            Ok(pod(ns))
        });

        let resolver = OwnershipResolver::new(Arc::new(mock), PodIdentity::new(POD_NAME, NAMESPACE));
        let first = resolver.resolve_owner_pod().await.unwrap().clone();
        let second = resolver.resolve_owner_pod().await.unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(first.uid, POD_UID);
    }

    #[tokio::test]
    async fn resolve_maps_get_failure_to_lookup() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_pod()
            .returning(|_, _| Err(api_error(404, "NotFound")));

        let resolver = OwnershipResolver::new(Arc::new(mock), PodIdentity::new(POD_NAME, NAMESPACE));
        let err = resolver.resolve_owner_pod().await.unwrap_err();
        match err {
            Error::Lookup { namespace, name, .. } => {
                assert_eq!(namespace, NAMESPACE);
                assert_eq!(name, POD_NAME);
            }
            other => panic!("expected Lookup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn resolve_rejects_pod_without_uid() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_pod().returning(|ns, _| {
            let mut p = pod(ns);
            p.metadata.uid = None;
            Ok(p)
        });

        let resolver = OwnershipResolver::new(Arc::new(mock), PodIdentity::new(POD_NAME, NAMESPACE));
        assert!(matches!(
            resolver.resolve_owner_pod().await,
            Err(Error::Lookup { .. })
        ));
    }

    #[tokio::test]
    async fn set_owner_reference_resolves_then_attaches() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_pod().returning(|ns, _| Ok(pod(ns)));

        let resolver = OwnershipResolver::new(Arc::new(mock), PodIdentity::new(POD_NAME, NAMESPACE));
        let mut secret = secret_in(Some(NAMESPACE));
        resolver.set_pod_owner_reference(&mut secret).await.unwrap();
        assert_eq!(
            secret.metadata.owner_references.as_ref().map(|r| r[0].uid.as_str()),
            Some(POD_UID)
        );
    }
}
