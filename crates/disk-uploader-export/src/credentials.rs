//! Export token generation and the token secret
//!
//! The export server only serves requests carrying the token stored in the
//! secret named by `spec.tokenSecretRef`. The uploader generates that token,
//! stores it before creating the export and reads it back once the export is
//! Ready.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

use disk_uploader_common::{Error, Result, EXPORT_TOKEN_KEY, FIELD_MANAGER};

use crate::client::ClusterClient;
use crate::owner::OwnershipResolver;

/// Length of generated export tokens
pub const TOKEN_LENGTH: usize = 20;

/// Alphabet export tokens are drawn from
const ALPHANUMS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Random bytes at or above this value are discarded; 248 = 4 * 62 keeps
/// `byte % 62` uniform over the alphabet.
const ACCEPT_BELOW: u8 = (256 - 256 % ALPHANUMS.len()) as u8;

/// Generate a random alphanumeric string from the operating system RNG
///
/// Each character is drawn independently and uniformly from
/// `[0-9A-Za-z]` by rejection sampling over random bytes.
pub fn generate_secure_random_string(len: usize) -> std::result::Result<String, rand::Error> {
    let mut token = String::with_capacity(len);
    let mut buf = [0u8; 32];

    while token.len() < len {
        OsRng.try_fill_bytes(&mut buf)?;
        for byte in buf.iter().copied().filter(|b| *b < ACCEPT_BELOW) {
            token.push(ALPHANUMS[byte as usize % ALPHANUMS.len()] as char);
            if token.len() == len {
                break;
            }
        }
    }

    Ok(token)
}

/// Build the token secret for an export
pub fn build_export_secret(namespace: &str, name: &str, token: &str) -> Secret {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );

    let mut string_data = BTreeMap::new();
    string_data.insert(EXPORT_TOKEN_KEY.to_string(), token.to_string());

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// Extract the export token from a secret read back from the cluster
fn token_from_secret(secret: &Secret) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(EXPORT_TOKEN_KEY))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
        .filter(|token| !token.is_empty())
}

/// Creates and reads back the export token secret
pub struct CredentialProvisioner {
    client: Arc<dyn ClusterClient>,
    owners: Arc<OwnershipResolver>,
}

impl CredentialProvisioner {
    /// Create a provisioner using the given client and owner resolver
    pub fn new(client: Arc<dyn ClusterClient>, owners: Arc<OwnershipResolver>) -> Self {
        Self { client, owners }
    }

    /// Generate a token and store it in a new secret owned by the uploader pod
    ///
    /// Every failure (RNG, owner lookup, create rejected) is reported as a
    /// credential error for this secret.
    pub async fn create_export_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let token = generate_secure_random_string(TOKEN_LENGTH).map_err(|e| {
            Error::credential(namespace, name, format!("failed to generate token: {}", e))
        })?;

        let mut secret = build_export_secret(namespace, name, &token);
        self.owners
            .set_pod_owner_reference(&mut secret)
            .await
            .map_err(|e| {
                Error::credential(namespace, name, format!("failed to set owner: {}", e))
            })?;

        self.client.create_secret(&secret).await.map_err(|e| {
            let err = Error::Create {
                kind: "Secret".to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
                source: e,
            };
            if err.is_already_exists() {
                warn!(namespace = %namespace, name = %name, "Export token secret already exists");
                Error::credential(
                    namespace,
                    name,
                    format!("secret already exists from an earlier run: {}", err),
                )
            } else {
                Error::credential(namespace, name, format!("failed to create secret: {}", err))
            }
        })?;

        info!(namespace = %namespace, name = %name, "Created export token secret");
        Ok(())
    }

    /// Read the export token back from its secret
    pub async fn get_export_token(&self, namespace: &str, name: &str) -> Result<String> {
        let secret = self.client.get_secret(namespace, name).await.map_err(|e| {
            Error::credential(namespace, name, format!("failed to get secret: {}", e))
        })?;

        token_from_secret(&secret).ok_or_else(|| {
            Error::credential(
                namespace,
                name,
                format!("secret has no {} field", EXPORT_TOKEN_KEY),
            )
        })
    }
}
