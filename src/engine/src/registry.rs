//! Registry transport used by the engine.
//!
//! Wraps the `oci-distribution` client behind the narrow surface the
//! planners and executor need: resolve a tag to a digest, pull manifests
//! and blobs, push blobs and manifests. Errors are folded into the
//! engine's taxonomy here so retry classification never has to inspect
//! transport types.

use base64::Engine as _;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use sha2::{Digest, Sha256};

use airlift_core::{ImageReference, MirrorError, Result};

/// Manifest media types accepted on pull, image and list forms both.
const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous access (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Parse a docker-config-style pull secret and extract credentials
    /// for the given registry. Falls back to anonymous when the registry
    /// has no entry.
    pub fn from_pull_secret(secret: &str, registry: &str) -> Result<Self> {
        #[derive(serde::Deserialize)]
        struct DockerConfig {
            auths: std::collections::HashMap<String, AuthEntry>,
        }
        #[derive(serde::Deserialize)]
        struct AuthEntry {
            #[serde(default)]
            auth: Option<String>,
            #[serde(default)]
            username: Option<String>,
            #[serde(default)]
            password: Option<String>,
        }

        let cfg: DockerConfig = serde_json::from_str(secret)?;
        let Some(entry) = cfg.auths.get(registry) else {
            return Ok(Self::anonymous());
        };
        if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
            return Ok(Self::basic(user, pass));
        }
        if let Some(auth) = &entry.auth {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(auth)
                .map_err(|e| MirrorError::Serialization(format!("pull secret auth field: {e}")))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| MirrorError::Serialization(format!("pull secret auth field: {e}")))?;
            if let Some((user, pass)) = decoded.split_once(':') {
                return Ok(Self::basic(user, pass));
            }
        }
        Ok(Self::anonymous())
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Pulled manifest bytes together with the digest they hash to.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub body: Vec<u8>,
    pub digest: String,
}

impl RawManifest {
    /// True when the manifest body declares a manifest-list media type or
    /// carries a `manifests` array.
    pub fn is_list(&self) -> bool {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .map(|v| {
                v.get("manifests").is_some()
                    || v.get("mediaType")
                        .and_then(|m| m.as_str())
                        .map(|m| m.contains(".list.") || m.contains("image.index"))
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Media type to use when re-pushing this manifest.
    pub fn media_type(&self) -> String {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| {
                v.get("mediaType")
                    .and_then(|m| m.as_str())
                    .map(|m| m.to_string())
            })
            .unwrap_or_else(|| MANIFEST_MEDIA_TYPES[0].to_string())
    }
}

/// Compute the canonical `sha256:` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Registry client scoped to one run.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new(skip_tls: bool) -> Self {
        Self::with_auth(skip_tls, RegistryAuth::anonymous())
    }

    pub fn with_auth(skip_tls: bool, auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            accept_invalid_certificates: skip_tls,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
        }
    }

    /// Resolve a reference to its manifest digest.
    pub async fn resolve(&self, reference: &ImageReference) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        self.client
            .fetch_manifest_digest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| classify(reference, e))
    }

    /// Pull raw manifest bytes, preserving them exactly for digest
    /// stability across the file layout and the destination push.
    pub async fn pull_manifest(&self, reference: &ImageReference) -> Result<RawManifest> {
        let oci_ref = to_oci_reference(reference)?;
        let (body, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &self.auth.to_oci_auth(), MANIFEST_MEDIA_TYPES)
            .await
            .map_err(|e| classify(reference, e))?;
        Ok(RawManifest { body, digest })
    }

    /// Pull one blob by digest.
    pub async fn pull_blob(&self, reference: &ImageReference, digest: &str) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference)?;
        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };
        let mut data = Vec::new();
        self.client
            .pull_blob(&oci_ref, &descriptor, &mut data)
            .await
            .map_err(|e| classify(reference, e))?;
        Ok(data)
    }

    /// Push one blob; returns its digest.
    pub async fn push_blob(&self, reference: &ImageReference, data: &[u8]) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let digest = sha256_digest(data);
        self.client
            .push_blob(&oci_ref, data, &digest)
            .await
            .map_err(|e| classify(reference, e))?;
        Ok(digest)
    }

    /// Push raw manifest bytes under the reference's tag or digest.
    pub async fn push_manifest(
        &self,
        reference: &ImageReference,
        body: Vec<u8>,
        media_type: &str,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let digest = sha256_digest(&body);
        let content_type = media_type
            .parse()
            .map_err(|_| MirrorError::Serialization(format!("bad media type {media_type}")))?;
        self.client
            .push_manifest_raw(&oci_ref, body, content_type)
            .await
            .map_err(|e| classify(reference, e))?;
        Ok(digest)
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let s = reference.exact();
    s.parse::<Reference>().map_err(|e| MirrorError::Reference {
        reference: s,
        message: e.to_string(),
    })
}

// Fold transport errors into the engine taxonomy. Classification is on
// the rendered message so it holds across client versions; the executor's
// retry logic only ever looks at the resulting error kind.
fn classify(reference: &ImageReference, err: oci_distribution::errors::OciDistributionError) -> MirrorError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    let exact = reference.exact();

    if lower.contains("unauthorized") || lower.contains("denied") || lower.contains("401") {
        return MirrorError::Auth(exact);
    }
    if lower.contains("manifest unknown") || lower.contains("manifest_unknown") {
        return MirrorError::ManifestUnknown(exact);
    }
    if lower.contains("not found") || lower.contains("404") {
        return MirrorError::ManifestUnknown(exact);
    }
    if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("dns error")
    {
        return MirrorError::Transient(format!("{exact}: {msg}"));
    }
    let status = ["500", "502", "503", "504"]
        .iter()
        .find(|code| lower.contains(**code))
        .and_then(|code| code.parse().ok());
    MirrorError::Registry {
        reference: exact,
        status,
        message: msg,
    }
}
