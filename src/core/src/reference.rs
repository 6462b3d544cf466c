//! Image reference parsing.
//!
//! Parses references like `docker://registry.example.com/ns/app:v1` into
//! structured components. A reference that carries a digest is "pinned":
//! its content cannot change underneath us between planning and transfer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither tag nor digest is specified.
const DEFAULT_TAG: &str = "latest";

/// Reference transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// A remote registry (`docker://`)
    #[default]
    Docker,
    /// An on-disk file layout rooted at the workspace (`file://`)
    File,
    /// An OCI image layout directory (`oci://`)
    OciLayout,
}

impl Transport {
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Docker => "docker",
            Transport::File => "file",
            Transport::OciLayout => "oci",
        }
    }
}

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ImageReference {
    pub transport: Transport,
    /// Registry hostname, possibly with port (e.g. "registry.example.com:5000")
    pub registry: String,
    /// Everything between registry and the final path segment; may be empty
    pub namespace: String,
    /// Final repository path segment
    pub name: String,
    pub tag: Option<String>,
    /// Content digest (e.g. "sha256:abc...")
    pub digest: Option<String>,
    /// Path of the OCI layout directory for [`Transport::OciLayout`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_path: Option<PathBuf>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supported forms:
    /// - `quay.io/ns/app:v1`, `quay.io/ns/app@sha256:...`
    /// - `docker://quay.io/ns/app:v1`
    /// - `oci:///path/to/layout` (or `oci:/path/to/layout`)
    /// - `file://ns/app:v1` (workspace-relative layout path)
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MirrorError::Reference {
                reference: reference.to_string(),
                message: "empty image reference".to_string(),
            });
        }

        let (transport, rest) = if let Some(rest) = reference.strip_prefix("docker://") {
            (Transport::Docker, rest)
        } else if let Some(rest) = reference.strip_prefix("file://") {
            (Transport::File, rest)
        } else if let Some(rest) = reference.strip_prefix("oci://") {
            (Transport::OciLayout, rest)
        } else if let Some(rest) = reference.strip_prefix("oci:") {
            (Transport::OciLayout, rest)
        } else {
            (Transport::Docker, reference)
        };

        if transport == Transport::OciLayout {
            return Ok(ImageReference {
                transport,
                layout_path: Some(PathBuf::from(rest)),
                name: PathBuf::from(rest)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                ..Default::default()
            });
        }

        // Split off digest first (@ separator).
        let (name_tag, digest) = match rest.rsplit_once('@') {
            Some((head, digest_part)) => {
                if !digest_part.contains(':') {
                    return Err(MirrorError::Reference {
                        reference: reference.to_string(),
                        message: "digest must be of the form algorithm:hex".to_string(),
                    });
                }
                (head, Some(digest_part.to_string()))
            }
            None => (rest, None),
        };

        // Split tag on the last colon after the last slash.
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash) => match name_tag[slash + 1..].rfind(':') {
                Some(colon) => {
                    let colon = slash + 1 + colon;
                    (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
                }
                None => (name_tag, None),
            },
            None => match name_tag.rfind(':') {
                // A lone colon could be registry:port; ports are all digits.
                Some(colon) if !name_tag[colon + 1..].chars().all(|c| c.is_ascii_digit()) => {
                    (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
                }
                _ => (name_tag, None),
            },
        };

        let (registry, repo) = split_registry(name, transport)?;
        let (namespace, short_name) = match repo.rsplit_once('/') {
            Some((ns, n)) => (ns.to_string(), n.to_string()),
            None => (String::new(), repo),
        };

        let tag = if tag.is_none() && digest.is_none() && transport == Transport::Docker {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            transport,
            registry,
            namespace,
            name: short_name,
            tag,
            digest,
            layout_path: None,
        })
    }

    /// True when the reference carries a content digest.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// True when the reference carries a tag.
    pub fn is_tagged(&self) -> bool {
        self.tag.is_some()
    }

    /// Two references address the same content when both are pinned to
    /// the same digest, regardless of registry or tag.
    pub fn digest_eq(&self, other: &ImageReference) -> bool {
        match (&self.digest, &other.digest) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Repository path without the registry (e.g. "ns/app").
    pub fn repository(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// Registry-qualified repository (e.g. "quay.io/ns/app").
    pub fn qualified_repository(&self) -> String {
        if self.registry.is_empty() {
            self.repository()
        } else {
            format!("{}/{}", self.registry, self.repository())
        }
    }

    /// Exact reference string: digest wins over tag when both are set.
    pub fn exact(&self) -> String {
        let repo = self.qualified_repository();
        match (&self.digest, &self.tag) {
            (Some(d), _) => format!("{repo}@{d}"),
            (None, Some(t)) => format!("{repo}:{t}"),
            (None, None) => repo,
        }
    }

    /// Full reference string with tag and digest when both are present.
    pub fn full(&self) -> String {
        let mut s = self.qualified_repository();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// The tag or digest, for use as the leaf path segment of workspace
    /// directories keyed by reference.
    pub fn leaf(&self) -> Result<String> {
        if let Some(ref tag) = self.tag {
            return Ok(tag.clone());
        }
        if let Some(ref digest) = self.digest {
            return Ok(digest.clone());
        }
        Err(MirrorError::Reference {
            reference: self.full(),
            message: "reference must have either a tag or digest".to_string(),
        })
    }

    /// Copy of this reference with the digest replaced.
    pub fn pinned_to(&self, digest: &str) -> ImageReference {
        ImageReference {
            digest: Some(digest.to_string()),
            ..self.clone()
        }
    }
}

fn split_registry(name: &str, transport: Transport) -> Result<(String, String)> {
    // File references are workspace-relative and carry no registry.
    if transport == Transport::File {
        return Ok((String::new(), name.to_string()));
    }

    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(MirrorError::Reference {
                    reference: name.to_string(),
                    message: "empty repository".to_string(),
                });
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    // No registry component detected; fall back to the default.
    let repo = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{name}")
    };
    Ok((DEFAULT_REGISTRY.to_string(), repo))
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full())
    }
}
