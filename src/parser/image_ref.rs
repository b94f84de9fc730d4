//! Container image reference parsing
//!
//! Turns operator-provided strings such as `nginx`, `grafana/loki:2.9` or
//! `registry.example.com:5000/group/app:v2@sha256:...` into an
//! [`ImageReference`] with every default filled in.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::parser::types::{
    DEFAULT_REGISTRY_HOST, DEFAULT_TAG, OFFICIAL_NAMESPACE, RegistryKind, detect_registry_kind,
    is_docker_hub_host,
};

/// Repository name used when the input carries none
const UNKNOWN_REPOSITORY: &str = "unknown";

/// `algorithm:encoded`, algorithm already lower-cased
static DIGEST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[A-Za-z0-9=_-]+$").expect("valid digest regex")
});

/// Parsed identity of a container image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    registry_host: String,
    namespace: Option<String>,
    repository: String,
    tag: String,
    digest: Option<String>,
    #[serde(skip)]
    degraded: bool,
}

impl ImageReference {
    /// Parse a raw image string.
    ///
    /// Never fails. Input that cannot be parsed cleanly still produces
    /// best-effort fields, and [`ImageReference::is_degraded`] reports it.
    pub fn parse(raw: &str) -> Self {
        let input = raw.trim();
        let mut degraded = input.is_empty() || !input.chars().all(is_reference_char);

        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) => (name, normalize_digest(digest, &mut degraded)),
            None => (input, None),
        };

        let (host, path) = split_host(name);
        let (path, tag) = split_tag(path);

        let tag = match tag {
            Some("") => {
                degraded = true;
                DEFAULT_TAG.to_string()
            }
            Some(tag) => tag.to_string(),
            None => DEFAULT_TAG.to_string(),
        };

        let raw_segments = path.split('/').count();
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() != raw_segments {
            degraded = true;
        }

        let repository = segments
            .pop()
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN_REPOSITORY.to_string());

        let registry_host = host.unwrap_or(DEFAULT_REGISTRY_HOST).to_string();

        let namespace = if !segments.is_empty() {
            Some(segments.join("/"))
        } else if is_docker_hub_host(&registry_host) {
            Some(OFFICIAL_NAMESPACE.to_string())
        } else {
            None
        };

        if degraded {
            debug!("Image reference '{}' parsed with best-effort fields", raw);
        }

        Self {
            registry_host,
            namespace,
            repository,
            tag,
            digest,
            degraded,
        }
    }

    pub fn registry_host(&self) -> &str {
        &self.registry_host
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// True when the input was malformed and the fields are a best guess
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Namespace and repository joined, as registries address them
    /// (e.g. `library/nginx`, `group/sub/app`)
    pub fn repository_path(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}/{}", namespace, self.repository),
            None => self.repository.clone(),
        }
    }

    /// The registry client kind serving this reference, if any
    pub fn registry_kind(&self) -> Option<RegistryKind> {
        detect_registry_kind(&self.registry_host)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}",
            self.registry_host,
            self.repository_path(),
            self.tag
        )?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn is_reference_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '.' | '-' | '_' | '@' | '+' | '=')
}

/// Lower-cases the algorithm and keeps the encoded part verbatim.
/// Unknown algorithms are kept; only the overall shape is checked.
fn normalize_digest(digest: &str, degraded: &mut bool) -> Option<String> {
    if digest.is_empty() {
        *degraded = true;
        return None;
    }

    let normalized = match digest.split_once(':') {
        Some((algorithm, encoded)) => format!("{}:{}", algorithm.to_ascii_lowercase(), encoded),
        None => digest.to_string(),
    };

    if !DIGEST_PATTERN.is_match(&normalized) {
        *degraded = true;
    }

    Some(normalized)
}

/// Splits off the registry host. The first path component is a host only when
/// it looks like one: it contains `.` or `:`, or is `localhost`.
fn split_host(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Some(first), rest)
        }
        _ => (None, name),
    }
}

/// Splits off the tag. Only a `:` inside the final path segment separates a
/// tag, so a registry port never does.
fn split_tag(path: &str) -> (&str, Option<&str>) {
    let last_segment_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[last_segment_start..].rfind(':') {
        Some(i) => {
            let colon = last_segment_start + i;
            (&path[..colon], Some(&path[colon + 1..]))
        }
        None => (path, None),
    }
}
