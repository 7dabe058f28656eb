//! Kubernetes version handling.
//!
//! Several leaf commands change shape across releases: the kubeadm config
//! API, the upload-certs flag, and the default CRI socket.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use keel_common::Error;

/// `vMAJOR.MINOR.PATCH`, leading `v` optional, pre-release suffix ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KubeVersion {
    /// Major.
    pub major: u32,
    /// Minor.
    pub minor: u32,
    /// Patch.
    pub patch: u32,
}

impl KubeVersion {
    /// Construct from parts.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether `self >= major.minor.0`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= KubeVersion::new(major, minor, 0)
    }

    /// kubeadm configuration API group version.
    pub fn kubeadm_api(&self) -> &'static str {
        if !self.at_least(1, 15) {
            "kubeadm.k8s.io/v1beta1"
        } else if !self.at_least(1, 22) {
            "kubeadm.k8s.io/v1beta2"
        } else {
            "kubeadm.k8s.io/v1beta3"
        }
    }

    /// Flag that makes `kubeadm init` upload control-plane certificates.
    pub fn upload_certs_flag(&self) -> &'static str {
        if self.at_least(1, 15) {
            "--upload-certs"
        } else {
            "--experimental-upload-certs"
        }
    }

    /// Container runtime socket handed to kubeadm.
    pub fn cri_socket(&self) -> &'static str {
        if self.at_least(1, 20) {
            "/run/containerd/containerd.sock"
        } else {
            "/var/run/dockershim.sock"
        }
    }

    /// Whether join flags must be passed on the command line.
    pub fn legacy_join(&self) -> bool {
        !self.at_least(1, 15)
    }

    /// Extract a version from an image reference tag (`repo/k8s:v1.22.15`).
    pub fn from_image(image: &str) -> Option<Self> {
        let tag = image.rsplit_once(':')?.1;
        // a port, not a tag
        if tag.contains('/') {
            return None;
        }
        tag.parse().ok()
    }
}

impl Ord for KubeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for KubeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KubeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KubeVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let core = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = core.split(['-', '+']).next().unwrap_or(core);

        let mut parts = core.split('.');
        let mut next = |name: &str| -> Result<u32, Error> {
            parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| Error::parse("kubernetes version", format!("bad {name} in '{s}'")))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        Ok(Self::new(major, minor, patch))
    }
}
