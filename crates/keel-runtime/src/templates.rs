//! Built-in configuration templates.
//!
//! Rendered with minijinja in strict mode, so a value missing from the
//! context is an error instead of an empty string in a kubeadm config.

use std::net::IpAddr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use thiserror::Error;

/// kubeadm init configuration.
pub const KUBEADM_INIT: &str = "kubeadm-init.yaml";
/// kubeadm join configuration (control plane and worker).
pub const KUBEADM_JOIN: &str = "kubeadm-join.yaml";
/// lvscare static pod manifest.
pub const LVSCARE_POD: &str = "kube-lvscare.yaml";
/// kubeconfig with embedded client credentials.
pub const KUBECONFIG: &str = "kubeconfig";
/// k0s cluster configuration.
pub const K0S_CONFIG: &str = "k0s.yaml";

const KUBEADM_INIT_TEMPLATE: &str = r#"apiVersion: {{ api_version }}
kind: InitConfiguration
localAPIEndpoint:
  advertiseAddress: {{ master0 }}
  bindPort: {{ api_port }}
nodeRegistration:
  criSocket: {{ cri_socket }}
---
apiVersion: {{ api_version }}
kind: ClusterConfiguration
kubernetesVersion: {{ version }}
controlPlaneEndpoint: "{{ api_domain }}:{{ api_port }}"
imageRepository: {{ registry }}
networking:
  podSubnet: {{ pod_cidr }}
  serviceSubnet: {{ svc_cidr }}
  dnsDomain: {{ dns_domain }}
apiServer:
  certSANs:
{%- for san in cert_sans %}
    - "{{ san }}"
{%- endfor %}
controllerManager:
  extraArgs:
    bind-address: 0.0.0.0
scheduler:
  extraArgs:
    bind-address: 0.0.0.0
---
apiVersion: kubeproxy.config.k8s.io/v1alpha1
kind: KubeProxyConfiguration
mode: ipvs
ipvs:
  excludeCIDRs:
    - "{{ vip }}/32"
---
apiVersion: kubelet.config.k8s.io/v1beta1
kind: KubeletConfiguration
cgroupDriver: systemd
"#;

const KUBEADM_JOIN_TEMPLATE: &str = r#"apiVersion: {{ api_version }}
kind: JoinConfiguration
discovery:
  bootstrapToken:
    apiServerEndpoint: "{{ endpoint }}"
    token: {{ token }}
    caCertHashes:
      - {{ discovery_hash }}
  timeout: 5m0s
nodeRegistration:
  criSocket: {{ cri_socket }}
{%- if control_plane %}
controlPlane:
  localAPIEndpoint:
    advertiseAddress: {{ advertise_address }}
    bindPort: {{ api_port }}
  certificateKey: {{ certificate_key }}
{%- endif %}
"#;

const LVSCARE_TEMPLATE: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: kube-lvscare
  namespace: kube-system
  labels:
    component: kube-lvscare
    tier: control-plane
spec:
  hostNetwork: true
  priorityClassName: system-node-critical
  containers:
    - name: kube-lvscare
      image: {{ image }}
      imagePullPolicy: IfNotPresent
      command: ["/usr/bin/lvscare"]
      args:
        - care
        - --vs
        - "{{ virtual_server }}"
        - --health-path
        - /healthz
        - --health-schem
        - https
{%- for rs in real_servers %}
        - --rs
        - "{{ rs }}"
{%- endfor %}
      securityContext:
        privileged: true
      volumeMounts:
        - mountPath: /lib/modules
          name: lib-modules
          readOnly: true
  volumes:
    - hostPath:
        path: /lib/modules
      name: lib-modules
"#;

const KUBECONFIG_TEMPLATE: &str = r#"apiVersion: v1
kind: Config
clusters:
  - cluster:
      certificate-authority-data: {{ ca_cert | base64_encode }}
      server: {{ server }}
    name: {{ cluster_name }}
contexts:
  - context:
      cluster: {{ cluster_name }}
      user: {{ user }}
    name: {{ user }}@{{ cluster_name }}
current-context: {{ user }}@{{ cluster_name }}
users:
  - name: {{ user }}
    user:
      client-certificate-data: {{ client_cert | base64_encode }}
      client-key-data: {{ client_key | base64_encode }}
"#;

const K0S_TEMPLATE: &str = r#"apiVersion: k0s.k0sproject.io/v1beta1
kind: ClusterConfig
metadata:
  name: {{ cluster_name }}
spec:
  api:
    address: {{ master0 }}
    externalAddress: {{ api_domain }}
    port: {{ api_port }}
    sans:
{%- for san in cert_sans %}
      - "{{ san }}"
{%- endfor %}
  network:
    podCIDR: {{ pod_cidr }}
    serviceCIDR: {{ svc_cidr }}
    clusterDomain: {{ dns_domain }}
    provider: {{ provider }}
    nodeLocalLoadBalancing:
      enabled: true
      type: EnvoyProxy
  images:
    repository: "{{ registry }}"
"#;

/// Template failures.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Parse or render failure inside minijinja.
    #[error("template render error: {0}")]
    Render(#[from] minijinja::Error),
}

impl From<TemplateError> for keel_common::Error {
    fn from(e: TemplateError) -> Self {
        keel_common::Error::template(e.to_string())
    }
}

/// Values for [`KUBEADM_INIT`].
#[derive(Clone, Debug, Serialize)]
pub struct InitValues {
    /// kubeadm config API group version.
    pub api_version: String,
    /// Advertise address of the bootstrap master.
    pub master0: IpAddr,
    /// API server port.
    pub api_port: u16,
    /// Stable API server name.
    pub api_domain: String,
    /// `vX.Y.Z`
    pub version: String,
    /// Registry serving control-plane images (`domain:port`).
    pub registry: String,
    /// CRI socket path.
    pub cri_socket: String,
    /// Pod CIDR.
    pub pod_cidr: String,
    /// Service CIDR.
    pub svc_cidr: String,
    /// Cluster DNS domain.
    pub dns_domain: String,
    /// API server SANs.
    pub cert_sans: Vec<String>,
    /// Virtual IP, excluded from kube-proxy's IPVS cleanup.
    pub vip: IpAddr,
}

/// Values for [`KUBEADM_JOIN`].
#[derive(Clone, Debug, Serialize)]
pub struct JoinValues {
    /// kubeadm config API group version.
    pub api_version: String,
    /// `host:port` the joining host talks to.
    pub endpoint: String,
    /// Bootstrap token.
    pub token: String,
    /// CA public key hash.
    pub discovery_hash: String,
    /// CRI socket path.
    pub cri_socket: String,
    /// Join as a control-plane member.
    pub control_plane: bool,
    /// Control-plane advertise address (the joining host).
    pub advertise_address: Option<IpAddr>,
    /// API server port.
    pub api_port: u16,
    /// Key for downloading uploaded control-plane certs.
    pub certificate_key: Option<String>,
}

/// Values for [`LVSCARE_POD`].
#[derive(Clone, Debug, Serialize)]
pub struct LvscareValues {
    /// lvscare image.
    pub image: String,
    /// `vip:port`
    pub virtual_server: String,
    /// `master:port` for each master.
    pub real_servers: Vec<String>,
}

/// Values for [`KUBECONFIG`].
#[derive(Clone, Serialize)]
pub struct KubeconfigValues {
    /// Cluster name inside the kubeconfig.
    pub cluster_name: String,
    /// `https://host:port`
    pub server: String,
    /// User name inside the kubeconfig.
    pub user: String,
    /// CA certificate PEM.
    pub ca_cert: String,
    /// Client certificate PEM.
    pub client_cert: String,
    /// Client key PEM.
    pub client_key: String,
}

/// Values for [`K0S_CONFIG`].
#[derive(Clone, Debug, Serialize)]
pub struct K0sValues {
    /// Cluster name.
    pub cluster_name: String,
    /// First controller address.
    pub master0: IpAddr,
    /// Stable API server name.
    pub api_domain: String,
    /// API server port.
    pub api_port: u16,
    /// API server SANs.
    pub cert_sans: Vec<String>,
    /// Pod CIDR.
    pub pod_cidr: String,
    /// Service CIDR.
    pub svc_cidr: String,
    /// Cluster DNS domain.
    pub dns_domain: String,
    /// k0s network provider (`kuberouter`, `calico` or `custom`).
    pub provider: String,
    /// Private registry `domain:port` serving system images.
    pub registry: String,
}

impl K0sValues {
    /// k0s network provider for a configured CNI name.
    pub fn provider_for(cni: Option<&str>) -> String {
        match cni.map(str::to_ascii_lowercase).as_deref() {
            None | Some("") | Some("kuberouter") | Some("kube-router") => "kuberouter",
            Some("calico") => "calico",
            Some(_) => "custom",
        }
        .to_string()
    }
}

/// `host:port`, bracketing IPv6 hosts.
pub fn host_port(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

fn base64_encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// Renders the built-in templates and operator-supplied overrides.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Engine with every built-in template registered.
    pub fn new() -> Result<Self, TemplateError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("base64_encode", base64_encode);
        env.add_template(KUBEADM_INIT, KUBEADM_INIT_TEMPLATE)?;
        env.add_template(KUBEADM_JOIN, KUBEADM_JOIN_TEMPLATE)?;
        env.add_template(LVSCARE_POD, LVSCARE_TEMPLATE)?;
        env.add_template(KUBECONFIG, KUBECONFIG_TEMPLATE)?;
        env.add_template(K0S_CONFIG, K0S_TEMPLATE)?;
        Ok(Self { env })
    }

    /// Render a built-in template by name.
    pub fn render<T: Serialize>(&self, name: &str, values: &T) -> Result<String, TemplateError> {
        let template = self.env.get_template(name)?;
        Ok(template.render(values)?)
    }

    /// Render an operator-supplied template against the same values.
    pub fn render_str<T: Serialize>(
        &self,
        source: &str,
        values: &T,
    ) -> Result<String, TemplateError> {
        Ok(self.env.render_str(source, values)?)
    }
}
