//! Scanner for kubeadm's human-readable output.
//!
//! kubeadm prints join credentials only as text. Everything that reads that
//! text lives here and is tested against captured output from several
//! releases under `tests/fixtures/`.

use keel_common::{Error, Result};

const JOIN_MARKER: &str = "kubeadm join";
const SECTION_END: &str = "Please note";
const CERT_KEY_MARKER: &str = "Using certificate key:";
const CERT_KEY_LEN: usize = 64;

/// Values recovered from a `kubeadm join ...` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinCommand {
    /// `host:port` the command points at.
    pub endpoint: String,
    /// Bootstrap token.
    pub token: String,
    /// `sha256:<hex>`
    pub discovery_hash: String,
    /// Present on control-plane join lines.
    pub certificate_key: Option<String>,
    /// Whether the line joins a control-plane member.
    pub control_plane: bool,
}

/// Parse the first join command in `kubeadm init` or `kubeadm token create
/// --print-join-command` output.
///
/// After `init --upload-certs` the first command is the control-plane one,
/// so it carries the certificate key.
pub fn parse_join_command(output: &str) -> Result<JoinCommand> {
    let start = output
        .find(JOIN_MARKER)
        .ok_or_else(|| scan_error("no 'kubeadm join' command in output"))?;
    let section = &output[start + JOIN_MARKER.len()..];
    let section = match section.find(SECTION_END) {
        Some(end) => &section[..end],
        None => section,
    };

    let cleaned = section.replace('\\', " ");
    let mut words = cleaned.split_whitespace();

    let endpoint = words
        .next()
        .ok_or_else(|| scan_error("join command has no endpoint"))?
        .to_string();

    let mut token = None;
    let mut discovery_hash = None;
    let mut certificate_key = None;
    let mut control_plane = false;

    while let Some(word) = words.next() {
        match word {
            "--token" if token.is_none() => token = words.next().map(str::to_string),
            "--discovery-token-ca-cert-hash" if discovery_hash.is_none() => {
                discovery_hash = words.next().map(str::to_string)
            }
            "--certificate-key" if certificate_key.is_none() => {
                certificate_key = words
                    .next()
                    .map(|k| k.chars().take(CERT_KEY_LEN).collect::<String>())
            }
            "--control-plane" | "--experimental-control-plane" => control_plane = true,
            _ => {}
        }
    }

    let token = token.ok_or_else(|| scan_error("join command has no --token"))?;
    validate_token(&token)?;
    let discovery_hash =
        discovery_hash.ok_or_else(|| scan_error("join command has no CA cert hash"))?;
    validate_hash(&discovery_hash)?;
    if let Some(key) = &certificate_key {
        validate_certificate_key(key)?;
    }

    Ok(JoinCommand {
        endpoint,
        token,
        discovery_hash,
        certificate_key,
        control_plane,
    })
}

/// Parse the key printed by `kubeadm init phase upload-certs --upload-certs`.
pub fn parse_certificate_key(output: &str) -> Result<String> {
    let (_, rest) = output
        .split_once(CERT_KEY_MARKER)
        .ok_or_else(|| scan_error("no 'Using certificate key:' line in output"))?;
    let key: String = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| scan_error("certificate key is empty"))?
        .chars()
        .take(CERT_KEY_LEN)
        .collect();
    validate_certificate_key(&key)?;
    Ok(key)
}

/// Parse the single line printed by `kubeadm token create`.
pub fn parse_token(output: &str) -> Result<String> {
    let token = output
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| scan_error("token create printed nothing"))?
        .to_string();
    validate_token(&token)?;
    Ok(token)
}

fn validate_token(token: &str) -> Result<()> {
    let valid = token.split_once('.').is_some_and(|(id, secret)| {
        id.len() == 6
            && secret.len() == 16
            && id
                .chars()
                .chain(secret.chars())
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    });
    if valid {
        Ok(())
    } else {
        Err(scan_error(format!("malformed bootstrap token '{token}'")))
    }
}

fn validate_hash(hash: &str) -> Result<()> {
    match hash.strip_prefix("sha256:") {
        Some(hex) if is_hex(hex, 64) => Ok(()),
        _ => Err(scan_error(format!("malformed CA cert hash '{hash}'"))),
    }
}

fn validate_certificate_key(key: &str) -> Result<()> {
    if is_hex(key, CERT_KEY_LEN) {
        Ok(())
    } else {
        Err(scan_error("malformed certificate key"))
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn scan_error(msg: impl Into<String>) -> Error {
    Error::parse("kubeadm output", msg)
}
