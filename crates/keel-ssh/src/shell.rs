//! POSIX shell quoting for command strings sent to remote hosts.

/// Quote a single argument for `sh`.
///
/// Safe words pass through untouched so logged commands stay readable.
pub fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Run `command` through `sudo bash -c` unless already root.
pub fn elevate(user: &str, command: &str) -> String {
    if user == "root" {
        command.to_string()
    } else {
        format!("sudo -E /bin/bash -c {}", quote(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths_are_not_quoted() {
        assert_eq!(quote("/var/lib/keel/prod/rootfs"), "/var/lib/keel/prod/rootfs");
        assert_eq!(quote("10.0.0.1:6443"), "10.0.0.1:6443");
    }

    #[test]
    fn spaces_and_quotes_are_escaped() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn root_runs_commands_directly() {
        assert_eq!(elevate("root", "kubeadm reset -f"), "kubeadm reset -f");
    }

    #[test]
    fn other_users_go_through_sudo() {
        assert_eq!(
            elevate("ubuntu", "cd /tmp && ls"),
            "sudo -E /bin/bash -c 'cd /tmp && ls'"
        );
    }
}
