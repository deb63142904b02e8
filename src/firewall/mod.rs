//! Firewall rule lifecycle
//!
//! Provisions the kernel-side interception: an ipset of blocked
//! destination addresses, a DNAT rule steering the local subnet's DNS to
//! our resolver, a DNAT rule steering TCP to set members into the proxy
//! listener, and a MASQUERADE rule for everything leaving the egress
//! interface. Installed at startup (failure is fatal, with the offending
//! command's output in the error), removed again at shutdown.
//!
//! `ipset add -exist` makes set membership idempotent; rule appends go
//! through a check-then-append pair so repeated starts never stack
//! duplicate rules.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::Output;

use ipnet::Ipv4Net;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::FirewallConfig;
use crate::error::FirewallError;

/// Managed iptables/ipset rule set
pub struct Firewall {
    iptables_bin: String,
    ipset_bin: String,
    set_name: String,
    /// Subnet whose traffic is intercepted
    local_cidr: Ipv4Net,
    /// Where the DNS DNAT points
    dns_listen: SocketAddr,
    /// Where the match-set DNAT points (local IP + proxy port)
    proxy_redirect: SocketAddr,
}

impl Firewall {
    /// Describe the rule set without touching the kernel
    #[must_use]
    pub fn new(
        config: &FirewallConfig,
        local_cidr: Ipv4Net,
        dns_listen: SocketAddr,
        proxy_redirect: SocketAddr,
    ) -> Self {
        Self {
            iptables_bin: config.iptables_bin.clone(),
            ipset_bin: config.ipset_bin.clone(),
            set_name: config.set_name.clone(),
            local_cidr,
            dns_listen,
            proxy_redirect,
        }
    }

    /// `-s <cidr> -p udp --dport 53 -j DNAT --to-destination <resolver>`
    fn dns_rule(&self) -> Vec<String> {
        vec![
            "-s".into(),
            self.local_cidr.to_string(),
            "-p".into(),
            "udp".into(),
            "--dport".into(),
            "53".into(),
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            self.dns_listen.to_string(),
        ]
    }

    /// `-s <cidr> -p tcp -m set --match-set <set> dst -j DNAT ...`
    fn redirect_rule(&self) -> Vec<String> {
        vec![
            "-s".into(),
            self.local_cidr.to_string(),
            "-p".into(),
            "tcp".into(),
            "-m".into(),
            "set".into(),
            "--match-set".into(),
            self.set_name.clone(),
            "dst".into(),
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            self.proxy_redirect.to_string(),
        ]
    }

    /// `-s <cidr> -j MASQUERADE`
    fn masquerade_rule(&self) -> Vec<String> {
        vec![
            "-s".into(),
            self.local_cidr.to_string(),
            "-j".into(),
            "MASQUERADE".into(),
        ]
    }

    /// Install the set and all three rules
    ///
    /// # Errors
    ///
    /// Returns `FirewallError` with the failing command's combined output;
    /// the caller treats this as fatal.
    pub async fn install(&self) -> Result<(), FirewallError> {
        info!(set = %self.set_name, cidr = %self.local_cidr, "Installing firewall rules");

        run_checked(
            &self.ipset_bin,
            &["create", &self.set_name, "hash:ip", "-exist"],
        )
        .await?;

        self.append_unique("PREROUTING", &self.dns_rule()).await?;
        self.append_unique("PREROUTING", &self.redirect_rule()).await?;
        self.append_unique("POSTROUTING", &self.masquerade_rule()).await?;

        Ok(())
    }

    /// Remove everything `install` created.
    ///
    /// Failures are logged, not returned: teardown runs on shutdown paths
    /// where there is nothing left to do about them.
    pub async fn teardown(&self) {
        info!(set = %self.set_name, "Removing firewall rules");

        for (chain, rule) in [
            ("PREROUTING", self.dns_rule()),
            ("PREROUTING", self.redirect_rule()),
            ("POSTROUTING", self.masquerade_rule()),
        ] {
            if let Err(e) = self.delete_if_exists(chain, &rule).await {
                warn!(chain, error = %e, "Failed to delete firewall rule");
            }
        }

        for action in ["flush", "destroy"] {
            if let Err(e) = run_checked(&self.ipset_bin, &[action, &self.set_name]).await {
                warn!(action, error = %e, "Failed to remove ipset");
            }
        }
    }

    /// Add one blocked destination to the redirect set.
    ///
    /// Idempotent; failures are logged and self-heal on the next
    /// resolution of the same name.
    pub async fn add_blocked_ipv4(&self, ip: Ipv4Addr) {
        let ip_str = ip.to_string();
        debug!(ip = %ip_str, set = %self.set_name, "Adding address to redirect set");
        if let Err(e) = run_checked(
            &self.ipset_bin,
            &["add", &self.set_name, &ip_str, "-exist"],
        )
        .await
        {
            warn!(ip = %ip_str, error = %e, "Failed to add address to redirect set");
        }
    }

    /// Append a nat rule unless an identical one is already present
    async fn append_unique(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        let mut check: Vec<&str> = vec!["-t", "nat", "-C", chain];
        check.extend(rule.iter().map(String::as_str));
        if run_quiet(&self.iptables_bin, &check).await {
            debug!(chain, "Firewall rule already present");
            return Ok(());
        }

        let mut append: Vec<&str> = vec!["-t", "nat", "-A", chain];
        append.extend(rule.iter().map(String::as_str));
        run_checked(&self.iptables_bin, &append).await
    }

    /// Delete a nat rule if it exists
    async fn delete_if_exists(&self, chain: &str, rule: &[String]) -> Result<(), FirewallError> {
        let mut check: Vec<&str> = vec!["-t", "nat", "-C", chain];
        check.extend(rule.iter().map(String::as_str));
        if !run_quiet(&self.iptables_bin, &check).await {
            return Ok(());
        }

        let mut delete: Vec<&str> = vec!["-t", "nat", "-D", chain];
        delete.extend(rule.iter().map(String::as_str));
        run_checked(&self.iptables_bin, &delete).await
    }
}

/// Run a command, erroring with its combined output on non-zero exit
async fn run_checked(program: &str, args: &[&str]) -> Result<(), FirewallError> {
    let output = spawn(program, args).await?;
    if output.status.success() {
        return Ok(());
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(FirewallError::CommandFailed {
        program: program.to_string(),
        args: args.join(" "),
        output: combined.trim().to_string(),
    })
}

/// Run a command for its exit status only
async fn run_quiet(program: &str, args: &[&str]) -> bool {
    matches!(spawn(program, args).await, Ok(output) if output.status.success())
}

async fn spawn(program: &str, args: &[&str]) -> Result<Output, FirewallError> {
    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| FirewallError::Spawn {
            program: program.to_string(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firewall() -> Firewall {
        Firewall::new(
            &FirewallConfig::default(),
            "192.168.0.0/24".parse().unwrap(),
            "192.168.0.1:5353".parse().unwrap(),
            "192.168.0.1:12948".parse().unwrap(),
        )
    }

    #[test]
    fn test_dns_rule_shape() {
        let rule = firewall().dns_rule();
        assert_eq!(
            rule,
            [
                "-s",
                "192.168.0.0/24",
                "-p",
                "udp",
                "--dport",
                "53",
                "-j",
                "DNAT",
                "--to-destination",
                "192.168.0.1:5353"
            ]
        );
    }

    #[test]
    fn test_redirect_rule_targets_proxy() {
        let rule = firewall().redirect_rule();
        assert!(rule.contains(&"--match-set".to_string()));
        assert!(rule.contains(&"divertlist".to_string()));
        assert_eq!(rule.last().unwrap(), "192.168.0.1:12948");
    }

    #[test]
    fn test_masquerade_rule_shape() {
        assert_eq!(
            firewall().masquerade_rule(),
            ["-s", "192.168.0.0/24", "-j", "MASQUERADE"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = run_checked("/nonexistent/iptables-bin", &["-L"])
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_failed_command_captures_output() {
        // `false` exits non-zero with no output.
        let err = run_checked("false", &[]).await.unwrap_err();
        match err {
            FirewallError::CommandFailed { program, .. } => assert_eq!(program, "false"),
            FirewallError::Spawn { .. } => panic!("expected CommandFailed"),
        }
    }
}
