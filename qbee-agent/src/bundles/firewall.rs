use super::BundleContext;
use crate::util::command::{binary_exists, run_argv};
use anyhow::{Result, bail};
use qbee_shared::config::{FirewallBundle, FirewallChain, FirewallRule};

/// Interface used by the remote-access tunnel; its traffic is always
/// accepted on filter/INPUT.
const REMOTE_ACCESS_INTERFACE: &str = "qbee0";

/// Arguments appended after `-A <chain>` for one rule, mirroring the
/// canonical `iptables -S` rendering so desired and observed lines compare
/// byte for byte.
pub(crate) fn rule_args(rule: &FirewallRule) -> Vec<String> {
    let mut args = Vec::new();
    if !rule.src_ip.is_empty() {
        args.push("-s".to_string());
        args.push(rule.src_ip.clone());
    }
    if !rule.proto.is_empty() {
        args.push("-p".to_string());
        args.push(rule.proto.clone());
    }
    if !rule.dst_port.is_empty() {
        let proto = if rule.proto.is_empty() {
            "tcp"
        } else {
            &rule.proto
        };
        args.push("-m".to_string());
        args.push(proto.to_string());
        args.push("--dport".to_string());
        args.push(rule.dst_port.clone());
    }
    args.push("-j".to_string());
    args.push(rule.target.clone());
    args
}

/// The full desired listing for one chain: policy line, fixed preamble for
/// filter/INPUT, then the configured rules in order.
pub(crate) fn render_chain(table: &str, chain: &str, desired: &FirewallChain) -> Vec<String> {
    let mut lines = vec![format!("-P {} {}", chain, desired.policy)];

    if table == "filter" && chain == "INPUT" {
        lines.push(format!(
            "-A {chain} -m state --state RELATED,ESTABLISHED -j ACCEPT"
        ));
        lines.push(format!("-A {chain} -i lo -j ACCEPT"));
        lines.push(format!("-A {chain} -i {REMOTE_ACCESS_INTERFACE} -j ACCEPT"));
    }

    for rule in &desired.rules {
        lines.push(format!("-A {} {}", chain, rule_args(rule).join(" ")));
    }
    lines
}

/// Preamble rules (without the leading `-A <chain>`) applied before the
/// configured rules when rebuilding filter/INPUT.
fn preamble_rule_args(table: &str, chain: &str) -> Vec<Vec<String>> {
    if table != "filter" || chain != "INPUT" {
        return Vec::new();
    }
    vec![
        ["-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT"]
            .into_iter()
            .map(String::from)
            .collect(),
        ["-i", "lo", "-j", "ACCEPT"].into_iter().map(String::from).collect(),
        ["-i", REMOTE_ACCESS_INTERFACE, "-j", "ACCEPT"]
            .into_iter()
            .map(String::from)
            .collect(),
    ]
}

pub(crate) fn parse_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

pub(crate) async fn execute(bundle: &FirewallBundle, ctx: &BundleContext<'_>) -> Result<()> {
    if !binary_exists("iptables") {
        ctx.reporter.err("iptables not found on this device");
        bail!("iptables not found");
    }

    for (table, chains) in &bundle.tables {
        for (chain, desired) in chains {
            let desired_lines = render_chain(table, chain, desired);

            let listing = match run_argv(
                &["iptables", "-t", table.as_str(), "-S", chain.as_str()],
                Some(ctx.remaining()),
            )
            .await
            {
                Ok(output) => parse_listing(&output),
                Err(e) => {
                    ctx.reporter.err_with_log(
                        format!("Unable to read firewall chain {table}/{chain}"),
                        e.output_tail().to_string(),
                    );
                    bail!("failed to list {table}/{chain}: {e}");
                }
            };

            if listing == desired_lines {
                continue;
            }

            ctx.reporter.warn(format!(
                "Firewall chain {table}/{chain} differs from the desired state; rebuilding"
            ));

            if let Err(e) = rebuild_chain(ctx, table, chain, desired).await {
                ctx.reporter
                    .err(format!("Unable to rebuild firewall chain {table}/{chain}: {e:#}"));
                return Err(e);
            }

            ctx.reporter.info(format!(
                "Successfully rebuilt firewall chain {table}/{chain}"
            ));
        }
    }

    Ok(())
}

async fn rebuild_chain(
    ctx: &BundleContext<'_>,
    table: &str,
    chain: &str,
    desired: &FirewallChain,
) -> Result<()> {
    let steps: Vec<Vec<String>> = std::iter::once(
        ["-t", table, "-F", chain].into_iter().map(String::from).collect(),
    )
    .chain(std::iter::once(
        ["-t", table, "-P", chain, desired.policy.as_str()]
            .into_iter()
            .map(String::from)
            .collect(),
    ))
    .chain(
        preamble_rule_args(table, chain)
            .into_iter()
            .chain(desired.rules.iter().map(rule_args))
            .map(|rule| {
                let mut argv: Vec<String> =
                    ["-t", table, "-A", chain].into_iter().map(String::from).collect();
                argv.extend(rule);
                argv
            }),
    )
    .collect();

    for step in steps {
        let mut argv = vec!["iptables".to_string()];
        argv.extend(step);
        if let Err(e) = run_argv(&argv, Some(ctx.remaining())).await {
            bail!("{} failed: {e}", argv.join(" "));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(proto: &str, src: &str, port: &str, target: &str) -> FirewallRule {
        FirewallRule {
            proto: proto.to_string(),
            src_ip: src.to_string(),
            dst_port: port.to_string(),
            target: target.to_string(),
        }
    }

    #[test]
    fn test_render_input_chain_includes_preamble() {
        let chain = FirewallChain {
            policy: "DROP".to_string(),
            rules: vec![rule("tcp", "", "22", "ACCEPT")],
        };
        let lines = render_chain("filter", "INPUT", &chain);
        assert_eq!(
            lines,
            vec![
                "-P INPUT DROP",
                "-A INPUT -m state --state RELATED,ESTABLISHED -j ACCEPT",
                "-A INPUT -i lo -j ACCEPT",
                "-A INPUT -i qbee0 -j ACCEPT",
                "-A INPUT -p tcp -m tcp --dport 22 -j ACCEPT",
            ]
        );
    }

    #[test]
    fn test_render_other_chain_has_no_preamble() {
        let chain = FirewallChain {
            policy: "ACCEPT".to_string(),
            rules: vec![rule("udp", "10.0.0.0/8", "53", "ACCEPT")],
        };
        let lines = render_chain("nat", "PREROUTING", &chain);
        assert_eq!(
            lines,
            vec![
                "-P PREROUTING ACCEPT",
                "-A PREROUTING -s 10.0.0.0/8 -p udp -m udp --dport 53 -j ACCEPT",
            ]
        );
    }

    #[test]
    fn test_rule_args_without_port() {
        let args = rule_args(&rule("icmp", "", "", "DROP"));
        assert_eq!(args.join(" "), "-p icmp -j DROP");
    }

    #[test]
    fn test_rule_args_port_without_proto_defaults_to_tcp() {
        let args = rule_args(&rule("", "", "443", "ACCEPT"));
        assert_eq!(args.join(" "), "-m tcp --dport 443 -j ACCEPT");
    }

    #[test]
    fn test_parse_listing_trims_blank_lines() {
        let listing = parse_listing("-P INPUT ACCEPT\n\n-A INPUT -i lo -j ACCEPT\n");
        assert_eq!(listing, vec!["-P INPUT ACCEPT", "-A INPUT -i lo -j ACCEPT"]);
    }

    #[test]
    fn test_matching_listing_means_no_rebuild() {
        let chain = FirewallChain {
            policy: "DROP".to_string(),
            rules: vec![rule("tcp", "", "22", "ACCEPT")],
        };
        let rendered = render_chain("filter", "INPUT", &chain).join("\n");
        assert_eq!(parse_listing(&rendered), render_chain("filter", "INPUT", &chain));
    }
}
