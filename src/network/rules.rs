use std::fmt;
use std::net::IpAddr;

/// Comment prefix tagging every rule this tool owns.
pub const COMMENT_PREFIX: &str = "avm:";
const VPN_SUFFIX: &str = ":vpn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Accept,
    Drop,
}

impl RuleAction {
    fn target(self) -> &'static str {
        match self {
            RuleAction::Accept => "ACCEPT",
            RuleAction::Drop => "DROP",
        }
    }
}

/// One inbound rule on a VM's forwarded port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub action: RuleAction,
    /// Source address or CIDR; `None` matches any source.
    pub source: Option<String>,
    pub port: u16,
    pub comment: String,
}

impl FirewallRule {
    /// Arguments for `iptables`, inserting at the head of the INPUT chain.
    pub fn to_iptables_args(&self) -> Vec<String> {
        let mut args = vec![
            "-I".to_string(),
            "INPUT".to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            self.port.to_string(),
        ];
        if let Some(source) = &self.source {
            args.push("-s".to_string());
            args.push(source.clone());
        }
        args.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            self.comment.clone(),
            "-j".to_string(),
            self.action.target().to_string(),
        ]);
        args
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_iptables_args().join(" "))
    }
}

pub fn rule_comment(vm: &str, vpn: bool) -> String {
    if vpn {
        format!("{}{}{}", COMMENT_PREFIX, vm, VPN_SUFFIX)
    } else {
        format!("{}{}", COMMENT_PREFIX, vm)
    }
}

/// The VM and VPN flag encoded in a rule comment, if it is one of ours.
pub fn comment_owner(comment: &str) -> Option<(&str, bool)> {
    let rest = comment.strip_prefix(COMMENT_PREFIX)?;
    match rest.strip_suffix(VPN_SUFFIX) {
        Some(vm) => Some((vm, true)),
        None => Some((rest, false)),
    }
}

/// Normalise an allow-list entry: a bare IP address or `address/prefix`.
pub fn parse_source(entry: &str) -> Result<String, String> {
    let entry = entry.trim();
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };

    let ip: IpAddr = addr
        .parse()
        .map_err(|_| format!("'{}' is not an IP address or CIDR block", entry))?;

    match prefix {
        None => Ok(ip.to_string()),
        Some(prefix) => {
            let max = if ip.is_ipv4() { 32 } else { 128 };
            match prefix.parse::<u8>() {
                Ok(bits) if bits <= max => Ok(format!("{}/{}", ip, bits)),
                _ => Err(format!("'{}' has an invalid prefix length", entry)),
            }
        }
    }
}

/// Rule set isolating `port`: one default deny, then one allow per entry in
/// the given order. Entries that do not parse are returned as warnings.
pub fn build_rules(
    vm: &str,
    port: u16,
    allow_list: &[String],
    vpn: bool,
) -> (Vec<FirewallRule>, Vec<String>) {
    let comment = rule_comment(vm, vpn);
    let mut rules = vec![FirewallRule {
        action: RuleAction::Drop,
        source: None,
        port,
        comment: comment.clone(),
    }];
    let mut warnings = Vec::new();

    for entry in allow_list.iter().filter(|e| !e.trim().is_empty()) {
        match parse_source(entry) {
            Ok(source) => rules.push(FirewallRule {
                action: RuleAction::Accept,
                source: Some(source),
                port,
                comment: comment.clone(),
            }),
            Err(e) => warnings.push(format!("Skipped allow-list entry: {}", e)),
        }
    }

    (rules, warnings)
}

/// Extract the comment from an `iptables -S` line.
/// E.g. from `-A INPUT -p tcp -m tcp --dport 2222 -m comment --comment avm:dev -j DROP`
/// returns `avm:dev`.
pub fn extract_comment(line: &str) -> Option<String> {
    let marker = "--comment ";
    let start = line.find(marker)? + marker.len();
    let rest = &line[start..];

    if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"')?;
        return Some(quoted[..end].to_string());
    }
    rest.split_whitespace().next().map(String::from)
}

/// Turn an `iptables -S` append line into the arguments deleting that rule.
pub fn delete_args(line: &str) -> Option<Vec<String>> {
    let rest = line.trim().strip_prefix("-A ")?;
    let mut args = vec!["-D".to_string()];
    args.extend(rest.split_whitespace().map(|s| s.trim_matches('"').to_string()));
    Some(args)
}
