//! Deterministic responder used when no live provider answers.
//!
//! Replies are plain text in the same shape a provider is asked to produce
//! (one command per line, cautions prefixed with `Warning:`), so they go
//! through the same normalisation as live answers.

use super::models::{ConversationMessage, Role, SuggestionResult};

/// Checked in order; the first keyword found in the query wins.
const RESPONSES: &[(&str, &str)] = &[
    (
        "help",
        "Here are the commands you will use most:
avm start
avm status
avm stop
avm ssh",
    ),
    (
        "docker",
        "Start the VM, then work with Docker inside it over SSH.
avm start
avm ssh
docker ps
docker pull <image>
docker run --rm -it <image>",
    ),
    (
        "install",
        "Create the registry with the default VM definition first.
Download an Alpine cloud image and point the VM definition at it.
avm config init
avm vm create dev --ram 2048 --cpu 2 --ssh-port 2222 --image ~/alpine-vm.qcow2",
    ),
    (
        "troubleshoot",
        "VM won't start: check that the hypervisor is installed and on PATH.
SSH fails: wait for the guest to finish booting, which takes 2-3 minutes.
Status mismatch: the live process is the source of truth, not the registry.
avm status
avm config validate",
    ),
    (
        "first boot",
        "Use at least 2 GB RAM for development workloads.
Enable KVM for better performance where the host supports it.
avm start --headless
avm ssh
Warning: First boot may take several minutes.
Warning: Ensure a stable internet connection for package downloads.",
    ),
    (
        "optimize",
        "Memory pressure is the most common bottleneck: increase RAM to 4096 MB for builds.
Parallel workloads benefit when you add CPU core capacity, up to 4 cores.
Restart the VM after scaling so the guest sees the new size.
avm vm resources monitor <vm>
avm vm resources scale <vm> --ram 4096 --cpu 4",
    ),
    (
        "diagnose",
        "Compare the registry status with the live process state.
Check the VM log file for hypervisor errors.
If the VM is marked running but has no process, start it again.
avm status <vm>
avm stop <vm>
avm start <vm>",
    ),
];

const GENERIC: &str = "Use the help command to see everything avm can do.
Check VM state before starting or stopping anything.
List registered VMs to find the one you need.
avm help
avm status
avm vm list";

/// Canned reply for `query`.
pub fn reply(query: &str) -> &'static str {
    let query = query.to_lowercase();
    RESPONSES
        .iter()
        .find(|(keyword, _)| query.contains(keyword))
        .map(|(_, text)| *text)
        .unwrap_or(GENERIC)
}

/// Canned reply to the last user message of a conversation.
pub fn respond(messages: &[ConversationMessage]) -> &'static str {
    let query = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    reply(query)
}

const COMMAND_WORDS: &[&str] = &["avm", "docker", "git", "ssh"];
const WARNING_PREFIX: &str = "Warning:";

fn is_command(line: &str) -> bool {
    if line.starts_with("./") {
        return true;
    }
    COMMAND_WORDS.iter().any(|word| {
        line.strip_prefix(word)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
    })
}

fn strip_bullet(line: &str) -> &str {
    for marker in ["• ", "- ", "* "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return rest.trim_start();
        }
    }

    // "1. text" / "2) text"
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim_start();
        }
    }
    line
}

/// Split assistant text into commands, warnings and suggestions.
pub fn normalize(text: &str) -> SuggestionResult {
    let mut result = SuggestionResult::default();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let line = strip_bullet(line);
        if is_command(line) {
            result.commands.push(line.to_string());
        } else if let Some(warning) = line.strip_prefix(WARNING_PREFIX) {
            result.warnings.push(warning.trim().to_string());
        } else if !line.is_empty() {
            result.suggestions.push(line.to_string());
        }
    }
    result
}
