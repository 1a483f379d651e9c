//! Command-line construction for headless invocations

/// Read-only capabilities approved without a prompt by default
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Read", "Grep", "Glob", "WebSearch", "WebFetch"];

/// Capabilities that can change state outside the process; never exposed
pub const MUTATING_TOOLS: &[&str] = &[
    "Bash",
    "Edit",
    "MultiEdit",
    "Write",
    "NotebookEdit",
    "KillShell",
];

/// One invocation of the tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub model: String,
    /// Written to the child's stdin
    pub prompt: String,
    /// Session to continue; `None` starts a fresh one
    pub resume: Option<String>,
}

/// Which tool capabilities run unattended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPolicy {
    allowed: Vec<String>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            allowed: DEFAULT_ALLOWED_TOOLS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl ToolPolicy {
    /// Build a policy from a requested allow-list. Mutating tools are dropped
    /// with a warning; nobody is attached to approve them.
    pub fn new<I, S>(requested: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed: Vec<String> = Vec::new();
        for tool in requested {
            let tool = tool.as_ref().trim();
            if tool.is_empty() || allowed.iter().any(|t| t == tool) {
                continue;
            }
            if is_mutating(tool) {
                tracing::warn!(tool, "Refusing to auto-approve a mutating tool");
                continue;
            }
            allowed.push(tool.to_string());
        }
        Self { allowed }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }
}

fn is_mutating(tool: &str) -> bool {
    // Scoped forms like `Bash(git log:*)` are still the mutating tool
    let base = tool.split('(').next().unwrap_or(tool).trim();
    MUTATING_TOOLS.iter().any(|m| m.eq_ignore_ascii_case(base))
}

/// Arguments for `claude` (program name excluded)
pub fn build_args(invocation: &Invocation, policy: &ToolPolicy) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--include-partial-messages".to_string(),
        "--model".to_string(),
        invocation.model.clone(),
    ];

    if !policy.allowed().is_empty() {
        args.push("--allowedTools".to_string());
        args.push(policy.allowed().join(","));
    }
    args.push("--disallowedTools".to_string());
    args.push(MUTATING_TOOLS.join(","));

    if let Some(session_id) = &invocation.resume {
        args.push("--resume".to_string());
        args.push(session_id.clone());
    }

    args
}
