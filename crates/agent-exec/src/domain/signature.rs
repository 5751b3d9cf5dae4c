//! Command normalization for timing history and the static fallback table.
//!
//! Two invocations share history when they run the same program with the same
//! argument *shape*: flags are kept, values collapse into placeholders.

use std::collections::BTreeMap;

use super::command::CommandSpec;
use super::history::CommandSignature;
use super::history::Complexity;

const TRIVIAL_PROGRAMS: &[&str] = &[
    "echo", "true", "false", "pwd", "date", "printf", "whoami", "hostname", "uname", "id",
    "printenv", "basename", "dirname",
];

const SIMPLE_PROGRAMS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "stat", "which", "file", "grep", "egrep", "rg", "find",
    "fd", "awk", "sed", "sort", "uniq", "cut", "tr", "diff", "touch", "mkdir", "cp", "mv", "rm",
    "ln", "du", "df", "ps", "jq", "tree", "git",
];

const AGENT_PROGRAMS: &[&str] = &["claude", "codex", "aider", "gemini", "llm", "goose"];

/// Programs whose first positional argument selects behavior (`git status`).
const SUBCOMMAND_PROGRAMS: &[&str] = &[
    "git", "cargo", "npm", "pnpm", "yarn", "docker", "kubectl", "go", "make", "uv", "pip",
    "poetry", "gh", "claude", "codex", "systemctl",
];

const EXTREME_KEYWORDS: &[&str] = &[
    "comprehensive",
    "entire codebase",
    "entire repository",
    "end-to-end",
    "full test suite",
    "from scratch",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "implement",
    "refactor",
    "debug",
    "migrate",
    "design",
    "architect",
    "optimize",
    "analyze",
    "build",
    "create",
];

const SIMPLE_KEYWORDS: &[&str] = &["what is", "list ", "summarize", "explain briefly", "say "];

const LONG_PROMPT_WORDS: usize = 200;
const SHORT_TEXT_WORDS: usize = 8;
const MEDIUM_TEXT_WORDS: usize = 64;

/// Normalized signature: program basename, argument shapes, then metatags.
pub fn signature_for(spec: &CommandSpec) -> CommandSignature {
    let program = spec.program_name().to_ascii_lowercase();
    let keep_subcommand = SUBCOMMAND_PROGRAMS.contains(&program.as_str());

    let mut parts = vec![program];
    let mut positional = 0usize;
    for arg in &spec.arguments {
        let shape = argument_shape(arg, keep_subcommand && positional == 0);
        if !is_flag(arg) {
            positional += 1;
        }
        push_collapsed(&mut parts, shape);
    }

    for (key, value) in metatags(spec) {
        parts.push(format!("#{key}={value}"));
    }
    CommandSignature::new(parts.join(" "))
}

/// Complexity class used when no usable history exists.
pub fn classify(spec: &CommandSpec) -> Complexity {
    if let Some(explicit) = metatags(spec)
        .get("complexity")
        .and_then(|value| value.parse().ok())
    {
        return explicit;
    }

    let program = spec.program_name().to_ascii_lowercase();
    if TRIVIAL_PROGRAMS.contains(&program.as_str()) {
        return Complexity::Trivial;
    }
    if SIMPLE_PROGRAMS.contains(&program.as_str()) {
        return Complexity::Simple;
    }
    if AGENT_PROGRAMS.contains(&program.as_str()) {
        let prompt = spec
            .arguments
            .iter()
            .max_by_key(|arg| arg.len())
            .map(String::as_str)
            .unwrap_or("");
        return classify_prompt(prompt);
    }
    Complexity::Medium
}

fn classify_prompt(prompt: &str) -> Complexity {
    let lower = prompt.to_lowercase();
    let mut complexity = if EXTREME_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Complexity::Extreme
    } else if COMPLEX_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Complexity::Complex
    } else if SIMPLE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Complexity::Simple
    } else {
        Complexity::Medium
    };

    if lower.split_whitespace().count() > LONG_PROMPT_WORDS {
        complexity = complexity.bump();
    }
    if numbered_steps(&lower) >= 3 {
        complexity = complexity.bump();
    }
    complexity
}

fn numbered_steps(text: &str) -> usize {
    text.lines()
        .map(str::trim_start)
        .filter(|line| {
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            digits > 0 && line[digits..].starts_with(['.', ')'])
        })
        .count()
}

/// `[key:value]` tags embedded in any argument; keys are lowercased.
pub fn metatags(spec: &CommandSpec) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for arg in &spec.arguments {
        let mut rest = arg.as_str();
        while let Some(open) = rest.find('[') {
            let after = &rest[open + 1..];
            let Some(close) = after.find(']') else {
                break;
            };
            if let Some((key, value)) = after[..close].split_once(':') {
                let key = key.trim();
                let value = value.trim();
                if is_tag_key(key) && !value.is_empty() {
                    tags.insert(key.to_ascii_lowercase(), value.to_string());
                }
            }
            rest = &after[close + 1..];
        }
    }
    tags
}

fn is_tag_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_flag(arg: &str) -> bool {
    arg.len() > 1 && arg.starts_with('-') && !is_number(arg)
}

fn is_number(arg: &str) -> bool {
    !arg.is_empty() && arg.parse::<f64>().is_ok()
}

fn argument_shape(arg: &str, keep_literal: bool) -> String {
    if is_flag(arg) {
        return match arg.split_once('=') {
            Some((flag, _)) => format!("{flag}=*"),
            None => arg.to_string(),
        };
    }
    if is_number(arg) {
        return "<n>".to_string();
    }
    if arg.chars().any(char::is_whitespace) {
        let words = arg.split_whitespace().count();
        let bucket = if words <= SHORT_TEXT_WORDS {
            "short"
        } else if words <= MEDIUM_TEXT_WORDS {
            "medium"
        } else {
            "long"
        };
        return format!("<text:{bucket}>");
    }
    if looks_like_path(arg) {
        return "<path>".to_string();
    }
    if keep_literal
        && arg.len() <= 32
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return arg.to_ascii_lowercase();
    }
    "<arg>".to_string()
}

fn looks_like_path(arg: &str) -> bool {
    if arg.contains('/') || arg.starts_with('.') || arg.starts_with('~') {
        return true;
    }
    match arg.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn push_collapsed(parts: &mut Vec<String>, shape: String) {
    if shape.starts_with('<') {
        if let Some(last) = parts.last_mut() {
            if *last == shape {
                last.push('+');
                return;
            }
            if last.strip_suffix('+') == Some(shape.as_str()) {
                return;
            }
        }
    }
    parts.push(shape);
}
