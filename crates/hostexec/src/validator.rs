//! Static validation of untrusted shell text against a whitelist.
//!
//! The text is parsed with the tree-sitter bash grammar and never executed.
//! Only a single statement is accepted, made of one simple call or a `|`
//! pipeline of simple calls, where every word is a literal (optionally
//! single- or double-quoted) and every command name is whitelisted.
//!
//! Anything the checker does not positively recognise is rejected, so new
//! grammar constructs fail closed.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tree_sitter::{Node, Parser};

use crate::whitelist::Whitelist;

/// Characters that may not appear in unquoted or double-quoted literal text.
const FORBIDDEN_CHARS: &[char] = &[
    '~', '$', '`', '\\', '|', '&', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?',
];

/// Category of a rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectKind {
    /// Expansions, substitutions, redirects, chaining and similar constructs
    UnsafeSyntax,
    /// A command name is not in the whitelist
    NotWhitelisted,
    /// The text is empty or does not parse
    Malformed,
    /// The parser panicked on the input
    ParserPanic,
}

/// A command was rejected by policy.
///
/// This type is the only error [`validate`] returns; callers that just need
/// "allowed or not" can branch on `Result::is_err`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("command rejected by policy: {reason}")]
pub struct ValidationError {
    kind: RejectKind,
    reason: String,
}

impl ValidationError {
    fn new(kind: RejectKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    fn unsafe_syntax(reason: impl Into<String>) -> Self {
        Self::new(RejectKind::UnsafeSyntax, reason)
    }

    fn malformed(reason: impl Into<String>) -> Self {
        Self::new(RejectKind::Malformed, reason)
    }

    /// The category of the rejection.
    pub fn kind(&self) -> RejectKind {
        self.kind
    }

    /// Human-readable explanation.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// One command of a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineStage {
    /// The command name exactly as written
    pub command_name: String,
    /// Arguments with quoting removed
    pub args: Vec<String>,
}

/// A command that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedCommand {
    raw: String,
    stages: Vec<PipelineStage>,
}

impl ValidatedCommand {
    /// The original text, to be handed to the shell unmodified.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The pipeline stages in order.
    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// Consume and return the original text.
    pub fn into_raw(self) -> String {
        self.raw
    }
}

/// Validate `raw` against `whitelist`.
///
/// Pure function: no process is spawned and no state is kept, so the same
/// input always yields the same verdict. Parser panics are caught and turned
/// into a [`RejectKind::ParserPanic`] rejection.
pub fn validate(raw: &str, whitelist: &Whitelist) -> Result<ValidatedCommand, ValidationError> {
    catch_panic(|| {
        let stages = Checker::new(raw, whitelist).check()?;
        Ok(ValidatedCommand {
            raw: raw.to_string(),
            stages,
        })
    })
}

fn catch_panic<T>(
    f: impl FnOnce() -> Result<T, ValidationError>,
) -> Result<T, ValidationError> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(ValidationError::new(
            RejectKind::ParserPanic,
            format!("recovered from parser panic: {}", panic_message(payload.as_ref())),
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Node kinds rejected wherever they appear in the tree.
fn forbidden_construct(kind: &str) -> Option<&'static str> {
    let what = match kind {
        "subshell" => "subshells",
        "command_substitution" => "command substitution",
        "process_substitution" => "process substitution",
        "arithmetic_expansion" => "arithmetic expansion",
        "simple_expansion" | "expansion" => "parameter expansion",
        "extglob_pattern" => "extended globs",
        "brace_expression" => "brace expansion",
        "redirected_statement" | "file_redirect" | "heredoc_redirect" | "herestring_redirect" => {
            "redirects"
        }
        "ansi_c_string" | "translated_string" => "dollar quoting",
        _ => return None,
    };
    Some(what)
}

/// Reject literal text containing a shell metacharacter.
fn check_chars(text: &str) -> Result<(), ValidationError> {
    match text.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        Some(c) => Err(ValidationError::unsafe_syntax(format!(
            "`{text}` contains forbidden character '{c}'"
        ))),
        None => Ok(()),
    }
}

struct Checker<'a> {
    source: &'a str,
    whitelist: &'a Whitelist,
}

impl<'a> Checker<'a> {
    fn new(source: &'a str, whitelist: &'a Whitelist) -> Self {
        Self { source, whitelist }
    }

    fn check(&self) -> Result<Vec<PipelineStage>, ValidationError> {
        if self.source.trim().is_empty() {
            return Err(ValidationError::malformed("empty command"));
        }
        if self.source.contains('\0') {
            return Err(ValidationError::malformed("NUL byte in command"));
        }
        // The grammar splits words on characters such as '\r' that the
        // shell keeps as part of the word.
        if let Some(c) = self
            .source
            .chars()
            .find(|c| c.is_control() && !matches!(c, '\n' | '\t'))
        {
            return Err(ValidationError::malformed(format!(
                "control character {c:?} not allowed"
            )));
        }

        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_bash::LANGUAGE.into())
            .map_err(|e| ValidationError::malformed(format!("bash grammar unavailable: {e}")))?;
        let tree = parser
            .parse(self.source, None)
            .ok_or_else(|| ValidationError::malformed("parser produced no syntax tree"))?;
        let root = tree.root_node();
        if root.has_error() {
            return Err(ValidationError::malformed("parse error"));
        }

        self.scan(root)?;
        let statement = self.single_statement(root)?;
        self.statement(statement)
    }

    fn text(&self, node: Node<'_>) -> Result<&'a str, ValidationError> {
        self.source
            .get(node.byte_range())
            .ok_or_else(|| ValidationError::malformed("node outside of input"))
    }

    /// Walk every node, rejecting dangerous constructs and literal text
    /// containing shell metacharacters. Iterative so deeply nested input
    /// cannot exhaust the stack.
    fn scan(&self, root: Node<'_>) -> Result<(), ValidationError> {
        let mut cursor = root.walk();
        loop {
            self.scan_node(cursor.node())?;
            if cursor.goto_first_child() {
                continue;
            }
            loop {
                if cursor.goto_next_sibling() {
                    break;
                }
                if !cursor.goto_parent() {
                    return Ok(());
                }
            }
        }
    }

    fn scan_node(&self, node: Node<'_>) -> Result<(), ValidationError> {
        if let Some(what) = forbidden_construct(node.kind()) {
            return Err(ValidationError::unsafe_syntax(format!(
                "{what} not allowed"
            )));
        }
        if matches!(node.kind(), "word" | "string_content" | "number") {
            check_chars(self.text(node)?)?;
        }
        Ok(())
    }

    fn single_statement<'t>(&self, root: Node<'t>) -> Result<Node<'t>, ValidationError> {
        let mut statements = Vec::new();
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            match child.kind() {
                ";" | ";;" => {
                    return Err(ValidationError::unsafe_syntax(
                        "multiple/terminated commands not allowed",
                    ));
                }
                "&" => {
                    return Err(ValidationError::unsafe_syntax(
                        "background '&' not allowed",
                    ));
                }
                "comment" => {
                    return Err(ValidationError::unsafe_syntax("comments not allowed"));
                }
                _ if child.is_named() => statements.push(child),
                _ => {}
            }
        }

        match statements.as_slice() {
            [] => Err(ValidationError::malformed("empty command")),
            [statement] => Ok(*statement),
            many => Err(ValidationError::unsafe_syntax(format!(
                "must be exactly one statement (got {})",
                many.len()
            ))),
        }
    }

    fn statement(&self, node: Node<'_>) -> Result<Vec<PipelineStage>, ValidationError> {
        match node.kind() {
            "command" => Ok(vec![self.call(node)?]),
            "pipeline" => self.pipeline(node),
            "negated_command" => Err(ValidationError::unsafe_syntax(
                "negation '!' not allowed",
            )),
            "list" => Err(ValidationError::unsafe_syntax(
                "command lists ('&&', '||') not allowed",
            )),
            "variable_assignment" | "variable_assignments" => Err(
                ValidationError::unsafe_syntax("inline assignments not allowed"),
            ),
            other => Err(ValidationError::unsafe_syntax(format!(
                "only simple commands and pipelines allowed (got {other})"
            ))),
        }
    }

    fn pipeline(&self, node: Node<'_>) -> Result<Vec<PipelineStage>, ValidationError> {
        let mut stages = Vec::new();
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.is_named() {
                stages.extend(self.statement(child)?);
                continue;
            }
            match child.kind() {
                "|" => {}
                "|&" => {
                    return Err(ValidationError::unsafe_syntax(
                        "coprocess-style pipe '|&' not allowed",
                    ));
                }
                other => {
                    return Err(ValidationError::unsafe_syntax(format!(
                        "unexpected token '{other}' in pipeline"
                    )));
                }
            }
        }
        if stages.len() < 2 {
            return Err(ValidationError::malformed("incomplete pipeline"));
        }
        Ok(stages)
    }

    fn call(&self, node: Node<'_>) -> Result<PipelineStage, ValidationError> {
        let mut name = None;
        let mut args = Vec::new();

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            match child.kind() {
                "command_name" => name = Some(self.command_name(child)?),
                "variable_assignment" => {
                    return Err(ValidationError::unsafe_syntax(
                        "inline assignments not allowed",
                    ));
                }
                _ if child.is_named() => args.push(self.literal(child)?),
                other => {
                    return Err(ValidationError::unsafe_syntax(format!(
                        "unexpected token '{other}' in command"
                    )));
                }
            }
        }

        let command_name = name.ok_or_else(|| ValidationError::malformed("empty call"))?;
        if command_name == "coproc" {
            return Err(ValidationError::unsafe_syntax("coprocess not allowed"));
        }
        if !self.whitelist.contains(&command_name) {
            return Err(ValidationError::new(
                RejectKind::NotWhitelisted,
                format!("command {command_name:?} is not whitelisted"),
            ));
        }

        Ok(PipelineStage { command_name, args })
    }

    fn command_name(&self, node: Node<'_>) -> Result<String, ValidationError> {
        match (node.named_child_count(), node.named_child(0)) {
            (1, Some(word)) if word.kind() == "word" => Ok(self.text(word)?.to_string()),
            _ => Err(ValidationError::unsafe_syntax(
                "command name must be a plain word",
            )),
        }
    }

    /// Reduce an argument word to its literal value. Only bare words,
    /// single-quoted and double-quoted text (and concatenations of those)
    /// are accepted; expansions are rejected even inside quotes.
    fn literal(&self, node: Node<'_>) -> Result<String, ValidationError> {
        match node.kind() {
            "word" | "number" if node.named_child_count() == 0 => {
                Ok(self.text(node)?.to_string())
            }
            "raw_string" => {
                let text = self.text(node)?;
                text.strip_prefix('\'')
                    .and_then(|t| t.strip_suffix('\''))
                    .map(str::to_string)
                    .ok_or_else(|| ValidationError::malformed("unterminated single quote"))
            }
            "string" => {
                let mut cursor = node.walk();
                for part in node.children(&mut cursor) {
                    if !matches!(part.kind(), "\"" | "string_content") {
                        return Err(ValidationError::unsafe_syntax(format!(
                            "{} not allowed inside double quotes",
                            part.kind()
                        )));
                    }
                }
                // Newlines and the blanks after them fall between
                // string_content nodes, so take the value from the source.
                let value = self
                    .text(node)?
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                    .ok_or_else(|| ValidationError::malformed("unterminated double quote"))?;
                check_chars(value)?;
                Ok(value.to_string())
            }
            "concatenation" => {
                let mut value = String::new();
                let mut cursor = node.walk();
                for part in node.children(&mut cursor) {
                    if !part.is_named() {
                        return Err(ValidationError::unsafe_syntax(format!(
                            "unexpected token '{}' in word",
                            part.kind()
                        )));
                    }
                    value.push_str(&self.literal(part)?);
                }
                Ok(value)
            }
            other => Err(ValidationError::unsafe_syntax(format!(
                "argument of kind {other} is not a plain literal"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn whitelist() -> Whitelist {
        ["echo", "ls", "cat", "tar", "sleep", "grep", "wc"]
            .into_iter()
            .collect()
    }

    fn accept(input: &str) -> ValidatedCommand {
        match validate(input, &whitelist()) {
            Ok(cmd) => cmd,
            Err(e) => panic!("expected {input:?} to be accepted, got: {e}"),
        }
    }

    fn reject(input: &str) -> ValidationError {
        match validate(input, &whitelist()) {
            Ok(cmd) => panic!("expected {input:?} to be rejected, got: {cmd:?}"),
            Err(e) => e,
        }
    }

    fn stage(name: &str, args: &[&str]) -> PipelineStage {
        PipelineStage {
            command_name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_simple_echo() {
        let cmd = accept("echo hello world");
        assert_eq!(cmd.stages(), &[stage("echo", &["hello", "world"])]);
        assert_eq!(cmd.raw(), "echo hello world");
    }

    #[test]
    fn test_flags_and_paths() {
        let cmd = accept("ls -la /tmp");
        assert_eq!(cmd.stages(), &[stage("ls", &["-la", "/tmp"])]);
    }

    #[test]
    fn test_pipeline_accepted() {
        let cmd = accept("ls | grep foo");
        assert_eq!(
            cmd.stages(),
            &[stage("ls", &[]), stage("grep", &["foo"])]
        );
    }

    #[test]
    fn test_three_stage_pipeline() {
        let cmd = accept("cat /var/log/syslog | grep bgp | wc -l");
        let names: Vec<_> = cmd.stages().iter().map(|s| s.command_name.as_str()).collect();
        assert_eq!(names, vec!["cat", "grep", "wc"]);
    }

    #[test]
    fn test_pipeline_second_stage_not_whitelisted() {
        let err = reject("ls | rm -rf /");
        assert_eq!(err.kind(), RejectKind::NotWhitelisted);
    }

    #[test]
    fn test_quoting_is_removed() {
        let cmd = accept("echo 'a b' \"c d\"");
        assert_eq!(cmd.stages(), &[stage("echo", &["a b", "c d"])]);
    }

    #[test]
    fn test_nested_quotes() {
        let cmd = accept("echo \"it's\" 'say \"hi\"'");
        assert_eq!(cmd.stages(), &[stage("echo", &["it's", "say \"hi\""])]);
    }

    #[test]
    fn test_concatenated_quotes() {
        let cmd = accept("grep --regexp=\"bgp\" file");
        assert_eq!(cmd.stages(), &[stage("grep", &["--regexp=bgp", "file"])]);
    }

    #[test]
    fn test_single_quotes_keep_metacharacters_inert() {
        let cmd = accept("grep 'up|down' /tmp/status");
        assert_eq!(cmd.stages(), &[stage("grep", &["up|down", "/tmp/status"])]);
    }

    #[test]
    fn test_metacharacters_in_double_quotes_rejected() {
        assert_eq!(reject("grep \"up|down\" f").kind(), RejectKind::UnsafeSyntax);
    }

    #[test]
    fn test_command_substitution() {
        assert_eq!(reject("echo $(whoami)").kind(), RejectKind::UnsafeSyntax);
        assert_eq!(reject("echo `date`").kind(), RejectKind::UnsafeSyntax);
        assert_eq!(reject("echo \"$(id)\"").kind(), RejectKind::UnsafeSyntax);
    }

    #[test]
    fn test_expansions() {
        assert_eq!(reject("echo \"$HOME\"").kind(), RejectKind::UnsafeSyntax);
        assert_eq!(reject("echo ${HOME}").kind(), RejectKind::UnsafeSyntax);
        assert_eq!(reject("echo $((1 + 2))").kind(), RejectKind::UnsafeSyntax);
        assert!(validate("echo {a,b}", &whitelist()).is_err());
        assert_eq!(reject("echo ~").kind(), RejectKind::UnsafeSyntax);
    }

    #[test]
    fn test_globs() {
        assert_eq!(reject("ls *.go").kind(), RejectKind::UnsafeSyntax);
        assert_eq!(reject("ls file?.txt").kind(), RejectKind::UnsafeSyntax);
        assert!(validate("ls [ab].txt", &whitelist()).is_err());
    }

    #[test]
    fn test_not_whitelisted() {
        let err = reject("rm -rf /");
        assert_eq!(err.kind(), RejectKind::NotWhitelisted);
        assert!(err.reason().contains("rm"));

        assert_eq!(reject("sh -c 'rm -rf /'").kind(), RejectKind::NotWhitelisted);
    }

    #[test]
    fn test_absolute_path_must_match_exactly() {
        assert_eq!(reject("/bin/ls -l").kind(), RejectKind::NotWhitelisted);

        let with_path: Whitelist = ["/bin/ls"].into_iter().collect();
        let cmd = validate("/bin/ls -l", &with_path).unwrap();
        assert_eq!(cmd.stages(), &[stage("/bin/ls", &["-l"])]);
    }

    #[test]
    fn test_quoted_command_name_rejected() {
        assert!(validate("'ls' -l", &whitelist()).is_err());
    }

    #[test]
    fn test_chaining_and_control_operators() {
        for input in [
            "echo a; echo b",
            "echo a;",
            "echo a && echo b",
            "echo a || echo b",
            "sleep 1 &",
            "! ls",
            "(ls)",
            "{ ls; }",
            "ls |& cat",
        ] {
            let err = reject(input);
            assert_eq!(err.kind(), RejectKind::UnsafeSyntax, "input {input:?}: {err}");
        }
    }

    #[test]
    fn test_redirects() {
        for input in ["cat file1 > out", "cat < /etc/passwd", "echo hi 2>&1", "cat <<< hi"] {
            assert!(validate(input, &whitelist()).is_err(), "input {input:?}");
        }
        assert!(validate("cat <(ls)", &whitelist()).is_err());
    }

    #[test]
    fn test_inline_assignment() {
        assert_eq!(reject("PATH=/tmp ls").kind(), RejectKind::UnsafeSyntax);
        assert!(validate("FOO=bar", &whitelist()).is_err());
    }

    #[test]
    fn test_escapes_rejected() {
        assert!(validate("echo \\; rm -rf /", &whitelist()).is_err());
        assert!(validate("echo a\\ b", &whitelist()).is_err());
    }

    #[test]
    fn test_multi_line_input() {
        assert!(validate("echo a\necho b", &whitelist()).is_err());
        // A newline inside quotes is just text.
        let cmd = accept("echo \"a\nb\"");
        assert_eq!(cmd.stages(), &[stage("echo", &["a\nb"])]);
    }

    #[test]
    fn test_double_quoted_newlines_kept_verbatim() {
        let cmd = accept("grep \"x\ny\" f");
        assert_eq!(cmd.stages(), &[stage("grep", &["x\ny", "f"])]);

        let cmd = accept("echo \"a\n \"");
        assert_eq!(cmd.stages(), &[stage("echo", &["a\n "])]);

        let cmd = accept("echo \"a\n\n  b c\"");
        assert_eq!(cmd.stages(), &[stage("echo", &["a\n\n  b c"])]);
    }

    #[test]
    fn test_metacharacters_after_quoted_newline_rejected() {
        for input in [
            "echo \"a\n$HOME\"",
            "echo \"a\n`id`\"",
            "echo \"a\n;\"",
            "echo \"a\n*\"",
            "echo \"a\n~\"",
        ] {
            assert!(validate(input, &whitelist()).is_err(), "input {input:?}");
        }
    }

    #[test]
    fn test_nul_byte_rejected() {
        assert_eq!(reject("echo a\0b").kind(), RejectKind::Malformed);
        assert_eq!(reject("echo 'a\0b'").kind(), RejectKind::Malformed);
    }

    #[test]
    fn test_control_characters_rejected() {
        for input in ["ls\r", "ls\r -l", "echo a\x0bb", "echo \"a\x1bb\""] {
            assert_eq!(reject(input).kind(), RejectKind::Malformed, "input {input:?}");
        }
        accept("ls\t-l");
    }

    #[test]
    fn test_empty_and_whitespace() {
        assert_eq!(reject("").kind(), RejectKind::Malformed);
        assert_eq!(reject("   \t\n").kind(), RejectKind::Malformed);
    }

    #[test]
    fn test_comments_rejected() {
        assert!(validate("ls # list", &whitelist()).is_err());
        assert!(validate("# nothing", &whitelist()).is_err());
    }

    #[test]
    fn test_malformed_input() {
        for input in ["`$\\\\0", "echo \"unterminated", "ls |", "$((", "echo 'open"] {
            assert!(validate(input, &whitelist()).is_err(), "input {input:?}");
        }
    }

    #[test]
    fn test_error_carries_rejected_sentinel_text() {
        let err = reject("echo $(id)");
        assert!(err.to_string().starts_with("command rejected by policy"));
    }

    #[test]
    fn test_idempotent() {
        for input in ["echo hello", "ls | grep x", "echo $(id)", "rm -rf /", ""] {
            let wl = whitelist();
            assert_eq!(validate(input, &wl), validate(input, &wl), "input {input:?}");
        }
    }

    #[test]
    fn test_panic_is_converted_to_rejection() {
        let result: Result<(), ValidationError> = catch_panic(|| panic!("slice index out of range"));
        let err = result.unwrap_err();
        assert_eq!(err.kind(), RejectKind::ParserPanic);
        assert!(err.reason().contains("slice index out of range"));
    }

    #[test]
    fn test_deeply_nested_input_does_not_crash() {
        let input = format!("echo {}{}", "(".repeat(500), ")".repeat(500));
        assert!(validate(&input, &whitelist()).is_err());
    }

    #[test]
    fn test_accepted_commands_obey_invariants() {
        let wl = whitelist();
        let seeds = [
            "echo hello",
            "ls -l /tmp",
            "echo $(id)",
            "`uname`",
            "$(rm -rf /)",
            "ls | grep x",
            "sleep 1 &",
            "echo \"$USER\"",
            "cat <(ls)",
            "FOO=bar echo hi",
            "tar xf archive.tar",
            "echo \\; rm -rf /",
            "echo $(echo nested)",
            "echo ${HOME}",
            "$(echo)",
            "ls *.go",
            "echo > /tmp/x",
            "echo a && echo b",
            "grep 'a;b' file | wc -l",
        ];
        for input in seeds {
            let Ok(cmd) = validate(input, &wl) else {
                continue;
            };
            for stage in cmd.stages() {
                assert!(wl.contains(&stage.command_name), "input {input:?}");
            }
            assert_eq!(cmd.raw(), input);
        }
    }
}
