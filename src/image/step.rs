//! Normalization of parsed Dockerfile instructions.
//!
//! The external parser hands back typed instructions plus source spans; the
//! engine works on a flattened view of them: a [`Command`] tag, argument
//! tokens, `--flag=value` strings, and the original line text. The original
//! text doubles as the layer cache's content-addressing key, so it is
//! reconstructed the same way when writing history and when matching it.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dockerfile_parser::{
    BreakableString, BreakableStringComponent, Dockerfile, Instruction, ShellOrExecExpr, Span,
};

use crate::builder::Healthcheck;

/// The closed set of instructions the dispatcher understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    From,
    Run,
    Copy,
    Add,
    Volume,
    Env,
    Label,
    User,
    Workdir,
    Cmd,
    Entrypoint,
    Expose,
    StopSignal,
    Healthcheck,
    Shell,
    Onbuild,
    Maintainer,
    Arg,
    Unknown(String),
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::From => "FROM",
            Command::Run => "RUN",
            Command::Copy => "COPY",
            Command::Add => "ADD",
            Command::Volume => "VOLUME",
            Command::Env => "ENV",
            Command::Label => "LABEL",
            Command::User => "USER",
            Command::Workdir => "WORKDIR",
            Command::Cmd => "CMD",
            Command::Entrypoint => "ENTRYPOINT",
            Command::Expose => "EXPOSE",
            Command::StopSignal => "STOPSIGNAL",
            Command::Healthcheck => "HEALTHCHECK",
            Command::Shell => "SHELL",
            Command::Onbuild => "ONBUILD",
            Command::Maintainer => "MAINTAINER",
            Command::Arg => "ARG",
            Command::Unknown(name) => name.as_str(),
        };
        f.write_str(name)
    }
}

/// One instruction of a stage, before build-arg resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub command: Command,
    /// The instruction as written, continuations collapsed, trailing
    /// whitespace trimmed.
    pub original: String,
    /// `--flag=value` strings preceding the arguments.
    pub flags: Vec<String>,
    /// Argument tokens. ENV and LABEL alternate key, value.
    pub args: Vec<String>,
    /// Argument text before tokenization; ONBUILD and HEALTHCHECK need it.
    pub raw_args: String,
    /// True when the arguments were written in JSON (exec) form.
    pub exec_form: bool,
}

/// A [`Node`] with build-arg and environment references substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub command: Command,
    pub original: String,
    pub flags: Vec<String>,
    pub args: Vec<String>,
    pub raw_args: String,
    pub exec_form: bool,
}

/// One `FROM`…(next `FROM` or EOF) span of the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStage {
    /// Position in declaration order.
    pub position: usize,
    /// The `AS` alias, or the decimal position for anonymous stages.
    pub name: String,
    /// Base image, with global build args already substituted.
    pub from: String,
    pub children: Vec<Node>,
}

impl BuildStage {
    /// Whether the stage carries a real `AS` name rather than its index.
    pub fn has_alias(&self) -> bool {
        self.name.parse::<usize>().is_err()
    }
}

/// Substitute build-arg and environment references in `node`'s arguments and
/// flag values. ONBUILD arguments are deferred to the child build untouched.
pub fn resolve_step(node: &Node, vars: &BTreeMap<String, String>) -> Step {
    let expand_all = |items: &[String]| items.iter().map(|s| expand(s, vars)).collect();
    if node.command == Command::Onbuild {
        return Step {
            command: node.command.clone(),
            original: node.original.clone(),
            flags: node.flags.clone(),
            args: node.args.clone(),
            raw_args: node.raw_args.clone(),
            exec_form: node.exec_form,
        };
    }
    Step {
        command: node.command.clone(),
        original: node.original.clone(),
        flags: expand_all(&node.flags),
        args: expand_all(&node.args),
        raw_args: expand(&node.raw_args, vars),
        exec_form: node.exec_form,
    }
}

/// Expand `$NAME` and `${NAME}` references; `\$` escapes a literal dollar.
/// Undefined names expand to the empty string.
pub fn expand(input: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' => match chars.peek() {
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    for n in chars.by_ref() {
                        if n == '}' {
                            break;
                        }
                        name.push(n);
                    }
                    if let Some(value) = vars.get(&name) {
                        out.push_str(value);
                    }
                }
                Some(&n) if n.is_ascii_alphabetic() || n == '_' => {
                    let mut name = String::new();
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_alphanumeric() || n == '_' {
                            name.push(n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if let Some(value) = vars.get(&name) {
                        out.push_str(value);
                    }
                }
                _ => out.push('$'),
            },
            _ => out.push(c),
        }
    }
    out
}

/// Whether any of `nodes` would start a process in the working container.
/// Volume preservation is skipped for purely-metadata instruction tails.
pub fn requires_start(nodes: &[Node]) -> bool {
    nodes.iter().any(|n| n.command == Command::Run)
}

/// The history string a commit for `node` is recorded (and later matched)
/// under.
pub fn created_by(node: &Node) -> String {
    if node.command == Command::Run {
        format!("/bin/sh -c {}", strip_command_word(&node.original))
    } else {
        format!("/bin/sh -c #(nop) {}", node.original)
    }
}

/// The instruction text without its leading command word; history entries for
/// RUN record the command only.
pub fn strip_command_word(original: &str) -> &str {
    let trimmed = original.trim_start();
    match trimmed.find(char::is_whitespace) {
        Some(at) => trimmed[at..].trim_start(),
        None => "",
    }
}

/// Default values of args declared before the first `FROM`, overridden by the
/// caller-provided arg map. Used to substitute references in `FROM` lines.
pub fn global_arg_values(
    dockerfile: &Dockerfile,
    provided: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for arg in &dockerfile.global_args {
        let name = arg.name.content.clone();
        let value = provided
            .get(&name)
            .cloned()
            .or_else(|| arg.value.as_ref().map(|v| v.content.clone()));
        if let Some(value) = value {
            values.insert(name, value);
        }
    }
    values
}

/// Names of args declared before the first `FROM`.
pub fn global_arg_names(dockerfile: &Dockerfile) -> Vec<String> {
    dockerfile
        .global_args
        .iter()
        .map(|arg| arg.name.content.clone())
        .collect()
}

/// Split the parsed instruction stream into stages, normalizing every
/// instruction into a [`Node`]. `content` must be the exact text the
/// Dockerfile was parsed from; spans index into it.
pub fn split_stages(
    dockerfile: &Dockerfile,
    content: &str,
    from_args: &BTreeMap<String, String>,
) -> Result<Vec<BuildStage>> {
    let mut stages = Vec::new();
    for stage in dockerfile.stages() {
        let name = stage
            .name
            .clone()
            .unwrap_or_else(|| stage.index.to_string());
        let mut from = String::new();
        let mut children = Vec::new();
        for instruction in &stage.instructions {
            if let Instruction::From(f) = instruction {
                from = expand(f.image.content.trim(), from_args);
                continue;
            }
            children.push(node_from_instruction(instruction, content)?);
        }
        if from.is_empty() {
            bail!("stage {} has no base image", name);
        }
        stages.push(BuildStage {
            position: stage.index,
            name,
            from,
            children,
        });
    }
    Ok(stages)
}

fn instruction_span(instruction: &Instruction) -> Span {
    match instruction {
        Instruction::From(i) => i.span,
        Instruction::Arg(i) => i.span,
        Instruction::Label(i) => i.span,
        Instruction::Run(i) => i.span,
        Instruction::Entrypoint(i) => i.span,
        Instruction::Cmd(i) => i.span,
        Instruction::Copy(i) => i.span,
        Instruction::Env(i) => i.span,
        Instruction::Misc(i) => i.span,
    }
}

/// Reconstruct the single-line form of an instruction from its source span:
/// line continuations collapse to one space, trailing whitespace is dropped.
fn original_text(content: &str, span: Span) -> String {
    let raw = &content[span.start..span.end.min(content.len())];
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && matches!(chars.peek(), Some('\n' | '\r')) {
            while matches!(chars.peek(), Some('\n' | '\r' | ' ' | '\t')) {
                chars.next();
            }
            out.push(' ');
        } else if c == '\n' || c == '\r' {
            while matches!(chars.peek(), Some(' ' | '\t')) {
                chars.next();
            }
            out.push(' ');
        } else {
            out.push(c);
        }
    }
    out.trim_end().to_string()
}

fn breakable_to_string(value: &BreakableString) -> String {
    let mut parts = Vec::new();
    for component in &value.components {
        if let BreakableStringComponent::String(s) = component {
            let piece = s.content.trim();
            if !piece.is_empty() {
                parts.push(piece.to_string());
            }
        }
    }
    parts.join(" ")
}

fn shell_or_exec(expr: &ShellOrExecExpr) -> (Vec<String>, bool) {
    match expr {
        ShellOrExecExpr::Shell(shell) => (vec![breakable_to_string(shell)], false),
        ShellOrExecExpr::Exec(exec) => {
            (exec.as_str_vec().iter().map(|s| s.to_string()).collect(), true)
        }
    }
}

fn node_from_instruction(instruction: &Instruction, content: &str) -> Result<Node> {
    let original = original_text(content, instruction_span(instruction));
    let node = match instruction {
        Instruction::From(_) => bail!("unexpected FROM inside a stage body"),
        Instruction::Run(run) => {
            let (args, exec_form) = shell_or_exec(&run.expr);
            Node {
                command: Command::Run,
                raw_args: args.join(" "),
                args,
                flags: Vec::new(),
                exec_form,
                original,
            }
        }
        Instruction::Cmd(cmd) => {
            let (args, exec_form) = shell_or_exec(&cmd.expr);
            Node {
                command: Command::Cmd,
                raw_args: args.join(" "),
                args,
                flags: Vec::new(),
                exec_form,
                original,
            }
        }
        Instruction::Entrypoint(entrypoint) => {
            let (args, exec_form) = shell_or_exec(&entrypoint.expr);
            Node {
                command: Command::Entrypoint,
                raw_args: args.join(" "),
                args,
                flags: Vec::new(),
                exec_form,
                original,
            }
        }
        Instruction::Copy(copy) => {
            let flags = copy
                .flags
                .iter()
                .map(|f| format!("--{}={}", f.name.content, f.value.content))
                .collect();
            let mut args: Vec<String> =
                copy.sources.iter().map(|s| s.content.clone()).collect();
            args.push(copy.destination.content.clone());
            Node {
                command: Command::Copy,
                raw_args: args.join(" "),
                args,
                flags,
                exec_form: false,
                original,
            }
        }
        Instruction::Env(env) => {
            let mut args = Vec::new();
            for var in &env.vars {
                args.push(var.key.content.clone());
                args.push(breakable_to_string(&var.value));
            }
            Node {
                command: Command::Env,
                raw_args: args.join(" "),
                args,
                flags: Vec::new(),
                exec_form: false,
                original,
            }
        }
        Instruction::Label(label) => {
            let mut args = Vec::new();
            for entry in &label.labels {
                args.push(entry.name.content.clone());
                args.push(entry.value.content.clone());
            }
            Node {
                command: Command::Label,
                raw_args: args.join(" "),
                args,
                flags: Vec::new(),
                exec_form: false,
                original,
            }
        }
        Instruction::Arg(arg) => {
            let spec = match &arg.value {
                Some(value) => format!("{}={}", arg.name.content, value.content),
                None => arg.name.content.clone(),
            };
            Node {
                command: Command::Arg,
                raw_args: spec.clone(),
                args: vec![spec],
                flags: Vec::new(),
                exec_form: false,
                original,
            }
        }
        Instruction::Misc(misc) => {
            let command = misc_command(&misc.instruction.content);
            let raw_args = breakable_to_string(&misc.arguments);
            let (flags, rest) = split_leading_flags(&raw_args);
            let (args, exec_form) = if command == Command::Onbuild {
                (vec![rest.clone()], false)
            } else if let Some(elements) = parse_json_array(&rest) {
                (elements, true)
            } else {
                (split_tokens(&rest), false)
            };
            Node {
                command,
                original,
                flags,
                args,
                raw_args: rest,
                exec_form,
            }
        }
    };
    Ok(node)
}

fn misc_command(name: &str) -> Command {
    match name.to_ascii_uppercase().as_str() {
        "ADD" => Command::Add,
        "VOLUME" => Command::Volume,
        "USER" => Command::User,
        "WORKDIR" => Command::Workdir,
        "EXPOSE" => Command::Expose,
        "STOPSIGNAL" => Command::StopSignal,
        "HEALTHCHECK" => Command::Healthcheck,
        "SHELL" => Command::Shell,
        "ONBUILD" => Command::Onbuild,
        "MAINTAINER" => Command::Maintainer,
        other => Command::Unknown(other.to_string()),
    }
}

/// Peel `--flag=value` tokens off the front of an argument string.
fn split_leading_flags(text: &str) -> (Vec<String>, String) {
    let mut flags = Vec::new();
    let mut rest = text.trim_start();
    while rest.starts_with("--") {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        flags.push(rest[..end].to_string());
        rest = rest[end..].trim_start();
    }
    (flags, rest.to_string())
}

fn parse_json_array(text: &str) -> Option<Vec<String>> {
    let trimmed = text.trim();
    if !trimmed.starts_with('[') {
        return None;
    }
    serde_json::from_str::<Vec<String>>(trimmed).ok()
}

/// Split an argument string into tokens, honoring single and double quotes.
pub fn split_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parse a Go-style duration literal: one or more `<number><unit>` segments
/// with units `ns`, `us`, `ms`, `s`, `m`, `h`.
pub fn parse_go_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        bail!("empty duration");
    }
    let mut total = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits == 0 {
            bail!("invalid duration {text:?}");
        }
        let value: f64 = rest[..digits]
            .parse()
            .with_context(|| format!("invalid duration {text:?}"))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => bail!("invalid duration unit {other:?} in {text:?}"),
        };
        total += value * scale;
        rest = &rest[unit_len..];
    }
    Ok(Duration::from_secs_f64(total))
}

/// Parse a resolved HEALTHCHECK step. `Ok(None)` means `HEALTHCHECK NONE`.
pub fn parse_healthcheck(step: &Step) -> Result<Option<Healthcheck>> {
    let mut check = Healthcheck::default();
    for flag in &step.flags {
        let (name, value) = flag
            .trim_start_matches("--")
            .split_once('=')
            .with_context(|| format!("invalid healthcheck flag {flag:?}"))?;
        match name {
            "interval" => check.interval = Some(parse_go_duration(value)?),
            "timeout" => check.timeout = Some(parse_go_duration(value)?),
            "start-period" => check.start_period = Some(parse_go_duration(value)?),
            "retries" => {
                check.retries = value
                    .parse()
                    .with_context(|| format!("invalid healthcheck retries {value:?}"))?
            }
            other => bail!("unknown healthcheck flag {other:?}"),
        }
    }
    let mut args = step.args.iter();
    match args.next().map(|s| s.to_ascii_uppercase()) {
        Some(kind) if kind == "NONE" => Ok(None),
        Some(kind) if kind == "CMD" => {
            let rest = strip_command_word(&step.raw_args);
            if let Some(elements) = parse_json_array(rest) {
                check.test = std::iter::once("CMD".to_string()).chain(elements).collect();
            } else {
                check.test = vec!["CMD-SHELL".to_string(), rest.to_string()];
            }
            Ok(Some(check))
        }
        other => bail!("healthcheck requires CMD or NONE, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use dockerfile_parser::Dockerfile;

    use super::{
        created_by, expand, global_arg_values, parse_go_duration, parse_healthcheck,
        requires_start, resolve_step, split_stages, split_tokens, strip_command_word, Command,
    };

    fn stages_of(content: &str) -> Vec<super::BuildStage> {
        let dockerfile = Dockerfile::parse(content).unwrap();
        split_stages(&dockerfile, content, &BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_split_stages_names_and_children() {
        let stages = stages_of(
            "FROM busybox AS builder\nRUN echo hi\nFROM alpine\nCOPY --from=builder /a /a\n",
        );
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].name, "builder");
        assert!(stages[0].has_alias());
        assert_eq!(stages[0].from, "busybox");
        assert_eq!(stages[0].children.len(), 1);
        assert_eq!(stages[1].name, "1");
        assert!(!stages[1].has_alias());
        let copy = &stages[1].children[0];
        assert_eq!(copy.command, Command::Copy);
        assert_eq!(copy.flags, vec!["--from=builder".to_string()]);
        assert_eq!(copy.args, vec!["/a".to_string(), "/a".to_string()]);
    }

    #[test]
    fn test_misc_instructions_are_normalized() {
        let stages = stages_of(
            "FROM busybox\nVOLUME /data /logs\nWORKDIR /app\nEXPOSE 80/tcp\nADD --chown=1:1 a.txt /app/\n",
        );
        let children = &stages[0].children;
        assert_eq!(children[0].command, Command::Volume);
        assert_eq!(children[0].args, vec!["/data", "/logs"]);
        assert_eq!(children[1].command, Command::Workdir);
        assert_eq!(children[2].command, Command::Expose);
        assert_eq!(children[2].args, vec!["80/tcp"]);
        assert_eq!(children[3].command, Command::Add);
        assert_eq!(children[3].flags, vec!["--chown=1:1"]);
        assert_eq!(children[3].args, vec!["a.txt", "/app/"]);
    }

    #[test]
    fn test_volume_json_form() {
        let stages = stages_of("FROM busybox\nVOLUME [\"/data\", \"/var log\"]\n");
        let volume = &stages[0].children[0];
        assert!(volume.exec_form);
        assert_eq!(volume.args, vec!["/data", "/var log"]);
    }

    #[test]
    fn test_original_collapses_continuations() {
        let stages = stages_of("FROM busybox\nRUN echo a \\\n    && echo b\n");
        let run = &stages[0].children[0];
        assert_eq!(run.original, "RUN echo a && echo b");
        assert_eq!(created_by(run), "/bin/sh -c echo a && echo b");
    }

    #[test]
    fn test_created_by_nop_for_metadata() {
        let stages = stages_of("FROM busybox\nENV A=1\n");
        assert_eq!(
            created_by(&stages[0].children[0]),
            "/bin/sh -c #(nop) ENV A=1"
        );
    }

    #[test]
    fn test_requires_start_lookahead() {
        let stages = stages_of("FROM busybox\nENV A=1\nRUN echo hi\nLABEL a=b\n");
        let children = &stages[0].children;
        assert!(requires_start(&children[0..]));
        assert!(requires_start(&children[1..]));
        assert!(!requires_start(&children[2..]));
    }

    #[test]
    fn test_expand_forms() {
        let mut vars = BTreeMap::new();
        vars.insert("NAME".to_string(), "world".to_string());
        assert_eq!(expand("hello $NAME", &vars), "hello world");
        assert_eq!(expand("hello ${NAME}!", &vars), "hello world!");
        assert_eq!(expand("cost \\$5", &vars), "cost $5");
        assert_eq!(expand("$MISSING.", &vars), ".");
        assert_eq!(expand("a $ b", &vars), "a $ b");
    }

    #[test]
    fn test_resolve_step_expands_args_and_flags() {
        let stages = stages_of("FROM busybox\nCOPY --from=$STAGE src/ /dst/\n");
        let mut vars = BTreeMap::new();
        vars.insert("STAGE".to_string(), "builder".to_string());
        let step = resolve_step(&stages[0].children[0], &vars);
        assert_eq!(step.flags, vec!["--from=builder"]);
    }

    #[test]
    fn test_global_arg_values_prefer_provided() {
        let dockerfile = Dockerfile::parse("ARG BASE=ubuntu\nARG EXTRA\nFROM ${BASE}\n").unwrap();
        let mut provided = BTreeMap::new();
        provided.insert("BASE".to_string(), "alpine".to_string());
        let values = global_arg_values(&dockerfile, &provided);
        assert_eq!(values.get("BASE").map(String::as_str), Some("alpine"));
        assert!(!values.contains_key("EXTRA"));
    }

    #[test]
    fn test_strip_command_word() {
        assert_eq!(strip_command_word("RUN echo hi"), "echo hi");
        assert_eq!(strip_command_word("RUN"), "");
    }

    #[test]
    fn test_split_tokens_quotes() {
        assert_eq!(
            split_tokens("a \"b c\" 'd e' f"),
            vec!["a", "b c", "d e", "f"]
        );
    }

    #[test]
    fn test_parse_go_duration() {
        assert_eq!(parse_go_duration("30s").unwrap().as_secs(), 30);
        assert_eq!(parse_go_duration("1m30s").unwrap().as_secs(), 90);
        assert_eq!(parse_go_duration("500ms").unwrap().as_millis(), 500);
        assert_eq!(parse_go_duration("1.5h").unwrap().as_secs(), 5400);
        assert!(parse_go_duration("5x").is_err());
        assert!(parse_go_duration("").is_err());
    }

    #[test]
    fn test_parse_healthcheck_shell_and_none() {
        let stages = stages_of(
            "FROM busybox\nHEALTHCHECK --interval=30s --retries=3 CMD curl -f http://localhost/\nHEALTHCHECK NONE\n",
        );
        let vars = BTreeMap::new();
        let check = parse_healthcheck(&resolve_step(&stages[0].children[0], &vars))
            .unwrap()
            .unwrap();
        assert_eq!(check.interval.unwrap().as_secs(), 30);
        assert_eq!(check.retries, 3);
        assert_eq!(
            check.test,
            vec!["CMD-SHELL".to_string(), "curl -f http://localhost/".to_string()]
        );
        let none = parse_healthcheck(&resolve_step(&stages[0].children[1], &vars)).unwrap();
        assert!(none.is_none());
    }
}
