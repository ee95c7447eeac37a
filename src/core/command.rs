//! What a task runs.
//!
//! A [`Command`] is one of a closed set of variants (shell command, shell
//! script, python script/module/function, function in a script, workflow
//! task). The canonical string form produced by [`Command::render`] is what
//! users type on the command line, and parsing it gives back the same
//! command.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::Interpreters;
use crate::core::resources::Resources;
use crate::{Error, Result};

/// Only this many leading lines are scanned for a resource annotation.
const RESOURCE_HEADER_LINES: usize = 20;

const RESOURCE_ANNOTATION: &str = "# MQ: resources=";

/// Explicit variant selector for [`create_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    Shell,
    ShellScript,
    PythonScript,
    PythonModule,
    PythonFunction,
    PythonFunctionInScript,
    WorkflowTask,
}

impl std::str::FromStr for CommandType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| Error::InvalidCommand(format!("unknown command type {:?}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CommandKind {
    /// `shell:<cmd>`
    Shell { cmd: String },
    /// `path/to/script.sh`
    ShellScript { script: String },
    /// `path/script.py`
    PythonScript { script: String },
    /// `module.path`
    PythonModule { module: String },
    /// `module.path@function`
    PythonFunction { module: String, function: String },
    /// `path/script.py@function`
    PythonFunctionInScript { script: String, function: String },
    /// `path/workflow.py:task`
    WorkflowTask { script: String, task: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    kind: CommandKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    /// Non-standard name overriding the derived one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

/// Build a command from its command-line form.
///
/// A `+a_b` suffix on the last path component is the old way of encoding
/// arguments in a name; it is folded into `args` (in front).
pub fn create_command(
    raw: &str,
    args: Vec<String>,
    kind: Option<CommandType>,
    name: Option<&str>,
) -> Result<Command> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidCommand("empty command".to_string()));
    }

    let (path, last) = match raw.rfind('/') {
        Some(i) => raw.split_at(i + 1),
        None => ("", raw),
    };

    let mut all_args = Vec::new();
    let base = match last.rfind('+') {
        Some(i) if i + 1 < last.len() && i > 0 => {
            all_args.extend(last[i + 1..].split('_').map(str::to_string));
            &last[..i]
        }
        _ => last,
    };
    all_args.extend(args);
    let cmd = format!("{}{}", path, base);

    let kind = match kind.unwrap_or_else(|| detect(&cmd, !path.is_empty())) {
        CommandType::Shell => CommandKind::Shell {
            cmd: non_empty(cmd.strip_prefix("shell:").unwrap_or(&cmd), raw)?,
        },
        CommandType::ShellScript => CommandKind::ShellScript { script: cmd },
        CommandType::PythonScript => CommandKind::PythonScript { script: cmd },
        CommandType::PythonModule => CommandKind::PythonModule { module: cmd },
        CommandType::PythonFunction => {
            let (module, function) = split_pair(&cmd, '@', raw)?;
            CommandKind::PythonFunction { module, function }
        }
        CommandType::PythonFunctionInScript => {
            let (script, function) = split_pair(&cmd, '@', raw)?;
            CommandKind::PythonFunctionInScript { script, function }
        }
        CommandType::WorkflowTask => {
            let rest = cmd.strip_prefix("workflow:").unwrap_or(&cmd);
            let (script, task) = split_pair(rest, ':', raw)?;
            CommandKind::WorkflowTask { script, task }
        }
    };

    let mut command = Command::new(kind, all_args);
    if let Some(name) = name {
        command.set_non_standard_name(name);
    }
    Ok(command)
}

fn detect(cmd: &str, has_dir: bool) -> CommandType {
    if cmd.starts_with("shell:") {
        return CommandType::Shell;
    }
    if cmd.starts_with("workflow:") {
        return CommandType::WorkflowTask;
    }
    if let Some((left, _)) = cmd.rsplit_once(':') {
        if left.ends_with(".py") {
            return CommandType::WorkflowTask;
        }
    }
    if let Some((left, _)) = cmd.rsplit_once('@') {
        return if left.ends_with(".py") {
            CommandType::PythonFunctionInScript
        } else {
            CommandType::PythonFunction
        };
    }
    if cmd.ends_with(".py") {
        CommandType::PythonScript
    } else if has_dir {
        CommandType::ShellScript
    } else {
        CommandType::PythonModule
    }
}

fn split_pair(s: &str, sep: char, raw: &str) -> Result<(String, String)> {
    match s.rsplit_once(sep) {
        Some((left, right)) if !left.is_empty() && !right.is_empty() => {
            Ok((left.to_string(), right.to_string()))
        }
        _ => Err(Error::InvalidCommand(format!(
            "expected '<x>{}<y>' in {:?}",
            sep, raw
        ))),
    }
}

fn non_empty(s: &str, raw: &str) -> Result<String> {
    if s.is_empty() {
        Err(Error::InvalidCommand(format!("nothing to run in {:?}", raw)))
    } else {
        Ok(s.to_string())
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl Command {
    pub fn new(kind: CommandKind, args: Vec<String>) -> Self {
        Self {
            kind,
            args,
            name: None,
        }
    }

    /// Parse the canonical form: the command followed by its arguments.
    pub fn parse(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let head = words
            .next()
            .ok_or_else(|| Error::InvalidCommand("empty command".to_string()))?;
        create_command(head, words.map(str::to_string).collect(), None, None)
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn set_non_standard_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn has_non_standard_name(&self) -> bool {
        self.name.is_some()
    }

    fn base_name(&self) -> String {
        match &self.kind {
            CommandKind::Shell { cmd } => format!("shell:{}", cmd),
            CommandKind::ShellScript { script } | CommandKind::PythonScript { script } => {
                file_name(script).to_string()
            }
            CommandKind::PythonModule { module } => module.clone(),
            CommandKind::PythonFunction { module, function } => {
                format!("{}@{}", module, function)
            }
            CommandKind::PythonFunctionInScript { script, function } => {
                format!("{}@{}", file_name(script), function)
            }
            CommandKind::WorkflowTask { task, .. } => task.clone(),
        }
    }

    /// Task name: base name plus `+arg1_arg2`, unless overridden.
    pub fn name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let base = self.base_name();
        if self.args.is_empty() {
            base
        } else {
            format!("{}+{}", base, self.args.join("_"))
        }
    }

    /// Name without arguments; used for output and error file names.
    pub fn short_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.base_name())
    }

    /// Canonical form, the inverse of [`Command::parse`].
    pub fn render(&self) -> String {
        let head = match &self.kind {
            CommandKind::Shell { cmd } => format!("shell:{}", cmd),
            CommandKind::ShellScript { script } | CommandKind::PythonScript { script } => {
                script.clone()
            }
            CommandKind::PythonModule { module } => module.clone(),
            CommandKind::PythonFunction { module, function } => {
                format!("{}@{}", module, function)
            }
            CommandKind::PythonFunctionInScript { script, function } => {
                format!("{}@{}", script, function)
            }
            CommandKind::WorkflowTask { script, task } => {
                if script.ends_with(".py") {
                    format!("{}:{}", script, task)
                } else {
                    format!("workflow:{}:{}", script, task)
                }
            }
        };
        std::iter::once(head)
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The line a job script executes for this command.
    pub fn invocation(&self, interpreters: &Interpreters, processes: u32) -> String {
        let python = if processes > 1 {
            &interpreters.parallel_python
        } else {
            &interpreters.serial_python
        };
        let args = self.args.join(" ");
        let with_args = |head: String| {
            if args.is_empty() {
                head
            } else {
                format!("{} {}", head, args)
            }
        };
        let line = match &self.kind {
            CommandKind::Shell { cmd } => with_args(cmd.clone()),
            CommandKind::ShellScript { script } => with_args(script.clone()),
            CommandKind::PythonScript { script } => with_args(format!("{} {}", python, script)),
            CommandKind::PythonModule { module } => with_args(format!("{} -m {}", python, module)),
            CommandKind::PythonFunction { module, function } => format!(
                "{} -c \"import {m}; {m}.{f}({a})\"",
                python,
                m = module,
                f = function,
                a = self.args.join(", ")
            ),
            CommandKind::PythonFunctionInScript { script, function } => format!(
                "{} -c \"import runpy; runpy.run_path('{}')['{}']({})\"",
                python,
                script,
                function,
                self.args.join(", ")
            ),
            CommandKind::WorkflowTask { script, .. } => {
                return format!(
                    "{} run-task {} {}",
                    interpreters.workflow_runner,
                    script,
                    self.name()
                );
            }
        };
        if processes > 1 {
            format!("{} -n {} {}", interpreters.mpiexec, processes, line)
        } else {
            line
        }
    }

    /// The file whose header may declare resources, relative to `folder`.
    fn resource_file(&self, folder: &Path) -> Option<PathBuf> {
        match &self.kind {
            CommandKind::Shell { .. } => None,
            CommandKind::ShellScript { script }
            | CommandKind::PythonScript { script }
            | CommandKind::PythonFunctionInScript { script, .. }
            | CommandKind::WorkflowTask { script, .. } => Some(folder.join(script)),
            CommandKind::PythonModule { module } | CommandKind::PythonFunction { module, .. } => {
                Some(folder.join(format!("{}.py", module.replace('.', "/"))))
            }
        }
    }

    /// Read a `# MQ: resources=<spec>` line from the target file's header.
    pub fn read_resources(&self, folder: &Path) -> Result<Option<Resources>> {
        let Some(path) = self.resource_file(folder) else {
            return Ok(None);
        };
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::InvalidData) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        for line in text.lines().take(RESOURCE_HEADER_LINES) {
            if let Some(spec) = line.trim_end().strip_prefix(RESOURCE_ANNOTATION) {
                return spec.trim().parse().map(Some);
            }
        }
        Ok(None)
    }

    pub fn to_dict(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_dict(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}
