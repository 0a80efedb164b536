//! Command line templates.
//!
//! A template is a list of arguments that may contain flow variable
//! references (`$(name)`) and staged file placeholders:
//!
//! | placeholder      | resolves to                 |
//! |------------------|-----------------------------|
//! | `%inFile%`       | input port 0 location       |
//! | `%inFile_<N>%`   | input port N location       |
//! | `%outFile%`      | output port 0 location      |
//! | `%outFile_<N>%`  | output port N location      |
//!
//! Placeholders may appear anywhere inside an argument.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const IN_FILE: &str = "%inFile";
const OUT_FILE: &str = "%outFile";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command line is empty")]
    Empty,

    #[error("placeholder '{token}' refers to {kind} port {port}, but only {available} {kind} port(s) are configured")]
    UnknownPort {
        token: String,
        kind: PortKind,
        port: usize,
        available: usize,
    },

    #[error("unknown flow variable '$({0})'")]
    UnknownVariable(String),

    #[error("unterminated flow variable reference in '{0}'")]
    UnterminatedVariable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Input,
    Output,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Input => write!(f, "input"),
            PortKind::Output => write!(f, "output"),
        }
    }
}

/// A staged file placeholder found in an argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub kind: PortKind,
    pub port: usize,
    /// Byte range of the whole token in the argument.
    pub start: usize,
    pub end: usize,
}

impl Placeholder {
    pub fn token<'a>(&self, arg: &'a str) -> &'a str {
        &arg[self.start..self.end]
    }
}

/// Try to parse a placeholder starting at byte `at` of `arg`.
fn placeholder_at(arg: &str, at: usize) -> Option<Placeholder> {
    let rest = &arg[at..];
    let (kind, prefix_len) = if rest.starts_with(IN_FILE) {
        (PortKind::Input, IN_FILE.len())
    } else if rest.starts_with(OUT_FILE) {
        (PortKind::Output, OUT_FILE.len())
    } else {
        return None;
    };

    let tail = &rest[prefix_len..];
    if tail.starts_with('%') {
        return Some(Placeholder {
            kind,
            port: 0,
            start: at,
            end: at + prefix_len + 1,
        });
    }

    let digits = tail.strip_prefix('_')?;
    let len = digits.bytes().take_while(u8::is_ascii_digit).count();
    if len == 0 || !digits[len..].starts_with('%') {
        return None;
    }
    let port = digits[..len].parse().ok()?;
    Some(Placeholder {
        kind,
        port,
        start: at,
        end: at + prefix_len + 1 + len + 1,
    })
}

/// All placeholders of one argument, left to right.
pub fn placeholders(arg: &str) -> Vec<Placeholder> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(offset) = arg[pos..].find('%') {
        let at = pos + offset;
        match placeholder_at(arg, at) {
            Some(placeholder) => {
                pos = placeholder.end;
                found.push(placeholder);
            }
            None => pos = at + 1,
        }
    }
    found
}

/// Check that every placeholder of `template` names an existing port.
pub fn check_placeholders(
    template: &[String],
    input_ports: usize,
    output_ports: usize,
) -> Result<(), CommandError> {
    for arg in template {
        for placeholder in placeholders(arg) {
            let available = match placeholder.kind {
                PortKind::Input => input_ports,
                PortKind::Output => output_ports,
            };
            if placeholder.port >= available {
                return Err(CommandError::UnknownPort {
                    token: placeholder.token(arg).to_string(),
                    kind: placeholder.kind,
                    port: placeholder.port,
                    available,
                });
            }
        }
    }
    Ok(())
}

/// Flow variables by type. Lookups try the integer value first, then the
/// double value, then the string value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowVariables {
    pub int: BTreeMap<String, i64>,
    pub double: BTreeMap<String, f64>,
    pub string: BTreeMap<String, String>,
}

impl FlowVariables {
    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.int.get(name) {
            return Some(value.to_string());
        }
        if let Some(value) = self.double.get(name) {
            return Some(value.to_string());
        }
        self.string.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.int.is_empty() && self.double.is_empty() && self.string.is_empty()
    }

    /// Replace every `$(name)` in `arg`.
    pub fn substitute(&self, arg: &str) -> Result<String, CommandError> {
        let mut out = String::with_capacity(arg.len());
        let mut rest = arg;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find(')')
                .ok_or_else(|| CommandError::UnterminatedVariable(arg.to_string()))?;
            let name = after[..end].trim();
            let value = self
                .lookup(name)
                .ok_or_else(|| CommandError::UnknownVariable(name.to_string()))?;
            out.push_str(&value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// A command line with every variable and placeholder replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    argv: Vec<String>,
}

impl ResolvedCommand {
    pub fn new(argv: Vec<String>) -> Result<Self, CommandError> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(CommandError::Empty);
        }
        Ok(Self { argv })
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

fn replace_placeholders(
    arg: &str,
    inputs: &[String],
    outputs: &[String],
) -> Result<String, CommandError> {
    let mut out = String::with_capacity(arg.len());
    let mut last = 0;
    for placeholder in placeholders(arg) {
        let locations = match placeholder.kind {
            PortKind::Input => inputs,
            PortKind::Output => outputs,
        };
        let location = locations
            .get(placeholder.port)
            .ok_or_else(|| CommandError::UnknownPort {
                token: placeholder.token(arg).to_string(),
                kind: placeholder.kind,
                port: placeholder.port,
                available: locations.len(),
            })?;
        out.push_str(&arg[last..placeholder.start]);
        out.push_str(location);
        last = placeholder.end;
    }
    out.push_str(&arg[last..]);
    Ok(out)
}

/// Resolve `template` for one chunk: substitute flow variables, then replace
/// placeholders with the chunk's staged input/output locations.
pub fn resolve(
    template: &[String],
    variables: &FlowVariables,
    inputs: &[String],
    outputs: &[String],
) -> Result<ResolvedCommand, CommandError> {
    let argv = template
        .iter()
        .map(|arg| {
            let arg = variables.substitute(arg)?;
            replace_placeholders(&arg, inputs, outputs)
        })
        .collect::<Result<Vec<_>, _>>()?;
    ResolvedCommand::new(argv)
}
