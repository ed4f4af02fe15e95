//! Tool option normalizer.
//!
//! Callers describe what they want with tool-agnostic, named options.
//! Each operation carries an [`OptionGrammar`] (data, not code) that says
//! how those options become that tool's flags and where they must sit
//! relative to the target argument. [`render`] is the single interpreter.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OptionError;
use crate::plan::ArgumentVector;

/// A caller-supplied option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Flag(bool),
    Number(i64),
    Text(String),
    List(Vec<String>),
}

impl OptionValue {
    /// Interpret a command-line string: `true`/`false` become flags,
    /// integers become numbers, anything else stays text.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "true" => OptionValue::Flag(true),
            "false" => OptionValue::Flag(false),
            _ => raw
                .parse::<i64>()
                .map(OptionValue::Number)
                .unwrap_or_else(|_| OptionValue::Text(raw.to_string())),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Flag(b) => write!(f, "{b}"),
            OptionValue::Number(n) => write!(f, "{n}"),
            OptionValue::Text(s) => f.write_str(s),
            OptionValue::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Flag(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Number(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(v: Vec<String>) -> Self {
        OptionValue::List(v)
    }
}

impl From<Vec<&str>> for OptionValue {
    fn from(v: Vec<&str>) -> Self {
        OptionValue::List(v.into_iter().map(str::to_string).collect())
    }
}

/// Named options for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolOptions(BTreeMap<String, OptionValue>);

impl ToolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<OptionValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build from `name=value` pairs; a bare `name` sets a flag.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut options = Self::new();
        for pair in pairs {
            match pair.split_once('=') {
                Some((name, raw)) => options.insert(name.trim(), OptionValue::parse(raw)),
                None => options.insert(pair.trim(), true),
            }
        }
        options
    }
}

/// How one option is spelled on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum FlagTemplate {
    /// `--flag` when true, nothing when false.
    Switch { flag: String },
    /// `--flag value`
    Separate { flag: String },
    /// `--flag=value`; `flag` includes the separator.
    Joined { flag: String },
    /// `--flag a --flag b`
    Repeated { flag: String },
    /// `--flag a,b`
    CommaSeparated { flag: String },
    /// Bare values.
    Positional,
}

/// Which side of the target argument an option goes on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    #[default]
    BeforeTarget,
    AfterTarget,
}

/// How the resolved target is handed to the tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPlacement {
    #[default]
    Positional,
    Flag(String),
    /// The tool finds its input on its own (working directory or stdin).
    Omit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionRule {
    pub name: String,
    pub template: FlagTemplate,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl OptionRule {
    fn new(name: &str, template: FlagTemplate) -> Self {
        Self {
            name: name.to_string(),
            template,
            placement: Placement::BeforeTarget,
            required: false,
            description: String::new(),
        }
    }

    pub fn switch(name: &str, flag: &str) -> Self {
        Self::new(name, FlagTemplate::Switch { flag: flag.into() })
    }

    pub fn value(name: &str, flag: &str) -> Self {
        Self::new(name, FlagTemplate::Separate { flag: flag.into() })
    }

    pub fn joined(name: &str, flag: &str) -> Self {
        Self::new(name, FlagTemplate::Joined { flag: flag.into() })
    }

    pub fn repeated(name: &str, flag: &str) -> Self {
        Self::new(name, FlagTemplate::Repeated { flag: flag.into() })
    }

    pub fn comma_list(name: &str, flag: &str) -> Self {
        Self::new(name, FlagTemplate::CommaSeparated { flag: flag.into() })
    }

    pub fn positional(name: &str) -> Self {
        Self::new(name, FlagTemplate::Positional)
    }

    pub fn after_target(mut self) -> Self {
        self.placement = Placement::AfterTarget;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Declarative command-line grammar of one tool operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionGrammar {
    #[serde(default)]
    pub subcommand: Vec<String>,
    /// Arguments always passed, after the subcommand.
    #[serde(default)]
    pub fixed: Vec<String>,
    #[serde(default)]
    pub rules: Vec<OptionRule>,
    #[serde(default)]
    pub target: TargetPlacement,
}

impl OptionGrammar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subcommand(mut self, words: &[&str]) -> Self {
        self.subcommand = words.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn fixed(mut self, args: &[&str]) -> Self {
        self.fixed.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn rule(mut self, rule: OptionRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn target(mut self, placement: TargetPlacement) -> Self {
        self.target = placement;
        self
    }

    pub fn target_flag(self, flag: &str) -> Self {
        self.target(TargetPlacement::Flag(flag.to_string()))
    }

    pub fn no_target(self) -> Self {
        self.target(TargetPlacement::Omit)
    }

    pub fn rule_named(&self, name: &str) -> Option<&OptionRule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

/// Render `options` into `tool`'s argument vector.
///
/// Order: subcommand, fixed arguments, options placed before the target
/// (in grammar order), the target, options placed after it. Unset options
/// produce nothing.
pub fn render(
    tool: &str,
    grammar: &OptionGrammar,
    options: &ToolOptions,
    target_arg: Option<&str>,
) -> Result<ArgumentVector, OptionError> {
    for (name, _) in options.iter() {
        if grammar.rule_named(name).is_none() {
            return Err(OptionError::Unknown {
                tool: tool.to_string(),
                option: name.to_string(),
            });
        }
    }

    let mut before = Vec::new();
    let mut after = Vec::new();
    for rule in &grammar.rules {
        let Some(value) = options.get(&rule.name) else {
            if rule.required {
                return Err(OptionError::MissingRequired {
                    tool: tool.to_string(),
                    option: rule.name.clone(),
                });
            }
            continue;
        };
        let out = match rule.placement {
            Placement::BeforeTarget => &mut before,
            Placement::AfterTarget => &mut after,
        };
        render_rule(tool, rule, value, out)?;
    }

    let mut args = ArgumentVector::new();
    args.extend(grammar.subcommand.iter().cloned());
    args.extend(grammar.fixed.iter().cloned());
    args.extend(before);
    if let Some(arg) = target_arg {
        match &grammar.target {
            TargetPlacement::Positional => args.push(arg),
            TargetPlacement::Flag(flag) => {
                args.push(flag.as_str());
                args.push(arg);
            }
            TargetPlacement::Omit => {}
        }
    }
    args.extend(after);
    Ok(args)
}

fn render_rule(
    tool: &str,
    rule: &OptionRule,
    value: &OptionValue,
    out: &mut Vec<String>,
) -> Result<(), OptionError> {
    let mismatch = |expected: &'static str| OptionError::TypeMismatch {
        tool: tool.to_string(),
        option: rule.name.clone(),
        expected,
    };
    match &rule.template {
        FlagTemplate::Switch { flag } => {
            let on = match value {
                OptionValue::Flag(b) => *b,
                OptionValue::Text(s) if s == "true" => true,
                OptionValue::Text(s) if s == "false" => false,
                _ => return Err(mismatch("a boolean")),
            };
            if on {
                out.push(flag.clone());
            }
        }
        FlagTemplate::Separate { flag } => {
            let v = scalar(value).ok_or_else(|| mismatch("a single value"))?;
            out.push(flag.clone());
            out.push(v);
        }
        FlagTemplate::Joined { flag } => {
            let v = scalar(value).ok_or_else(|| mismatch("a single value"))?;
            out.push(format!("{flag}{v}"));
        }
        FlagTemplate::Repeated { flag } => {
            for item in list(value).ok_or_else(|| mismatch("a list"))? {
                out.push(flag.clone());
                out.push(item);
            }
        }
        FlagTemplate::CommaSeparated { flag } => {
            let items = list(value).ok_or_else(|| mismatch("a list"))?;
            if !items.is_empty() {
                out.push(flag.clone());
                out.push(items.join(","));
            }
        }
        FlagTemplate::Positional => {
            out.extend(list(value).ok_or_else(|| mismatch("a list"))?);
        }
    }
    Ok(())
}

fn scalar(value: &OptionValue) -> Option<String> {
    match value {
        OptionValue::Text(s) => Some(s.clone()),
        OptionValue::Number(n) => Some(n.to_string()),
        OptionValue::List(items) if items.len() == 1 => Some(items[0].clone()),
        _ => None,
    }
}

fn list(value: &OptionValue) -> Option<Vec<String>> {
    match value {
        OptionValue::List(items) => Some(items.clone()),
        OptionValue::Text(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        OptionValue::Number(n) => Some(vec![n.to_string()]),
        OptionValue::Flag(_) => None,
    }
}
