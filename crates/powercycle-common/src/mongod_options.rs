//! Server command-line options.
//!
//! The handful of options the supervisor itself controls are typed fields;
//! everything else a task profile passes through lives in an extension bag.
//! [`MongodOptions::to_args`] always emits the same order for the same
//! content: typed fields first in a fixed order, then the extension bag
//! sorted by option name.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("failed to split server options: {0}")]
    Split(#[from] shell_words::ParseError),

    #[error("expected an option starting with '-', found '{0}'")]
    UnexpectedValue(String),

    #[error("invalid value '{value}' for --{name}")]
    InvalidValue { name: String, value: String },
}

/// How an option was spelled on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionForm {
    Short,
    Long,
}

impl OptionForm {
    fn prefix(self) -> &'static str {
        match self {
            OptionForm::Short => "-",
            OptionForm::Long => "--",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraOption {
    pub form: OptionForm,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MongodOptions {
    pub dbpath: Option<String>,
    pub logpath: Option<String>,
    pub logappend: bool,
    pub port: Option<u16>,
    pub bind_ip: Option<String>,
    pub repl_set: Option<String>,
    pub fork: bool,
    extra: BTreeMap<String, Vec<ExtraOption>>,
}

impl MongodOptions {
    /// Parse a shell-quoted option string such as
    /// `--setParameter enableTestCommands=1 --wiredTigerCacheSizeGB=1 --nojournal`.
    pub fn parse(input: &str) -> Result<Self, OptionsError> {
        let words = shell_words::split(input)?;
        let mut options = Self::default();
        let mut iter = words.into_iter().peekable();

        while let Some(word) = iter.next() {
            let (form, body) = if let Some(rest) = word.strip_prefix("--") {
                (OptionForm::Long, rest.to_string())
            } else if let Some(rest) = word.strip_prefix('-') {
                (OptionForm::Short, rest.to_string())
            } else {
                return Err(OptionsError::UnexpectedValue(word));
            };

            let (name, value) = match body.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => {
                    let takes_next = iter.peek().is_some_and(|next| !next.starts_with('-'));
                    let value = if takes_next { iter.next() } else { None };
                    (body, value)
                }
            };
            options.set(&name, form, value)?;
        }
        Ok(options)
    }

    fn set(&mut self, name: &str, form: OptionForm, value: Option<String>) -> Result<(), OptionsError> {
        match (name, value) {
            ("dbpath", Some(v)) => self.dbpath = Some(v),
            ("logpath", Some(v)) => self.logpath = Some(v),
            ("logappend", None) => self.logappend = true,
            ("port", Some(v)) => {
                let port = v.parse().map_err(|_| OptionsError::InvalidValue {
                    name: name.to_string(),
                    value: v.clone(),
                })?;
                self.port = Some(port);
            }
            ("bind_ip", Some(v)) => self.bind_ip = Some(v),
            ("replSet", Some(v)) => self.repl_set = Some(v),
            ("fork", None) => self.fork = true,
            (_, value) => self.push_extra(name, form, value),
        }
        Ok(())
    }

    /// Add an option to the extension bag. Repeated names keep every value
    /// in insertion order.
    pub fn push_extra(&mut self, name: &str, form: OptionForm, value: Option<String>) {
        self.extra
            .entry(name.to_string())
            .or_default()
            .push(ExtraOption { form, value });
    }

    /// True when `name` was given, typed or not.
    pub fn has(&self, name: &str) -> bool {
        match name {
            "dbpath" => self.dbpath.is_some(),
            "logpath" => self.logpath.is_some(),
            "logappend" => self.logappend,
            "port" => self.port.is_some(),
            "bind_ip" => self.bind_ip.is_some(),
            "replSet" => self.repl_set.is_some(),
            "fork" => self.fork,
            other => self.extra.contains_key(other),
        }
    }

    pub fn extra(&self, name: &str) -> Option<&[ExtraOption]> {
        self.extra.get(name).map(Vec::as_slice)
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |name: &str, value: Option<&str>| {
            args.push(format!("--{name}"));
            if let Some(value) = value {
                args.push(value.to_string());
            }
        };
        if let Some(v) = &self.dbpath {
            push("dbpath", Some(v));
        }
        if let Some(v) = &self.logpath {
            push("logpath", Some(v));
        }
        if self.logappend {
            push("logappend", None);
        }
        if let Some(v) = self.port {
            push("port", Some(&v.to_string()));
        }
        if let Some(v) = &self.bind_ip {
            push("bind_ip", Some(v));
        }
        if let Some(v) = &self.repl_set {
            push("replSet", Some(v));
        }
        if self.fork {
            push("fork", None);
        }
        for (name, entries) in &self.extra {
            for entry in entries {
                args.push(format!("{}{}", entry.form.prefix(), name));
                if let Some(value) = &entry.value {
                    args.push(value.clone());
                }
            }
        }
        args
    }

    /// The options as one shell-quoted string.
    pub fn to_command_line(&self) -> String {
        shell_words::join(self.to_args())
    }
}
