//! The orchestration script.
//!
//! A line-oriented file of sections, each closed by `END`:
//!
//! ```text
//! HOSTLIST
//!   gpu1 gpu1.example.org
//! END
//! MODULES
//!   local viewer +0+0 --overlay
//!   DEFAULTS
//!     zoom 2
//!   END
//!   gpu1 fitter -
//! END
//! CONNECTIONS
//!   1 0 overlay
//! END
//! COMMANDS
//!   DELAY 500
//!   0 load sky.fits
//! END
//! SHELL_CLEANUP
//!   rm -f /tmp/fit.*
//! END
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. A line starting with
//! `!` is a shell command run at its position; inside `DEFAULTS` that is
//! right after its module starts. Modules are numbered from 0 in order of
//! appearance.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Host placement keyword for modules started by the orchestrator itself.
pub const LOCAL_HOST: &str = "local";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Failed to read script {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("line {line}: {section} is not terminated by END")]
    Unterminated { line: usize, section: &'static str },
    #[error("line {line}: END outside of a section")]
    StrayEnd { line: usize },
    #[error("line {line}: unknown keyword {word}")]
    UnknownKeyword { line: usize, word: String },
    #[error("line {line}: {section} is repeated or out of order")]
    SectionOrder { line: usize, section: &'static str },
    #[error("line {line}: module index {index} out of range ({count} modules)")]
    IndexOutOfRange { line: usize, index: usize, count: usize },
    #[error("line {line}: unknown host alias {alias}")]
    UnknownHost { line: usize, alias: String },
    #[error("line {line}: host alias {alias} declared twice")]
    DuplicateHost { line: usize, alias: String },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("script declares no modules")]
    NoModules,
}

fn syntax(line: usize, message: impl Into<String>) -> ScriptError {
    ScriptError::Syntax {
        line,
        message: message.into(),
    }
}

/// One line of a section: an entry or a shell escape at that position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item<T> {
    Entry(T),
    Shell(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub alias: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Host alias, or `None` for a local module.
    pub host: Option<String>,
    pub program: String,
    /// Opaque placement hint handed to the module, `-` in the script for none.
    pub placement: Option<String>,
    pub args: Vec<String>,
    /// Lines sent to the module's stdio link once it registers.
    pub defaults: Vec<String>,
}

/// Ask module `client` to open a `protocol` connection to module `server`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub client: usize,
    pub server: usize,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEntry {
    /// Pause used after each following command.
    Delay(Duration),
    /// Send one line to a module's stdio link.
    Send { module: usize, text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    HostList,
    Modules,
    Connections,
    Commands,
    ShellCleanup,
}

impl Section {
    fn keyword(self) -> &'static str {
        match self {
            Section::HostList => "HOSTLIST",
            Section::Modules => "MODULES",
            Section::Connections => "CONNECTIONS",
            Section::Commands => "COMMANDS",
            Section::ShellCleanup => "SHELL_CLEANUP",
        }
    }

    fn from_keyword(word: &str) -> Option<Self> {
        [
            Section::HostList,
            Section::Modules,
            Section::Connections,
            Section::Commands,
            Section::ShellCleanup,
        ]
        .into_iter()
        .find(|s| s.keyword() == word)
    }
}

/// A parsed orchestration script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub hosts: Vec<Item<HostEntry>>,
    pub modules: Vec<Item<ModuleEntry>>,
    pub connections: Vec<Item<ConnectionEntry>>,
    pub commands: Vec<Item<CommandEntry>>,
    /// Shell escapes after the last stage-bearing section.
    pub trailing: Vec<String>,
    /// Run after teardown, only if every supervised child exited cleanly.
    pub cleanup: Vec<String>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = std::fs::read_to_string(path).map_err(|e| ScriptError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let mut parser = Parser::default();
        for (idx, raw) in text.lines().enumerate() {
            parser.line(idx + 1, raw.trim())?;
        }
        parser.finish()
    }

    pub fn module_entries(&self) -> impl Iterator<Item = &ModuleEntry> {
        self.modules.iter().filter_map(|item| match item {
            Item::Entry(m) => Some(m),
            Item::Shell(_) => None,
        })
    }

    pub fn module(&self, index: usize) -> Option<&ModuleEntry> {
        self.module_entries().nth(index)
    }

    pub fn module_count(&self) -> usize {
        self.module_entries().count()
    }

    pub fn host(&self, alias: &str) -> Option<&HostEntry> {
        self.hosts.iter().find_map(|item| match item {
            Item::Entry(h) if h.alias == alias => Some(h),
            _ => None,
        })
    }
}

#[derive(Default)]
struct Parser {
    script: Script,
    /// Open section and the line it started on.
    open: Option<(Section, usize)>,
    last: Option<Section>,
    /// Line of an open DEFAULTS block and the module item it belongs to.
    defaults: Option<(usize, usize)>,
    module_count: usize,
    /// Shell escapes seen between sections.
    loose_shell: Vec<String>,
}

impl Parser {
    fn line(&mut self, line: usize, text: &str) -> Result<(), ScriptError> {
        if text.is_empty() || text.starts_with('#') {
            return Ok(());
        }

        if let Some(command) = text.strip_prefix('!') {
            let command = command.trim();
            if command.is_empty() {
                return Err(syntax(line, "empty shell escape"));
            }
            self.shell(command.to_string());
            return Ok(());
        }

        if let Some((start, item)) = self.defaults {
            if text == "END" {
                self.defaults = None;
            } else if let Some(Item::Entry(module)) = self.script.modules.get_mut(item) {
                module.defaults.push(text.to_string());
            } else {
                unreachable!("DEFAULTS opened on line {start} without a module");
            }
            return Ok(());
        }

        let Some((section, _)) = self.open else {
            return self.open_section(line, text);
        };
        if text == "END" {
            self.open = None;
            self.last = Some(section);
            return Ok(());
        }
        match section {
            Section::HostList => self.host(line, text),
            Section::Modules => self.module(line, text),
            Section::Connections => self.connection(line, text),
            Section::Commands => self.command(line, text),
            Section::ShellCleanup => {
                self.script.cleanup.push(text.to_string());
                Ok(())
            }
        }
    }

    fn shell(&mut self, command: String) {
        match self.open.map(|(s, _)| s) {
            Some(Section::HostList) => self.script.hosts.push(Item::Shell(command)),
            Some(Section::Modules) => self.script.modules.push(Item::Shell(command)),
            Some(Section::Connections) => self.script.connections.push(Item::Shell(command)),
            Some(Section::Commands) => self.script.commands.push(Item::Shell(command)),
            Some(Section::ShellCleanup) => self.script.cleanup.push(command),
            None => self.loose_shell.push(command),
        }
    }

    fn open_section(&mut self, line: usize, text: &str) -> Result<(), ScriptError> {
        if text == "END" {
            return Err(ScriptError::StrayEnd { line });
        }
        let Some(section) = Section::from_keyword(text) else {
            return Err(ScriptError::UnknownKeyword {
                line,
                word: text.split_whitespace().next().unwrap_or(text).to_string(),
            });
        };
        if self.last.is_some_and(|last| section <= last) {
            return Err(ScriptError::SectionOrder {
                line,
                section: section.keyword(),
            });
        }
        // Escapes between sections run just before the next section's stage.
        let loose = std::mem::take(&mut self.loose_shell);
        match section {
            Section::HostList => self.script.hosts.extend(loose.into_iter().map(Item::Shell)),
            Section::Modules => self.script.modules.extend(loose.into_iter().map(Item::Shell)),
            Section::Connections => self.script.connections.extend(loose.into_iter().map(Item::Shell)),
            Section::Commands => self.script.commands.extend(loose.into_iter().map(Item::Shell)),
            Section::ShellCleanup => self.script.trailing.extend(loose),
        }
        self.open = Some((section, line));
        Ok(())
    }

    fn host(&mut self, line: usize, text: &str) -> Result<(), ScriptError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let [alias, hostname] = words[..] else {
            return Err(syntax(line, "expected <alias> <hostname>"));
        };
        if alias == LOCAL_HOST {
            return Err(syntax(line, format!("\"{LOCAL_HOST}\" is reserved")));
        }
        if self.script.host(alias).is_some() {
            return Err(ScriptError::DuplicateHost {
                line,
                alias: alias.to_string(),
            });
        }
        self.script.hosts.push(Item::Entry(HostEntry {
            alias: alias.to_string(),
            hostname: hostname.to_string(),
        }));
        Ok(())
    }

    fn module(&mut self, line: usize, text: &str) -> Result<(), ScriptError> {
        if text == "DEFAULTS" {
            if !matches!(self.script.modules.last(), Some(Item::Entry(_))) {
                return Err(syntax(line, "DEFAULTS must follow a module line"));
            }
            self.defaults = Some((line, self.script.modules.len() - 1));
            return Ok(());
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        let [host, program, placement, args @ ..] = &words[..] else {
            return Err(syntax(line, "expected <host|local> <program> <placement|-> [args...]"));
        };
        let host = if *host == LOCAL_HOST {
            None
        } else if self.script.host(host).is_some() {
            Some(host.to_string())
        } else {
            return Err(ScriptError::UnknownHost {
                line,
                alias: host.to_string(),
            });
        };
        self.script.modules.push(Item::Entry(ModuleEntry {
            host,
            program: program.to_string(),
            placement: (*placement != "-").then(|| placement.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            defaults: Vec::new(),
        }));
        self.module_count += 1;
        Ok(())
    }

    fn index(&self, line: usize, word: &str) -> Result<usize, ScriptError> {
        let index: usize = word
            .parse()
            .map_err(|_| syntax(line, format!("\"{word}\" is not a module index")))?;
        if index >= self.module_count {
            return Err(ScriptError::IndexOutOfRange {
                line,
                index,
                count: self.module_count,
            });
        }
        Ok(index)
    }

    fn connection(&mut self, line: usize, text: &str) -> Result<(), ScriptError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let [client, server, protocol] = words[..] else {
            return Err(syntax(line, "expected <client-index> <server-index> <protocol>"));
        };
        let entry = ConnectionEntry {
            client: self.index(line, client)?,
            server: self.index(line, server)?,
            protocol: protocol.to_string(),
        };
        self.script.connections.push(Item::Entry(entry));
        Ok(())
    }

    fn command(&mut self, line: usize, text: &str) -> Result<(), ScriptError> {
        let (word, rest) = match text.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (text, ""),
        };
        let entry = if word == "DELAY" {
            let ms: u64 = rest
                .parse()
                .map_err(|_| syntax(line, "expected DELAY <milliseconds>"))?;
            CommandEntry::Delay(Duration::from_millis(ms))
        } else {
            CommandEntry::Send {
                module: self.index(line, word)?,
                text: rest.to_string(),
            }
        };
        self.script.commands.push(Item::Entry(entry));
        Ok(())
    }

    fn finish(mut self) -> Result<Script, ScriptError> {
        if let Some((line, _)) = self.defaults {
            return Err(ScriptError::Unterminated {
                line,
                section: "DEFAULTS",
            });
        }
        if let Some((section, line)) = self.open {
            return Err(ScriptError::Unterminated {
                line,
                section: section.keyword(),
            });
        }
        if self.module_count == 0 {
            return Err(ScriptError::NoModules);
        }
        self.script.trailing.append(&mut self.loose_shell);
        Ok(self.script)
    }
}
