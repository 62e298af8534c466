//! Language profiles: the fixed set of languages the daemon can execute.
//!
//! Every supported language is a [`Language`] variant carrying exactly one
//! [`LanguageProfile`]. Identifiers are resolved once, case-insensitively,
//! through [`LanguageRegistry::profile`], so unknown languages are rejected
//! before any filesystem or container work happens.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Exit status a run command uses to report that the build step failed.
pub const COMPILE_FAILED_EXIT: i64 = 97;

/// Mount point of the session workspace inside every container.
pub const CONTAINER_WORK_DIR: &str = "/app";

const MIB: i64 = 1024 * 1024;

const PUBLIC_DNS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];

/// Generates a UTF-8 locale inside the gcc image so non-ASCII output renders.
const CPP_LOCALE_BOOTSTRAP: &str = "if ! locale -a 2>/dev/null | grep -qi '^en_US.utf8$'; then \
     (apt-get update -qq && apt-get install -y -qq locales \
     && sed -i 's/^# *en_US.UTF-8/en_US.UTF-8/' /etc/locale.gen && locale-gen) >/dev/null 2>&1; \
     fi; export LANG=en_US.UTF-8 LC_ALL=en_US.UTF-8";

/// Supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Javascript,
    Python,
    Java,
    Cpp,
    Csharp,
    Rust,
}

impl Language {
    pub const ALL: [Self; 6] = [
        Self::Javascript,
        Self::Python,
        Self::Java,
        Self::Cpp,
        Self::Csharp,
        Self::Rust,
    ];

    /// Resolve an identifier, ignoring case and surrounding whitespace.
    pub fn parse(id: &str) -> Result<Self, ExecError> {
        let normalized = id.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|lang| lang.id() == normalized)
            .ok_or_else(|| ExecError::UnsupportedLanguage(id.to_string()))
    }

    pub const fn id(self) -> &'static str {
        match self {
            Self::Javascript => "javascript",
            Self::Python => "python",
            Self::Java => "java",
            Self::Cpp => "cpp",
            Self::Csharp => "csharp",
            Self::Rust => "rust",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Javascript => "JavaScript",
            Self::Python => "Python",
            Self::Java => "Java",
            Self::Cpp => "C++",
            Self::Csharp => "C#",
            Self::Rust => "Rust",
        }
    }

    /// Whether the build step runs before the program inside the container.
    pub const fn is_compiled(self) -> bool {
        matches!(self, Self::Java | Self::Cpp | Self::Csharp | Self::Rust)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Network access granted to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// No network interface besides loopback.
    Disabled,
    /// Bridge network restricted to the profile's DNS servers (toolchain bootstrap).
    LimitedDns,
}

/// Everything needed to run one language inside a container.
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    pub language: Language,
    pub base_image: String,
    pub work_dir: String,
    pub run_command: Vec<String>,
    /// Base name of the source file; Java and C# require a fixed one.
    pub entrypoint: &'static str,
    pub file_extension: &'static str,
    pub env: Vec<String>,
    pub memory_limit_bytes: i64,
    pub cpu_share_fraction: f64,
    pub network: NetworkPolicy,
    pub dns_servers: Vec<String>,
    pub timeout: Duration,
}

impl LanguageProfile {
    fn builtin(language: Language) -> Self {
        let shell = |script: String| vec!["sh".to_string(), "-c".to_string(), script];
        let dns = || PUBLIC_DNS.iter().map(ToString::to_string).collect::<Vec<_>>();

        let (image, run_command, entrypoint, ext, memory_mib, cpus, timeout_secs) = match language {
            Language::Javascript => (
                "node:18-alpine",
                vec!["node".to_string(), format!("{CONTAINER_WORK_DIR}/main.js")],
                "main",
                "js",
                128,
                0.5,
                10,
            ),
            Language::Python => (
                "python:3.11-alpine",
                vec![
                    "python3".to_string(),
                    "-u".to_string(),
                    format!("{CONTAINER_WORK_DIR}/main.py"),
                ],
                "main",
                "py",
                128,
                0.5,
                10,
            ),
            Language::Java => (
                "eclipse-temurin:17-jdk",
                shell(format!(
                    "mkdir -p /tmp/classes && (javac -encoding UTF-8 -d /tmp/classes Main.java \
                     || exit {COMPILE_FAILED_EXIT}) && exec java -cp /tmp/classes Main"
                )),
                "Main",
                "java",
                256,
                1.0,
                15,
            ),
            Language::Cpp => (
                "gcc:12",
                shell(format!(
                    "{CPP_LOCALE_BOOTSTRAP}; (g++ -std=c++17 -O2 -o /tmp/main main.cpp \
                     || exit {COMPILE_FAILED_EXIT}) && exec /tmp/main"
                )),
                "main",
                "cpp",
                256,
                1.0,
                30,
            ),
            Language::Csharp => (
                "mcr.microsoft.com/dotnet/sdk:8.0",
                shell(format!(
                    "mkdir -p /tmp/project && cd /tmp/project \
                     && dotnet new console --force >/dev/null 2>&1 \
                     && cp {CONTAINER_WORK_DIR}/Program.cs Program.cs \
                     && (dotnet build --nologo -v q -clp:ErrorsOnly 1>&2 || exit {COMPILE_FAILED_EXIT}) \
                     && exec dotnet run --no-build"
                )),
                "Program",
                "cs",
                512,
                1.0,
                30,
            ),
            Language::Rust => (
                "rust:1-slim",
                shell(format!(
                    "(rustc -O -o /tmp/main main.rs || exit {COMPILE_FAILED_EXIT}) && exec /tmp/main"
                )),
                "main",
                "rs",
                512,
                1.0,
                20,
            ),
        };

        let (network, dns_servers) = match language {
            Language::Cpp | Language::Csharp => (NetworkPolicy::LimitedDns, dns()),
            _ => (NetworkPolicy::Disabled, Vec::new()),
        };

        let env = match language {
            Language::Csharp => vec![
                "HOME=/tmp".to_string(),
                "DOTNET_CLI_TELEMETRY_OPTOUT=1".to_string(),
                "DOTNET_NOLOGO=1".to_string(),
            ],
            _ => Vec::new(),
        };

        Self {
            language,
            base_image: image.to_string(),
            work_dir: CONTAINER_WORK_DIR.to_string(),
            run_command,
            entrypoint,
            file_extension: ext,
            env,
            memory_limit_bytes: memory_mib * MIB,
            cpu_share_fraction: cpus,
            network,
            dns_servers,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// File name of the submitted source inside the workspace.
    pub fn source_file_name(&self) -> String {
        format!("{}.{}", self.entrypoint, self.file_extension)
    }

    /// Check language preconditions and return the source as it will be written.
    ///
    /// Java must declare `public class Main` with a `main` method, because the
    /// build step compiles `Main.java`. C++ gets `<iostream>` if it is missing.
    pub fn prepare_source<'a>(&self, code: &'a str) -> Result<Cow<'a, str>, ExecError> {
        match self.language {
            Language::Java => {
                let mismatch = |reason: &str| ExecError::CompileTargetMismatch {
                    language: self.language.display_name().to_string(),
                    reason: reason.to_string(),
                };
                if !java_main_class().is_match(code) {
                    return Err(mismatch("code must declare `public class Main`"));
                }
                if !java_main_method().is_match(code) {
                    return Err(mismatch(
                        "class Main must define `public static void main(String[] args)`",
                    ));
                }
                Ok(Cow::Borrowed(code))
            }
            Language::Cpp if !cpp_iostream().is_match(code) => {
                Ok(Cow::Owned(format!("#include <iostream>\n{code}")))
            }
            _ => Ok(Cow::Borrowed(code)),
        }
    }
}

fn java_main_class() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bpublic\s+(?:final\s+)?class\s+Main\b").expect("valid regex")
    })
}

fn java_main_method() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:public\s+static|static\s+public)\s+void\s+main\s*\(").expect("valid regex")
    })
}

fn cpp_iostream() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#\s*include\s*<iostream>").expect("valid regex"))
}

/// Immutable table of profiles, built once at startup.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LanguageRegistry {
    /// Build the registry. `timeout_override` replaces every profile's timeout.
    pub fn new(timeout_override: Option<Duration>) -> Self {
        let profiles = Language::ALL
            .into_iter()
            .map(|lang| {
                let mut profile = LanguageProfile::builtin(lang);
                if let Some(timeout) = timeout_override {
                    profile.timeout = timeout;
                }
                (lang, profile)
            })
            .collect();
        Self { profiles }
    }

    /// Look up a profile by identifier.
    pub fn profile(&self, id: &str) -> Result<&LanguageProfile, ExecError> {
        let language = Language::parse(id)?;
        self.profiles
            .get(&language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(id.to_string()))
    }

    pub fn get(&self, language: Language) -> Option<&LanguageProfile> {
        self.profiles.get(&language)
    }

    /// Profiles in the fixed presentation order.
    pub fn iter(&self) -> impl Iterator<Item = &LanguageProfile> {
        Language::ALL.iter().filter_map(|lang| self.profiles.get(lang))
    }
}
