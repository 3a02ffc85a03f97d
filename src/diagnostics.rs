use crate::config::DEFAULT_TOOLCHAIN;
use crate::core::{Diagnostic, Severity};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::Arc;

pub trait DiagnosticParser: Send {
    fn feed(&mut self, line: &str) -> Vec<Diagnostic>;
}

pub type ParserFactory = Arc<dyn Fn() -> Box<dyn DiagnosticParser> + Send + Sync>;

pub struct ErrorParserRegistry {
    factories: HashMap<String, ParserFactory>,
}

impl Default for ErrorParserRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ErrorParserRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        let gnu: ParserFactory = Arc::new(|| Box::new(PatternParser::gnu()));
        for id in [DEFAULT_TOOLCHAIN, "zephyr", "gnuarmemb", "xtools", "cross-compile"] {
            registry.register(id, gnu.clone());
        }
        registry.register("llvm", Arc::new(|| Box::new(PatternParser::llvm())));
        registry
    }

    pub fn register(&mut self, toolchain_id: impl Into<String>, factory: ParserFactory) {
        self.factories.insert(toolchain_id.into(), factory);
    }

    pub fn contains(&self, toolchain_id: &str) -> bool {
        self.factories.contains_key(toolchain_id)
    }

    pub fn create(&self, toolchain_id: &str) -> Box<dyn DiagnosticParser> {
        match self
            .factories
            .get(toolchain_id)
            .or_else(|| self.factories.get(DEFAULT_TOOLCHAIN))
        {
            Some(factory) => factory(),
            None => {
                tracing::warn!("No error parser for toolchain {}, using GNU rules", toolchain_id);
                Box::new(PatternParser::gnu())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SeveritySource {
    Fixed(Severity),
    Captured,
}

struct Rule {
    regex: Regex,
    severity: SeveritySource,
}

impl Rule {
    fn new(pattern: &str, severity: SeveritySource) -> Self {
        Self {
            regex: Regex::new(pattern).expect("built-in error pattern must compile"),
            severity,
        }
    }

    fn apply(&self, line: &str) -> Option<Diagnostic> {
        let caps = self.regex.captures(line)?;
        let severity = match self.severity {
            SeveritySource::Fixed(severity) => severity,
            SeveritySource::Captured => caps
                .name("sev")
                .map_or(Severity::Error, |m| parse_severity(m.as_str())),
        };

        let message = caps.name("msg").map_or(line, |m| m.as_str()).trim();
        let mut diagnostic = Diagnostic::new(severity, message);
        if let Some(file) = caps.name("file") {
            diagnostic = diagnostic.at(
                file.as_str(),
                capture_number(&caps, "line"),
                capture_number(&caps, "col"),
            );
        }
        Some(diagnostic)
    }
}

fn capture_number(caps: &Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

fn parse_severity(text: &str) -> Severity {
    match text {
        "note" | "remark" => Severity::Info,
        "warning" => Severity::Warning,
        _ => Severity::Error,
    }
}

pub struct PatternParser {
    rules: Vec<Rule>,
}

const COMPILER_LOCATION: &str = r"^(?P<file>(?:[A-Za-z]:)?[^:]+?):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>fatal error|error|warning|note):\s*(?P<msg>.*)$";
const COMPILER_GLOBAL: &str = r"^(?:\S*[/\\])?(?:cc1|cc1plus|collect2|(?:[\w.+]+-)*gcc|(?:[\w.+]+-)*g\+\+|clang|clang\+\+)(?:\.exe)?: (?P<sev>fatal error|error|warning|note): (?P<msg>.*)$";
const LINKER_UNDEFINED: &str = r"^(?P<file>(?:[A-Za-z]:)?[^:]+?):(?:\(.*?\)|(?P<line>\d+)): (?P<msg>(?:undefined reference|multiple definition) .*)$";
const GNU_LINKER: &str = r"^(?:\S*[/\\])?(?:[\w.+]+-)*ld(?:\.bfd)?(?:\.exe)?: (?:(?P<sev>error|warning): )?(?P<msg>.*)$";
const LLD_LINKER: &str = r"^(?:\S*[/\\])?(?:ld\.lld|lld-link|lld)(?:\.exe)?: (?P<sev>error|warning): (?P<msg>.*)$";
const MAKE_FAILURE: &str = r"^(?:\S*[/\\])?g?make(?:\[\d+\])?: \*\*\* (?P<msg>.*)$";
const NINJA_FAILURE: &str = r"^(?:FAILED: (?P<msg>.*)|ninja: build stopped: .*)$";

impl PatternParser {
    pub fn gnu() -> Self {
        Self {
            rules: vec![
                Rule::new(COMPILER_LOCATION, SeveritySource::Captured),
                Rule::new(COMPILER_GLOBAL, SeveritySource::Captured),
                Rule::new(LINKER_UNDEFINED, SeveritySource::Fixed(Severity::Error)),
                Rule::new(MAKE_FAILURE, SeveritySource::Fixed(Severity::Error)),
                Rule::new(NINJA_FAILURE, SeveritySource::Fixed(Severity::Error)),
                Rule::new(GNU_LINKER, SeveritySource::Captured),
            ],
        }
    }

    pub fn llvm() -> Self {
        let mut parser = Self::gnu();
        parser
            .rules
            .insert(2, Rule::new(LLD_LINKER, SeveritySource::Captured));
        parser
    }
}

impl DiagnosticParser for PatternParser {
    fn feed(&mut self, line: &str) -> Vec<Diagnostic> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Vec::new();
        }

        self.rules
            .iter()
            .find_map(|rule| rule.apply(line))
            .into_iter()
            .collect()
    }
}
