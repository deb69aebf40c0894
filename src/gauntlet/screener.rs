//! Static screening of submitted source.
//!
//! Scans code and test case line by line (comments stripped) against a
//! fixed rule set: dynamic-evaluation builtins, imports outside the
//! allow-list, dangerous attribute access, and file opens that escape the
//! sandbox scratch directory. Deterministic and pure given the config.
//!
//! The scan is deliberately conservative: it matches patterns anywhere
//! outside comments, including inside string literals.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::ScreenerConfig;
use crate::models::{ScanResult, SecurityScan};

/// Dynamic evaluation and introspection builtins. Matches attribute calls
/// too (`sys.exit(...)` trips on `exit`).
static DANGEROUS_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(eval|exec|compile|__import__|globals|locals|getattr|setattr|delattr|breakpoint|exit|quit)\s*\(",
    )
    .expect("dangerous-call pattern")
});

/// `import x`, `import x.y as z`, `import a, b`.
static IMPORT_STMT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*import\s+(.+)$").expect("import pattern")
});

/// `from x.y import z`.
static FROM_IMPORT_STMT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*from\s+([A-Za-z_][\w.]*)\s+import\b").expect("from-import pattern")
});

/// Introspection escape hatches reachable through attribute access.
static DANGEROUS_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(__subclasses__|__bases__|__mro__|__globals__|__code__|__builtins__)\b")
        .expect("dangerous-attr pattern")
});

/// Process/filesystem methods that must never be reachable.
static DANGEROUS_METHOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(system|popen|spawn\w*|rmtree|unlink)\s*\(").expect("dangerous-method pattern")
});

/// `open(` with its first argument captured up to a comma or close paren.
static OPEN_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bopen\s*\(\s*([^,)]*)").expect("open-call pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Critical,
    Warning,
}

#[derive(Debug)]
struct Issue {
    severity: Severity,
    line: usize,
    message: String,
}

/// The static screener.
#[derive(Debug, Clone)]
pub struct StaticScreener {
    config: ScreenerConfig,
}

impl StaticScreener {
    pub fn new(config: ScreenerConfig) -> Self {
        Self { config }
    }

    /// Screen a submission's code and test case.
    pub fn screen(&self, code: &str, test_case: &str) -> ScanResult {
        let mut issues = Vec::new();
        self.scan_source(code, "code", &mut issues);
        self.scan_source(test_case, "test_case", &mut issues);

        let has_critical = issues.iter().any(|i| i.severity == Severity::Critical);
        let has_warning = issues.iter().any(|i| i.severity == Severity::Warning);

        let scan = if has_critical {
            SecurityScan::Fail
        } else if has_warning {
            SecurityScan::Warning
        } else {
            SecurityScan::Pass
        };

        ScanResult {
            safe: !has_critical,
            scan,
            reasons: issues
                .into_iter()
                .map(|i| format!("[{}] line {}: {}", severity_label(i.severity), i.line, i.message))
                .collect(),
        }
    }

    fn scan_source(&self, source: &str, origin: &str, issues: &mut Vec<Issue>) {
        for (idx, raw_line) in source.lines().enumerate() {
            let line = strip_comment(raw_line);
            if line.trim().is_empty() {
                continue;
            }
            let lineno = idx + 1;

            if let Some(m) = DANGEROUS_CALL.captures(line) {
                issues.push(Issue {
                    severity: Severity::Critical,
                    line: lineno,
                    message: format!("{origin}: dangerous builtin call '{}()'", &m[1]),
                });
            }

            self.check_imports(line, origin, lineno, issues);

            if let Some(m) = DANGEROUS_ATTR.captures(line) {
                issues.push(Issue {
                    severity: Severity::Critical,
                    line: lineno,
                    message: format!("{origin}: dangerous attribute access '.{}'", &m[1]),
                });
            }

            if let Some(m) = DANGEROUS_METHOD.captures(line) {
                issues.push(Issue {
                    severity: Severity::Critical,
                    line: lineno,
                    message: format!("{origin}: dangerous method call '.{}()'", &m[1]),
                });
            }

            self.check_open(line, origin, lineno, issues);
        }
    }

    fn check_imports(&self, line: &str, origin: &str, lineno: usize, issues: &mut Vec<Issue>) {
        if let Some(m) = FROM_IMPORT_STMT.captures(line) {
            self.check_module(&m[1], origin, lineno, issues);
            return;
        }

        if let Some(m) = IMPORT_STMT.captures(line) {
            // `import a, b as c` — each clause names one module.
            for clause in m[1].split(',') {
                let module = clause.trim().split_whitespace().next().unwrap_or("");
                if !module.is_empty() {
                    self.check_module(module, origin, lineno, issues);
                }
            }
        }
    }

    fn check_module(&self, module: &str, origin: &str, lineno: usize, issues: &mut Vec<Issue>) {
        let root = module.split('.').next().unwrap_or(module);
        if !self.config.allowed_imports.contains(root) {
            issues.push(Issue {
                severity: Severity::Critical,
                line: lineno,
                message: format!("{origin}: import of '{module}' is outside the allow-list"),
            });
        }
    }

    fn check_open(&self, line: &str, origin: &str, lineno: usize, issues: &mut Vec<Issue>) {
        let Some(m) = OPEN_CALL.captures(line) else {
            return;
        };
        let arg = m[1].trim();

        let is_literal = (arg.starts_with('"') && arg.len() >= 2)
            || (arg.starts_with('\'') && arg.len() >= 2);
        if !is_literal {
            issues.push(Issue {
                severity: Severity::Critical,
                line: lineno,
                message: format!("{origin}: open() with a non-literal path"),
            });
            return;
        }

        let path = arg.trim_matches(|c| c == '"' || c == '\'');
        if path.starts_with('/') && !path.starts_with("/tmp/") {
            issues.push(Issue {
                severity: Severity::Critical,
                line: lineno,
                message: format!("{origin}: open() path '{path}' escapes the scratch directory"),
            });
        } else if line.contains("\"w") || line.contains("'w") || line.contains("\"a") || line.contains("'a") {
            // Relative writes land in the scratch dir; record them anyway.
            issues.push(Issue {
                severity: Severity::Warning,
                line: lineno,
                message: format!("{origin}: file write detected"),
            });
        }
    }
}

fn severity_label(s: Severity) -> &'static str {
    match s {
        Severity::Critical => "CRITICAL",
        Severity::Warning => "WARNING",
    }
}

/// Drop a `#` comment, respecting single/double quotes.
fn strip_comment(line: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;
    for (i, c) in line.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => return &line[..i],
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScreenerConfig;

    fn screener() -> StaticScreener {
        StaticScreener::new(ScreenerConfig::default())
    }

    #[test]
    fn clean_arithmetic_passes() {
        let result = screener().screen(
            "import math\n\ndef area(r):\n    return math.pi * r * r",
            "assert abs(area(1) - 3.14159) < 0.01",
        );
        assert!(result.safe);
        assert_eq!(result.scan, SecurityScan::Pass);
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn eval_is_rejected() {
        let result = screener().screen("def f(s):\n    return eval(s)", "assert f('1') == 1");
        assert!(!result.safe);
        assert_eq!(result.scan, SecurityScan::Fail);
        assert!(result.reasons[0].contains("eval"));
    }

    #[test]
    fn disallowed_import_is_rejected() {
        let result = screener().screen("import socket\n", "pass");
        assert!(!result.safe);
        assert!(result.reasons[0].contains("socket"));
    }

    #[test]
    fn disallowed_from_import_is_rejected() {
        let result = screener().screen("from subprocess import run\n", "pass");
        assert!(!result.safe);
        assert!(result.reasons[0].contains("subprocess"));
    }

    #[test]
    fn dotted_import_checks_root_module() {
        let result = screener().screen("import http.server\n", "pass");
        assert!(!result.safe);

        let ok = screener().screen("import collections.abc\n", "pass");
        assert!(ok.safe);
    }

    #[test]
    fn comma_import_checks_each_module() {
        let result = screener().screen("import math, os\n", "pass");
        assert!(!result.safe);
        assert!(result.reasons[0].contains("os"));
    }

    #[test]
    fn dangerous_attribute_is_rejected() {
        let result = screener().screen(
            "def f():\n    return ().__class__.__bases__[0].__subclasses__()",
            "f()",
        );
        assert!(!result.safe);
    }

    #[test]
    fn os_system_style_call_is_rejected() {
        // Even without the import, the attribute call alone trips the rule.
        let result = screener().screen("def f(x):\n    return x.system('ls')", "pass");
        assert!(!result.safe);
    }

    #[test]
    fn test_case_is_screened_too() {
        let result = screener().screen("def f():\n    return 1", "exec('f()')");
        assert!(!result.safe);
        assert!(result.reasons[0].contains("test_case"));
    }

    #[test]
    fn open_nonliteral_path_is_rejected() {
        let result = screener().screen("def f(p):\n    return open(p).read()", "pass");
        assert!(!result.safe);
        assert!(result.reasons[0].contains("non-literal"));
    }

    #[test]
    fn open_absolute_path_is_rejected() {
        let result = screener().screen("data = open('/etc/passwd').read()", "pass");
        assert!(!result.safe);
    }

    #[test]
    fn open_relative_write_is_warning_only() {
        let result = screener().screen("open('scratch.txt', 'w').write('x')", "pass");
        assert!(result.safe);
        assert_eq!(result.scan, SecurityScan::Warning);
    }

    #[test]
    fn comments_are_ignored() {
        let result = screener().screen("# eval() is not used here\nx = 1", "assert x == 1");
        assert!(result.safe);
        assert_eq!(result.scan, SecurityScan::Pass);
    }

    #[test]
    fn screening_is_deterministic() {
        let code = "import os\neval('1')";
        let a = screener().screen(code, "pass");
        let b = screener().screen(code, "pass");
        assert_eq!(a.reasons, b.reasons);
        assert_eq!(a.safe, b.safe);
    }
}
