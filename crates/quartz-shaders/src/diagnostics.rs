//! Compiler log parsing and source annotation.
//!
//! Compiler logs are turned into [`Diagnostic`]s located in the
//! preprocessed source, so locations stay meaningful after macro
//! expansion. [`annotate_source`] renders that source with line numbers
//! and the messages placed under the lines they refer to.

use quartz_gpu::ShaderStage;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Note => "note",
        })
    }
}

/// One message of a compiler log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// 1-based line in the preprocessed source.
    pub line: Option<u32>,
    /// 1-based column, when the compiler reports one.
    pub column: Option<u32>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{line}:{column}: {}: {}", self.severity, self.message),
            (Some(line), None) => write!(f, "{line}: {}: {}", self.severity, self.message),
            _ => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Step of compilation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilePhase {
    Preprocess,
    Compile,
}

impl fmt::Display for CompilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Preprocess => "preprocess",
            Self::Compile => "compile",
        })
    }
}

/// A failed compilation, ready to be shown to a user.
#[derive(Debug, Clone)]
pub struct CompilationFailure {
    pub shader: String,
    pub stage: ShaderStage,
    pub phase: CompilePhase,
    pub diagnostics: Vec<Diagnostic>,
    /// Numbered source with the diagnostics inlined.
    pub annotated_source: String,
}

impl CompilationFailure {
    /// Build a failure from a raw compiler log against `source`.
    pub fn from_log(
        shader: impl Into<String>,
        stage: ShaderStage,
        phase: CompilePhase,
        source: &str,
        log: &str,
    ) -> Self {
        let diagnostics = parse_log(log);
        let annotated_source = annotate_source(source, &diagnostics);
        Self {
            shader: shader.into(),
            stage,
            phase,
            diagnostics,
            annotated_source,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.severity == Severity::Error)
    }
}

impl fmt::Display for CompilationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} shader '{}' failed to {}", self.stage, self.shader, self.phase)?;
        match self.errors().next().or_else(|| self.diagnostics.first()) {
            Some(first) => write!(f, ": {first}"),
            None => Ok(()),
        }
    }
}

fn severity_prefix(word: &str) -> Option<Severity> {
    match word.trim().to_ascii_lowercase().as_str() {
        "error" | "fatal error" => Some(Severity::Error),
        "warning" => Some(Severity::Warning),
        "note" | "info" => Some(Severity::Note),
        _ => None,
    }
}

/// Split `rest` into numeric location fields and the message.
fn split_location(rest: &str) -> (Vec<u32>, &str) {
    let mut numbers = Vec::new();
    let mut remaining = rest;
    while let Some((head, tail)) = remaining.split_once(':') {
        match head.trim().parse::<u32>() {
            Ok(number) if numbers.len() < 3 => {
                numbers.push(number);
                remaining = tail;
            }
            _ => break,
        }
    }
    (numbers, remaining.trim())
}

/// `ERROR: 0:12: 'x' : undeclared identifier`
fn parse_glslang_line(line: &str) -> Option<Diagnostic> {
    let (prefix, rest) = line.split_once(':')?;
    let severity = severity_prefix(prefix)?;
    let rest = rest.trim();

    // The first field names the source string, either an index or a file name
    if let Some((_, tail)) = rest.split_once(':') {
        let (numbers, message) = split_location(tail);
        if let Some(&line) = numbers.first() {
            return Some(Diagnostic {
                severity,
                line: Some(line),
                column: numbers.get(1).copied(),
                message: message.to_string(),
            });
        }
    }

    Some(Diagnostic {
        severity,
        line: None,
        column: None,
        message: rest.to_string(),
    })
}

/// `shader.frag:12: error: 'x' : undeclared identifier`
fn parse_named_line(line: &str) -> Option<Diagnostic> {
    let (_, rest) = line.split_once(':')?;
    let (numbers, tail) = split_location(rest);
    if numbers.is_empty() {
        return None;
    }
    let (word, message) = tail.split_once(':')?;
    let severity = severity_prefix(word)?;
    Some(Diagnostic {
        severity,
        line: numbers.first().copied(),
        column: numbers.get(1).copied(),
        message: message.trim().to_string(),
    })
}

/// Parse every non-empty line of a compiler log.
///
/// Lines in neither known form are kept as unlocated notes.
pub fn parse_log(log: &str) -> Vec<Diagnostic> {
    log.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            parse_glslang_line(line)
                .or_else(|| parse_named_line(line))
                .unwrap_or_else(|| Diagnostic {
                    severity: Severity::Note,
                    line: None,
                    column: None,
                    message: line.to_string(),
                })
        })
        .collect()
}

/// Render `source` with line numbers and `diagnostics` under their lines.
///
/// Unlocated diagnostics, and those pointing past the end of the source,
/// are listed after the code.
pub fn annotate_source(source: &str, diagnostics: &[Diagnostic]) -> String {
    let line_count = source.lines().count();
    let width = line_count.max(1).to_string().len();
    let mut out = String::new();

    for (index, text) in source.lines().enumerate() {
        let number = index + 1;
        out.push_str(&format!("{number:>width$} | {text}\n"));
        for diagnostic in diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.line.map(|line| line as usize) == Some(number))
        {
            let indent = diagnostic
                .column
                .map_or(0, |column| (column as usize).saturating_sub(1));
            out.push_str(&format!(
                "{:>width$} | {:indent$}^ {}: {}\n",
                "", "", diagnostic.severity, diagnostic.message
            ));
        }
    }

    for diagnostic in diagnostics.iter().filter(|diagnostic| {
        diagnostic
            .line
            .map_or(true, |line| line == 0 || line as usize > line_count)
    }) {
        out.push_str(&format!("{diagnostic}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_glslang_log() {
        let log = "ERROR: 0:12: 'color' : undeclared identifier\n\
                   WARNING: 0:3: '' : version 450 is unknown\n\
                   ERROR: 1 compilation errors.  No code generated.\n";
        let diagnostics = parse_log(log);
        assert_eq!(diagnostics.len(), 3);

        assert_eq!(diagnostics[0].severity, Severity::Error);
        assert_eq!(diagnostics[0].line, Some(12));
        assert_eq!(diagnostics[0].column, None);
        assert_eq!(diagnostics[0].message, "'color' : undeclared identifier");

        assert_eq!(diagnostics[1].severity, Severity::Warning);
        assert_eq!(diagnostics[1].line, Some(3));

        assert_eq!(diagnostics[2].line, None);
        assert!(diagnostics[2].message.starts_with("1 compilation errors"));
    }

    #[test]
    fn parses_named_log_with_column() {
        let diagnostics = parse_log("mesh.frag:7:14: error: 'vec5' : no matching type\n");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Error);
        assert_eq!(diagnostics[0].line, Some(7));
        assert_eq!(diagnostics[0].column, Some(14));
        assert_eq!(diagnostics[0].message, "'vec5' : no matching type");
    }

    #[test]
    fn unknown_lines_become_notes() {
        let diagnostics = parse_log("\nsomething happened\n\n");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Note);
        assert_eq!(diagnostics[0].message, "something happened");
    }

    #[test]
    fn annotation_places_markers_under_lines() {
        let source = "void main() {\n    color = vec4(1.0);\n}";
        let diagnostics = vec![
            Diagnostic {
                severity: Severity::Error,
                line: Some(2),
                column: Some(5),
                message: "'color' : undeclared identifier".to_string(),
            },
            Diagnostic {
                severity: Severity::Note,
                line: None,
                column: None,
                message: "1 error".to_string(),
            },
        ];
        let annotated = annotate_source(source, &diagnostics);
        let lines: Vec<&str> = annotated.lines().collect();

        assert_eq!(lines[0], "1 | void main() {");
        assert_eq!(lines[1], "2 |     color = vec4(1.0);");
        assert_eq!(lines[2], "  |     ^ error: 'color' : undeclared identifier");
        assert_eq!(lines[3], "3 | }");
        assert_eq!(lines[4], "note: 1 error");
    }

    #[test]
    fn failure_display_leads_with_first_error() {
        let failure = CompilationFailure::from_log(
            "mesh",
            ShaderStage::Fragment,
            CompilePhase::Compile,
            "void main() {}\n",
            "WARNING: 0:1: '' : unused\nERROR: 0:1: 'x' : bad\n",
        );
        let text = failure.to_string();
        assert!(text.contains("'mesh'"));
        assert!(text.ends_with("1: error: 'x' : bad"));
        assert_eq!(failure.errors().count(), 1);
    }
}
