//! Line-oriented text codec for equation systems.
//!
//! ## Grammar
//!
//! ```text
//! block    := equation+ blank-line
//! equation := term ( "+" term )*
//! term     := variable ( "*" variable )?
//! variable := label digits          e.g. p12
//!           | label "_" digits      e.g. p_12 (accepted on input only)
//! ```
//!
//! A shell or artifact file is a sequence of blocks. Every block, including
//! the last, must be closed by a blank line; a file that ends mid-block is a
//! [`FormatError::UnterminatedBlock`], never an implicit trailing block.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::OnceLock;

use regex_lite::Regex;

use crate::types::{Equation, System, Term, Variable};

/// Malformed block, line or token.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// Variable token is not `<label><digits>`.
    #[error("invalid variable token {token:?}: expected <label><digits>")]
    InvalidToken {
        /// The offending token.
        token: String,
    },
    /// Variable index must be positive.
    #[error("variable token {token:?} has index 0")]
    ZeroIndex {
        /// The offending token.
        token: String,
    },
    /// Term has 0 or more than 2 variables.
    #[error("term {term:?} has {count} variables, expected 1 or 2")]
    TermArity {
        /// The offending term text.
        term: String,
        /// Number of variables found.
        count: usize,
    },
    /// Two block terminators in a row.
    #[error("empty block at line {line}")]
    EmptyBlock {
        /// 1-based line number of the extra terminator.
        line: usize,
    },
    /// Input ended without a block terminator.
    #[error("unterminated block starting at line {line}")]
    UnterminatedBlock {
        /// 1-based line number where the open block started.
        line: usize,
    },
    /// Underlying read failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z]+)_?([0-9]+)$").expect("static token pattern is valid")
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a single variable token such as `p3` or `p_3`.
pub fn parse_variable(token: &str) -> Result<Variable, FormatError> {
    let token = token.trim();
    let caps = token_pattern()
        .captures(token)
        .ok_or_else(|| FormatError::InvalidToken { token: token.to_string() })?;

    let index: u32 = caps[2]
        .parse()
        .map_err(|_| FormatError::InvalidToken { token: token.to_string() })?;
    if index == 0 {
        return Err(FormatError::ZeroIndex { token: token.to_string() });
    }

    Ok(Variable::new(&caps[1], index))
}

/// Parse a `*`-separated term of one or two variables.
pub fn parse_term(text: &str) -> Result<Term, FormatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(FormatError::TermArity { term: String::new(), count: 0 });
    }

    let vars = text
        .split('*')
        .map(parse_variable)
        .collect::<Result<Vec<_>, _>>()?;
    let count = vars.len();

    Term::from_variables(vars).ok_or_else(|| FormatError::TermArity {
        term: text.to_string(),
        count,
    })
}

/// Parse a `+`-separated equation line.
pub fn parse_equation(line: &str) -> Result<Equation, FormatError> {
    let terms = line
        .split('+')
        .map(parse_term)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Equation::new(terms))
}

/// Parse the lines of one block into a system, keeping equation order.
pub fn parse_system<S: AsRef<str>>(lines: &[S]) -> Result<System, FormatError> {
    let equations = lines
        .iter()
        .map(|line| parse_equation(line.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(System::new(equations))
}

// ─────────────────────────────────────────────────────────────────────────────
// Serialization
// ─────────────────────────────────────────────────────────────────────────────

/// Serialize a system as a terminated block (trailing blank line included).
pub fn serialize(system: &System) -> String {
    let mut out = String::new();
    for eq in system.equations() {
        out.push_str(&eq.to_string());
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Write a system as a terminated block.
pub fn write_block<W: Write>(writer: &mut W, system: &System) -> io::Result<()> {
    writer.write_all(serialize(system).as_bytes())
}

/// Render one equation for the algebra engine: `(t1 + t2 + ... - 1)`.
pub fn render_engine_equation(equation: &Equation) -> String {
    format!("({} - 1)", equation)
}

/// Render a system for the algebra engine as a comma-joined generator list.
pub fn render_engine_generators(system: &System) -> String {
    system
        .equations()
        .iter()
        .map(render_engine_equation)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Human-readable rendering with subscript indices: `{p₁*q₁ + p₂, q₂}`.
pub fn render_pretty(system: &System) -> String {
    let equations: Vec<String> = system
        .equations()
        .iter()
        .map(|eq| {
            eq.terms()
                .iter()
                .map(|term| {
                    term.variables()
                        .map(|v| format!("{}{}", v.label(), subscript(v.index())))
                        .collect::<Vec<_>>()
                        .join("*")
                })
                .collect::<Vec<_>>()
                .join(" + ")
        })
        .collect();
    format!("{{{}}}", equations.join(", "))
}

fn subscript(index: u32) -> String {
    index
        .to_string()
        .chars()
        .map(|c| match c.to_digit(10) {
            Some(d) => char::from_u32(0x2080 + d).unwrap_or(c),
            None => c,
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Block reading
// ─────────────────────────────────────────────────────────────────────────────

/// The raw lines of one block plus its position in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    /// 1-based line number of the block's first line.
    pub line: usize,
    /// Trimmed, non-empty equation lines.
    pub lines: Vec<String>,
}

impl RawBlock {
    /// Parse this block into a system.
    pub fn parse(&self) -> Result<System, FormatError> {
        parse_system(&self.lines)
    }
}

/// Iterator over blank-line-delimited blocks.
///
/// Yields `Err` for an empty block and keeps going; yields a final `Err` for
/// an unterminated trailing block or a read failure, then stops.
pub struct BlockReader<R> {
    reader: R,
    line_no: usize,
    done: bool,
}

impl<R: BufRead> BlockReader<R> {
    /// Wrap a buffered reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            done: false,
        }
    }
}

impl BlockReader<BufReader<File>> {
    /// Open a file for block reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> Iterator for BlockReader<R> {
    type Item = Result<RawBlock, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut lines = Vec::new();
        let mut start = self.line_no + 1;
        let mut buf = String::new();

        loop {
            buf.clear();
            let read = match self.reader.read_line(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(FormatError::Io(e)));
                }
            };

            if read == 0 {
                self.done = true;
                if lines.is_empty() {
                    return None;
                }
                return Some(Err(FormatError::UnterminatedBlock { line: start }));
            }

            self.line_no += 1;
            let line = buf.trim();
            if line.is_empty() {
                if lines.is_empty() {
                    return Some(Err(FormatError::EmptyBlock { line: self.line_no }));
                }
                return Some(Ok(RawBlock { line: start, lines }));
            }

            if lines.is_empty() {
                start = self.line_no;
            }
            lines.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn blocks(text: &str) -> Vec<Result<RawBlock, FormatError>> {
        BlockReader::new(Cursor::new(text.to_string())).collect()
    }

    #[test]
    fn test_parse_variable_forms() {
        assert_eq!(parse_variable("p12").unwrap(), Variable::new("p", 12));
        assert_eq!(parse_variable("q_3").unwrap(), Variable::new("q", 3));
        assert_eq!(parse_variable("  ab7 ").unwrap(), Variable::new("ab", 7));
    }

    #[test]
    fn test_token_pattern_compiles_once() {
        let pattern = token_pattern();
        assert!(std::ptr::eq(pattern, token_pattern()));
        assert!(pattern.is_match("abc_12"));
        assert!(!pattern.is_match("a_"));
    }

    #[test]
    fn test_parse_variable_requires_numeric_suffix() {
        assert!(matches!(parse_variable("p"), Err(FormatError::InvalidToken { .. })));
        assert!(matches!(parse_variable("12"), Err(FormatError::InvalidToken { .. })));
        assert!(matches!(parse_variable("p1x"), Err(FormatError::InvalidToken { .. })));
        assert!(matches!(parse_variable("p0"), Err(FormatError::ZeroIndex { .. })));
    }

    #[test]
    fn test_parse_term_arity() {
        assert!(matches!(parse_term("a1*a2*a3"), Err(FormatError::TermArity { count: 3, .. })));
        assert!(matches!(parse_term(" "), Err(FormatError::TermArity { count: 0, .. })));
        assert_eq!(
            parse_term("b2*a1").unwrap(),
            Term::quadratic(Variable::new("a", 1), Variable::new("b", 2))
        );
    }

    #[test]
    fn test_parse_equation_rejects_empty_term() {
        assert!(parse_equation("a1 + + b1").is_err());
    }

    #[test]
    fn test_serialize_block() {
        let system = parse_system(&["b1 + a1*a2", "a1"]).unwrap();
        assert_eq!(serialize(&system), "a1*a2 + b1\na1\n\n");
    }

    #[test]
    fn test_engine_rendering() {
        let system = parse_system(&["a1*a2 + b1", "b1*b2 + a1"]).unwrap();
        assert_eq!(
            render_engine_generators(&system),
            "(a1*a2 + b1 - 1), (b1*b2 + a1 - 1)"
        );
    }

    #[test]
    fn test_pretty_rendering() {
        let system = parse_system(&["p_1*q_12 + p_2"]).unwrap();
        assert_eq!(render_pretty(&system), "{p\u{2081}*q\u{2081}\u{2082} + p\u{2082}}");
    }

    #[test]
    fn test_block_reader_splits_on_blank_lines() {
        let out = blocks("a1\nb1 + a2\n\nc1\n\n");
        assert_eq!(out.len(), 2);
        let first = out[0].as_ref().unwrap();
        assert_eq!(first.line, 1);
        assert_eq!(first.lines, vec!["a1", "b1 + a2"]);
        assert_eq!(out[1].as_ref().unwrap().line, 4);
    }

    #[test]
    fn test_block_reader_rejects_missing_terminator() {
        let out = blocks("a1\n\nb1\n");
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(FormatError::UnterminatedBlock { line: 3 })));
    }

    #[test]
    fn test_block_reader_reports_empty_block_and_continues() {
        let out = blocks("a1\n\n\nb1\n\n");
        assert_eq!(out.len(), 3);
        assert!(matches!(out[1], Err(FormatError::EmptyBlock { line: 3 })));
        assert_eq!(out[2].as_ref().unwrap().lines, vec!["b1"]);
    }

    #[test]
    fn test_empty_input_has_no_blocks() {
        assert!(blocks("").is_empty());
    }
}
