//! Assembly language parser for KVM scripts.
//!
//! Drives a [`BytecodeWriter`] line by line and packages the result as a
//! [`CompiledScript`]. Mnemonics and operand kinds come from the instruction
//! table, so the assembler accepts exactly what the interpreter executes.
//!
//! # Syntax
//!
//! ```text
//! .var speed float       # variable declaration
//! pub update:            # public label, exported as an entry point
//! loop:                  # plain label
//!     GET speed
//!     CONST32 1.5
//!     ADDF
//!     SET speed
//!     END
//! ```
//!
//! - Instructions are uppercase mnemonics with at most one operand
//! - Comments start with `#` or `;`, commas are ignored
//! - Word operands accept decimal, negative (`i32` bits), `0x` hex and
//!   float literals (`f32` bits)
//! - Index operands accept integers or a declared variable name
//! - Label operands are names and may refer to labels defined later
//! - `.var <name> <u32|i32|float|entity>` appends to the variable table

use crate::virtual_machine::environment::variable_index;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{Instruction, OperandKind};
use crate::virtual_machine::script::{CompiledScript, EntryPoint, ScriptValueType, Variable};
use crate::virtual_machine::writer::{BytecodeWriter, Label, Operand};
use crate::{debug, error};
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHARS: [char; 2] = ['#', ';'];
const LABEL_SUFFIX: char = ':';
const DIRECTIVE_PREFIX: char = '.';
const PUB_KEYWORD: &str = "pub";
const VAR_DIRECTIVE: &str = ".var";

/// Return the line/column/message triple for assembly-related errors.
fn assembly_error_location(err: &VMError) -> Option<(usize, usize, String)> {
    match err {
        VMError::AssemblyError {
            line,
            offset,
            source,
        } => Some((*line, *offset, source.clone())),
        VMError::ParseError {
            line,
            offset,
            message,
        } => Some((*line, *offset, message.to_string())),
        _ => None,
    }
}

/// Formats a compiler-style diagnostic for assembly failures.
fn render_assembly_diagnostic(
    file: &str,
    source: &str,
    line: usize,
    offset: usize,
    message: &str,
) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {message}");
    let _ = writeln!(diag, " --> {file}:{line}:{offset}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(offset.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

fn log_assembly_error(file: &str, source: &str, err: &VMError) {
    if let Some((line, offset, message)) = assembly_error_location(err) {
        error!(
            "{}",
            render_assembly_diagnostic(file, source, line, offset, &message)
        );
    } else {
        error!("{file}: {err}");
    }
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column offset in the line.
    offset: usize,
}

/// Tokenize a single line of assembly.
///
/// Rules:
/// - `#` or `;` starts a comment
/// - commas are ignored
/// - whitespace-separated tokens
fn tokenize(line: &str) -> Vec<Token<'_>> {
    let code = line
        .find(COMMENT_CHARS)
        .map_or(line, |comment| &line[..comment]);

    let mut out = Vec::with_capacity(4);
    let mut start: Option<usize> = None;

    for (i, c) in code.char_indices() {
        if c == ',' || c.is_whitespace() {
            if let Some(s) = start.take() {
                out.push(Token {
                    text: &code[s..i],
                    offset: s + 1,
                });
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }

    if let Some(s) = start {
        out.push(Token {
            text: &code[s..],
            offset: s + 1,
        });
    }

    out
}

/// Checks if a token is a label definition (ends with `:`)
fn is_label_def(tok: &str) -> bool {
    tok.ends_with(LABEL_SUFFIX) && tok.len() > 1
}

/// Extracts the label name from a label definition token.
fn label_name(tok: &str) -> &str {
    &tok[..tok.len() - 1]
}

fn parse_unsigned<T: TryFrom<u64>>(tok: &str) -> Option<T> {
    let value = match tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => tok.parse::<u64>().ok()?,
    };
    T::try_from(value).ok()
}

/// Float tokens need a `.`, an exponent, or a special name; out-of-range integers stay errors.
fn is_float_literal(tok: &str) -> bool {
    let body = tok.trim_start_matches(['+', '-']);
    if body.starts_with("0x") || body.starts_with("0X") {
        return false;
    }
    body.contains(['.', 'e', 'E'])
        || ["inf", "infinity", "nan"]
            .iter()
            .any(|name| body.eq_ignore_ascii_case(name))
}

/// Parses a 32-bit word: unsigned, negative (two's complement), hex or float.
pub(crate) fn parse_word(tok: &str) -> Result<u32, VMError> {
    parse_unsigned::<u32>(tok)
        .or_else(|| tok.parse::<i32>().ok().map(|v| v as u32))
        .or_else(|| {
            is_float_literal(tok)
                .then(|| tok.parse::<f32>().ok().map(f32::to_bits))
                .flatten()
        })
        .ok_or_else(|| VMError::InvalidOperand {
            token: tok.to_string(),
            expected: OperandKind::ImmU32.describe(),
        })
}

/// Parses a 64-bit value: unsigned, negative (two's complement) or hex.
pub(crate) fn parse_wide(tok: &str) -> Result<u64, VMError> {
    parse_unsigned::<u64>(tok)
        .or_else(|| tok.parse::<i64>().ok().map(|v| v as u64))
        .ok_or_else(|| VMError::InvalidOperand {
            token: tok.to_string(),
            expected: OperandKind::ImmU64.describe(),
        })
}

/// Source location of a label's first reference, reported if it is never placed.
#[derive(Debug, Clone, Copy)]
struct LabelRef {
    label: Label,
    placed: bool,
    line: usize,
    offset: usize,
}

/// Assembly state: the writer plus name tables.
struct AsmContext {
    writer: BytecodeWriter,
    labels: HashMap<String, LabelRef>,
    entry_points: Vec<(EntryPoint, usize, usize)>,
    variables: Vec<Variable>,
}

impl AsmContext {
    fn new() -> Self {
        Self {
            writer: BytecodeWriter::default(),
            labels: HashMap::new(),
            entry_points: Vec::new(),
            variables: Vec::new(),
        }
    }

    /// Returns the label called `name`, creating it on first use.
    fn label(&mut self, name: &str, line: usize, offset: usize) -> Result<Label, VMError> {
        if let Some(existing) = self.labels.get(name) {
            return Ok(existing.label);
        }
        let label = self.writer.create_label()?;
        self.labels.insert(
            name.to_string(),
            LabelRef {
                label,
                placed: false,
                line,
                offset,
            },
        );
        Ok(label)
    }

    fn define_label(
        &mut self,
        name: &str,
        public: bool,
        line: usize,
        offset: usize,
    ) -> Result<(), VMError> {
        let label = self.label(name, line, offset)?;
        if let Some(entry) = self.labels.get_mut(name) {
            if entry.placed {
                return Err(VMError::DuplicateLabel {
                    label: name.to_string(),
                });
            }
            entry.placed = true;
        }
        self.writer.place_label(label)?;
        if public {
            let entry = EntryPoint {
                name: name.to_string(),
                offset: self.writer.offset_of(label)?,
            };
            self.entry_points.push((entry, line, offset));
        }
        Ok(())
    }

    fn declare_variable(&mut self, name: &str, type_name: &str) -> Result<(), VMError> {
        let value_type =
            ScriptValueType::from_name(type_name).ok_or_else(|| VMError::InvalidOperand {
                token: type_name.to_string(),
                expected: "a variable type (u32, i32, float, entity)",
            })?;
        if self.variable(name).is_some() {
            return Err(VMError::DuplicateVariable {
                name: name.to_string(),
            });
        }
        self.variables.push(Variable {
            name: name.to_string(),
            value_type,
        });
        Ok(())
    }

    /// Environment index of a declared variable.
    fn variable(&self, name: &str) -> Option<i32> {
        self.variables
            .iter()
            .position(|v| v.name == name)
            .and_then(|i| i32::try_from(variable_index(i)).ok())
    }

    fn parse_operand(
        &mut self,
        kind: OperandKind,
        tok: Token<'_>,
        line: usize,
    ) -> Result<Operand, VMError> {
        match kind {
            OperandKind::ImmU32 => parse_word(tok.text).map(Operand::Word),
            OperandKind::ImmU64 => parse_wide(tok.text).map(Operand::Wide),
            OperandKind::Index => tok
                .text
                .parse::<i32>()
                .ok()
                .or_else(|| self.variable(tok.text))
                .map(Operand::Index)
                .ok_or_else(|| VMError::InvalidOperand {
                    token: tok.text.to_string(),
                    expected: kind.describe(),
                }),
            OperandKind::Label => self.label(tok.text, line, tok.offset).map(Operand::Label),
        }
    }

    fn instruction(&mut self, tokens: &[Token<'_>], line: usize) -> Result<(), VMError> {
        let Some((name, operands)) = tokens.split_first() else {
            return Ok(());
        };
        let instr =
            Instruction::from_mnemonic(name.text).ok_or_else(|| VMError::InvalidInstructionName {
                name: name.text.to_string(),
            })?;

        let expected = usize::from(instr.operand_kind().is_some());
        if operands.len() != expected {
            return Err(VMError::ArityMismatch {
                instruction: name.text.to_string(),
                expected,
                actual: operands.len(),
            });
        }

        let operand = match (instr.operand_kind(), operands.first()) {
            (Some(kind), Some(&tok)) => Some(
                self.parse_operand(kind, tok, line)
                    .map_err(|e| at(line, tok.offset, e))?,
            ),
            _ => None,
        };
        self.writer.emit(instr, operand)
    }

    fn directive(&mut self, tokens: &[Token<'_>]) -> Result<(), VMError> {
        match tokens[0].text {
            VAR_DIRECTIVE => match tokens {
                [_, name, ty] => self.declare_variable(name.text, ty.text),
                _ => Err(VMError::ArityMismatch {
                    instruction: VAR_DIRECTIVE.to_string(),
                    expected: 2,
                    actual: tokens.len() - 1,
                }),
            },
            other => Err(VMError::UnknownDirective {
                directive: other.to_string(),
            }),
        }
    }

    fn line(&mut self, line_no: usize, tokens: &[Token<'_>]) -> Result<(), VMError> {
        let Some(first) = tokens.first() else {
            return Ok(());
        };

        if first.text.starts_with(DIRECTIVE_PREFIX) {
            return self
                .directive(tokens)
                .map_err(|e| at(line_no, first.offset, e));
        }

        let public = first.text == PUB_KEYWORD;
        let label_idx = usize::from(public);
        let rest = match tokens.get(label_idx) {
            Some(tok) if is_label_def(tok.text) => {
                self.define_label(label_name(tok.text), public, line_no, tok.offset)
                    .map_err(|e| at(line_no, tok.offset, e))?;
                &tokens[label_idx + 1..]
            }
            _ if public => {
                return Err(VMError::ParseError {
                    line: line_no,
                    offset: first.offset,
                    message: "`pub` must be followed by a label definition",
                });
            }
            _ => tokens,
        };

        // Inner errors already carry a location.
        self.instruction(rest, line_no).map_err(|e| match e {
            VMError::AssemblyError { .. } => e,
            e => at(line_no, rest.first().map_or(first.offset, |t| t.offset), e),
        })
    }

    fn finish(self) -> Result<CompiledScript, VMError> {
        let mut unplaced: Vec<_> = self
            .labels
            .iter()
            .filter(|(_, r)| !r.placed)
            .collect();
        unplaced.sort_by_key(|(_, r)| (r.line, r.offset));
        if let Some((name, r)) = unplaced.first() {
            return Err(at(
                r.line,
                r.offset,
                VMError::UndefinedLabel {
                    label: name.to_string(),
                },
            ));
        }

        let len = self.writer.len();
        let mut entry_points = Vec::with_capacity(self.entry_points.len());
        for (entry, line, offset) in self.entry_points {
            if entry.offset as usize >= len {
                return Err(at(
                    line,
                    offset,
                    VMError::InvalidEntryPoint {
                        offset: entry.offset,
                        len,
                    },
                ));
            }
            entry_points.push(entry);
        }

        let bytecode = self.writer.end_write()?;
        CompiledScript::new(entry_points, self.variables, bytecode)
    }
}

fn at(line: usize, offset: usize, err: VMError) -> VMError {
    VMError::AssemblyError {
        line,
        offset,
        source: err.to_string(),
    }
}

fn assemble(source: &str) -> Result<CompiledScript, VMError> {
    let mut ctx = AsmContext::new();
    for (i, line) in source.lines().enumerate() {
        let tokens = tokenize(line);
        ctx.line(i + 1, &tokens)?;
    }
    ctx.finish()
}

/// Assemble a full source string into a [`CompiledScript`].
///
/// Labels may be referenced before they are defined; `pub` labels become
/// the script's entry points. On failure a compiler-style diagnostic is
/// logged and the error carries the line and column.
pub fn assemble_source(source: impl AsRef<str>) -> Result<CompiledScript, VMError> {
    assemble_source_with_name(source.as_ref(), "<source>")
}

/// Assembles source with an associated filename for error diagnostics.
pub fn assemble_source_with_name(
    source: &str,
    source_name: &str,
) -> Result<CompiledScript, VMError> {
    let result = assemble(source);
    match &result {
        Ok(script) => debug!(
            "assembled {source_name}: {} bytes, {} entry points, {} variables",
            script.bytecode().len(),
            script.entry_points().len(),
            script.variables().len()
        ),
        Err(err) => log_assembly_error(source_name, source, err),
    }
    result
}

/// Convenience: assemble directly from file path
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<CompiledScript, VMError> {
    let path_ref = path.as_ref();
    let source = fs::read_to_string(path_ref).map_err(|e| VMError::IoError {
        path: path_ref.display().to_string(),
        source: e.to_string(),
    })?;
    assemble_source_with_name(&source, &path_ref.display().to_string())
}
