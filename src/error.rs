//! Provides [InterpretationError], the error that most things return.
use std::fmt;

use thiserror::Error;

use crate::chunk::Chunk;

/// Any error that can occur during interpretation.
#[derive(Debug, Error)]
pub enum InterpretationError {
    /// A compile-time error, such as a syntax error, or a name error.
    #[error("compile-time error:\n{0}")]
    CompileError(Diagnostics),
    /// A runtime error, such as a type error or an undefined variable.
    #[error("runtime error: {0}")]
    RuntimeError(#[from] RuntimeError),
}

/// A single compile-time error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub location: Location,
    pub message: String,
}

/// Where on its line a [Diagnostic] points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// At the offending lexeme.
    At(String),
    /// At the end of the source code.
    End,
    /// The scanner rejected the input; the message says what's wrong.
    Lexical,
}

/// Every [Diagnostic] from one compilation, in the order they were reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics(pub Vec<Diagnostic>);

/// A failed compilation: the diagnostics, and whatever bytecode was produced anyway.
///
/// The chunk is only useful for inspection. It must not be executed.
#[derive(Debug, Error)]
#[error("{diagnostics}")]
pub struct CompileFailure {
    pub diagnostics: Diagnostics,
    pub chunk: Chunk,
}

/// An error that aborted execution.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}\n[line {line}] in script")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    /// The source line of the instruction that failed (0 if unknown).
    pub line: usize,
}

/// Everything that can go wrong while the VM runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeErrorKind {
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    #[error("Operands must be two numbers or two strings.")]
    OperandsMustBeNumbersOrStrings,
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Stack underflow.")]
    StackUnderflow,
    #[error("Invalid opcode {0:#04x}.")]
    InvalidOpcode(u8),
    #[error("Instruction pointer out of bounds.")]
    InstructionPointerOutOfBounds,
    #[error("Invalid constant index {0}.")]
    InvalidConstant(usize),
    #[error("Invalid local slot {0}.")]
    InvalidLocalSlot(usize),
    #[error("Could not write output: {0}")]
    Output(String),
}

impl InterpretationError {
    /// The conventional exit code (see: man 3 sysexits) for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            // EX_DATAERR
            InterpretationError::CompileError(_) => 65,
            // EX_SOFTWARE
            InterpretationError::RuntimeError(_) => 70,
        }
    }
}

impl Diagnostics {
    /// Returns how many errors were reported.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the reports.
    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            Location::At(lexeme) => write!(f, " at '{lexeme}'")?,
            Location::End => write!(f, " at end")?,
            Location::Lexical => (),
        }
        write!(f, ": {}", self.message)
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, diagnostic) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

impl From<CompileFailure> for InterpretationError {
    fn from(failure: CompileFailure) -> Self {
        InterpretationError::CompileError(failure.diagnostics)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn diagnostics_render_one_per_line() {
        let diagnostics = Diagnostics(vec![
            Diagnostic {
                line: 3,
                location: Location::At("+".to_owned()),
                message: "Expect expression.".to_owned(),
            },
            Diagnostic {
                line: 4,
                location: Location::End,
                message: "Expect ';' after value.".to_owned(),
            },
            Diagnostic {
                line: 5,
                location: Location::Lexical,
                message: "Unexpected character.".to_owned(),
            },
        ]);

        assert_eq!(
            "[line 3] Error at '+': Expect expression.\n\
             [line 4] Error at end: Expect ';' after value.\n\
             [line 5] Error: Unexpected character.",
            diagnostics.to_string()
        );
    }

    #[test]
    fn runtime_errors_mention_the_line() {
        let error = RuntimeError {
            kind: RuntimeErrorKind::UndefinedVariable("x".to_owned()),
            line: 2,
        };
        assert_eq!("Undefined variable 'x'.\n[line 2] in script", error.to_string());
        assert_eq!(70, InterpretationError::from(error).exit_code());
    }
}
