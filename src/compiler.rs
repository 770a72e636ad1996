//! Contains the parser and bytecode compiler.
//!
//! This is a single-pass compiler: there is no syntax tree. The Pratt parser emits bytecode into
//! the [Chunk] as soon as it recognizes each construct.
use crate::chunk::WrittenOpcode;
use crate::error::{CompileFailure, Diagnostic, Diagnostics, Location};
use crate::object::Heap;
use crate::prelude::*;
use crate::scanner::{Lexeme, Scanner, Token};

extern crate static_assertions as sa;

/// How many locals can be in scope at once. Their slots must fit in a one-byte operand.
pub const U8_COUNT: usize = u8::MAX as usize + 1;

sa::const_assert_eq!(U8_COUNT - 1, u8::MAX as usize);

/// How deeply expressions and statements may nest inside each other. Each level recurses, so
/// this keeps pathological input from exhausting the native stack.
pub const MAX_NESTING: usize = 1024;

/////////////////////////////////////////// Public API ////////////////////////////////////////////

/// Compiles the given source code and, if successful, returns one bytecode [Chunk].
///
/// String literals and identifier names are interned in the given [Heap], so the chunk is only
/// meaningful to a VM that owns that heap.
///
/// Compilation always runs to the end of the source, so that every independent error is
/// reported. On failure, the [CompileFailure] holds every [Diagnostic] along with the partial
/// chunk, which must not be executed.
///
/// ```
/// # use bytelox::compiler::compile;
/// # use bytelox::object::Heap;
/// let mut heap = Heap::new();
/// assert!(compile("print 1 + 2;", &mut heap).is_ok());
///
/// let failure = compile("print 1 +;", &mut heap).unwrap_err();
/// assert_eq!(
///     "[line 1] Error at ';': Expect expression.",
///     failure.diagnostics.to_string()
/// );
/// ```
pub fn compile(source: &str, heap: &mut Heap) -> Result<Chunk, CompileFailure> {
    let parser = Parser::new(source);
    let compiler = Compiler::new(parser, heap);
    compiler.compile()
}

///////////////////////////////////// Implementation details //////////////////////////////////////

/// Precedence rules for [Token]s.
///
/// Precedence rules have a well-defined partial ordering ([PartialOrd]), which is required for use
/// in the Pratt parsing algorithm.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq)]
enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// + -
    Term,
    /// `*` `/`
    Factor,
    /// `!` `-`
    Unary,
    /// `.` `()`
    Call,
    /// Literals, and groupings
    Primary,
}

/// A rule in the Pratt parser table. See [Compiler::parse_precedence()] for usage.
#[derive(Copy, Clone)]
struct ParserRule {
    prefix: Option<PrefixRule>,
    infix: Option<InfixRule>,
    precedence: Precedence,
}

/// What to do when a token starts an expression.
#[derive(Copy, Clone, Debug)]
enum PrefixRule {
    Grouping,
    Unary,
    Number,
    String,
    Literal,
    Variable,
}

/// What to do when a token appears after a complete operand.
#[derive(Copy, Clone, Debug)]
enum InfixRule {
    Binary,
    And,
    Or,
}

/// Contains the parser state: the two-token window over the scanner, and the error status.
#[derive(Debug)]
struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Lexeme<'a>,
    previous: Lexeme<'a>,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
}

/// A local variable, as known at compile time.
#[derive(Debug, Clone, Copy)]
struct Local<'a> {
    name: &'a str,
    /// `None` while the initializer is still being compiled.
    depth: Option<usize>,
}

/// How a variable is reached at runtime.
#[derive(Debug, Clone, Copy)]
enum Variable {
    /// A stack slot.
    Local(u8),
    /// The index of the name in the constant pool.
    Global(u16),
}

/// Contains the compiler state: the [Parser], the chunk being produced, and the scopes.
struct Compiler<'a, 'h> {
    parser: Parser<'a>,
    compiling_chunk: Chunk,
    heap: &'h mut Heap,
    locals: Vec<Local<'a>>,
    scope_depth: usize,
    /// How many nested expressions and statements are being compiled right now.
    nesting: usize,
}

impl Precedence {
    /// Returns the next higher level of precedence.
    ///
    /// # Panics
    ///
    /// Panics if trying to obtain a higher-level of precedence than the maximum,
    /// [Precedence::Primary], which is the precedence of literals and l-values.
    #[inline]
    fn higher_precedence(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => panic!("Tried to get higher precedence than primary"),
        }
    }
}

impl ParserRule {
    /// Returns one level of precedence higher than the rule's precedence.
    /// See [Precedence::higher_precedence()].
    #[inline(always)]
    fn higher_precedence(&self) -> Precedence {
        self.precedence.higher_precedence()
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser for the given source code, primed with the first token.
    fn new(source: &'a str) -> Parser<'a> {
        let scanner = Scanner::new(source);
        let sentinel = scanner.make_sentinel("<before first token>");

        let mut parser = Parser {
            scanner,
            previous: sentinel.clone(),
            current: sentinel,
            diagnostics: Vec::new(),
            panic_mode: false,
        };
        parser.advance();
        parser
    }

    /// Update self.previous and self.current such that they move one token further in the token
    /// stream.
    fn advance(&mut self) {
        self.previous = self.current.clone();

        // Get tokens until we get a non-error token.
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token() != Token::Error {
                break;
            }

            self.error_at_current(self.current.text())
        }
    }

    /// Scan the next token. If the token is not of the desired type, an error is reported.
    fn consume(&mut self, desired_token: Token, message: &str) {
        if self.current.token() == desired_token {
            return self.advance();
        }

        self.error_at_current(message);
    }

    /// Return true if the current token is equal to the given token.
    fn check(&self, token: Token) -> bool {
        self.current.token() == token
    }

    /// Advances if the current token matches `desired_token`. Returns whether it matched.
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        if self.check(desired_token) {
            self.advance();
            return true;
        }
        false
    }

    /// Returns true if any error has been reported.
    fn had_error(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Report a compiler error, located at the previous [Lexeme]. In Pratt parsing, this is the
    /// handler you usually want to call, because the previous lexeme decided which [ParserRule]
    /// was accepted.
    fn error(&mut self, message: &str) {
        self.error_at(self.previous.clone(), message)
    }

    /// Report a compiler error, located at the current [Lexeme].
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.clone(), message)
    }

    /// Report a compiler error, located at the given [Lexeme].
    fn error_at(&mut self, lexeme: Lexeme<'a>, message: &str) {
        // Suppress the cascade of errors that usually follows the first one.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let location = match lexeme.token() {
            Token::Eof => Location::End,
            Token::Error => Location::Lexical,
            _ => Location::At(lexeme.text().to_owned()),
        };

        self.diagnostics.push(Diagnostic {
            line: lexeme.line(),
            location,
            message: message.to_owned(),
        });
    }

    /// Synchronize after being in panic mode.
    ///
    /// Discards tokens until we're probably at a statement boundary: just past a semicolon, or
    /// right before a keyword that starts a statement.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.token() != Token::Eof {
            if self.previous.token() == Token::Semicolon {
                return;
            }

            match self.current.token() {
                Token::Class
                | Token::Fun
                | Token::Var
                | Token::For
                | Token::If
                | Token::While
                | Token::Print
                | Token::Return => return,
                _ => self.advance(),
            }
        }
    }
}

impl<'a, 'h> Compiler<'a, 'h> {
    /// Creates a new compiler with the given [Parser].
    fn new(parser: Parser<'a>, heap: &'h mut Heap) -> Compiler<'a, 'h> {
        Compiler {
            parser,
            compiling_chunk: Chunk::default(),
            heap,
            locals: Vec::with_capacity(U8_COUNT),
            scope_depth: 0,
            nesting: 0,
        }
    }

    /// Takes ownership of the compiler, and returns the chunk
    fn compile(mut self) -> Result<Chunk, CompileFailure> {
        while !self.match_and_advance(Token::Eof) {
            self.declaration();
        }
        self.end_compiler();

        log::debug!(
            "compiled {} bytes, {} constants, {} errors",
            self.compiling_chunk.len(),
            self.compiling_chunk.constants.len(),
            self.parser.diagnostics.len()
        );

        if self.parser.had_error() {
            return Err(CompileFailure {
                diagnostics: Diagnostics(self.parser.diagnostics),
                chunk: self.compiling_chunk,
            });
        }

        Ok(self.compiling_chunk)
    }

    /// Signal the end of compilation.
    fn end_compiler(&mut self) {
        self.emit_return();

        // A listing of the bytecode to manually inspect compiled output.
        if log::log_enabled!(log::Level::Trace) && !self.parser.had_error() {
            log::trace!(
                "{}",
                crate::debug::disassemble_chunk(&self.compiling_chunk, self.heap, "code")
            );
        }
    }

    /// The core of the Pratt parsing algorithm.
    ///
    /// Parses anything at the given precedence level or higher.
    ///
    /// See: <https://en.wikipedia.org/wiki/Operator-precedence_parser#Pratt_parsing>
    fn parse_precedence(&mut self, precedence: Precedence) {
        if !self.enter_nesting("Expression nested too deeply.") {
            return;
        }
        self.parse_operators(precedence);
        self.nesting -= 1;
    }

    /// The prefix rule, then every infix rule that binds at least as tightly as `precedence`.
    fn parse_operators(&mut self, precedence: Precedence) {
        self.advance();

        // Only the loosest expressions may be assigned to: `a * b = c` must not parse as
        // `a * (b = c)`.
        let can_assign = precedence <= Precedence::Assignment;

        match self.rule_from_previous().prefix {
            Some(prefix) => self.apply_prefix(prefix, can_assign),
            None => {
                self.parser.error("Expect expression.");
                return;
            }
        }

        loop {
            let rule = self.rule_from_current();
            let Some(infix) = rule.infix else { break };
            if precedence > rule.precedence {
                break;
            }

            // current is now previous:
            self.advance();
            self.apply_infix(infix, can_assign);
        }

        // Nothing consumed the `=`, so whatever is on the left can't be assigned to.
        if can_assign && self.match_and_advance(Token::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    /// Goes one level deeper, unless that would be too deep. In that case, reports an error,
    /// skips the current token so that recovery still makes progress, and returns false.
    fn enter_nesting(&mut self, message: &str) -> bool {
        if self.nesting < MAX_NESTING {
            self.nesting += 1;
            return true;
        }

        self.parser.error_at_current(message);
        if !self.check(Token::Eof) {
            self.advance();
        }
        false
    }

    /// Dispatches a prefix rule. Assumes its token has already been consumed.
    fn apply_prefix(&mut self, rule: PrefixRule, can_assign: bool) {
        match rule {
            PrefixRule::Grouping => self.grouping(),
            PrefixRule::Unary => self.unary(),
            PrefixRule::Number => self.number(),
            PrefixRule::String => self.string(),
            PrefixRule::Literal => self.literal(),
            PrefixRule::Variable => self.variable(can_assign),
        }
    }

    /// Dispatches an infix rule. Assumes the operator has already been consumed.
    fn apply_infix(&mut self, rule: InfixRule, _can_assign: bool) {
        match rule {
            InfixRule::Binary => self.binary(),
            InfixRule::And => self.and(),
            InfixRule::Or => self.or(),
        }
    }

    ////////////////////////////////////////// Declarations ///////////////////////////////////////

    /// Parse a declaration.
    fn declaration(&mut self) {
        if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    /// Parse a variable declaration. Assumes `var` has already been consumed
    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_and_advance(Token::Equal) {
            self.expression();
        } else {
            self.emit_instruction(OpCode::Nil);
        }

        self.parser
            .consume(Token::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    /// Consume the next identifier and declare it as a variable.
    /// Returns the constant for the identifier name if it's a global, and `0` otherwise.
    fn parse_variable(&mut self, error_message: &str) -> u16 {
        self.parser.consume(Token::Identifier, error_message);

        self.declare_variable();
        if self.scope_depth > 0 {
            return 0;
        }

        let name = self.parser.previous.text();
        self.identifier_constant(name)
    }

    /// Record a new local in the current scope. Globals are late bound, so they're not declared.
    fn declare_variable(&mut self) {
        if self.scope_depth == 0 {
            return;
        }

        let name = self.parser.previous.text();
        let already_declared = self
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |depth| depth >= self.scope_depth))
            .any(|local| local.name == name);

        if already_declared {
            self.parser
                .error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    /// Appends an uninitialized local.
    fn add_local(&mut self, name: &'a str) {
        if self.locals.len() == U8_COUNT {
            self.parser.error("Too many local variables in function.");
            return;
        }

        self.locals.push(Local { name, depth: None });
    }

    /// The initializer of the most recent local has been compiled; it can now be referenced.
    fn mark_initialized(&mut self) {
        let depth = self.scope_depth;
        if let Some(local) = self.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    /// Define a new variable, whose value is on top of the stack.
    fn define_variable(&mut self, global: u16) {
        if self.scope_depth > 0 {
            // The value is already sitting in the local's stack slot.
            self.mark_initialized();
            return;
        }

        self.emit_with_index(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global);
    }

    /// Add the identifier text to the current chunk's constants table.
    fn identifier_constant(&mut self, name: &str) -> u16 {
        let name = self.heap.intern_constant(name);
        self.make_constant(name.into())
    }

    /// Find the stack slot of a local variable, searching innermost scopes first.
    fn resolve_local(&mut self, name: &str) -> Option<u8> {
        let (slot, local) = self
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)?;

        if local.depth.is_none() {
            self.parser
                .error("Can't read local variable in its own initializer.");
        }

        // add_local() never lets the locals outgrow a byte.
        u8::try_from(slot).ok()
    }

    /// Resolves a name to either a local slot or a global.
    fn resolve_variable(&mut self, name: &str) -> Variable {
        match self.resolve_local(name) {
            Some(slot) => Variable::Local(slot),
            None => Variable::Global(self.identifier_constant(name)),
        }
    }

    ////////////////////////////////////////// Statements /////////////////////////////////////////

    /// Parse a statement.
    fn statement(&mut self) {
        if !self.enter_nesting("Statement nested too deeply.") {
            return;
        }

        if self.match_and_advance(Token::Print) {
            self.print_statement();
        } else if self.match_and_advance(Token::If) {
            self.if_statement();
        } else if self.match_and_advance(Token::While) {
            self.while_statement();
        } else if self.match_and_advance(Token::For) {
            self.for_statement();
        } else if self.match_and_advance(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }

        self.nesting -= 1;
    }

    /// Parse a print statement. Assumes `print` has already been consumed.
    fn print_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expect ';' after value.");
        self.emit_instruction(OpCode::Print);
    }

    /// Parse an expression statement (e.g., assignments).
    fn expression_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expect ';' after expression.");
        // Statements have zero stack effect, but the expression left its value on the stack.
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse the declarations inside a block. Assumes `{` has already been consumed.
    fn block(&mut self) {
        while !self.check(Token::RightBrace) && !self.check(Token::Eof) {
            self.declaration();
        }

        self.parser
            .consume(Token::RightBrace, "Expect '}' after block.");
    }

    /// Parse an if statement. Assumes `if` has already been consumed.
    fn if_statement(&mut self) {
        self.parser
            .consume(Token::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_instruction(OpCode::Pop);

        if self.match_and_advance(Token::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    /// Parse a while loop. Assumes `while` has already been consumed.
    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.parser
            .consume(Token::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse a for loop. Assumes `for` has already been consumed.
    ///
    /// The increment clause is compiled before the body but runs after it, so the body jumps
    /// back to the increment, which in turn loops back to the condition.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.parser
            .consume(Token::LeftParen, "Expect '(' after 'for'.");

        if self.match_and_advance(Token::Semicolon) {
            // No initializer.
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_and_advance(Token::Semicolon) {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_instruction(OpCode::Pop);
        }

        if !self.match_and_advance(Token::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_instruction(OpCode::Pop);
            self.parser
                .consume(Token::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_instruction(OpCode::Pop);
        }

        self.end_scope();
    }

    /// Enter a new block scope.
    fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    /// Leave the current block scope, popping every local declared in it.
    fn end_scope(&mut self) {
        self.scope_depth -= 1;

        while let Some(local) = self.locals.last() {
            if local.depth.is_some_and(|depth| depth <= self.scope_depth) {
                break;
            }
            self.emit_instruction(OpCode::Pop);
            self.locals.pop();
        }
    }

    ///////////////////////////////////////// Expressions /////////////////////////////////////////

    /// Parse an expression.
    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Parse '(' as a prefix. Assumes '(' has been consumed.
    fn grouping(&mut self) {
        debug_assert_eq!(Token::LeftParen, self.previous_token());
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expect ')' after expression.");
    }

    /// Parse a number literal as a prefix. Assumes number has been consumed.
    fn number(&mut self) {
        debug_assert_eq!(Token::Number, self.previous_token());
        match self.parser.previous.text().parse::<f64>() {
            Ok(value) => self.emit_constant(value.into()),
            Err(_) => self.parser.error("Invalid number literal."),
        }
    }

    /// Parse a string literal. Add it to the constant pool.
    fn string(&mut self) {
        debug_assert_eq!(Token::StrLiteral, self.previous_token());

        // Access the string contents (without the quotes)
        let literal = self.parser.previous.text();
        debug_assert!(literal.len() >= 2);
        let contents = &literal[1..literal.len() - 1];

        let string = self.heap.intern_constant(contents);
        self.emit_constant(string.into());
    }

    /// Parse a keyword literal as a prefix. Assumes the keyword has been consumed.
    fn literal(&mut self) {
        match self.previous_token() {
            Token::False => self.emit_instruction(OpCode::False),
            Token::Nil => self.emit_instruction(OpCode::Nil),
            Token::True => self.emit_instruction(OpCode::True),
            _ => unreachable!(),
        };
    }

    /// Parse a variable. It can be either a variable access or assignment, which is why
    /// `can_assign` is threaded through every prefix rule.
    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous.text();
        self.named_variable(name, can_assign);
    }

    /// Emits a read of the named variable, or, if we're looking at `=` and allowed to assign,
    /// a write.
    fn named_variable(&mut self, name: &'a str, can_assign: bool) {
        let variable = self.resolve_variable(name);

        if can_assign && self.match_and_advance(Token::Equal) {
            self.expression();
            match variable {
                Variable::Local(slot) => self
                    .emit_instruction(OpCode::SetLocal)
                    .with_operand(slot),
                Variable::Global(name) => {
                    self.emit_with_index(OpCode::SetGlobal, OpCode::SetGlobalLong, name)
                }
            }
        } else {
            match variable {
                Variable::Local(slot) => self
                    .emit_instruction(OpCode::GetLocal)
                    .with_operand(slot),
                Variable::Global(name) => {
                    self.emit_with_index(OpCode::GetGlobal, OpCode::GetGlobalLong, name)
                }
            }
        }
    }

    /// Parse an unary operator as a prefix. Assumes the operator has been consumed.
    fn unary(&mut self) {
        let operator = self.previous_token();

        // Compile the operand, so that it's placed on the stack.
        self.parse_precedence(Precedence::Unary);

        match operator {
            Token::Bang => self.emit_instruction(OpCode::Not),
            Token::Minus => self.emit_instruction(OpCode::Negate),
            _ => unreachable!(),
        };
    }

    /// Parse a binary operator as an infix. Assumes the operator has been consumed.
    fn binary(&mut self) {
        let operator = self.previous_token();
        let rule = get_rule(operator);

        // Binary operators are left-associative, so the right operand binds tighter.
        self.parse_precedence(rule.higher_precedence());

        // `a != b` is `!(a == b)`, `a >= b` is `!(a < b)`, and `a <= b` is `!(a > b)`.
        let (opcode, negated) = match operator {
            Token::BangEqual => (OpCode::Equal, true),
            Token::EqualEqual => (OpCode::Equal, false),
            Token::Greater => (OpCode::Greater, false),
            Token::GreaterEqual => (OpCode::Less, true),
            Token::Less => (OpCode::Less, false),
            Token::LessEqual => (OpCode::Greater, true),
            Token::Plus => (OpCode::Add, false),
            Token::Minus => (OpCode::Subtract, false),
            Token::Star => (OpCode::Multiply, false),
            Token::Slash => (OpCode::Divide, false),
            _ => unreachable!(),
        };

        self.emit_instruction(opcode);
        if negated {
            self.emit_instruction(OpCode::Not);
        }
    }

    /// Parse `and`. The left operand is on the stack; skip the right one if it's falsy.
    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_instruction(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    /// Parse `or`. The left operand is on the stack; skip the right one if it's truthy.
    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_instruction(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    //////////////////////////////////////////// Emitting /////////////////////////////////////////

    /// Appends [OpCode::Return] to current [Chunk].
    fn emit_return(&mut self) {
        self.emit_instruction(OpCode::Return);
    }

    /// Appends a constant load to current [Chunk], using the short form if the index allows.
    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_with_index(OpCode::Constant, OpCode::ConstantLong, index);
    }

    /// Emits `short` with a one-byte operand if `index` fits, otherwise `long` with a two-byte
    /// operand.
    fn emit_with_index(&mut self, short: OpCode, long: OpCode, index: u16) {
        match u8::try_from(index) {
            Ok(index) => self.emit_instruction(short).with_operand(index),
            Err(_) => {
                self.emit_instruction(long).with_u16_operand(index);
            }
        }
    }

    /// Appends a new constant to the current [Chunk].
    ///
    /// # Error
    ///
    /// When the constant index can no longer be represented as a u16, this signals a compiler
    /// error and returns `0`. The current [Chunk] can still be appended to, however, it is
    /// invalid, and should not be emitted as a valid program.
    fn make_constant(&mut self, value: Value) -> u16 {
        let index = self.current_chunk().add_constant(value);
        match u16::try_from(index) {
            Ok(index) => index,
            Err(_) => {
                self.parser.error("Too many constants in one chunk.");
                0
            }
        }
    }

    /// Emits a jump with a placeholder offset. Returns where the offset lives, for
    /// [Compiler::patch_jump].
    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        self.emit_instruction(opcode).with_u16_operand(u16::MAX)
    }

    /// Backpatches a jump emitted by [Compiler::emit_jump] to land on the next instruction.
    fn patch_jump(&mut self, operand_offset: usize) {
        // The jump is relative to the instruction after the two-byte operand.
        let distance = self.current_chunk().len() - operand_offset - 2;

        match u16::try_from(distance) {
            Ok(distance) => self.current_chunk().patch_u16(operand_offset, distance),
            Err(_) => self.parser.error("Too much code to jump over."),
        }
    }

    /// Emits a backwards jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        // By the time the VM reads the operand, the ip is past the opcode and both operand bytes.
        let distance = self.current_chunk().len() + 3 - loop_start;

        let distance = match u16::try_from(distance) {
            Ok(distance) => distance,
            Err(_) => {
                self.parser.error("Loop body too large.");
                0
            }
        };
        self.emit_instruction(OpCode::Loop)
            .with_u16_operand(distance);
    }

    /// Writes an [OpCode] to the current [Chunk].
    /// Returns a [WrittenOpcode], with which you can write an operand.
    fn emit_instruction(&mut self, opcode: OpCode) -> WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line)
    }

    ///////////////////////////////////////// Aliases /////////////////////////////////////////////

    /// Returns the current [Chunk].
    #[inline(always)]
    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.compiling_chunk
    }

    /// Advance one token in scanner, such that:
    /// ```text
    /// (previous, current) = (current, scanner.next_token())
    /// ```
    #[inline(always)]
    fn advance(&mut self) {
        self.parser.advance()
    }

    /// Returns the line number of the prefix token, a.k.a., `self.parser.previous`.
    #[inline(always)]
    fn line_number_of_prefix(&self) -> usize {
        self.parser.previous.line()
    }

    /// Delegates to [Parser::check].
    #[inline(always)]
    fn check(&self, token: Token) -> bool {
        self.parser.check(token)
    }

    /// Delegates to [Parser::match_and_advance]. Returns true if the token was matched.
    #[inline(always)]
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        self.parser.match_and_advance(desired_token)
    }

    /// Returns the rule for the token that was just consumed.
    #[inline(always)]
    fn rule_from_previous(&self) -> ParserRule {
        get_rule(self.previous_token())
    }

    /// Returns the rule for the token about to be consumed.
    #[inline(always)]
    fn rule_from_current(&self) -> ParserRule {
        get_rule(self.parser.current.token())
    }

    /// Return the token (type) of the previous value. This is useful in prefix parser functions.
    #[inline(always)]
    fn previous_token(&self) -> Token {
        self.parser.previous.token()
    }
}

////////////////////////////////////////// Parser rules ///////////////////////////////////////////

/// Makes defining [ParserRule]s a bit cleaner looking.
macro_rules! rule {
    ($prefix:expr, $infix:expr, $precedence:expr) => {
        ParserRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $precedence,
        }
    };
}

#[rustfmt::skip]
fn get_rule(token: Token) -> ParserRule {
    use Token::*;
    use PrefixRule as P;
    use InfixRule as I;
    match token {
        //                     Prefix           Infix            Precedence
        LeftParen    => rule!{ Some(P::Grouping), None,            Precedence::None },
        RightParen   => rule!{ None,              None,            Precedence::None },
        LeftBrace    => rule!{ None,              None,            Precedence::None },
        RightBrace   => rule!{ None,              None,            Precedence::None },
        Comma        => rule!{ None,              None,            Precedence::None },
        Dot          => rule!{ None,              None,            Precedence::None },
        Minus        => rule!{ Some(P::Unary),    Some(I::Binary), Precedence::Term },
        Plus         => rule!{ None,              Some(I::Binary), Precedence::Term },
        Semicolon    => rule!{ None,              None,            Precedence::None },
        Slash        => rule!{ None,              Some(I::Binary), Precedence::Factor },
        Star         => rule!{ None,              Some(I::Binary), Precedence::Factor },
        Bang         => rule!{ Some(P::Unary),    None,            Precedence::None },
        BangEqual    => rule!{ None,              Some(I::Binary), Precedence::Equality },
        Equal        => rule!{ None,              None,            Precedence::None },
        EqualEqual   => rule!{ None,              Some(I::Binary), Precedence::Equality },
        Greater      => rule!{ None,              Some(I::Binary), Precedence::Comparison },
        GreaterEqual => rule!{ None,              Some(I::Binary), Precedence::Comparison },
        Less         => rule!{ None,              Some(I::Binary), Precedence::Comparison },
        LessEqual    => rule!{ None,              Some(I::Binary), Precedence::Comparison },
        Identifier   => rule!{ Some(P::Variable), None,            Precedence::None },
        StrLiteral   => rule!{ Some(P::String),   None,            Precedence::None },
        Number       => rule!{ Some(P::Number),   None,            Precedence::None },
        And          => rule!{ None,              Some(I::And),    Precedence::And },
        Class        => rule!{ None,              None,            Precedence::None },
        Else         => rule!{ None,              None,            Precedence::None },
        False        => rule!{ Some(P::Literal),  None,            Precedence::None },
        For          => rule!{ None,              None,            Precedence::None },
        Fun          => rule!{ None,              None,            Precedence::None },
        If           => rule!{ None,              None,            Precedence::None },
        Nil          => rule!{ Some(P::Literal),  None,            Precedence::None },
        Or           => rule!{ None,              Some(I::Or),     Precedence::Or },
        Print        => rule!{ None,              None,            Precedence::None },
        Return       => rule!{ None,              None,            Precedence::None },
        Super        => rule!{ None,              None,            Precedence::None },
        This         => rule!{ None,              None,            Precedence::None },
        True         => rule!{ Some(P::Literal),  None,            Precedence::None },
        Var          => rule!{ None,              None,            Precedence::None },
        While        => rule!{ None,              None,            Precedence::None },
        Error        => rule!{ None,              None,            Precedence::None },
        Eof          => rule!{ None,              None,            Precedence::None },
    }
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    use OpCode::*;

    fn compile_ok(source: &str) -> (Chunk, Heap) {
        let mut heap = Heap::new();
        match compile(source, &mut heap) {
            Ok(chunk) => (chunk, heap),
            Err(failure) => panic!("failed to compile {source:?}:\n{}", failure.diagnostics),
        }
    }

    fn errors(source: &str) -> Vec<String> {
        let mut heap = Heap::new();
        let failure = compile(source, &mut heap).expect_err("this should not compile");
        failure.diagnostics.iter().map(ToString::to_string).collect()
    }

    fn bytes(ops: &[OpCode]) -> Vec<u8> {
        ops.iter().map(|&op| op as u8).collect()
    }

    #[test]
    fn precedence_confidence_check() {
        // High-level precedence (C-like)
        assert!(Precedence::Assignment < Precedence::Or);
        assert!(Precedence::Or < Precedence::And);
        assert!(Precedence::And < Precedence::Equality);
        assert!(Precedence::Equality < Precedence::Comparison);

        // PEDMAS
        // () has greater precedence than */
        assert!(Precedence::Call > Precedence::Factor);
        // */ has greater precedence than +-
        assert!(Precedence::Factor > Precedence::Term);

        // `and` should be one level of precedence higher than `or`
        assert_eq!(Precedence::And, Precedence::Or.higher_precedence());
        assert_eq!(Precedence::Factor, Precedence::Term.higher_precedence());
    }

    #[test]
    fn every_infix_rule_has_a_precedence() {
        use Token::*;
        #[rustfmt::skip]
        let all = [
            LeftParen, RightParen, LeftBrace, RightBrace, Comma, Dot, Minus, Plus, Semicolon,
            Star, Slash, Bang, BangEqual, Equal, EqualEqual, Greater, GreaterEqual, Less,
            LessEqual, Identifier, StrLiteral, Number, And, Class, Else, False, For, Fun, If, Nil,
            Or, Print, Return, Super, This, True, Var, While, Error, Eof,
        ];
        for token in all {
            let rule = get_rule(token);
            assert_eq!(
                rule.infix.is_some(),
                rule.precedence != Precedence::None,
                "{token:?}"
            );
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let (chunk, _) = compile_ok("print 1 + 2 * 3;");
        #[rustfmt::skip]
        let expected = vec![
            Constant as u8, 0,
            Constant as u8, 1,
            Constant as u8, 2,
            Multiply as u8, Add as u8, Print as u8, Return as u8,
        ];
        assert_eq!(expected, chunk.code());
        assert_eq!(Some(Value::Number(3.0)), chunk.constants.get(2));
    }

    #[test]
    fn subtraction_is_left_associative() {
        let (chunk, _) = compile_ok("1 - 2 - 3;");
        #[rustfmt::skip]
        let expected = vec![
            Constant as u8, 0,
            Constant as u8, 1,
            Subtract as u8,
            Constant as u8, 2,
            Subtract as u8, Pop as u8, Return as u8,
        ];
        assert_eq!(expected, chunk.code());
    }

    #[test]
    fn comparison_operators_desugar() {
        let (chunk, _) = compile_ok("true != false;");
        assert_eq!(bytes(&[True, False, Equal, Not, Pop, Return]), chunk.code());

        let (chunk, _) = compile_ok("!nil;");
        assert_eq!(bytes(&[Nil, Not, Pop, Return]), chunk.code());
    }

    #[test]
    fn globals_use_interned_names() {
        let (chunk, heap) = compile_ok("var answer = 42; print answer;");
        #[rustfmt::skip]
        let expected = vec![
            Constant as u8, 1,
            DefineGlobal as u8, 0,
            GetGlobal as u8, 2,
            Print as u8, Return as u8,
        ];
        assert_eq!(expected, chunk.code());

        // Two constants for the same name, but only one string object.
        assert_eq!(chunk.constants.get(0), chunk.constants.get(2));
        assert_eq!(1, heap.len());
    }

    #[test]
    fn locals_live_on_the_stack() {
        let (chunk, _) = compile_ok("{ var a = 1; var b = a; b = 2; }");
        #[rustfmt::skip]
        let expected = vec![
            Constant as u8, 0,
            GetLocal as u8, 0,
            Constant as u8, 1,
            SetLocal as u8, 1,
            Pop as u8,
            // end of scope
            Pop as u8, Pop as u8,
            Return as u8,
        ];
        assert_eq!(expected, chunk.code());
    }

    #[test]
    fn if_jumps_are_backpatched() {
        let (chunk, _) = compile_ok("if (true) print 1;");
        #[rustfmt::skip]
        let expected = vec![
            True as u8,
            JumpIfFalse as u8, 7, 0,
            Pop as u8,
            Constant as u8, 0,
            Print as u8,
            Jump as u8, 1, 0,
            Pop as u8,
            Return as u8,
        ];
        assert_eq!(expected, chunk.code());
    }

    #[test]
    fn while_loops_jump_backwards() {
        let (chunk, _) = compile_ok("while (false) nil;");
        #[rustfmt::skip]
        let expected = vec![
            False as u8,
            JumpIfFalse as u8, 6, 0,
            Pop as u8,
            Nil as u8, Pop as u8,
            Loop as u8, 10, 0,
            Pop as u8,
            Return as u8,
        ];
        assert_eq!(expected, chunk.code());
    }

    #[test]
    fn many_constants_switch_to_the_long_form() {
        let source: String = (0..300).map(|i| format!("{i};")).collect();
        let (chunk, _) = compile_ok(&source);

        // 256 short loads (3 bytes with the pop), then 44 long loads (4 bytes).
        assert_eq!(256 * 3 + 44 * 4 + 1, chunk.len());
        let first_long = 256 * 3;
        assert_eq!(Some(ConstantLong), chunk.get(first_long).unwrap().as_opcode());
        assert_eq!(Some(256), chunk.read_u16(first_long + 1));
        assert_eq!(Some(Value::Number(256.0)), chunk.constants.get(256));
    }

    #[test]
    fn many_globals_switch_to_the_long_form() {
        let source: String = (0..300).map(|i| format!("var g{i};")).collect();
        let (chunk, _) = compile_ok(&source);

        // The last declaration: Nil, DefineGlobalLong lo hi, then the final Return.
        let last = chunk.len() - 5;
        assert_eq!(Some(Nil), chunk.get(last).unwrap().as_opcode());
        assert_eq!(Some(DefineGlobalLong), chunk.get(last + 1).unwrap().as_opcode());
        assert_eq!(Some(299), chunk.read_u16(last + 2));
    }

    #[test]
    fn compiling_is_deterministic() {
        let source = "var a = \"x\"; { var b = a + \"y\"; while (b != a) { b = a; } } print a;";
        let (first, _) = compile_ok(source);
        let (second, _) = compile_ok(source);
        assert_eq!(first, second);
    }

    #[test]
    fn line_map_covers_every_byte() {
        let (chunk, _) = compile_ok("var a = 1;\n\nprint a\n  + 2;\n");
        let total: usize = chunk.line_runs().map(|(_, length)| length).sum();
        assert_eq!(chunk.len(), total);
        for offset in 0..chunk.len() {
            assert!(chunk.line_number_for(offset).is_some());
        }
        assert_eq!(Some(1), chunk.line_number_for(0));
        // The print happens once its semicolon has been seen...
        assert_eq!(Some(4), chunk.line_number_for(chunk.len() - 2));
        // ...and the implicit return belongs to the end of the file.
        assert_eq!(Some(5), chunk.line_number_for(chunk.len() - 1));
    }

    #[test]
    fn reports_every_independent_error() {
        let diagnostics = errors("print 1\nprint 2\n");
        assert_eq!(
            vec![
                "[line 2] Error at 'print': Expect ';' after value.",
                "[line 3] Error at end: Expect ';' after value.",
            ],
            diagnostics
        );
    }

    #[test]
    fn one_report_per_statement() {
        // Both problems are in the same statement, so only the first one is reported.
        let diagnostics = errors("print (1 + ;\nprint 2;");
        assert_eq!(vec!["[line 1] Error at ';': Expect expression."], diagnostics);
    }

    #[test]
    fn lexical_errors_are_reported() {
        let diagnostics = errors("print @;");
        assert_eq!("[line 1] Error: Unexpected character.", diagnostics[0]);
    }

    #[test]
    fn failed_compiles_keep_the_partial_chunk() {
        let mut heap = Heap::new();
        let failure = compile("print 1; print;", &mut heap).unwrap_err();
        assert_eq!(1, failure.diagnostics.len());
        assert!(!failure.chunk.is_empty());
    }

    #[test]
    fn invalid_assignment_targets() {
        assert_eq!(
            vec!["[line 1] Error at '=': Invalid assignment target."],
            errors("var a; var b; a + b = 3;")
        );
        assert_eq!(
            vec!["[line 1] Error at '=': Invalid assignment target."],
            errors("1 = 2;")
        );
    }

    #[test]
    fn locals_cannot_read_themselves_in_their_initializer() {
        assert_eq!(
            vec!["[line 1] Error at 'a': Can't read local variable in its own initializer."],
            errors("{ var a = a; }")
        );
        // ...but a global can shadow nothing and be read later.
        compile_ok("var a = 1; { var b = a; }");
    }

    #[test]
    fn redeclaring_a_local_in_the_same_scope() {
        assert_eq!(
            vec!["[line 1] Error at 'a': Already a variable with this name in this scope."],
            errors("{ var a; var a; }")
        );
        // Shadowing in an inner scope is fine.
        compile_ok("{ var a; { var a; } }");
    }

    #[test]
    fn too_many_locals() {
        let declarations: String = (0..=U8_COUNT).map(|i| format!("var l{i};")).collect();
        let diagnostics = errors(&format!("{{ {declarations} }}"));
        assert_eq!(
            vec![format!(
                "[line 1] Error at 'l{U8_COUNT}': Too many local variables in function."
            )],
            diagnostics
        );
    }

    #[test]
    fn too_many_constants() {
        let source: String = (0..=u16::MAX as usize + 1).map(|i| format!("{i};")).collect();
        let diagnostics = errors(&source);
        assert_eq!(
            vec!["[line 1] Error at '65536': Too many constants in one chunk."],
            diagnostics
        );
    }

    #[test]
    fn too_much_code_to_jump_over() {
        let body = "1;".repeat(22_000);
        let diagnostics = errors(&format!("if (true) {{ {body} }}"));
        assert_eq!(
            vec!["[line 1] Error at '}': Too much code to jump over."],
            diagnostics
        );
    }

    #[test]
    fn loop_body_too_large() {
        let body = "1;".repeat(22_000);
        let diagnostics = errors(&format!("while (true) {{ {body} }}"));
        assert_eq!(
            vec!["[line 1] Error at '}': Loop body too large."],
            diagnostics
        );
    }

    #[test]
    fn deeply_nested_expressions_are_rejected() {
        let depth = 100_000;
        let source = format!("print {}1{};", "(".repeat(depth), ")".repeat(depth));
        let diagnostics = errors(&source);
        assert_eq!(
            vec!["[line 1] Error at '(': Expression nested too deeply."],
            diagnostics
        );
    }

    #[test]
    fn deeply_nested_blocks_are_rejected() {
        let depth = 100_000;
        let source = format!("{}print 1;{}", "{".repeat(depth), "}".repeat(depth));
        let diagnostics = errors(&source);
        // Recovery leaves the outermost braces unmatched, which is reported after this.
        assert_eq!(
            Some("[line 1] Error at '{': Statement nested too deeply."),
            diagnostics.first().map(String::as_str)
        );
    }

    #[test]
    fn nesting_below_the_limit_compiles() {
        let depth = MAX_NESTING / 2;
        let source = format!("print {}1{};", "(".repeat(depth), ")".repeat(depth));
        let mut heap = Heap::new();
        assert!(compile(&source, &mut heap).is_ok());
    }

    #[test]
    fn missing_closing_brace() {
        assert_eq!(
            vec!["[line 1] Error at end: Expect '}' after block."],
            errors("{ print 1;")
        );
    }
}
