//! Contains the Von parser and bytecode compiler.
//!
//! This is a single-pass compiler: the Pratt parser consumes tokens and
//! emits bytecode as it goes, with no syntax tree in between. Nested
//! function declarations push a fresh [FunctionCompiler] onto a stack and
//! pop it when the body ends, which is also how upvalue resolution walks
//! outward through enclosing functions.

use std::rc::Rc;

use crate::chunk::{OpCode, WrittenOpcode};
use crate::heap::Heap;
use crate::object::{Function, Obj, ObjRef};
use crate::prelude::*;

/////////////////////////////////////////// Public API ////////////////////////////////////////////

/// Compiles the given Von source code and, if successful, returns the handle
/// of the top-level script [Function], freshly allocated on `heap` along
/// with every literal and nested function the script contains.
pub fn compile(source: &str, heap: &mut Heap) -> crate::Result<ObjRef> {
    let parser = Parser::new(source);
    let compiler = Compiler::new(parser, heap);
    compiler.compile()
}

///////////////////////////////////// Implementation details //////////////////////////////////////

const U8_COUNT: usize = u8::MAX as usize + 1;
const MAX_ARITY: u8 = 255;

/// Contains the compiler state: the [Parser] plus a stack of the functions
/// currently being compiled, innermost last. The stack never empties until
/// [Compiler::compile] pops the script itself.
struct Compiler<'a, 'h> {
    parser: Parser<'a>,
    heap: &'h mut Heap,
    functions: Vec<FunctionCompiler<'a>>,
    /// How many `class` bodies enclose the current token. `this` is only
    /// meaningful when this is non-zero.
    class_depth: usize,
}

/// What kind of function body is being compiled. The distinction matters for
/// `return` (scripts reject it, initializers return `this`) and for the
/// reserved local in slot zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

/// Per-function compilation state.
struct FunctionCompiler<'a> {
    fn_type: FunctionType,
    /// Interned function name; `None` only for the script.
    name: Option<ObjRef>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'a>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

#[derive(Clone, Copy)]
struct Local<'a> {
    name: &'a str,
    /// `None` while the variable is declared but its initializer has not
    /// finished compiling; reading it in that window is an error.
    depth: Option<usize>,
    /// Set when a nested function captures this local, so the slot is
    /// hoisted into an upvalue instead of popped at scope end.
    is_captured: bool,
}

/// A compile-time upvalue descriptor: where the captured variable lives in
/// the *enclosing* function (a local slot, or one of its own upvalues).
#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Contains the parser state. For some strange reason, this also includes error status.
#[derive(Debug)]
struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Lexeme<'a>,
    previous: Lexeme<'a>,
    had_error: bool,
    panic_mode: bool,
}

/// A rule in the Pratt parser table. See [Compiler::parse_precedence()] for usage.
#[derive(Copy, Clone)]
struct ParserRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

/// Any possible action taken from the parsing table. Actions take the entire compiler state, and
/// convert it, usually emitting bytecode.
type ParserFn = fn(&mut Compiler, bool) -> ();

/// Precedence rules for [Token]s in Von.
///
/// Precedence rules have a well-defined ordering, which is required for use in the Pratt parsing
/// algorithm.
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

///////////////////////////////////////// Implementations /////////////////////////////////////////

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
    /// Creates a new parser for the given source code.
    fn new(source: &'a str) -> Parser<'a> {
        let mut scanner = Scanner::new(source);
        let first_token = scanner.scan_token();
        let error_token = scanner.make_sentinel("<before first token>");

        Parser {
            scanner,
            previous: error_token,
            current: first_token,
            had_error: false,
            panic_mode: false,
        }
    }

    /// Update self.previous and self.current such that they move one token further in the token
    /// stream.
    fn advance(&mut self) {
        self.previous = self.current;

        // Get tokens until we get a non-error token.
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token() != Token::Error {
                break;
            }

            self.error_at_current(self.current.text())
        }
    }

    /// Scan the next token. If the token is not of the desired type, an error message is printed.
    fn consume(&mut self, desired_token: Token, message: &'static str) {
        if self.current.token() == desired_token {
            return self.advance();
        }

        self.error_at_current(message);
    }

    /// Return true if the current token is equal to the given token.
    fn check(&self, token: Token) -> bool {
        self.current.token() == token
    }

    /// Scan the next token. Advances if the token matches `desired_token`. Returns whether
    /// `desired_token` was matched.
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        if self.check(desired_token) {
            self.advance();
            return true;
        }
        false
    }

    /// Emit a compiler error, located at the previous [Lexeme]. In Pratt parsing, this is the
    /// handler you usually want to call, because the previous lexeme decided which [ParserRule]
    /// was accepted.
    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message)
    }

    /// Emit a compiler error, located at the current [Lexeme].
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message)
    }

    /// Emit a compiler error, located at the given [Lexeme].
    fn error_at(&mut self, lexeme: Lexeme<'a>, message: &str) {
        // *Attempt* to prevent a deluge of spurious syntax errors:
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        self.had_error = true;

        // Print the actual message:
        eprint!("[line {}] Error", lexeme.line());
        if lexeme.token() == Token::Eof {
            eprint!(" at end");
        } else if lexeme.token() == Token::Error {
            // Nothing
        } else {
            eprint!(" at '{}'", lexeme.text());
        }
        eprintln!(": {message}");
    }

    /// Synchronize after being in panic mode.
    ///
    /// The heuristic is that we're going to gobble up and discard tokens until we **think** we're
    /// a point that makes sense in the grammar. Points that make sense in a grammar are the start
    /// of statements (statement boundaries). We could be wrong!
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

impl<'a> FunctionCompiler<'a> {
    fn new(fn_type: FunctionType, name: Option<ObjRef>) -> FunctionCompiler<'a> {
        // Slot zero belongs to the callee. In methods it is addressable as
        // `this`; everywhere else its empty name can never be resolved.
        let slot_zero = Local {
            name: match fn_type {
                FunctionType::Method | FunctionType::Initializer => "this",
                _ => "",
            },
            depth: Some(0),
            is_captured: false,
        };

        FunctionCompiler {
            fn_type,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

impl<'a, 'h> Compiler<'a, 'h> {
    /// Creates a new compiler with the given [Parser], compiling a top-level script.
    fn new(parser: Parser<'a>, heap: &'h mut Heap) -> Compiler<'a, 'h> {
        Compiler {
            parser,
            heap,
            functions: vec![FunctionCompiler::new(FunctionType::Script, None)],
            class_depth: 0,
        }
    }

    /// Takes ownership of the compiler, and returns the compiled script function.
    fn compile(mut self) -> crate::Result<ObjRef> {
        while !self.match_and_advance(Token::Eof) {
            self.declaration();
        }
        let (script, _) = self.finish_function();

        if self.parser.had_error {
            return Err(InterpretationError::CompileError);
        }

        Ok(script)
    }

    /// Finish the innermost function being compiled: emit the implicit
    /// return, freeze its chunk, and allocate the [Function] object. Returns
    /// the handle and the upvalue descriptors the emitter must append after
    /// [OpCode::Closure].
    fn finish_function(&mut self) -> (ObjRef, Vec<UpvalueRef>) {
        self.emit_return();

        let fc = self.functions.pop().expect("function stack cannot be empty");
        let function = self.heap.alloc_obj(Obj::Function(Function {
            arity: fc.arity,
            upvalue_count: fc.upvalues.len(),
            chunk: Rc::new(fc.chunk),
            name: fc.name,
        }));

        // Print a listing of the bytecode to manually inspect compiled output.
        if cfg!(feature = "print_code") && !self.parser.had_error {
            let label = match fc.name {
                Some(name) => self.heap.as_str(name).to_string(),
                None => "<script>".to_string(),
            };
            crate::debug::disassemble_chunk(self.heap, &self.heap.function(function).chunk, &label);
        }

        (function, fc.upvalues)
    }

    /// The implicit return value is `nil`, except in initializers, where it
    /// is the receiver sitting in slot zero.
    fn emit_return(&mut self) {
        if self.fc().fn_type == FunctionType::Initializer {
            self.emit_instruction(OpCode::GetLocal).with_operand(0);
        } else {
            self.emit_instruction(OpCode::Nil);
        }
        self.emit_instruction(OpCode::Return);
    }

    /// Create a new block scope. Make sure to decrement it later.
    fn begin_scope(&mut self) {
        self.fc_mut().scope_depth += 1;
    }

    /// Pop one scope from the block, discarding its locals. Captured locals
    /// are closed into their upvalues instead of being dropped.
    fn end_scope(&mut self) {
        assert!(self.fc().scope_depth > 0);
        self.fc_mut().scope_depth -= 1;

        loop {
            let fc = self.fc();
            let captured = match fc.locals.last() {
                Some(local) if local.depth.is_some_and(|depth| depth > fc.scope_depth) => {
                    local.is_captured
                }
                _ => break,
            };

            // The compile-time vector of locals parallels the runtime stack;
            // so we both pop the compiler's stack AND the runtime stack!
            if captured {
                self.emit_instruction(OpCode::CloseUpvalue);
            } else {
                self.emit_instruction(OpCode::Pop);
            }
            self.fc_mut().locals.pop();
        }
    }

    /// The core of the Pratt parsing algorithm.
    ///
    /// See: <https://en.wikipedia.org/wiki/Operator-precedence_parser#Pratt_parsing>
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;

        // First, figure out how to parse the prefix.
        if let Some(prefix_rule) = self.rule_from_previous().prefix {
            prefix_rule(self, can_assign);
        } else {
            self.parser.error("Expect expression.");
            return;
        }

        while precedence <= self.rule_from_current().precedence {
            // current is now previous:
            self.advance();
            let infix_rule = self
                .rule_from_previous()
                .infix
                .expect("a rule with a defined precedence must always have an infix rule");

            infix_rule(self, can_assign);
        }

        // If `=` is still sitting in the stream, nothing consumed it: the
        // expression to its left was not an assignable target.
        if can_assign && self.match_and_advance(Token::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    /// Intern the identifier text and add it to the current chunk's constant pool.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::Obj(interned))
    }

    /// Finds the slot index for a local of the given function, or returns None if it's not a
    /// local (either a global, an upvalue, or a mistake).
    fn resolve_local(&mut self, function_index: usize, name: &str) -> Option<u8> {
        let fc = &self.functions[function_index];
        let mut found = None;
        for (i, local) in fc.locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i, local.depth.is_none()));
                break;
            }
        }

        let (index, uninitialized) = found?;
        if uninitialized {
            self.parser
                .error("Can't read local variable in its own initializer.");
        }
        u8::try_from(index).ok()
    }

    /// Finds (or records) an upvalue of the given function for `name`,
    /// searching the enclosing functions from the inside out. Marks the
    /// captured local in whichever enclosing function owns it.
    fn resolve_upvalue(&mut self, function_index: usize, name: &str) -> Option<u8> {
        if function_index == 0 {
            // The script has no enclosing function to capture from.
            return None;
        }

        if let Some(local) = self.resolve_local(function_index - 1, name) {
            self.functions[function_index - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(
                function_index,
                UpvalueRef {
                    index: local,
                    is_local: true,
                },
            );
        }

        if let Some(upvalue) = self.resolve_upvalue(function_index - 1, name) {
            return self.add_upvalue(
                function_index,
                UpvalueRef {
                    index: upvalue,
                    is_local: false,
                },
            );
        }

        None
    }

    /// Append an upvalue descriptor, deduplicating: capturing the same
    /// variable twice yields the same upvalue index.
    fn add_upvalue(&mut self, function_index: usize, upvalue: UpvalueRef) -> Option<u8> {
        let upvalues = &mut self.functions[function_index].upvalues;

        if let Some(existing) = upvalues.iter().position(|&u| u == upvalue) {
            return Some(existing as u8);
        }

        if upvalues.len() >= U8_COUNT {
            self.parser.error("Too many closure variables in function.");
            return Some(0);
        }

        upvalues.push(upvalue);
        Some((self.functions[function_index].upvalues.len() - 1) as u8)
    }

    /// Indicate that we need a slot for another local variable.
    fn declare_variable(&mut self) {
        if self.fc().scope_depth == 0 {
            // Global variables don't need to be "declared"
            return;
        }

        let name = self.parser.previous.text();

        // Check whether we're redefining elements in the local scope:
        let fc = self.fc();
        let mut duplicate = false;
        for local in fc.locals.iter().rev() {
            if local.depth.is_some_and(|depth| depth < fc.scope_depth) {
                // It's okay to shadow a variable from an outer scope.
                break;
            }

            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.parser
                .error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: &'a str) {
        if self.fc().locals.len() >= U8_COUNT {
            self.parser.error("Too many local variables in function.");
            return;
        }

        self.fc_mut().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    /// Consume the next identifier and interpret it as a variable.
    /// Returns the constant for the identifier name (globals only; locals return 0).
    fn parse_variable(&mut self, error_message: &'static str) -> u8 {
        self.parser.consume(Token::Identifier, error_message);

        self.declare_variable();
        if self.fc().scope_depth > 0 {
            // In a local scope.
            return 0;
        }

        let name = self.parser.previous.text();
        self.identifier_constant(name)
    }

    /// Mark the last local as being initialized. Does nothing at the global scope.
    fn mark_initialized(&mut self) {
        if self.fc().scope_depth == 0 {
            return;
        }
        let depth = self.fc().scope_depth;
        self.fc_mut()
            .locals
            .last_mut()
            .expect("a local was just declared")
            .depth = Some(depth);
    }

    /// Define a new variable.
    fn define_variable(&mut self, global: u8) {
        if self.fc().scope_depth > 0 {
            // It's a local variable. Set that it's ready to be used:
            self.mark_initialized();
            return;
        }

        self.emit_instruction(OpCode::DefineGlobal)
            .with_operand(global);
    }

    /// Parse a variable reference. This could either be an access or an assignment, depending on
    /// `can_assign` and the syntactic context. Resolution order: local slot, then upvalue, then
    /// global by name.
    fn named_variable(&mut self, name: &'a str, can_assign: bool) {
        let function_index = self.functions.len() - 1;
        let (get_op, set_op, arg) = {
            if let Some(arg) = self.resolve_local(function_index, name) {
                (OpCode::GetLocal, OpCode::SetLocal, arg)
            } else if let Some(arg) = self.resolve_upvalue(function_index, name) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, arg)
            } else {
                let arg = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, arg)
            }
        };

        // Peek ahead and look if we're assigning.
        // This only works if we're parsing at a lower or equal precedence to assignment.
        if can_assign && self.match_and_advance(Token::Equal) {
            // We're in an assignment expression!
            // Parse the right-hand side:
            self.expression();
            self.emit_instruction(set_op).with_operand(arg);
        } else {
            // A reference to an existing variable.
            self.emit_instruction(get_op).with_operand(arg);
        }
    }

    /// Parse the comma-separated arguments of a call. Leaves each argument
    /// on the stack and returns how many there were.
    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.parser.check(Token::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARITY {
                    self.parser.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(Token::RightParen, "Expect ')' after arguments.");
        count
    }

    ////////////////////////////////// Declarations and statements ////////////////////////////////

    /// Parse a declaration.
    fn declaration(&mut self) {
        if self.match_and_advance(Token::Class) {
            self.class_declaration();
        } else if self.match_and_advance(Token::Fun) {
            self.fun_declaration();
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else if self.match_and_advance(Token::Import) {
            self.parser.error("'import' declarations are not implemented.");
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    /// Parse a statement.
    fn statement(&mut self) {
        if self.match_and_advance(Token::Print) {
            self.print_statement();
        } else if self.match_and_advance(Token::For) {
            self.for_statement();
        } else if self.match_and_advance(Token::If) {
            self.if_statement();
        } else if self.match_and_advance(Token::Return) {
            self.return_statement();
        } else if self.match_and_advance(Token::While) {
            self.while_statement();
        } else if self.match_and_advance(Token::Switch) {
            self.parser.error("'switch' statements are not implemented.");
        } else if self.match_and_advance(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// Parse an expression.
    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Parse a block.
    /// Assumes a new scope has already been created for this block.
    fn block(&mut self) {
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.declaration();
        }

        self.parser
            .consume(Token::RightBrace, "Expect '}' after block.");
    }

    /// Parse a function's parameter list and body. Assumes the name has just
    /// been consumed. Emits [OpCode::Closure] with the upvalue descriptors.
    fn function(&mut self, fn_type: FunctionType) {
        let name = self.heap.intern(self.parser.previous.text());
        self.functions.push(FunctionCompiler::new(fn_type, Some(name)));
        self.begin_scope();

        self.parser
            .consume(Token::LeftParen, "Expect '(' after function name.");
        if !self.parser.check(Token::RightParen) {
            loop {
                if self.fc().arity == MAX_ARITY {
                    self.parser
                        .error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.fc_mut().arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(Token::RightParen, "Expect ')' after parameters.");
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the whole frame disappears when the function returns.
        let (function, upvalues) = self.finish_function();
        let index = self.make_constant(Value::Obj(function));
        self.emit_instruction(OpCode::Closure).with_operand(index);
        for upvalue in upvalues {
            let line = self.line_number_of_prefix();
            self.current_chunk().write_byte(upvalue.is_local as u8, line);
            self.current_chunk().write_byte(upvalue.index, line);
        }
    }

    /// Parse a class declaration: the name, then `{ method* }`.
    fn class_declaration(&mut self) {
        self.parser.consume(Token::Identifier, "Expect class name.");
        let class_name = self.parser.previous.text();
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_instruction(OpCode::Class).with_operand(name_constant);
        self.define_variable(name_constant);

        self.class_depth += 1;

        // Load the class back onto the stack so each OP_METHOD finds it.
        self.named_variable(class_name, false);
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before class body.");
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.method();
        }
        self.parser
            .consume(Token::RightBrace, "Expect '}' after class body.");
        self.emit_instruction(OpCode::Pop);

        self.class_depth -= 1;
    }

    /// Parse one method inside a class body. A method named `init` is the
    /// class initializer and compiles under stricter `return` rules.
    fn method(&mut self) {
        self.parser.consume(Token::Identifier, "Expect method name.");
        let name = self.parser.previous.text();
        let constant = self.identifier_constant(name);

        let fn_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type);
        self.emit_instruction(OpCode::Method).with_operand(constant);
    }

    /// Parse a function declaration. Assumes `fun` has already been consumed.
    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialized eagerly so the body can call itself recursively.
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    /// Parse a variable declaration. Assumes `var` has already been consumed.
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

    /// Parse an expression statement (e.g., assignments, function calls).
    fn expression_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expect ';' after expression.");
        // Expressions produce a thing on the stack, and we need to get rid of it:
        // statements must have zero stack effect.
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse a print statement. Assumes `print` has already been consumed.
    fn print_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expect ';' after value.");
        self.emit_instruction(OpCode::Print);
    }

    /// Parse a return statement. Assumes `return` has already been consumed.
    fn return_statement(&mut self) {
        if self.fc().fn_type == FunctionType::Script {
            self.parser.error("Can't return from top-level code.");
        }

        if self.match_and_advance(Token::Semicolon) {
            self.emit_return();
        } else {
            if self.fc().fn_type == FunctionType::Initializer {
                self.parser
                    .error("Can't return a value from an initializer.");
            }
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after return value.");
            self.emit_instruction(OpCode::Return);
        }
    }

    /// Parse an if statement, with optional else. Both jump targets are
    /// patched so that exactly one `POP` of the condition runs on each path.
    fn if_statement(&mut self) {
        self.parser.consume(Token::LeftParen, "Expect '(' after 'if'.");
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

    /// Parse a while statement.
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

    /// Parse a for statement: `for (init; cond; inc) body`.
    ///
    /// The increment clause compiles *before* the body in the byte stream
    /// but runs after it, which costs one jump over the increment and one
    /// extra loop edge back to it.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.parser.consume(Token::LeftParen, "Expect '(' after 'for'.");

        // Initializer clause.
        if self.match_and_advance(Token::Semicolon) {
            // No initializer.
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();

        // Condition clause.
        let exit_jump = if !self.match_and_advance(Token::Semicolon) {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after loop condition.");
            let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_instruction(OpCode::Pop);
            Some(exit_jump)
        } else {
            None
        };

        // Increment clause.
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

    ///////////////////////////////////////// Bytecode /////////////////////////////////////////////

    /// Appends [OpCode::Constant] to current [Chunk], using the given value.
    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_instruction(OpCode::Constant).with_operand(index);
    }

    /// Appends a new constant to the current [Chunk]'s pool.
    ///
    /// # Error
    ///
    /// When the constant index is greater than 255 (and thus can no longer be represented as a
    /// u8), this signals a compiler error and returns `0u8`. The current [Chunk] can still be
    /// appended to, however, it is invalid, and should not be emitted as a valid program.
    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().add_constant(value) {
            index
        } else {
            self.parser.error("Too many constants in one chunk.");
            0
        }
    }

    /// Emits a jump instruction with a placeholder operand. Returns the
    /// operand's offset for [Compiler::patch_jump].
    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        self.emit_instruction(opcode).with_u16_operand(0xffff)
    }

    /// Point the placeholder left by [Compiler::emit_jump] at the current
    /// end of the chunk.
    fn patch_jump(&mut self, offset: usize) {
        // -2 to adjust for the operand bytes themselves, which the VM has
        // already consumed when it applies the jump.
        let jump = self.current_chunk().len() - offset - 2;

        if jump > u16::MAX as usize {
            self.parser.error("Too much code to jump over.");
        }

        self.current_chunk()
            .patch_u16(offset, u16::try_from(jump).unwrap_or(u16::MAX));
    }

    /// Emits an unconditional backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        // +3 accounts for the OP_LOOP instruction and operand about to be
        // written: the VM subtracts the distance after consuming them.
        let offset = self.current_chunk().len() + 3 - loop_start;
        if offset > u16::MAX as usize {
            self.parser.error("Loop body too large.");
        }

        self.emit_instruction(OpCode::Loop)
            .with_u16_operand(u16::try_from(offset).unwrap_or(u16::MAX));
    }

    /// Writes an [OpCode] to the current [Chunk].
    /// Returns a [WrittenOpcode], with which you can write an operand.
    fn emit_instruction(&mut self, opcode: OpCode) -> WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line)
    }

    /// Writes two [OpCode] to the current [Chunk].
    fn emit_instructions(&mut self, op1: OpCode, op2: OpCode) -> WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(op1, line);
        self.current_chunk().write_opcode(op2, line)
    }

    ///////////////////////////////////////// Aliases /////////////////////////////////////////////

    /// Returns the function currently being compiled.
    #[inline(always)]
    fn fc(&self) -> &FunctionCompiler<'a> {
        self.functions.last().expect("function stack cannot be empty")
    }

    #[inline(always)]
    fn fc_mut(&mut self) -> &mut FunctionCompiler<'a> {
        self.functions
            .last_mut()
            .expect("function stack cannot be empty")
    }

    /// Returns the current [Chunk].
    #[inline(always)]
    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.fc_mut().chunk
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

    /// Delegates to [Parser::match_and_advance]. Returns true if the token was matched.
    #[inline(always)]
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        self.parser.match_and_advance(desired_token)
    }

    /// Returns the rule of the prefix in the process of being parsed.
    #[inline(always)]
    fn rule_from_previous(&self) -> ParserRule {
        get_rule(self.previous_token())
    }

    /// Returns the rule of the upcoming token.
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
    match token {
        //                     Prefix            Infix                 Precedence
        LeftParen    => rule!{ Some(grouping),   Some(call),           Precedence::Call },
        RightParen   => rule!{ None,             None,                 Precedence::None },
        LeftBrace    => rule!{ None,             None,                 Precedence::None },
        RightBrace   => rule!{ None,             None,                 Precedence::None },
        Comma        => rule!{ None,             None,                 Precedence::None },
        Dot          => rule!{ None,             Some(dot),            Precedence::Call },
        Minus        => rule!{ Some(unary),      Some(binary),         Precedence::Term },
        Plus         => rule!{ None,             Some(binary),         Precedence::Term },
        Semicolon    => rule!{ None,             None,                 Precedence::None },
        Slash        => rule!{ None,             Some(binary),         Precedence::Factor },
        Star         => rule!{ None,             Some(binary),         Precedence::Factor },
        Colon        => rule!{ None,             None,                 Precedence::None },
        Bang         => rule!{ Some(unary),      None,                 Precedence::None },
        BangEqual    => rule!{ None,             Some(binary),         Precedence::Equality },
        Equal        => rule!{ None,             None,                 Precedence::None },
        EqualEqual   => rule!{ None,             Some(binary),         Precedence::Equality },
        Greater      => rule!{ None,             Some(binary),         Precedence::Comparison },
        GreaterEqual => rule!{ None,             Some(binary),         Precedence::Comparison },
        Less         => rule!{ None,             Some(binary),         Precedence::Comparison },
        LessEqual    => rule!{ None,             Some(binary),         Precedence::Comparison },
        Identifier   => rule!{ Some(variable),   None,                 Precedence::None },
        StrLiteral   => rule!{ Some(string),     None,                 Precedence::None },
        Number       => rule!{ Some(number),     None,                 Precedence::None },
        And          => rule!{ None,             Some(and_operator),   Precedence::And },
        Case         => rule!{ None,             None,                 Precedence::None },
        Class        => rule!{ None,             None,                 Precedence::None },
        Default      => rule!{ None,             None,                 Precedence::None },
        Else         => rule!{ None,             None,                 Precedence::None },
        False        => rule!{ Some(literal),    None,                 Precedence::None },
        For          => rule!{ None,             None,                 Precedence::None },
        Fun          => rule!{ None,             None,                 Precedence::None },
        If           => rule!{ None,             None,                 Precedence::None },
        Import       => rule!{ None,             None,                 Precedence::None },
        Nil          => rule!{ Some(literal),    None,                 Precedence::None },
        Or           => rule!{ None,             Some(or_operator),    Precedence::Or },
        Print        => rule!{ None,             None,                 Precedence::None },
        Return       => rule!{ None,             None,                 Precedence::None },
        Super        => rule!{ Some(super_expr), None,                 Precedence::None },
        Switch       => rule!{ None,             None,                 Precedence::None },
        This         => rule!{ Some(this_expr),  None,                 Precedence::None },
        True         => rule!{ Some(literal),    None,                 Precedence::None },
        Var          => rule!{ None,             None,                 Precedence::None },
        While        => rule!{ None,             None,                 Precedence::None },
        Error        => rule!{ None,             None,                 Precedence::None },
        Eof          => rule!{ None,             None,                 Precedence::None },
    }
}

/// Parse '(' as a prefix. Assumes '(' has been consumed.
fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::LeftParen, compiler.previous_token());
    compiler.expression();
    compiler
        .parser
        .consume(Token::RightParen, "Expect ')' after expression.");
}

/// Parse a number literal as a prefix. Assumes number has been consumed.
fn number(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Number, compiler.previous_token());
    let value = compiler
        .parser
        .previous
        .text()
        .parse::<f64>()
        .expect("Internal error: Token::Number MUST parse as a float, but didn't?");
    compiler.emit_constant(value.into());
}

/// Parse an unary operator as a prefix. Assumes the operator has been consumed.
fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();

    // Compile the operand, so that it's placed on the stack.
    compiler.parse_precedence(Precedence::Unary);

    match operator {
        Token::Bang => compiler.emit_instruction(OpCode::Not),
        Token::Minus => compiler.emit_instruction(OpCode::Negate),
        _ => unreachable!(),
    };
}

/// Parse a binary operator as an infix. Assumes the operator has been consumed.
fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();
    let rule = get_rule(operator);

    compiler.parse_precedence(rule.higher_precedence());
    match operator {
        Token::BangEqual => compiler.emit_instructions(OpCode::Equal, OpCode::Not),
        Token::EqualEqual => compiler.emit_instruction(OpCode::Equal),
        Token::Greater => compiler.emit_instruction(OpCode::Greater),
        Token::GreaterEqual => compiler.emit_instructions(OpCode::Less, OpCode::Not),
        Token::Less => compiler.emit_instruction(OpCode::Less),
        Token::LessEqual => compiler.emit_instructions(OpCode::Greater, OpCode::Not),
        Token::Plus => compiler.emit_instruction(OpCode::Add),
        Token::Minus => compiler.emit_instruction(OpCode::Subtract),
        Token::Star => compiler.emit_instruction(OpCode::Multiply),
        Token::Slash => compiler.emit_instruction(OpCode::Divide),
        _ => unreachable!(),
    };
}

/// Parse a call's argument list as an infix of '('. The callee is whatever
/// the preceding expression left on the stack.
fn call(compiler: &mut Compiler, _can_assign: bool) {
    let arg_count = compiler.argument_list();
    compiler.emit_instruction(OpCode::Call).with_operand(arg_count);
}

/// Parse a property access or assignment as an infix of '.'.
fn dot(compiler: &mut Compiler, can_assign: bool) {
    compiler
        .parser
        .consume(Token::Identifier, "Expect property name after '.'.");
    let name = compiler.parser.previous.text();
    let constant = compiler.identifier_constant(name);

    if can_assign && compiler.match_and_advance(Token::Equal) {
        compiler.expression();
        compiler
            .emit_instruction(OpCode::SetProperty)
            .with_operand(constant);
    } else {
        compiler
            .emit_instruction(OpCode::GetProperty)
            .with_operand(constant);
    }
}

/// Parse a keyword literal as a prefix. Assumes the keyword has been consumed.
fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.previous_token() {
        Token::False => compiler.emit_instruction(OpCode::False),
        Token::Nil => compiler.emit_instruction(OpCode::Nil),
        Token::True => compiler.emit_instruction(OpCode::True),
        _ => unreachable!(),
    };
}

/// Parse a string literal. Interns its contents and adds them to the constant pool.
fn string(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::StrLiteral, compiler.previous_token());

    // Access the string contents (without the quotes)
    let literal = compiler.parser.previous.text();
    debug_assert!(literal.len() >= 2);
    debug_assert!(literal.starts_with('"'));
    debug_assert!(literal.ends_with('"'));

    let last_index = literal.len() - 1;
    let contents = &literal[1..last_index];
    let interned = compiler.heap.intern(contents);
    compiler.emit_constant(Value::Obj(interned));
}

/// Parse a variable. It can be either a variable access or assignment, which is why `can_assign`
/// is required by all callbacks!
fn variable(compiler: &mut Compiler, can_assign: bool) {
    let name = compiler.parser.previous.text();
    compiler.named_variable(name, can_assign);
}

/// Parse `this` as a prefix. It resolves like a local variable: methods
/// reserve slot zero under that name.
fn this_expr(compiler: &mut Compiler, _can_assign: bool) {
    if compiler.class_depth == 0 {
        compiler.parser.error("Can't use 'this' outside of a class.");
        return;
    }
    compiler.named_variable("this", false);
}

/// `super` is scanned but Von has no inheritance to resolve it against.
fn super_expr(compiler: &mut Compiler, _can_assign: bool) {
    compiler.parser.error("Von does not support inheritance.");
}

/// Parse the right-hand side of an `and`, short-circuiting over it when the
/// left-hand side is falsy (which stays on the stack as the result).
fn and_operator(compiler: &mut Compiler, _can_assign: bool) {
    let end_jump = compiler.emit_jump(OpCode::JumpIfFalse);

    compiler.emit_instruction(OpCode::Pop);
    compiler.parse_precedence(Precedence::And);

    compiler.patch_jump(end_jump);
}

/// Parse the right-hand side of an `or`, short-circuiting over it when the
/// left-hand side is truthy.
fn or_operator(compiler: &mut Compiler, _can_assign: bool) {
    let else_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    let end_jump = compiler.emit_jump(OpCode::Jump);

    compiler.patch_jump(else_jump);
    compiler.emit_instruction(OpCode::Pop);

    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(end_jump);
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;
    use crate::object::Obj;

    fn chunk_bytes(chunk: &Chunk) -> Vec<u8> {
        (0..chunk.len())
            .map(|i| chunk.get(i).unwrap().as_byte())
            .collect()
    }

    /// Compile and return (heap, script function handle).
    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let script = compile(source, &mut heap).expect("program should compile");
        (heap, script)
    }

    fn compile_fails(source: &str) {
        let mut heap = Heap::new();
        assert!(
            compile(source, &mut heap).is_err(),
            "expected a compile error for: {source}"
        );
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
    fn compilation_is_deterministic() {
        let source = "
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 1) + fib(n - 2);
            }
            for (var i = 0; i < 10; i = i + 1) {
                print fib(i);
            }
        ";
        let (heap_a, script_a) = compile_ok(source);
        let (heap_b, script_b) = compile_ok(source);
        assert_eq!(
            chunk_bytes(&heap_a.function(script_a).chunk),
            chunk_bytes(&heap_b.function(script_b).chunk),
        );
    }

    #[test]
    fn expression_statements_emit_a_pop() {
        let (heap, script) = compile_ok("1 + 2;");
        let chunk = &heap.function(script).chunk;
        let bytes = chunk_bytes(chunk);
        // CONST 1, CONST 2, ADD, POP, then the implicit NIL RETURN.
        assert_eq!(
            vec![
                OpCode::Constant as u8, 0,
                OpCode::Constant as u8, 1,
                OpCode::Add as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ],
            bytes
        );
    }

    #[test]
    fn block_locals_resolve_to_stack_slots() {
        let (heap, script) = compile_ok("{ var a = 1; print a; }");
        let chunk = &heap.function(script).chunk;
        let bytes = chunk_bytes(chunk);
        // Slot 1: slot 0 is reserved for the script itself.
        assert_eq!(
            vec![
                OpCode::Constant as u8, 0,
                OpCode::GetLocal as u8, 1,
                OpCode::Print as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ],
            bytes
        );
    }

    #[test]
    fn jump_offsets_land_inside_the_chunk() {
        let (heap, script) =
            compile_ok("if (true) { print 1; } else { print 2; } while (false) { print 3; }");
        let chunk = &heap.function(script).chunk;

        let mut offset = 0;
        while offset < chunk.len() {
            let opcode = chunk.get(offset).unwrap().as_opcode().expect("valid opcode");
            offset += match opcode {
                OpCode::Jump | OpCode::JumpIfFalse => {
                    let distance = chunk.get_u16(offset + 1).unwrap() as usize;
                    let target = offset + 3 + distance;
                    assert!(target <= chunk.len(), "forward jump out of bounds");
                    3
                }
                OpCode::Loop => {
                    let distance = chunk.get_u16(offset + 1).unwrap() as usize;
                    assert!(distance <= offset + 3, "backward jump out of bounds");
                    3
                }
                OpCode::Constant | OpCode::GetLocal | OpCode::SetLocal | OpCode::Call => 2,
                _ => 1,
            };
        }
    }

    #[test]
    fn capturing_the_same_variable_twice_shares_one_upvalue() {
        let (heap, script) = compile_ok("fun mk(x) { fun f() { return x + x; } return f; }");

        // Dig out `f`: script constants hold `mk`, whose constants hold `f`.
        let mk = heap
            .function(script)
            .chunk
            .constants()
            .iter()
            .filter_map(|v| v.as_obj())
            .find_map(|r| match heap.get(r) {
                Obj::Function(f) => Some(f),
                _ => None,
            })
            .expect("script should hold fn mk");
        let f = mk
            .chunk
            .constants()
            .iter()
            .filter_map(|v| v.as_obj())
            .find_map(|r| match heap.get(r) {
                Obj::Function(f) if f.upvalue_count > 0 => Some(f),
                _ => None,
            })
            .expect("mk should hold fn f");

        assert_eq!(1, f.upvalue_count, "x must be captured exactly once");
    }

    #[test]
    fn transitive_capture_goes_through_the_middle_function() {
        let (heap, script) = compile_ok(
            "fun outer(x) { fun middle() { fun inner() { return x; } return inner; } return middle; }",
        );

        // outer captures nothing; middle captures x as a local of outer;
        // inner captures x as an upvalue of middle.
        let outer = heap
            .function(script)
            .chunk
            .constants()
            .iter()
            .filter_map(|v| v.as_obj())
            .find_map(|r| match heap.get(r) {
                Obj::Function(f) => Some(f),
                _ => None,
            })
            .expect("script should hold fn outer");
        assert_eq!(0, outer.upvalue_count);

        let middle = outer
            .chunk
            .constants()
            .iter()
            .filter_map(|v| v.as_obj())
            .find_map(|r| match heap.get(r) {
                Obj::Function(f) => Some(f),
                _ => None,
            })
            .expect("outer should hold fn middle");
        assert_eq!(1, middle.upvalue_count);

        let inner = middle
            .chunk
            .constants()
            .iter()
            .filter_map(|v| v.as_obj())
            .find_map(|r| match heap.get(r) {
                Obj::Function(f) => Some(f),
                _ => None,
            })
            .expect("middle should hold fn inner");
        assert_eq!(1, inner.upvalue_count);
    }

    #[test]
    fn classes_and_methods_compile() {
        let (_, _) = compile_ok(
            "class Point {
                init(x, y) { this.x = x; this.y = y; }
                sum() { return this.x + this.y; }
            }
            var p = Point(1, 2);
            print p.sum();",
        );
    }

    #[test]
    fn error_cases() {
        // Reading a local in its own initializer.
        compile_fails("{ var a = a; }");
        // Duplicate declaration in the same scope.
        compile_fails("{ var a = 1; var a = 2; }");
        // Assignment to a non-target.
        compile_fails("1 + 2 = 3;");
        // Return outside a function.
        compile_fails("return 1;");
        // Returning a value from an initializer.
        compile_fails("class C { init() { return 1; } }");
        // `this` outside a class.
        compile_fails("print this;");
        // No inheritance.
        compile_fails("print super.method();");
        // Unimplemented statements are rejected, not ignored.
        compile_fails("switch (1) { case 1: print 1; }");
        compile_fails("import os;");
        // Missing semicolon.
        compile_fails("print 1");
    }

    #[test]
    fn panic_mode_recovers_and_reports_later_errors() {
        // Two independent errors; the second proves synchronize() made it
        // back to a statement boundary instead of giving up.
        let mut heap = Heap::new();
        let result = compile("var 1 = 2; var b = ; print b;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn scope_bookkeeping_is_balanced() {
        // Deep nesting compiles fine and pops everything back out.
        let (heap, script) = compile_ok("{ var a = 1; { var b = 2; { var c = a + b; print c; } } }");
        let chunk = &heap.function(script).chunk;
        let bytes = chunk_bytes(chunk);
        let pops = bytes
            .iter()
            .filter(|&&b| b == OpCode::Pop as u8)
            .count();
        // Three locals, each popped once at its scope end.
        assert!(pops >= 3);
    }
}
