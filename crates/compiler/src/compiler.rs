//! Single-pass Pratt compiler: parses and emits bytecode in the same
//! pass, with no intermediate AST. One `FunctionState` is pushed per
//! function/method/initializer being compiled; resolving an identifier
//! walks that stack outward, checking the current function's locals, then
//! each enclosing function's locals, then recursing into upvalues.

use std::ptr::NonNull;

use ember_core::chunk::Chunk;
use ember_core::heap::Heap;
use ember_core::object::{Closure as ObjClosure, FunctionKind, Obj, ObjFunction, ObjKind};
use ember_core::opcode::OpCode;
use ember_core::value::Value;

use crate::config::CompilerConfig;
use crate::diagnostics::{CompileError, Diagnostic};
use crate::precedence::Precedence;
use crate::scanner::{Scanner, Token, TokenKind};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct LoopState {
    start: usize,
    scope_depth: i32,
}

struct FunctionState {
    name: Option<String>,
    kind: FunctionKind,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopState>,
}

impl FunctionState {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        // Slot 0 is reserved: `this` for methods/initializers, unnamed
        // otherwise.
        let slot0_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        FunctionState {
            name,
            kind,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: slot0_name.to_string(),
                depth: 0,
                is_captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

pub struct Compiler<'a> {
    scanner: Scanner<'a>,
    heap: &'a Heap,
    config: &'a CompilerConfig,
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    functions: Vec<FunctionState>,
    classes: Vec<ClassState>,
}

impl<'a> Compiler<'a> {
    pub fn new(source: &'a [u8], heap: &'a Heap, config: &'a CompilerConfig) -> Self {
        let mut scanner = Scanner::new(source);
        let first = scanner.scan_token();
        Compiler {
            scanner,
            heap,
            config,
            current: first,
            previous: Token {
                kind: TokenKind::Eof,
                lexeme: String::new(),
                line: 0,
            },
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            functions: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    /// Compiles the whole source as the implicit top-level script
    /// function. Returns `Err` with every diagnostic collected if any
    /// error occurred; a failed compile never hands back a function.
    pub fn compile(mut self) -> Result<NonNull<Obj>, CompileError> {
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::Eof, "Expect end of expression.");
        let function = self.end_compiler();
        if self.had_error {
            Err(CompileError {
                diagnostics: self.diagnostics,
            })
        } else {
            Ok(function)
        }
    }

    // ---- token stream -------------------------------------------------

    fn advance(&mut self) {
        std::mem::swap(&mut self.previous, &mut self.current);
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.clone();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        self.error_at(line, message);
    }

    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.error_at(line, message);
    }

    fn error_at(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.diagnostics.push(Diagnostic {
            line,
            message: message.to_string(),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- chunk emission -------------------------------------------------

    fn func(&mut self) -> &mut FunctionState {
        self.functions.last_mut().expect("function stack never empty")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.func().chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_two(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let len = self.chunk().code.len();
        let offset = len - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let line = self.previous.line;
        self.chunk().write_u16(offset as u16, line);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let line = self.previous.line;
        self.chunk().write_u16(0xffff, line);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().code.len() - offset - 2;
        if self.chunk().patch_u16(offset, jump).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_return(&mut self) {
        if self.func().kind == FunctionKind::Initializer {
            self.emit_two(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk().add_constant(value) {
            Ok(idx) => idx,
            Err(()) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_two(OpCode::Constant, idx);
    }

    fn intern(&mut self, text: &str) -> NonNull<Obj> {
        // SAFETY: the mark closure only reads already-allocated constant
        // pools reachable through `self.functions`; it runs synchronously
        // inside `heap.intern`/`heap.alloc` and never re-enters them.
        let functions = &self.functions;
        self.heap.intern(text.as_bytes(), &mut |h| {
            for f in functions {
                for c in &f.chunk.constants {
                    h.mark_value(*c);
                }
            }
        })
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let ptr = self.intern(name);
        self.make_constant(Value::Obj(ptr))
    }

    // ---- scopes and variables ------------------------------------------

    fn begin_scope(&mut self) {
        self.func().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.func().scope_depth -= 1;
        let depth = self.func().scope_depth;
        while let Some(local) = self.func().locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.func().locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.func().locals.pop();
        }
    }

    fn declare_variable(&mut self) {
        if self.func().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();
        let depth = self.func().scope_depth;
        for local in self.func().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: String) {
        if self.func().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.func().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.func().scope_depth == 0 {
            return;
        }
        let depth = self.func().scope_depth;
        self.func().locals.last_mut().unwrap().depth = depth;
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.func().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.func().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_two(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        let locals = &self.functions[func_idx].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &mut self.functions[func_idx].upvalues;
        for (i, up) in upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        upvalues.push(UpvalueDesc { index, is_local });
        (upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        let enclosing = func_idx - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(func_idx, local, true));
        }
        if let Some(up) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(func_idx, up, false));
        }
        None
    }

    // ---- declarations and statements ------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Break) {
            self.error("Unsupported statement.");
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.func().loops.push(LoopState {
            start: loop_start,
            scope_depth: self.func().scope_depth,
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.func().loops.pop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.func().loops.push(LoopState {
            start: loop_start,
            scope_depth: self.func().scope_depth,
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        self.func().loops.pop();
        self.end_scope();
    }

    fn continue_statement(&mut self) {
        let Some(loop_state) = self.func().loops.last() else {
            self.error("Can't use 'continue' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return;
        };
        let start = loop_state.start;
        let loop_depth = loop_state.scope_depth;
        // Pop locals declared deeper than the loop's own scope before
        // looping back, mirroring `end_scope`'s close/pop choice.
        for local in self.func().locals.iter().rev() {
            if local.depth <= loop_depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
        self.emit_loop(start);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }

    fn return_statement(&mut self) {
        if self.func().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.func().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_tok = self.previous.clone_for_class();
        let name_const = self.identifier_constant(&name_tok);
        self.declare_variable();

        self.emit_two(OpCode::Class, name_const);
        self.define_variable(name_const);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Extends) || self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if self.previous.lexeme == name_tok {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&name_tok, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&name_tok, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.pop().unwrap().has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);
        let kind = if name == self.config.initializer_name_str() {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_two(OpCode::Method, name_const);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.functions
            .push(FunctionState::new(kind, Some(self.previous.lexeme.clone())));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.func().arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.func().arity += 1;
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // `end_compiler` allocates the ObjFunction and also emits the
        // trailing (isLocal, index) upvalue pairs into what is now the
        // enclosing chunk again, so nothing further is needed here.
        let function_obj = self.end_compiler();
        let idx = self.make_constant(Value::Obj(function_obj));
        self.emit_two(OpCode::Closure, idx);
    }

    fn end_compiler(&mut self) -> NonNull<Obj> {
        self.emit_return();
        let state = self.functions.pop().expect("balanced function stack");
        let upvalue_count = state.upvalues.len() as u8;

        // `state.chunk.constants` is reachable from nowhere else until it's
        // folded into `function` below, so both allocations that follow
        // the pop must keep marking it explicitly alongside the remaining
        // compiler stack.
        let name_obj = state.name.as_deref().map(|n| {
            let functions = &self.functions;
            let popped_constants = &state.chunk.constants;
            self.heap.intern(n.as_bytes(), &mut |h| {
                for c in popped_constants {
                    h.mark_value(*c);
                }
                for f in functions {
                    for c in &f.chunk.constants {
                        h.mark_value(*c);
                    }
                }
            })
        });

        let function = ObjFunction {
            arity: state.arity,
            upvalue_count,
            chunk: state.chunk,
            name: name_obj,
            kind: state.kind,
        };

        let functions = &self.functions;
        // Cloned (not borrowed) so `function` can still move into the
        // `alloc` call below: a `Value` copy preserves pointer identity, so
        // marking through the clone marks the same heap objects.
        let popped_constants = function.chunk.constants.clone();
        let obj = self.heap.alloc(ObjKind::Function(function), &mut |h| {
            for c in &popped_constants {
                h.mark_value(*c);
            }
            for f in functions {
                for c in &f.chunk.constants {
                    h.mark_value(*c);
                }
            }
        });

        // Emit the (isLocal, index) pair per upvalue into the *enclosing*
        // chunk, immediately after the OP_CLOSURE+constant-index pair
        // `function()` just emitted.
        for up in &state.upvalues {
            self.emit_byte(up.is_local as u8);
            self.emit_byte(up.index);
        }

        obj
    }

    // ---- expressions -----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= self.infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn infix_precedence(&self, kind: TokenKind) -> Precedence {
        use TokenKind::*;
        match kind {
            Or => Precedence::Or,
            And => Precedence::And,
            BitwiseOr => Precedence::BitwiseOr,
            BitwiseXor => Precedence::BitwiseXor,
            BitwiseAnd => Precedence::BitwiseAnd,
            BangEqual | EqualEqual => Precedence::Equality,
            Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
            LeftShift | RightShift | UnsignedLeftShift | UnsignedRightShift => Precedence::Shift,
            Plus | Minus => Precedence::Term,
            Star | Slash | Percent => Precedence::Factor,
            LeftParen | Dot => Precedence::Call,
            _ => Precedence::None,
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang | BitwiseNot | Typeof => self.unary(kind),
            Number => self.number(),
            String => self.string(),
            Nil | True | False => self.literal(kind),
            Identifier => self.variable(can_assign),
            This => self.this_(),
            Super => self.super_(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | Percent | BangEqual | EqualEqual | Greater
            | GreaterEqual | Less | LessEqual | BitwiseAnd | BitwiseOr | BitwiseXor | LeftShift
            | RightShift | UnsignedLeftShift | UnsignedRightShift => self.binary(kind),
            And => self.and_(),
            Or => self.or_(),
            LeftParen => self.call(),
            Dot => self.dot(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, kind: TokenKind) {
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::BitwiseNot => self.emit_op(OpCode::BitwiseNot),
            TokenKind::Typeof => self.emit_op(OpCode::Typeof),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, kind: TokenKind) {
        let rule_prec = self.infix_precedence(kind);
        self.parse_precedence(rule_prec.next());
        match kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::BitwiseAnd => self.emit_op(OpCode::BitwiseAnd),
            TokenKind::BitwiseOr => self.emit_op(OpCode::BitwiseOr),
            TokenKind::BitwiseXor => self.emit_op(OpCode::BitwiseXor),
            TokenKind::LeftShift => self.emit_op(OpCode::LeftShift),
            TokenKind::RightShift => self.emit_op(OpCode::RightShift),
            TokenKind::UnsignedLeftShift => self.emit_op(OpCode::UnsignedLeftShift),
            TokenKind::UnsignedRightShift => self.emit_op(OpCode::UnsignedRightShift),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let text = self.previous.lexeme.clone();
        let ptr = self.intern(&text);
        self.emit_constant(Value::Obj(ptr));
    }

    fn literal(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let func_idx = self.functions.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(func_idx, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(func_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_two(set_op, arg);
        } else {
            self.emit_two(get_op, arg);
        }
    }

    fn this_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name_const);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_two(OpCode::GetSuper, name_const);
        }
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_two(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_two(OpCode::SetProperty, name_const);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name_const);
            self.emit_byte(argc);
        } else {
            self.emit_two(OpCode::GetProperty, name_const);
        }
    }
}

impl Token {
    fn clone_for_class(&self) -> String {
        self.lexeme.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_script_compiles_to_a_single_return() {
        let heap = Heap::new();
        let config = CompilerConfig::new();
        let function = Compiler::new(b"", &heap, &config).compile().expect("empty source compiles");
        let chunk = unsafe { &function.as_ref().as_function().chunk };
        assert_eq!(chunk.code.last().copied(), Some(OpCode::Return as u8));
    }

    #[test]
    fn unterminated_string_reports_one_diagnostic() {
        let heap = Heap::new();
        let config = CompilerConfig::new();
        let err = Compiler::new(b"print \"oops;", &heap, &config)
            .compile()
            .expect_err("unterminated string is a compile error");
        assert_eq!(err.diagnostics.len(), 1);
        assert!(err.diagnostics[0].message.contains("Unterminated string"));
    }

    #[test]
    fn missing_semicolon_reports_expect_message() {
        let heap = Heap::new();
        let config = CompilerConfig::new();
        let err = Compiler::new(b"var x = 1", &heap, &config)
            .compile()
            .expect_err("missing semicolon is a compile error");
        assert!(err.diagnostics.iter().any(|d| d.message.contains("Expect ';'")));
    }

    #[test]
    fn panic_mode_does_not_cascade_every_later_token() {
        // A single stray token should not produce one diagnostic per
        // remaining token in the file.
        let heap = Heap::new();
        let config = CompilerConfig::new();
        let err = Compiler::new(b"var = 1; var = 2; var = 3;", &heap, &config)
            .compile()
            .expect_err("three malformed declarations");
        assert!(
            err.diagnostics.len() < 6,
            "panic-mode recovery should suppress cascades, got {:?}",
            err.diagnostics
        );
    }

    #[test]
    fn too_many_locals_in_one_scope_is_an_error() {
        let mut source = String::from("{\n");
        for i in 0..260 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push_str("}\n");
        let heap = Heap::new();
        let config = CompilerConfig::new();
        let err = Compiler::new(source.as_bytes(), &heap, &config)
            .compile()
            .expect_err("exceeding MAX_LOCALS is a compile error");
        assert!(err.diagnostics.iter().any(|d| d.message.contains("Too many local variables")));
    }

    #[test]
    fn class_body_compiles_methods_and_inherit_opcode() {
        let heap = Heap::new();
        let config = CompilerConfig::new();
        let source = b"class Animal { speak() { print \"...\"; } }\n\
             class Dog < Animal { speak() { print \"Woof\"; } }\n";
        let function = Compiler::new(source, &heap, &config)
            .compile()
            .expect("class declarations with inheritance compile");
        let chunk = unsafe { &function.as_ref().as_function().chunk };
        assert!(chunk.code.contains(&(OpCode::Inherit as u8)));
        assert!(chunk.code.contains(&(OpCode::Method as u8)));
    }

    #[test]
    fn custom_initializer_name_is_used_for_constructor_detection() {
        let heap = Heap::new();
        let config = CompilerConfig::new().initializer_name("setup");
        let function = Compiler::new(b"class C { setup() { this.x = 1; } }", &heap, &config)
            .compile()
            .expect("class with a `setup` method compiles");
        let chunk = unsafe { &function.as_ref().as_function().chunk };
        assert!(chunk.code.contains(&(OpCode::Method as u8)));
    }
}
