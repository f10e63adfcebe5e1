use std::rc::Rc;

use crate::engine::ast::{BinOp, Block, Expr, ExprKind, Field, FuncBody, Stat, StatKind, UnOp};
use crate::engine::parser;
use crate::engine::proto::{Const, Instr, Proto, UpvalDesc, UpvalSource};

const MAX_LOCALS: usize = 255;
const MAX_UPVALS: usize = 255;
const MAX_CONSTS: usize = u16::MAX as usize;
const MAX_CODE: usize = u16::MAX as usize;

/// Reserved name of the global-environment upvalue. The chunk prototype
/// owns the only genuine `_ENV` slot; nested functions that touch globals
/// get it threaded down as an ordinary upvalue chain.
pub const ENV_UPVAL: &str = "_ENV";

/// Compiles source text into a chunk prototype.
///
/// The chunk is a zero-parameter function whose single predefined upvalue
/// is `_ENV`; every free name compiles into an index operation on it.
pub fn compile_chunk(source: &str, chunk_name: &str) -> Result<Proto, String> {
    let block = parser::parse_chunk(source)?;
    let mut compiler = Compiler {
        fns: vec![FnCtx::new_chunk()],
    };
    compiler.compile_block(&block)?;
    compiler.emit(Instr::ReturnNil, 0)?;
    let ctx = compiler.fns.pop().expect("chunk context");
    ctx.into_proto(Some(chunk_name.to_string()))
}

enum NameRef {
    Local(u8),
    Upval(u8),
    /// Free name: resolved through the `_ENV` upvalue at this index.
    Global(u8),
}

struct FnCtx {
    code: Vec<Instr>,
    lines: Vec<u32>,
    consts: Vec<Const>,
    protos: Vec<Rc<Proto>>,
    upvals: Vec<UpvalDesc>,
    scopes: Vec<Vec<(String, u8)>>,
    n_locals: usize,
    n_params: usize,
    /// Break patch sites, one list per active loop.
    loops: Vec<Vec<usize>>,
}

impl FnCtx {
    fn new_chunk() -> Self {
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            consts: Vec::new(),
            protos: Vec::new(),
            upvals: vec![UpvalDesc {
                name: ENV_UPVAL.to_string(),
                source: UpvalSource::ParentUpval(0),
            }],
            scopes: vec![Vec::new()],
            n_locals: 0,
            n_params: 0,
            loops: Vec::new(),
        }
    }

    fn new_function(params: &[String]) -> Self {
        let mut scope = Vec::with_capacity(params.len());
        for (i, name) in params.iter().enumerate() {
            scope.push((name.clone(), i as u8));
        }
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            consts: Vec::new(),
            protos: Vec::new(),
            upvals: Vec::new(),
            scopes: vec![scope],
            n_locals: params.len(),
            n_params: params.len(),
            loops: Vec::new(),
        }
    }

    fn into_proto(self, chunk_name: Option<String>) -> Result<Proto, String> {
        Ok(Proto {
            chunk_name,
            n_params: self.n_params as u8,
            n_locals: self.n_locals as u8,
            code: self.code,
            consts: self.consts,
            protos: self.protos,
            upvals: self.upvals,
            lines: self.lines,
        })
    }
}

struct Compiler {
    fns: Vec<FnCtx>,
}

impl Compiler {
    fn cur(&mut self) -> &mut FnCtx {
        self.fns.last_mut().expect("function context")
    }

    fn emit(&mut self, instr: Instr, line: u32) -> Result<usize, String> {
        let ctx = self.cur();
        if ctx.code.len() >= MAX_CODE {
            return Err("function too large".to_string());
        }
        ctx.code.push(instr);
        ctx.lines.push(line);
        Ok(ctx.code.len() - 1)
    }

    fn here(&mut self) -> u16 {
        self.cur().code.len() as u16
    }

    fn patch(&mut self, at: usize, target: u16) {
        let ctx = self.cur();
        ctx.code[at] = match ctx.code[at] {
            Instr::Jump(_) => Instr::Jump(target),
            Instr::JumpIfFalse(_) => Instr::JumpIfFalse(target),
            Instr::JumpIfFalseKeep(_) => Instr::JumpIfFalseKeep(target),
            Instr::JumpIfTrueKeep(_) => Instr::JumpIfTrueKeep(target),
            other => panic!("patching a non-jump instruction {:?}", other),
        };
    }

    fn add_const(&mut self, konst: Const) -> Result<u16, String> {
        let ctx = self.cur();
        if let Some(i) = ctx.consts.iter().position(|c| *c == konst) {
            return Ok(i as u16);
        }
        if ctx.consts.len() >= MAX_CONSTS {
            return Err("too many constants in one function".to_string());
        }
        ctx.consts.push(konst);
        Ok((ctx.consts.len() - 1) as u16)
    }

    fn emit_const(&mut self, konst: Const, line: u32) -> Result<(), String> {
        let idx = self.add_const(konst)?;
        self.emit(Instr::Const(idx), line)?;
        Ok(())
    }

    fn declare_local(&mut self, name: &str) -> Result<u8, String> {
        let ctx = self.cur();
        if ctx.n_locals >= MAX_LOCALS {
            return Err("too many local variables in one function".to_string());
        }
        let slot = ctx.n_locals as u8;
        ctx.n_locals += 1;
        ctx.scopes
            .last_mut()
            .expect("scope")
            .push((name.to_string(), slot));
        Ok(slot)
    }

    fn find_local(&self, fi: usize, name: &str) -> Option<u8> {
        self.fns[fi].scopes.iter().rev().find_map(|scope| {
            scope
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, slot)| *slot)
        })
    }

    fn add_upval(&mut self, fi: usize, name: &str, source: UpvalSource) -> Result<u8, String> {
        let ctx = &mut self.fns[fi];
        if ctx.upvals.len() >= MAX_UPVALS {
            return Err("too many upvalues in one function".to_string());
        }
        ctx.upvals.push(UpvalDesc {
            name: name.to_string(),
            source,
        });
        Ok((ctx.upvals.len() - 1) as u8)
    }

    /// Finds `name` as an upvalue of function `fi`, threading capture
    /// descriptors through every enclosing function on the way.
    fn resolve_upval(&mut self, fi: usize, name: &str) -> Result<Option<u8>, String> {
        if let Some(i) = self.fns[fi].upvals.iter().position(|u| u.name == name) {
            return Ok(Some(i as u8));
        }
        if fi == 0 {
            return Ok(None);
        }
        if let Some(slot) = self.find_local(fi - 1, name) {
            return self
                .add_upval(fi, name, UpvalSource::ParentLocal(slot))
                .map(Some);
        }
        if let Some(up) = self.resolve_upval(fi - 1, name)? {
            return self
                .add_upval(fi, name, UpvalSource::ParentUpval(up))
                .map(Some);
        }
        Ok(None)
    }

    fn resolve(&mut self, name: &str) -> Result<NameRef, String> {
        let top = self.fns.len() - 1;
        if let Some(slot) = self.find_local(top, name) {
            return Ok(NameRef::Local(slot));
        }
        if let Some(up) = self.resolve_upval(top, name)? {
            return Ok(NameRef::Upval(up));
        }
        let env = self
            .resolve_upval(top, ENV_UPVAL)?
            .ok_or_else(|| "no environment upvalue in scope".to_string())?;
        Ok(NameRef::Global(env))
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), String> {
        self.cur().scopes.push(Vec::new());
        for stat in &block.stats {
            self.compile_stat(stat)?;
        }
        self.cur().scopes.pop();
        Ok(())
    }

    fn compile_stat(&mut self, stat: &Stat) -> Result<(), String> {
        let line = stat.line;
        match &stat.kind {
            StatKind::Local(name, init) => {
                match init {
                    Some(expr) => self.compile_expr(expr)?,
                    None => {
                        self.emit(Instr::Nil, line)?;
                    }
                }
                // initializer compiles before the name is in scope, so
                // `local x = x` reads the outer binding
                let slot = self.declare_local(name)?;
                self.emit(Instr::SetLocal(slot), line)?;
            }
            StatKind::LocalFunction(name, body) => {
                // name is visible inside the body for self-recursion
                let slot = self.declare_local(name)?;
                self.compile_function(body)?;
                self.emit(Instr::SetLocal(slot), line)?;
            }
            StatKind::Assign(target, value) => match &target.kind {
                ExprKind::Name(name) => match self.resolve(name)? {
                    NameRef::Local(slot) => {
                        self.compile_expr(value)?;
                        self.emit(Instr::SetLocal(slot), line)?;
                    }
                    NameRef::Upval(up) => {
                        self.compile_expr(value)?;
                        self.emit(Instr::SetUpval(up), line)?;
                    }
                    NameRef::Global(env) => {
                        self.emit(Instr::GetUpval(env), line)?;
                        self.emit_const(Const::Str(name.clone()), line)?;
                        self.compile_expr(value)?;
                        self.emit(Instr::SetIndex, line)?;
                    }
                },
                ExprKind::Index(obj, key) => {
                    self.compile_expr(obj)?;
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                    self.emit(Instr::SetIndex, line)?;
                }
                _ => return Err(format!("line {}: invalid assignment target", line)),
            },
            StatKind::ExprStat(expr) => {
                self.compile_expr(expr)?;
                self.emit(Instr::Pop, line)?;
            }
            StatKind::If(arms, else_block) => {
                let mut end_jumps = Vec::new();
                for (cond, block) in arms {
                    self.compile_expr(cond)?;
                    let skip = self.emit(Instr::JumpIfFalse(0), cond.line)?;
                    self.compile_block(block)?;
                    end_jumps.push(self.emit(Instr::Jump(0), line)?);
                    let next_arm = self.here();
                    self.patch(skip, next_arm);
                }
                if let Some(block) = else_block {
                    self.compile_block(block)?;
                }
                let end = self.here();
                for jump in end_jumps {
                    self.patch(jump, end);
                }
            }
            StatKind::While(cond, body) => {
                let top = self.here();
                self.compile_expr(cond)?;
                let exit = self.emit(Instr::JumpIfFalse(0), cond.line)?;
                self.cur().loops.push(Vec::new());
                self.compile_block(body)?;
                self.emit(Instr::Jump(top), line)?;
                let end = self.here();
                self.patch(exit, end);
                let breaks = self.cur().loops.pop().expect("loop context");
                for site in breaks {
                    self.patch(site, end);
                }
            }
            StatKind::Do(block) => self.compile_block(block)?,
            StatKind::Break => {
                if self.cur().loops.is_empty() {
                    return Err(format!("line {}: break outside a loop", line));
                }
                let site = self.emit(Instr::Jump(0), line)?;
                self.cur().loops.last_mut().expect("loop").push(site);
            }
            StatKind::Return(value) => match value {
                Some(expr) => {
                    self.compile_expr(expr)?;
                    self.emit(Instr::Return, line)?;
                }
                None => {
                    self.emit(Instr::ReturnNil, line)?;
                }
            },
        }
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), String> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Nil => {
                self.emit(Instr::Nil, line)?;
            }
            ExprKind::True => {
                self.emit(Instr::True, line)?;
            }
            ExprKind::False => {
                self.emit(Instr::False, line)?;
            }
            ExprKind::Number(n) => self.emit_const(Const::Number(*n), line)?,
            ExprKind::Str(s) => self.emit_const(Const::Str(s.clone()), line)?,
            ExprKind::Function(body) => self.compile_function(body)?,
            ExprKind::Name(name) => match self.resolve(name)? {
                NameRef::Local(slot) => {
                    self.emit(Instr::GetLocal(slot), line)?;
                }
                NameRef::Upval(up) => {
                    self.emit(Instr::GetUpval(up), line)?;
                }
                NameRef::Global(env) => {
                    self.emit(Instr::GetUpval(env), line)?;
                    self.emit_const(Const::Str(name.clone()), line)?;
                    self.emit(Instr::GetIndex, line)?;
                }
            },
            ExprKind::Index(obj, key) => {
                self.compile_expr(obj)?;
                self.compile_expr(key)?;
                self.emit(Instr::GetIndex, line)?;
            }
            ExprKind::Call(callee, args) => {
                self.compile_expr(callee)?;
                self.compile_args(args, line)?;
                self.emit(Instr::Call(args.len() as u8), line)?;
            }
            ExprKind::MethodCall(obj, name, args) => {
                self.compile_expr(obj)?;
                self.emit(Instr::Dup, line)?;
                self.emit_const(Const::Str(name.clone()), line)?;
                self.emit(Instr::GetIndex, line)?;
                self.emit(Instr::Swap, line)?;
                self.compile_args(args, line)?;
                self.emit(Instr::Call(args.len() as u8 + 1), line)?;
            }
            ExprKind::Table(fields) => {
                self.emit(Instr::NewTable, line)?;
                let mut position = 1.0f64;
                for field in fields {
                    match field {
                        Field::Positional(value) => {
                            self.emit_const(Const::Number(position), line)?;
                            position += 1.0;
                            self.compile_expr(value)?;
                        }
                        Field::Named(name, value) => {
                            self.emit_const(Const::Str(name.clone()), line)?;
                            self.compile_expr(value)?;
                        }
                        Field::Keyed(key, value) => {
                            self.compile_expr(key)?;
                            self.compile_expr(value)?;
                        }
                    }
                    self.emit(Instr::InsertPair, line)?;
                }
            }
            ExprKind::Binary(BinOp::And, lhs, rhs) => {
                self.compile_expr(lhs)?;
                let skip = self.emit(Instr::JumpIfFalseKeep(0), line)?;
                self.emit(Instr::Pop, line)?;
                self.compile_expr(rhs)?;
                let end = self.here();
                self.patch(skip, end);
            }
            ExprKind::Binary(BinOp::Or, lhs, rhs) => {
                self.compile_expr(lhs)?;
                let skip = self.emit(Instr::JumpIfTrueKeep(0), line)?;
                self.emit(Instr::Pop, line)?;
                self.compile_expr(rhs)?;
                let end = self.here();
                self.patch(skip, end);
            }
            ExprKind::Binary(op, lhs, rhs) => {
                self.compile_expr(lhs)?;
                self.compile_expr(rhs)?;
                let instr = match op {
                    BinOp::Add => Instr::Add,
                    BinOp::Sub => Instr::Sub,
                    BinOp::Mul => Instr::Mul,
                    BinOp::Div => Instr::Div,
                    BinOp::Mod => Instr::Mod,
                    BinOp::Concat => Instr::Concat,
                    BinOp::Eq => Instr::Eq,
                    BinOp::Ne => Instr::Ne,
                    BinOp::Lt => Instr::Lt,
                    BinOp::Le => Instr::Le,
                    BinOp::Gt => Instr::Gt,
                    BinOp::Ge => Instr::Ge,
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                };
                self.emit(instr, line)?;
            }
            ExprKind::Unary(op, operand) => {
                self.compile_expr(operand)?;
                let instr = match op {
                    UnOp::Neg => Instr::Neg,
                    UnOp::Not => Instr::Not,
                    UnOp::Len => Instr::Len,
                };
                self.emit(instr, line)?;
            }
        }
        Ok(())
    }

    fn compile_args(&mut self, args: &[Expr], line: u32) -> Result<(), String> {
        if args.len() >= 255 {
            return Err(format!("line {}: too many call arguments", line));
        }
        for arg in args {
            self.compile_expr(arg)?;
        }
        Ok(())
    }

    fn compile_function(&mut self, body: &FuncBody) -> Result<(), String> {
        if body.params.len() > MAX_LOCALS {
            return Err("too many parameters".to_string());
        }
        self.fns.push(FnCtx::new_function(&body.params));
        self.compile_block(&body.body)?;
        self.emit(Instr::ReturnNil, body.line)?;
        let ctx = self.fns.pop().expect("function context");
        let proto = ctx.into_proto(None)?;

        let parent = self.cur();
        if parent.protos.len() >= MAX_CONSTS {
            return Err("too many nested functions".to_string());
        }
        parent.protos.push(Rc::new(proto));
        let idx = (parent.protos.len() - 1) as u16;
        self.emit(Instr::MakeClosure(idx), body.line)?;
        Ok(())
    }
}
