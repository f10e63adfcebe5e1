use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::Engine;
use crate::engine::proto::{Const, Instr, UpvalSource};
use crate::engine::value::{self, Cell, Closure, Value, is_truthy, type_name, values_equal};

/// One activation record. `entry_sp` is the operand-stack depth at frame
/// entry; returning truncates back to it before pushing the result, which
/// keeps every call stack-balanced. Locals are cells so closures created in
/// this frame can alias them.
pub(crate) struct Frame {
    pub closure: Rc<Closure>,
    pub ip: usize,
    pub entry_sp: usize,
    pub locals: Vec<Cell>,
}

impl Engine {
    /// Protected call. Expects the callee followed by `nargs` arguments on
    /// the stack; on success exactly one result replaces them. On error the
    /// stack and frames are unwound to their pre-call shape.
    pub fn call(&self, nargs: usize) -> Result<(), String> {
        self.ensure_alive()?;
        let depth = self.top();
        if depth < nargs + 1 {
            return Err(format!(
                "stack underflow in call: need {} slots, have {}",
                nargs + 1,
                depth
            ));
        }
        let base = depth - nargs - 1;
        let floor = self.with_frames(|f| f.len());

        let result = self.begin_call(nargs).and_then(|framed| {
            if framed {
                self.execute_until(floor)
            } else {
                Ok(())
            }
        });

        if let Err(err) = result {
            self.with_frames(|f| f.truncate(floor));
            self.with_stack(|s| s.truncate(base));
            return Err(err);
        }
        Ok(())
    }

    /// Dispatches the callee under the arguments. Returns `true` when a
    /// guest frame was pushed and execution must continue in the VM loop;
    /// native and foreign callees complete immediately.
    fn begin_call(&self, nargs: usize) -> Result<bool, String> {
        let callee_slot = self.top() - nargs - 1;
        let callee = self
            .value_at((callee_slot + 1) as isize)
            .expect("callee slot");

        match callee {
            Value::Closure(closure) => {
                let mut args = self.with_stack(|s| {
                    let at = s.len() - nargs;
                    s.split_off(at)
                });
                self.pop_n(1); // callee

                // Lua-style arity adjustment: extra arguments are dropped,
                // missing ones read as nil.
                let n_params = closure.proto.n_params as usize;
                args.truncate(n_params);
                while args.len() < n_params {
                    args.push(Value::Nil);
                }

                let n_locals = closure.proto.n_locals as usize;
                let mut locals: Vec<Cell> = Vec::with_capacity(n_locals);
                for arg in args {
                    locals.push(Rc::new(RefCell::new(arg)));
                }
                while locals.len() < n_locals {
                    locals.push(Rc::new(RefCell::new(Value::Nil)));
                }

                let entry_sp = self.top();
                self.with_frames(|frames| {
                    frames.push(Frame {
                        closure,
                        ip: 0,
                        entry_sp,
                        locals,
                    })
                });
                Ok(true)
            }
            Value::Native(f) => {
                let args = self.with_stack(|s| {
                    let at = s.len() - nargs;
                    s.split_off(at)
                });
                self.pop_n(1);
                let result = f(&args)?;
                self.push_value(result);
                Ok(false)
            }
            Value::Foreign(any) => {
                let args = self.with_stack(|s| {
                    let at = s.len() - nargs;
                    s.split_off(at)
                });
                self.pop_n(1);
                let ops = self
                    .foreign_ops()
                    .ok_or_else(|| "no foreign dispatch installed".to_string())?;
                let result = ops.call(&any, args)?;
                self.push_value(result);
                Ok(false)
            }
            other => Err(format!("attempt to call a {} value", type_name(&other))),
        }
    }

    /// Runs frames until the depth drops back to `floor`. Errors are
    /// decorated with the raising frame's chunk name and line.
    fn execute_until(&self, floor: usize) -> Result<(), String> {
        loop {
            let fetched = self.with_frames(|frames| {
                if frames.len() <= floor {
                    return None;
                }
                let frame = frames.last_mut().expect("active frame");
                let instr = frame
                    .closure
                    .proto
                    .code
                    .get(frame.ip)
                    .copied()
                    .unwrap_or(Instr::ReturnNil);
                let position = frame_position(frame);
                frame.ip += 1;
                Some((instr, position))
            });
            let Some((instr, position)) = fetched else {
                return Ok(());
            };
            if let Err(msg) = self.step(instr) {
                return Err(match position {
                    Some(pos) => format!("{}: {}", pos, msg),
                    None => msg,
                });
            }
        }
    }

    fn step(&self, instr: Instr) -> Result<(), String> {
        match instr {
            Instr::Const(i) => {
                let konst = self.with_frames(|frames| {
                    frames.last().expect("frame").closure.proto.consts[i as usize].clone()
                });
                self.push_value(match konst {
                    Const::Number(n) => Value::Number(n),
                    Const::Str(s) => Value::String(Rc::from(s.as_str())),
                });
            }
            Instr::Nil => self.push_value(Value::Nil),
            Instr::True => self.push_value(Value::Boolean(true)),
            Instr::False => self.push_value(Value::Boolean(false)),
            Instr::Pop => {
                self.pop_value();
            }
            Instr::Dup => {
                let top = self.value_at(-1).ok_or("stack underflow in dup")?;
                self.push_value(top);
            }
            Instr::Swap => self.with_stack(|s| {
                let len = s.len();
                s.swap(len - 1, len - 2);
            }),
            Instr::GetLocal(i) => {
                let v = self.with_frames(|frames| {
                    frames.last().expect("frame").locals[i as usize]
                        .borrow()
                        .clone()
                });
                self.push_value(v);
            }
            Instr::SetLocal(i) => {
                let v = self.pop_value();
                self.with_frames(|frames| {
                    *frames.last().expect("frame").locals[i as usize].borrow_mut() = v;
                });
            }
            Instr::GetUpval(i) => {
                let v = self.with_frames(|frames| {
                    frames.last().expect("frame").closure.upvals[i as usize]
                        .borrow()
                        .clone()
                });
                self.push_value(v);
            }
            Instr::SetUpval(i) => {
                let v = self.pop_value();
                self.with_frames(|frames| {
                    *frames.last().expect("frame").closure.upvals[i as usize].borrow_mut() = v;
                });
            }
            Instr::NewTable => {
                let table = self.new_table();
                self.push_value(Value::Table(table));
            }
            Instr::InsertPair => {
                let value = self.pop_value();
                let key = self.pop_value();
                let table = self.value_at(-1).ok_or("stack underflow in table constructor")?;
                let Value::Table(table) = table else {
                    return Err("table constructor target is not a table".to_string());
                };
                table.borrow_mut().set(key, value)?;
            }
            Instr::GetIndex => {
                let key = self.pop_value();
                let target = self.pop_value();
                let result = self.index_get(&target, &key)?;
                self.push_value(result);
            }
            Instr::SetIndex => {
                let value = self.pop_value();
                let key = self.pop_value();
                let target = self.pop_value();
                self.index_set(&target, key, value)?;
            }
            Instr::Add => self.arith(|a, b| a + b)?,
            Instr::Sub => self.arith(|a, b| a - b)?,
            Instr::Mul => self.arith(|a, b| a * b)?,
            Instr::Div => self.arith(|a, b| a / b)?,
            Instr::Mod => self.arith(|a, b| a - (a / b).floor() * b)?,
            Instr::Concat => {
                let rhs = self.pop_value();
                let lhs = self.pop_value();
                let (Some(l), Some(r)) = (concat_text(&lhs), concat_text(&rhs)) else {
                    let offender = if concat_text(&lhs).is_none() { &lhs } else { &rhs };
                    return Err(format!(
                        "attempt to concatenate a {} value",
                        type_name(offender)
                    ));
                };
                self.push_value(Value::String(Rc::from(format!("{}{}", l, r).as_str())));
            }
            Instr::Eq => {
                let rhs = self.pop_value();
                let lhs = self.pop_value();
                self.push_value(Value::Boolean(values_equal(&lhs, &rhs)));
            }
            Instr::Ne => {
                let rhs = self.pop_value();
                let lhs = self.pop_value();
                self.push_value(Value::Boolean(!values_equal(&lhs, &rhs)));
            }
            Instr::Lt => self.compare(|o| o == std::cmp::Ordering::Less)?,
            Instr::Le => self.compare(|o| o != std::cmp::Ordering::Greater)?,
            Instr::Gt => self.compare(|o| o == std::cmp::Ordering::Greater)?,
            Instr::Ge => self.compare(|o| o != std::cmp::Ordering::Less)?,
            Instr::Neg => {
                let v = self.pop_value();
                let Value::Number(n) = v else {
                    return Err(format!(
                        "attempt to perform arithmetic on a {} value",
                        type_name(&v)
                    ));
                };
                self.push_value(Value::Number(-n));
            }
            Instr::Not => {
                let v = self.pop_value();
                self.push_value(Value::Boolean(!is_truthy(&v)));
            }
            Instr::Len => {
                let v = self.pop_value();
                let len = match &v {
                    Value::String(s) => s.len() as f64,
                    Value::Table(t) => t.borrow().seq_len() as f64,
                    Value::Foreign(a) => a.size() as f64,
                    other => {
                        return Err(format!(
                            "attempt to get length of a {} value",
                            type_name(other)
                        ));
                    }
                };
                self.push_value(Value::Number(len));
            }
            Instr::Jump(target) => self.jump(target),
            Instr::JumpIfFalse(target) => {
                let v = self.pop_value();
                if !is_truthy(&v) {
                    self.jump(target);
                }
            }
            Instr::JumpIfFalseKeep(target) => {
                let v = self.value_at(-1).ok_or("stack underflow in jump")?;
                if !is_truthy(&v) {
                    self.jump(target);
                }
            }
            Instr::JumpIfTrueKeep(target) => {
                let v = self.value_at(-1).ok_or("stack underflow in jump")?;
                if is_truthy(&v) {
                    self.jump(target);
                }
            }
            Instr::Call(nargs) => {
                self.begin_call(nargs as usize)?;
            }
            Instr::MakeClosure(i) => {
                let (proto, upvals) = self.with_frames(|frames| {
                    let frame = frames.last().expect("frame");
                    let proto = frame.closure.proto.protos[i as usize].clone();
                    let upvals: Vec<Cell> = proto
                        .upvals
                        .iter()
                        .map(|desc| match desc.source {
                            UpvalSource::ParentLocal(slot) => {
                                frame.locals[slot as usize].clone()
                            }
                            UpvalSource::ParentUpval(slot) => {
                                frame.closure.upvals[slot as usize].clone()
                            }
                        })
                        .collect();
                    (proto, upvals)
                });
                let closure = self.new_closure(proto, upvals);
                self.push_value(Value::Closure(closure));
            }
            Instr::Return => {
                let ret = self.pop_value();
                let entry_sp = self
                    .with_frames(|frames| frames.pop().map(|f| f.entry_sp))
                    .ok_or("return with no active frame")?;
                self.with_stack(|s| s.truncate(entry_sp));
                self.push_value(ret);
            }
            Instr::ReturnNil => {
                let entry_sp = self
                    .with_frames(|frames| frames.pop().map(|f| f.entry_sp))
                    .ok_or("return with no active frame")?;
                self.with_stack(|s| s.truncate(entry_sp));
                self.push_value(Value::Nil);
            }
        }
        Ok(())
    }

    fn jump(&self, target: u16) {
        self.with_frames(|frames| {
            frames.last_mut().expect("frame").ip = target as usize;
        });
    }

    fn arith(&self, op: impl Fn(f64, f64) -> f64) -> Result<(), String> {
        let rhs = self.pop_value();
        let lhs = self.pop_value();
        match (&lhs, &rhs) {
            (Value::Number(a), Value::Number(b)) => {
                self.push_value(Value::Number(op(*a, *b)));
                Ok(())
            }
            _ => {
                let offender = if matches!(lhs, Value::Number(_)) {
                    &rhs
                } else {
                    &lhs
                };
                Err(format!(
                    "attempt to perform arithmetic on a {} value",
                    type_name(offender)
                ))
            }
        }
    }

    fn compare(&self, accept: impl Fn(std::cmp::Ordering) -> bool) -> Result<(), String> {
        let rhs = self.pop_value();
        let lhs = self.pop_value();
        let ordering = match (&lhs, &rhs) {
            (Value::Number(a), Value::Number(b)) => a
                .partial_cmp(b)
                .ok_or_else(|| "attempt to compare NaN".to_string())?,
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => {
                return Err(format!(
                    "attempt to compare {} with {}",
                    type_name(&lhs),
                    type_name(&rhs)
                ));
            }
        };
        self.push_value(Value::Boolean(accept(ordering)));
        Ok(())
    }

    fn index_get(&self, target: &Value, key: &Value) -> Result<Value, String> {
        match target {
            Value::Table(t) => Ok(t.borrow().get(key)),
            Value::Foreign(any) => {
                let ops = self
                    .foreign_ops()
                    .ok_or_else(|| "no foreign dispatch installed".to_string())?;
                ops.index(any, key)
            }
            other => Err(format!("attempt to index a {} value", type_name(other))),
        }
    }

    fn index_set(&self, target: &Value, key: Value, value: Value) -> Result<(), String> {
        match target {
            Value::Table(t) => t.borrow_mut().set(key, value),
            Value::Foreign(any) => {
                let ops = self
                    .foreign_ops()
                    .ok_or_else(|| "no foreign dispatch installed".to_string())?;
                ops.set_index(any, &key, value)
            }
            other => Err(format!("attempt to index a {} value", type_name(other))),
        }
    }
}

fn frame_position(frame: &Frame) -> Option<String> {
    let line = frame.closure.proto.line_at(frame.ip)?;
    let name = frame
        .closure
        .proto
        .chunk_name
        .clone()
        .unwrap_or_else(|| "?".to_string());
    Some(format!("{}:{}", name, line))
}

fn concat_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.to_string()),
        Value::Number(n) => Some(value::number_text(*n)),
        _ => None,
    }
}
