use std::rc::Rc;

use crate::bytes::ByteBuf;

/// Signature bytes prefixing serialized bytecode, followed by a format
/// version byte. Distinct from the outer container magic: this identifies
/// raw engine bytecode wherever it is stored.
pub const BYTECODE_SIG: [u8; 4] = [0x1B, b'L', b'Y', b'S'];
pub const BYTECODE_VERSION: u8 = 1;

/// Constant-pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Number(f64),
    Str(String),
}

/// Where a closure's upvalue cell comes from at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalSource {
    /// Alias the enclosing frame's local cell at this slot.
    ParentLocal(u8),
    /// Alias the enclosing closure's upvalue at this index.
    ParentUpval(u8),
}

/// Named upvalue descriptor. The position of a descriptor in
/// `Proto::upvals` is the closure's upvalue index; the bridge's
/// capture/restore protocol records and replays values by exactly this
/// index, so descriptor order must survive serialization unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct UpvalDesc {
    pub name: String,
    pub source: UpvalSource,
}

/// One VM instruction. Operand widths bound the per-function limits:
/// 65536 constants and nested protos, 256 locals and upvalues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instr {
    Const(u16),
    Nil,
    True,
    False,
    Pop,
    Dup,
    Swap,
    GetLocal(u8),
    SetLocal(u8),
    GetUpval(u8),
    SetUpval(u8),
    NewTable,
    /// Pops key and value, inserts into the table left on the stack.
    InsertPair,
    GetIndex,
    /// Pops value, key, table in that order.
    SetIndex,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Neg,
    Not,
    Len,
    Jump(u16),
    JumpIfFalse(u16),
    /// Conditional jumps that keep the tested value on the stack; used for
    /// `and`/`or` short-circuiting.
    JumpIfFalseKeep(u16),
    JumpIfTrueKeep(u16),
    Call(u8),
    MakeClosure(u16),
    Return,
    ReturnNil,
}

/// A compiled function prototype.
#[derive(Debug, Clone, PartialEq)]
pub struct Proto {
    pub chunk_name: Option<String>,
    pub n_params: u8,
    pub n_locals: u8,
    pub code: Vec<Instr>,
    pub consts: Vec<Const>,
    pub protos: Vec<Rc<Proto>>,
    pub upvals: Vec<UpvalDesc>,
    /// Source line per instruction; empty when debug info was stripped.
    pub lines: Vec<u32>,
}

impl Proto {
    pub fn line_at(&self, ip: usize) -> Option<u32> {
        self.lines.get(ip).copied()
    }

    /// Drops chunk names and line tables from this proto and all nested
    /// protos, returning the stripped tree.
    pub fn strip_debug(&self) -> Proto {
        Proto {
            chunk_name: None,
            n_params: self.n_params,
            n_locals: self.n_locals,
            code: self.code.clone(),
            consts: self.consts.clone(),
            protos: self
                .protos
                .iter()
                .map(|p| Rc::new(p.strip_debug()))
                .collect(),
            upvals: self.upvals.clone(),
            lines: Vec::new(),
        }
    }
}

/// Serializes a proto tree into the signed bytecode form.
pub fn dump(proto: &Proto) -> Vec<u8> {
    let mut buf = ByteBuf::new();
    buf.write_bytes(&BYTECODE_SIG);
    buf.write_u8(BYTECODE_VERSION);
    write_proto(&mut buf, proto);
    buf.into_vec()
}

/// Parses signed bytecode back into a proto tree.
pub fn load(bytes: &[u8]) -> Result<Proto, String> {
    let mut buf = ByteBuf::from_vec(bytes.to_vec());
    let sig = buf
        .read_exact(4)
        .ok_or_else(|| "bytecode truncated before signature".to_string())?;
    if sig != BYTECODE_SIG {
        return Err("missing bytecode signature".to_string());
    }
    let version = buf
        .read_u8()
        .ok_or_else(|| "bytecode truncated before version".to_string())?;
    if version != BYTECODE_VERSION {
        return Err(format!("unsupported bytecode version {}", version));
    }
    read_proto(&mut buf)
}

pub fn looks_like_bytecode(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0..4] == BYTECODE_SIG
}

fn write_proto(buf: &mut ByteBuf, proto: &Proto) {
    let mut flags = 0u8;
    if proto.chunk_name.is_some() {
        flags |= 0x01;
    }
    if !proto.lines.is_empty() {
        flags |= 0x02;
    }
    buf.write_u8(flags);
    if let Some(name) = &proto.chunk_name {
        buf.write_str(name);
    }
    buf.write_u8(proto.n_params);
    buf.write_u8(proto.n_locals);

    buf.write_u8(proto.upvals.len() as u8);
    for upval in &proto.upvals {
        buf.write_str(&upval.name);
        match upval.source {
            UpvalSource::ParentLocal(i) => {
                buf.write_u8(0);
                buf.write_u8(i);
            }
            UpvalSource::ParentUpval(i) => {
                buf.write_u8(1);
                buf.write_u8(i);
            }
        }
    }

    buf.write_u16(proto.consts.len() as u16);
    for konst in &proto.consts {
        match konst {
            Const::Number(n) => {
                buf.write_u8(0);
                buf.write_f64(*n);
            }
            Const::Str(s) => {
                buf.write_u8(1);
                buf.write_str(s);
            }
        }
    }

    buf.write_u32(proto.code.len() as u32);
    for instr in &proto.code {
        write_instr(buf, *instr);
    }

    if !proto.lines.is_empty() {
        buf.write_u32(proto.lines.len() as u32);
        for line in &proto.lines {
            buf.write_u32(*line);
        }
    }

    buf.write_u16(proto.protos.len() as u16);
    for nested in &proto.protos {
        write_proto(buf, nested);
    }
}

fn read_proto(buf: &mut ByteBuf) -> Result<Proto, String> {
    let bad = || "truncated bytecode".to_string();

    let flags = buf.read_u8().ok_or_else(bad)?;
    let chunk_name = if flags & 0x01 != 0 {
        Some(buf.read_str().ok_or_else(bad)?)
    } else {
        None
    };
    let n_params = buf.read_u8().ok_or_else(bad)?;
    let n_locals = buf.read_u8().ok_or_else(bad)?;

    let upval_count = buf.read_u8().ok_or_else(bad)? as usize;
    let mut upvals = Vec::with_capacity(upval_count);
    for _ in 0..upval_count {
        let name = buf.read_str().ok_or_else(bad)?;
        let tag = buf.read_u8().ok_or_else(bad)?;
        let index = buf.read_u8().ok_or_else(bad)?;
        let source = match tag {
            0 => UpvalSource::ParentLocal(index),
            1 => UpvalSource::ParentUpval(index),
            other => return Err(format!("bad upvalue source tag {}", other)),
        };
        upvals.push(UpvalDesc { name, source });
    }

    let const_count = buf.read_u16().ok_or_else(bad)? as usize;
    let mut consts = Vec::with_capacity(const_count);
    for _ in 0..const_count {
        let tag = buf.read_u8().ok_or_else(bad)?;
        consts.push(match tag {
            0 => Const::Number(buf.read_f64().ok_or_else(bad)?),
            1 => Const::Str(buf.read_str().ok_or_else(bad)?),
            other => return Err(format!("bad constant tag {}", other)),
        });
    }

    let code_count = buf.read_u32().ok_or_else(bad)? as usize;
    let mut code = Vec::with_capacity(code_count);
    for _ in 0..code_count {
        code.push(read_instr(buf)?);
    }

    let lines = if flags & 0x02 != 0 {
        let line_count = buf.read_u32().ok_or_else(bad)? as usize;
        let mut lines = Vec::with_capacity(line_count);
        for _ in 0..line_count {
            lines.push(buf.read_u32().ok_or_else(bad)?);
        }
        lines
    } else {
        Vec::new()
    };

    let proto_count = buf.read_u16().ok_or_else(bad)? as usize;
    let mut protos = Vec::with_capacity(proto_count);
    for _ in 0..proto_count {
        protos.push(Rc::new(read_proto(buf)?));
    }

    Ok(Proto {
        chunk_name,
        n_params,
        n_locals,
        code,
        consts,
        protos,
        upvals,
        lines,
    })
}

fn write_instr(buf: &mut ByteBuf, instr: Instr) {
    match instr {
        Instr::Const(i) => {
            buf.write_u8(0);
            buf.write_u16(i);
        }
        Instr::Nil => buf.write_u8(1),
        Instr::True => buf.write_u8(2),
        Instr::False => buf.write_u8(3),
        Instr::Pop => buf.write_u8(4),
        Instr::Dup => buf.write_u8(5),
        Instr::Swap => buf.write_u8(6),
        Instr::GetLocal(i) => {
            buf.write_u8(7);
            buf.write_u8(i);
        }
        Instr::SetLocal(i) => {
            buf.write_u8(8);
            buf.write_u8(i);
        }
        Instr::GetUpval(i) => {
            buf.write_u8(9);
            buf.write_u8(i);
        }
        Instr::SetUpval(i) => {
            buf.write_u8(10);
            buf.write_u8(i);
        }
        Instr::NewTable => buf.write_u8(11),
        Instr::InsertPair => buf.write_u8(12),
        Instr::GetIndex => buf.write_u8(13),
        Instr::SetIndex => buf.write_u8(14),
        Instr::Add => buf.write_u8(15),
        Instr::Sub => buf.write_u8(16),
        Instr::Mul => buf.write_u8(17),
        Instr::Div => buf.write_u8(18),
        Instr::Mod => buf.write_u8(19),
        Instr::Concat => buf.write_u8(20),
        Instr::Eq => buf.write_u8(21),
        Instr::Ne => buf.write_u8(22),
        Instr::Lt => buf.write_u8(23),
        Instr::Le => buf.write_u8(24),
        Instr::Gt => buf.write_u8(25),
        Instr::Ge => buf.write_u8(26),
        Instr::Neg => buf.write_u8(27),
        Instr::Not => buf.write_u8(28),
        Instr::Len => buf.write_u8(29),
        Instr::Jump(t) => {
            buf.write_u8(30);
            buf.write_u16(t);
        }
        Instr::JumpIfFalse(t) => {
            buf.write_u8(31);
            buf.write_u16(t);
        }
        Instr::JumpIfFalseKeep(t) => {
            buf.write_u8(32);
            buf.write_u16(t);
        }
        Instr::JumpIfTrueKeep(t) => {
            buf.write_u8(33);
            buf.write_u16(t);
        }
        Instr::Call(n) => {
            buf.write_u8(34);
            buf.write_u8(n);
        }
        Instr::MakeClosure(i) => {
            buf.write_u8(35);
            buf.write_u16(i);
        }
        Instr::Return => buf.write_u8(36),
        Instr::ReturnNil => buf.write_u8(37),
    }
}

fn read_instr(buf: &mut ByteBuf) -> Result<Instr, String> {
    let bad = || "truncated instruction stream".to_string();
    let op = buf.read_u8().ok_or_else(bad)?;
    Ok(match op {
        0 => Instr::Const(buf.read_u16().ok_or_else(bad)?),
        1 => Instr::Nil,
        2 => Instr::True,
        3 => Instr::False,
        4 => Instr::Pop,
        5 => Instr::Dup,
        6 => Instr::Swap,
        7 => Instr::GetLocal(buf.read_u8().ok_or_else(bad)?),
        8 => Instr::SetLocal(buf.read_u8().ok_or_else(bad)?),
        9 => Instr::GetUpval(buf.read_u8().ok_or_else(bad)?),
        10 => Instr::SetUpval(buf.read_u8().ok_or_else(bad)?),
        11 => Instr::NewTable,
        12 => Instr::InsertPair,
        13 => Instr::GetIndex,
        14 => Instr::SetIndex,
        15 => Instr::Add,
        16 => Instr::Sub,
        17 => Instr::Mul,
        18 => Instr::Div,
        19 => Instr::Mod,
        20 => Instr::Concat,
        21 => Instr::Eq,
        22 => Instr::Ne,
        23 => Instr::Lt,
        24 => Instr::Le,
        25 => Instr::Gt,
        26 => Instr::Ge,
        27 => Instr::Neg,
        28 => Instr::Not,
        29 => Instr::Len,
        30 => Instr::Jump(buf.read_u16().ok_or_else(bad)?),
        31 => Instr::JumpIfFalse(buf.read_u16().ok_or_else(bad)?),
        32 => Instr::JumpIfFalseKeep(buf.read_u16().ok_or_else(bad)?),
        33 => Instr::JumpIfTrueKeep(buf.read_u16().ok_or_else(bad)?),
        34 => Instr::Call(buf.read_u8().ok_or_else(bad)?),
        35 => Instr::MakeClosure(buf.read_u16().ok_or_else(bad)?),
        36 => Instr::Return,
        37 => Instr::ReturnNil,
        other => return Err(format!("unknown opcode {}", other)),
    })
}
