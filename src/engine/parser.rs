use crate::engine::ast::{BinOp, Block, Expr, ExprKind, Field, FuncBody, Stat, StatKind, UnOp};
use crate::engine::lexer::{Lexeme, Lexer, Token};

/// Recursive-descent parser with precedence climbing for expressions.
///
/// Numeric `for` is desugared here into the equivalent `while` form over
/// hidden control variables, so the compiler only ever sees core statements.
pub struct Parser {
    lexemes: Vec<Lexeme>,
    pos: usize,
}

pub fn parse_chunk(source: &str) -> Result<Block, String> {
    let lexemes = Lexer::new(source).tokenize()?;
    let mut parser = Parser { lexemes, pos: 0 };
    let block = parser.parse_block()?;
    parser.expect(Token::Eof)?;
    Ok(block)
}

impl Parser {
    fn current(&self) -> &Token {
        &self.lexemes[self.pos].token
    }

    fn line(&self) -> u32 {
        self.lexemes[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let token = self.lexemes[self.pos].token.clone();
        if self.pos + 1 < self.lexemes.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&mut self, token: Token) -> bool {
        if *self.current() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        if *self.current() == token {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`, found `{}`", token, self.current())))
        }
    }

    fn expect_name(&mut self) -> Result<String, String> {
        match self.current().clone() {
            Token::Name(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected a name, found `{}`", other))),
        }
    }

    fn error(&self, msg: impl Into<String>) -> String {
        format!("parse error at line {}: {}", self.line(), msg.into())
    }

    fn block_ends(&self) -> bool {
        matches!(
            self.current(),
            Token::End | Token::Else | Token::Elseif | Token::Eof
        )
    }

    fn parse_block(&mut self) -> Result<Block, String> {
        let mut stats = Vec::new();
        while !self.block_ends() {
            if self.check(Token::Semi) {
                continue;
            }
            stats.push(self.parse_statement()?);
        }
        Ok(Block { stats })
    }

    fn parse_statement(&mut self) -> Result<Stat, String> {
        let line = self.line();
        match self.current().clone() {
            Token::Local => {
                self.advance();
                if self.check(Token::Function) {
                    let name = self.expect_name()?;
                    let body = self.parse_func_body(line)?;
                    return Ok(Stat::new(StatKind::LocalFunction(name, body), line));
                }
                let name = self.expect_name()?;
                let init = if self.check(Token::Assign) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                Ok(Stat::new(StatKind::Local(name, init), line))
            }
            Token::If => {
                self.advance();
                let mut arms = Vec::new();
                let cond = self.parse_expr()?;
                self.expect(Token::Then)?;
                arms.push((cond, self.parse_block()?));
                let mut else_block = None;
                loop {
                    if self.check(Token::Elseif) {
                        let cond = self.parse_expr()?;
                        self.expect(Token::Then)?;
                        arms.push((cond, self.parse_block()?));
                    } else if self.check(Token::Else) {
                        else_block = Some(self.parse_block()?);
                        self.expect(Token::End)?;
                        break;
                    } else {
                        self.expect(Token::End)?;
                        break;
                    }
                }
                Ok(Stat::new(StatKind::If(arms, else_block), line))
            }
            Token::While => {
                self.advance();
                let cond = self.parse_expr()?;
                self.expect(Token::Do)?;
                let body = self.parse_block()?;
                self.expect(Token::End)?;
                Ok(Stat::new(StatKind::While(cond, body), line))
            }
            Token::For => {
                self.advance();
                self.parse_numeric_for(line)
            }
            Token::Do => {
                self.advance();
                let body = self.parse_block()?;
                self.expect(Token::End)?;
                Ok(Stat::new(StatKind::Do(body), line))
            }
            Token::Break => {
                self.advance();
                Ok(Stat::new(StatKind::Break, line))
            }
            Token::Return => {
                self.advance();
                let value = if self.block_ends() || *self.current() == Token::Semi {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Ok(Stat::new(StatKind::Return(value), line))
            }
            Token::Function => {
                self.advance();
                let name = self.expect_name()?;
                let body = self.parse_func_body(line)?;
                let target = Expr::name(name, line);
                let func = Expr::new(ExprKind::Function(body), line);
                Ok(Stat::new(StatKind::Assign(target, func), line))
            }
            _ => {
                let expr = self.parse_suffixed_expr()?;
                if self.check(Token::Assign) {
                    if !expr.is_assignable() {
                        return Err(self.error("cannot assign to this expression"));
                    }
                    let value = self.parse_expr()?;
                    return Ok(Stat::new(StatKind::Assign(expr, value), line));
                }
                if !expr.is_call() {
                    return Err(self.error("unexpected expression in statement position"));
                }
                Ok(Stat::new(StatKind::ExprStat(expr), line))
            }
        }
    }

    /// `for i = start, limit [, step] do body end`, rewritten as a `while`
    /// over hidden control variables. The hidden names contain spaces so
    /// user code can never shadow or reference them.
    fn parse_numeric_for(&mut self, line: u32) -> Result<Stat, String> {
        let var = self.expect_name()?;
        self.expect(Token::Assign)?;
        let start = self.parse_expr()?;
        self.expect(Token::Comma)?;
        let limit = self.parse_expr()?;
        let step = if self.check(Token::Comma) {
            self.parse_expr()?
        } else {
            Expr::new(ExprKind::Number(1.0), line)
        };
        self.expect(Token::Do)?;
        let body = self.parse_block()?;
        self.expect(Token::End)?;

        const IDX: &str = "(for index)";
        const LIMIT: &str = "(for limit)";
        const STEP: &str = "(for step)";

        let num = |n: f64| Expr::new(ExprKind::Number(n), line);
        let name = |s: &str| Expr::name(s, line);
        let bin = |op: BinOp, l: Expr, r: Expr| Expr::new(ExprKind::Binary(op, Box::new(l), Box::new(r)), line);

        // (step >= 0 and idx <= limit) or (step < 0 and idx >= limit)
        let ascending = bin(
            BinOp::And,
            bin(BinOp::Ge, name(STEP), num(0.0)),
            bin(BinOp::Le, name(IDX), name(LIMIT)),
        );
        let descending = bin(
            BinOp::And,
            bin(BinOp::Lt, name(STEP), num(0.0)),
            bin(BinOp::Ge, name(IDX), name(LIMIT)),
        );
        let cond = bin(BinOp::Or, ascending, descending);

        let mut loop_body = Vec::new();
        loop_body.push(Stat::new(StatKind::Local(var, Some(name(IDX))), line));
        loop_body.extend(body.stats);
        loop_body.push(Stat::new(
            StatKind::Assign(name(IDX), bin(BinOp::Add, name(IDX), name(STEP))),
            line,
        ));

        let stats = vec![
            Stat::new(StatKind::Local(IDX.to_string(), Some(start)), line),
            Stat::new(StatKind::Local(LIMIT.to_string(), Some(limit)), line),
            Stat::new(StatKind::Local(STEP.to_string(), Some(step)), line),
            Stat::new(StatKind::While(cond, Block { stats: loop_body }), line),
        ];
        Ok(Stat::new(StatKind::Do(Block { stats }), line))
    }

    fn parse_func_body(&mut self, line: u32) -> Result<FuncBody, String> {
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if *self.current() != Token::RParen {
            loop {
                params.push(self.expect_name()?);
                if !self.check(Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        let body = self.parse_block()?;
        self.expect(Token::End)?;
        Ok(FuncBody { params, body, line })
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let Some((op, prec, right_assoc)) = binary_op(self.current()) else {
                return Ok(left);
            };
            if prec < min_prec {
                return Ok(left);
            }
            let line = self.line();
            self.advance();
            let next_min = if right_assoc { prec } else { prec + 1 };
            let right = self.parse_binary(next_min)?;
            left = Expr::new(ExprKind::Binary(op, Box::new(left), Box::new(right)), line);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        let line = self.line();
        let op = match self.current() {
            Token::Minus => Some(UnOp::Neg),
            Token::Not => Some(UnOp::Not),
            Token::Hash => Some(UnOp::Len),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::new(ExprKind::Unary(op, Box::new(operand)), line));
        }
        self.parse_suffixed_expr()
    }

    /// A primary expression followed by any chain of `.name`, `[expr]`,
    /// `(args)`, and `:name(args)` suffixes.
    fn parse_suffixed_expr(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_primary()?;
        loop {
            let line = self.line();
            match self.current() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_name()?;
                    let key = Expr::new(ExprKind::Str(name), line);
                    expr = Expr::new(ExprKind::Index(Box::new(expr), Box::new(key)), line);
                }
                Token::LBracket => {
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::new(ExprKind::Index(Box::new(expr), Box::new(key)), line);
                }
                Token::LParen => {
                    let args = self.parse_args()?;
                    expr = Expr::new(ExprKind::Call(Box::new(expr), args), line);
                }
                Token::Colon => {
                    self.advance();
                    let name = self.expect_name()?;
                    let args = self.parse_args()?;
                    expr = Expr::new(ExprKind::MethodCall(Box::new(expr), name, args), line);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, String> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if *self.current() != Token::RParen {
            loop {
                args.push(self.parse_expr()?);
                if !self.check(Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let line = self.line();
        match self.current().clone() {
            Token::Nil => {
                self.advance();
                Ok(Expr::new(ExprKind::Nil, line))
            }
            Token::True => {
                self.advance();
                Ok(Expr::new(ExprKind::True, line))
            }
            Token::False => {
                self.advance();
                Ok(Expr::new(ExprKind::False, line))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expr::new(ExprKind::Number(n), line))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(s), line))
            }
            Token::Function => {
                self.advance();
                let body = self.parse_func_body(line)?;
                Ok(Expr::new(ExprKind::Function(body), line))
            }
            Token::Name(name) => {
                self.advance();
                Ok(Expr::name(name, line))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBrace => self.parse_table(line),
            other => Err(self.error(format!("unexpected `{}` in expression", other))),
        }
    }

    fn parse_table(&mut self, line: u32) -> Result<Expr, String> {
        self.expect(Token::LBrace)?;
        let mut fields = Vec::new();
        while *self.current() != Token::RBrace {
            match self.current().clone() {
                Token::LBracket => {
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    self.expect(Token::Assign)?;
                    fields.push(Field::Keyed(key, self.parse_expr()?));
                }
                Token::Name(name)
                    if self.lexemes.get(self.pos + 1).map(|l| &l.token) == Some(&Token::Assign) =>
                {
                    self.advance();
                    self.advance();
                    fields.push(Field::Named(name, self.parse_expr()?));
                }
                _ => fields.push(Field::Positional(self.parse_expr()?)),
            }
            if !self.check(Token::Comma) && !self.check(Token::Semi) {
                break;
            }
        }
        self.expect(Token::RBrace)?;
        Ok(Expr::new(ExprKind::Table(fields), line))
    }
}

fn binary_op(token: &Token) -> Option<(BinOp, u8, bool)> {
    Some(match token {
        Token::Or => (BinOp::Or, 1, false),
        Token::And => (BinOp::And, 2, false),
        Token::Less => (BinOp::Lt, 3, false),
        Token::Greater => (BinOp::Gt, 3, false),
        Token::LessEq => (BinOp::Le, 3, false),
        Token::GreaterEq => (BinOp::Ge, 3, false),
        Token::EqEq => (BinOp::Eq, 3, false),
        Token::NotEq => (BinOp::Ne, 3, false),
        Token::Concat => (BinOp::Concat, 4, true),
        Token::Plus => (BinOp::Add, 5, false),
        Token::Minus => (BinOp::Sub, 5, false),
        Token::Star => (BinOp::Mul, 6, false),
        Token::Slash => (BinOp::Div, 6, false),
        Token::Percent => (BinOp::Mod, 6, false),
        _ => return None,
    })
}
