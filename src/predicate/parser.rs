use super::lexer::{tokenize, Spanned, Token};
use super::{PredicateError, Schema, Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    StartsWith,
    EndsWith,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    In {
        needle: Box<Expr>,
        haystack: Vec<Expr>,
    },
    Method {
        method: Method,
        target: Box<Expr>,
        arg: Box<Expr>,
    },
    Size(Box<Expr>),
}

pub(crate) fn parse(input: &str) -> Result<Expr, PredicateError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or()?;
    parser.expect(Token::Eof, "end of expression")?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].offset
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> PredicateError {
        PredicateError::Syntax {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), PredicateError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {:?}", self.peek())))
        }
    }

    fn or(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.relation()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.relation()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn relation(&mut self) -> Result<Expr, PredicateError> {
        let lhs = self.addition()?;

        if self.eat(&Token::In) {
            self.expect(Token::LBracket, "'[' after 'in'")?;
            let mut haystack = Vec::new();
            if !self.eat(&Token::RBracket) {
                loop {
                    haystack.push(self.addition()?);
                    if self.eat(&Token::RBracket) {
                        break;
                    }
                    self.expect(Token::Comma, "',' or ']'")?;
                }
            }
            return Ok(Expr::In {
                needle: Box::new(lhs),
                haystack,
            });
        }

        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.addition()?;
        Ok(binary(op, lhs, rhs))
    }

    fn addition(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.multiplication()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplication()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplication(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, PredicateError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.member()
    }

    fn member(&mut self) -> Result<Expr, PredicateError> {
        let mut expr = self.primary()?;

        while self.eat(&Token::Dot) {
            let name = match self.advance() {
                Token::Ident(name) => name,
                other => return Err(self.error(format!("expected method name, found {other:?}"))),
            };
            let method = match name.as_str() {
                "startsWith" => Method::StartsWith,
                "endsWith" => Method::EndsWith,
                "contains" => Method::Contains,
                _ => return Err(PredicateError::UnknownFunction(name)),
            };
            self.expect(Token::LParen, "'('")?;
            let arg = self.or()?;
            self.expect(Token::RParen, "')'")?;
            expr = Expr::Method {
                method,
                target: Box::new(expr),
                arg: Box::new(arg),
            };
        }

        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, PredicateError> {
        let start = self.pos;
        match self.advance() {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Int(v) => Ok(Expr::Literal(Value::Uint(v))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let expr = self.or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    if name != "size" {
                        return Err(PredicateError::UnknownFunction(name));
                    }
                    let arg = self.or()?;
                    self.expect(Token::RParen, "')'")?;
                    return Ok(Expr::Size(Box::new(arg)));
                }
                Ok(Expr::Var(name))
            }
            other => {
                // point the error at the offending token
                self.pos = start;
                Err(self.error(format!("unexpected {other:?}")))
            }
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn mismatch(message: String) -> PredicateError {
    PredicateError::Type(message)
}

impl Expr {
    /// Resolves the static type of the expression against the declared
    /// variables.
    pub(crate) fn check(&self, schema: &Schema) -> Result<ValueType, PredicateError> {
        match self {
            Expr::Literal(value) => Ok(value.value_type()),
            Expr::Var(name) => schema
                .get(name)
                .ok_or_else(|| PredicateError::UnknownVariable(name.clone())),
            Expr::Not(inner) => match inner.check(schema)? {
                ValueType::Bool => Ok(ValueType::Bool),
                other => Err(mismatch(format!("'!' expects bool, found {other}"))),
            },
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.check(schema)?;
                let r = rhs.check(schema)?;
                let fail = || {
                    mismatch(format!(
                        "operator '{}' cannot be applied to {l} and {r}",
                        op.symbol()
                    ))
                };
                match op {
                    BinaryOp::Or | BinaryOp::And => match (l, r) {
                        (ValueType::Bool, ValueType::Bool) => Ok(ValueType::Bool),
                        _ => Err(fail()),
                    },
                    BinaryOp::Eq | BinaryOp::Ne if l == r => Ok(ValueType::Bool),
                    BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
                        if l == r && l != ValueType::Bool =>
                    {
                        Ok(ValueType::Bool)
                    }
                    BinaryOp::Add if l == r && l != ValueType::Bool => Ok(l),
                    BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
                        if l == ValueType::Uint && r == ValueType::Uint =>
                    {
                        Ok(ValueType::Uint)
                    }
                    _ => Err(fail()),
                }
            }
            Expr::In { needle, haystack } => {
                let wanted = needle.check(schema)?;
                for item in haystack {
                    let found = item.check(schema)?;
                    if found != wanted {
                        return Err(mismatch(format!(
                            "'in' list element is {found}, expected {wanted}"
                        )));
                    }
                }
                Ok(ValueType::Bool)
            }
            Expr::Method { target, arg, .. } => {
                match (target.check(schema)?, arg.check(schema)?) {
                    (ValueType::String, ValueType::String) => Ok(ValueType::Bool),
                    (t, a) => Err(mismatch(format!(
                        "string method called on {t} with {a} argument"
                    ))),
                }
            }
            Expr::Size(inner) => match inner.check(schema)? {
                ValueType::String => Ok(ValueType::Uint),
                other => Err(mismatch(format!("size() expects string, found {other}"))),
            },
        }
    }
}
