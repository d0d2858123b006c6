//! Recursive-descent parser
//!
//! Precedence, lowest first: `or`, `and`, `not`, comparisons (chainable,
//! including `in` / `not in`), `+ -`, `* / %`, unary `-`, postfix
//! (`[i]`, `.field`, `.method()`).

use serde_json::Value;

use super::builtins;
use super::lexer::{tokenize, Spanned, Token};
use super::value;
use super::{ExprError, ExprResult};

/// Maximum nesting of sub-expressions
const MAX_DEPTH: usize = 64;

/// Tallest tree an operator chain may grow, counting its operands
const MAX_HEIGHT: usize = 128;

const RESERVED: [&str; 12] = [
    "and", "or", "not", "in", "for", "if", "true", "false", "null", "True", "False", "None",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Field {
        target: Box<Expr>,
        name: String,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `a < b <= c` evaluates pairwise, short-circuiting
    Compare {
        first: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    Comprehension {
        element: Box<Expr>,
        var: String,
        iterable: Box<Expr>,
        condition: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign(String, Expr),
    Expr(Expr),
}

/// A block of statements; its value is the last statement's value
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

/// Parse a single expression
pub fn parse_expression(source: &str) -> ExprResult<Expr> {
    let mut parser = Parser::new(source)?;
    let expr = parser.expression()?;
    parser.expect_end()?;
    Ok(expr)
}

/// Parse a statement block
pub fn parse_program(source: &str) -> ExprResult<Program> {
    let mut parser = Parser::new(source)?;
    let mut statements = Vec::new();

    while !parser.at(&Token::Eof) {
        statements.push(parser.statement()?);
        if !parser.eat(&Token::Separator) && !parser.at(&Token::Eof) {
            return Err(parser.error("expected end of statement"));
        }
    }

    if statements.is_empty() {
        return Err(ExprError::Syntax {
            position: 0,
            message: "empty block".to_string(),
        });
    }
    Ok(Program { statements })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(source: &str) -> ExprResult<Self> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
            depth: 0,
        })
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].token
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn at_word(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(w) if w == word)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.at_word(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> ExprResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn expect_end(&mut self) -> ExprResult<()> {
        if self.at(&Token::Eof) {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input"))
        }
    }

    fn error(&self, message: &str) -> ExprError {
        let spanned = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        ExprError::Syntax {
            position: spanned.position,
            message: format!("{} (found {:?})", message, spanned.token),
        }
    }

    fn identifier(&mut self, what: &str) -> ExprResult<String> {
        match self.peek().clone() {
            Token::Ident(name) if !RESERVED.contains(&name.as_str()) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(&format!("expected {}", what))),
        }
    }

    fn statement(&mut self) -> ExprResult<Stmt> {
        if matches!(self.peek_at(1), Token::Assign) {
            if let Token::Ident(name) = self.peek().clone() {
                if RESERVED.contains(&name.as_str()) {
                    return Err(self.error("cannot assign to a reserved word"));
                }
                self.advance();
                self.advance();
                return Ok(Stmt::Assign(name, self.expression()?));
            }
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    fn enter(&mut self) -> ExprResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::Limit(format!("nesting deeper than {}", MAX_DEPTH)));
        }
        Ok(())
    }

    fn expression(&mut self) -> ExprResult<Expr> {
        self.enter()?;
        let result = self.or_expr();
        self.depth -= 1;
        result
    }

    fn or_expr(&mut self) -> ExprResult<Expr> {
        let mut left = self.and_expr()?;
        let mut height = tree_height(&left);
        while self.eat_word("or") || self.eat(&Token::OrOr) {
            let right = self.and_expr()?;
            height = grow(height, [&right])?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> ExprResult<Expr> {
        let mut left = self.not_expr()?;
        let mut height = tree_height(&left);
        while self.eat_word("and") || self.eat(&Token::AndAnd) {
            let right = self.not_expr()?;
            height = grow(height, [&right])?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> ExprResult<Expr> {
        if self.eat_word("not") || self.eat(&Token::Bang) {
            self.enter()?;
            let inner = self.not_expr();
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner?)));
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let not_in = self.at_word("not") && matches!(self.peek_at(1), Token::Ident(n) if n == "in");
        let op = match self.peek() {
            Token::Eq => CmpOp::Eq,
            Token::Ne => CmpOp::Ne,
            Token::Lt => CmpOp::Lt,
            Token::Le => CmpOp::Le,
            Token::Gt => CmpOp::Gt,
            Token::Ge => CmpOp::Ge,
            Token::Ident(w) if w == "in" => CmpOp::In,
            _ if not_in => CmpOp::NotIn,
            _ => return None,
        };
        if op == CmpOp::NotIn {
            self.advance();
        }
        self.advance();
        Some(op)
    }

    fn comparison(&mut self) -> ExprResult<Expr> {
        let first = self.additive()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.additive()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn additive(&mut self) -> ExprResult<Expr> {
        let mut left = self.term()?;
        let mut height = tree_height(&left);
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            height = grow(height, [&right])?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> ExprResult<Expr> {
        let mut left = self.unary()?;
        let mut height = tree_height(&left);
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            height = grow(height, [&right])?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> ExprResult<Expr> {
        if self.eat(&Token::Minus) {
            self.enter()?;
            let inner = self.unary();
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner?)));
        }
        if self.eat(&Token::Plus) {
            self.enter()?;
            let inner = self.unary();
            self.depth -= 1;
            return inner;
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ExprResult<Expr> {
        let mut expr = self.primary()?;
        let mut height = tree_height(&expr);
        loop {
            if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(&Token::RBracket, "']'")?;
                height = grow(height, [&index])?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat(&Token::Dot) {
                let name = self.identifier("field or method name")?;
                if self.eat(&Token::LParen) {
                    // x.f(a) is f(x, a)
                    let rest = self.arguments()?;
                    height = grow(height, &rest)?;
                    let mut args = vec![expr];
                    args.extend(rest);
                    expr = self.call(name, args)?;
                } else {
                    height = grow(height, std::iter::empty::<&Expr>())?;
                    expr = Expr::Field {
                        target: Box::new(expr),
                        name,
                    };
                }
            } else {
                return Ok(expr);
            }
        }
    }

    fn call(&self, name: String, args: Vec<Expr>) -> ExprResult<Expr> {
        if !builtins::is_builtin(&name) {
            return Err(ExprError::UnknownFunction(name));
        }
        Ok(Expr::Call { name, args })
    }

    /// Arguments after an opening `(`, through the closing `)`
    fn arguments(&mut self) -> ExprResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma, "',' or ')'")?;
        }
    }

    fn primary(&mut self) -> ExprResult<Expr> {
        let token = self.peek().clone();
        let literal = match token {
            Token::Int(i) => Some(value::int(i)),
            Token::Float(f) => Some(value::float(f)?),
            Token::Str(ref s) => Some(Value::String(s.clone())),
            Token::Ident(ref w) if w == "true" || w == "True" => Some(Value::Bool(true)),
            Token::Ident(ref w) if w == "false" || w == "False" => Some(Value::Bool(false)),
            Token::Ident(ref w) if w == "null" || w == "None" => Some(Value::Null),
            _ => None,
        };
        if let Some(literal) = literal {
            self.advance();
            return Ok(Expr::Literal(literal));
        }

        match token {
            Token::Ident(word) => {
                if RESERVED.contains(&word.as_str()) {
                    return Err(self.error("unexpected keyword"));
                }
                self.advance();
                if self.eat(&Token::LParen) {
                    let args = self.arguments()?;
                    self.call(word, args)
                } else {
                    Ok(Expr::Var(word))
                }
            }
            Token::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                self.advance();
                self.list_or_comprehension()
            }
            Token::LBrace => {
                self.advance();
                self.map_literal()
            }
            _ => Err(self.error("expected a value")),
        }
    }

    fn list_or_comprehension(&mut self) -> ExprResult<Expr> {
        if self.eat(&Token::RBracket) {
            return Ok(Expr::List(Vec::new()));
        }

        let first = self.expression()?;

        if self.eat_word("for") {
            let var = self.identifier("loop variable")?;
            if !self.eat_word("in") {
                return Err(self.error("expected 'in'"));
            }
            let iterable = self.expression()?;
            let condition = if self.eat_word("if") {
                Some(Box::new(self.expression()?))
            } else {
                None
            };
            self.expect(&Token::RBracket, "']'")?;
            return Ok(Expr::Comprehension {
                element: Box::new(first),
                var,
                iterable: Box::new(iterable),
                condition,
            });
        }

        let mut items = vec![first];
        loop {
            if self.eat(&Token::RBracket) {
                return Ok(Expr::List(items));
            }
            self.expect(&Token::Comma, "',' or ']'")?;
            // Trailing comma
            if self.eat(&Token::RBracket) {
                return Ok(Expr::List(items));
            }
            items.push(self.expression()?);
        }
    }

    fn map_literal(&mut self) -> ExprResult<Expr> {
        let mut entries = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(Expr::Map(entries));
        }
        loop {
            let key = self.expression()?;
            self.expect(&Token::Colon, "':'")?;
            let value = self.expression()?;
            entries.push((key, value));

            if self.eat(&Token::RBrace) {
                return Ok(Expr::Map(entries));
            }
            self.expect(&Token::Comma, "',' or '}'")?;
            if self.eat(&Token::RBrace) {
                return Ok(Expr::Map(entries));
            }
        }
    }
}

/// Height of a node over a chain of `height` and further `operands`
fn grow<'e>(height: usize, operands: impl IntoIterator<Item = &'e Expr>) -> ExprResult<usize> {
    let grown = operands.into_iter().map(tree_height).fold(height, usize::max) + 1;
    if grown > MAX_HEIGHT {
        return Err(ExprError::Limit(format!("expression deeper than {}", MAX_HEIGHT)));
    }
    Ok(grown)
}

/// Longest root-to-leaf path. Only called on trees the parser has already
/// bounded, so the recursion stays shallow.
fn tree_height(expr: &Expr) -> usize {
    let tallest_child = match expr {
        Expr::Literal(_) | Expr::Var(_) => 0,
        Expr::List(items) | Expr::Call { args: items, .. } => items.iter().map(tree_height).max().unwrap_or(0),
        Expr::Map(entries) => entries
            .iter()
            .map(|(k, v)| tree_height(k).max(tree_height(v)))
            .max()
            .unwrap_or(0),
        Expr::Index { target, index } => tree_height(target).max(tree_height(index)),
        Expr::Field { target, .. } => tree_height(target),
        Expr::Neg(inner) | Expr::Not(inner) => tree_height(inner),
        Expr::Binary { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
            tree_height(left).max(tree_height(right))
        }
        Expr::Compare { first, rest } => rest
            .iter()
            .map(|(_, e)| tree_height(e))
            .fold(tree_height(first), usize::max),
        Expr::Comprehension {
            element,
            iterable,
            condition,
            ..
        } => {
            let tallest = tree_height(element).max(tree_height(iterable));
            condition.as_deref().map_or(tallest, |c| tallest.max(tree_height(c)))
        }
    };
    tallest_child + 1
}
