//! Lexer, AST and recursive-descent parser for the calc language.
//!
//! A program is a sequence of statements separated by newlines or `;`:
//! `import name`, `name = expr`, or a bare expression.

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("SyntaxError: {message} (line {line})")]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

impl SyntaxError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Import,
    True,
    False,
    None,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    LParen,
    RParen,
    Comma,
    Dot,
    Newline,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(_) => "string".to_string(),
            Self::Ident(name) => format!("'{name}'"),
            Self::Newline => "end of line".to_string(),
            Self::Eof => "end of input".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::True => "true",
            Self::False => "false",
            Self::None => "none",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Assign => "=",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::Comma => ",",
            Self::Dot => ".",
            _ => "",
        }
    }
}

pub const KEYWORDS: &[&str] = &["import", "true", "false", "none"];

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    line: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, SyntaxError> {
    Lexer::new(source)
        .run()
        .map(|tokens| tokens.into_iter().map(|s| (s.token, s.line)).collect())
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    tokens: Vec<Spanned>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            tokens: Vec::new(),
        }
    }

    fn push(&mut self, token: Token) {
        self.tokens.push(Spanned {
            token,
            line: self.line,
        });
    }

    fn run(mut self) -> Result<Vec<Spanned>, SyntaxError> {
        while let Some(c) = self.chars.next() {
            match c {
                '\n' => {
                    self.push(Token::Newline);
                    self.line += 1;
                }
                ';' => self.push(Token::Newline),
                c if c.is_whitespace() => {}
                '0'..='9' => self.number(c)?,
                '"' | '\'' => self.string(c)?,
                c if c.is_alphabetic() || c == '_' => self.word(c),
                '+' => self.push(Token::Plus),
                '-' => self.push(Token::Minus),
                '*' => self.push(Token::Star),
                '/' => self.push(Token::Slash),
                '%' => self.push(Token::Percent),
                '(' => self.push(Token::LParen),
                ')' => self.push(Token::RParen),
                ',' => self.push(Token::Comma),
                '.' => self.push(Token::Dot),
                '=' => {
                    let token = if self.chars.next_if_eq(&'=').is_some() {
                        Token::EqEq
                    } else {
                        Token::Assign
                    };
                    self.push(token);
                }
                '!' => {
                    if self.chars.next_if_eq(&'=').is_none() {
                        return Err(SyntaxError::new(self.line, "unexpected character '!'"));
                    }
                    self.push(Token::NotEq);
                }
                '<' => {
                    let token = if self.chars.next_if_eq(&'=').is_some() {
                        Token::Le
                    } else {
                        Token::Lt
                    };
                    self.push(token);
                }
                '>' => {
                    let token = if self.chars.next_if_eq(&'=').is_some() {
                        Token::Ge
                    } else {
                        Token::Gt
                    };
                    self.push(token);
                }
                other => {
                    return Err(SyntaxError::new(
                        self.line,
                        format!("unexpected character '{other}'"),
                    ));
                }
            }
        }
        self.push(Token::Eof);
        Ok(self.tokens)
    }

    fn number(&mut self, first: char) -> Result<(), SyntaxError> {
        let mut text = String::from(first);
        while let Some(c) = self.chars.next_if(char::is_ascii_digit) {
            text.push(c);
        }

        // `1.` followed by a non-digit is an int and an attribute dot.
        let mut lookahead = self.chars.clone();
        let is_float = lookahead.next() == Some('.')
            && lookahead.next().is_some_and(|c| c.is_ascii_digit());
        if is_float {
            self.chars.next();
            text.push('.');
            while let Some(c) = self.chars.next_if(char::is_ascii_digit) {
                text.push(c);
            }
            let value = text
                .parse::<f64>()
                .map_err(|e| SyntaxError::new(self.line, format!("invalid number {text}: {e}")))?;
            self.push(Token::Float(value));
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|e| SyntaxError::new(self.line, format!("invalid number {text}: {e}")))?;
            self.push(Token::Int(value));
        }
        Ok(())
    }

    fn string(&mut self, quote: char) -> Result<(), SyntaxError> {
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some(c) if c == quote => break,
                Some('\\') => match self.chars.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(c @ ('\\' | '"' | '\'')) => text.push(c),
                    Some(c) => {
                        return Err(SyntaxError::new(
                            self.line,
                            format!("unknown escape '\\{c}'"),
                        ));
                    }
                    None => return Err(SyntaxError::new(self.line, "unterminated string")),
                },
                Some('\n') | None => {
                    return Err(SyntaxError::new(self.line, "unterminated string"));
                }
                Some(c) => text.push(c),
            }
        }
        self.push(Token::Str(text));
        Ok(())
    }

    fn word(&mut self, first: char) {
        let mut text = String::from(first);
        while let Some(c) = self.chars.next_if(|c| c.is_alphanumeric() || *c == '_') {
            text.push(c);
        }
        let token = match text.as_str() {
            "import" => Token::Import,
            "true" => Token::True,
            "false" => Token::False,
            "none" => Token::None,
            _ => Token::Ident(text),
        };
        self.push(token);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Binding strength; comparisons are loosest and do not chain.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge => 1,
            Self::Add | Self::Sub => 2,
            Self::Mul | Self::Div | Self::Rem => 3,
        }
    }

    fn comparison(token: &Token) -> Option<Self> {
        Some(match token {
            Token::EqEq => Self::Eq,
            Token::NotEq => Self::Ne,
            Token::Lt => Self::Lt,
            Token::Le => Self::Le,
            Token::Gt => Self::Gt,
            Token::Ge => Self::Ge,
            _ => return None,
        })
    }
}

pub const UNARY_PRECEDENCE: u8 = 4;
pub const POSTFIX_PRECEDENCE: u8 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Attr(Box<Expr>, String),
}

impl Expr {
    pub fn precedence(&self) -> u8 {
        match self {
            Self::Binary(op, _, _) => op.precedence(),
            Self::Neg(_) => UNARY_PRECEDENCE,
            _ => POSTFIX_PRECEDENCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Import(String),
    Assign(String, Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub number: usize,
    pub stmt: Stmt,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub lines: Vec<Line>,
}

pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    let tokens = Lexer::new(source).run()?;
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

/// Deepest expression nesting the parser accepts.
pub const MAX_DEPTH: usize = 200;

static EOF: Token = Token::Eof;

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Nesting of the expression being parsed; bounds recursion here and in
    /// every tree walk downstream.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&EOF)
    }

    fn peek_second(&self) -> &Token {
        self.tokens
            .get(self.pos + 1)
            .map(|s| &s.token)
            .unwrap_or(&EOF)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn nest(&mut self) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(SyntaxError::new(self.line(), "too deeply nested"));
        }
        Ok(())
    }

    fn unexpected(&self) -> SyntaxError {
        SyntaxError::new(
            self.line(),
            format!("unexpected {}", self.peek().describe()),
        )
    }

    fn program(mut self) -> Result<Program, SyntaxError> {
        let mut lines = Vec::new();
        loop {
            while self.eat(&Token::Newline) {}
            if *self.peek() == Token::Eof {
                break;
            }
            let number = self.line();
            let stmt = self.statement()?;
            lines.push(Line { number, stmt });
            match self.peek() {
                Token::Newline | Token::Eof => {}
                _ => return Err(self.unexpected()),
            }
        }
        Ok(Program { lines })
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        if self.eat(&Token::Import) {
            return match self.advance() {
                Token::Ident(name) => Ok(Stmt::Import(name)),
                _ => Err(SyntaxError::new(self.line(), "expected a module name after import")),
            };
        }
        if let (Token::Ident(name), Token::Assign) = (self.peek(), self.peek_second()) {
            let name = name.clone();
            self.pos += 2;
            return Ok(Stmt::Assign(name, self.expression()?));
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        let outer = self.depth;
        self.nest()?;
        let expr = self.comparison();
        self.depth = outer;
        expr
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.additive()?;
        let Some(op) = BinOp::comparison(self.peek()) else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.additive()?;
        if BinOp::comparison(self.peek()).is_some() {
            return Err(SyntaxError::new(
                self.line(),
                "chained comparisons are not supported",
            ));
        }
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr, SyntaxError> {
        let outer = self.depth;
        let mut expr = self.term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => {
                    self.depth = outer;
                    return Ok(expr);
                }
            };
            self.pos += 1;
            self.nest()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let outer = self.depth;
        let mut expr = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Rem,
                _ => {
                    self.depth = outer;
                    return Ok(expr);
                }
            };
            self.pos += 1;
            self.nest()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat(&Token::Minus) {
            let outer = self.depth;
            self.nest()?;
            let operand = self.unary()?;
            self.depth = outer;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let outer = self.depth;
        let mut expr = self.primary()?;
        loop {
            if matches!(self.peek(), Token::LParen | Token::Dot) {
                self.nest()?;
            }
            if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        if !self.eat(&Token::Comma) {
                            return Err(self.unexpected());
                        }
                    }
                }
                expr = Expr::Call(Box::new(expr), args);
            } else if self.eat(&Token::Dot) {
                match self.advance() {
                    Token::Ident(name) => expr = Expr::Attr(Box::new(expr), name),
                    _ => {
                        return Err(SyntaxError::new(
                            self.line(),
                            "expected an attribute name after '.'",
                        ));
                    }
                }
            } else {
                self.depth = outer;
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let expr = match self.peek() {
            Token::Int(n) => Expr::Int(*n),
            Token::Float(f) => Expr::Float(*f),
            Token::Str(s) => Expr::Str(s.clone()),
            Token::True => Expr::Bool(true),
            Token::False => Expr::Bool(false),
            Token::None => Expr::None,
            Token::Ident(name) => Expr::Name(name.clone()),
            Token::LParen => {
                self.pos += 1;
                let inner = self.expression()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.unexpected());
                }
                return Ok(inner);
            }
            _ => return Err(self.unexpected()),
        };
        self.pos += 1;
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i64) -> Box<Expr> {
        Box::new(Expr::Int(n))
    }

    #[test]
    fn precedence_and_associativity() {
        let program = parse("1 + 2 * 3 - 4").unwrap();
        assert_eq!(
            program.lines[0].stmt,
            Stmt::Expr(Expr::Binary(
                BinOp::Sub,
                Box::new(Expr::Binary(
                    BinOp::Add,
                    int(1),
                    Box::new(Expr::Binary(BinOp::Mul, int(2), int(3)))
                )),
                int(4)
            ))
        );
    }

    #[test]
    fn statements_and_line_numbers() {
        let program = parse("import math\n\nx = math.sqrt(16); print(x)").unwrap();
        let numbers: Vec<usize> = program.lines.iter().map(|l| l.number).collect();
        assert_eq!(numbers, vec![1, 3, 3]);
        assert_eq!(program.lines[0].stmt, Stmt::Import("math".to_string()));
        assert!(matches!(&program.lines[1].stmt, Stmt::Assign(name, Expr::Call(..)) if name == "x"));
    }

    #[test]
    fn numbers_and_attribute_dots() {
        let tokens: Vec<Token> = tokenize("1.5 2.x").unwrap().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            tokens,
            vec![
                Token::Float(1.5),
                Token::Int(2),
                Token::Dot,
                Token::Ident("x".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let program = parse(r#"'it\'s' + "a\tb""#).unwrap();
        let Stmt::Expr(Expr::Binary(_, left, right)) = &program.lines[0].stmt else {
            panic!("expected a binary expression");
        };
        assert_eq!(**left, Expr::Str("it's".to_string()));
        assert_eq!(**right, Expr::Str("a\tb".to_string()));
    }

    #[test]
    fn errors_carry_line_numbers() {
        assert_eq!(
            parse("x = 1\ny = (2 +").unwrap_err().to_string(),
            "SyntaxError: unexpected end of input (line 2)"
        );
        assert_eq!(
            parse("1 < 2 < 3").unwrap_err().message,
            "chained comparisons are not supported"
        );
        assert_eq!(
            parse("\"open").unwrap_err().message,
            "unterminated string"
        );
        assert_eq!(parse("1 2").unwrap_err().message, "unexpected 2");
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let negations = format!("{}1", "-".repeat(200_000));
        assert_eq!(parse(&negations).unwrap_err().message, "too deeply nested");

        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert_eq!(parse(&parens).unwrap_err().message, "too deeply nested");

        let sum = format!("x = 1{}", " + 1".repeat(100_000));
        assert_eq!(parse(&sum).unwrap_err().to_string(), "SyntaxError: too deeply nested (line 1)");

        let calls = format!("f{}", "()".repeat(100_000));
        assert_eq!(parse(&calls).unwrap_err().message, "too deeply nested");
    }

    #[test]
    fn moderate_nesting_parses() {
        let parens = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert_eq!(parse(&parens).unwrap().lines[0].stmt, Stmt::Expr(Expr::Int(1)));
        let sum = format!("1{}", " + 1".repeat(100));
        assert!(parse(&sum).is_ok());
        assert!(parse(&"-".repeat(100)).is_err());
        assert!(parse(&format!("{}1", "-".repeat(100))).is_ok());
    }
}
