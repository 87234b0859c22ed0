use relay_core::RunContext;
use relay_core::tool::{BlockingTool, Error as ToolError, ExecuteResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, JsonSchema)]
pub struct CalculatorInput {
    #[schemars(description = "The expression to evaluate, e.g. `2 + 3 * 4`.")]
    expression: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CalculatorOutput {
    #[schemars(description = "The value of the expression.")]
    pub result: f64,
}

/// A tool for evaluating arithmetic expressions.
///
/// Supports `+ - * / // % **`, unary signs and parentheses over floating
/// point numbers. Nothing else is accepted.
#[derive(Default)]
pub struct CalculatorTool;

impl CalculatorTool {
    /// Creates a new calculator tool.
    #[inline]
    pub fn new() -> Self {
        CalculatorTool
    }
}

impl BlockingTool for CalculatorTool {
    type Input = CalculatorInput;
    type Output = CalculatorOutput;

    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluates an arithmetic expression and returns its value. \
         Supports + - * / // % ** and parentheses."
    }

    fn execute(
        &self,
        input: CalculatorInput,
        _ctx: Option<RunContext>,
    ) -> ExecuteResult<CalculatorOutput> {
        let result = evaluate(&input.expression).map_err(|err| {
            ToolError::execution_error()
                .with_reason(format!("Failed to evaluate expression: {err}"))
        })?;
        Ok(CalculatorOutput { result }.into())
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub(crate) enum EvalError {
    #[error("unexpected character `{0}`")]
    UnexpectedChar(char),
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
    #[error("unexpected {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NotFinite,
    #[error("expression is nested too deeply")]
    TooDeep,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Token {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    DoubleStar,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = vec![];
    let mut chars = source.char_indices().peekable();
    while let Some((start, ch)) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '0'..='9' | '.' => {
                let mut end = start + 1;
                while let Some(&(idx, c)) = chars.peek() {
                    if !(c.is_ascii_digit() || c == '.' || c == '_') {
                        break;
                    }
                    end = idx + 1;
                    chars.next();
                }
                let literal = &source[start..end];
                let number = literal
                    .replace('_', "")
                    .parse()
                    .map_err(|_| EvalError::InvalidNumber(literal.to_owned()))?;
                Token::Num(number)
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' if chars.next_if(|&(_, c)| c == '*').is_some() => {
                Token::DoubleStar
            }
            '*' => Token::Star,
            '/' if chars.next_if(|&(_, c)| c == '/').is_some() => {
                Token::DoubleSlash
            }
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            c => return Err(EvalError::UnexpectedChar(c)),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

/// A recursive descent parser that evaluates while parsing.
///
/// ```text
/// expr  := term (("+" | "-") term)*
/// term  := unary (("*" | "/" | "//" | "%") unary)*
/// unary := ("+" | "-") unary | power
/// power := atom ("**" unary)?
/// atom  := number | "(" expr ")"
/// ```
///
/// Every recursive cycle of the grammar passes through `unary`, so nesting
/// is bounded there.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

const MAX_DEPTH: usize = 256;

impl Parser {
    #[inline]
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    #[inline]
    fn bump(&mut self) -> Option<Token> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }

    fn expr(&mut self) -> Result<f64, EvalError> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.bump();
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.bump();
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, EvalError> {
        let mut value = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(
                    op @ (Token::Star
                    | Token::Slash
                    | Token::DoubleSlash
                    | Token::Percent),
                ) => op,
                _ => return Ok(value),
            };
            self.bump();
            let rhs = self.unary()?;
            value = match op {
                Token::Star => value * rhs,
                _ if rhs == 0.0 => return Err(EvalError::DivisionByZero),
                Token::Slash => value / rhs,
                Token::DoubleSlash => (value / rhs).floor(),
                // Takes the sign of the divisor.
                _ => value - rhs * (value / rhs).floor(),
            };
        }
    }

    fn unary(&mut self) -> Result<f64, EvalError> {
        if self.depth >= MAX_DEPTH {
            return Err(EvalError::TooDeep);
        }
        self.depth += 1;
        let value = self.signed();
        self.depth -= 1;
        value
    }

    fn signed(&mut self) -> Result<f64, EvalError> {
        match self.peek() {
            Some(Token::Plus) => {
                self.bump();
                self.unary()
            }
            Some(Token::Minus) => {
                self.bump();
                Ok(-self.unary()?)
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, EvalError> {
        let base = self.atom()?;
        if self.peek() == Some(Token::DoubleStar) {
            self.bump();
            // Right associative, and binds tighter than a unary sign on its
            // left: `-2 ** 2` is `-4`.
            let exp = self.unary()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64, EvalError> {
        match self.bump() {
            Some(Token::Num(value)) => Ok(value),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(value),
                    Some(token) => Err(unexpected(token)),
                    None => Err(EvalError::UnexpectedEnd),
                }
            }
            Some(token) => Err(unexpected(token)),
            None => Err(EvalError::UnexpectedEnd),
        }
    }
}

#[inline]
fn unexpected(token: Token) -> EvalError {
    EvalError::UnexpectedToken(format!("{token:?}"))
}

pub(crate) fn evaluate(expression: &str) -> Result<f64, EvalError> {
    let mut parser = Parser {
        tokens: tokenize(expression)?,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some(token) = parser.peek() {
        return Err(unexpected(token));
    }
    if !value.is_finite() {
        return Err(EvalError::NotFinite);
    }
    Ok(value)
}
