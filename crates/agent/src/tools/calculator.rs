use async_trait::async_trait;
use concierge_core::ToolArguments;
use serde::Deserialize;
use serde_json::{json, Number, Value};
use thiserror::Error;

use crate::tools::{decode_arguments, Tool, ToolError};

const RESULT_BOUND: f64 = 1e9;
const MAX_NESTING: usize = 100;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum CalculatorError {
    #[error("Invalid expression: unsupported character `{0}`")]
    UnsupportedCharacter(char),
    #[error("Invalid expression: unexpected `{0}`")]
    UnexpectedToken(String),
    #[error("Invalid expression: unexpected end of input")]
    UnexpectedEnd,
    #[error("Invalid expression: malformed number `{0}`")]
    MalformedNumber(String),
    #[error("Invalid expression: division by zero")]
    DivisionByZero,
    #[error("Invalid expression: result is not a real number")]
    NotReal,
    #[error("Invalid expression: Result out of allowed range")]
    OutOfRange,
    #[error("Invalid expression: nesting deeper than 100 levels")]
    TooDeep,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Power,
    LParen,
    RParen,
}

impl Token {
    fn describe(self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Plus => "+".to_owned(),
            Self::Minus => "-".to_owned(),
            Self::Star => "*".to_owned(),
            Self::Slash => "/".to_owned(),
            Self::Power => "**".to_owned(),
            Self::LParen => "(".to_owned(),
            Self::RParen => ")".to_owned(),
        }
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, CalculatorError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&digit) = chars.peek() {
                    if digit.is_ascii_digit() || digit == '.' || digit == '_' {
                        literal.push(digit);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let cleaned = literal.replace('_', "");
                let value = cleaned
                    .parse::<f64>()
                    .map_err(|_| CalculatorError::MalformedNumber(literal.clone()))?;
                tokens.push(Token::Number(value));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    tokens.push(Token::Power);
                } else {
                    tokens.push(Token::Star);
                }
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            other => return Err(CalculatorError::UnsupportedCharacter(other)),
        }
    }
    Ok(tokens)
}

/// Recursive-descent evaluator. `**` is right-associative and binds tighter than a unary minus on
/// its left, so `-2 ** 2` is `-4` and `2 ** -1` is `0.5`.
/// Every recursive path passes through `unary`, so `depth` bounds the call stack.
struct Parser {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.peek();
        self.position += 1;
        token
    }

    fn expression(&mut self) -> Result<f64, CalculatorError> {
        let mut value = self.term()?;
        while let Some(token @ (Token::Plus | Token::Minus)) = self.peek() {
            self.advance();
            let rhs = self.term()?;
            value = if token == Token::Plus { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, CalculatorError> {
        let mut value = self.unary()?;
        while let Some(token @ (Token::Star | Token::Slash)) = self.peek() {
            self.advance();
            let rhs = self.unary()?;
            value = if token == Token::Star {
                value * rhs
            } else {
                if rhs == 0.0 {
                    return Err(CalculatorError::DivisionByZero);
                }
                value / rhs
            };
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, CalculatorError> {
        if self.depth >= MAX_NESTING {
            return Err(CalculatorError::TooDeep);
        }
        self.depth += 1;
        let value = if self.peek() == Some(Token::Minus) {
            self.advance();
            self.unary().map(|value| -value)
        } else {
            self.power()
        };
        self.depth -= 1;
        value
    }

    fn power(&mut self) -> Result<f64, CalculatorError> {
        let base = self.primary()?;
        if self.peek() == Some(Token::Power) {
            self.advance();
            let exponent = self.unary()?;
            if base == 0.0 && exponent < 0.0 {
                return Err(CalculatorError::DivisionByZero);
            }
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, CalculatorError> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::LParen) => {
                let value = self.expression()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    Some(other) => Err(CalculatorError::UnexpectedToken(other.describe())),
                    None => Err(CalculatorError::UnexpectedEnd),
                }
            }
            Some(other) => Err(CalculatorError::UnexpectedToken(other.describe())),
            None => Err(CalculatorError::UnexpectedEnd),
        }
    }
}

/// Evaluates `+ - * / **` with parentheses and unary minus. The result must stay within
/// `±1e9` and is rounded to six decimal places.
pub fn safe_calculate(expr: &str) -> Result<f64, CalculatorError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, position: 0, depth: 0 };
    let value = parser.expression()?;
    if let Some(extra) = parser.peek() {
        return Err(CalculatorError::UnexpectedToken(extra.describe()));
    }
    if value.is_nan() {
        return Err(CalculatorError::NotReal);
    }
    if value.abs() > RESULT_BOUND {
        return Err(CalculatorError::OutOfRange);
    }
    Ok((value * 1e6).round() / 1e6)
}

/// Integral results are reported as JSON integers, everything else as floats.
pub fn to_json_number(value: f64) -> Value {
    if value.fract() == 0.0 {
        return json!(value as i64);
    }
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

#[derive(Debug, Deserialize)]
struct CalculatorArgs {
    expr: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &'static str {
        "calculator"
    }

    fn description(&self) -> &'static str {
        "Safely calculate mathematical expressions. Supports +, -, *, /, ** and parentheses."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expr": {
                    "type": "string",
                    "description": "The mathematical expression to evaluate, e.g. '2 + 3 * 4'"
                }
            },
            "required": ["expr"]
        })
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
        let args: CalculatorArgs = decode_arguments(self.name(), arguments)?;
        let value = safe_calculate(&args.expr)?;
        Ok(to_json_number(value))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{safe_calculate, to_json_number, CalculatorError, CalculatorTool};
    use crate::tools::{Tool, ToolError};

    #[test]
    fn evaluates_with_python_like_precedence() {
        assert_eq!(safe_calculate("2 + 2"), Ok(4.0));
        assert_eq!(safe_calculate("2 + 3 * 4"), Ok(14.0));
        assert_eq!(safe_calculate("-(5 + 2)"), Ok(-7.0));
        assert_eq!(safe_calculate("-2 ** 2"), Ok(-4.0));
        assert_eq!(safe_calculate("2 ** 3 ** 2"), Ok(512.0));
        assert_eq!(safe_calculate("2 ** -1"), Ok(0.5));
        assert_eq!(safe_calculate("10 / 4 - 1"), Ok(1.5));
        assert_eq!(safe_calculate("1 / 3"), Ok(0.333333));
        assert_eq!(safe_calculate("--3"), Ok(3.0));
    }

    #[test]
    fn rejects_unsafe_or_malformed_input() {
        assert_eq!(safe_calculate("1 / 0"), Err(CalculatorError::DivisionByZero));
        assert_eq!(safe_calculate("0 ** -2"), Err(CalculatorError::DivisionByZero));
        assert_eq!(safe_calculate("__import__('os')"), Err(CalculatorError::UnsupportedCharacter('_')));
        assert_eq!(safe_calculate("10 ** 10"), Err(CalculatorError::OutOfRange));
        assert_eq!(safe_calculate("(-8) ** 0.5"), Err(CalculatorError::NotReal));
        assert_eq!(safe_calculate("2 +"), Err(CalculatorError::UnexpectedEnd));
        assert!(matches!(safe_calculate("(1 + 2"), Err(CalculatorError::UnexpectedEnd)));
        assert!(matches!(safe_calculate("1 2"), Err(CalculatorError::UnexpectedToken(_))));
        assert!(matches!(safe_calculate("1.2.3"), Err(CalculatorError::MalformedNumber(_))));
        assert!(matches!(safe_calculate("+1"), Err(CalculatorError::UnexpectedToken(_))));
    }

    #[test]
    fn deep_nesting_is_rejected_without_exhausting_the_stack() {
        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert_eq!(safe_calculate(&parens), Err(CalculatorError::TooDeep));

        let negations = format!("{}1", "-".repeat(100_000));
        assert_eq!(safe_calculate(&negations), Err(CalculatorError::TooDeep));

        let towers = format!("2{}", " ** 1".repeat(100_000));
        assert_eq!(safe_calculate(&towers), Err(CalculatorError::TooDeep));

        let moderate = format!("{}7{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(safe_calculate(&moderate), Ok(7.0));
    }

    #[tokio::test]
    async fn deep_nesting_surfaces_as_a_tool_error() {
        let expr = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        let arguments = json!({"expr": expr}).as_object().cloned().unwrap_or_default();
        let error = CalculatorTool.execute(arguments).await.expect_err("too deep");
        assert!(error.to_string().starts_with("Invalid expression: nesting deeper"));
    }

    #[test]
    fn integral_results_serialise_as_integers() {
        assert_eq!(to_json_number(4.0), json!(4));
        assert_eq!(to_json_number(-7.0), json!(-7));
        assert_eq!(to_json_number(0.5), json!(0.5));
    }

    #[tokio::test]
    async fn tool_decodes_expr_argument() {
        let tool = CalculatorTool;
        let arguments = json!({"expr": "2 + 2"}).as_object().cloned().unwrap_or_default();
        assert_eq!(tool.execute(arguments).await.expect("calculate"), json!(4));

        let missing = tool.execute(Default::default()).await;
        assert!(matches!(missing, Err(ToolError::InvalidArguments { .. })));

        let failing = json!({"expr": "1/0"}).as_object().cloned().unwrap_or_default();
        let error = tool.execute(failing).await.expect_err("division by zero");
        assert_eq!(error.to_string(), "Invalid expression: division by zero");
    }
}
