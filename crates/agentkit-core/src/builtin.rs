//! Built-in Tools

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{ParamType, ParameterSchema, Tool, ToolSchema};

/// DateTime tool - returns current time
pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("datetime", "Get the current date and time").param(
            ParameterSchema::optional("format", ParamType::String, "Output format: 'iso', 'human', or 'unix'")
                .with_enum(vec![json!("iso"), json!("human"), json!("unix")]),
        )
    }

    async fn invoke(&self, arguments: &Value) -> anyhow::Result<Value> {
        let format = arguments
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("human");

        let now = chrono::Utc::now();

        Ok(match format {
            "iso" => json!({ "value": now.to_rfc3339() }),
            "unix" => json!({ "value": now.timestamp() }),
            _ => json!({ "value": now.format("%A, %B %d, %Y at %H:%M:%S UTC").to_string() }),
        })
    }
}

/// Calculator tool - evaluates arithmetic expressions
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("calculator", "Evaluate an arithmetic expression").param(
            ParameterSchema::required(
                "expr",
                ParamType::String,
                "Expression using + - * / ^ and parentheses (e.g., '2+2', '(2 + 3) * 4')",
            ),
        )
    }

    async fn invoke(&self, arguments: &Value) -> anyhow::Result<Value> {
        let expr = arguments
            .get("expr")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("missing expression"))?;

        let result = evaluate_expression(expr).map_err(|e| anyhow::anyhow!(e))?;
        Ok(json!({ "value": number(result) }))
    }
}

/// Integral results are reported as integers
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        #[allow(clippy::cast_possible_truncation, reason = "integral and within i64 range")]
        let int = value as i64;
        json!(int)
    } else {
        json!(value)
    }
}

/// Longest expression accepted, in characters
const MAX_EXPR_LEN: usize = 4096;

/// Deepest nesting of parentheses, unary minus and exponents
const MAX_DEPTH: usize = 256;

/// Recursive-descent evaluator over `+ - * / ^`, unary minus and parentheses
fn evaluate_expression(expr: &str) -> std::result::Result<f64, String> {
    if expr.chars().count() > MAX_EXPR_LEN {
        return Err(format!("expression longer than {MAX_EXPR_LEN} characters"));
    }
    let tokens: Vec<char> = expr.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parser = Parser { tokens: &tokens, pos: 0, depth: 0 };
    let value = parser.sum()?;
    if parser.pos != tokens.len() {
        return Err(format!("unexpected '{}'", tokens[parser.pos]));
    }
    Ok(value)
}

struct Parser<'a> {
    tokens: &'a [char],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    /// Run `f` one level deeper, refusing to recurse past `MAX_DEPTH`
    fn nested(
        &mut self,
        f: impl FnOnce(&mut Self) -> std::result::Result<f64, String>,
    ) -> std::result::Result<f64, String> {
        if self.depth >= MAX_DEPTH {
            return Err("expression nested too deeply".into());
        }
        self.depth += 1;
        let value = f(self);
        self.depth -= 1;
        value
    }

    fn sum(&mut self) -> std::result::Result<f64, String> {
        let mut acc = self.product()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.product()?;
            acc = if op == '+' { acc + rhs } else { acc - rhs };
        }
        Ok(acc)
    }

    fn product(&mut self) -> std::result::Result<f64, String> {
        let mut acc = self.power()?;
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.power()?;
            if op == '/' {
                if rhs == 0.0 {
                    return Err("Division by zero".into());
                }
                acc /= rhs;
            } else {
                acc *= rhs;
            }
        }
        Ok(acc)
    }

    // Right-associative
    fn power(&mut self) -> std::result::Result<f64, String> {
        let base = self.unary()?;
        if self.peek() == Some('^') {
            self.pos += 1;
            let exp = self.nested(Self::power)?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn unary(&mut self) -> std::result::Result<f64, String> {
        if self.peek() == Some('-') {
            self.pos += 1;
            return Ok(-self.nested(Self::unary)?);
        }
        self.atom()
    }

    fn atom(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let inner = self.nested(Self::sum)?;
                if self.peek() != Some(')') {
                    return Err("missing ')'".into());
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                let literal: String = self.tokens[start..self.pos].iter().collect();
                literal.parse::<f64>().map_err(|e| format!("Parse error: {e}"))
            }
            Some(c) => Err(format!("unexpected '{c}'")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculator() {
        assert!((evaluate_expression("2 + 2").unwrap() - 4.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("10 * 5").unwrap() - 50.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("(2 + 3) * 4").unwrap() - 20.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("2 ^ 8").unwrap() - 256.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("10 - 4 - 3").unwrap() - 3.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("-3 * -2").unwrap() - 6.0).abs() < f64::EPSILON);
        assert!(evaluate_expression("1 / 0").is_err());
        assert!(evaluate_expression("2 +").is_err());
        assert!(evaluate_expression("(1").is_err());
    }

    #[test]
    fn test_deep_nesting_is_an_error_not_a_crash() {
        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert!(evaluate_expression(&parens).unwrap_err().contains("longer than"));

        // Short enough to pass the length cap, too deep to evaluate
        let parens = format!("{}1{}", "(".repeat(1_000), ")".repeat(1_000));
        assert_eq!(evaluate_expression(&parens).unwrap_err(), "expression nested too deeply");
        let minus = format!("{}1", "-".repeat(4_000));
        assert_eq!(evaluate_expression(&minus).unwrap_err(), "expression nested too deeply");
        let tower = format!("2{}", "^1".repeat(1_000));
        assert_eq!(evaluate_expression(&tower).unwrap_err(), "expression nested too deeply");

        let ok = format!("{}7{}", "(".repeat(100), ")".repeat(100));
        assert!((evaluate_expression(&ok).unwrap() - 7.0).abs() < f64::EPSILON);
        assert!((evaluate_expression("--2").unwrap() - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_calculator_tool_output() {
        let out = CalculatorTool.invoke(&json!({"expr": "2+2"})).await.unwrap();
        assert_eq!(out, json!({"value": 4}));
        let frac = CalculatorTool.invoke(&json!({"expr": "1/4"})).await.unwrap();
        assert_eq!(frac, json!({"value": 0.25}));
    }

    #[tokio::test]
    async fn test_datetime_unix() {
        let out = DateTimeTool.invoke(&json!({"format": "unix"})).await.unwrap();
        assert!(out["value"].is_i64());
    }
}
