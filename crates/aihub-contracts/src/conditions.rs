//! Restricted expression language for field visibility/availability checks.
//!
//! Supported: comparisons (chained, `a < b < c`), `and`/`or`/`not` with the
//! aliases `&&`, `||`, `!`, `AND`, `OR`, `NOT`, `===`, `!==`, arithmetic
//! (`+ - * / // % **`), unary `+`/`-`, dotted attribute access and literals
//! (strings, numbers, `true`/`false`/`null` and their `True`/`False`/`None`
//! spellings). Evaluation never panics and never propagates an error: every
//! failure is converted to `false` plus a diagnostic.

use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionSpec {
    pub condition: Option<String>,
    pub error: Option<String>,
}

impl ConditionSpec {
    /// Accepts either `{"condition": "...", "error": "..."}` or a bare string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self {
                condition: Some(text.clone()),
                error: None,
            }),
            Value::Object(obj) => Some(Self {
                condition: obj
                    .get("condition")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                error: obj.get("error").and_then(Value::as_str).map(str::to_string),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator {
    spec: ConditionSpec,
    error_evaluating: Option<String>,
}

impl ConditionEvaluator {
    pub fn new(spec: ConditionSpec) -> Self {
        Self {
            spec,
            error_evaluating: None,
        }
    }

    pub fn condition(&self) -> Option<&str> {
        self.spec.condition.as_deref()
    }

    /// Evaluates the condition against the current field values.
    ///
    /// `half_size` and `half_size_coords` are exposed to the expression under
    /// those names, next to every field id.
    pub fn evaluate<I>(&mut self, fields: I, half_size: bool, half_size_coords: bool) -> bool
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.error_evaluating = None;
        let Some(condition) = self.spec.condition.clone() else {
            return true;
        };
        if condition.trim().is_empty() {
            return true;
        }

        let mut context = Map::new();
        for (id, value) in fields {
            context.insert(id, value);
        }
        context.insert("half_size".to_string(), Value::Bool(half_size));
        context.insert(
            "half_size_coords".to_string(),
            Value::Bool(half_size_coords),
        );

        let expr = match parse(&condition) {
            Ok(expr) => expr,
            Err(err) => {
                self.error_evaluating =
                    Some(format!("Error parsing condition '{condition}': {err}"));
                return false;
            }
        };
        match eval(&expr, &context) {
            Ok(value) => truthy(&value),
            Err(err) => {
                self.error_evaluating =
                    Some(format!("Error evaluating condition '{condition}': {err}"));
                false
            }
        }
    }

    pub fn get_error_message(&self) -> String {
        if let Some(err) = &self.error_evaluating {
            return err.clone();
        }
        if let Some(message) = &self.spec.error {
            return message.clone();
        }
        format!(
            "Condition {} not met.",
            self.spec.condition.as_deref().unwrap_or_default()
        )
    }
}

/// Parses and evaluates `expression` directly against `context`.
pub fn evaluate_expression(expression: &str, context: &Map<String, Value>) -> Result<bool, String> {
    let expr = parse(expression)?;
    eval(&expr, context).map(|value| truthy(&value))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Op(&'static str),
    LParen,
    RParen,
    Dot,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let starts_number = c.is_ascii_digit()
            || (c == '.'
                && chars.get(i + 1).is_some_and(|next| next.is_ascii_digit())
                && !matches!(
                    tokens.last(),
                    Some(Token::Ident(_)) | Some(Token::RParen) | Some(Token::Str(_))
                ));
        if starts_number {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i < chars.len() && chars[i] == '.' {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    is_float = true;
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            if is_float {
                let parsed = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Float(parsed));
            } else {
                match text.parse::<i64>() {
                    Ok(parsed) => tokens.push(Token::Int(parsed)),
                    Err(_) => {
                        let parsed = text
                            .parse::<f64>()
                            .map_err(|_| format!("invalid number '{text}'"))?;
                        tokens.push(Token::Float(parsed));
                    }
                }
            }
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i];
                if ch == '\\' {
                    let Some(escaped) = chars.get(i + 1) else {
                        break;
                    };
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => *other,
                    });
                    i += 2;
                    continue;
                }
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                text.push(ch);
                i += 1;
            }
            if !closed {
                return Err("unterminated string literal".to_string());
            }
            tokens.push(Token::Str(text));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "and" | "AND" => Token::And,
                "or" | "OR" => Token::Or,
                "not" | "NOT" => Token::Not,
                "true" | "True" => Token::True,
                "false" | "False" => Token::False,
                "null" | "None" => Token::Null,
                _ => Token::Ident(word),
            });
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        let (token, width) = if rest.starts_with("===") {
            (Token::Op("=="), 3)
        } else if rest.starts_with("!==") {
            (Token::Op("!="), 3)
        } else if rest.starts_with("==") {
            (Token::Op("=="), 2)
        } else if rest.starts_with("!=") {
            (Token::Op("!="), 2)
        } else if rest.starts_with("<=") {
            (Token::Op("<="), 2)
        } else if rest.starts_with(">=") {
            (Token::Op(">="), 2)
        } else if rest.starts_with("&&") {
            (Token::And, 2)
        } else if rest.starts_with("||") {
            (Token::Or, 2)
        } else if rest.starts_with("**") {
            (Token::Op("**"), 2)
        } else if rest.starts_with("//") {
            (Token::Op("//"), 2)
        } else {
            match c {
                '!' => (Token::Not, 1),
                '<' => (Token::Op("<"), 1),
                '>' => (Token::Op(">"), 1),
                '+' => (Token::Op("+"), 1),
                '-' => (Token::Op("-"), 1),
                '*' => (Token::Op("*"), 1),
                '/' => (Token::Op("/"), 1),
                '%' => (Token::Op("%"), 1),
                '(' => (Token::LParen, 1),
                ')' => (Token::RParen, 1),
                '.' => (Token::Dot, 1),
                other => return Err(format!("unexpected character '{other}'")),
            }
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Name(String),
    Attr(Box<Expr>, String),
    Neg(Box<Expr>),
    Pos(Box<Expr>),
    Not(Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Vec<(&'static str, Expr)>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

/// Deepest expression tree the parser builds; evaluation recurses per level.
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

fn parse(source: &str) -> Result<Expr, String> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or_expr()?;
    if let Some(token) = parser.peek() {
        return Err(format!("unexpected token {token:?}"));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn enter(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        Ok(())
    }

    /// Parses one nested level, e.g. an operand under a unary operator.
    fn nested(&mut self, parse: fn(&mut Self) -> Result<Expr, String>) -> Result<Expr, String> {
        self.enter()?;
        let expr = parse(self);
        self.depth -= 1;
        expr
    }

    fn peek_op(&self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) => ops.iter().copied().find(|candidate| candidate == op),
            _ => None,
        }
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut items = vec![self.and_expr()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            items.push(self.and_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut items = vec![self.not_expr()?];
        while matches!(self.peek(), Some(Token::And)) {
            self.pos += 1;
            items.push(self.not_expr()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn not_expr(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.nested(Self::not_expr)?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.peek_op(&["==", "!=", "<", "<=", ">", ">="]) {
            self.pos += 1;
            rest.push((op, self.arith()?));
        }
        Ok(if rest.is_empty() {
            left
        } else {
            Expr::Compare(Box::new(left), rest)
        })
    }

    fn arith(&mut self) -> Result<Expr, String> {
        let start = self.depth;
        let mut left = self.term()?;
        while let Some(op) = self.peek_op(&["+", "-"]) {
            self.pos += 1;
            self.enter()?;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = start;
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let start = self.depth;
        let mut left = self.factor()?;
        while let Some(op) = self.peek_op(&["*", "/", "//", "%"]) {
            self.pos += 1;
            self.enter()?;
            let right = self.factor()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = start;
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, String> {
        match self.peek_op(&["+", "-"]) {
            Some("-") => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.nested(Self::factor)?)))
            }
            Some(_) => {
                self.pos += 1;
                Ok(Expr::Pos(Box::new(self.nested(Self::factor)?)))
            }
            None => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, String> {
        let base = self.primary()?;
        if self.peek_op(&["**"]).is_some() {
            self.pos += 1;
            let exponent = self.nested(Self::factor)?;
            return Ok(Expr::Binary("**", Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        let start = self.depth;
        let mut expr = self.atom()?;
        while matches!(self.peek(), Some(Token::Dot)) {
            self.pos += 1;
            self.enter()?;
            match self.next() {
                Some(Token::Ident(name)) => expr = Expr::Attr(Box::new(expr), name),
                other => return Err(format!("expected attribute name, found {other:?}")),
            }
        }
        self.depth = start;
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Expr::Literal(Value::from(value))),
            Some(Token::Float(value)) => Ok(Expr::Literal(float_value(value)?)),
            Some(Token::Str(value)) => Ok(Expr::Literal(Value::String(value))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Name(name)),
            Some(Token::LParen) => {
                let inner = self.nested(Self::or_expr)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn eval(expr: &Expr, context: &Map<String, Value>) -> Result<Value, String> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name(name) => context
            .get(name)
            .cloned()
            .ok_or_else(|| format!("Unknown variable: {name}")),
        Expr::Attr(base, attr) => match eval(base, context)? {
            Value::Null => Ok(Value::Null),
            Value::Object(obj) => obj
                .get(attr)
                .cloned()
                .ok_or_else(|| format!("Object has no attribute '{attr}'")),
            other => Err(format!(
                "Object of type {} has no attribute '{attr}'",
                type_name(&other)
            )),
        },
        Expr::Neg(inner) => {
            let value = eval(inner, context)?;
            match number_of(&value) {
                Some(Num::Int(v)) => v
                    .checked_neg()
                    .map(Value::from)
                    .map_or_else(|| float_value(-(v as f64)), Ok),
                Some(Num::Float(v)) => float_value(-v),
                None => Err(format!("bad operand type for unary -: {}", type_name(&value))),
            }
        }
        Expr::Pos(inner) => {
            let value = eval(inner, context)?;
            match number_of(&value) {
                Some(Num::Int(v)) => Ok(Value::from(v)),
                Some(Num::Float(v)) => float_value(v),
                None => Err(format!("bad operand type for unary +: {}", type_name(&value))),
            }
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, context)?))),
        Expr::And(items) => {
            for item in items {
                if !truthy(&eval(item, context)?) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Expr::Or(items) => {
            for item in items {
                if truthy(&eval(item, context)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Compare(first, rest) => {
            let mut current = eval(first, context)?;
            for (op, operand) in rest {
                let right = eval(operand, context)?;
                if !compare(op, &current, &right)? {
                    return Ok(Value::Bool(false));
                }
                current = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, context)?;
            let right = eval(right, context)?;
            binary(op, &left, &right)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }
}

fn number_of(value: &Value) -> Option<Num> {
    match value {
        Value::Bool(flag) => Some(Num::Int(i64::from(*flag))),
        Value::Number(number) => number
            .as_i64()
            .map(Num::Int)
            .or_else(|| number.as_f64().map(Num::Float)),
        _ => None,
    }
}

fn float_value(value: f64) -> Result<Value, String> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| "numeric result is not finite".to_string())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(obj) => !obj.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> Result<bool, String> {
    if op == "==" || op == "!=" {
        let equal = match (number_of(left), number_of(right)) {
            (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
            _ => left == right,
        };
        return Ok(if op == "==" { equal } else { !equal });
    }

    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => match (number_of(left), number_of(right)) {
            (Some(a), Some(b)) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .ok_or_else(|| "comparison of non-finite numbers".to_string())?,
            _ => {
                return Err(format!(
                    "'{op}' not supported between {} and {}",
                    type_name(left),
                    type_name(right)
                ))
            }
        },
    };
    Ok(match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        ">=" => ordering.is_ge(),
        other => return Err(format!("Unsupported comparison operator: {other}")),
    })
}

fn binary(op: &str, left: &Value, right: &Value) -> Result<Value, String> {
    if op == "+" {
        match (left, right) {
            (Value::String(a), Value::String(b)) => return Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                let mut joined = a.clone();
                joined.extend(b.iter().cloned());
                return Ok(Value::Array(joined));
            }
            _ => {}
        }
    }

    let (Some(a), Some(b)) = (number_of(left), number_of(right)) else {
        return Err(format!(
            "Error in math operation: unsupported operand types for {op}: {} and {}",
            type_name(left),
            type_name(right)
        ));
    };

    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        let exact = match op {
            "+" => x.checked_add(y),
            "-" => x.checked_sub(y),
            "*" => x.checked_mul(y),
            "//" => {
                if y == 0 {
                    return Err("Division by zero".to_string());
                }
                x.checked_div(y).map(|q| {
                    if x % y != 0 && ((x < 0) != (y < 0)) {
                        q - 1
                    } else {
                        q
                    }
                })
            }
            "%" => {
                if y == 0 {
                    return Err("Division by zero".to_string());
                }
                x.checked_rem(y).map(|r| {
                    if r != 0 && ((r < 0) != (y < 0)) {
                        r + y
                    } else {
                        r
                    }
                })
            }
            "**" if y >= 0 => u32::try_from(y).ok().and_then(|exp| x.checked_pow(exp)),
            "**" if x == 0 => return Err("Division by zero".to_string()),
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Value::from(result));
        }
    }

    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" => {
            if y == 0.0 {
                return Err("Division by zero".to_string());
            }
            x / y
        }
        "//" => {
            if y == 0.0 {
                return Err("Division by zero".to_string());
            }
            (x / y).floor()
        }
        "%" => {
            if y == 0.0 {
                return Err("Division by zero".to_string());
            }
            x - y * (x / y).floor()
        }
        "**" => {
            if x == 0.0 && y < 0.0 {
                return Err("Division by zero".to_string());
            }
            x.powf(y)
        }
        other => return Err(format!("Unsupported binary operator: {other}")),
    };
    float_value(result).map_err(|err| format!("Error in math operation: {err}"))
}
