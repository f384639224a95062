//! Literal values, as they appear in a function's literal pool and in the IR's constant operands.

use std::fmt::{Display, Formatter};

use crate::ir::ConstExpr;

/// A key of an array literal. Numeric strings are normalized to integer keys on construction.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ArrayKey {
  Long(i64),
  String(String),
}

/**
  An immediate literal. `Ast` is the VM's "constant expression" literal: a default value or
  similar compile-time expression that could not be reduced to a plain value and is evaluated
  by the VM on first use.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
  Null,
  Bool(bool),
  Long(i64),
  Double(f64),
  String(String),
  Array(Vec<(ArrayKey, Value)>),
  Ast(Box<ConstExpr>),
}

impl Value {
  pub fn string<S: Into<String>>(text: S) -> Value {
    Value::String(text.into())
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s.as_str()),
      _ => None,
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// Truthiness of a plain value. Constant ASTs have none until evaluated.
  pub fn truthy(&self) -> Option<bool> {
    match self {
      Value::Null => Some(false),
      Value::Bool(b) => Some(*b),
      Value::Long(l) => Some(*l != 0),
      Value::Double(d) => Some(*d != 0.0),
      Value::String(s) => Some(!(s.is_empty() || s == "0")),
      Value::Array(elements) => Some(!elements.is_empty()),
      Value::Ast(_) => None,
    }
  }

  /// String conversion for concatenation. Returns `None` where the conversion is not a plain,
  /// locale-independent rendering (arrays, large or non-finite floats, ASTs).
  pub fn to_php_string(&self) -> Option<String> {
    match self {
      Value::Null => Some(String::new()),
      Value::Bool(true) => Some("1".to_string()),
      Value::Bool(false) => Some(String::new()),
      Value::Long(l) => Some(l.to_string()),
      Value::Double(d) if d.is_finite() => Some(double_to_string(*d)),
      Value::Double(_) => None,
      Value::String(s) => Some(s.clone()),
      Value::Array(_) | Value::Ast(_) => None,
    }
  }

  /// Looks up `key` in an array value.
  pub fn get(&self, key: &ArrayKey) -> Option<&Value> {
    match self {
      Value::Array(elements) => elements.iter().find(|(k, _)| k == key).map(|(_, v)| v),
      _ => None,
    }
  }
}

/// Significant digits of the VM's float to string conversion.
const DOUBLE_PRECISION: usize = 14;

/**
  Renders a finite float the way the VM converts it to a string: 14 significant digits with
  trailing zeros removed, in positional notation when the decimal exponent lies in `-4..14` and
  as `1.5E+20` otherwise. A lone exponent digit keeps a `.0`, and negative zero keeps its sign.
*/
fn double_to_string(d: f64) -> String {
  let sign = if d.is_sign_negative() { "-" } else { "" };
  if d == 0.0 {
    return format!("{}0", sign);
  }

  // `{:e}` rounds to the requested number of digits after the leading one.
  let scientific = format!("{:.*e}", DOUBLE_PRECISION - 1, d.abs());
  let (mantissa, exponent) = match scientific.split_once('e') {
    Some(parts) => parts,
    None => return scientific,
  };
  let exponent: i32 = exponent.parse().unwrap_or(0);
  let digits: String = mantissa.chars().filter(|c| c.is_ascii_digit()).collect();
  let digits = digits.trim_end_matches('0');
  let digits = if digits.is_empty() { "0" } else { digits };

  if exponent < -4 || exponent >= DOUBLE_PRECISION as i32 {
    let (first, rest) = digits.split_at(1);
    let rest = if rest.is_empty() { "0" } else { rest };
    let exponent_sign = if exponent < 0 { '-' } else { '+' };
    format!("{}{}.{}E{}{}", sign, first, rest, exponent_sign, exponent.abs())
  } else if exponent < 0 {
    format!("{}0.{}{}", sign, "0".repeat((-exponent - 1) as usize), digits)
  } else {
    let integral = exponent as usize + 1;
    if digits.len() <= integral {
      format!("{}{}{}", sign, digits, "0".repeat(integral - digits.len()))
    } else {
      format!("{}{}.{}", sign, &digits[..integral], &digits[integral..])
    }
  }
}

impl ArrayKey {
  /// Normalizes a value used as an array key the way the VM does. Arrays and ASTs are not keys.
  pub fn from_value(value: &Value) -> Option<ArrayKey> {
    match value {
      Value::Null => Some(ArrayKey::String(String::new())),
      Value::Bool(b) => Some(ArrayKey::Long(*b as i64)),
      Value::Long(l) => Some(ArrayKey::Long(*l)),
      Value::Double(d) if d.is_finite() => Some(ArrayKey::Long(d.trunc() as i64)),
      Value::String(s) => Some(ArrayKey::from_string(s)),
      _ => None,
    }
  }

  /// Canonical decimal integer strings become integer keys.
  pub fn from_string(s: &str) -> ArrayKey {
    match s.parse::<i64>() {
      Ok(l) if l.to_string() == s => ArrayKey::Long(l),
      _ => ArrayKey::String(s.to_string()),
    }
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<i64> for Value {
  fn from(l: i64) -> Self {
    Value::Long(l)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::String(s.to_string())
  }
}

impl Display for ArrayKey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ArrayKey::Long(l) => write!(f, "{}", l),
      ArrayKey::String(s) => write!(f, "{:?}", s),
    }
  }
}

/// Renders the value in the assembly's literal syntax, which the assembly parser reads back.
impl Display for Value {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Value::Null => write!(f, "null"),
      Value::Bool(b) => write!(f, "{}", b),
      Value::Long(l) => write!(f, "{}", l),
      Value::Double(d) => write!(f, "{:?}", d),
      Value::String(s) => write!(f, "{:?}", s),
      Value::Array(elements) => {
        write!(f, "[")?;
        for (i, (key, value)) in elements.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{} => {}", key, value)?;
        }
        write!(f, "]")
      }
      Value::Ast(expr) => write!(f, "const({})", expr),
    }
  }
}
