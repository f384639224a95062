/*!
  Constant expressions: the small expression tree that describes parameter defaults and other
  compile-time-only values. It has no statements and no variables. The encoder folds a tree to a
  plain literal when every leaf is known; anything that depends on the runtime (named constants,
  class constants, object construction) stays a tree and is stored as a constant-AST literal.
*/

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use string_cache::DefaultAtom;

use crate::value::{ArrayKey, Value};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AstBinaryOp {
  Add,
  Sub,
  Mul,
  Pow,
  Div,
  Mod,
  Sl,
  Sr,
  Concat,
  IsIdentical,
  IsNotIdentical,
  IsEqual,
  IsNotEqual,
  IsSmaller,
  IsSmallerOrEqual,
  Spaceship,
  BwOr,
  BwAnd,
  BwXor,
  BoolXor,
  BoolAnd,
  BoolOr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AstUnaryOp {
  Minus,
  Plus,
  BwNot,
  BoolNot,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArrayElement {
  Pair { key: Option<ConstExpr>, value: ConstExpr },
  Unpack(ConstExpr),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConstExpr {
  Literal(Value),
  Binary { op: AstBinaryOp, lhs: Box<ConstExpr>, rhs: Box<ConstExpr> },
  Unary { op: AstUnaryOp, arg: Box<ConstExpr> },
  /// A named constant, fully qualified unless the source left it unqualified.
  Constant(DefaultAtom),
  /// `__CLASS__`
  ConstantClass,
  /// `self::class`, or `parent::class` when `of_parent` is set.
  ClassName { of_parent: bool },
  /// `if_true` is absent for the short ternary `cond ?: if_false`.
  Conditional { condition: Box<ConstExpr>, if_true: Option<Box<ConstExpr>>, if_false: Box<ConstExpr> },
  Coalesce { value: Box<ConstExpr>, if_null: Box<ConstExpr> },
  Array(Vec<ArrayElement>),
  Dim { array: Box<ConstExpr>, dimension: Box<ConstExpr> },
  ClassConstant { class: DefaultAtom, name: DefaultAtom },
  New { class: DefaultAtom, args: Vec<ConstExpr> },
  Property { object: Box<ConstExpr>, property: Box<ConstExpr>, nullsafe: bool },
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Number {
  Long(i64),
  Double(f64),
}

impl Number {
  fn of(value: &Value) -> Option<Number> {
    match value {
      Value::Null => Some(Number::Long(0)),
      Value::Bool(b) => Some(Number::Long(*b as i64)),
      Value::Long(l) => Some(Number::Long(*l)),
      Value::Double(d) => Some(Number::Double(*d)),
      Value::String(s) => numeric_string(s),
      _ => None,
    }
  }

  fn as_f64(self) -> f64 {
    match self {
      Number::Long(l) => l as f64,
      Number::Double(d) => d,
    }
  }

  fn into_value(self) -> Value {
    match self {
      Number::Long(l) => Value::Long(l),
      Number::Double(d) => Value::Double(d),
    }
  }
}

/// Whole-string numeric literals only; leading or trailing garbage is a runtime error we don't fold.
fn numeric_string(s: &str) -> Option<Number> {
  let trimmed = s.trim();
  if trimmed.is_empty() {
    return None;
  }
  if let Ok(l) = trimmed.parse::<i64>() {
    return Some(Number::Long(l));
  }
  match trimmed.parse::<f64>() {
    Ok(d) if d.is_finite() => Some(Number::Double(d)),
    _ => None,
  }
}

/// Integer operands for bitwise and shift operators.
fn integer(value: &Value) -> Option<i64> {
  match value {
    Value::Null => Some(0),
    Value::Bool(b) => Some(*b as i64),
    Value::Long(l) => Some(*l),
    Value::Double(d) if d.is_finite() && d.fract() == 0.0 => Some(*d as i64),
    _ => None,
  }
}

fn arithmetic(op: AstBinaryOp, lhs: Number, rhs: Number) -> Option<Value> {
  use AstBinaryOp::*;

  if let (Number::Long(a), Number::Long(b)) = (lhs, rhs) {
    let exact = match op {
      Add => a.checked_add(b),
      Sub => a.checked_sub(b),
      Mul => a.checked_mul(b),
      Div if b == 0 => return None,
      Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
      Pow if b >= 0 => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
      _ => None,
    };
    if let Some(l) = exact {
      return Some(Value::Long(l));
    }
  }

  let (a, b) = (lhs.as_f64(), rhs.as_f64());
  let d = match op {
    Add => a + b,
    Sub => a - b,
    Mul => a * b,
    Div if b == 0.0 => return None,
    Div => a / b,
    Pow => a.powf(b),
    _ => return None,
  };
  Some(Value::Double(d))
}

/// Loose comparison. `None` means the ordering depends on rules we don't fold (arrays, objects).
fn loose_compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
  match (lhs, rhs) {
    (Value::Null, Value::String(s)) => Some("".cmp(s.as_str())),
    (Value::String(s), Value::Null) => Some(s.as_str().cmp("")),
    (Value::Null, _) | (_, Value::Null) | (Value::Bool(_), _) | (_, Value::Bool(_)) => {
      Some(lhs.truthy()?.cmp(&rhs.truthy()?))
    }
    (Value::String(a), Value::String(b)) => match (numeric_string(a), numeric_string(b)) {
      (Some(x), Some(y)) => x.as_f64().partial_cmp(&y.as_f64()),
      _ => Some(a.cmp(b)),
    },
    (Value::String(s), number) | (number, Value::String(s)) => {
      let flipped = matches!(lhs, Value::String(_));
      let ordering = match numeric_string(s) {
        Some(n) => Number::of(number)?.as_f64().partial_cmp(&n.as_f64())?,
        None => number.to_php_string()?.as_str().cmp(s.as_str()),
      };
      Some(if flipped { ordering.reverse() } else { ordering })
    }
    (Value::Long(_), _) | (Value::Double(_), _) => {
      Number::of(lhs)?.as_f64().partial_cmp(&Number::of(rhs)?.as_f64())
    }
    _ => None,
  }
}

fn fold_binary(op: AstBinaryOp, lhs: &Value, rhs: &Value) -> Option<Value> {
  use AstBinaryOp::*;

  match op {
    Add | Sub | Mul | Div | Pow => arithmetic(op, Number::of(lhs)?, Number::of(rhs)?),
    Mod => {
      let a = integer(lhs).or_else(|| Number::of(lhs).map(|n| n.as_f64() as i64))?;
      let b = integer(rhs).or_else(|| Number::of(rhs).map(|n| n.as_f64() as i64))?;
      if b == 0 {
        return None;
      }
      Some(Value::Long(a.wrapping_rem(b)))
    }
    Sl | Sr => {
      let (a, b) = (integer(lhs)?, integer(rhs)?);
      if b < 0 {
        return None;
      }
      let shifted = match (op, b >= 64) {
        (Sl, true) => 0,
        (Sl, false) => a.wrapping_shl(b as u32),
        (_, true) => if a < 0 { -1 } else { 0 },
        (_, false) => a >> b,
      };
      Some(Value::Long(shifted))
    }
    Concat => Some(Value::String(lhs.to_php_string()? + &rhs.to_php_string()?)),
    IsIdentical => Some(Value::Bool(lhs == rhs)),
    IsNotIdentical => Some(Value::Bool(lhs != rhs)),
    IsEqual => Some(Value::Bool(loose_compare(lhs, rhs)? == Ordering::Equal)),
    IsNotEqual => Some(Value::Bool(loose_compare(lhs, rhs)? != Ordering::Equal)),
    IsSmaller => Some(Value::Bool(loose_compare(lhs, rhs)? == Ordering::Less)),
    IsSmallerOrEqual => Some(Value::Bool(loose_compare(lhs, rhs)? != Ordering::Greater)),
    Spaceship => Some(Value::Long(loose_compare(lhs, rhs)? as i64)),
    BwOr => Some(Value::Long(integer(lhs)? | integer(rhs)?)),
    BwAnd => Some(Value::Long(integer(lhs)? & integer(rhs)?)),
    BwXor => Some(Value::Long(integer(lhs)? ^ integer(rhs)?)),
    BoolXor => Some(Value::Bool(lhs.truthy()? ^ rhs.truthy()?)),
    BoolAnd => Some(Value::Bool(lhs.truthy()? && rhs.truthy()?)),
    BoolOr => Some(Value::Bool(lhs.truthy()? || rhs.truthy()?)),
  }
}

fn fold_unary(op: AstUnaryOp, arg: &Value) -> Option<Value> {
  match op {
    AstUnaryOp::Minus => match Number::of(arg)? {
      Number::Long(l) => Some(
        l.checked_neg().map(Value::Long).unwrap_or(Value::Double(-(l as f64)))
      ),
      Number::Double(d) => Some(Value::Double(-d)),
    },
    AstUnaryOp::Plus => Some(Number::of(arg)?.into_value()),
    AstUnaryOp::BwNot => Some(Value::Long(!integer(arg)?)),
    AstUnaryOp::BoolNot => Some(Value::Bool(!arg.truthy()?)),
  }
}

impl ConstExpr {
  pub fn binary(op: AstBinaryOp, lhs: ConstExpr, rhs: ConstExpr) -> ConstExpr {
    ConstExpr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
  }

  pub fn unary(op: AstUnaryOp, arg: ConstExpr) -> ConstExpr {
    ConstExpr::Unary { op, arg: Box::new(arg) }
  }

  pub fn constant(name: &str) -> ConstExpr {
    ConstExpr::Constant(DefaultAtom::from(name))
  }

  /**
    Evaluates the expression if it depends on nothing outside itself. Returns `None` for any
    subtree that needs the runtime (constants, classes, objects) or that would raise an error or
    warning when evaluated (division by zero, missing array key, non-numeric operand).
  */
  pub fn fold(&self) -> Option<Value> {
    match self {
      ConstExpr::Literal(Value::Ast(_)) => None,
      ConstExpr::Literal(value) => Some(value.clone()),
      ConstExpr::Binary { op, lhs, rhs } => {
        // Short-circuiting operators fold on their left operand alone when it decides the result.
        match (op, lhs.fold()?.truthy()) {
          (AstBinaryOp::BoolAnd, Some(false)) => Some(Value::Bool(false)),
          (AstBinaryOp::BoolOr, Some(true)) => Some(Value::Bool(true)),
          _ => fold_binary(*op, &lhs.fold()?, &rhs.fold()?),
        }
      }
      ConstExpr::Unary { op, arg } => fold_unary(*op, &arg.fold()?),
      ConstExpr::Conditional { condition, if_true, if_false } => {
        let condition = condition.fold()?;
        match (condition.truthy()?, if_true) {
          (true, Some(if_true)) => if_true.fold(),
          (true, None) => Some(condition),
          (false, _) => if_false.fold(),
        }
      }
      ConstExpr::Coalesce { value, if_null } => match value.fold()? {
        Value::Null => if_null.fold(),
        value => Some(value),
      },
      ConstExpr::Array(elements) => fold_array(elements),
      ConstExpr::Dim { array, dimension } => {
        let key = ArrayKey::from_value(&dimension.fold()?)?;
        array.fold()?.get(&key).cloned()
      }
      ConstExpr::Constant(_)
      | ConstExpr::ConstantClass
      | ConstExpr::ClassName { .. }
      | ConstExpr::ClassConstant { .. }
      | ConstExpr::New { .. }
      | ConstExpr::Property { .. } => None,
    }
  }
}

fn fold_array(elements: &[ArrayElement]) -> Option<Value> {
  let mut folded: Vec<(ArrayKey, Value)> = Vec::with_capacity(elements.len());
  let mut next_index: i64 = 0;

  let mut put = |folded: &mut Vec<(ArrayKey, Value)>, key: Option<ArrayKey>, value: Value| -> Option<()> {
    let key = match key {
      Some(key) => key,
      None => {
        let key = ArrayKey::Long(next_index);
        next_index = next_index.checked_add(1)?;
        key
      }
    };
    if let ArrayKey::Long(l) = key {
      if l >= next_index {
        next_index = l.checked_add(1)?;
      }
    }
    match folded.iter_mut().find(|(k, _)| *k == key) {
      Some(slot) => slot.1 = value,
      None => folded.push((key, value)),
    }
    Some(())
  };

  for element in elements {
    match element {
      ArrayElement::Pair { key, value } => {
        let key = match key {
          Some(key) => Some(ArrayKey::from_value(&key.fold()?)?),
          None => None,
        };
        put(&mut folded, key, value.fold()?)?;
      }
      ArrayElement::Unpack(array) => match array.fold()? {
        Value::Array(inner) => {
          for (key, value) in inner {
            match key {
              ArrayKey::Long(_) => put(&mut folded, None, value)?,
              key => put(&mut folded, Some(key), value)?,
            }
          }
        }
        _ => return None,
      },
    }
  }
  Some(Value::Array(folded))
}

impl AstBinaryOp {
  pub fn symbol(&self) -> &'static str {
    use AstBinaryOp::*;
    match self {
      Add => "+",
      Sub => "-",
      Mul => "*",
      Pow => "**",
      Div => "/",
      Mod => "%",
      Sl => "<<",
      Sr => ">>",
      Concat => ".",
      IsIdentical => "===",
      IsNotIdentical => "!==",
      IsEqual => "==",
      IsNotEqual => "!=",
      IsSmaller => "<",
      IsSmallerOrEqual => "<=",
      Spaceship => "<=>",
      BwOr => "|",
      BwAnd => "&",
      BwXor => "^",
      BoolXor => "xor",
      BoolAnd => "&&",
      BoolOr => "||",
    }
  }
}

impl AstUnaryOp {
  pub fn symbol(&self) -> &'static str {
    match self {
      AstUnaryOp::Minus => "-",
      AstUnaryOp::Plus => "+",
      AstUnaryOp::BwNot => "~",
      AstUnaryOp::BoolNot => "!",
    }
  }
}

// region Display

impl Display for ArrayElement {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ArrayElement::Pair { key: Some(key), value } => write!(f, "{} => {}", key, value),
      ArrayElement::Pair { key: None, value } => write!(f, "{}", value),
      ArrayElement::Unpack(array) => write!(f, "...{}", array),
    }
  }
}

/// Source-like rendering, fully parenthesized. The assembly parser reads it back inside `const(..)`.
impl Display for ConstExpr {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ConstExpr::Literal(value) => write!(f, "{}", value),
      ConstExpr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
      ConstExpr::Unary { op, arg } => write!(f, "{}({})", op.symbol(), arg),
      ConstExpr::Constant(name) => write!(f, "{}", name),
      ConstExpr::ConstantClass => write!(f, "__CLASS__"),
      ConstExpr::ClassName { of_parent: false } => write!(f, "self::class"),
      ConstExpr::ClassName { of_parent: true } => write!(f, "parent::class"),
      ConstExpr::Conditional { condition, if_true: Some(if_true), if_false } => {
        write!(f, "({} ? {} : {})", condition, if_true, if_false)
      }
      ConstExpr::Conditional { condition, if_true: None, if_false } => {
        write!(f, "({} ?: {})", condition, if_false)
      }
      ConstExpr::Coalesce { value, if_null } => write!(f, "({} ?? {})", value, if_null),
      ConstExpr::Array(elements) => {
        let rendered: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
        write!(f, "array({})", rendered.join(", "))
      }
      ConstExpr::Dim { array, dimension } => write!(f, "{}[{}]", array, dimension),
      ConstExpr::ClassConstant { class, name } => write!(f, "{}::{}", class, name),
      ConstExpr::New { class, args } => {
        let rendered: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        write!(f, "new {}({})", class, rendered.join(", "))
      }
      ConstExpr::Property { object, property, nullsafe } => {
        write!(f, "{}{}{}", object, if *nullsafe { "?->" } else { "->" }, property)
      }
    }
  }
}

// endregion
