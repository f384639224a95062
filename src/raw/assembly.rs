/*!
  The human readable textual form of op arrays is called assembly. This module leverages the
  `strum` derives of `RawOpcode` to read and write op mnemonics, and nom for the rest.

  ```text
  .function Greeter::greet      % or just a name for a free function
  .flags generator              % generator returns_ref static uses_this
  .vars name greeting
  .temps 2
  .arg name
  .try 3 7                      % try_op catch_op [finally_op finally_end]
  .closure {closure}            % names indexed by DECLARE_LAMBDA_FUNCTION
    2: RECV #1 -> CV0
    3: CONCAT "Hello, ", CV0 -> T0
    3: ASSIGN CV1, T0
    4: RETURN CV1
  ```

  Operands are `_` (unused), `#n` (unused, carrying `n`), `CVn`, `Tn`, `Vn`, or an inline
  literal: `null`, `true`, `false`, numbers, double-quoted strings, arrays like
  `[1, "k" => 2]`, and `const(EXPR)` for a constant-expression AST written the way it displays,
  as in `const((A . "x"))` or `const(array(1, ...B))`. The leading `line:` is optional and
  defaults to the line of the assembly text.
*/

use std::str::FromStr;

use nom::{
  branch::alt,
  bytes::complete::{is_not, tag, take_while, take_while1},
  character::complete::{char as one_char, digit1, hex_digit1, one_of, satisfy, space0, space1},
  combinator::{all_consuming, map, map_opt, map_res, not, opt, recognize, rest, value},
  multi::{many0, separated_list0},
  sequence::{delimited, pair, preceded, terminated, tuple},
  IResult,
};
use string_cache::DefaultAtom;

use super::{
  ArgInfo, RawFunction, RawOp, RawOpcode, RawOperand, TryCatchElement,
  ACC_GENERATOR, ACC_RETURN_REFERENCE, ACC_STATIC, ACC_USES_THIS,
};
use crate::error::AssemblyError;
use crate::ir::{ArrayElement, AstBinaryOp, AstUnaryOp, ConstExpr};
use crate::value::{ArrayKey, Value};

const FLAG_NAMES: [(&str, u32); 4] = [
  ("generator", ACC_GENERATOR),
  ("returns_ref", ACC_RETURN_REFERENCE),
  ("static", ACC_STATIC),
  ("uses_this", ACC_USES_THIS),
];

#[derive(Clone, Debug, PartialEq)]
enum ParsedOperand {
  Slot(RawOperand),
  Literal(Value),
}

struct ParsedOp<'a> {
  line      : Option<u32>,
  mnemonic  : &'a str,
  operands  : Vec<ParsedOperand>,
  result    : Option<ParsedOperand>,
  extended  : Option<u32>,
}

enum Line<'a> {
  Directive(&'a str, Vec<&'a str>),
  Op(ParsedOp<'a>),
}

// region Literal parsers

fn number(input: &str) -> IResult<&str, u32> {
  map_res(digit1, u32::from_str)(input)
}

fn string_literal(input: &str) -> IResult<&str, String> {
  alt((
    value(String::new(), tag("\"\"")),
    delimited(
      one_char('"'),
      nom::bytes::complete::escaped_transform(
        is_not("\\\""),
        '\\',
        alt((
          value('\\', one_char('\\')),
          value('"', one_char('"')),
          value('\'', one_char('\'')),
          value('\n', one_char('n')),
          value('\r', one_char('r')),
          value('\t', one_char('t')),
          value('\0', one_char('0')),
          map_opt(
            delimited(tag("u{"), hex_digit1, one_char('}')),
            |hex: &str| u32::from_str_radix(hex, 16).ok().and_then(char::from_u32),
          ),
        )),
      ),
      one_char('"'),
    ),
  ))(input)
}

fn numeric_literal(input: &str) -> IResult<&str, Value> {
  map_res(
    recognize(tuple((
      opt(one_char('-')),
      digit1,
      opt(pair(one_char('.'), digit1)),
      opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    ))),
    |text: &str| -> Result<Value, std::num::ParseFloatError> {
      if text.contains(|c: char| c == '.' || c == 'e' || c == 'E') {
        text.parse::<f64>().map(Value::Double)
      } else {
        // Integers too wide for i64 are floats, as in the source language.
        match text.parse::<i64>() {
          Ok(l) => Ok(Value::Long(l)),
          Err(_) => text.parse::<f64>().map(Value::Double),
        }
      }
    },
  )(input)
}

fn is_name_char(c: char) -> bool {
  c.is_alphanumeric() || c == '_' || c == '\\'
}

/// A constant, class or member name, possibly qualified with backslashes.
fn name(input: &str) -> IResult<&str, &str> {
  recognize(pair(satisfy(|c| c.is_alphabetic() || c == '_' || c == '\\'), take_while(is_name_char)))(input)
}

/// A keyword that is not the prefix of a longer name.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
  terminated(tag(word), not(satisfy(is_name_char)))
}

fn array_literal(input: &str) -> IResult<&str, Value> {
  let element = pair(literal, opt(preceded(delimited(space0, tag("=>"), space0), literal)));
  map_opt(
    delimited(
      pair(one_char('['), space0),
      separated_list0(delimited(space0, one_char(','), space0), element),
      pair(space0, one_char(']')),
    ),
    |elements: Vec<(Value, Option<Value>)>| {
      let mut array: Vec<(ArrayKey, Value)> = Vec::with_capacity(elements.len());
      let mut next_index = 0i64;
      for (first, second) in elements {
        let (key, element) = match second {
          Some(element) => (ArrayKey::from_value(&first)?, element),
          None => (ArrayKey::Long(next_index), first),
        };
        if let ArrayKey::Long(l) = key {
          next_index = next_index.max(l.checked_add(1)?);
        }
        match array.iter_mut().find(|(k, _)| *k == key) {
          Some(slot) => slot.1 = element,
          None => array.push((key, element)),
        }
      }
      Some(Value::Array(array))
    },
  )(input)
}

fn literal(input: &str) -> IResult<&str, Value> {
  alt((
    value(Value::Null, keyword("null")),
    value(Value::Bool(true), keyword("true")),
    value(Value::Bool(false), keyword("false")),
    map(delimited(tag("const("), const_expr, one_char(')')), |expr| Value::Ast(Box::new(expr))),
    map(string_literal, Value::String),
    numeric_literal,
    array_literal,
  ))(input)
}

// endregion

// region Constant expression parsers

// Constant expressions are written the way `ConstExpr` displays them: binary operators and
// ternaries fully parenthesized with single spaces, unary operators applied to a parenthesized
// operand, `array(..)` for array expressions.

fn binary_symbol(input: &str) -> IResult<&str, AstBinaryOp> {
  use AstBinaryOp::*;
  alt((
    alt((
      value(IsIdentical, tag("===")),
      value(IsNotIdentical, tag("!==")),
      value(Spaceship, tag("<=>")),
      value(Pow, tag("**")),
      value(Sl, tag("<<")),
      value(Sr, tag(">>")),
      value(IsSmallerOrEqual, tag("<=")),
      value(IsEqual, tag("==")),
      value(IsNotEqual, tag("!=")),
      value(BoolAnd, tag("&&")),
      value(BoolOr, tag("||")),
      value(BoolXor, tag("xor")),
    )),
    alt((
      value(Add, one_char('+')),
      value(Sub, one_char('-')),
      value(Mul, one_char('*')),
      value(Div, one_char('/')),
      value(Mod, one_char('%')),
      value(Concat, one_char('.')),
      value(IsSmaller, one_char('<')),
      value(BwOr, one_char('|')),
      value(BwAnd, one_char('&')),
      value(BwXor, one_char('^')),
    )),
  ))(input)
}

fn unary_symbol(input: &str) -> IResult<&str, AstUnaryOp> {
  alt((
    value(AstUnaryOp::Minus, one_char('-')),
    value(AstUnaryOp::Plus, one_char('+')),
    value(AstUnaryOp::BwNot, one_char('~')),
    value(AstUnaryOp::BoolNot, one_char('!')),
  ))(input)
}

fn const_arguments(input: &str) -> IResult<&str, Vec<ConstExpr>> {
  delimited(one_char('('), separated_list0(tag(", "), const_expr), one_char(')'))(input)
}

fn array_element(input: &str) -> IResult<&str, ArrayElement> {
  alt((
    map(preceded(tag("..."), const_expr), ArrayElement::Unpack),
    map(pair(const_expr, opt(preceded(tag(" => "), const_expr))), |(first, second)| match second {
      Some(value) => ArrayElement::Pair { key: Some(first), value },
      None => ArrayElement::Pair { key: None, value: first },
    }),
  ))(input)
}

/// `(lhs op rhs)`, `(cond ? a : b)`, `(cond ?: b)` and `(value ?? default)`.
fn const_parenthesized(input: &str) -> IResult<&str, ConstExpr> {
  let (input, first) = preceded(one_char('('), const_expr)(input)?;
  let boxed = || Box::new(first.clone());
  let (input, expr) = alt((
    map(preceded(tag(" ?? "), const_expr), |if_null| ConstExpr::Coalesce { value: boxed(), if_null: Box::new(if_null) }),
    map(preceded(tag(" ?: "), const_expr), |if_false| ConstExpr::Conditional {
      condition : boxed(),
      if_true   : None,
      if_false  : Box::new(if_false),
    }),
    map(tuple((tag(" ? "), const_expr, tag(" : "), const_expr)), |(_, if_true, _, if_false)| {
      ConstExpr::Conditional { condition: boxed(), if_true: Some(Box::new(if_true)), if_false: Box::new(if_false) }
    }),
    map(pair(delimited(one_char(' '), binary_symbol, one_char(' ')), const_expr), |(op, rhs)| {
      ConstExpr::Binary { op, lhs: boxed(), rhs: Box::new(rhs) }
    }),
  ))(input)?;
  let (input, _) = one_char(')')(input)?;
  Ok((input, expr))
}

/// Names: constants, class constants, `self::class`, `parent::class` and `__CLASS__`.
fn const_named(input: &str) -> IResult<&str, ConstExpr> {
  let (input, first) = name(input)?;
  let (input, member) = opt(preceded(tag("::"), name))(input)?;
  let expr = match (first, member) {
    ("self", Some("class")) => ConstExpr::ClassName { of_parent: false },
    ("parent", Some("class")) => ConstExpr::ClassName { of_parent: true },
    (class, Some(member)) => ConstExpr::ClassConstant { class: class.into(), name: member.into() },
    ("__CLASS__", None) => ConstExpr::ConstantClass,
    (constant, None) => ConstExpr::Constant(constant.into()),
  };
  Ok((input, expr))
}

fn const_primary(input: &str) -> IResult<&str, ConstExpr> {
  alt((
    const_parenthesized,
    map(preceded(tag("new "), pair(name, const_arguments)), |(class, args)| ConstExpr::New { class: class.into(), args }),
    map(
      delimited(tag("array("), separated_list0(tag(", "), array_element), one_char(')')),
      ConstExpr::Array,
    ),
    map(pair(unary_symbol, delimited(one_char('('), const_expr, one_char(')'))), |(op, arg)| {
      ConstExpr::Unary { op, arg: Box::new(arg) }
    }),
    map(literal, ConstExpr::Literal),
    const_named,
  ))(input)
}

/// A primary followed by any number of `[dimension]`, `->property` and `?->property` suffixes.
fn const_expr(input: &str) -> IResult<&str, ConstExpr> {
  let (mut input, mut expr) = const_primary(input)?;
  loop {
    if let Ok((rest, dimension)) = delimited(one_char('['), const_expr, one_char(']'))(input) {
      expr = ConstExpr::Dim { array: Box::new(expr), dimension: Box::new(dimension) };
      input = rest;
    } else if let Ok((rest, (nullsafe, property))) =
      pair(alt((value(true, tag("?->")), value(false, tag("->")))), const_primary)(input)
    {
      expr = ConstExpr::Property { object: Box::new(expr), property: Box::new(property), nullsafe };
      input = rest;
    } else {
      return Ok((input, expr));
    }
  }
}

// endregion

fn operand(input: &str) -> IResult<&str, ParsedOperand> {
  alt((
    map(preceded(tag("CV"), number), |n| ParsedOperand::Slot(RawOperand::Cv(n))),
    map(preceded(one_char('T'), number), |n| ParsedOperand::Slot(RawOperand::Tmp(n))),
    map(preceded(one_char('V'), number), |n| ParsedOperand::Slot(RawOperand::Var(n))),
    map(preceded(one_char('#'), number), |n| ParsedOperand::Slot(RawOperand::Unused(n))),
    value(ParsedOperand::Slot(RawOperand::Unused(0)), one_char('_')),
    map(literal, ParsedOperand::Literal),
  ))(input)
}

fn instruction(input: &str) -> IResult<&str, ParsedOp> {
  map(
    tuple((
      opt(terminated(number, pair(one_char(':'), space0))),
      take_while1(|c: char| c.is_ascii_uppercase() || c == '_'),
      opt(preceded(space1, separated_list0(delimited(space0, one_char(','), space0), operand))),
      opt(preceded(delimited(space0, tag("->"), space0), operand)),
      opt(preceded(pair(space0, tag("ext=")), number)),
    )),
    |(line, mnemonic, operands, result, extended)| ParsedOp {
      line,
      mnemonic,
      operands: operands.unwrap_or_default(),
      result,
      extended,
    },
  )(input)
}

fn directive(input: &str) -> IResult<&str, (&str, Vec<&str>)> {
  preceded(
    one_char('.'),
    pair(
      take_while1(|c: char| c.is_ascii_alphabetic()),
      many0(preceded(space1, take_while1(|c: char| !c.is_whitespace() && c != '%'))),
    ),
  )(input)
}

fn line(input: &str) -> IResult<&str, Line> {
  all_consuming(delimited(
    space0,
    alt((
      map(directive, |(name, args)| Line::Directive(name, args)),
      map(instruction, Line::Op),
    )),
    pair(space0, opt(preceded(one_char('%'), rest))),
  ))(input)
}

fn directive_error(line: usize, message: &str) -> AssemblyError {
  AssemblyError::Directive { line, message: message.to_string() }
}

fn parse_number_arg(line: usize, arg: Option<&&str>) -> Result<u32, AssemblyError> {
  arg
    .and_then(|text| text.parse::<u32>().ok())
    .ok_or_else(|| directive_error(line, "expected a number"))
}

fn apply_directive(
  function: &mut RawFunction,
  explicit_required: &mut bool,
  line: usize,
  name: &str,
  args: &[&str],
) -> Result<(), AssemblyError> {
  match name {
    "scope" => {
      let scope = args.first().ok_or_else(|| directive_error(line, "expected a class name"))?;
      function.scope = Some(DefaultAtom::from(*scope));
    }
    "flags" => {
      for flag in args {
        let (_, bit) = FLAG_NAMES
          .iter()
          .find(|(flag_name, _)| flag_name == flag)
          .ok_or_else(|| directive_error(line, &format!("unknown flag {}", flag)))?;
        function.flags |= bit;
      }
    }
    "vars" => {
      function.vars = args.iter().map(|v| DefaultAtom::from(v.trim_start_matches('$'))).collect();
    }
    "temps" => function.num_temps = parse_number_arg(line, args.first())?,
    "required" => {
      function.required_num_args = parse_number_arg(line, args.first())?;
      *explicit_required = true;
    }
    "arg" => {
      let arg_name = args.first().ok_or_else(|| directive_error(line, "expected a parameter name"))?;
      function.arg_info.push(ArgInfo {
        name     : DefaultAtom::from(arg_name.trim_start_matches('$')),
        by_ref   : args[1..].contains(&"ref"),
        variadic : args[1..].contains(&"variadic"),
      });
    }
    "closure" => {
      let closure = args.first().ok_or_else(|| directive_error(line, "expected a closure name"))?;
      function.closures.push(DefaultAtom::from(*closure));
    }
    "try" => {
      if args.len() != 2 && args.len() != 4 {
        return Err(directive_error(line, ".try takes 2 or 4 op indices"));
      }
      let mut numbers = Vec::with_capacity(4);
      for arg in args {
        numbers.push(parse_number_arg(line, Some(arg))?);
      }
      function.try_catch.push(TryCatchElement {
        try_op      : numbers[0],
        catch_op    : numbers[1],
        finally_op  : numbers.get(2).copied().unwrap_or(0),
        finally_end : numbers.get(3).copied().unwrap_or(0),
      });
    }
    _ => return Err(directive_error(line, &format!("unknown directive .{}", name))),
  }
  Ok(())
}

fn resolve_operand(function: &mut RawFunction, operand: Option<&ParsedOperand>) -> RawOperand {
  match operand {
    None => RawOperand::default(),
    Some(ParsedOperand::Slot(slot)) => *slot,
    Some(ParsedOperand::Literal(value)) => RawOperand::Const(function.add_literal(value.clone())),
  }
}

fn finish(function: &mut RawFunction, explicit_required: bool) {
  if !explicit_required {
    function.required_num_args =
      function.opcodes.iter().filter(|op| op.opcode == RawOpcode::Recv).count() as u32;
  }
}

/// Parses assembly text into the op arrays it defines, in order.
pub fn parse_assembly(text: &str) -> Result<Vec<RawFunction>, AssemblyError> {
  let mut functions: Vec<RawFunction> = Vec::new();
  let mut explicit_required = false;

  for (index, text_line) in text.lines().enumerate() {
    let line_number = index + 1;
    let trimmed = text_line.trim();
    if trimmed.is_empty() || trimmed.starts_with('%') {
      continue;
    }

    let parsed = match line(text_line) {
      Ok((_, parsed)) => parsed,
      Err(_) => return Err(AssemblyError::Syntax { line: line_number, text: trimmed.to_string() }),
    };

    match parsed {
      Line::Directive("function", args) => {
        if let Some(previous) = functions.last_mut() {
          finish(previous, explicit_required);
        }
        explicit_required = false;
        let full_name = args.first().ok_or_else(|| directive_error(line_number, "expected a name"))?;
        let function = match full_name.rsplit_once("::") {
          Some((scope, name)) => {
            let mut function = RawFunction::new(name);
            function.scope = Some(DefaultAtom::from(scope));
            function
          }
          None => RawFunction::new(full_name),
        };
        functions.push(function);
      }
      Line::Directive(name, args) => {
        let function = functions.last_mut().ok_or(AssemblyError::NoFunction { line: line_number })?;
        apply_directive(function, &mut explicit_required, line_number, name, &args)?;
      }
      Line::Op(parsed_op) => {
        let function = functions.last_mut().ok_or(AssemblyError::NoFunction { line: line_number })?;
        let opcode = RawOpcode::from_str(parsed_op.mnemonic).map_err(|_| {
          AssemblyError::NotAnOperation { line: line_number, name: parsed_op.mnemonic.to_string() }
        })?;
        if parsed_op.operands.len() > 2 {
          return Err(AssemblyError::Syntax { line: line_number, text: trimmed.to_string() });
        }
        let op1 = resolve_operand(function, parsed_op.operands.get(0));
        let op2 = resolve_operand(function, parsed_op.operands.get(1));
        let result = resolve_operand(function, parsed_op.result.as_ref());
        function.opcodes.push(
          RawOp::new(opcode, parsed_op.line.unwrap_or(line_number as u32))
            .with_op1(op1)
            .with_op2(op2)
            .with_result(result)
            .with_extended_value(parsed_op.extended.unwrap_or(0)),
        );
      }
    }
  }

  if let Some(last) = functions.last_mut() {
    finish(last, explicit_required);
  }
  Ok(functions)
}

fn print_operand(function: &RawFunction, operand: &RawOperand) -> String {
  match operand {
    RawOperand::Const(index) => match function.literal(*index) {
      Some(value) => value.to_string(),
      None => operand.to_string(),
    },
    _ => operand.to_string(),
  }
}

/// Writes the op array in the syntax `parse_assembly` reads.
pub fn print_assembly(function: &RawFunction) -> String {
  let mut out = String::new();

  out.push_str(&format!(".function {}\n", function.qualified_name()));
  let flags: Vec<&str> = FLAG_NAMES
    .iter()
    .filter(|(_, bit)| function.has_flag(*bit))
    .map(|(name, _)| *name)
    .collect();
  if !flags.is_empty() {
    out.push_str(&format!(".flags {}\n", flags.join(" ")));
  }
  if !function.vars.is_empty() {
    let vars: Vec<&str> = function.vars.iter().map(|v| v.as_ref()).collect();
    out.push_str(&format!(".vars {}\n", vars.join(" ")));
  }
  out.push_str(&format!(".temps {}\n", function.num_temps));
  for arg in &function.arg_info {
    out.push_str(&format!(
      ".arg {}{}{}\n",
      arg.name,
      if arg.by_ref { " ref" } else { "" },
      if arg.variadic { " variadic" } else { "" }
    ));
  }
  out.push_str(&format!(".required {}\n", function.required_num_args));
  for closure in &function.closures {
    out.push_str(&format!(".closure {}\n", closure));
  }
  for element in &function.try_catch {
    if element.finally_op == 0 && element.finally_end == 0 {
      out.push_str(&format!(".try {} {}\n", element.try_op, element.catch_op));
    } else {
      out.push_str(&format!(
        ".try {} {} {} {}\n",
        element.try_op, element.catch_op, element.finally_op, element.finally_end
      ));
    }
  }

  for op in &function.opcodes {
    out.push_str(&format!("  {}: {}", op.lineno, op.opcode));
    let op1 = print_operand(function, &op.op1);
    let op2 = print_operand(function, &op.op2);
    match (op.op1, op.op2) {
      (RawOperand::Unused(0), RawOperand::Unused(0)) => {}
      (_, RawOperand::Unused(0)) => out.push_str(&format!(" {}", op1)),
      _ => out.push_str(&format!(" {}, {}", op1, op2)),
    }
    if op.result != RawOperand::Unused(0) {
      out.push_str(&format!(" -> {}", print_operand(function, &op.result)));
    }
    if op.extended_value != 0 {
      out.push_str(&format!(" ext={}", op.extended_value));
    }
    out.push('\n');
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  const GREET: &str = r#"
.function Greeter::greet
.vars name greeting
.temps 1
.arg name
  2: RECV #1 -> CV0
  3: CONCAT "Hello, \"", CV0 -> T0   % string with an escape
  3: ASSIGN CV1, T0
     RETURN CV1
"#;

  #[test]
  fn test_parse_function() {
    let functions = parse_assembly(GREET).unwrap();
    assert_eq!(functions.len(), 1);
    let greet = &functions[0];
    assert_eq!(greet.qualified_name(), "Greeter::greet");
    assert_eq!(greet.vars.len(), 2);
    assert_eq!(greet.required_num_args, 1);
    assert_eq!(greet.opcodes.len(), 4);
    assert_eq!(greet.opcodes[1].op1, RawOperand::Const(0));
    assert_eq!(greet.literals[0], Value::string("Hello, \""));
    assert_eq!(greet.opcodes[1].result, RawOperand::Tmp(0));
    // No explicit line: the assembly text line is used.
    assert_eq!(greet.opcodes[3].lineno, 9);
  }

  #[test]
  fn test_literals() {
    let text = ".function f\n  RETURN [1, \"k\" => -2.5, 7 => null, false]\n  ECHO const(PHP_EOL)\n";
    let functions = parse_assembly(text).unwrap();
    assert_eq!(
      functions[0].literals[0],
      Value::Array(vec![
        (ArrayKey::Long(0), Value::Long(1)),
        (ArrayKey::String("k".to_string()), Value::Double(-2.5)),
        (ArrayKey::Long(7), Value::Null),
        (ArrayKey::Long(8), Value::Bool(false)),
      ])
    );
    assert_eq!(
      functions[0].literals[1],
      Value::Ast(Box::new(ConstExpr::Constant(DefaultAtom::from("PHP_EOL"))))
    );
  }

  #[test]
  fn test_errors_carry_line_numbers() {
    let text = ".function f\n  RETURN CV0\n  FROBNICATE T1\n";
    assert_eq!(
      parse_assembly(text),
      Err(AssemblyError::NotAnOperation { line: 3, name: "FROBNICATE".to_string() })
    );
    assert_eq!(parse_assembly("  RETURN null\n"), Err(AssemblyError::NoFunction { line: 1 }));
    assert!(matches!(parse_assembly(".function f\n  RETURN @@\n"), Err(AssemblyError::Syntax { line: 2, .. })));
  }

  #[test]
  fn test_constant_expressions_reparse() {
    use AstBinaryOp::{Add, Concat};

    let constant = ConstExpr::constant;
    let literal = |value: Value| ConstExpr::Literal(value);
    let expressions = vec![
      ConstExpr::binary(Concat, constant("A"), literal(Value::string("x"))),
      ConstExpr::binary(Add, literal(Value::Long(-1)), ConstExpr::unary(AstUnaryOp::Minus, literal(Value::Long(1)))),
      ConstExpr::Conditional {
        condition : Box::new(constant("\\NS\\DEBUG")),
        if_true   : None,
        if_false  : Box::new(literal(Value::Double(0.5))),
      },
      ConstExpr::Conditional {
        condition : Box::new(ConstExpr::unary(AstUnaryOp::BoolNot, constant("nullable"))),
        if_true   : Some(Box::new(ConstExpr::ConstantClass)),
        if_false  : Box::new(ConstExpr::ClassName { of_parent: true }),
      },
      ConstExpr::Coalesce {
        value   : Box::new(ConstExpr::Dim {
          array     : Box::new(ConstExpr::ClassConstant { class: "Config".into(), name: "MAP".into() }),
          dimension : Box::new(literal(Value::string("k"))),
        }),
        if_null : Box::new(literal(Value::Null)),
      },
      ConstExpr::Array(vec![
        ArrayElement::Pair { key: None, value: literal(Value::Long(1)) },
        ArrayElement::Pair { key: Some(literal(Value::string("a"))), value: constant("B") },
        ArrayElement::Unpack(constant("C")),
      ]),
      ConstExpr::Property {
        object   : Box::new(ConstExpr::New { class: "Point".into(), args: vec![literal(Value::Long(1)), constant("Y")] }),
        property : Box::new(literal(Value::string("x"))),
        nullsafe : true,
      },
      literal(Value::Array(vec![(ArrayKey::Long(0), Value::Bool(true))])),
    ];

    for expr in expressions {
      let mut function = RawFunction::new("f");
      let index = function.add_literal(Value::Ast(Box::new(expr.clone())));
      function.opcodes.push(RawOp::new(RawOpcode::Return, 1).with_op1(RawOperand::Const(index)));
      let printed = print_assembly(&function);
      let reparsed = parse_assembly(&printed).unwrap_or_else(|error| panic!("{}\n{}", error, printed));
      assert_eq!(reparsed[0].literals[0], Value::Ast(Box::new(expr)), "{}", printed);
    }
  }

  #[test]
  fn test_print_reparses() {
    let functions = parse_assembly(GREET).unwrap();
    let printed = print_assembly(&functions[0]);
    let reparsed = parse_assembly(&printed).unwrap();
    assert_eq!(reparsed[0], functions[0]);
  }
}
