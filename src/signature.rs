//! What the encoder needs to know about a callee: its name, how each parameter is passed, and
//! whether it has a compiled body. A signature displays as `name/arity`.

use std::fmt::{Display, Formatter};

use string_cache::DefaultAtom;
use strum_macros::{Display as StrumDisplay, IntoStaticStr};

use crate::raw::RawFunction;

#[derive(StrumDisplay, IntoStaticStr, Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Passing {
  ByValue,
  ByReference,
}

/// Internal functions are implemented by the host and have no op array.
#[derive(StrumDisplay, IntoStaticStr, Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FunctionKind {
  Internal,
  User,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Signature {
  /// The lowercase name, without a leading backslash.
  pub name     : DefaultAtom,
  pub params   : Vec<Passing>,
  /// The last parameter collects any further arguments.
  pub variadic : bool,
  pub kind     : FunctionKind,
}

impl Signature {
  pub fn new(name: &str, params: Vec<Passing>, variadic: bool, kind: FunctionKind) -> Signature {
    Signature {
      name: DefaultAtom::from(normalize_name(name).as_str()),
      params,
      variadic,
      kind,
    }
  }

  /// An internal function taking `arity` by-value parameters.
  pub fn internal(name: &str, arity: usize) -> Signature {
    Signature::new(name, vec![Passing::ByValue; arity], false, FunctionKind::Internal)
  }

  pub fn from_raw(function: &RawFunction) -> Signature {
    let params = function
      .arg_info
      .iter()
      .map(|arg| if arg.by_ref { Passing::ByReference } else { Passing::ByValue })
      .collect();
    let variadic = function.arg_info.last().map_or(false, |arg| arg.variadic);
    Signature::new(&function.qualified_name(), params, variadic, FunctionKind::User)
  }

  pub fn arity(&self) -> usize {
    self.params.len()
  }

  pub fn is_internal(&self) -> bool {
    self.kind == FunctionKind::Internal
  }

  /// How argument number `arg_num` (1-based) is passed.
  pub fn passing(&self, arg_num: u32) -> Passing {
    let index = (arg_num as usize).saturating_sub(1);
    match self.params.get(index) {
      Some(passing) => *passing,
      None if self.variadic => self.params.last().copied().unwrap_or(Passing::ByValue),
      None => Passing::ByValue,
    }
  }
}

impl Display for Signature {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    if self.variadic {
      write!(f, "{}/{}+", self.name, self.arity())
    } else {
      write!(f, "{}/{}", self.name, self.arity())
    }
  }
}

/// Function names are case-insensitive and global names may carry a leading backslash.
pub fn normalize_name(name: &str) -> String {
  name.trim_start_matches('\\').to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_passing_beyond_declared_params() {
    let sort = Signature::new("sort", vec![Passing::ByReference, Passing::ByValue], false, FunctionKind::Internal);
    assert_eq!(sort.passing(1), Passing::ByReference);
    assert_eq!(sort.passing(3), Passing::ByValue);

    let collect = Signature::new("collect", vec![Passing::ByReference], true, FunctionKind::User);
    assert_eq!(collect.passing(5), Passing::ByReference);
    assert_eq!(collect.to_string(), "collect/1+");
  }

  #[test]
  fn test_names_are_normalized() {
    assert_eq!(Signature::internal("\\StrLen", 1).name.as_ref(), "strlen");
    assert_eq!(Signature::internal("strlen", 1).to_string(), "strlen/1");
  }
}
