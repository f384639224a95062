use bimap::BiMap;
use string_cache::DefaultAtom;

use crate::ir::VarId;

/// The name of the pseudo-variable for the current object.
pub const THIS: &str = "this";
/// The name of the pseudo-variable for the global symbol table.
pub const GLOBALS: &str = "GLOBALS";

/**
  The named variables of a function: a mapping between variable names (without the `$`) and
  their `VarId`s. Ids are handed out densely in insertion order, so a table built from a
  function's compiled variables gives compiled variable `i` the id `VarId(i)`. The table is
  really just a convenience wrapper around a BiMap.

  `this` and `GLOBALS` are pseudo-variables: they have ids like any other name but are not
  compiled variables of the function.
*/
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VarTable {
  table: BiMap<DefaultAtom, VarId>,
}

impl VarTable {
  pub fn new() -> VarTable {
    VarTable { table: BiMap::new() }
  }

  pub fn get_name(&self, var: &VarId) -> Option<&DefaultAtom> {
    self.table.get_by_right(var)
  }

  pub fn get_var(&self, name: &str) -> Option<VarId> {
    self.table.get_by_left(&DefaultAtom::from(name)).cloned()
  }

  /// The id of `name`, adding it if it is new.
  pub fn intern(&mut self, name: &str) -> VarId {
    if let Some(var) = self.get_var(name) {
      return var;
    }
    let var = VarId(self.table.len() as u32);
    // The name is new and ids are dense, so neither side can collide.
    let _ = self.table.insert_no_overwrite(DefaultAtom::from(name), var);
    var
  }

  pub fn contains(&self, var: &VarId) -> bool {
    self.table.contains_right(var)
  }

  pub fn len(&self) -> usize {
    self.table.len()
  }

  pub fn is_empty(&self) -> bool {
    self.table.is_empty()
  }

  pub fn is_pseudo(&self, var: &VarId) -> bool {
    self.get_name(var).map_or(false, |name| is_pseudo_name(name))
  }

  /// All variables in id order.
  pub fn iter(&self) -> impl Iterator<Item = (VarId, &DefaultAtom)> {
    let mut entries: Vec<(VarId, &DefaultAtom)> =
      self.table.iter().map(|(name, var)| (*var, name)).collect();
    entries.sort_by_key(|(var, _)| *var);
    entries.into_iter()
  }

  /// The compiled variables, i.e. all variables except the pseudo-variables, in id order.
  pub fn compiled(&self) -> impl Iterator<Item = (VarId, &DefaultAtom)> {
    self.iter().filter(|(_, name)| !is_pseudo_name(name))
  }
}

pub fn is_pseudo_name(name: &str) -> bool {
  name == THIS || name == GLOBALS
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_intern_is_dense_and_stable() {
    let mut vars = VarTable::new();
    assert_eq!(vars.intern("a"), VarId(0));
    assert_eq!(vars.intern("b"), VarId(1));
    assert_eq!(vars.intern("a"), VarId(0));
    assert_eq!(vars.get_name(&VarId(1)).map(|n| n.as_ref()), Some("b"));
    assert_eq!(vars.len(), 2);
  }

  #[test]
  fn test_pseudo_variables_are_not_compiled() {
    let mut vars = VarTable::new();
    vars.intern("x");
    let this = vars.intern(THIS);
    vars.intern("y");
    assert!(vars.is_pseudo(&this));
    let compiled: Vec<&str> = vars.compiled().map(|(_, name)| name.as_ref()).collect();
    assert_eq!(compiled, vec!["x", "y"]);
  }
}
