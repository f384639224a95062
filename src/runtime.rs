/*!
  The boundary to the host runtime: the registry of functions and classes whose compiled bodies
  the decoder reads and the encoder replaces, and the callee information the encoder consults.

  User functions are stored the way the VM keeps them, as an op array in binary form next to
  the function's metadata, and are materialized on every lookup. Internal functions and abstract
  methods have a signature but no body, so looking them up finds nothing to decode. Names of
  functions, classes and methods are case-insensitive.
*/

use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::decode::decode;
use crate::error::{AssemblyError, DecodeError};
use crate::ir::Function;
use crate::raw::{decode_ops, encode_ops, parse_assembly, RawFunction, Word};
use crate::signature::{normalize_name, FunctionKind, Passing, Signature};

/// What the encoder asks about the functions a body calls.
pub trait CalleeResolver {
  /// The signature of the global function `name`, if it is statically known. The name may carry
  /// a leading backslash and is matched case-insensitively.
  fn signature(&self, name: &str) -> Option<&Signature>;
}

/// Knows no callee; every call is encoded in its by-name form.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCallees;

impl CalleeResolver for NoCallees {
  fn signature(&self, _name: &str) -> Option<&Signature> {
    None
  }
}

#[derive(Clone, Debug, PartialEq)]
enum Entry {
  /// A compiled body: the function's metadata with an empty op list, and the ops as words.
  User { signature: Signature, header: RawFunction, code: Vec<Word> },
  Internal(Signature),
  Abstract(Signature),
}

impl Entry {
  fn user(mut function: RawFunction) -> Entry {
    let code = encode_ops(&function.opcodes);
    function.opcodes.clear();
    Entry::User { signature: Signature::from_raw(&function), header: function, code }
  }

  fn signature(&self) -> &Signature {
    match self {
      Entry::User { signature, .. } | Entry::Internal(signature) | Entry::Abstract(signature) => signature,
    }
  }
}

#[derive(Clone, Debug, Default)]
pub struct Runtime {
  functions : HashMap<String, Entry>,
  /// Class name to its methods, all keys normalized.
  classes   : HashMap<String, HashMap<String, Entry>>,
}

impl Runtime {
  pub fn new() -> Runtime {
    Runtime::default()
  }

  /// A runtime that knows the builtins the decoder and encoder treat specially, plus a few
  /// functions taking arguments by reference.
  pub fn with_builtins() -> Runtime {
    use Passing::{ByReference as Ref, ByValue as Val};

    let mut runtime = Runtime::new();
    let fixed: [(&str, usize); 24] = [
      ("strlen", 1),
      ("count", 2),
      ("in_array", 3),
      ("array_key_exists", 2),
      ("call_user_func_array", 2),
      ("array_slice", 4),
      ("func_get_args", 0),
      ("func_num_args", 0),
      ("get_class", 1),
      ("get_called_class", 0),
      ("gettype", 1),
      ("defined", 1),
      ("is_null", 1),
      ("is_bool", 1),
      ("is_int", 1),
      ("is_float", 1),
      ("is_string", 1),
      ("is_array", 1),
      ("is_object", 1),
      ("is_resource", 1),
      ("strtoupper", 1),
      ("implode", 2),
      ("array_keys", 1),
      ("var_dump", 1),
    ];
    for (name, arity) in fixed {
      runtime.define_internal(Signature::internal(name, arity));
    }
    runtime.define_internal(Signature::new("call_user_func", vec![Val, Val], true, FunctionKind::Internal));
    runtime.define_internal(Signature::new("sort", vec![Ref, Val], false, FunctionKind::Internal));
    runtime.define_internal(Signature::new("array_push", vec![Ref, Val], true, FunctionKind::Internal));
    runtime.define_internal(Signature::new(
      "preg_match",
      vec![Val, Val, Ref, Val, Val],
      false,
      FunctionKind::Internal,
    ));
    runtime
  }

  // region Registration

  pub fn define_internal(&mut self, signature: Signature) {
    self.functions.insert(signature.name.to_string(), Entry::Internal(signature));
  }

  /// Registers a compiled body as a free function, or as a method of its scope.
  pub fn define(&mut self, function: RawFunction) {
    let name = normalize_name(&function.name);
    match function.scope.as_ref().map(|scope| normalize_name(scope)) {
      Some(class) => {
        self.classes.entry(class).or_default().insert(name, Entry::user(function));
      }
      None => {
        self.functions.insert(name, Entry::user(function));
      }
    }
  }

  pub fn declare_abstract(&mut self, class: &str, signature: Signature) {
    self
      .classes
      .entry(normalize_name(class))
      .or_default()
      .insert(signature.name.to_string(), Entry::Abstract(signature));
  }

  /// Defines every function of an assembly text and returns how many there were.
  pub fn load_assembly(&mut self, text: &str) -> Result<usize, AssemblyError> {
    let functions = parse_assembly(text)?;
    let count = functions.len();
    for function in functions {
      self.define(function);
    }
    Ok(count)
  }

  // endregion

  fn entry(&self, name: &str, owning_type: Option<&str>) -> Option<&Entry> {
    let name = normalize_name(name);
    match owning_type {
      Some(class) => self.classes.get(&normalize_name(class))?.get(&name),
      None => self.functions.get(&name),
    }
  }

  /// The compiled body of a function or method, if it has one.
  pub fn compiled(&self, name: &str, owning_type: Option<&str>) -> Result<Option<RawFunction>, DecodeError> {
    match self.entry(name, owning_type) {
      Some(Entry::User { header, code, .. }) => {
        let opcodes = decode_ops(code).ok_or_else(|| DecodeError::CorruptBody(header.qualified_name()))?;
        Ok(Some(RawFunction { opcodes, ..header.clone() }))
      }
      _ => Ok(None),
    }
  }

  /**
    Looks up a free function (`owning_type` absent) or a method and decodes its body. Unknown
    names, internal functions and abstract methods are not found. Errors are reserved for bodies
    that cannot be decoded.
  */
  #[instrument(level = "debug", skip(self))]
  pub fn lookup_and_decode(&self, name: &str, owning_type: Option<&str>) -> Result<Option<Function>, DecodeError> {
    let raw = match self.compiled(name, owning_type)? {
      Some(raw) => raw,
      None => {
        debug!("no compiled body");
        return Ok(None);
      }
    };

    #[cfg(feature = "trace_transforms")]
    tracing::trace!("raw body of {}\n{}", raw.qualified_name(), crate::display::raw_table(&raw));

    let function = decode(&raw)?;

    #[cfg(feature = "trace_transforms")]
    tracing::trace!("decoded body of {}\n{}", function.qualified_name(), crate::display::function_table(&function));

    Ok(Some(function))
  }

  /// Swaps in a new body for a user function or method. Returns whether there was one to replace.
  #[instrument(level = "debug", skip(self, function))]
  pub fn replace(&mut self, name: &str, owning_type: Option<&str>, function: RawFunction) -> bool {
    let name = normalize_name(name);
    let slot = match owning_type {
      Some(class) => self.classes.get_mut(&normalize_name(class)).and_then(|methods| methods.get_mut(&name)),
      None => self.functions.get_mut(&name),
    };
    match slot {
      Some(entry @ Entry::User { .. }) => {
        *entry = Entry::user(function);
        debug!("replaced");
        true
      }
      _ => false,
    }
  }
}

impl CalleeResolver for Runtime {
  fn signature(&self, name: &str) -> Option<&Signature> {
    self.functions.get(&normalize_name(name)).map(Entry::signature)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SOURCE: &str = "\
.function greet
.vars name
.arg name
  RECV #1 -> CV0
  CONCAT \"Hello, \", CV0 -> T0
  RETURN T0
.function Shape::area
.scope Shape
  RETURN 0
";

  #[test]
  fn test_lookup_finds_compiled_bodies() {
    let mut runtime = Runtime::with_builtins();
    assert_eq!(runtime.load_assembly(SOURCE), Ok(2));

    let greet = runtime.lookup_and_decode("GREET", None).unwrap().unwrap();
    assert_eq!(greet.params.len(), 1);
    assert_eq!(greet.len(), 2);

    let area = runtime.lookup_and_decode("area", Some("shape")).unwrap().unwrap();
    assert_eq!(area.qualified_name(), "Shape::area");
  }

  #[test]
  fn test_not_found() {
    let mut runtime = Runtime::with_builtins();
    runtime.declare_abstract("Shape", Signature::new("perimeter", vec![], false, FunctionKind::User));
    assert_eq!(runtime.lookup_and_decode("doesNotExist", None), Ok(None));
    assert_eq!(runtime.lookup_and_decode("strlen", None), Ok(None));
    assert_eq!(runtime.lookup_and_decode("perimeter", Some("Shape")), Ok(None));
    assert_eq!(runtime.lookup_and_decode("greet", Some("Nowhere")), Ok(None));
  }

  #[test]
  fn test_signatures() {
    let mut runtime = Runtime::with_builtins();
    runtime.load_assembly(SOURCE).unwrap();
    assert_eq!(runtime.signature("\\SORT").map(|s| s.passing(1)), Some(Passing::ByReference));
    assert_eq!(runtime.signature("greet").map(|s| s.kind), Some(FunctionKind::User));
    assert!(runtime.signature("area").is_none());
  }

  #[test]
  fn test_replace() {
    let mut runtime = Runtime::new();
    runtime.load_assembly(SOURCE).unwrap();
    let replacement = parse_assembly(".function greet\n  RETURN \"hi\"\n").unwrap().remove(0);
    assert!(runtime.replace("greet", None, replacement));
    assert!(!runtime.replace("strlen", None, RawFunction::new("strlen")));
    let greet = runtime.lookup_and_decode("greet", None).unwrap().unwrap();
    assert_eq!(greet.len(), 1);
  }

  #[test]
  fn test_edited_body_is_swapped_in() {
    use crate::encode::{encode, EncoderOptions};
    use crate::ir::{Op, OpKind, Operand};

    let mut runtime = Runtime::with_builtins();
    runtime.load_assembly(SOURCE).unwrap();
    let mut greet = runtime.lookup_and_decode("greet", None).unwrap().unwrap();
    let ret = greet.body()[1];
    greet.insert_before(ret, Op::new(3, OpKind::Echo { value: Operand::string("greeting") }));

    let raw = encode(&greet, &runtime, EncoderOptions::default()).unwrap();
    assert!(runtime.replace("Greet", None, raw));

    let again = runtime.lookup_and_decode("greet", None).unwrap().unwrap();
    assert_eq!(again.len(), 3);
    assert_eq!(again.params, greet.params);
    assert!(matches!(again[again.body()[1]].kind, OpKind::Echo { .. }));
  }
}
