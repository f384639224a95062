/*!
  A canonical intermediate representation for op arrays of a Zend-style virtual machine.

  The decoder turns a compiled function into a `Function` whose values flow by reference from
  producer to consumer instead of through numbered temporary slots, with each opcode family
  reduced to one canonical instruction. Instrumentation tools edit that form, and the encoder
  lowers it back, choosing opcode variants, slots and jump targets again.

  ```text
  Runtime ──lookup_and_decode──▶ Function ──(edits)──▶ encode ──▶ RawFunction ──replace──▶ Runtime
  ```
*/

#[macro_use] extern crate lazy_static;
#[macro_use] extern crate prettytable;

pub mod decode;
pub mod display;
pub mod encode;
pub mod error;
pub mod ir;
pub mod raw;
pub mod runtime;
pub mod signature;
pub mod symboltable;
pub mod value;
pub mod variants;

pub use decode::decode;
pub use encode::{encode, EncoderOptions};
pub use error::{AssemblyError, DecodeError, EncodeError, InvariantViolation, Violation};
pub use ir::{validate, Function};
pub use raw::RawFunction;
pub use runtime::{CalleeResolver, NoCallees, Runtime};
