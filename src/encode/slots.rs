/*!
  Temporary slot assignment. Every unnamed value lives in a slot from its first writer to its last
  reader; values whose lifetimes do not overlap share a slot. Writers continuing an earlier writer
  (the branches of a ternary) and the links of a rope write the same slot as the value they
  continue. The return address of a finally block lives in a slot of its own, keyed by the try
  region, from the first `FAST_CALL` into the block to its `FAST_RET`. Slots are handed out by a
  linear scan over lifetimes ordered by start, always taking the lowest free number.
*/

use std::collections::{BTreeSet, HashMap};

use crate::ir::{Function, OpId, OpKind, Operand, Referent, ValueKind};
use crate::raw::{RawOperand, SlotNumberType};

use super::analysis::{Analysis, RopePart};

struct Lifetime {
  start   : usize,
  end     : Option<usize>,
  /// The slot is a `TMP` rather than a `VAR`.
  tmp     : bool,
  members : Vec<(OpId, ValueKind)>,
}

pub(super) struct Slots {
  assigned      : HashMap<(OpId, ValueKind), RawOperand>,
  /// Slots in use; scratch slots are numbered from here.
  pub num_slots : SlotNumberType,
}

impl Slots {
  pub fn allocate(function: &Function, analysis: &Analysis) -> Slots {
    let mut lifetimes: Vec<Lifetime> = Vec::new();
    let mut lifetime_of: HashMap<(OpId, ValueKind), usize> = HashMap::new();
    let first_kind = |id: OpId| function[id].kind.outputs().first().map(|output| output.kind);

    // Writers, which open lifetimes or join the one they continue.
    for (position, (id, op)) in function.ops().enumerate() {
      if let OpKind::FeReset { .. } = op.kind {
        lifetime_of.insert((id, ValueKind::Unnamed), lifetimes.len());
        lifetimes.push(Lifetime { start: position, end: None, tmp: false, members: vec![(id, ValueKind::Unnamed)] });
      }
      if let OpKind::FastCall { try_op, .. } = op.kind {
        let key = (try_op, ValueKind::Temporary);
        if !lifetime_of.contains_key(&key) {
          lifetime_of.insert(key, lifetimes.len());
          lifetimes.push(Lifetime { start: position, end: None, tmp: true, members: vec![key] });
        }
      }

      for (index, output) in op.kind.outputs().iter().enumerate() {
        let key = (id, output.kind);
        let joined = match (index, op.continues, analysis.ropes.get(&id)) {
          (0, Some(previous), _) => first_kind(previous).and_then(|kind| lifetime_of.get(&(previous, kind)).copied()),
          (0, None, Some(RopePart::Add { .. })) => rope_previous(function, id)
            .and_then(|previous| lifetime_of.get(&(previous, ValueKind::Temporary)).copied()),
          _ => None,
        };
        match joined {
          Some(lifetime) => {
            let lifetime_entry = &mut lifetimes[lifetime];
            lifetime_entry.members.push(key);
            if analysis.ropes.get(&id).is_none() {
              lifetime_entry.tmp = output.kind == ValueKind::Temporary;
            }
            lifetime_of.insert(key, lifetime);
          }
          None => {
            lifetime_of.insert(key, lifetimes.len());
            lifetimes.push(Lifetime {
              start   : position,
              end     : None,
              tmp     : output.kind == ValueKind::Temporary,
              members : vec![key],
            });
          }
        }
      }
    }

    // Readers, which extend lifetimes to their position.
    for (position, (id, op)) in function.ops().enumerate() {
      let at = analysis.emit_position(id).unwrap_or(position);
      let mut read = |key: (OpId, ValueKind)| {
        if let Some(&lifetime) = lifetime_of.get(&key) {
          let end = &mut lifetimes[lifetime].end;
          *end = Some(end.map_or(at, |end| end.max(at)));
        }
      };
      for operand in op.kind.operands() {
        match operand {
          Operand::Ref(producer) => {
            if let Some(kind) = first_kind(*producer) {
              read((*producer, kind));
            }
          }
          other => {
            if let Some(key) = other.consumed() {
              read(key);
            }
          }
        }
      }
      match op.kind {
        OpKind::FastCall { try_op, .. } | OpKind::FastRet { try_op, .. } | OpKind::DiscardException { try_op } => {
          read((try_op, ValueKind::Temporary))
        }
        _ => {}
      }
      for (target, referent) in op.kind.references() {
        match referent {
          Referent::InitArray | Referent::Lambda => read((target, ValueKind::Temporary)),
          Referent::FeReset => read((target, ValueKind::Unnamed)),
          _ => {}
        }
      }
    }

    // Linear scan.
    let mut order: Vec<usize> = (0..lifetimes.len()).filter(|index| lifetimes[*index].end.is_some()).collect();
    order.sort_by_key(|index| (lifetimes[*index].start, *index));

    let mut assigned = HashMap::new();
    let mut active: Vec<(usize, SlotNumberType)> = Vec::new();
    let mut free: BTreeSet<SlotNumberType> = BTreeSet::new();
    let mut num_slots: SlotNumberType = 0;
    for index in order {
      let lifetime = &lifetimes[index];
      active.retain(|(end, slot)| {
        let expired = *end < lifetime.start;
        if expired {
          free.insert(*slot);
        }
        !expired
      });
      let slot = match free.iter().next().copied() {
        Some(slot) => {
          free.remove(&slot);
          slot
        }
        None => {
          num_slots += 1;
          num_slots - 1
        }
      };
      active.push((lifetime.end.unwrap_or(lifetime.start), slot));

      let operand = if lifetime.tmp { RawOperand::Tmp(slot) } else { RawOperand::Var(slot) };
      for member in &lifetime.members {
        assigned.insert(*member, operand);
      }
    }

    Slots { assigned, num_slots }
  }

  /// The slot of a value, or `UNUSED` if nothing reads it.
  pub fn of(&self, producer: OpId, kind: ValueKind) -> RawOperand {
    self.assigned.get(&(producer, kind)).copied().unwrap_or_default()
  }
}

/// The link a rope concatenation continues.
pub(super) fn rope_previous(function: &Function, id: OpId) -> Option<OpId> {
  match &function[id].kind {
    OpKind::Binary { lhs: Operand::Temporary(previous), .. } => Some(*previous),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::decode::decode;
  use crate::encode::EncoderOptions;
  use crate::raw::parse_assembly;
  use crate::runtime::NoCallees;

  fn allocate(text: &str, options: EncoderOptions) -> (Function, Slots) {
    let function = decode(&parse_assembly(text).unwrap()[0]).unwrap();
    let analysis = Analysis::new(&function, &NoCallees, options);
    let slots = Slots::allocate(&function, &analysis);
    (function, slots)
  }

  #[test]
  fn test_disjoint_lifetimes_share_a_slot() {
    let (function, slots) = allocate(
      ".function f\n.vars a\n  ADD CV0, 1 -> T5\n  ECHO T5\n  MUL CV0, 2 -> T9\n  RETURN T9\n",
      EncoderOptions::default(),
    );
    let body = function.body();
    assert_eq!(slots.of(body[0], ValueKind::Temporary), RawOperand::Tmp(0));
    assert_eq!(slots.of(body[2], ValueKind::Temporary), RawOperand::Tmp(0));
    assert_eq!(slots.num_slots, 1);
  }

  #[test]
  fn test_overlapping_lifetimes_do_not() {
    let (function, slots) = allocate(
      ".function f\n.vars a\n  ADD CV0, 1 -> T3\n  MUL CV0, 2 -> T4\n  SUB T3, T4 -> T3\n  RETURN T3\n",
      EncoderOptions::default(),
    );
    let body = function.body();
    assert_eq!(slots.of(body[0], ValueKind::Temporary), RawOperand::Tmp(0));
    assert_eq!(slots.of(body[1], ValueKind::Temporary), RawOperand::Tmp(1));
    // The operands die where the result is born, but not before it.
    assert_eq!(slots.of(body[2], ValueKind::Temporary), RawOperand::Tmp(2));
  }

  #[test]
  fn test_continued_writers_share_the_slot() {
    let text = "\
.function f
.vars a
  JMPZ CV0, #3
  QM_ASSIGN 1 -> T7
  JMP #4
  QM_ASSIGN 2 -> T7
  RETURN T7
";
    let (function, slots) = allocate(text, EncoderOptions::default());
    let body = function.body();
    assert_eq!(slots.of(body[1], ValueKind::Temporary), slots.of(body[3], ValueKind::Temporary));
    assert!(!slots.of(body[1], ValueKind::Temporary).is_unused());
  }

  #[test]
  fn test_return_address_outlives_the_returned_value() {
    let text = "\
.function f
.vars a
.try 0 0 5 6
  ADD CV0, 1 -> T4
  FAST_CALL #5, T4 -> T9
  RETURN T4
  FAST_CALL #5 -> T9
  JMP #7
  ECHO \"done\"
  FAST_RET T9, #4294967295
  RETURN null
";
    let (function, slots) = allocate(text, EncoderOptions::default());
    let body = function.body();
    // body[0] is the try region, which keys the return address.
    assert_eq!(slots.of(body[1], ValueKind::Temporary), RawOperand::Tmp(0));
    assert_eq!(slots.of(body[0], ValueKind::Temporary), RawOperand::Tmp(1));
    assert_eq!(slots.num_slots, 2);
  }

  #[test]
  fn test_unread_values_get_no_slot() {
    let (function, slots) = allocate(
      ".function f\n.vars a\n  ASSIGN CV0, 1 -> T0\n  RETURN null\n",
      EncoderOptions::default(),
    );
    assert_eq!(slots.of(function.body()[0], ValueKind::Temporary), RawOperand::Unused(0));
    assert_eq!(slots.num_slots, 0);
  }
}
