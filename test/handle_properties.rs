//! Property-based tests for handle tables.
//!
//! Uses proptest to drive random allocate/deallocate sequences and checks
//! that no handle ever names two live records.

use osport::{Handle, HandleKind, HandleTable};
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    /// Deallocate the n-th live handle, modulo the live count
    Deallocate(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        1 => any::<usize>().prop_map(Op::Deallocate),
    ]
}

fn kind() -> impl Strategy<Value = HandleKind> {
    prop_oneof![
        Just(HandleKind::PORT),
        Just(HandleKind::PROCESS),
        Just(HandleKind::LISTENER),
        Just(HandleKind::HASH),
        Just(HandleKind::WATCHER),
    ]
}

proptest! {
    /// Live handles are unique, never zero, and map to their own record
    #[test]
    fn live_handles_are_unique(kind in kind(), start in any::<u32>(), ops in prop::collection::vec(op(), 1..200)) {
        let table = HandleTable::starting_at(kind, start);
        let mut live: HashMap<Handle, u64> = HashMap::new();
        let mut order: Vec<Handle> = Vec::new();
        let mut next = 0u64;

        for op in ops {
            match op {
                Op::Allocate => {
                    let handle = table.allocate(next);
                    prop_assert_ne!(handle.0, 0);
                    prop_assert!(live.insert(handle, next).is_none(), "handle {} reissued while live", handle);
                    order.push(handle);
                    next += 1;
                }
                Op::Deallocate(n) if !order.is_empty() => {
                    let handle = order.remove(n % order.len());
                    let expected = live.remove(&handle);
                    prop_assert_eq!(table.deallocate(handle), expected);
                    prop_assert_eq!(table.lookup(handle), None);
                }
                Op::Deallocate(_) => {}
            }
        }

        prop_assert_eq!(table.len(), live.len());
        for (handle, value) in &live {
            prop_assert_eq!(table.lookup(*handle), Some(*value));
        }
    }

    /// A record is only removed conditionally when the predicate holds
    #[test]
    fn remove_if_respects_predicate(values in prop::collection::vec(any::<u8>(), 1..50)) {
        let table = HandleTable::new(HandleKind::WATCHER);
        let handles: Vec<_> = values.iter().map(|v| table.allocate(*v)).collect();
        for (handle, value) in handles.iter().zip(&values) {
            let removed = table.remove_if(*handle, |v| v % 2 == 0);
            prop_assert_eq!(removed.is_some(), value % 2 == 0);
            prop_assert_eq!(table.contains(*handle), value % 2 == 1);
        }
    }
}
