// Index subsystem (spec §4.3, §4.5). A single disk-resident B+tree
// implementation backs every index a collection can declare: the implicit
// unique `_id` index, secondary single-field indexes, and composite
// indexes — distinguished only by the `IndexKey` tuple arity and a
// uniqueness flag enforced one level up, in `collection::IndexManager`.

pub mod btree;

pub use btree::{BTree, IndexKey, Journal, DEFAULT_FANOUT};
