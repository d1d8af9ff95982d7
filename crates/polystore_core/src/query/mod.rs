//! Backend-neutral query specifications and their in-process evaluation.

mod eval;
mod spec;

pub use eval::{compare, evaluate_predicate, keyset_after, shape_rows, sort_rows, ShapeOptions};
pub use spec::{
    Direction, Distinct, KeysetBound, OrderBy, Operator, Predicate, QuerySpec, COUNT_COLUMN,
};
pub(crate) use spec::hex_digest;
