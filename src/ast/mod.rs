/// Backend-independent expression engine.
///
/// ```text
/// field()/literal()/select()     (builder.rs)
///       ↓
/// Query tree                     (types.rs)
///       ↓
/// Rewrite passes                 (optimizer.rs)
///       ↓
/// Dialect renderer               (crate::dialect)
/// ```
pub mod builder;
pub mod optimizer;
pub mod types;

pub use builder::{
    all, any, count_all, delete, field, insert, insert_many, literal, select, update,
    DeleteBuilder, Operand, SelectBuilder, UpdateBuilder,
};
pub use optimizer::{Optimizer, RewritePass};
pub use types::*;
