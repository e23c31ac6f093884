pub mod catalog;
pub mod types;

pub use catalog::Schema;
pub use types::{
    is_identifier, Field, FieldDefault, FieldType, IndexDef, MigrationMode, Table, TableBuilder,
    TableOptions, Validator,
};
