//! Runtime: drivers, pooling, adapters and transactions.

pub mod adapter;
pub mod driver;
pub mod memory;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod timings;
pub mod transaction;

pub use adapter::{Adapter, Affected, CallOptions, InstanceState, RawParams, RawResult, RawStatement};
pub use driver::{ColumnInfo, Connection, Driver, DriverRows, Outcome, Statement, TableInfo};
pub use memory::MemoryDriver;
pub use pool::PoolStatus;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDriver;
pub use timings::Timing;
pub use transaction::Transaction;
