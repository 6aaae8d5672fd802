//! Store adapters

pub mod clickhouse;

pub use self::clickhouse::{
    validate_database_name, validate_table_name, ClickHouseCompression, ClickHouseEndpoint,
    ClickHouseStore,
};
