mod schema;
mod store;

pub use store::{LoadReport, RowError, SqliteWarehouse, WarehouseStats};
