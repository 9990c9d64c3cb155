pub mod schema;

pub use schema::{ApplyConfig, Config, GatewayConfig, MysqlConfig, PathsConfig};
