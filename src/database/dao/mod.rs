mod api_keys;
mod groups;
mod request_logs;
mod stats;

pub use api_keys::ApiKeysDao;
pub use groups::GroupsDao;
pub use request_logs::{LogQuery, RequestLogsDao};
pub use stats::{StatsDao, hour_bucket, month_bucket, next_month};
