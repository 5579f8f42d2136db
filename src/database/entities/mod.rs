pub mod api_keys;
pub mod group_hourly_stats;
pub mod group_monthly_stats;
pub mod group_sub_groups;
pub mod groups;
pub mod request_logs;
pub mod system_settings;

pub use api_keys::{KEY_STATUS_ACTIVE, KEY_STATUS_INVALID, Model as ApiKey};
pub use group_hourly_stats::Model as GroupHourlyStat;
pub use group_monthly_stats::Model as GroupMonthlyStat;
pub use group_sub_groups::Model as GroupSubGroup;
pub use groups::{GROUP_TYPE_AGGREGATE, GROUP_TYPE_STANDARD, Model as Group};
pub use request_logs::Model as RequestLog;
pub use system_settings::Model as SystemSetting;
