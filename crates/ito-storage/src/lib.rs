//! ito-storage: OpenDAL-backed report index shared by all devices

pub mod board;
pub mod health;
pub mod operator;

pub use board::{FetchedReports, ReportBoard, DEFAULT_FETCH_LOOKBACK};
pub use health::{check_health, is_healthy};
pub use operator::{build_index_operator, build_memory_operator};
