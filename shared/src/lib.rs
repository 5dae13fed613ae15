pub mod block;
pub mod errors;
pub mod interaction;
pub mod log;
pub mod types;
pub mod utils;

/// Current unix time in seconds.
pub fn timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
