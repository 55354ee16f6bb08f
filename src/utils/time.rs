use chrono::Utc;

/// Milliseconds since the Unix epoch, the unit used for message timestamps
/// and session ids.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
