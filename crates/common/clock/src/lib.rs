use chrono::DateTime;
use chrono::Utc;
use mockall::automock;

/// Timestamps are in UTC: inventory snapshots are compared across hosts,
/// so a local offset would only get in the way.
pub type Timestamp = DateTime<Utc>;

#[automock]
pub trait Clock: Sync + Send + 'static {
    fn now(&self) -> Timestamp;
}

#[derive(Clone)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}
