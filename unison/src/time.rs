use std::time::{SystemTime, UNIX_EPOCH};

use unison_protocol::time::WallMs;

pub fn wall_now() -> WallMs {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch");

    WallMs(i64::try_from(elapsed.as_millis()).expect("cannot convert wall time to i64"))
}
