use std::path::Path;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;

/// Current UTC time in whole milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

static LAST_ISO_STAMP: Mutex<Option<DateTime<Utc>>> = Mutex::new(None);

/// Current UTC time as an ISO-8601 second-resolution stamp.
///
/// Stamps handed out by this process never go backwards, even if the wall
/// clock does, so `updatedAt` fields are monotonically non-decreasing.
pub fn now_iso() -> String {
    let now = Utc::now();
    #[expect(clippy::unwrap_used)]
    let mut last = LAST_ISO_STAMP.lock().unwrap();
    let stamped = match *last {
        Some(previous) if previous > now => previous,
        _ => now,
    };
    *last = Some(stamped);
    stamped.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Restrict a file to owner read/write. Errors are ignored: the file stays
/// usable either way and not every filesystem supports modes.
pub fn restrict_to_owner(path: &Path) {
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
