//! Formatting helpers.

use std::time::Duration;

/// Human-readable span keeping the two most significant units, e.g. `5 min 0 sec`.
pub fn time_span_string(span: Duration) -> String {
    let millis = span.as_millis();
    let secs = span.as_secs();
    let (days, hours, mins) = (secs / 86_400, (secs / 3_600) % 24, (secs / 60) % 60);
    let rem_secs = secs % 60;
    if days > 0 {
        format!("{} day{} {} hr", days, if days == 1 { "" } else { "s" }, hours)
    } else if hours > 0 {
        format!("{} hr {} min", hours, mins)
    } else if mins > 0 {
        format!("{} min {} sec", mins, rem_secs)
    } else if secs >= 10 {
        format!("{} sec", secs)
    } else if secs > 0 {
        let tenths = (millis % 1000) / 100;
        if tenths == 0 {
            format!("{} sec", secs)
        } else {
            format!("{}.{} sec", secs, tenths)
        }
    } else {
        format!("{} ms", millis)
    }
}
