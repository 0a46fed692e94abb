//! iRacing admin chat vocabulary

/// Throw a full course caution with a reason shown to the field
pub fn caution(reason: &str) -> String {
    if reason.is_empty() { "!y".to_string() } else { format!("!y {}", reason) }
}

/// Close pit road
pub fn pit_close() -> String {
    "!pitclose".to_string()
}

/// Set the number of pacing laps before the restart
pub fn pace_laps(laps: u32) -> String {
    format!("!pacelaps {}", laps)
}

/// Wave a car around the pace car
pub fn wave_around(car_number: &str) -> String {
    format!("!w {}", car_number)
}

/// Penalise a car (drive through, stop and go or seconds)
pub fn penalty(car_number: &str, penalty: &str) -> String {
    format!("!bl {} {}", car_number, penalty)
}

/// Private message to the driver of one car
pub fn direct(car_number: &str, text: &str) -> String {
    format!("/{} {}", car_number, text)
}
