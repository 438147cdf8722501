const OPENERS: [&str; 4] = [
    "Hey, just a heads up",
    "Quick reminder",
    "Don't forget",
    "Friendly reminder",
];

/// SMS body for a reminder. The opener is picked from the notification id so a
/// resend of the same row reads the same.
pub fn format_reminder(notification_id: i64, text: &str) -> String {
    let opener = OPENERS[notification_id.rem_euclid(OPENERS.len() as i64) as usize];
    format!("{}: {}\n\n(Reply SNOOZE to snooze)", opener, text.trim())
}
