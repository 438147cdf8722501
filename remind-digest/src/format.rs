use chrono::{NaiveDate, NaiveTime};

/// One line of the digest: a notification's local time and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestItem {
    pub local_time: NaiveTime,
    pub text: String,
}

pub fn format_digest(first_name: Option<&str>, date: NaiveDate, items: &[DigestItem]) -> String {
    let greeting = match first_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => format!("Good day, {}!", name),
        None => "Good day!".to_string(),
    };
    let date_str = date.format("%A, %B %d").to_string();

    if items.is_empty() {
        return format!(
            "{}\n\nNo reminders scheduled for today ({}). Enjoy your day!",
            greeting, date_str
        );
    }

    let mut lines = vec![
        greeting,
        String::new(),
        format!("Your reminders for {}:", date_str),
        String::new(),
    ];
    for (i, item) in items.iter().enumerate() {
        lines.push(format!("{}. {} - {}", i + 1, clock(item.local_time), item.text));
    }
    lines.push(String::new());
    lines.push("(You'll still receive each reminder at its scheduled time)".to_string());

    lines.join("\n")
}

/// 12-hour clock without a leading zero, e.g. `9:05 AM`.
fn clock(time: NaiveTime) -> String {
    time.format("%I:%M %p")
        .to_string()
        .trim_start_matches('0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    #[test]
    fn empty_day() {
        assert_eq!(
            format_digest(None, date(), &[]),
            "Good day!\n\nNo reminders scheduled for today (Monday, March 10). Enjoy your day!"
        );
    }

    #[test]
    fn numbered_list_with_local_times() {
        let items = vec![
            DigestItem {
                local_time: NaiveTime::from_hms_opt(9, 5, 0).unwrap(),
                text: "call the bank".to_string(),
            },
            DigestItem {
                local_time: NaiveTime::from_hms_opt(13, 30, 0).unwrap(),
                text: "pick up dry cleaning".to_string(),
            },
        ];
        let body = format_digest(Some("Ada"), date(), &items);
        assert_eq!(
            body,
            "Good day, Ada!\n\nYour reminders for Monday, March 10:\n\n\
             1. 9:05 AM - call the bank\n\
             2. 1:30 PM - pick up dry cleaning\n\n\
             (You'll still receive each reminder at its scheduled time)"
        );
    }

    #[test]
    fn blank_name_gets_plain_greeting() {
        assert!(format_digest(Some("  "), date(), &[]).starts_with("Good day!"));
    }
}
