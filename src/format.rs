use chrono::{DateTime, Duration, Utc};

use crate::model::{CommentStatus, Member};

/// Human readable age of a comment relative to `now`. Calendar checks are
/// done in UTC.
pub fn relative_time(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - created_at).num_milliseconds() as f64 / 1000.0;
    let seconds = seconds.round() as i64;
    if seconds < 5 {
        return "Just now".to_string();
    }
    if seconds < 60 {
        return format!("{seconds} seconds ago");
    }

    let minutes = seconds / 60;
    if minutes < 60 {
        return plural(minutes, "minute");
    }

    let yesterday = (now - Duration::days(1)).date_naive();
    if created_at.date_naive() == yesterday {
        return "Yesterday".to_string();
    }

    let hours = minutes / 60;
    if hours < 24 {
        return plural(hours, "hour");
    }

    let days = hours / 24;
    if days < 7 {
        return plural(days, "day");
    }
    plural(days / 7, "week")
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("One {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

/// e.g. `01 Aug 2022 10:05`
pub fn explicit_time(at: DateTime<Utc>) -> String {
    at.format("%d %b %Y %H:%M").to_string()
}

/// First letter of the first and last word, uppercased.
pub fn initials(name: &str) -> String {
    let parts: Vec<&str> = name.split(' ').collect();
    let first_letter = |part: &str| {
        part.chars()
            .next()
            .map(|c| c.to_uppercase().collect::<String>())
            .unwrap_or_default()
    };
    match parts.as_slice() {
        [] | [""] => String::new(),
        [only] => first_letter(only),
        [first, .., last] => format!("{}{}", first_letter(first), first_letter(last)),
    }
}

pub fn author_name(member: Option<&Member>) -> &str {
    match member {
        None => "Deleted member",
        Some(member) => member
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or("Anonymous"),
    }
}

/// Placeholder shown instead of the body of a comment that is not published.
pub fn unpublished_notice(status: CommentStatus, is_admin: bool) -> Option<&'static str> {
    match status {
        CommentStatus::Published => None,
        CommentStatus::Hidden if is_admin => Some("This comment has been hidden."),
        CommentStatus::Hidden | CommentStatus::Deleted => Some("This comment has been removed."),
    }
}

/// Strips tags from comment html, turning paragraph and line breaks into
/// newlines and decoding the handful of entities the editor emits.
pub fn plain_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;
    for c in html.chars() {
        match (in_tag, c) {
            (false, '<') => {
                in_tag = true;
                tag.clear();
            }
            (true, '>') => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                if (name == "br" || (name == "p" && tag.starts_with('/'))) && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            (true, c) => tag.push(c),
            (false, c) => out.push(c),
        }
    }
    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .trim()
        .to_string()
}
