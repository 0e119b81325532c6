use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};

mod buttons;
pub use buttons::*;

use crate::Error;

/// Number of seconds in an hour
pub const HOUR: i32 = 3600;

/// Date format used for statistic buckets
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Date time format shown to and accepted from chat users
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Build a fixed offset from hours east of UTC, falling back to UTC when out of range.
pub fn offset_from_hours(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours * HOUR).unwrap_or_else(|| Utc.fix())
}

/// Local calendar date of `time` in `offset`
pub fn local_date(time: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    time.with_timezone(&offset).date_naive()
}

/// Statistic bucket key of `time`, e.g. `2024-01-31`
pub fn date_key(time: DateTime<Utc>, offset: FixedOffset) -> String {
    local_date(time, offset).format(DATE_FORMAT).to_string()
}

/// Bucket keys of the inclusive range ending at `time` and spanning `days` days.
pub fn date_range_keys(time: DateTime<Utc>, offset: FixedOffset, days: i64) -> (String, String) {
    let end = local_date(time, offset);
    let start = end - Duration::days((days - 1).max(0));
    (
        start.format(DATE_FORMAT).to_string(),
        end.format(DATE_FORMAT).to_string(),
    )
}

/// Parse `YYYY-MM-DD HH:MM[:SS]` written in local time.
pub fn parse_local_datetime(input: &str, offset: FixedOffset) -> Result<DateTime<Utc>, Error> {
    let input = input.trim();
    let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(input, DATETIME_FORMAT))?;
    let local = offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| Error::InvalidInput(format!("无法识别的时间: {input}")))?;
    Ok(local.with_timezone(&Utc))
}

/// Parse a start time for a schedule.
///
/// `now` and `立即` mean right away. Anything else must be a future local time.
pub fn parse_start_time(
    input: &str,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<DateTime<Utc>, Error> {
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("now") || trimmed == "立即" {
        return Ok(now);
    }
    let time = parse_local_datetime(trimmed, offset).map_err(|_| {
        Error::InvalidInput("时间格式错误，请使用 YYYY-MM-DD HH:MM 或 now".to_string())
    })?;
    if time <= now {
        return Err(Error::InvalidInput("开始时间必须在未来".to_string()));
    }
    Ok(time)
}

/// Parse `HH:MM`, `HH:MM:SS` or `HH点MM分` into hour and minute.
pub fn parse_clock(input: &str) -> Option<(u32, u32)> {
    let input = input.trim();
    let (hour, minute) = if let Some((hour, rest)) = input.split_once(':') {
        let minute = rest.split(':').next()?;
        (hour, minute)
    } else if let Some((hour, rest)) = input.split_once('点') {
        (hour, rest.trim_end_matches('分'))
    } else {
        return None;
    };
    let hour = hour.trim().parse::<u32>().ok()?;
    let minute = match minute.trim() {
        "" => 0,
        m => m.parse::<u32>().ok()?,
    };
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// Format `time` in local time for display.
pub fn format_local(time: DateTime<Utc>, offset: FixedOffset) -> String {
    time.with_timezone(&offset).format(DATETIME_FORMAT).to_string()
}

/// Human readable duration, e.g. `1小时30分钟`
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}秒");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes}分钟");
    }
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours < 24 {
        return match minutes {
            0 => format!("{hours}小时"),
            m => format!("{hours}小时{m}分钟"),
        };
    }
    let (days, hours) = (hours / 24, hours % 24);
    if days < 30 {
        return match hours {
            0 => format!("{days}天"),
            h => format!("{days}天{h}小时"),
        };
    }
    let (months, days) = (days / 30, days % 30);
    match days {
        0 => format!("{months}月"),
        d => format!("{months}月{d}天"),
    }
}

/// Truncate `text` to at most `max` characters, appending an ellipsis when cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max).collect();
        cut.push('…');
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc8() -> FixedOffset {
        offset_from_hours(8)
    }

    #[test]
    fn test_date_key_uses_local_date() {
        let time = Utc.with_ymd_and_hms(2024, 1, 31, 17, 0, 0).unwrap();
        assert_eq!(date_key(time, utc8()), "2024-02-01");
        assert_eq!(date_key(time, offset_from_hours(0)), "2024-01-31");
    }

    #[test]
    fn test_date_range_keys() {
        let time = Utc.with_ymd_and_hms(2024, 3, 30, 12, 0, 0).unwrap();
        let (start, end) = date_range_keys(time, utc8(), 30);
        assert_eq!(start, "2024-03-01");
        assert_eq!(end, "2024-03-30");
    }

    #[test]
    fn test_parse_local_datetime() {
        let time = parse_local_datetime("2024-05-01 08:30", utc8()).unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 0).unwrap());
        let time = parse_local_datetime("2024-05-01 08:30:15", utc8()).unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 15).unwrap());
        assert!(parse_local_datetime("05/01 08:30", utc8()).is_err());
    }

    #[test]
    fn test_parse_start_time() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_start_time("now", now, utc8()).unwrap(), now);
        assert_eq!(parse_start_time(" 立即 ", now, utc8()).unwrap(), now);
        assert!(parse_start_time("2024-05-01 07:00", now, utc8()).is_err());
        assert!(parse_start_time("2024-05-01 09:00", now, utc8()).is_ok());
        assert!(parse_start_time("tomorrow", now, utc8()).is_err());
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("08:05"), Some((8, 5)));
        assert_eq!(parse_clock("23:59:10"), Some((23, 59)));
        assert_eq!(parse_clock("9点30分"), Some((9, 30)));
        assert_eq!(parse_clock("9点"), Some((9, 0)));
        assert_eq!(parse_clock("24:00"), None);
        assert_eq!(parse_clock("noon"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45秒");
        assert_eq!(format_duration(300), "5分钟");
        assert_eq!(format_duration(3600), "1小时");
        assert_eq!(format_duration(5400), "1小时30分钟");
        assert_eq!(format_duration(86400 * 2 + 3600), "2天1小时");
        assert_eq!(format_duration(86400 * 45), "1月15天");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("你好世界", 10), "你好世界");
        assert_eq!(truncate("你好世界", 2), "你好…");
    }
}
