//! Inline button payloads.
//!
//! Telegram limits callback data to 64 bytes, so every action is written as a
//! short `:` separated code, e.g. `kd:-1001234567890:65a1...` for a keyword
//! detail page.

use std::{fmt::Display, str::FromStr};

use mongodb::bson::oid::ObjectId;

use crate::{
    database::{GroupPermission, MatchType, RepeatType},
    service::stats::RankingPeriod,
    Error,
};

/// A group setting edited by typing a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    MinBytes,
    DailyRankSize,
    MonthlyRankSize,
    AutoDeleteTimeout,
}

impl SettingField {
    fn code(&self) -> &'static str {
        match self {
            SettingField::MinBytes => "mb",
            SettingField::DailyRankSize => "dr",
            SettingField::MonthlyRankSize => "mr",
            SettingField::AutoDeleteTimeout => "to",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "mb" => SettingField::MinBytes,
            "dr" => SettingField::DailyRankSize,
            "mr" => SettingField::MonthlyRankSize,
            "to" => SettingField::AutoDeleteTimeout,
            _ => return None,
        })
    }
}

/// Buttons shown while filling a keyword or broadcast form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormAction {
    Group(i64),
    MatchType(MatchType),
    Repeat(RepeatType),
    /// Retype the keyword pattern
    Pattern,
    /// Resend the reply or broadcast content
    Content,
    Buttons,
    Interval,
    StartTime,
    EndTime,
    ToggleFixedTime,
    Preview,
    Submit,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Groups,
    Group(i64),
    KeywordList(i64, u32),
    KeywordDetail(i64, ObjectId),
    KeywordDelete(i64, ObjectId),
    KeywordEdit(i64, ObjectId),
    KeywordAdd(i64),
    BroadcastList(i64),
    BroadcastDetail(i64, ObjectId),
    BroadcastDelete(i64, ObjectId),
    BroadcastEdit(i64, ObjectId),
    BroadcastAdd(i64),
    Stats(i64),
    ToggleCountMedia(i64),
    Edit(i64, SettingField),
    Features(i64),
    ToggleFeature(i64, GroupPermission),
    AutoDelete(i64),
    ToggleAutoDelete(i64),
    AutoDeletePreset(i64, u64),
    Ranking(i64, RankingPeriod, u32),
    Form(FormAction),
}

/// Preset timeouts offered in the auto delete menu, in seconds.
pub const AUTO_DELETE_PRESETS: [u64; 5] = [300, 600, 1800, 3600, 7200];

fn period_code(period: RankingPeriod) -> &'static str {
    match period {
        RankingPeriod::Daily => "d",
        RankingPeriod::Monthly => "m",
    }
}

fn match_type_code(match_type: MatchType) -> &'static str {
    match match_type {
        MatchType::Exact => "exact",
        MatchType::Regex => "regex",
    }
}

impl Display for CallbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use CallbackAction::*;
        match self {
            Groups => write!(f, "gs"),
            Group(g) => write!(f, "g:{g}"),
            KeywordList(g, page) => write!(f, "kl:{g}:{page}"),
            KeywordDetail(g, id) => write!(f, "kd:{g}:{}", id.to_hex()),
            KeywordDelete(g, id) => write!(f, "kx:{g}:{}", id.to_hex()),
            KeywordEdit(g, id) => write!(f, "ke:{g}:{}", id.to_hex()),
            KeywordAdd(g) => write!(f, "ka:{g}"),
            BroadcastList(g) => write!(f, "bl:{g}"),
            BroadcastDetail(g, id) => write!(f, "bd:{g}:{}", id.to_hex()),
            BroadcastDelete(g, id) => write!(f, "bx:{g}:{}", id.to_hex()),
            BroadcastEdit(g, id) => write!(f, "be:{g}:{}", id.to_hex()),
            BroadcastAdd(g) => write!(f, "ba:{g}"),
            Stats(g) => write!(f, "ss:{g}"),
            ToggleCountMedia(g) => write!(f, "sm:{g}"),
            Edit(g, field) => write!(f, "se:{g}:{}", field.code()),
            Features(g) => write!(f, "fs:{g}"),
            ToggleFeature(g, permission) => write!(f, "ft:{g}:{}", permission.as_str()),
            AutoDelete(g) => write!(f, "ad:{g}"),
            ToggleAutoDelete(g) => write!(f, "at:{g}"),
            AutoDeletePreset(g, secs) => write!(f, "ap:{g}:{secs}"),
            Ranking(g, period, page) => write!(f, "rk:{g}:{}:{page}", period_code(*period)),
            Form(action) => match action {
                FormAction::Group(g) => write!(f, "f:g:{g}"),
                FormAction::MatchType(t) => write!(f, "f:t:{}", match_type_code(*t)),
                FormAction::Repeat(r) => write!(f, "f:r:{}", r.as_str()),
                FormAction::Pattern => write!(f, "f:pt"),
                FormAction::Content => write!(f, "f:ct"),
                FormAction::Buttons => write!(f, "f:btn"),
                FormAction::Interval => write!(f, "f:iv"),
                FormAction::StartTime => write!(f, "f:st"),
                FormAction::EndTime => write!(f, "f:et"),
                FormAction::ToggleFixedTime => write!(f, "f:fx"),
                FormAction::Preview => write!(f, "f:pv"),
                FormAction::Submit => write!(f, "f:ok"),
                FormAction::Cancel => write!(f, "f:no"),
            },
        }
    }
}

fn invalid(data: &str) -> Error {
    Error::InvalidInput(format!("未知的按钮数据: {data}"))
}

impl FromStr for CallbackAction {
    type Err = Error;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        use CallbackAction::*;

        let parts: Vec<&str> = data.split(':').collect();
        let group = |i: usize| -> Result<i64, Error> {
            parts
                .get(i)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| invalid(data))
        };
        let object_id = |i: usize| -> Result<ObjectId, Error> {
            parts
                .get(i)
                .and_then(|s| ObjectId::parse_str(s).ok())
                .ok_or_else(|| invalid(data))
        };
        let number = |i: usize| -> Result<u64, Error> {
            parts
                .get(i)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| invalid(data))
        };
        let page = |i: usize| -> Result<u32, Error> {
            u32::try_from(number(i)?).map_err(|_| invalid(data))
        };

        let action = match parts.as_slice() {
            ["gs"] => Groups,
            ["g", ..] => Group(group(1)?),
            ["kl", ..] => KeywordList(group(1)?, page(2)?),
            ["kd", ..] => KeywordDetail(group(1)?, object_id(2)?),
            ["kx", ..] => KeywordDelete(group(1)?, object_id(2)?),
            ["ke", ..] => KeywordEdit(group(1)?, object_id(2)?),
            ["ka", ..] => KeywordAdd(group(1)?),
            ["bl", ..] => BroadcastList(group(1)?),
            ["bd", ..] => BroadcastDetail(group(1)?, object_id(2)?),
            ["bx", ..] => BroadcastDelete(group(1)?, object_id(2)?),
            ["be", ..] => BroadcastEdit(group(1)?, object_id(2)?),
            ["ba", ..] => BroadcastAdd(group(1)?),
            ["ss", ..] => Stats(group(1)?),
            ["sm", ..] => ToggleCountMedia(group(1)?),
            ["se", _, field] => Edit(
                group(1)?,
                SettingField::from_code(field).ok_or_else(|| invalid(data))?,
            ),
            ["fs", ..] => Features(group(1)?),
            ["ft", _, permission] => ToggleFeature(group(1)?, permission.parse()?),
            ["ad", ..] => AutoDelete(group(1)?),
            ["at", ..] => ToggleAutoDelete(group(1)?),
            ["ap", ..] => AutoDeletePreset(group(1)?, number(2)?),
            ["rk", _, period, _] => {
                let period = match *period {
                    "d" => RankingPeriod::Daily,
                    "m" => RankingPeriod::Monthly,
                    _ => return Err(invalid(data)),
                };
                Ranking(group(1)?, period, page(3)?)
            }
            ["f", "g", _] => Form(FormAction::Group(group(2)?)),
            ["f", "t", "exact"] => Form(FormAction::MatchType(MatchType::Exact)),
            ["f", "t", "regex"] => Form(FormAction::MatchType(MatchType::Regex)),
            ["f", "r", repeat] => Form(FormAction::Repeat(
                RepeatType::ALL
                    .into_iter()
                    .find(|r| r.as_str() == *repeat)
                    .ok_or_else(|| invalid(data))?,
            )),
            ["f", "pt"] => Form(FormAction::Pattern),
            ["f", "ct"] => Form(FormAction::Content),
            ["f", "btn"] => Form(FormAction::Buttons),
            ["f", "iv"] => Form(FormAction::Interval),
            ["f", "st"] => Form(FormAction::StartTime),
            ["f", "et"] => Form(FormAction::EndTime),
            ["f", "fx"] => Form(FormAction::ToggleFixedTime),
            ["f", "pv"] => Form(FormAction::Preview),
            ["f", "ok"] => Form(FormAction::Submit),
            ["f", "no"] => Form(FormAction::Cancel),
            _ => return Err(invalid(data)),
        };
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_actions_fit_and_parse_back() {
        let group = -1001234567890;
        let id = ObjectId::new();
        let actions = [
            CallbackAction::Groups,
            CallbackAction::KeywordList(group, 3),
            CallbackAction::KeywordDelete(group, id),
            CallbackAction::KeywordEdit(group, id),
            CallbackAction::BroadcastDetail(group, id),
            CallbackAction::BroadcastEdit(group, id),
            CallbackAction::Edit(group, SettingField::AutoDeleteTimeout),
            CallbackAction::ToggleFeature(group, GroupPermission::Broadcast),
            CallbackAction::AutoDeletePreset(group, 7200),
            CallbackAction::Ranking(group, RankingPeriod::Monthly, 12),
            CallbackAction::Form(FormAction::Group(group)),
            CallbackAction::Form(FormAction::Repeat(RepeatType::Custom)),
            CallbackAction::Form(FormAction::MatchType(MatchType::Regex)),
            CallbackAction::Form(FormAction::Pattern),
            CallbackAction::Form(FormAction::Content),
        ];
        for action in actions {
            let data = action.to_string();
            assert!(data.len() <= 64, "{data} is too long");
            assert_eq!(data.parse::<CallbackAction>().unwrap(), action);
        }
    }

    #[test]
    fn test_rejects_unknown_data() {
        for data in [
            "",
            "zz:1",
            "g:abc",
            "kd:-1:nothex",
            "rk:-1:y:1",
            "f:r:weekly",
            "kl:-1:4294967296",
            "rk:-1:d:4294967297",
        ] {
            assert!(data.parse::<CallbackAction>().is_err(), "{data}");
        }
    }
}
