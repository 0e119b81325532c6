use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use mongodb::bson::oid::ObjectId;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::{
    config::KeywordConfig,
    database::{Keyword, KeywordCollection, MatchType},
    Error,
};

const REGEX_SIZE_LIMIT: usize = 1 << 20;
const REGEX_CACHE_LIMIT: usize = 1024;

/// Keywords every authorised group starts with.
pub fn default_keywords(group_id: i64) -> Vec<Keyword> {
    vec![
        Keyword::command(group_id, "日排行", "/tongji"),
        Keyword::command(group_id, "月排行", "/tongji30"),
    ]
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
}

pub fn validate_pattern(
    config: &KeywordConfig,
    pattern: &str,
    match_type: MatchType,
) -> Result<(), Error> {
    let length = pattern.trim().chars().count();
    if length == 0 {
        return Err(Error::InvalidKeyword("关键词不能为空".to_string()));
    }
    if length > config.max_pattern_length {
        return Err(Error::InvalidKeyword(format!(
            "关键词长度不能超过 {} 个字符",
            config.max_pattern_length
        )));
    }
    if match_type == MatchType::Regex {
        compile(pattern).map_err(|err| Error::InvalidKeyword(format!("正则表达式无效: {err}")))?;
    }
    Ok(())
}

pub fn validate_keyword(config: &KeywordConfig, keyword: &Keyword) -> Result<(), Error> {
    validate_pattern(config, &keyword.pattern, keyword.match_type)?;
    if !keyword.has_content() {
        return Err(Error::InvalidKeyword("回复内容、媒体和按钮至少需要一项".to_string()));
    }
    if let Some(response) = &keyword.response {
        if response.chars().count() > config.max_response_length {
            return Err(Error::InvalidKeyword(format!(
                "回复内容不能超过 {} 个字符",
                config.max_response_length
            )));
        }
    }
    if keyword.buttons.len() > config.max_buttons {
        return Err(Error::InvalidKeyword(format!(
            "按钮数量不能超过 {} 个",
            config.max_buttons
        )));
    }
    Ok(())
}

/// Matches message text against keywords, caching compiled regexes by pattern.
#[derive(Clone, Default)]
pub struct KeywordMatcher {
    cache: Arc<Mutex<HashMap<String, Option<Regex>>>>,
}

impl KeywordMatcher {
    /// First keyword matching `text`, in the order given.
    pub fn find_match<'a>(&self, text: &str, keywords: &'a [Keyword]) -> Option<&'a Keyword> {
        let trimmed = text.trim();
        keywords.iter().find(|keyword| match keyword.match_type {
            MatchType::Exact => trimmed == keyword.pattern,
            MatchType::Regex => self
                .regex(&keyword.pattern)
                .map_or(false, |regex| regex.is_match(text)),
        })
    }

    fn regex(&self, pattern: &str) -> Option<Regex> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(pattern) {
            return cached.clone();
        }
        if cache.len() >= REGEX_CACHE_LIMIT {
            cache.clear();
        }
        let compiled = match compile(pattern) {
            Ok(regex) => Some(regex),
            Err(err) => {
                warn!("Skipping invalid keyword regex `{pattern}`: {err}");
                None
            }
        };
        cache.insert(pattern.to_string(), compiled.clone());
        compiled
    }
}

#[derive(Clone)]
pub struct KeywordService {
    pub keywords: KeywordCollection,
    pub config: KeywordConfig,
    pub matcher: KeywordMatcher,
}

impl KeywordService {
    pub fn new(keywords: KeywordCollection, config: KeywordConfig) -> Self {
        Self {
            keywords,
            config,
            matcher: KeywordMatcher::default(),
        }
    }

    /// Validate and store, enforcing the per group limit for new patterns.
    pub async fn save(&self, keyword: &Keyword) -> Result<(), Error> {
        validate_keyword(&self.config, keyword)?;
        let exists = self
            .keywords
            .exists(keyword.group_id, &keyword.pattern)
            .await?;
        if !exists && self.keywords.count(keyword.group_id).await? >= self.config.max_keywords {
            return Err(Error::InvalidKeyword(format!(
                "每个群组最多 {} 个关键词",
                self.config.max_keywords
            )));
        }
        self.keywords.upsert(keyword).await?;
        debug!(
            "Saved keyword `{}` of group {}",
            keyword.pattern, keyword.group_id
        );
        Ok(())
    }

    /// Validate and overwrite the stored keyword `id`.
    pub async fn update(&self, id: ObjectId, keyword: &Keyword) -> Result<(), Error> {
        validate_keyword(&self.config, keyword)?;
        if self
            .keywords
            .pattern_taken(keyword.group_id, &keyword.pattern, id)
            .await?
        {
            return Err(Error::InvalidKeyword("该关键词已存在".to_string()));
        }
        if !self.keywords.replace(id, keyword).await? {
            return Err(Error::NotFound("关键词"));
        }
        debug!("Updated keyword {id} of group {}", keyword.group_id);
        Ok(())
    }

    pub async fn remove(&self, group_id: i64, id: ObjectId) -> Result<bool, Error> {
        Ok(self.keywords.remove(group_id, id).await?)
    }

    pub async fn list(&self, group_id: i64) -> Result<Vec<Keyword>, Error> {
        Ok(self.keywords.of_group(group_id).await?)
    }

    /// Add missing default keywords, returning how many were added.
    pub async fn add_defaults(&self, group_id: i64) -> Result<usize, Error> {
        let mut added = 0;
        for keyword in default_keywords(group_id) {
            if !self.keywords.exists(group_id, &keyword.pattern).await? {
                self.keywords.upsert(&keyword).await?;
                added += 1;
            }
        }
        Ok(added)
    }

    pub async fn match_message(&self, group_id: i64, text: &str) -> Result<Option<Keyword>, Error> {
        let keywords = self.keywords.of_group(group_id).await?;
        Ok(self.matcher.find_match(text, &keywords).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyword(pattern: &str, match_type: MatchType, response: &str) -> Keyword {
        Keyword {
            response: Some(response.to_string()),
            ..Keyword::new(-100, pattern, match_type)
        }
    }

    #[test]
    fn test_find_match_order_and_types() {
        let matcher = KeywordMatcher::default();
        let keywords = vec![
            keyword("[invalid", MatchType::Regex, "never"),
            keyword("你好", MatchType::Exact, "exact"),
            keyword(r"^价格\s*\d+", MatchType::Regex, "price"),
            keyword("你", MatchType::Regex, "contains"),
        ];

        let found = matcher.find_match(" 你好 ", &keywords).unwrap();
        assert_eq!(found.response.as_deref(), Some("exact"));

        let found = matcher.find_match("价格 100", &keywords).unwrap();
        assert_eq!(found.response.as_deref(), Some("price"));

        let found = matcher.find_match("谢谢你", &keywords).unwrap();
        assert_eq!(found.response.as_deref(), Some("contains"));

        assert!(matcher.find_match("hello", &keywords).is_none());
        // cached lookups behave the same
        assert!(matcher.find_match("价格 5", &keywords).is_some());
    }

    #[test]
    fn test_validate_keyword() {
        let config = KeywordConfig::default();
        assert!(validate_keyword(&config, &keyword("hi", MatchType::Exact, "hello")).is_ok());
        assert!(matches!(
            validate_keyword(&config, &keyword(" ", MatchType::Exact, "hello")),
            Err(Error::InvalidKeyword(_))
        ));
        assert!(validate_keyword(&config, &keyword(&"长".repeat(101), MatchType::Exact, "hello")).is_err());
        assert!(validate_keyword(&config, &keyword("(", MatchType::Regex, "hello")).is_err());
        assert!(validate_keyword(&config, &keyword("hi", MatchType::Exact, &"x".repeat(1001))).is_err());
        assert!(validate_keyword(&config, &Keyword::new(-100, "hi", MatchType::Exact)).is_err());
    }

    #[test]
    fn test_default_keywords() {
        let defaults = default_keywords(-100);
        assert_eq!(defaults.len(), 2);
        assert!(defaults.iter().all(|k| k.is_command && k.group_id == -100));
        assert_eq!(defaults[1].command.as_deref(), Some("/tongji30"));
    }
}
