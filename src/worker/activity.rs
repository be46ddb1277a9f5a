use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Action verbs the feed surface reports, as literal text
///
/// Anything outside this set is skipped during classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// 赞同
    Agree,
    /// 回答
    Answer,
    /// 发表
    PostArticle,
    /// 发布
    PostPin,
    /// 收藏
    Collect,
}

impl Action {
    pub fn from_text(text: &str) -> Option<Self> {
        match text {
            "赞同" => Some(Self::Agree),
            "回答" => Some(Self::Answer),
            "发表" => Some(Self::PostArticle),
            "发布" => Some(Self::PostPin),
            "收藏" => Some(Self::Collect),
            _ => None,
        }
    }

}

/// Target content kinds, as literal text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// 回答
    Answer,
    /// 文章
    Article,
    /// 想法
    Pin,
}

impl TargetKind {
    pub fn from_text(text: &str) -> Option<Self> {
        match text {
            "回答" => Some(Self::Answer),
            "文章" => Some(Self::Article),
            "想法" => Some(Self::Pin),
            _ => None,
        }
    }

    pub fn as_text(&self) -> &'static str {
        match self {
            Self::Answer => "回答",
            Self::Article => "文章",
            Self::Pin => "想法",
        }
    }
}

/// Split an entry's combined meta text (`<action>了<target-type>`) at the
/// first `了`
pub fn split_meta_text(text: &str) -> Option<(&str, &str)> {
    text.split_once('了')
}

/// Classification rule table
///
/// - AGREE / COLLECT: the target type is taken from the literal type text
/// - ANSWER: always an answer
/// - POST_ARTICLE: only valid when the literal type text says article
/// - anything else: no rule, skipped (not an error)
pub fn classify(action_text: &str, target_type_text: &str) -> Option<TargetKind> {
    let action = Action::from_text(action_text)?;
    match action {
        Action::Agree | Action::Collect => TargetKind::from_text(target_type_text),
        Action::Answer => Some(TargetKind::Answer),
        Action::PostArticle if target_type_text == TargetKind::Article.as_text() => {
            Some(TargetKind::Article)
        }
        _ => None,
    }
}

/// The content an activity entry points at
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Target title as shown in the feed entry
    pub title: String,

    /// Link to the target, possibly scheme-relative
    pub link: String,

    /// Author handle extracted from the author link
    pub author: String,

    /// When the entry was extracted
    pub fetched_at: NaiveDateTime,
}

/// How and when the activity happened
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityMeta {
    /// Literal action text
    pub action: String,

    /// Literal target type text after classification
    pub target_type: String,

    /// Source-reported timestamp, second precision
    pub acted_at: NaiveDateTime,

    /// Verbatim meta text fragments the classification was derived from
    pub raw: Option<Vec<String>>,
}

/// One discovered feed entry, immutable after creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityItem {
    /// Opaque unique token assigned at discovery
    pub id: String,

    pub meta: ActivityMeta,

    pub target: Target,
}

impl ActivityItem {
    /// Assign a fresh id to a classified entry
    pub fn new(meta: ActivityMeta, target: Target) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            meta,
            target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agree_and_collect_take_the_literal_type() {
        assert_eq!(classify("赞同", "文章"), Some(TargetKind::Article));
        assert_eq!(classify("收藏", "回答"), Some(TargetKind::Answer));
        assert_eq!(classify("赞同", "想法"), Some(TargetKind::Pin));
    }

    #[test]
    fn answer_always_classifies_as_answer() {
        assert_eq!(classify("回答", "问题"), Some(TargetKind::Answer));
    }

    #[test]
    fn post_article_requires_article_type() {
        assert_eq!(classify("发表", "文章"), Some(TargetKind::Article));
        assert_eq!(classify("发表", "回答"), None);
    }

    #[test]
    fn post_pin_has_no_rule() {
        assert_eq!(classify("发布", "想法"), None);
        assert_eq!(classify("发布", "文章"), None);
    }

    #[test]
    fn unknown_pairs_are_skipped_not_errors() {
        assert_eq!(classify("关注", "用户"), None);
        assert_eq!(classify("赞同", "专栏"), None);
    }

    #[test]
    fn meta_text_splits_on_first_marker() {
        assert_eq!(split_meta_text("赞同了回答"), Some(("赞同", "回答")));
        assert_eq!(split_meta_text("收藏了文章"), Some(("收藏", "文章")));
        assert_eq!(split_meta_text("无标记"), None);
    }

    #[test]
    fn item_ids_are_unique() {
        let meta = ActivityMeta {
            action: "赞同".to_string(),
            target_type: "回答".to_string(),
            acted_at: crate::utils::time::now(),
            raw: None,
        };
        let target = Target {
            title: "t".to_string(),
            link: "//example.com/t".to_string(),
            author: "a".to_string(),
            fetched_at: crate::utils::time::now(),
        };
        let a = ActivityItem::new(meta.clone(), target.clone());
        let b = ActivityItem::new(meta, target);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
    }
}
