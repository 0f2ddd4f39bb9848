//! 消息内容净化与垃圾评分
//!
//! 用单遍扫描器代替正则：固定的标签/协议拒绝表、HTML 实体转义、
//! 控制字节剥离（0x00–0x08, 0x0B, 0x0C, 0x0E–0x1F, 0x7F）和空白折叠。
//! 扫描器满足 `sanitize(sanitize(x)) == sanitize(x)`。

use crate::errors::{DomainError, DomainResult};

/// 净化后允许的最大内容长度。
pub const MAX_CONTENT_LEN: usize = 4096;

/// 整个标签被丢弃的元素名（含闭合形式）。
const DENIED_TAGS: &[&str] = &[
    "script", "/script", "iframe", "/iframe", "object", "/object", "embed", "/embed",
];

/// 被整体剥离的 URL 协议前缀。
const DENIED_SCHEMES: &[&str] = &["javascript:", "vbscript:"];

/// 已转义实体，重复净化时原样保留。
const ENTITIES: &[&str] = &["&lt;", "&gt;", "&quot;", "&#x27;", "&#x2F;", "&amp;"];

/// SQL 形态拒绝表（在小写、空白折叠后的副本上匹配）。
const SQL_SHAPES: &[&str] = &[
    "union select",
    "insert into",
    "delete from",
    "drop table",
    "drop database",
    "truncate table",
    "xp_cmdshell",
    "' or '1'='1",
    "\" or \"1\"=\"1",
    "or 1=1 --",
    "; drop ",
    "waitfor delay",
    "benchmark(",
    "sleep(",
];

/// 可疑短链域名（垃圾评分用）。
const SHORT_URL_DOMAINS: &[&str] = &[
    "bit.ly", "tinyurl.com", "goo.gl", "t.co", "ow.ly", "is.gd", "buff.ly", "rb.gy",
];

fn is_stripped_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0B}' | '\u{0C}' | '\u{0E}'..='\u{1F}' | '\u{7F}')
}

fn starts_with_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.len() >= needle.len()
        && haystack
            .chars()
            .zip(needle.chars())
            .take(needle.chars().count())
            .all(|(a, b)| a.eq_ignore_ascii_case(&b))
}

/// 匹配 `on<alpha>+=` 形式的内联事件属性，返回需要跳过的字节数。
fn event_attribute_len(rest: &str) -> Option<usize> {
    let bytes = rest.as_bytes();
    if bytes.len() < 4 || !bytes[0].eq_ignore_ascii_case(&b'o') || !bytes[1].eq_ignore_ascii_case(&b'n')
    {
        return None;
    }
    let mut i = 2;
    while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
        i += 1;
    }
    if i > 2 && i < bytes.len() && bytes[i] == b'=' {
        Some(i + 1)
    } else {
        None
    }
}

/// 单遍净化扫描器。
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    // 当前空白运行的缓冲；≥3 个连续空白折叠为单个空格
    let mut ws_run = String::new();
    let mut ws_len = 0usize;
    // 上一个消费掉的输入字符，事件属性只在词首剥离
    let mut prev: Option<char> = None;

    let mut flush_ws = |out: &mut String, ws_run: &mut String, ws_len: &mut usize| {
        if *ws_len >= 3 {
            out.push(' ');
        } else {
            out.push_str(ws_run);
        }
        ws_run.clear();
        *ws_len = 0;
    };

    let mut i = 0;
    while i < input.len() {
        let rest = &input[i..];
        let c = rest.chars().next().expect("index on char boundary");

        if c.is_whitespace() {
            ws_len += 1;
            if ws_len <= 2 {
                ws_run.push(c);
            }
            prev = Some(c);
            i += c.len_utf8();
            continue;
        }
        if ws_len > 0 {
            flush_ws(&mut out, &mut ws_run, &mut ws_len);
        }

        if is_stripped_control(c) {
            prev = Some(c);
            i += c.len_utf8();
            continue;
        }

        if let Some(skip) = DENIED_SCHEMES
            .iter()
            .find(|scheme| starts_with_ignore_case(rest, scheme))
            .map(|scheme| scheme.len())
        {
            prev = Some(':');
            i += skip;
            continue;
        }

        let at_word_start = prev.map_or(true, |p| {
            p.is_whitespace() || matches!(p, '"' | '\'' | '<' | '>' | '=')
        });
        if at_word_start {
            if let Some(skip) = event_attribute_len(rest) {
                prev = Some('=');
                i += skip;
                continue;
            }
        }

        match c {
            '<' => {
                let after = &rest[1..];
                if DENIED_TAGS
                    .iter()
                    .any(|tag| starts_with_ignore_case(after, tag))
                {
                    // 丢弃整个标签直到 '>'（或输入结束）
                    match rest.find('>') {
                        Some(end) => i += end + 1,
                        None => i = input.len(),
                    }
                    prev = Some('>');
                } else {
                    out.push_str("&lt;");
                    prev = Some(c);
                    i += 1;
                }
            }
            '>' => {
                out.push_str("&gt;");
                prev = Some(c);
                i += 1;
            }
            '"' => {
                out.push_str("&quot;");
                prev = Some(c);
                i += 1;
            }
            '\'' => {
                out.push_str("&#x27;");
                prev = Some(c);
                i += 1;
            }
            '/' => {
                out.push_str("&#x2F;");
                prev = Some(c);
                i += 1;
            }
            '&' => {
                if let Some(entity) = ENTITIES
                    .iter()
                    .find(|entity| rest.starts_with(*entity))
                {
                    out.push_str(entity);
                    i += entity.len();
                } else {
                    out.push_str("&amp;");
                    i += 1;
                }
                prev = Some(';');
            }
            _ => {
                out.push(c);
                prev = Some(c);
                i += c.len_utf8();
            }
        }
    }
    // 结尾的空白运行同样折叠
    if ws_len > 0 {
        if ws_len >= 3 {
            out.push(' ');
        } else {
            out.push_str(&ws_run);
        }
    }
    out
}

/// SQL 形态检测，命中即拒绝整条消息。
pub fn looks_like_sql(input: &str) -> bool {
    let mut normalized = String::with_capacity(input.len());
    let mut last_ws = false;
    for c in input.chars() {
        if c.is_whitespace() {
            if !last_ws {
                normalized.push(' ');
            }
            last_ws = true;
        } else {
            normalized.extend(c.to_lowercase());
            last_ws = false;
        }
    }
    SQL_SHAPES.iter().any(|shape| normalized.contains(shape))
}

/// 验证并净化用户消息内容。
pub fn clean_content(raw: &str) -> DomainResult<String> {
    if raw.trim().is_empty() {
        return Err(DomainError::validation("content", "cannot be empty"));
    }
    if looks_like_sql(raw) {
        return Err(DomainError::content_rejected("sql-shaped input"));
    }
    let sanitized = sanitize(raw);
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("content", "empty after sanitation"));
    }
    if trimmed.len() > MAX_CONTENT_LEN {
        return Err(DomainError::validation("content", "too long"));
    }
    Ok(trimmed.to_owned())
}

/// 垃圾评分结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpamVerdict {
    pub score: u8,
    pub is_spam: bool,
}

/// 五项启发式各计 1 分，≥2 分判定为垃圾消息。
pub fn spam_score(content: &str, recent: &[String]) -> SpamVerdict {
    let mut score = 0u8;

    // (a) 单个词占比超过 40%
    let tokens: Vec<&str> = content.split_whitespace().collect();
    if !tokens.is_empty() {
        let mut counts = std::collections::HashMap::new();
        for token in &tokens {
            *counts.entry(token.to_ascii_lowercase()).or_insert(0usize) += 1;
        }
        let max = counts.values().copied().max().unwrap_or(0);
        if max * 10 > tokens.len() * 4 {
            score += 1;
        }
    }

    // (b) 长度超过 10 且大写字母占比超过 90%
    if content.chars().count() > 10 {
        let letters: Vec<char> = content.chars().filter(|c| c.is_alphabetic()).collect();
        if !letters.is_empty() {
            let upper = letters.iter().filter(|c| c.is_uppercase()).count();
            if upper * 10 > letters.len() * 9 {
                score += 1;
            }
        }
    }

    // (c) 与最近消息重复
    if recent.iter().any(|m| m == content) {
        score += 1;
    }

    // (d) 可疑短链
    let lowered = content.to_lowercase();
    if SHORT_URL_DOMAINS.iter().any(|d| lowered.contains(d)) {
        score += 1;
    }

    // (e) 长度超过上限的 80%
    if content.len() * 10 > MAX_CONTENT_LEN * 8 {
        score += 1;
    }

    SpamVerdict {
        score,
        is_spam: score >= 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_is_idempotent() {
        let cases = [
            "hello <b>world</b> & friends",
            "a 'quoted' \"string\" with /slashes/",
            "<script>alert(1)</script>ok",
            "spaced     out    text",
            "già &amp; done",
        ];
        for case in cases {
            let once = sanitize(case);
            assert_eq!(sanitize(&once), once, "not idempotent for {case:?}");
        }
    }

    #[test]
    fn strips_denied_tags_entirely() {
        assert_eq!(sanitize("<script src=x>alert(1)</script>hi"), "alert(1)hi");
        assert_eq!(sanitize("<IFRAME src=evil>"), "");
        assert_eq!(sanitize("<object data=x></object>done"), "done");
    }

    #[test]
    fn escapes_markup_characters() {
        assert_eq!(sanitize("<b>"), "&lt;b&gt;");
        assert_eq!(sanitize("a/b"), "a&#x2F;b");
        assert_eq!(sanitize("say \"hi\""), "say &quot;hi&quot;");
        assert_eq!(sanitize("it's"), "it&#x27;s");
        assert_eq!(sanitize("salt & pepper"), "salt &amp; pepper");
    }

    #[test]
    fn strips_schemes_and_event_attributes() {
        assert_eq!(sanitize("JaVaScRiPt:alert(1)"), "alert(1)");
        assert_eq!(sanitize("vbscript:msgbox"), "msgbox");
        assert_eq!(sanitize("x onclick=boom"), "x boom");
        // 词中间的 on…= 不是事件属性
        assert_eq!(sanitize("conf=3"), "conf=3");
    }

    #[test]
    fn strips_control_bytes() {
        assert_eq!(sanitize("a\u{0}b\u{7f}c"), "abc");
        // \n 和 \t 是空白，不是被剥离的控制字节
        assert_eq!(sanitize("a\nb"), "a\nb");
    }

    #[test]
    fn collapses_long_whitespace_runs() {
        assert_eq!(sanitize("a   b"), "a b");
        assert_eq!(sanitize("a  b"), "a  b");
        assert_eq!(sanitize("a \n\t b"), "a b");
    }

    #[test]
    fn rejects_sql_shapes() {
        assert!(looks_like_sql("1; DROP TABLE users"));
        assert!(looks_like_sql("a UNION   SELECT password"));
        assert!(looks_like_sql("name' OR '1'='1"));
        assert!(!looks_like_sql("let's talk about tables"));
        assert!(clean_content("x'; DROP TABLE messages; --").is_err());
    }

    #[test]
    fn clean_content_bounds() {
        assert!(clean_content("   ").is_err());
        assert!(clean_content(&"x".repeat(MAX_CONTENT_LEN + 1)).is_err());
        assert_eq!(clean_content("  hello  ").unwrap(), "hello");
    }

    #[test]
    fn spam_heuristics() {
        // 大写 + 超长都命中
        let shouting = "BUY NOW ".repeat(500);
        let verdict = spam_score(&shouting, &[]);
        assert!(verdict.is_spam);

        // 单项命中不算垃圾
        let verdict = spam_score("hello", &[]);
        assert_eq!(verdict.score, 1);
        assert!(!verdict.is_spam);

        // 重复 + 短链
        let recent = vec!["check bit.ly/x".to_owned()];
        let verdict = spam_score("check bit.ly/x", &recent);
        assert!(verdict.is_spam);
    }
}
