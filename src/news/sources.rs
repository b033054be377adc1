//! Per-source fetch clients. Grounded on `scrapers/dome.rs` and
//! `scrapers/hashdive_api.rs`'s "one `reqwest::Client`, one rate-limiter key,
//! parse-or-skip" shape.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use crate::config::{Lexicon, SourceConfig};
use crate::models::{Article, Urgency};
use crate::rate_limiter::{CallOutcome, RateLimiter};

/// A single fetched-and-classified batch from one source.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub articles: Vec<Article>,
    pub skipped: bool,
}

/// Alpha-Vantage-style `NEWS_SENTIMENT` response shape (subset).
#[derive(Debug, Deserialize)]
struct AlphaVantageResponse {
    #[serde(default)]
    feed: Vec<AlphaVantageItem>,
}

#[derive(Debug, Deserialize)]
struct AlphaVantageItem {
    title: String,
    url: String,
    #[serde(default)]
    summary: String,
    time_published: Option<String>,
}

/// Fetch one news source with the §4.3 protocol: acquire → request (5s
/// timeout) → retry-with-backoff up to 3 times on rate-limited → classify.
pub async fn fetch_source(
    client: &reqwest::Client,
    limiter: &RateLimiter,
    name: &str,
    cfg: &SourceConfig,
    lexicon: &Lexicon,
    timeout_secs: u64,
) -> FetchOutcome {
    if !cfg.enabled {
        return FetchOutcome::default();
    }

    let mut attempt = 0;
    loop {
        limiter.acquire(&cfg.rate_limiter_key).await;

        let result = do_request(client, cfg, timeout_secs).await;
        match result {
            Ok(raw) => {
                limiter.record(&cfg.rate_limiter_key, CallOutcome::Ok);
                let articles = parse_and_classify(name, &raw, lexicon);
                return FetchOutcome {
                    articles,
                    skipped: false,
                };
            }
            Err(FetchError::RateLimited) => {
                limiter.record(&cfg.rate_limiter_key, CallOutcome::RateLimited);
                attempt += 1;
                if attempt >= 3 {
                    warn!(source = name, "news_source_rate_limited_skip");
                    return FetchOutcome {
                        articles: vec![],
                        skipped: true,
                    };
                }
            }
            Err(FetchError::Transient(e)) => {
                limiter.record(&cfg.rate_limiter_key, CallOutcome::OtherError);
                warn!(source = name, error = %e, "news_source_transient_error");
                return FetchOutcome {
                    articles: vec![],
                    skipped: true,
                };
            }
        }
    }
}

enum FetchError {
    RateLimited,
    Transient(anyhow::Error),
}

async fn do_request(
    client: &reqwest::Client,
    cfg: &SourceConfig,
    timeout_secs: u64,
) -> Result<String, FetchError> {
    let mut req = client.get(&cfg.endpoint);
    if let Some(key) = &cfg.api_key {
        req = req.query(&[("apikey", key.as_str())]);
    }

    let response = tokio::time::timeout(Duration::from_secs(timeout_secs), req.send())
        .await
        .map_err(|_| FetchError::Transient(anyhow::anyhow!("request timed out")))?
        .map_err(|e| FetchError::Transient(anyhow::Error::from(e)))?;

    if response.status().as_u16() == 429 {
        return Err(FetchError::RateLimited);
    }
    if !response.status().is_success() {
        return Err(FetchError::Transient(anyhow::anyhow!(
            "upstream status {}",
            response.status()
        )));
    }

    response
        .text()
        .await
        .context("read response body")
        .map_err(FetchError::Transient)
}

/// Alpha Vantage responds with JSON; RSS feed sources respond with XML. We
/// sniff on the first non-whitespace byte rather than adding a per-source
/// "kind" config field, since the two shapes are trivially distinguishable.
fn parse_and_classify(source: &str, raw: &str, lexicon: &Lexicon) -> Vec<Article> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('<') {
        return parse_rss(source, raw, lexicon);
    }

    let parsed: AlphaVantageResponse = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(source, error = %e, "news_source_malformed_payload");
            return vec![];
        }
    };

    parsed
        .feed
        .into_iter()
        .map(|item| classify(source, item, lexicon))
        .collect()
}

/// Minimal hand-rolled `<item>` extractor for `rss_feeds[*]` sources — no
/// XML crate in the stack, so this walks `<item>...</item>` blocks and pulls
/// `title`/`link`/`pubDate`/`description` by tag delimiter, matching the
/// plain-string-manipulation style used elsewhere (cf. `models::normalize_text`).
fn parse_rss(source: &str, raw: &str, lexicon: &Lexicon) -> Vec<Article> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find("<item") {
        let Some(body_start) = rest[start..].find('>').map(|i| start + i + 1) else {
            break;
        };
        let Some(end_rel) = rest[body_start..].find("</item>") else {
            break;
        };
        let item_body = &rest[body_start..body_start + end_rel];

        let title = rss_tag(item_body, "title").unwrap_or_default();
        let link = rss_tag(item_body, "link").unwrap_or_default();
        let description = rss_tag(item_body, "description").unwrap_or_default();
        let pub_date = rss_tag(item_body, "pubDate");

        if !title.is_empty() && !link.is_empty() {
            let published_at = pub_date
                .as_deref()
                .and_then(parse_rfc2822_loose)
                .unwrap_or_else(Utc::now);
            let mut article = Article::new(source, title, link, published_at, description);
            article.urgency = classify_urgency(&article, lexicon);
            article.relevance = classify_relevance(&article, lexicon);
            out.push(article);
        }

        rest = &rest[body_start + end_rel + "</item>".len()..];
    }
    if out.is_empty() {
        warn!(source, "news_source_malformed_payload");
    }
    out
}

/// Extract the text content of the first `<tag>...</tag>` (optionally
/// CDATA-wrapped) occurrence within `body`.
fn rss_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    let raw = body[start..end].trim();
    let unwrapped = raw
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
        .unwrap_or(raw);
    Some(unwrapped.trim().to_string())
}

fn parse_rfc2822_loose(raw: &str) -> Option<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn classify(source: &str, item: AlphaVantageItem, lexicon: &Lexicon) -> Article {
    let published_at = item
        .time_published
        .as_deref()
        .and_then(parse_alpha_vantage_timestamp)
        .unwrap_or_else(Utc::now);

    let mut article = Article::new(source, item.title, item.url, published_at, item.summary);
    article.urgency = classify_urgency(&article, lexicon);
    article.relevance = classify_relevance(&article, lexicon);
    article
}

fn parse_alpha_vantage_timestamp(raw: &str) -> Option<chrono::DateTime<Utc>> {
    // Alpha Vantage uses `YYYYMMDDTHHMMSS`.
    chrono::NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S")
        .ok()
        .map(|naive| chrono::DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn classify_urgency(article: &Article, lexicon: &Lexicon) -> Urgency {
    let haystack = crate::models::normalize_text(&format!("{} {}", article.title, article.raw_text));
    if lexicon
        .breaking_keywords
        .iter()
        .any(|kw| haystack.contains(&crate::models::normalize_text(kw)))
    {
        return Urgency::Breaking;
    }
    if lexicon
        .high_keywords
        .iter()
        .any(|kw| haystack.contains(&crate::models::normalize_text(kw)))
    {
        return Urgency::High;
    }
    Urgency::Routine
}

fn classify_relevance(article: &Article, lexicon: &Lexicon) -> f64 {
    let haystack = crate::models::normalize_text(&format!("{} {}", article.title, article.raw_text));
    let tokens: Vec<&str> = haystack.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let hits = lexicon
        .relevance_keywords
        .iter()
        .filter(|kw| haystack.contains(crate::models::normalize_text(kw).as_str()))
        .count();
    (hits as f64 / lexicon.relevance_keywords.len().max(1) as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_urgency_prefers_breaking_over_high() {
        let lexicon = Lexicon::default();
        let a = Article::new(
            "s",
            "Banking collapse triggers emergency halt amid rate hike fears",
            "https://example.com/a",
            Utc::now(),
            "",
        );
        assert_eq!(classify_urgency(&a, &lexicon), Urgency::Breaking);
    }

    #[test]
    fn classify_relevance_counts_keyword_overlap() {
        let lexicon = Lexicon::default();
        let a = Article::new(
            "s",
            "Fed signals on inflation and bond yield outlook",
            "https://example.com/a",
            Utc::now(),
            "the market reacted",
        );
        let rel = classify_relevance(&a, &lexicon);
        assert!(rel > 0.0);
    }

    #[test]
    fn malformed_payload_returns_empty_not_panic() {
        let lexicon = Lexicon::default();
        let articles = parse_and_classify("s", "{not json", &lexicon);
        assert!(articles.is_empty());
    }

    #[test]
    fn rss_items_are_parsed_and_classified() {
        let lexicon = Lexicon::default();
        let xml = r#"<rss><channel>
            <item>
                <title><![CDATA[Fed signals inflation concern]]></title>
                <link>https://example.com/rss-a</link>
                <pubDate>Wed, 01 Jan 2026 10:00:00 GMT</pubDate>
                <description>market reaction to rate hike talk</description>
            </item>
            <item>
                <title>Local sports recap</title>
                <link>https://example.com/rss-b</link>
                <pubDate>Wed, 01 Jan 2026 11:00:00 GMT</pubDate>
                <description>home team wins</description>
            </item>
        </channel></rss>"#;
        let articles = parse_and_classify("rss_feed", xml, &lexicon);
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].title, "Fed signals inflation concern");
        assert_eq!(articles[0].url, "https://example.com/rss-a");
        assert!(articles[0].relevance > articles[1].relevance);
    }

    #[test]
    fn rss_with_no_items_logs_and_returns_empty() {
        let lexicon = Lexicon::default();
        let articles = parse_and_classify("rss_feed", "<rss><channel></channel></rss>", &lexicon);
        assert!(articles.is_empty());
    }
}
