//! Scout gate: search outside the project for relevant developments.
//!
//! Findings scoring at or above the configured threshold become stimuli for
//! the next observe. The `(source_url, title)` pair of every surfaced
//! finding goes into the scout cache so nothing is reported twice.

use std::collections::BTreeSet;

use tracing::info;

use crate::error::EngineResult;
use crate::phases::envelope::ScoutEnvelope;
use crate::phases::{tool_list, PhaseCtx, SCOUT_TOOLS};
use crate::prompts;
use crate::state::types::ScoutKey;

/// Keywords pulled from the identity document for the search prompt.
const MAX_KEYWORDS: usize = 12;
const MIN_KEYWORD_LEN: usize = 4;

const STOPWORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "must", "should", "every", "project", "code",
    "about", "into", "them", "their", "when", "where", "what", "will", "over",
];

pub struct ScoutOutput {
    pub injected: usize,
    pub deduped: usize,
    pub turns_used: u32,
}

pub async fn run_scout(ctx: &PhaseCtx<'_>) -> EngineResult<ScoutOutput> {
    let keywords = extract_keywords(ctx.identity.text());
    let prompt = prompts::scout_prompt(
        ctx.identity,
        &ctx.config.language,
        &keywords,
        ctx.config.scout_min_relevance_score,
    );
    let mut request = ctx.lm_request("scout", prompt, ctx.config.max_turns.scout);
    request.allowed_tools = tool_list(SCOUT_TOOLS);
    let outcome = ctx.runner.run(request).await?;

    let envelope = ScoutEnvelope::parse(&outcome.text)?;

    let mut cache = ctx.state.read_scout_cache()?;
    let mut injected = 0;
    let mut deduped = 0;
    for finding in &envelope.findings {
        if finding.relevance_score < ctx.config.scout_min_relevance_score {
            continue;
        }
        let key = ScoutKey::new(&finding.source_url, &finding.title);
        if !cache.insert(key) {
            deduped += 1;
            continue;
        }
        let content = format!(
            "# {}\n\nSource: {}\nRelevance: {}/10\n\n{}\n",
            finding.title, finding.source_url, finding.relevance_score, finding.summary
        );
        ctx.state.create_stimulus(&finding.title, &content)?;
        injected += 1;
    }
    if injected > 0 || deduped > 0 {
        ctx.state.update_scout_cache(&cache)?;
    }

    info!(
        cycle = ctx.cycle,
        findings = envelope.findings.len(),
        injected,
        deduped,
        turns = outcome.turns_used,
        "scout finished"
    );

    Ok(ScoutOutput {
        injected,
        deduped,
        turns_used: outcome.turns_used,
    })
}

/// Distinct identity words worth searching for, longest first.
pub fn extract_keywords(identity_text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut keywords: Vec<String> = identity_text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| word.len() >= MIN_KEYWORD_LEN)
        .map(str::to_ascii_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .filter(|word| seen.insert(word.clone()))
        .collect();
    keywords.sort_by_key(|w| std::cmp::Reverse(w.len()));
    keywords.truncate(MAX_KEYWORDS);
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_dedupe_and_drop_stopwords() {
        let keywords = extract_keywords(
            "# Identity\n\nThis project parses websocket frames with websocket compression.",
        );
        assert!(keywords.contains(&"websocket".to_string()));
        assert!(keywords.contains(&"compression".to_string()));
        assert!(!keywords.contains(&"this".to_string()));
        assert_eq!(
            keywords.iter().filter(|k| *k == "websocket").count(),
            1
        );
    }

    #[test]
    fn keyword_list_is_bounded() {
        let text = (0..100)
            .map(|i| format!("keyword{i:03}"))
            .collect::<Vec<_>>()
            .join(" ");
        assert!(extract_keywords(&text).len() <= MAX_KEYWORDS);
    }
}
