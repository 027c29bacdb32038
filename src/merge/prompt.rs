use crate::article::Article;
use crate::clustering::Cluster;
use crate::error::MergeValidationError;
use crate::llm::MergeRequest;

pub const MERGE_SYSTEM: &str = r#"You are a professional journalist and automotive expert writing for an Indian automotive news desk.

Important instructions for your responses:

1. Do not narrate or describe your actions.
2. Do not preface your response with phrases like "Here's the article..." or "I will now...".
3. Respond with a single JSON object and nothing else.
"#;

/// Builds the merge prompt for every member of `cluster`, each body cut to
/// `max_member_chars` characters.
pub fn merge_prompt(cluster: &Cluster, max_member_chars: usize) -> String {
    let sources = cluster
        .members
        .iter()
        .enumerate()
        .map(|(index, article)| source_block(index + 1, article, max_member_chars))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"Merge and rewrite the following {count} versions of a news story into a single, polished, publication-ready article.

### Requirements:
- **Headline**: One line, at most 300 characters, in the form "Company X launches Product Y in India at INR Z lakh" or similar. Include the key details (brand, action, price, date or numbers), present tense, professional style (e.g. "Tata Motors launches Nexon EV Max in India at INR 17.74 lakh ex-showroom").
- **Subheadline**: Optional, 1-2 sentences, at most 500 characters. Include it only if it adds details not already in the headline. Use an empty string otherwise.
- **Accuracy**: Verify facts across the sources, resolve contradictions and keep figures consistent.
- **Impartiality**: Neutral, balanced tone without opinion.
- **Completeness**: Full context, background and key details.
- **Originality**: Your own words; do not copy sentences from the sources.
- **Style**: Follow reputable news outlets such as Reuters or AP. Avoid fluff, jargon and sensationalism.
- **Length**: The article body MUST be between 2,000 and 5,000 characters (roughly 300-800 words), in paragraphs separated by blank lines.
- **Metadata**: The car brand (e.g. "Tata", "Hyundai") and model name (e.g. "Nexon", "Creta"), or null if not found.

### Output Format:
Respond with only this JSON object:
{{"headline": "...", "subheadline": "...", "body": "...", "brand": "..." or null, "model": "..." or null}}

### Source Versions:
{sources}
"#,
        count = cluster.members.len(),
        sources = sources,
    )
}

fn source_block(position: usize, article: &Article, max_chars: usize) -> String {
    let body: String = article.body.chars().take(max_chars).collect();
    format!(
        "--- Version {} ({}) ---\nTitle: {}\n{}",
        position, article.source, article.title, body
    )
}

/// Appended to the prompt when the previous reply broke the field limits.
pub fn corrective_note(error: &MergeValidationError) -> String {
    let problems = error
        .violations
        .iter()
        .map(|v| format!("- {}", v))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "\n### Correction:\nYour previous answer was rejected:\n{}\nRewrite the article so that every limit above is met. The body must be between 2,000 and 5,000 characters.\n",
        problems
    )
}

pub fn merge_request(cluster: &Cluster, max_member_chars: usize, correction: Option<&str>) -> MergeRequest {
    let mut prompt = merge_prompt(cluster, max_member_chars);
    if let Some(note) = correction {
        prompt.push_str(note);
    }
    MergeRequest {
        system: MERGE_SYSTEM.to_string(),
        prompt,
    }
}
