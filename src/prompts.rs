//! Prompt templates for brand perception questions.
//!
//! Domain logic for rendering one task's prompt. Provider-agnostic.

use crate::engine::Task;

/// Rendered prompt ready for an AI platform.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    /// Single-string form for clients that take one prompt.
    pub fn to_prompt(&self) -> String {
        if self.system.is_empty() {
            return self.user.clone();
        }
        format!("{}\n\n{}", self.system, self.user)
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// A prompt template with placeholders.
///
/// `{question}`, `{brand}` and `{competitors}` are substituted in both parts.
/// The question text itself may carry `{brand}` and `{competitors}`.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, question: &str, brand: &str, competitors: &[String]) -> PromptInstance {
        let safe_brand = escape_xml_chars(brand.trim());
        let safe_competitors = if competitors.is_empty() {
            "none".to_string()
        } else {
            competitors
                .iter()
                .map(|c| escape_xml_chars(c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let safe_question = escape_xml_chars(question.trim())
            .replace("{brand}", &safe_brand)
            .replace("{competitors}", &safe_competitors);

        let fill = |text: &str| {
            text.replace("{brand}", &safe_brand)
                .replace("{competitors}", &safe_competitors)
                .replace("{question}", &safe_question)
        };

        PromptInstance {
            template_slug: self.slug.to_string(),
            system: fill(self.system).trim().to_string(),
            user: fill(self.user).trim().to_string(),
        }
    }

    pub fn render_task(&self, task: &Task) -> PromptInstance {
        self.render(&task.question, &task.brand, &task.competitors)
    }
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const GEO_FOOTER_V1: PromptTemplate = PromptTemplate {
    slug: "geo_footer_v1",
    system: r#"You are a knowledgeable assistant answering a shopper's question. Answer honestly and concretely, naming the brands or products you would actually recommend, in order of preference.

After your answer, add one line containing only a JSON object describing how you treated the brand under review:
{"brand_mentioned": true|false, "rank": <1-based position of the brand in your recommendations, or -1>, "sentiment": <-1.0 to 1.0>}"#,
    user: r#"<question>
{question}
</question>

<brand_under_review>{brand}</brand_under_review>
<other_brands>{competitors}</other_brands>"#,
};

/// Asks the question with no footer; parsing falls back to text heuristics.
pub const GEO_PLAIN: PromptTemplate = PromptTemplate {
    slug: "geo_plain",
    system: "",
    user: "{question}",
};

pub const PROMPTS: &[PromptTemplate] = &[GEO_FOOTER_V1, GEO_PLAIN];
pub const DEFAULT_PROMPT: PromptTemplate = GEO_FOOTER_V1;

pub fn prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    PROMPTS.iter().find(|t| t.slug == slug).copied()
}

// =============================================================================
// TESTS
// =============================================================================
