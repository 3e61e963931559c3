//! Document type classification against a closed taxonomy.
//!
//! Classification is two generate calls against the classifier model: one picks a type from the
//! taxonomy, the next picks a subtype from that type's list. Input is truncated to the model's
//! character budget at a word boundary first. Failures degrade to `unknown`/`unknown`.

mod taxonomy;

use std::fmt;
use std::sync::Arc;

use crate::backend::{BackendError, GenerateRequest, InferenceBackend};
use crate::metrics::PipelineMetrics;
use crate::resources::ModelHandle;

pub use taxonomy::{DocumentType, OTHER, Taxonomy, TaxonomyError};

/// Label used when classification could not run.
pub const UNKNOWN: &str = "unknown";

const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Type and subtype assigned to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Document type.
    pub doc_type: String,
    /// Document subtype within `doc_type`.
    pub doc_subtype: String,
}

impl Classification {
    /// `unknown`/`unknown`, returned whenever classification fails.
    pub fn unknown() -> Self {
        Self {
            doc_type: UNKNOWN.to_string(),
            doc_subtype: UNKNOWN.to_string(),
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.doc_type, self.doc_subtype)
    }
}

/// Classifies document text into a type and subtype.
pub struct DocumentTypeClassifier {
    backend: Arc<dyn InferenceBackend>,
    model: Arc<ModelHandle>,
    taxonomy: Taxonomy,
    metrics: Arc<PipelineMetrics>,
}

impl DocumentTypeClassifier {
    /// Classifier prompting `model` over `taxonomy`.
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        model: Arc<ModelHandle>,
        taxonomy: Taxonomy,
    ) -> Self {
        Self {
            backend,
            model,
            taxonomy,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Report model calls into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Character budget for classifier input.
    pub fn max_input_chars(&self) -> usize {
        self.model
            .max_input_tokens
            .saturating_mul(self.model.chars_per_token)
    }

    /// Classify `text`. Never fails: empty input or any backend error yields `unknown`/`unknown`.
    pub async fn classify(&self, text: &str) -> Classification {
        if text.trim().is_empty() {
            tracing::warn!("Empty text provided for classification");
            return Classification::unknown();
        }

        let excerpt = truncate_at_word(text, self.max_input_chars());
        match self.try_classify(excerpt).await {
            Ok(classification) => {
                tracing::info!(
                    doc_type = %classification.doc_type,
                    doc_subtype = %classification.doc_subtype,
                    input_chars = excerpt.chars().count(),
                    "Classified document"
                );
                classification
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    model = %self.model.serving_name,
                    "Classification failed"
                );
                Classification::unknown()
            }
        }
    }

    async fn try_classify(&self, text: &str) -> Result<Classification, BackendError> {
        let reply = self.generate(self.type_prompt(text)).await?;
        let mut doc_type = normalize_label(&reply);
        if !self.taxonomy.contains(&doc_type) {
            tracing::warn!(
                reply = %reply,
                "Model answered a type outside the taxonomy; using 'other'"
            );
            doc_type = OTHER.to_string();
        }

        let subtypes = self.taxonomy.subtypes(&doc_type).unwrap_or_default();
        let reply = self
            .generate(subtype_prompt(&doc_type, subtypes, text))
            .await?;
        let mut doc_subtype = normalize_label(&reply);
        if !subtypes.iter().any(|subtype| *subtype == doc_subtype) {
            tracing::debug!(
                doc_type = %doc_type,
                reply = %reply,
                "Model answered an unlisted subtype; using 'other'"
            );
            doc_subtype = OTHER.to_string();
        }

        Ok(Classification {
            doc_type,
            doc_subtype,
        })
    }

    fn type_prompt(&self, text: &str) -> String {
        let categories = self
            .taxonomy
            .type_names()
            .map(|name| format!("* {name}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "You are an NLP Engineer. You classify documents content into one of these categories:\n\
             {categories}\n\n\
             IT IS VERY IMPORTANT that you only respond with the category name, nothing else.\n\
             It is very important that you respond a category above that exists and best describes the document.\n\n\
             Classify this content into one of the categories above:\n{text}"
        )
    }

    async fn generate(&self, prompt: String) -> Result<String, BackendError> {
        let request = GenerateRequest::for_model(&self.model, prompt, CLASSIFY_TEMPERATURE);
        self.metrics.record_model_call();
        self.backend.generate(request).await
    }
}

fn subtype_prompt(doc_type: &str, subtypes: &[String], text: &str) -> String {
    format!(
        "For a {doc_type} document, classify it into one of these subtypes:\n{}\n\
         Only respond with the subtype name, nothing else.\n\n\
         Document content:\n{text}",
        subtypes.join("\n")
    )
}

/// Lowercased first word of a model reply, stripped of surrounding punctuation.
fn normalize_label(reply: &str) -> String {
    let is_label_char = |c: char| c.is_alphanumeric() || c == '_';
    reply
        .trim_matches(|c: char| !is_label_char(c))
        .split_whitespace()
        .next()
        .map(|word| word.trim_matches(|c: char| !is_label_char(c)).to_lowercase())
        .unwrap_or_default()
}

/// Longest prefix of `text` with at most `max_chars` characters that ends on a word boundary.
///
/// A single word longer than the budget is cut mid-word; there is no boundary to honor.
fn truncate_at_word(text: &str, max_chars: usize) -> &str {
    let Some((cut, next)) = text.char_indices().nth(max_chars) else {
        return text;
    };
    let prefix = &text[..cut];
    if next.is_whitespace() {
        return prefix.trim_end();
    }
    match prefix.rfind(char::is_whitespace) {
        Some(boundary) => prefix[..boundary].trim_end(),
        None => prefix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, model};
    use crate::resources::Capability;

    fn classifier(backend: Arc<FakeBackend>, max_input_tokens: usize) -> DocumentTypeClassifier {
        DocumentTypeClassifier::new(
            backend,
            model(Capability::Classifier, max_input_tokens),
            Taxonomy::builtin(),
        )
    }

    fn scripted(type_reply: &'static str, subtype_reply: &'static str) -> Arc<FakeBackend> {
        Arc::new(FakeBackend::new(move |request| {
            if request.prompt.starts_with("You are an NLP Engineer") {
                Ok(type_reply.to_string())
            } else {
                Ok(subtype_reply.to_string())
            }
        }))
    }

    #[test]
    fn long_text_is_truncated_at_a_word_boundary() {
        let text = "lorem ipsum dolor sit amet consectetur ".repeat(300);
        let text = &text[..10_000];
        let truncated = truncate_at_word(text, 512 * 4);

        assert!(truncated.chars().count() <= 2048);
        assert!(truncated.len() > 2000);
        let rest = &text[truncated.len()..];
        assert!(rest.starts_with(char::is_whitespace));
        assert!(!truncated.ends_with(char::is_whitespace));
    }

    #[test]
    fn short_text_is_left_alone() {
        assert_eq!(truncate_at_word("two words", 100), "two words");
        assert_eq!(truncate_at_word("abcdefgh", 4), "abcd");
        assert_eq!(truncate_at_word("ab cd ef", 5), "ab cd");
    }

    #[test]
    fn labels_are_normalized() {
        assert_eq!(normalize_label("  Legal.\n"), "legal");
        assert_eq!(normalize_label("**content_creation** because"), "content_creation");
        assert_eq!(normalize_label("* finance"), "finance");
        assert_eq!(normalize_label("..."), "");
    }

    #[tokio::test]
    async fn classifies_type_then_subtype() {
        let backend = scripted("Legal", "NDA.");
        let classification = classifier(backend.clone(), 512)
            .classify("This agreement keeps secrets secret.")
            .await;
        assert_eq!(classification.doc_type, "legal");
        assert_eq!(classification.doc_subtype, "nda");

        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("* content_creation\n* other"));
        assert!(prompts[1].starts_with("For a legal document"));
        assert!(prompts[1].contains("patent\nother\n"));
    }

    #[tokio::test]
    async fn out_of_taxonomy_type_falls_back_to_other() {
        let backend = scripted("poetry", "sonnet");
        let classification = classifier(backend.clone(), 512).classify("Roses are red").await;
        assert_eq!(classification, Classification {
            doc_type: OTHER.to_string(),
            doc_subtype: OTHER.to_string(),
        });
        assert!(backend.prompts()[1].starts_with("For a other document"));
    }

    #[tokio::test]
    async fn unlisted_subtype_falls_back_to_other() {
        let classification = classifier(scripted("finance", "invoice"), 512)
            .classify("Amount due: 42")
            .await;
        assert_eq!(classification.to_string(), "finance/other");
    }

    #[tokio::test]
    async fn backend_failure_yields_unknown() {
        let classification = classifier(Arc::new(FakeBackend::failing()), 512)
            .classify("anything")
            .await;
        assert_eq!(classification, Classification::unknown());
    }

    #[tokio::test]
    async fn empty_text_skips_the_model() {
        let backend = Arc::new(FakeBackend::constant("legal"));
        let classification = classifier(backend.clone(), 512).classify("   ").await;
        assert_eq!(classification, Classification::unknown());
        assert_eq!(backend.generate_calls(), 0);
    }

    #[tokio::test]
    async fn prompt_carries_truncated_text() {
        let backend = scripted("hr", "cv");
        let text = "word ".repeat(100);
        classifier(backend.clone(), 10).classify(&text).await;
        let prompt = &backend.prompts()[0];
        let content = prompt
            .rsplit("categories above:\n")
            .next()
            .expect("content");
        assert!(content.chars().count() <= 40);
        assert!(content.ends_with("word"));
    }
}
