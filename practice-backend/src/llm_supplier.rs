use futures::future::{BoxFuture, FutureExt};
use practice_engine::{CandidateQuestion, CandidateSupplier, GenerateRequest, SupplierError};
use serde::{Deserialize, Serialize};
use tysm::chat_completions::ChatClient;

const SYSTEM_PROMPT: &str = r#"You write multiple-choice practice questions for high-school students preparing for a national standardized exam.

Every question must have between 3 and 5 options labeled "A", "B", "C", ... with exactly one correct answer. Put the label of the correct option in "correct_option". Keep prompts self-contained: no images, no references to other questions.

Write the explanation as if speaking directly to the student, in one or two sentences, in the same language as the question. Questions for the English area are written in English; every other area is written in Spanish.

Respond with JSON."#;

#[derive(Debug, Serialize, Deserialize, schemars::JsonSchema)]
struct GeneratedBatch {
    questions: Vec<CandidateQuestion>,
}

/// Generates candidate questions with a chat model.
pub struct LlmSupplier {
    client: ChatClient,
}

impl LlmSupplier {
    pub fn from_env(model: &str, url: Option<String>) -> anyhow::Result<Self> {
        let client = ChatClient::from_env(model)
            .map_err(|e| anyhow::anyhow!("failed to create chat client for {model}: {e:?}"))?;
        let client = match url {
            Some(url) => client.with_url(url),
            None => client,
        };
        Ok(Self { client })
    }
}

fn user_prompt(request: &GenerateRequest) -> String {
    let subtopics = if request.subtopics.is_empty() {
        "any subtopic of the area".to_string()
    } else {
        request.subtopics.join(", ")
    };
    let mut prompt = format!(
        "Area: {area}\nSubtopics: {subtopics}\nDifficulty: {difficulty}\nNumber of questions: {count}",
        area = request.area,
        difficulty = request.difficulty.as_str(),
        count = request.count,
    );
    if let Some(style) = request.style_hint {
        prompt.push_str(&format!(
            "\nThe student learns best with a {} style; favor framings that suit it.",
            style.as_str()
        ));
    }
    if let Some(institution) = &request.institution {
        prompt.push_str(&format!("\nInstitution: {institution}"));
    }
    prompt
}

impl CandidateSupplier for LlmSupplier {
    fn generate(
        &self,
        request: GenerateRequest,
    ) -> BoxFuture<'_, Result<Vec<CandidateQuestion>, SupplierError>> {
        async move {
            if request.count == 0 {
                return Ok(Vec::new());
            }
            let batch: GeneratedBatch = self
                .client
                .chat_with_system_prompt(SYSTEM_PROMPT, user_prompt(&request))
                .await
                .inspect_err(|e| log::warn!("Question generation failed: {e:?}"))
                .map_err(|e| SupplierError::Unavailable(format!("{e:?}")))?;

            let mut questions = batch.questions;
            log::debug!(
                "Generated {} {} questions (asked for {})",
                questions.len(),
                request.area,
                request.count
            );
            questions.truncate(request.count);
            Ok(questions)
        }
        .boxed()
    }
}
