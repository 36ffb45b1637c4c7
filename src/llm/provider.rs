//! Provider-specific endpoints.

use super::ModelProvider;

impl ModelProvider {
    /// Public API base URL.
    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    /// Environment variable that overrides [`Self::default_base_url`].
    #[must_use]
    pub fn base_url_env(self) -> &'static str {
        match self {
            Self::Gemini => "GEMINI_BASE_URL",
            Self::OpenRouter => "OPENROUTER_BASE_URL",
        }
    }

    /// Build the streaming endpoint for `model`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL (a trailing slash is tolerated)
    /// * `model` - Model id; Gemini accepts it with or without `models/`
    #[must_use]
    pub fn build_stream_url(self, base_url: &str, model: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Self::Gemini => {
                let model = model.trim_start_matches("models/");
                format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
            }
            Self::OpenRouter => format!("{base}/chat/completions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_gemini() {
        let url = ModelProvider::Gemini.build_stream_url(
            ModelProvider::Gemini.default_base_url(),
            "models/gemini-2.5-flash",
        );
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn test_build_url_openrouter() {
        let url = ModelProvider::OpenRouter.build_stream_url("https://openrouter.ai/api/v1/", "openai/gpt-4o");
        assert_eq!(url, "https://openrouter.ai/api/v1/chat/completions");
    }

    #[test]
    fn test_key_and_url_env_names() {
        assert_eq!(ModelProvider::Gemini.api_key_env(), "GOOGLE_API_KEY");
        assert_eq!(ModelProvider::OpenRouter.api_key_env(), "OPENROUTER_API_KEY");
        assert_eq!(ModelProvider::OpenRouter.base_url_env(), "OPENROUTER_BASE_URL");
    }
}
