use crate::error::ApiError;

/// Maximum text length for ask requests
const MAX_TEXT_LENGTH: usize = 5000;
/// Maximum system prompt length
const MAX_PROMPT_LENGTH: usize = 4000;
/// Maximum session identifier length
const MAX_SESSION_ID_LENGTH: usize = 64;

/// Validate an artifact identifier taken from a URL path
pub fn validate_artifact_id(artifact_id: &str) -> Result<(), ApiError> {
    if !tts_core::is_valid_artifact_id(artifact_id) {
        return Err(ApiError::InvalidInput(format!(
            "Invalid artifact id: {}",
            artifact_id
        )));
    }
    Ok(())
}

/// Validate session ID format
pub fn validate_session_id(session_id: &str) -> Result<(), ApiError> {
    if session_id.is_empty() {
        return Err(ApiError::InvalidInput(
            "Session ID cannot be empty".to_string(),
        ));
    }
    if session_id.len() > MAX_SESSION_ID_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Session ID too long (max {} characters)",
            MAX_SESSION_ID_LENGTH
        )));
    }
    // Only alphanumeric characters, hyphens and underscores
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApiError::InvalidInput(
            "Session ID can only contain alphanumeric characters, hyphens and underscores"
                .to_string(),
        ));
    }
    Ok(())
}

/// Validate a system prompt supplied by a client
pub fn validate_system_prompt(prompt: &str) -> Result<(), ApiError> {
    if prompt.trim().is_empty() {
        return Err(ApiError::InvalidInput(
            "System prompt cannot be empty".to_string(),
        ));
    }
    if prompt.chars().count() > MAX_PROMPT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "System prompt too long (max {} characters)",
            MAX_PROMPT_LENGTH
        )));
    }
    Ok(())
}

/// Validate the text and system prompt of an ask request
pub fn validate_ask_request(
    user_text: Option<&str>,
    system_content: Option<&str>,
) -> Result<(), ApiError> {
    let text = user_text.map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return Err(ApiError::InvalidInput("Missing userText".to_string()));
    }
    if text.chars().count() > MAX_TEXT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Text too long (max {} characters)",
            MAX_TEXT_LENGTH
        )));
    }
    match system_content {
        Some(prompt) => validate_system_prompt(prompt),
        None => Err(ApiError::InvalidInput("Missing systemContent".to_string())),
    }
}
