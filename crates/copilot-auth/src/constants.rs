//! Copilot client identity and on-disk layout constants
//!
//! The header values identify the VS Code Copilot Chat extension. They are not
//! secrets; the upstream API rejects requests that don't carry them.

/// Suffix shared by every persisted token file (`<id>.copilot_token`).
pub const TOKEN_SUFFIX: &str = "copilot_token";

/// Subdirectory of the tokens directory that holds exhausted tokens.
pub const EXHAUSTED_DIR_NAME: &str = "QuotaExhausted";

/// Endpoint that trades a GitHub OAuth token for a short-lived Copilot token.
pub const EXCHANGE_ENDPOINT: &str = "https://api.github.com/copilot_internal/v2/token";

/// Chat API base used when the exchange payload doesn't announce one.
pub const DEFAULT_API_URL: &str = "https://api.githubcopilot.com";

pub const COPILOT_INTEGRATION_ID: &str = "vscode-chat";
pub const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.23.2";
pub const EDITOR_VERSION: &str = "vscode/1.96.3";
pub const USER_AGENT: &str = "GitHubCopilotChat/0.23.2";
pub const API_VERSION: &str = "2024-12-15";

/// `openai-intent` value for chat completions.
pub const OPENAI_INTENT: &str = "conversation-panel";
/// `openai-intent` value for model listing.
pub const OPENAI_INTENT_MODELS: &str = "model-access";
pub const OPENAI_ORGANIZATION: &str = "github-copilot";
