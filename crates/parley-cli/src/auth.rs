//! Authentication service client
//!
//! Logs in or registers against the chat backend's HTTP API and turns a
//! successful login into an [`Identity`] for the session.

use parley_core::{ChatError, Identity, Result};
use reqwest::header::SET_COOKIE;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Cookie the backend sets alongside (or instead of) the token in the body
const ACCESS_COOKIE: &str = "access";

/// Account details returned by the service
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct Login {
    pub user: AuthUser,
    pub token: String,
}

impl Login {
    pub fn identity(&self) -> Identity {
        Identity::new(self.user.id.clone(), self.token.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
struct LoginData {
    #[serde(default)]
    user: Option<AuthUser>,
    #[serde(default)]
    token: Option<String>,
}

/// Either `{status, data: {user, token}}` or the flat `{success, user}` form
#[derive(Debug, Default, Deserialize)]
struct LoginBody {
    #[serde(default)]
    data: Option<LoginData>,
    #[serde(default)]
    user: Option<AuthUser>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RegisterData {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RegisterBody {
    #[serde(default)]
    data: Option<RegisterData>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for `{api_url}/login` and `{api_url}/register`
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    api_url: String,
}

impl AuthClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Login> {
        tracing::debug!("Logging in as {}", email);

        let response = self
            .http
            .post(self.url("login"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| ChatError::Auth(format!("Login request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let cookie_token = access_cookie(&response);
        let body: LoginBody = response
            .json()
            .await
            .map_err(|e| ChatError::Auth(format!("Unexpected login response: {e}")))?;

        let data = body.data.unwrap_or_default();
        let user = data
            .user
            .or(body.user)
            .ok_or_else(|| ChatError::Auth("Login response has no user".to_string()))?;
        let token = data
            .token
            .or(body.token)
            .or(cookie_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ChatError::Auth("Login response has no token".to_string()))?;

        tracing::info!("Logged in as {} ({})", user.username, user.id);
        Ok(Login { user, token })
    }

    /// Create an account. The service issues no token here; log in afterwards.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<Option<String>> {
        tracing::debug!("Registering {}", email);

        let response = self
            .http
            .post(self.url("register"))
            .json(&json!({ "username": username, "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| ChatError::Auth(format!("Register request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let body: RegisterBody = response.json().await.unwrap_or_default();
        let user_id = body.data.and_then(|data| data.user_id);
        tracing::info!("Registered {}", username);

        Ok(user_id)
    }
}

fn access_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            (name.trim() == ACCESS_COOKIE).then(|| value.trim().to_string())
        })
}

async fn rejected(response: Response) -> ChatError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    ChatError::Auth(error_message(status, &text))
}

/// Error text from a JSON error body, a plain-text body, or the status
fn error_message(status: StatusCode, body: &str) -> String {
    let detail = match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.message.or(parsed.error),
        Err(_) => Some(body.trim().to_string()).filter(|text| !text.is_empty()),
    };

    match detail {
        Some(detail) => format!("{detail} ({status})"),
        None => status.to_string(),
    }
}
