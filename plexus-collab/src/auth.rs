//! Authentication hook for the AUTH handshake.

use std::collections::HashMap;

pub use crate::protocol::Role;
use crate::protocol::AuthRequest;

/// Identity granted to an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    InvalidToken,
    EmptyUserId,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidToken => write!(f, "Invalid token"),
            AuthError::EmptyUserId => write!(f, "Missing user id"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Decides whether an AUTH request is admitted, and with which role.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &AuthRequest) -> Result<Grant, AuthError>;
}

/// Admits everyone as an editor. For local development and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, request: &AuthRequest) -> Result<Grant, AuthError> {
        if request.user_id.is_empty() {
            return Err(AuthError::EmptyUserId);
        }
        Ok(Grant {
            user_id: request.user_id.clone(),
            user_name: request.user_name.clone(),
            role: Role::Editor,
        })
    }
}

/// Fixed token table. A token binds to a user id and a role; the user id
/// claimed in the request must match.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, (String, Role)>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>, role: Role) -> Self {
        self.tokens.insert(token.into(), (user_id.into(), role));
        self
    }

    /// Parse `token=user:role` pairs separated by commas. Entries that do
    /// not parse are skipped with a warning.
    pub fn parse(spec: &str) -> Self {
        let mut tokens = Self::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let parsed = pair.split_once('=').and_then(|(token, rest)| {
                let (user, role) = rest.split_once(':')?;
                let role = match role {
                    "owner" => Role::Owner,
                    "editor" => Role::Editor,
                    "viewer" => Role::Viewer,
                    _ => return None,
                };
                Some((token.to_string(), user.to_string(), role))
            });
            match parsed {
                Some((token, user, role)) => tokens = tokens.with_token(token, user, role),
                None => log::warn!("Ignoring malformed token entry '{pair}'"),
            }
        }
        tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, request: &AuthRequest) -> Result<Grant, AuthError> {
        match self.tokens.get(&request.token) {
            Some((user_id, role)) if *user_id == request.user_id => Ok(Grant {
                user_id: user_id.clone(),
                user_name: request.user_name.clone(),
                role: *role,
            }),
            _ => Err(AuthError::InvalidToken),
        }
    }
}
