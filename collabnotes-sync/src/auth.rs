//! Identity resolution and advisory access checks for the sync channel.
//!
//! The collaboration transport deliberately fails open: a missing, malformed,
//! or expired credential downgrades the connection to the anonymous identity
//! instead of rejecting it. Strict authentication lives in the REST API that
//! issues the tokens; this layer only resolves who is editing so presence and
//! persistence can attribute changes.
//!
//! The relational user store is an external collaborator, reached through the
//! [`UserDirectory`] and [`NoteAccess`] traits. The in-memory implementations
//! here back tests and standalone deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Sentinel user id for unauthenticated connections.
pub const ANONYMOUS_USER_ID: &str = "anonymous";

/// Sentinel display name for unauthenticated connections.
pub const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";

/// Resolved identity of a connection. Immutable after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    /// The anonymous fallback identity.
    pub fn anonymous() -> Self {
        Self {
            user_id: ANONYMOUS_USER_ID.to_string(),
            display_name: ANONYMOUS_DISPLAY_NAME.to_string(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == ANONYMOUS_USER_ID
    }
}

/// JWT claims carried by bearer credentials.
///
/// Tokens are issued by the REST API with the same shared secret; this
/// service only verifies them.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Username at issue time
    #[serde(default)]
    pub username: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at time (Unix timestamp)
    pub iat: u64,
}

/// Mint a bearer token for the given user.
///
/// The production issuer lives in the REST API; this helper exists for tests
/// and operator tooling.
pub fn mint_token(
    secret: &str,
    user_id: &str,
    username: &str,
    ttl_secs: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let claims = Claims {
        sub: user_id.to_string(),
        username: Some(username.to_string()),
        exp: now.saturating_add_signed(ttl_secs),
        iat: now,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// A user record as seen by the sync server.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub active: bool,
}

impl UserRecord {
    /// Preferred display name: explicit display name, else the username.
    pub fn preferred_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// Lookup interface into the user store.
pub trait UserDirectory: Send + Sync {
    fn find_user(&self, user_id: &str) -> Option<UserRecord>;
}

/// Read-permission interface into the note store.
pub trait NoteAccess: Send + Sync {
    fn can_read(&self, user_id: &str, note_id: &str) -> bool;
}

/// In-memory user directory.
#[derive(Default)]
pub struct StaticUserDirectory {
    users: HashMap<String, UserRecord>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: UserRecord) -> Self {
        self.users.insert(user.id.clone(), user);
        self
    }
}

impl UserDirectory for StaticUserDirectory {
    fn find_user(&self, user_id: &str) -> Option<UserRecord> {
        self.users.get(user_id).cloned()
    }
}

/// Access policy that grants every read.
pub struct AllowAll;

impl NoteAccess for AllowAll {
    fn can_read(&self, _user_id: &str, _note_id: &str) -> bool {
        true
    }
}

/// In-memory access policy keyed by `(user_id, note_id)` grants.
#[derive(Default)]
pub struct StaticNoteAccess {
    grants: HashMap<(String, String), bool>,
}

impl StaticNoteAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user_id: &str, note_id: &str) -> Self {
        self.grants
            .insert((user_id.to_string(), note_id.to_string()), true);
        self
    }
}

impl NoteAccess for StaticNoteAccess {
    fn can_read(&self, user_id: &str, note_id: &str) -> bool {
        self.grants
            .get(&(user_id.to_string(), note_id.to_string()))
            .copied()
            .unwrap_or(false)
    }
}

/// Resolves connection identities and performs the advisory read check.
pub struct AuthGate {
    decoding_key: DecodingKey,
    directory: Arc<dyn UserDirectory>,
    access: Arc<dyn NoteAccess>,
}

impl AuthGate {
    pub fn new(
        secret: &str,
        directory: Arc<dyn UserDirectory>,
        access: Arc<dyn NoteAccess>,
    ) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            directory,
            access,
        }
    }

    /// Resolve an identity from an optional bearer credential.
    ///
    /// Infallible: every failure path downgrades to [`Identity::anonymous`].
    pub fn authenticate(&self, token: Option<&str>) -> Identity {
        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return Identity::anonymous(),
        };

        let claims = match decode::<Claims>(token, &self.decoding_key, &Validation::default()) {
            Ok(data) => data.claims,
            Err(e) => {
                log::debug!("Token verification failed, continuing as anonymous: {e}");
                return Identity::anonymous();
            }
        };

        match self.directory.find_user(&claims.sub) {
            Some(user) if user.active => Identity {
                user_id: user.id.clone(),
                display_name: user.preferred_name().to_string(),
            },
            Some(user) => {
                log::debug!("User {} is inactive, continuing as anonymous", user.id);
                Identity::anonymous()
            }
            None => {
                log::debug!(
                    "Token subject {} not found in directory, continuing as anonymous",
                    claims.sub
                );
                Identity::anonymous()
            }
        }
    }

    /// Advisory read-permission check at room-join time.
    ///
    /// A denial is logged but does not block the join; callers proceed either
    /// way. Anonymous identities skip the lookup entirely.
    pub fn authorize_read(&self, identity: &Identity, note_id: &str) -> bool {
        if identity.is_anonymous() {
            return true;
        }

        let allowed = self.access.can_read(&identity.user_id, note_id);
        if !allowed {
            log::warn!(
                "User {} joined note {} without explicit read permission",
                identity.user_id,
                note_id
            );
        }
        allowed
    }
}
