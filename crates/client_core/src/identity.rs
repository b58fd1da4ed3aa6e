use shared::domain::UserId;

/// Current-user identity and bearer credential.
///
/// Constructed by the embedder and passed by reference into the channel and
/// controller constructors; the engine never discovers identity through a
/// shared bus.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub token: String,
}

impl Identity {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}
