use std::sync::atomic::{AtomicUsize, Ordering};

use jsonwebtoken::{decode, DecodingKey, Validation};
use parking_lot::Mutex;
use serde::Deserialize;
use shared::domain::UserId;
use tracing::{debug, info};

/// The engine's view of the signed-in user. The credential store behind it is
/// owned by the embedding application.
pub trait SessionHandle: Send + Sync {
    fn credential(&self) -> Option<String>;
    fn subject_id(&self) -> Option<UserId>;
    /// Drops the credential. Navigation or UI reactions are the caller's job.
    fn invalidate(&self);

    fn has_credential(&self) -> bool {
        self.credential().is_some()
    }
}

#[derive(Debug, Deserialize)]
struct SubjectClaims {
    sub: Option<String>,
}

/// Reads the `sub` claim of a JWT without checking its signature or expiry;
/// the backend is the authority on validity. Opaque tokens yield `None`.
pub fn subject_from_token(token: &str) -> Option<UserId> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    match decode::<SubjectClaims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => data
            .claims
            .sub
            .filter(|sub| !sub.trim().is_empty())
            .map(UserId::from),
        Err(err) => {
            debug!("session: token carries no readable subject: {err}");
            None
        }
    }
}

struct Credentials {
    token: String,
    subject: Option<UserId>,
}

type InvalidationHook = Box<dyn Fn() + Send + Sync>;

pub struct StaticSession {
    credentials: Mutex<Option<Credentials>>,
    invalidations: AtomicUsize,
    on_invalidate: Option<InvalidationHook>,
}

impl StaticSession {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let subject = subject_from_token(&token);
        Self {
            credentials: Mutex::new(Some(Credentials { token, subject })),
            invalidations: AtomicUsize::new(0),
            on_invalidate: None,
        }
    }

    /// Overrides the derived subject, for backends that hand out opaque tokens.
    pub fn with_subject(self, subject: impl Into<UserId>) -> Self {
        if let Some(credentials) = self.credentials.lock().as_mut() {
            credentials.subject = Some(subject.into());
        }
        self
    }

    pub fn on_invalidate(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_invalidate = Some(Box::new(hook));
        self
    }

    pub fn replace_credential(&self, token: impl Into<String>) {
        let token = token.into();
        let subject = subject_from_token(&token);
        *self.credentials.lock() = Some(Credentials { token, subject });
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl SessionHandle for StaticSession {
    fn credential(&self) -> Option<String> {
        self.credentials
            .lock()
            .as_ref()
            .map(|credentials| credentials.token.clone())
    }

    fn subject_id(&self) -> Option<UserId> {
        self.credentials
            .lock()
            .as_ref()
            .and_then(|credentials| credentials.subject.clone())
    }

    fn invalidate(&self) {
        self.credentials.lock().take();
        let count = self.invalidations.fetch_add(1, Ordering::SeqCst) + 1;
        info!(invalidations = count, "session: credential invalidated");
        if let Some(hook) = &self.on_invalidate {
            hook();
        }
    }
}
