use std::fmt::Display;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Whether a user fetch is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Loading,
}

#[derive(Debug)]
struct Inner<U> {
    status: SessionStatus,
    user: Option<U>,
}

/// Puts the session back to `Idle` when a fetch completes or is dropped.
struct LoadingGuard<'a, U> {
    session: &'a UserSession<U>,
}

impl<U> Drop for LoadingGuard<'_, U> {
    fn drop(&mut self) {
        self.session.lock().status = SessionStatus::Idle;
    }
}

/// Fetch-and-cache holder for the current user.
///
/// The fetch itself is supplied by the caller, so any transport works.
#[derive(Debug)]
pub struct UserSession<U> {
    inner: Mutex<Inner<U>>,
}

impl<U> Default for UserSession<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U> UserSession<U> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: SessionStatus::Idle,
                user: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<U>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn set_user(&self, user: U) {
        self.lock().user = Some(user);
    }

    pub fn clear(&self) {
        self.lock().user = None;
    }
}

impl<U: Clone> UserSession<U> {
    pub fn user(&self) -> Option<U> {
        self.lock().user.clone()
    }

    /// Run `fetch`, caching its result on success.
    ///
    /// Status is `Loading` for the duration and `Idle` afterwards, also when
    /// the returned future is dropped early. On failure the previously cached
    /// user is kept.
    pub async fn fetch_with<Fut, E>(&self, fetch: Fut) -> Result<U, E>
    where
        Fut: Future<Output = Result<U, E>>,
        E: Display,
    {
        self.lock().status = SessionStatus::Loading;
        let guard = LoadingGuard { session: self };
        let result = fetch.await;

        match &result {
            Ok(user) => self.lock().user = Some(user.clone()),
            Err(e) => warn!(error = %e, "user fetch failed"),
        }
        drop(guard);
        result
    }
}
