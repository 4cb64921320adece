use std::{fmt, sync::Arc};

use crate::{
    core::error::{DispatchError, ErrorKind},
    ports::http_client::HttpClientError,
};

/// Predicate deciding whether a translation rule applies.
pub type ErrorPredicate = Arc<dyn Fn(&HttpClientError) -> bool + Send + Sync>;

/// Maps transport faults onto [`ErrorKind`]s.
///
/// Rules are checked in order and the first match wins. Rules added with
/// [`ErrorTranslator::register`] are checked before the defaults; anything
/// left unmatched becomes [`ErrorKind::UnknownDispatchError`].
#[derive(Clone)]
pub struct ErrorTranslator {
    custom: Vec<(ErrorPredicate, ErrorKind)>,
    defaults: Vec<(ErrorPredicate, ErrorKind)>,
}

impl Default for ErrorTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorTranslator {
    pub fn new() -> Self {
        fn rule(
            predicate: fn(&HttpClientError) -> bool,
            kind: ErrorKind,
        ) -> (ErrorPredicate, ErrorKind) {
            (Arc::new(predicate), kind)
        }
        let defaults = vec![
            rule(HttpClientError::is_timeout, ErrorKind::RequestTimedOut),
            rule(HttpClientError::is_canceled, ErrorKind::RequestCanceled),
            rule(HttpClientError::is_connection, ErrorKind::ConnectionFailure),
            rule(HttpClientError::is_circuit_open, ErrorKind::CircuitOpen),
        ];
        Self {
            custom: Vec::new(),
            defaults,
        }
    }

    /// Add a rule ahead of the defaults, after earlier custom rules.
    pub fn register<F>(&mut self, predicate: F, kind: ErrorKind)
    where
        F: Fn(&HttpClientError) -> bool + Send + Sync + 'static,
    {
        self.custom.push((Arc::new(predicate), kind));
    }

    pub fn kind_of(&self, error: &HttpClientError) -> ErrorKind {
        self.custom
            .iter()
            .chain(self.defaults.iter())
            .find(|(predicate, _)| predicate(error))
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::UnknownDispatchError)
    }

    pub fn translate(&self, error: HttpClientError) -> DispatchError {
        let kind = self.kind_of(&error);
        tracing::debug!(kind = %kind, error = %error, "Translated downstream error");
        DispatchError::new(kind, error.to_string())
    }
}

impl fmt::Debug for ErrorTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorTranslator")
            .field("custom", &self.custom.iter().map(|(_, kind)| kind).collect::<Vec<_>>())
            .field("defaults", &self.defaults.iter().map(|(_, kind)| kind).collect::<Vec<_>>())
            .finish()
    }
}
