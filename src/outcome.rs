//! Result of an operation that may succeed at reduced fidelity.
//!
//! Page extraction and streamed generation never fail outright: when the
//! model call breaks they substitute a lower-fidelity value and carry on.
//! [`Outcome`] keeps that distinction visible to callers instead of leaving
//! them to infer it from empty fields.

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The operation ran as intended.
    Complete(T),
    /// The operation hit an internal failure and produced a fallback value.
    /// The string is the human-readable reason.
    Degraded(T, String),
}

impl<T> Outcome<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded(..))
    }

    pub fn value(&self) -> &T {
        match self {
            Outcome::Complete(v) | Outcome::Degraded(v, _) => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Outcome::Complete(v) | Outcome::Degraded(v, _) => v,
        }
    }

    pub fn degradation(&self) -> Option<&str> {
        match self {
            Outcome::Complete(_) => None,
            Outcome::Degraded(_, reason) => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Complete(v) => Outcome::Complete(f(v)),
            Outcome::Degraded(v, reason) => Outcome::Degraded(f(v), reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_keeps_value_and_reason() {
        let o = Outcome::Degraded(3, "timeout".to_string());
        assert!(o.is_degraded());
        assert_eq!(*o.value(), 3);
        assert_eq!(o.degradation(), Some("timeout"));
        assert_eq!(o.map(|v| v * 2).into_value(), 6);
    }

    #[test]
    fn complete_has_no_reason() {
        let o = Outcome::Complete("ok");
        assert!(!o.is_degraded());
        assert_eq!(o.degradation(), None);
    }
}
