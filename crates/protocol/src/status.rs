/// How a response status should be treated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx.
    Success,
    /// 412: the `If-Match` (or `If-None-Match`) condition did not hold.
    PreconditionFailed,
    /// 408, 429 and 5xx: worth retrying.
    Transient,
    /// Any other status. Fatal, surfaced unchanged.
    Service,
}

impl StatusClass {
    /// Classifies an HTTP status code.
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            412 => Self::PreconditionFailed,
            408 | 429 => Self::Transient,
            500..=599 => Self::Transient,
            _ => Self::Service,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(StatusClass::of(200), StatusClass::Success);
        assert_eq!(StatusClass::of(206), StatusClass::Success);
        assert_eq!(StatusClass::of(412), StatusClass::PreconditionFailed);
        assert_eq!(StatusClass::of(409), StatusClass::Service);
        assert_eq!(StatusClass::of(429), StatusClass::Transient);
        assert_eq!(StatusClass::of(503), StatusClass::Transient);
        assert_eq!(StatusClass::of(404), StatusClass::Service);
        assert_eq!(StatusClass::of(400), StatusClass::Service);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(StatusClass::of(500).is_retryable());
        assert!(StatusClass::of(408).is_retryable());
        assert!(!StatusClass::of(412).is_retryable());
        assert!(!StatusClass::of(403).is_retryable());
    }
}
