/// Failure reported by an external collaborator (analysis service, durable
/// store, sheet sink, transport).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Network or upstream API failure; safe to try again.
    #[error("{service} unavailable: {message}")]
    Transient {
        service: &'static str,
        message: String,
    },
    /// The collaborator answered, but the body could not be understood.
    #[error("{service} returned a malformed response: {message}")]
    MalformedResponse {
        service: &'static str,
        message: String,
    },
    /// A required credential or endpoint is missing.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    /// The collaborator refused the request; retrying will not help.
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },
}

impl ServiceError {
    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Transient {
            service,
            message: message.into(),
        }
    }

    pub fn malformed(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::MalformedResponse {
            service,
            message: message.into(),
        }
    }

    pub fn rejected(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Rejected {
            service,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient { .. })
    }

    pub fn service(&self) -> &'static str {
        match self {
            ServiceError::Transient { service, .. }
            | ServiceError::MalformedResponse { service, .. }
            | ServiceError::Rejected { service, .. } => service,
            ServiceError::NotConfigured(service) => service,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
