//! Error taxonomy for keel-core.

/// Errors from credential interpolation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredsError {
    #[error("undefined vars: {}", .0.join(", "))]
    UndefinedVariables(Vec<String>),

    #[error("variable {name} has no field {field}")]
    MissingField { name: String, field: String },

    #[error("credential lookup for {name} failed: {reason}")]
    Lookup { name: String, reason: String },
}

/// Errors from digest and serialization helpers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("NaN/Infinity not permitted in canonical JSON")]
    NonFiniteNumber,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("credentials: {0}")]
    Creds(#[from] CredsError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_variables_lists_every_name() {
        let err = CredsError::UndefinedVariables(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "undefined vars: a, b");
    }

    #[test]
    fn core_error_wraps_creds() {
        let err: CoreError = CredsError::MissingField {
            name: "aws".into(),
            field: "key".into(),
        }
        .into();
        assert!(err.to_string().contains("aws has no field key"));
    }
}
