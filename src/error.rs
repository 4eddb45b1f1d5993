use thiserror::Error;

/// Failures of the classifier itself. Anomalies such as duplicate live
/// activations are reported as data, never through this type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("data erroneous: {0}")]
    InputShape(String),

    #[error("no data available")]
    EmptyTable,
}

impl ClassifyError {
    pub fn shape(message: impl Into<String>) -> Self {
        Self::InputShape(message.into())
    }

    pub fn at_row(row: usize, message: impl std::fmt::Display) -> Self {
        Self::InputShape(format!("row {}: {message}", row + 1))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("study duration must be a positive number of days, got {0:?}")]
    InvalidDuration(String),

    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("sensor {0:?} is not part of the sensor catalog")]
    UnknownSensor(String),

    #[error("study document has an empty name")]
    MissingName,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_errors_are_one_based() {
        let err = ClassifyError::at_row(0, "bad timestamp");
        assert_eq!(err.to_string(), "data erroneous: row 1: bad timestamp");
    }
}
