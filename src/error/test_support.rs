use super::{CommunicationError, ConfigError, ConsoleError, EngineError};

impl From<&'static str> for ConfigError {
    fn from(message: &'static str) -> Self {
        ConfigError::TestExpectation { message }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for CommunicationError {
    fn from(message: &'static str) -> Self {
        CommunicationError::TestExpectation { message }
    }
}

impl From<String> for CommunicationError {
    fn from(value: String) -> Self {
        CommunicationError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for EngineError {
    fn from(message: &'static str) -> Self {
        EngineError::TestExpectation { message }
    }
}

impl From<String> for EngineError {
    fn from(value: String) -> Self {
        EngineError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ConsoleError {
    fn from(message: &'static str) -> Self {
        ConsoleError::TestExpectation { message }
    }
}

impl From<String> for ConsoleError {
    fn from(value: String) -> Self {
        ConsoleError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}
