use std::env;
use std::fmt::Debug;

#[derive(Debug)]
pub struct Error {
    pub code: i32,
    pub message: String,
}

impl From<env::VarError> for Error {
    fn from(err: env::VarError) -> Self {
        env_var_error(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        gateway_error(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        parse_error(err)
    }
}

pub fn env_var_error(_: env::VarError) -> Error {
    Error {
        code: 1,
        message: "environment variable error".into(),
    }
}

pub fn gateway_error<T: Debug>(_: T) -> Error {
    Error {
        code: 2,
        message: "gateway error".into(),
    }
}

pub fn parse_error<T: Debug>(_: T) -> Error {
    Error {
        code: 3,
        message: "parse error".into(),
    }
}

pub fn transport_error() -> Error {
    Error {
        code: 4,
        message: "transport error".into(),
    }
}

pub fn storage_error<T: Debug>(_: T) -> Error {
    Error {
        code: 5,
        message: "storage error".into(),
    }
}

pub fn invalid_invocation_error() -> Error {
    Error {
        code: 100,
        message: "invalid invocation".into(),
    }
}

pub fn validation_error() -> Error {
    Error {
        code: 101,
        message: "invalid input".into(),
    }
}
