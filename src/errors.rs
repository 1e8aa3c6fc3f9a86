use std::error;
use std::fmt;

use crate::storage::node::{MAX_KEY_SIZE, MAX_VAL_SIZE};

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    NotFound,
    KeyTooLarge(usize),
    ValueTooLarge(usize),
    Corrupt(String),
    Storage(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error. {}", e),
            Error::NotFound => write!(f, "Key not found."),
            Error::KeyTooLarge(n) => {
                write!(f, "Key is too large ({} bytes, max {}).", n, MAX_KEY_SIZE)
            }
            Error::ValueTooLarge(n) => {
                write!(f, "Value is too large ({} bytes, max {}).", n, MAX_VAL_SIZE)
            }
            Error::Corrupt(msg) => write!(f, "Corrupt database. {}", msg),
            Error::Storage(msg) => write!(f, "Storage error. {}", msg),
        }
    }
}

impl error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

/// Builds a message-carrying `Error` variant from a format string:
/// `err!(Storage, "page {} not found", page_num)`.
macro_rules! err {
    ($variant:ident, $($arg:tt)*) => {
        $crate::errors::Error::$variant(format!($($arg)*))
    };
}
