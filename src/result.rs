use simple_error::SimpleError;
use std::result;

/// Crate-wide result; every fallible operation reports a human readable error.
pub type Result<T> = result::Result<T, SimpleError>;
