use std::num::{ParseFloatError, ParseIntError};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Record is missing an essential field {field}")]
    MissingField { field: String },

    #[error("Field {field} has an invalid numeric value: {source}")]
    InvalidNumber {
        field: String,
        #[source]
        source: ParseIntError,
    },

    #[error("Field {field} has an invalid decimal value: {source}")]
    InvalidDecimal {
        field: String,
        #[source]
        source: ParseFloatError,
    },

    #[error("Unknown file extension: {message}")]
    UnknownExtension { message: String },
}
