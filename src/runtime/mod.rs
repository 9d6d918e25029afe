//! Runtime model for Quicktier
//!
//! Values, shaped objects and the generic semantics of every operation.

mod object;
pub mod ops;
mod value;

pub use object::{ArrayRef, ElementKind, JsArray, JsObject, ObjectRef, ShapeId, ShapeTable};
pub use value::{f64_to_int32, Value};

use crate::error::{Error, ErrorKind};

/// Abrupt completion of an operation or call
#[derive(Debug)]
pub enum Abrupt {
    /// A language-level exception carrying the thrown value
    Throw(Value),
    /// An engine failure that no handler may catch
    Fatal(Error),
}

/// Result of running user code
pub type Completion<T> = std::result::Result<T, Abrupt>;

impl Abrupt {
    /// Throw an error object of the given kind
    pub fn error(kind: ErrorKind, message: impl AsRef<str>) -> Self {
        Abrupt::Throw(Value::string(&format!("{}: {}", kind, message.as_ref())))
    }

    pub fn type_error(message: impl AsRef<str>) -> Self {
        Self::error(ErrorKind::TypeError, message)
    }

    pub fn range_error(message: impl AsRef<str>) -> Self {
        Self::error(ErrorKind::RangeError, message)
    }

    /// Convert to an engine error at the outermost frame
    pub fn into_error(self) -> Error {
        match self {
            Abrupt::Throw(value) => Error::Uncaught {
                message: value.to_js_string(),
            },
            Abrupt::Fatal(err) => err,
        }
    }
}

impl From<Error> for Abrupt {
    fn from(err: Error) -> Self {
        Abrupt::Fatal(err)
    }
}
