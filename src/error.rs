use crate::store::StoreError;

use std::any::Any;

/// Trait for errors that may be returned by the reconciler or by a `ConvergenceDelegate`. This just sets up the
/// trait bounds that are required, since we'll typically only pass around rather opaque boxed
/// error types, and they will need to be sent between tasks.
pub trait OperatorError: std::error::Error + Send + 'static + Any {
    fn as_any(&self) -> &dyn Any;
}
impl<T> OperatorError for T
where
    T: std::error::Error + Send + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type Error = Box<dyn OperatorError>;

impl dyn OperatorError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: OperatorError>(&self) -> Option<&T> {
        let as_any = self.as_any();
        as_any.downcast_ref::<T>()
    }

    /// convenience function for checking whether the error is of the given concrete type.
    /// If `is_type::<MyType>()` returns true, then calling `as_type::<MyType>()` will return
    /// `Some`.
    pub fn is_type<T: OperatorError>(&self) -> bool {
        let as_any = self.as_any();
        as_any.is::<T>()
    }
}

impl<T> From<T> for Error
where
    T: OperatorError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}

/// The three ways that a failed store operation is treated by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The object does not exist. Nothing left to do for this pass.
    NotFound,
    /// A write was rejected because of a stale resourceVersion. Converted into a requeue.
    Conflict,
    /// Anything else, which is handed back to the dispatcher for a backoff retry.
    Other,
}

/// Classifies an error by looking for a `StoreError`, either as the error itself or anywhere
/// in its chain of sources. Errors that don't carry a `StoreError` at all are always `Other`.
pub fn classify(err: &Error) -> ErrorClass {
    find_store_error(&**err)
        .map(StoreError::class)
        .unwrap_or(ErrorClass::Other)
}

pub fn is_conflict(err: &Error) -> bool {
    classify(err) == ErrorClass::Conflict
}

pub fn is_not_found(err: &Error) -> bool {
    classify(err) == ErrorClass::NotFound
}

fn find_store_error(err: &dyn OperatorError) -> Option<&StoreError> {
    if let Some(store_err) = err.as_type::<StoreError>() {
        return Some(store_err);
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(store_err) = cause.downcast_ref::<StoreError>() {
            return Some(store_err);
        }
        source = cause.source();
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::ObjectId;

    use std::fmt::{self, Display};

    #[derive(Debug)]
    struct Wrapper(StoreError);

    impl Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "wrapped: {}", self.0)
        }
    }

    impl std::error::Error for Wrapper {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[derive(Debug)]
    struct Unrelated;

    impl Display for Unrelated {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("unrelated")
        }
    }
    impl std::error::Error for Unrelated {}

    fn id() -> ObjectId {
        ObjectId::new("ns".to_owned(), "gw".to_owned())
    }

    #[test]
    fn store_errors_are_classified_directly() {
        let conflict: Error = StoreError::Conflict(id(), "stale".to_owned()).into();
        let not_found: Error = StoreError::NotFound(id()).into();
        assert_eq!(ErrorClass::Conflict, classify(&conflict));
        assert!(is_conflict(&conflict));
        assert_eq!(ErrorClass::NotFound, classify(&not_found));
        assert!(is_not_found(&not_found));
    }

    #[test]
    fn store_errors_are_found_in_the_source_chain() {
        let err: Error = Wrapper(StoreError::Conflict(id(), "stale".to_owned())).into();
        assert!(is_conflict(&err));
    }

    #[test]
    fn other_errors_are_classified_as_other() {
        let err: Error = Unrelated.into();
        assert_eq!(ErrorClass::Other, classify(&err));
        assert!(err.is_type::<Unrelated>());
    }
}
