//! Mapping raw failures onto the [`ErrorInfo`] taxonomy.

use std::any::Any;
use std::error::Error as StdError;
use std::io;

use crate::error::{ErrorInfo, ErrorKind, TaskError, TaskFailure};

/// Maps an error returned by task logic to an [`ErrorKind`].
///
/// Implemented for any `Fn(&(dyn Error + 'static)) -> ErrorKind`, so a closure
/// can be passed wherever a classifier is expected.
pub trait ErrorClassifier: Send + Sync + 'static {
    fn classify(&self, err: &(dyn StdError + 'static)) -> ErrorKind;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&(dyn StdError + 'static)) -> ErrorKind + Send + Sync + 'static,
{
    fn classify(&self, err: &(dyn StdError + 'static)) -> ErrorKind {
        self(err)
    }
}

/// Recognizes [`TaskFailure`], [`ErrorInfo`] and `std::io::Error`, anywhere in
/// the source chain. Anything else is unclassified.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, err: &(dyn StdError + 'static)) -> ErrorKind {
        let mut current = Some(err);
        while let Some(err) = current {
            if let Some(failure) = err.downcast_ref::<TaskFailure>() {
                return failure.kind();
            }
            if let Some(info) = err.downcast_ref::<ErrorInfo>() {
                return info.kind();
            }
            if let Some(io_err) = err.downcast_ref::<io::Error>()
                && let Some(kind) = classify_io(io_err.kind())
            {
                return kind;
            }
            current = err.source();
        }
        ErrorKind::Unclassified
    }
}

fn classify_io(kind: io::ErrorKind) -> Option<ErrorKind> {
    match kind {
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Some(ErrorKind::Validation),
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::PermissionDenied => Some(ErrorKind::Resource),
        io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
        _ => None,
    }
}

/// Convert an error returned by task logic into an [`ErrorInfo`].
pub(crate) fn classify_error(classifier: &dyn ErrorClassifier, err: &TaskError) -> ErrorInfo {
    let err_ref: &(dyn StdError + 'static) = err.as_ref();
    let kind = classifier.classify(err_ref);
    if let Some(info) = err.downcast_ref::<ErrorInfo>()
        && info.kind() == kind
    {
        return info.clone();
    }
    ErrorInfo::from_kind(kind, err.to_string())
}

/// Convert a caught panic payload into an `Unclassified` [`ErrorInfo`].
///
/// Payloads exposing an error description are described by it; primitive
/// payloads are stringified.
pub(crate) fn classify_panic(payload: Box<dyn Any + Send>, trace: Option<String>) -> ErrorInfo {
    ErrorInfo::unclassified(describe_panic(payload.as_ref()), trace)
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    if let Some(err) = payload.downcast_ref::<TaskError>() {
        return err.to_string();
    }
    if let Some(err) = payload.downcast_ref::<ErrorInfo>() {
        return err.to_string();
    }
    if let Some(err) = payload.downcast_ref::<TaskFailure>() {
        return err.to_string();
    }
    if let Some(err) = payload.downcast_ref::<io::Error>() {
        return err.to_string();
    }

    macro_rules! stringify_primitive {
        ($($ty:ty),*) => {
            $(
                if let Some(v) = payload.downcast_ref::<$ty>() {
                    return v.to_string();
                }
            )*
        };
    }
    stringify_primitive!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char);

    "<non-displayable panic payload>".to_string()
}
