//! The unified error handling system for the application.

pub use types::PipError;

/// A unified `Result` type for the entire application.
///
/// Construction, configuration and I/O paths return this type. The session
/// coordinator and the rate limiter resolve to outcome values instead.
pub type Result<T> = std::result::Result<T, PipError>;

pub mod macros;
pub mod types;

/// Context Trait for adding context to errors.
pub trait Context<T, E> {
    /// Wrap the error with a fixed context message.
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display;

    /// Wrap the error with a lazily built context message.
    #[track_caller]
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<PipError>,
{
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: std::fmt::Display,
    {
        self.with_context(|| context)
    }

    #[track_caller]
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display,
    {
        match self {
            Ok(value) => Ok(value),
            Err(error) => Err(PipError::Context {
                context: context().to_string(),
                source: Box::new(error.into()),
            }),
        }
    }
}

#[cfg(test)]
mod tests;
