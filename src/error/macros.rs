//! # 错误处理宏

/// Build a [`PipError`](crate::error::PipError) of the given kind.
///
/// `error!(Kind, "fmt {}", arg)`, or `error!(Kind, "message", source = err)`
/// to keep the underlying error as the source.
#[macro_export]
macro_rules! error {
    (Config, $msg:literal, source = $source:expr) => {
        $crate::error::PipError::config_with_source($msg, $source)
    };
    (Storage, $msg:literal, source = $source:expr) => {
        $crate::error::PipError::storage_with_source($msg, $source)
    };
    (Network, $msg:literal, source = $source:expr) => {
        $crate::error::PipError::network_with_source($msg, $source)
    };
    (Cache, $msg:literal, source = $source:expr) => {
        $crate::error::PipError::cache_with_source($msg, $source)
    };
    (Internal, $msg:literal, source = $source:expr) => {
        $crate::error::PipError::internal_with_source($msg, $source)
    };
    (Config, $($arg:tt)+) => {
        $crate::error::PipError::config(format!($($arg)+))
    };
    (Storage, $($arg:tt)+) => {
        $crate::error::PipError::storage(format!($($arg)+))
    };
    (Network, $($arg:tt)+) => {
        $crate::error::PipError::network(format!($($arg)+))
    };
    (Auth, $($arg:tt)+) => {
        $crate::error::PipError::auth(format!($($arg)+))
    };
    (Cache, $($arg:tt)+) => {
        $crate::error::PipError::cache(format!($($arg)+))
    };
    (Internal, $($arg:tt)+) => {
        $crate::error::PipError::internal(format!($($arg)+))
    };
}

/// 确保条件成立，否则返回配置错误
#[macro_export]
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::error!(Config, $($arg)+));
        }
    };
}
