use tracing::{error, warn};

/// Background paths log failures and keep going instead of unwinding; this
/// turns a `Result` into an `Option` while emitting the error.
pub trait HandleErr
where
    Self: Sized,
{
    type OkValue;

    fn log_err(self) -> Option<Self::OkValue>;

    fn log_err_with_msg(self, msg: &str) -> Option<Self::OkValue>;

    fn log_warn(self) -> Option<Self::OkValue>;

    fn log_warn_with_msg(self, msg: &str) -> Option<Self::OkValue>;
}

impl<T, E> HandleErr for Result<T, E>
where
    E: std::fmt::Debug,
{
    type OkValue = T;

    fn log_err(self) -> Option<Self::OkValue> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                error!("{e:?}");
                None
            }
        }
    }

    fn log_err_with_msg(self, msg: &str) -> Option<Self::OkValue> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                error!("{msg}: {e:?}");
                None
            }
        }
    }

    fn log_warn(self) -> Option<Self::OkValue> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{e:?}");
                None
            }
        }
    }

    fn log_warn_with_msg(self, msg: &str) -> Option<Self::OkValue> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{msg}: {e:?}");
                None
            }
        }
    }
}
