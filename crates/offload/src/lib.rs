//! Master/worker task offload.
//!
//! A master context dispatches named operations to a pool of worker
//! contexts (OS processes or threads) and awaits their results. The same
//! program text declares operations and issues calls in both contexts; the
//! [`Role`] detected at startup decides what each step actually does.
//!
//! ```no_run
//! use offload::{args, Args, Invocation, Module, Offload, OffloadConfig};
//!
//! fn declare(module: &mut Module<'_>) {
//!     module.operation("add", |args: &mut Args| {
//!         let a: i64 = args.next()?;
//!         let b: i64 = args.next()?;
//!         Invocation::value(a + b)
//!     });
//! }
//!
//! # async fn demo() -> Result<(), offload::OffloadError> {
//! let offload = Offload::create(OffloadConfig::from_env()?)?;
//! offload.register("math", declare);
//! if offload.lock().await? {
//!     let sum = offload.run("add", args![2, 3]).await?;
//!     assert_eq!(sum, 5);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod cycling;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod message;
pub mod offload;
pub mod pool;
pub mod registry;
pub mod role;
pub mod transport;
pub mod worker;

pub use config::{load_dotenv, Backend, OffloadConfig};
pub use cycling::CyclingStrategy;
pub use dispatch::{Dispatcher, RunHandle};
pub use error::{OffloadError, OperationError, RemoteError, RemoteErrorKind};
pub use message::CorrelationId;
pub use offload::Offload;
pub use registry::{Args, FunctionRegistry, Invocation, Module, Operation, Source};
pub use role::Role;

#[doc(hidden)]
pub use serde_json;

/// Build a call's argument list from serializable expressions.
///
/// `args![["Mihai"], 2, "x"]` is `vec![json!(["Mihai"]), json!(2), json!("x")]`.
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::serde_json::Value>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::serde_json::json!($arg)),+]
    };
}
