mod anyhow;
mod cancel;
mod constants;
mod named_progress;
mod rng;
mod util;

pub mod cancelable_thread;

pub use self::anyhow::Anyhow;
pub use self::cancel::CancelToken;
pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::rng::Rng;
pub use self::util::{init_logging_with_progress, make_progress};
