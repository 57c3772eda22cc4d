pub use self::logger::{KernelLogger, init};

pub mod logger;
