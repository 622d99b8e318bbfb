#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use romulus_core as core;
pub use romulus_engine as engine;
pub use romulus_k8s_api as k8s;
pub use romulus_k8s_index as index;
pub use romulus_vulcan as vulcan;

mod args;

pub use self::args::Args;
