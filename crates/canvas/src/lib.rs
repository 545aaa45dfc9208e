#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Offscreen-canvas control protocol: id-correlated commands and
//! responses over a single rendering worker, with an inline fallback
//! path for environments without off-main-thread canvas support.

mod backend;
mod command;
mod manager;

pub use backend::CanvasBackend;
pub use command::{
    CanvasCommand, CanvasCommandKind, CanvasError, CanvasEvent, CanvasResponse, CanvasWorkerMessage,
    ContextType, SurfaceSize,
};
pub use manager::{CanvasManager, CanvasPort};
