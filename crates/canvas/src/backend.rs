//! The synchronous rendering surface behind the fallback path.

use serde_json::Value;

/// A main-thread 2D rendering surface.
///
/// When the runtime cannot transfer surface control to a worker, the
/// manager executes every command inline against one of these, keeping
/// the command and response shapes identical to the offscreen path.
pub trait CanvasBackend: Send {
    /// Creates the context.
    fn init(
        &mut self,
        width: u32,
        height: u32,
        device_pixel_ratio: f64,
        attrs: Option<&Value>,
    ) -> Result<(), String>;

    /// Resizes the surface.
    fn resize(&mut self, width: u32, height: u32, device_pixel_ratio: f64) -> Result<(), String>;

    /// Clears the surface.
    fn clear(&mut self) -> Result<(), String>;

    /// Renders one frame; may return a result payload.
    fn render(&mut self, params: &Value) -> Result<Option<Value>, String>;

    /// Releases resources.
    fn dispose(&mut self) -> Result<(), String>;

    /// Application-specific command.
    fn custom(&mut self, name: &str, params: &Value) -> Result<Option<Value>, String>;
}
