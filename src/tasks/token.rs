use std::marker::PhantomData;

/// Capability proving the holder runs on the thread that owns the graphics context
///
/// The token is neither `Send` nor `Sync`, so it cannot leave the thread that
/// created it. Upload tasks and draw calls take it by reference; code running
/// on the background worker has no way to obtain one.
#[derive(Debug)]
pub struct RenderContextToken {
    _not_send: PhantomData<*const ()>,
}

impl RenderContextToken {
    /// Create the token. Call this once, on the thread that created the GPU device.
    pub fn new() -> Self {
        Self { _not_send: PhantomData }
    }
}

impl Default for RenderContextToken {
    fn default() -> Self {
        Self::new()
    }
}
