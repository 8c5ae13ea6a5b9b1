//! Chunked write protocol shared by the transport sessions.
//!
//! BLE attribute writes carry at most [`BLE_FRAME_SIZE`] bytes, so larger
//! buffers are sliced into frames delivered strictly in order: a frame is
//! sent only after the previous one succeeded, the first failure aborts the
//! remainder, and the whole operation succeeds only once the final frame is
//! flushed. Partial completion is never reported as success.

use std::future::Future;

use crate::error::Result;

/// Maximum payload per BLE attribute write.
pub const BLE_FRAME_SIZE: usize = 20;

/// Split `payload` into frames of at most `frame_size` bytes and deliver
/// them serially through `send_frame`.
///
/// Issues `ceil(len / frame_size)` frames; an empty payload issues none and
/// succeeds immediately.
///
/// # Panics
///
/// Panics if `frame_size` is zero.
pub async fn write_framed<F, Fut>(payload: &[u8], frame_size: usize, mut send_frame: F) -> Result<()>
where
    F: FnMut(Vec<u8>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    assert!(frame_size > 0, "frame size must be non-zero");

    for frame in payload.chunks(frame_size) {
        send_frame(frame.to_vec()).await?;
    }
    Ok(())
}
